// Copyright 2024 RisingWave Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The rectifier gates a sorter's output against the changefeed target ts
//! and carries the table's stop protocol.
//!
//! State machine: `Running → Stopping` on a safe-stop request; `Stopping →
//! Stopped` once the gate emits its terminal watermark; `Running → Finished`
//! when the sorter's watermark crosses the target ts. Terminal states are
//! absorbing.

use std::sync::Arc;

use rivulet_common::event::{PipelineEvent, RowEvent};
use rivulet_common::types::Ts;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RectifierStatus {
    Running,
    Stopping,
    Stopped,
    Finished,
}

impl RectifierStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RectifierStatus::Stopped | RectifierStatus::Finished)
    }
}

/// What the gate decided for one incoming event.
#[derive(Debug)]
pub enum Rectified {
    Discard,
    Row(Arc<RowEvent>),
    Resolved(Ts),
}

pub struct Rectifier {
    status: RectifierStatus,
    target_ts: Ts,
    /// Largest watermark this gate has emitted.
    max_resolved_ts: Ts,
}

impl Rectifier {
    pub fn new(target_ts: Ts) -> Self {
        Self {
            status: RectifierStatus::Running,
            target_ts,
            max_resolved_ts: 0,
        }
    }

    pub fn status(&self) -> RectifierStatus {
        self.status
    }

    pub fn max_resolved_ts(&self) -> Ts {
        self.max_resolved_ts
    }

    /// Request a stop. The terminal watermark is emitted by the next
    /// [`Rectifier::handle`] or [`Rectifier::poll_stop`] call.
    pub fn safe_stop(&mut self) {
        if self.status == RectifierStatus::Running {
            self.status = RectifierStatus::Stopping;
        }
    }

    /// Finalize a pending stop without traffic. Returns the terminal
    /// watermark on the `Stopping → Stopped` transition.
    pub fn poll_stop(&mut self) -> Option<Ts> {
        if self.status != RectifierStatus::Stopping {
            return None;
        }
        let terminal = self.target_ts.min(self.max_resolved_ts);
        self.max_resolved_ts = terminal;
        self.status = RectifierStatus::Stopped;
        Some(terminal)
    }

    pub fn handle(&mut self, event: PipelineEvent) -> Rectified {
        if self.status.is_terminal() {
            return Rectified::Discard;
        }
        if let Some(terminal) = self.poll_stop() {
            // the event that found the gate stopping is swallowed; nothing
            // at or below the terminal watermark can be among it
            return Rectified::Resolved(terminal);
        }
        match event {
            PipelineEvent::Row(ev) => {
                if ev.commit_ts > self.target_ts {
                    Rectified::Discard
                } else {
                    Rectified::Row(ev)
                }
            }
            PipelineEvent::Resolved(resolved) => {
                if resolved.ts >= self.target_ts {
                    self.status = RectifierStatus::Finished;
                    self.max_resolved_ts = self.target_ts;
                    Rectified::Resolved(self.target_ts)
                } else {
                    self.max_resolved_ts = self.max_resolved_ts.max(resolved.ts);
                    Rectified::Resolved(resolved.ts)
                }
            }
            PipelineEvent::Ddl(_) => Rectified::Discard,
        }
    }
}
