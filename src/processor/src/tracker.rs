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

//! Fan-in of per-table watermarks into the local resolved ts.
//!
//! Tables do not hold a reference to this tracker; they bump their own
//! atomics and poke the watermark notifier, and the tracker re-resolves the
//! table set under the state lock on each debounced tick.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use rivulet_common::event::{PipelineEvent, ResolvedTs};
use rivulet_common::types::Ts;

use crate::error::Result;
use crate::processor::ProcessorCore;

const WATERMARK_DEBOUNCE: Duration = Duration::from_millis(50);

pub(crate) async fn run_resolved_tracker(core: Arc<ProcessorCore>) -> Result<()> {
    let Some(mut ticks) = core.watermark_notifier.receiver(WATERMARK_DEBOUNCE) else {
        return Ok(());
    };
    loop {
        tokio::select! {
            _ = core.shutdown.cancelled() => return Ok(()),
            tick = ticks.tick() => {
                if tick.is_none() {
                    return Ok(());
                }
            }
        }

        let min_resolved = compute_local_resolved(&core);
        let previous = core.local_resolved_ts.load(Ordering::Acquire);
        if min_resolved <= previous {
            continue;
        }
        core.local_resolved_ts.store(min_resolved, Ordering::Release);
        core.metrics.resolved_ts.set(min_resolved as i64);
        debug!(resolved_ts = min_resolved, "local resolved ts advanced");

        // wakes the fanout, the position worker and the op-done watchers
        core.local_resolved_notifier.notify();
    }
}

/// Fans the local resolved ts into the output queue as a watermark event,
/// paced at one tick per second. The merger publishes it to the sink driver
/// after draining everything emitted before it.
pub(crate) async fn run_resolved_fanout(core: Arc<ProcessorCore>) -> Result<()> {
    let Some(mut ticks) = core
        .local_resolved_notifier
        .receiver(Duration::from_secs(1))
    else {
        return Ok(());
    };
    loop {
        tokio::select! {
            _ = core.shutdown.cancelled() => return Ok(()),
            tick = ticks.tick() => {
                if tick.is_none() {
                    return Ok(());
                }
            }
        }
        let resolved = core.local_resolved_ts.load(Ordering::Acquire);
        if resolved == 0 {
            continue;
        }
        let event = PipelineEvent::Resolved(ResolvedTs::span_level(resolved));
        if core.output_tx.send(event).await.is_err() {
            return Ok(());
        }
    }
}

/// `min(ddl resolved ts, min over owned non-dying tables of their effective
/// resolved ts)`.
fn compute_local_resolved(core: &ProcessorCore) -> Ts {
    let mut min_resolved = core.schema_storage.resolved_ts();
    let state = core.state.lock();
    for table in state.tables.values() {
        if table.is_dying() {
            continue;
        }
        min_resolved = min_resolved.min(table.effective_resolved_ts());
    }
    min_resolved
}
