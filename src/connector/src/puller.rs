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

//! Puller: subscribes a set of key spans on the upstream source and
//! forwards raw entries downstream, collapsing per-region resolved entries
//! into a span-level watermark through a [`Frontier`].

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use rivulet_common::event::{OpType, RawKv};
use rivulet_common::span::KeySpan;
use rivulet_common::types::{RegionId, Ts};

use crate::error::Result;
use crate::source::EventSource;

/// Tracks per-region resolved timestamps and reports the span-level
/// watermark: the minimum over all regions seen so far, released only when
/// it advances.
pub struct Frontier {
    regions: HashMap<RegionId, Ts>,
    resolved: Ts,
}

impl Frontier {
    pub fn new(start_ts: Ts) -> Self {
        Self {
            regions: HashMap::new(),
            resolved: start_ts,
        }
    }

    /// Record a region watermark; returns the new span-level watermark when
    /// the minimum advanced.
    pub fn update(&mut self, region_id: RegionId, ts: Ts) -> Option<Ts> {
        let slot = self.regions.entry(region_id).or_insert(ts);
        *slot = (*slot).max(ts);
        let min = *self.regions.values().min().expect("at least one region");
        if min > self.resolved {
            self.resolved = min;
            Some(min)
        } else {
            None
        }
    }

    pub fn resolved(&self) -> Ts {
        self.resolved
    }
}

pub struct Puller {
    source: Arc<dyn EventSource>,
    spans: Vec<KeySpan>,
    start_ts: Ts,
    tx: mpsc::Sender<RawKv>,
}

impl Puller {
    pub fn new(
        source: Arc<dyn EventSource>,
        spans: Vec<KeySpan>,
        start_ts: Ts,
        buffer: usize,
    ) -> (Self, mpsc::Receiver<RawKv>) {
        let (tx, rx) = mpsc::channel(buffer);
        (
            Self {
                source,
                spans,
                start_ts,
                tx,
            },
            rx,
        )
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let mut stream = self.source.open(self.spans.clone(), self.start_ts).await?;
        let mut frontier = Frontier::new(self.start_ts);
        loop {
            let raw = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                raw = stream.next() => match raw {
                    // subscription torn down upstream
                    None => return Ok(()),
                    Some(raw) => raw?,
                },
            };
            let forward = match raw.op_type {
                OpType::Resolved => match frontier.update(raw.region_id, raw.commit_ts) {
                    Some(resolved) => {
                        debug!(resolved, "span watermark advanced");
                        RawKv::resolved(resolved, 0, raw.key)
                    }
                    None => continue,
                },
                OpType::Put | OpType::Delete => raw,
            };
            if self.tx.send(forward).await.is_err() {
                // consumer side torn down
                return Ok(());
            }
        }
    }
}
