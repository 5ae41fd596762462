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

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use rivulet_common::event::{PipelineEvent, RowEvent};

use super::{cmp_events, EventSorter};
use crate::error::Result;

/// The in-memory sort engine.
///
/// Events buffer unsorted until a watermark arrives; the batch is then
/// sorted, merged with the carried-over run from earlier watermarks, and
/// everything at or below the watermark is released, followed by the
/// watermark itself.
pub struct EntrySorter {
    input: mpsc::Receiver<PipelineEvent>,
    output: mpsc::Sender<PipelineEvent>,
    unsorted: Vec<Arc<RowEvent>>,
    /// Sorted events above the last watermark, carried to the next one.
    sorted: Vec<Arc<RowEvent>>,
}

impl EntrySorter {
    pub fn new(input: mpsc::Receiver<PipelineEvent>, output: mpsc::Sender<PipelineEvent>) -> Self {
        Self {
            input,
            output,
            unsorted: Vec::new(),
            sorted: Vec::new(),
        }
    }
}

#[async_trait]
impl EventSorter for EntrySorter {
    async fn run(mut self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                event = self.input.recv() => match event {
                    None => return Ok(()),
                    Some(event) => event,
                },
            };
            match event {
                PipelineEvent::Row(ev) => self.unsorted.push(ev),
                PipelineEvent::Resolved(resolved) => {
                    self.unsorted.sort_by(cmp_events);
                    let batch = std::mem::take(&mut self.unsorted);
                    let carry = std::mem::take(&mut self.sorted);
                    let merged = merge_sorted(carry, batch);

                    let split = merged.partition_point(|ev| ev.commit_ts <= resolved.ts);
                    let mut released = merged;
                    self.sorted = released.split_off(split);
                    for ev in released {
                        if self.output.send(PipelineEvent::Row(ev)).await.is_err() {
                            return Ok(());
                        }
                    }
                    if self
                        .output
                        .send(PipelineEvent::Resolved(resolved))
                        .await
                        .is_err()
                    {
                        return Ok(());
                    }
                }
                // DDL events are decoded downstream of the sorter; anything
                // else passes through untouched
                other => {
                    if self.output.send(other).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

pub(super) fn merge_sorted(
    a: Vec<Arc<RowEvent>>,
    b: Vec<Arc<RowEvent>>,
) -> Vec<Arc<RowEvent>> {
    if a.is_empty() {
        return b;
    }
    if b.is_empty() {
        return a;
    }
    let mut merged = Vec::with_capacity(a.len() + b.len());
    let mut a = a.into_iter().peekable();
    let mut b = b.into_iter().peekable();
    loop {
        match (a.peek(), b.peek()) {
            (Some(x), Some(y)) => {
                if cmp_events(x, y).is_le() {
                    merged.push(a.next().unwrap());
                } else {
                    merged.push(b.next().unwrap());
                }
            }
            (Some(_), None) => {
                merged.extend(a);
                break;
            }
            (None, _) => {
                merged.extend(b);
                break;
            }
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::super::test_utils::*;
    use super::super::SorterBuild;
    use super::*;

    fn build_entry_sorter() -> SorterBuild {
        let (input_tx, input_rx) = mpsc::channel(1024);
        let (output_tx, output_rx) = mpsc::channel(1024);
        SorterBuild {
            sorter: Box::new(EntrySorter::new(input_rx, output_tx)),
            input: input_tx,
            output: output_rx,
        }
    }

    #[tokio::test]
    async fn test_sorts_within_watermark() {
        let out = run_sorter(
            build_entry_sorter(),
            vec![
                row_event(1, 3, 30),
                row_event(1, 1, 10),
                row_event(1, 2, 20),
                resolved_event(25),
            ],
        )
        .await;
        assert_eq!(
            commit_ts_sequence(&out),
            vec![(false, 10), (false, 20), (true, 25)]
        );
    }

    #[tokio::test]
    async fn test_carry_released_by_later_watermark() {
        let out = run_sorter(
            build_entry_sorter(),
            vec![
                row_event(1, 3, 30),
                row_event(1, 1, 10),
                resolved_event(25),
                row_event(1, 4, 40),
                resolved_event(45),
            ],
        )
        .await;
        assert_eq!(
            commit_ts_sequence(&out),
            vec![(false, 10), (true, 25), (false, 30), (false, 40), (true, 45)]
        );
    }

    #[tokio::test]
    async fn test_watermark_only_input() {
        let out = run_sorter(build_entry_sorter(), vec![resolved_event(5), resolved_event(9)]).await;
        assert_eq!(commit_ts_sequence(&out), vec![(true, 5), (true, 9)]);
    }
}
