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

//! The serialization point: drains the single output queue fed by every
//! table chain, batches row events into sink emissions, and publishes the
//! sink-emitted watermark on every resolved event.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::warn;

use rivulet_common::event::{PipelineEvent, RowEvent};
use rivulet_common::types::Ts;
use rivulet_connector::sink::Sink;

use crate::error::{ProcessorError, Result};
use crate::processor::ProcessorCore;

const EMIT_BATCH_SIZE: usize = 1024;

pub(crate) async fn run_output_merger(core: Arc<ProcessorCore>) -> Result<()> {
    let mut output_rx = core
        .output_rx
        .lock()
        .take()
        .expect("output merger started twice");

    // the watermark below which everything has been handed to the sink;
    // starts unknown
    let mut resolved_ts: Ts = 0;
    let mut pending: Vec<Arc<RowEvent>> = Vec::new();

    loop {
        let event = tokio::select! {
            _ = core.shutdown.cancelled() => return Ok(()),
            event = output_rx.recv() => match event {
                None => return Ok(()),
                Some(event) => event,
            },
        };
        match event {
            PipelineEvent::Row(ev) => {
                // a freshly added table may legitimately have lowered the
                // local watermark below what we last published: clamp first,
                // assert second
                resolved_ts = resolved_ts.min(core.local_resolved_ts.load(Ordering::Acquire));
                if ev.commit_ts <= resolved_ts {
                    return Err(ProcessorError::InvariantViolation {
                        commit_ts: ev.commit_ts,
                        resolved_ts,
                    });
                }
                pending.push(ev);
                if pending.len() >= EMIT_BATCH_SIZE {
                    emit_batch(&core, &mut pending).await?;
                }
            }
            PipelineEvent::Resolved(resolved) => {
                emit_batch(&core, &mut pending).await?;
                resolved_ts = resolved.ts;
                core.sink_emitted_resolved_ts
                    .fetch_max(resolved.ts, Ordering::AcqRel);
                core.sink_emitted_notifier.notify();
            }
            PipelineEvent::Ddl(ev) => {
                // DDL replication to the sink is handled by the owner; the
                // processor only orders them for its schema storage
                warn!(commit_ts = ev.commit_ts, "unexpected ddl event in output queue");
            }
        }
    }
}

/// Await preparation of every pending event in emission order, drop the
/// undecodable ones, and append the rest to the sink atomically.
async fn emit_batch(core: &ProcessorCore, pending: &mut Vec<Arc<RowEvent>>) -> Result<()> {
    let mut rows = Vec::with_capacity(pending.len());
    for ev in pending.drain(..) {
        match ev.wait_prepared().await {
            Some(row) => rows.push(row.clone()),
            None => core.metrics.skipped_rows.inc(),
        }
    }
    let emitted = rows.len() as u64;
    core.sink.emit_rows(rows).await?;
    core.metrics.emitted_rows.inc_by(emitted);
    Ok(())
}
