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

//! The DDL pipeline: a dedicated puller over the meta span, a global
//! ordering step, and the schema-storage advance. Jobs apply in commit
//! order; an application failure is fatal to the changefeed.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use rivulet_common::event::{DdlEvent, DdlJob, OpType, PipelineEvent, RawKv, ResolvedTs, RowEvent};
use rivulet_common::span::KeySpan;
use rivulet_connector::puller::Puller;
use rivulet_connector::sorter::{EntrySorter, EventSorter};

use crate::error::Result;
use crate::processor::ProcessorCore;

const DDL_CHANNEL_SIZE: usize = 1024;

pub(crate) fn spawn_ddl_pipeline(core: &Arc<ProcessorCore>) {
    // DDL traffic is tiny; ordering always runs in memory regardless of the
    // configured table sort engine
    let (sorter_tx, sorter_rx) = mpsc::channel(DDL_CHANNEL_SIZE);
    let (sorted_tx, sorted_rx) = mpsc::channel(DDL_CHANNEL_SIZE);
    let sorter = Box::new(EntrySorter::new(sorter_rx, sorted_tx));

    let start_ts = core.position.lock().checkpoint_ts;
    let (puller, puller_rx) = Puller::new(
        core.source.clone(),
        vec![KeySpan::ddl_span()],
        start_ts,
        DDL_CHANNEL_SIZE,
    );

    let shutdown = core.shutdown.clone();
    core.spawn_task("ddl-puller", async move {
        puller.run(shutdown).await?;
        Ok(())
    });
    let shutdown = core.shutdown.clone();
    core.spawn_task("ddl-sorter", async move {
        sorter.run(shutdown).await?;
        Ok(())
    });
    core.spawn_task(
        "ddl-puller-consume",
        ddl_puller_consume(core.clone(), puller_rx, sorter_tx),
    );
    core.spawn_task("ddl-pull-worker", ddl_pull_worker(core.clone(), sorted_rx));
}

async fn ddl_puller_consume(
    core: Arc<ProcessorCore>,
    mut puller_rx: mpsc::Receiver<RawKv>,
    sorter_tx: mpsc::Sender<PipelineEvent>,
) -> Result<()> {
    loop {
        let raw = tokio::select! {
            _ = core.shutdown.cancelled() => return Ok(()),
            raw = puller_rx.recv() => match raw {
                None => return Ok(()),
                Some(raw) => raw,
            },
        };
        let event = match raw.op_type {
            OpType::Resolved => PipelineEvent::Resolved(ResolvedTs::span_level(raw.commit_ts)),
            OpType::Put | OpType::Delete => {
                core.limiter.acquire(raw.size()).await;
                PipelineEvent::Row(RowEvent::new(0, raw))
            }
        };
        if sorter_tx.send(event).await.is_err() {
            return Ok(());
        }
    }
}

async fn ddl_pull_worker(
    core: Arc<ProcessorCore>,
    mut sorted_rx: mpsc::Receiver<PipelineEvent>,
) -> Result<()> {
    loop {
        let event = tokio::select! {
            _ = core.shutdown.cancelled() => return Ok(()),
            event = sorted_rx.recv() => match event {
                None => return Ok(()),
                Some(event) => event,
            },
        };
        match event {
            PipelineEvent::Row(ev) => {
                core.limiter.release(ev.raw.size());
                if ev.raw.op_type != OpType::Put {
                    continue;
                }
                // the meta span carries more than jobs; only job payloads
                // decode
                let Ok(job) = serde_json::from_slice::<DdlJob>(&ev.raw.value) else {
                    debug!(commit_ts = ev.commit_ts, "non-job meta entry skipped");
                    continue;
                };
                core.schema_storage.handle_ddl_job(&DdlEvent {
                    commit_ts: ev.commit_ts,
                    job,
                })?;
            }
            PipelineEvent::Resolved(resolved) => {
                core.schema_storage.advance_resolved_ts(resolved.ts);
                core.watermark_notifier.notify();
            }
            PipelineEvent::Ddl(_) => {}
        }
    }
}
