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

//! Per-table pipeline: puller → sorter → rectifier, feeding the shared
//! mounter and output queue.
//!
//! Each chain runs as four tasks under the table's own cancel token, so
//! removing one table never disturbs its siblings. In cyclic mode the mark
//! table runs a second chain under the same token; its rows are suppressed
//! and only its watermark participates, through the table's effective
//! resolved ts.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use rivulet_common::event::{OpType, PipelineEvent, RawKv, ResolvedTs, RowEvent};
use rivulet_common::span::KeySpan;
use rivulet_common::types::{TableId, TableName, Ts};
use rivulet_connector::puller::Puller;
use rivulet_connector::sorter::{self, EventSorter, SorterOptions};
use rivulet_coordination::model::ReplicaInfo;

use crate::error::Result;
use crate::processor::ProcessorCore;
use crate::rectifier::{Rectified, Rectifier};

/// Capacity of the channels inside one table chain. The shared output queue
/// is sized separately through the processor config.
const CHAIN_CHANNEL_SIZE: usize = 4096;

/// Which chain of a table pipeline a task belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChainKind {
    User,
    Mark,
}

pub(crate) struct TableInfo {
    pub id: TableId,
    pub name: Option<TableName>,
    pub start_ts: Ts,
    pub mark_table_id: TableId,
    resolved_ts: AtomicU64,
    mark_resolved_ts: AtomicU64,
    is_dying: AtomicBool,
    pub cancel: CancellationToken,
    pub rectifier: Arc<Mutex<Rectifier>>,
}

impl TableInfo {
    pub fn resolved_ts(&self) -> Ts {
        self.resolved_ts.load(Ordering::Acquire)
    }

    pub fn mark_resolved_ts(&self) -> Ts {
        self.mark_resolved_ts.load(Ordering::Acquire)
    }

    /// The watermark this table contributes to the local resolved ts: its
    /// own, held back by the mark table's when one is paired.
    pub fn effective_resolved_ts(&self) -> Ts {
        if self.mark_table_id == 0 {
            self.resolved_ts()
        } else {
            self.resolved_ts().min(self.mark_resolved_ts())
        }
    }

    pub fn advance_resolved_ts(&self, kind: ChainKind, ts: Ts) {
        let slot = match kind {
            ChainKind::User => &self.resolved_ts,
            ChainKind::Mark => &self.mark_resolved_ts,
        };
        slot.fetch_max(ts, Ordering::AcqRel);
    }

    pub fn is_dying(&self) -> bool {
        self.is_dying.load(Ordering::Acquire)
    }

    /// Begin the safe-stop protocol: mark the table dying and ask the
    /// rectifier to drain.
    pub fn safe_stop(&self) {
        self.is_dying.store(true, Ordering::Release);
        self.rectifier.lock().safe_stop();
    }
}

/// Build and start all tasks of a table pipeline. The returned cell is not
/// yet registered in the processor state; the scheduler owns that step.
pub(crate) fn spawn_table_pipeline(
    core: &Arc<ProcessorCore>,
    table_id: TableId,
    replica: &ReplicaInfo,
) -> Result<Arc<TableInfo>> {
    let cancel = core.shutdown.child_token();
    let name = core
        .schema_storage
        .latest_snapshot()
        .table_by_id(table_id)
        .map(|schema| schema.name.clone());
    let info = Arc::new(TableInfo {
        id: table_id,
        name,
        start_ts: replica.start_ts,
        mark_table_id: replica.mark_table_id,
        resolved_ts: AtomicU64::new(replica.start_ts),
        mark_resolved_ts: AtomicU64::new(replica.start_ts),
        is_dying: AtomicBool::new(false),
        cancel: cancel.clone(),
        rectifier: Arc::new(Mutex::new(Rectifier::new(core.config.target_ts))),
    });

    spawn_chain(core, &info, table_id, ChainKind::User)?;
    if replica.mark_table_id != 0 {
        // the mark chain shares the table's cancel token and rectifier
        spawn_chain(core, &info, replica.mark_table_id, ChainKind::Mark)?;
    }
    core.spawn_task(
        "table-op-done",
        op_done_watcher(core.clone(), info.clone(), cancel),
    );

    debug!(
        table_id,
        start_ts = replica.start_ts,
        mark_table_id = replica.mark_table_id,
        "table pipeline started"
    );
    Ok(info)
}

fn spawn_chain(
    core: &Arc<ProcessorCore>,
    info: &Arc<TableInfo>,
    chain_table_id: TableId,
    kind: ChainKind,
) -> Result<()> {
    let sorter::SorterBuild {
        sorter,
        input: sorter_tx,
        output: sorter_rx,
    } = sorter::build(
        core.config.sort_engine,
        &SorterOptions {
            table_id: chain_table_id,
            sort_dir: &core.config.sort_dir,
            memory_threshold: core.config.unified_sorter_memory_threshold,
            channel_capacity: CHAIN_CHANNEL_SIZE,
        },
    )?;
    let (puller, puller_rx) = Puller::new(
        core.source.clone(),
        vec![KeySpan::table_span(chain_table_id)],
        info.start_ts,
        CHAIN_CHANNEL_SIZE,
    );

    let cancel = info.cancel.clone();
    core.spawn_task("table-puller", async move {
        puller.run(cancel).await?;
        Ok(())
    });

    let cancel = info.cancel.clone();
    core.spawn_task("table-sorter", async move {
        sorter.run(cancel).await?;
        Ok(())
    });

    core.spawn_task(
        "table-puller-consume",
        puller_consume(core.clone(), info.clone(), chain_table_id, puller_rx, sorter_tx),
    );
    core.spawn_task(
        "table-sorter-consume",
        sorter_consume(core.clone(), info.clone(), kind, sorter_rx),
    );
    Ok(())
}

/// Charge the memory budget and hand raw entries into the sorter.
async fn puller_consume(
    core: Arc<ProcessorCore>,
    info: Arc<TableInfo>,
    table_id: TableId,
    mut puller_rx: mpsc::Receiver<RawKv>,
    sorter_tx: mpsc::Sender<PipelineEvent>,
) -> Result<()> {
    loop {
        let raw = tokio::select! {
            _ = info.cancel.cancelled() => return Ok(()),
            raw = puller_rx.recv() => match raw {
                None => return Ok(()),
                Some(raw) => raw,
            },
        };
        let event = match raw.op_type {
            OpType::Resolved => PipelineEvent::Resolved(ResolvedTs::span_level(raw.commit_ts)),
            OpType::Put | OpType::Delete => {
                core.limiter.acquire(raw.size()).await;
                PipelineEvent::Row(RowEvent::new(table_id, raw))
            }
        };
        if sorter_tx.send(event).await.is_err() {
            return Ok(());
        }
    }
}

/// Drain the sorter through the rectifier gate into the shared mounter and
/// output queue, and advance the table watermark.
async fn sorter_consume(
    core: Arc<ProcessorCore>,
    info: Arc<TableInfo>,
    kind: ChainKind,
    mut sorter_rx: mpsc::Receiver<PipelineEvent>,
) -> Result<()> {
    let mut stop_poll = tokio::time::interval(Duration::from_secs(1));
    loop {
        let event = tokio::select! {
            _ = info.cancel.cancelled() => return Ok(()),
            _ = stop_poll.tick() => {
                let polled = info.rectifier.lock().poll_stop();
                if let Some(terminal) = polled {
                    info.advance_resolved_ts(kind, terminal);
                    core.watermark_notifier.notify();
                }
                continue;
            }
            event = sorter_rx.recv() => match event {
                None => return Ok(()),
                Some(event) => event,
            },
        };
        if let PipelineEvent::Row(ev) = &event {
            // the entry has left the sorter; its budget is returned even if
            // the gate discards it
            core.limiter.release(ev.raw.size());
        }
        let rectified = info.rectifier.lock().handle(event);
        match rectified {
            Rectified::Discard => {}
            Rectified::Row(ev) => {
                if kind == ChainKind::User {
                    // mounter first, so the event is always prepared
                    // eventually once it sits in the output queue
                    if core.mounter_tx.send(ev.clone()).await.is_err() {
                        return Ok(());
                    }
                    if core.output_tx.send(PipelineEvent::Row(ev)).await.is_err() {
                        return Ok(());
                    }
                }
                // mark table rows only exist to carry the watermark
            }
            Rectified::Resolved(ts) => {
                info.advance_resolved_ts(kind, ts);
                core.watermark_notifier.notify();
            }
        }
    }
}

/// Report the add operation as done once this table has caught up: its
/// watermark reached the local one, which reached the cluster-wide one.
/// Checked on every watermark tick and on a coarse ticker, once.
async fn op_done_watcher(
    core: Arc<ProcessorCore>,
    info: Arc<TableInfo>,
    cancel: CancellationToken,
) -> Result<()> {
    let Some(mut watermarks) = core
        .local_resolved_notifier
        .receiver(Duration::from_millis(50))
    else {
        return Ok(());
    };
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
            tick = watermarks.tick() => {
                if tick.is_none() {
                    return Ok(());
                }
            }
        }
        let local = core.local_resolved_ts.load(Ordering::Acquire);
        let global = core.global_resolved_ts.load(Ordering::Acquire);
        if local > 0 && info.effective_resolved_ts() >= local && local >= global {
            debug!(table_id = info.id, local, global, "table caught up");
            if core.op_done_tx.send(info.id).is_err() {
                warn!(table_id = info.id, "op done receiver gone");
            }
            return Ok(());
        }
    }
}
