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

//! Coordination with the shared store: watch the cluster-wide changefeed
//! status, apply scheduling through CAS-guarded task-status writes, and
//! persist the task position and workload.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::Instant;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;
use tracing::{debug, info, warn};

use rivulet_common::types::{ts_minus_duration, TableId};
use rivulet_coordination::keys;
use rivulet_coordination::model::{
    self, ChangeFeedStatus, TaskStatus, TaskWorkload, WorkloadInfo,
};
use rivulet_coordination::{CoordinationStore, WatchEvent};

use crate::error::{ProcessorError, Result};
use crate::processor::ProcessorCore;
use crate::scheduler::apply_operations;

const POSITION_DEBOUNCE: Duration = Duration::from_millis(50);
const CAS_RETRIES: usize = 3;
const CAS_BACKOFF_BASE: Duration = Duration::from_millis(500);
const WORKLOAD_REPORT_INTERVAL: Duration = Duration::from_secs(10);
/// Schema snapshots are retained this far behind the cluster checkpoint.
const SCHEMA_GC_LAG: Duration = Duration::from_secs(20 * 60);

/// Watches the owner-published changefeed status and publishes the
/// cluster-wide watermarks locally.
pub(crate) async fn run_global_status_worker(core: Arc<ProcessorCore>) -> Result<()> {
    let job_key = keys::job_key(&core.changefeed_id);
    loop {
        // one guarded read, then watch from its revision
        let retry = ExponentialBackoff::from_millis(2).factor(50).take(5);
        let read = Retry::spawn(retry, || {
            let core = core.clone();
            let job_key = job_key.clone();
            async move { model::get_json::<ChangeFeedStatus>(core.store.as_ref(), &job_key).await }
        })
        .await?;
        let revision = match read {
            Some((status, revision)) => {
                apply_global_status(&core, &status);
                revision
            }
            None => 0,
        };

        let mut watch = core.store.watch(&job_key, revision).await?;
        loop {
            tokio::select! {
                _ = core.shutdown.cancelled() => return Ok(()),
                event = watch.next() => match event {
                    // stream ended: re-read from scratch
                    None => break,
                    Some(Err(err)) if err.is_compacted() => break,
                    Some(Err(err)) => return Err(err.into()),
                    Some(Ok(WatchEvent::Compacted { compact_revision })) => {
                        debug!(compact_revision, "job watch compacted, re-reading");
                        break;
                    }
                    // deletes are filtered: a vanished status key never
                    // regresses the published watermarks
                    Some(Ok(WatchEvent::Delete { .. })) => {}
                    Some(Ok(WatchEvent::Put(kv))) => {
                        let status: ChangeFeedStatus = serde_json::from_slice(&kv.value)
                            .map_err(rivulet_coordination::Error::from)?;
                        apply_global_status(&core, &status);
                    }
                },
            }
        }
    }
}

fn apply_global_status(core: &ProcessorCore, status: &ChangeFeedStatus) {
    core.global_resolved_ts
        .fetch_max(status.resolved_ts, Ordering::AcqRel);
    core.global_checkpoint_ts
        .fetch_max(status.checkpoint_ts, Ordering::AcqRel);
    debug!(
        global_resolved_ts = status.resolved_ts,
        global_checkpoint_ts = status.checkpoint_ts,
        "cluster watermarks updated"
    );
    let global_checkpoint = core.global_checkpoint_ts.load(Ordering::Acquire);
    if global_checkpoint > 0 {
        core.schema_storage
            .do_gc(ts_minus_duration(global_checkpoint, SCHEMA_GC_LAG));
    }
    // both the flush minimum and the catch-up condition may have changed
    core.sink_emitted_notifier.notify();
    core.local_resolved_notifier.notify();
}

/// Applies scheduling whenever the task status changes, a table reports its
/// operation done, or the checkpoint advances past a deferred boundary.
pub(crate) async fn run_status_worker(core: Arc<ProcessorCore>) -> Result<()> {
    let status_key = keys::task_status_key(&core.changefeed_id, &core.capture_id);
    let mut op_done_rx = core
        .op_done_rx
        .lock()
        .take()
        .expect("status worker started twice");
    let Some(mut checkpoint_ticks) = core.checkpoint_notifier.receiver(POSITION_DEBOUNCE) else {
        return Ok(());
    };
    // a safe-stopping rectifier finalizes without traffic; this ticker makes
    // sure its operation is picked up even when no other trigger fires
    let mut op_recheck = tokio::time::interval(Duration::from_secs(1));

    sync_task_status(&core, &status_key, &[]).await?;
    'watch: loop {
        let from = core.status_mod_revision.load(Ordering::Acquire);
        let mut watch = core.store.watch(&status_key, from).await?;
        loop {
            let done_tables: Vec<TableId> = tokio::select! {
                _ = core.shutdown.cancelled() => return Ok(()),
                event = watch.next() => match event {
                    None => continue 'watch,
                    Some(Err(err)) if err.is_compacted() => continue 'watch,
                    Some(Err(err)) => return Err(err.into()),
                    Some(Ok(WatchEvent::Compacted { .. })) => continue 'watch,
                    Some(Ok(WatchEvent::Delete { .. })) => continue,
                    Some(Ok(WatchEvent::Put(_))) => Vec::new(),
                },
                done = op_done_rx.recv() => {
                    let Some(first) = done else {
                        return Ok(());
                    };
                    let mut ids = vec![first];
                    while let Ok(id) = op_done_rx.try_recv() {
                        ids.push(id);
                    }
                    ids
                }
                tick = checkpoint_ticks.tick() => {
                    if tick.is_none() {
                        return Ok(());
                    }
                    // only interesting while a deferred operation waits on
                    // the checkpoint
                    if !core.pending_ops.load(Ordering::Acquire) {
                        continue;
                    }
                    Vec::new()
                }
                _ = op_recheck.tick() => {
                    if !core.pending_ops.load(Ordering::Acquire) {
                        continue;
                    }
                    Vec::new()
                }
            };
            sync_task_status(&core, &status_key, &done_tables).await?;
        }
    }
}

/// One fetch → schedule → CAS-write round, with bounded retries on
/// write conflicts.
async fn sync_task_status(
    core: &Arc<ProcessorCore>,
    status_key: &str,
    done_tables: &[TableId],
) -> Result<()> {
    let mut backoff = CAS_BACKOFF_BASE;
    for attempt in 1.. {
        let fetched = model::get_json::<TaskStatus>(core.store.as_ref(), status_key).await?;
        let (mut status, revision) = fetched.unwrap_or_else(|| (TaskStatus::default(), 0));

        if revision == core.status_mod_revision.load(Ordering::Acquire)
            && !status.some_operations_unapplied()
            && done_tables.is_empty()
        {
            return Ok(());
        }
        if status.admin_job_type.is_stop_state() {
            info!(?status.admin_job_type, "admin job stops this processor");
            return Err(ProcessorError::AdminStop);
        }

        apply_operations(core, &mut status, done_tables)?;
        if !status.dirty {
            core.status_mod_revision.store(revision, Ordering::Release);
            return Ok(());
        }

        match model::put_json_cas(core.store.as_ref(), status_key, &status, revision).await {
            Ok(new_revision) => {
                core.status_mod_revision.store(new_revision, Ordering::Release);
                // the position always follows a successful status write
                flush_position(core, true).await?;
                return Ok(());
            }
            Err(err) if err.is_conflict() && attempt < CAS_RETRIES => {
                warn!(attempt, "task status write conflicted, retrying");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(err) => return Err(err.into()),
        }
    }
    unreachable!("loop returns within the retry budget")
}

/// Persists the task position on watermark and checkpoint advances. The
/// flush-checkpoint throttle applies only to checkpoint advancement;
/// resolved-ts advancement always flushes.
pub(crate) async fn run_position_worker(core: Arc<ProcessorCore>) -> Result<()> {
    let Some(mut resolved_ticks) = core.local_resolved_notifier.receiver(POSITION_DEBOUNCE) else {
        return Ok(());
    };
    let Some(mut checkpoint_ticks) = core.checkpoint_notifier.receiver(POSITION_DEBOUNCE) else {
        return Ok(());
    };
    let throttle = core.config.flush_checkpoint_interval();
    let mut last_checkpoint_flush: Option<Instant> = None;
    loop {
        tokio::select! {
            _ = core.shutdown.cancelled() => return Ok(()),
            tick = resolved_ticks.tick() => {
                if tick.is_none() {
                    return Ok(());
                }
                flush_position(core.as_ref(), false).await?;
            }
            tick = checkpoint_ticks.tick() => {
                if tick.is_none() {
                    return Ok(());
                }
                if let Some(last) = last_checkpoint_flush {
                    if last.elapsed() < throttle {
                        continue;
                    }
                }
                flush_position(core.as_ref(), true).await?;
                last_checkpoint_flush = Some(Instant::now());
            }
        }
    }
}

/// Sync the position from the watermark atomics and persist it if changed.
pub(crate) async fn flush_position(core: &ProcessorCore, include_checkpoint: bool) -> Result<()> {
    let snapshot = {
        let mut position = core.position.lock();
        let resolved = core.local_resolved_ts.load(Ordering::Acquire);
        if resolved > position.resolved_ts {
            position.resolved_ts = resolved;
        }
        if include_checkpoint {
            let checkpoint = core.checkpoint_ts.load(Ordering::Acquire);
            if checkpoint > position.checkpoint_ts {
                position.checkpoint_ts = checkpoint;
            }
        }
        position.clone()
    };
    let encoded = serde_json::to_vec(&snapshot).map_err(rivulet_coordination::Error::from)?;
    if core.last_flushed_position.lock().as_deref() == Some(encoded.as_slice()) {
        return Ok(());
    }
    let position_key = keys::task_position_key(&core.changefeed_id, &core.capture_id);
    core.store.put(&position_key, encoded.clone()).await?;
    *core.last_flushed_position.lock() = Some(encoded);
    debug!(
        checkpoint_ts = snapshot.checkpoint_ts,
        resolved_ts = snapshot.resolved_ts,
        "task position flushed"
    );
    Ok(())
}

/// Reports the per-table workload weights for owner-side balancing.
pub(crate) async fn run_workload_worker(core: Arc<ProcessorCore>) -> Result<()> {
    let workload_key = keys::task_workload_key(&core.changefeed_id, &core.capture_id);
    let mut ticker = tokio::time::interval(WORKLOAD_REPORT_INTERVAL);
    loop {
        tokio::select! {
            _ = core.shutdown.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }
        let workload = {
            let state = core.state.lock();
            TaskWorkload(
                state
                    .tables
                    .keys()
                    .map(|table_id| (*table_id, WorkloadInfo { workload: 1 }))
                    .collect(),
            )
        };
        model::put_json(core.store.as_ref(), &workload_key, &workload).await?;
    }
}
