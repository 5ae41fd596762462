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

//! The table scheduler applies the owner's add/delete operations to the
//! local table set, mutating the task status in place; the coordinator
//! writes the result back under CAS.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, info, warn};

use rivulet_common::types::TableId;
use rivulet_coordination::model::{OperationStatus, ReplicaInfo, TaskStatus};

use crate::error::{ProcessorError, Result};
use crate::pipeline::spawn_table_pipeline;
use crate::processor::ProcessorCore;

/// One scheduler pass over the task status. `done_tables` are completions
/// drained from the per-table pipelines. Sets `status.dirty` whenever the
/// status must be written back.
pub(crate) fn apply_operations(
    core: &Arc<ProcessorCore>,
    status: &mut TaskStatus,
    done_tables: &[TableId],
) -> Result<()> {
    // operations fully applied in an earlier round are cleared as a whole
    if !status.operation.is_empty() && !status.some_operations_unapplied() {
        status.operation.clear();
        status.dirty = true;
    }

    let checkpoint_ts = core.position.lock().checkpoint_ts;
    let table_ids: Vec<TableId> = status.operation.keys().copied().collect();
    for table_id in table_ids {
        let op = *status.operation.get(&table_id).expect("key just listed");
        if op.status == OperationStatus::Finished {
            continue;
        }
        if op.delete {
            // the handover boundary gates the whole stop protocol
            if op.boundary_ts > checkpoint_ts {
                continue;
            }
            apply_delete(core, status, table_id, checkpoint_ts);
        } else {
            let Some(replica) = status.tables.get(&table_id).copied() else {
                return Err(ProcessorError::TableNotFound(table_id));
            };
            add_table(core, table_id, &replica)?;
            let op = status.operation.get_mut(&table_id).expect("key just listed");
            if op.status == OperationStatus::Dispatched {
                op.status = OperationStatus::Processed;
                status.dirty = true;
            }
        }
    }

    for table_id in done_tables {
        if let Some(op) = status.operation.get_mut(table_id) {
            if !op.applied_done() {
                op.done = true;
                op.status = OperationStatus::Finished;
                status.dirty = true;
                info!(table_id, "table operation finished");
            }
        }
    }

    // tables assigned without a live pipeline (a processor restart, or an
    // owner that skipped the operation protocol) are installed as well
    let missing: Vec<(TableId, ReplicaInfo)> = {
        let state = core.state.lock();
        status
            .tables
            .iter()
            .filter(|(table_id, _)| !state.tables.contains_key(table_id))
            .filter(|(table_id, _)| {
                status
                    .operation
                    .get(table_id)
                    .map_or(true, |op| !op.delete)
            })
            .map(|(table_id, replica)| (*table_id, *replica))
            .collect()
    };
    for (table_id, replica) in missing {
        add_table(core, table_id, &replica)?;
    }

    core.pending_ops
        .store(status.some_operations_unapplied(), Ordering::Release);
    Ok(())
}

fn apply_delete(
    core: &Arc<ProcessorCore>,
    status: &mut TaskStatus,
    table_id: TableId,
    checkpoint_ts: rivulet_common::types::Ts,
) {
    let info = core.state.lock().tables.get(&table_id).cloned();
    let Some(info) = info else {
        warn!(table_id, "table to remove not found, finishing operation");
        let op = status.operation.get_mut(&table_id).expect("caller checked");
        op.done = true;
        op.status = OperationStatus::Finished;
        status.dirty = true;
        return;
    };

    if !info.is_dying() {
        info.safe_stop();
        info!(table_id, "table safe-stop requested");
        let op = status.operation.get_mut(&table_id).expect("caller checked");
        if op.status == OperationStatus::Dispatched {
            op.status = OperationStatus::Processed;
            status.dirty = true;
        }
    }

    let (rect_status, max_resolved_ts) = {
        let rect = info.rectifier.lock();
        (rect.status(), rect.max_resolved_ts())
    };
    if rect_status.is_terminal() {
        let op = status.operation.get_mut(&table_id).expect("caller checked");
        if op.boundary_ts != max_resolved_ts {
            op.boundary_ts = max_resolved_ts;
            status.dirty = true;
        }
        // physical removal only once the checkpoint has crossed the boundary
        if op.boundary_ts <= checkpoint_ts {
            remove_table(core, table_id);
            op.done = true;
            op.status = OperationStatus::Finished;
            status.dirty = true;
        }
    }
}

/// Install a table pipeline. Idempotent on a live table; a dying table is
/// torn down and replaced.
pub(crate) fn add_table(
    core: &Arc<ProcessorCore>,
    table_id: TableId,
    replica: &ReplicaInfo,
) -> Result<()> {
    if core.config.cyclic.enabled && replica.mark_table_id == 0 {
        return Err(ProcessorError::MarkTableRequired(table_id));
    }
    {
        let mut state = core.state.lock();
        // mark tables ride along with their owning table and are never
        // scheduled in their own right
        if state.mark_table_ids.contains(&table_id) {
            warn!(table_id, "refusing to add a mark table as a user table");
            return Ok(());
        }
        if let Some(existing) = state.tables.get(&table_id) {
            if !existing.is_dying() {
                debug!(table_id, "add of a live table is a no-op");
                return Ok(());
            }
            // re-add while dying: cancel the old cell, install a new one
            info!(table_id, "replacing dying table pipeline");
            let old = state.tables.remove(&table_id).expect("just looked up");
            old.cancel.cancel();
            if old.mark_table_id != 0 {
                state.mark_table_ids.remove(&old.mark_table_id);
            }
        }
    }

    // a table joining below the current watermark legitimately lowers it;
    // this must happen before any of its rows can reach the emitter, whose
    // ordering assertion reads the lowered value through its clamp
    core.local_resolved_ts
        .fetch_min(replica.start_ts, Ordering::AcqRel);

    // pipeline construction touches the filesystem; keep it outside the
    // state lock (only the coordinator task installs tables)
    let info = spawn_table_pipeline(core, table_id, replica)?;

    let mut state = core.state.lock();
    if replica.mark_table_id != 0 {
        state.mark_table_ids.insert(replica.mark_table_id);
    }
    state.tables.insert(table_id, info);
    core.metrics.table_count.set(state.tables.len() as i64);
    Ok(())
}

fn remove_table(core: &Arc<ProcessorCore>, table_id: TableId) {
    {
        let mut state = core.state.lock();
        let Some(info) = state.tables.remove(&table_id) else {
            return;
        };
        info.cancel.cancel();
        // the mark table is not independently scheduled: it leaves with its
        // owning table
        if info.mark_table_id != 0 {
            state.mark_table_ids.remove(&info.mark_table_id);
        }
        core.metrics.table_count.set(state.tables.len() as i64);
        info!(table_id, name = ?info.name, "table removed");
    }
    // the departed table may have been the watermark minimum
    core.watermark_notifier.notify();
}
