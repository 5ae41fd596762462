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

//! Events flowing through a table pipeline.
//!
//! A single queue multiplexes row changes, DDL jobs and resolved watermarks,
//! so the event is a tagged sum type. Row events additionally carry a
//! single-shot `prepared` latch: the mounter decodes the raw entry
//! asynchronously and the emitter awaits the latch before the row may be
//! handed to the sink.

use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use enum_as_inner::EnumAsInner;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::types::{RegionId, TableId, TableName, Ts};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    Put,
    Delete,
    /// A watermark carrier: no event with `commit_ts` less than or equal to
    /// this entry's will ever be observed again on the same region.
    Resolved,
}

/// A raw entry as observed from the upstream store.
#[derive(Debug, Clone)]
pub struct RawKv {
    pub op_type: OpType,
    pub key: Bytes,
    pub value: Bytes,
    pub old_value: Option<Bytes>,
    pub start_ts: Ts,
    pub commit_ts: Ts,
    pub region_id: RegionId,
}

impl RawKv {
    pub fn resolved(ts: Ts, region_id: RegionId, key: Bytes) -> Self {
        Self {
            op_type: OpType::Resolved,
            key,
            value: Bytes::new(),
            old_value: None,
            start_ts: 0,
            commit_ts: ts,
            region_id,
        }
    }

    /// Approximate heap footprint, used to charge the puller memory budget.
    pub fn size(&self) -> u64 {
        (self.key.len()
            + self.value.len()
            + self.old_value.as_ref().map_or(0, |v| v.len())
            + std::mem::size_of::<Self>()) as u64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub value: serde_json::Value,
}

/// A decoded row change, ready for a sink.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    pub table: TableName,
    pub table_id: TableId,
    pub commit_ts: Ts,
    pub start_ts: Ts,
    pub is_delete: bool,
    pub columns: Vec<Column>,
    pub old_columns: Option<Vec<Column>>,
}

/// A row event in flight through the pipeline.
///
/// The raw entry is attached at the puller; the mounter fills `decoded` and
/// signals `prepared` exactly once. `decoded == None` after preparation means
/// the row could not be interpreted (e.g. the table is not in the schema
/// snapshot) and is skipped downstream without failing the pipeline.
#[derive(Debug)]
pub struct RowEvent {
    pub commit_ts: Ts,
    pub start_ts: Ts,
    pub table_id: TableId,
    pub key_hash: u64,
    pub raw: RawKv,
    decoded: OnceLock<Option<RowChange>>,
    prepared: AtomicBool,
    notify: Notify,
}

impl RowEvent {
    pub fn new(table_id: TableId, raw: RawKv) -> Arc<Self> {
        debug_assert!(raw.op_type != OpType::Resolved);
        let mut hasher = DefaultHasher::new();
        hasher.write(&raw.key);
        Arc::new(Self {
            commit_ts: raw.commit_ts,
            start_ts: raw.start_ts,
            table_id,
            key_hash: hasher.finish(),
            raw,
            decoded: OnceLock::new(),
            prepared: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    /// Attach the decode result and release waiters. Later calls are ignored.
    pub fn mark_prepared(&self, row: Option<RowChange>) {
        if self.decoded.set(row).is_ok() {
            self.prepared.store(true, Ordering::Release);
            self.notify.notify_one();
        }
    }

    /// Wait until the mounter has prepared this event, then return the
    /// decoded row (`None` when the row is to be skipped).
    pub async fn wait_prepared(&self) -> Option<&RowChange> {
        while !self.prepared.load(Ordering::Acquire) {
            self.notify.notified().await;
        }
        self.decoded.get().expect("prepared implies decoded").as_ref()
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared.load(Ordering::Acquire)
    }
}

/// A watermark: no event with `commit_ts <= ts` will follow on this stream.
/// `region_id == 0` marks a span-level watermark produced by the frontier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedTs {
    pub ts: Ts,
    pub region_id: RegionId,
}

impl ResolvedTs {
    pub fn span_level(ts: Ts) -> Self {
        Self { ts, region_id: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DdlJobType {
    CreateSchema,
    DropSchema,
    CreateTable,
    DropTable,
    TruncateTable,
    RenameTable,
}

/// A DDL job decoded from the upstream meta region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DdlJob {
    pub id: i64,
    #[serde(rename = "type")]
    pub job_type: DdlJobType,
    pub schema_name: String,
    pub table_name: String,
    pub table_id: TableId,
    #[serde(default)]
    pub query: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DdlEvent {
    pub commit_ts: Ts,
    pub job: DdlJob,
}

/// The sum type multiplexed over a pipeline's output queue.
#[derive(Debug, Clone, EnumAsInner)]
pub enum PipelineEvent {
    Row(Arc<RowEvent>),
    Resolved(ResolvedTs),
    Ddl(DdlEvent),
}

impl PipelineEvent {
    pub fn commit_ts(&self) -> Ts {
        match self {
            PipelineEvent::Row(ev) => ev.commit_ts,
            PipelineEvent::Resolved(r) => r.ts,
            PipelineEvent::Ddl(ev) => ev.commit_ts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::row_key;

    fn put(ts: Ts) -> RawKv {
        RawKv {
            op_type: OpType::Put,
            key: row_key(1, 1),
            value: Bytes::from_static(b"{}"),
            old_value: None,
            start_ts: ts - 1,
            commit_ts: ts,
            region_id: 1,
        }
    }

    #[tokio::test]
    async fn test_prepared_latch_signal_before_wait() {
        let ev = RowEvent::new(1, put(10));
        ev.mark_prepared(None);
        assert!(ev.is_prepared());
        assert_eq!(ev.wait_prepared().await, None);
    }

    #[tokio::test]
    async fn test_prepared_latch_wait_before_signal() {
        let ev = RowEvent::new(1, put(10));
        let waiter = {
            let ev = ev.clone();
            tokio::spawn(async move { ev.wait_prepared().await.cloned() })
        };
        tokio::task::yield_now().await;
        let row = RowChange {
            table: TableName::new("db", "t"),
            table_id: 1,
            commit_ts: 10,
            start_ts: 9,
            is_delete: false,
            columns: vec![],
            old_columns: None,
        };
        ev.mark_prepared(Some(row.clone()));
        assert_eq!(waiter.await.unwrap(), Some(row));
    }

    #[tokio::test]
    async fn test_mark_prepared_first_result_wins() {
        let ev = RowEvent::new(1, put(10));
        ev.mark_prepared(None);
        ev.mark_prepared(Some(RowChange {
            table: TableName::new("db", "t"),
            table_id: 1,
            commit_ts: 10,
            start_ts: 9,
            is_delete: false,
            columns: vec![],
            old_columns: None,
        }));
        assert!(ev.is_prepared());
        // the first call settled the slot
        assert_eq!(ev.wait_prepared().await, None);
    }
}
