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

//! The downstream sink contract.
//!
//! `emit_rows` is an atomic, blocking append; `flush(ts)` durably commits
//! everything emitted with commit ts at or below `ts` and reports the ts it
//! actually reached (which may be lower). `close` is idempotent.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use rivulet_common::event::RowChange;
use rivulet_common::types::Ts;

use crate::error::Result;

#[async_trait]
pub trait Sink: Send + Sync + 'static {
    /// Append rows. May be called with an empty batch.
    async fn emit_rows(&self, rows: Vec<RowChange>) -> Result<()>;

    /// Durably commit all previously emitted rows with `commit_ts <= ts`.
    /// Returns the ts actually made durable, never above `ts`.
    async fn flush(&self, ts: Ts) -> Result<Ts>;

    async fn close(&self) -> Result<()>;
}

/// Counts and discards everything; flush is immediately durable.
#[derive(Default)]
pub struct BlackHoleSink {
    emitted_rows: AtomicU64,
    flushed_ts: AtomicU64,
}

impl BlackHoleSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emitted_rows(&self) -> u64 {
        self.emitted_rows.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Sink for BlackHoleSink {
    async fn emit_rows(&self, rows: Vec<RowChange>) -> Result<()> {
        self.emitted_rows
            .fetch_add(rows.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn flush(&self, ts: Ts) -> Result<Ts> {
        self.flushed_ts.fetch_max(ts, Ordering::Relaxed);
        Ok(ts)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkRecord {
    EmitRows(Vec<RowChange>),
    Flush { target: Ts, returned: Ts },
}

/// Records every call for inspection; used by tests.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<SinkRecord>>,
    /// When non-zero, flush reports durability only up to this ts.
    flush_cap: AtomicU64,
    closed: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_flush_cap(&self, ts: Ts) {
        self.flush_cap.store(ts, Ordering::Relaxed);
    }

    pub fn records(&self) -> Vec<SinkRecord> {
        self.records.lock().clone()
    }

    /// All emitted rows, in emission order.
    pub fn rows(&self) -> Vec<RowChange> {
        self.records
            .lock()
            .iter()
            .filter_map(|record| match record {
                SinkRecord::EmitRows(rows) => Some(rows.clone()),
                SinkRecord::Flush { .. } => None,
            })
            .flatten()
            .collect()
    }

    /// Call sequence with empty emissions elided: commit ts of each emitted
    /// batch and the target of each flush.
    pub fn call_sequence(&self) -> Vec<SinkRecord> {
        self.records
            .lock()
            .iter()
            .filter(|record| !matches!(record, SinkRecord::EmitRows(rows) if rows.is_empty()))
            .cloned()
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn emit_rows(&self, rows: Vec<RowChange>) -> Result<()> {
        self.records.lock().push(SinkRecord::EmitRows(rows));
        Ok(())
    }

    async fn flush(&self, ts: Ts) -> Result<Ts> {
        let cap = self.flush_cap.load(Ordering::Relaxed);
        let returned = if cap == 0 { ts } else { ts.min(cap) };
        self.records.lock().push(SinkRecord::Flush {
            target: ts,
            returned,
        });
        Ok(returned)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rivulet_common::types::TableName;

    use super::*;

    fn row(commit_ts: Ts) -> RowChange {
        RowChange {
            table: TableName::new("db", "t"),
            table_id: 1,
            commit_ts,
            start_ts: commit_ts - 1,
            is_delete: false,
            columns: vec![],
            old_columns: None,
        }
    }

    #[tokio::test]
    async fn test_memory_sink_records_calls() {
        let sink = MemorySink::new();
        sink.emit_rows(vec![row(10), row(20)]).await.unwrap();
        sink.emit_rows(vec![]).await.unwrap();
        assert_eq!(sink.flush(25).await.unwrap(), 25);
        assert_eq!(sink.rows().len(), 2);
        assert_eq!(
            sink.call_sequence(),
            vec![
                SinkRecord::EmitRows(vec![row(10), row(20)]),
                SinkRecord::Flush {
                    target: 25,
                    returned: 25
                }
            ]
        );
    }

    #[tokio::test]
    async fn test_memory_sink_flush_cap() {
        let sink = MemorySink::new();
        sink.set_flush_cap(15);
        assert_eq!(sink.flush(25).await.unwrap(), 15);
        assert_eq!(sink.flush(10).await.unwrap(), 10);
    }
}
