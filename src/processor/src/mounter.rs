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

//! Mounter: a shared pool decoding raw entries into row changes.
//!
//! Workers pull from one shared channel, so backpressure here slows all
//! sorters equally. Decoding uses the schema snapshot at `commit_ts - 1`.
//! An entry that cannot be interpreted resolves to a skipped row without
//! failing the pipeline; a schema-storage failure is fatal. Ordering is not
//! preserved here; the emitter re-establishes it by awaiting each event's
//! `prepared` latch in queue order.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::warn;

use rivulet_common::event::{Column, OpType, RowChange, RowEvent};
use rivulet_common::span::decode_row_key;
use rivulet_connector::schema::SchemaSnapshot;

use crate::error::Result;
use crate::processor::ProcessorCore;

pub(crate) async fn run_mounter_worker(core: Arc<ProcessorCore>) -> Result<()> {
    loop {
        let event = tokio::select! {
            _ = core.shutdown.cancelled() => return Ok(()),
            event = async {
                let mut rx = core.mounter_rx.lock().await;
                rx.recv().await
            } => match event {
                None => return Ok(()),
                Some(event) => event,
            },
        };

        let snapshot = core
            .schema_storage
            .snapshot_at(event.commit_ts.saturating_sub(1))
            .await?;
        let row = decode_row_event(&event, &snapshot, core.config.enable_old_value);
        if row.is_none() {
            core.metrics.skipped_rows.inc();
        }
        event.mark_prepared(row);
    }
}

/// Decode one raw entry against a schema snapshot. `None` marks the row as
/// skipped.
fn decode_row_event(
    event: &RowEvent,
    snapshot: &SchemaSnapshot,
    enable_old_value: bool,
) -> Option<RowChange> {
    let (table_id, _handle) = decode_row_key(&event.raw.key)?;
    let schema = snapshot.table_by_id(table_id)?;

    let is_delete = event.raw.op_type == OpType::Delete;
    let columns = if is_delete {
        // a delete carries no new image; surface the old one when present
        match &event.raw.old_value {
            Some(old) => parse_columns(old)?,
            None => Vec::new(),
        }
    } else {
        parse_columns(&event.raw.value)?
    };
    let old_columns = if enable_old_value && !is_delete {
        event.raw.old_value.as_deref().and_then(parse_columns)
    } else {
        None
    };

    Some(RowChange {
        table: schema.name.clone(),
        table_id,
        commit_ts: event.commit_ts,
        start_ts: event.start_ts,
        is_delete,
        columns,
        old_columns,
    })
}

fn parse_columns(value: &[u8]) -> Option<Vec<Column>> {
    let fields: BTreeMap<String, serde_json::Value> = match serde_json::from_slice(value) {
        Ok(fields) => fields,
        Err(err) => {
            warn!(error = %err, "undecodable row value, skipping");
            return None;
        }
    };
    Some(
        fields
            .into_iter()
            .map(|(name, value)| Column { name, value })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use rivulet_common::event::RawKv;
    use rivulet_common::span::row_key;
    use rivulet_common::types::TableName;
    use rivulet_connector::schema::TableSchema;

    use super::*;

    fn snapshot() -> SchemaSnapshot {
        SchemaSnapshot::with_tables([TableSchema {
            id: 99,
            name: TableName::new("db", "orders"),
        }])
    }

    fn put_event(table_id: i64, value: &'static [u8]) -> Arc<RowEvent> {
        RowEvent::new(
            table_id,
            RawKv {
                op_type: OpType::Put,
                key: row_key(table_id, 1),
                value: Bytes::from_static(value),
                old_value: None,
                start_ts: 9,
                commit_ts: 10,
                region_id: 1,
            },
        )
    }

    #[test]
    fn test_decode_put() {
        let event = put_event(99, br#"{"id": 1, "name": "a"}"#);
        let row = decode_row_event(&event, &snapshot(), false).unwrap();
        assert_eq!(row.table, TableName::new("db", "orders"));
        assert_eq!(row.commit_ts, 10);
        assert!(!row.is_delete);
        assert_eq!(row.columns.len(), 2);
        assert_eq!(row.columns[0].name, "id");
    }

    #[test]
    fn test_unknown_table_skipped() {
        let event = put_event(7, br#"{"id": 1}"#);
        assert!(decode_row_event(&event, &snapshot(), false).is_none());
    }

    #[test]
    fn test_garbage_value_skipped() {
        let event = put_event(99, b"not json");
        assert!(decode_row_event(&event, &snapshot(), false).is_none());
    }

    #[test]
    fn test_decode_delete_uses_old_image() {
        let event = RowEvent::new(
            99,
            RawKv {
                op_type: OpType::Delete,
                key: row_key(99, 1),
                value: Bytes::new(),
                old_value: Some(Bytes::from_static(br#"{"id": 1}"#)),
                start_ts: 9,
                commit_ts: 10,
                region_id: 1,
            },
        );
        let row = decode_row_event(&event, &snapshot(), true).unwrap();
        assert!(row.is_delete);
        assert_eq!(row.columns.len(), 1);
        assert!(row.old_columns.is_none());
    }
}
