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

//! Task-level state persisted in the coordination store, serialized as JSON.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use rivulet_common::types::{TableId, Ts};

use crate::error::Result;
use crate::store::CoordinationStore;

/// One table assigned to a capture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    pub start_ts: Ts,
    /// Non-zero in cyclic replication: the id of the paired mark table.
    #[serde(default)]
    pub mark_table_id: TableId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Dispatched,
    Processed,
    Finished,
}

impl Default for OperationStatus {
    fn default() -> Self {
        OperationStatus::Dispatched
    }
}

/// A pending scheduling operation dispatched by the owner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableOperation {
    pub delete: bool,
    /// For delete operations: the handover watermark. The operation may only
    /// complete once the capture's checkpoint has reached it.
    #[serde(default)]
    pub boundary_ts: Ts,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub status: OperationStatus,
}

impl TableOperation {
    pub fn applied_done(&self) -> bool {
        self.done && self.status == OperationStatus::Finished
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminJobType {
    None,
    Stop,
    Remove,
}

impl Default for AdminJobType {
    fn default() -> Self {
        AdminJobType::None
    }
}

impl AdminJobType {
    pub fn is_stop_state(&self) -> bool {
        matches!(self, AdminJobType::Stop | AdminJobType::Remove)
    }
}

/// The tables a capture replicates and the scheduling operations in flight,
/// CAS-written under the task status key by both owner and processor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    #[serde(default)]
    pub tables: BTreeMap<TableId, ReplicaInfo>,
    #[serde(default)]
    pub operation: BTreeMap<TableId, TableOperation>,
    #[serde(default)]
    pub admin_job_type: AdminJobType,
    /// Set in memory when the scheduler mutated this status and it must be
    /// written back. Never persisted.
    #[serde(skip)]
    pub dirty: bool,
}

impl TaskStatus {
    /// Whether any operation has not been fully applied and acknowledged.
    pub fn some_operations_unapplied(&self) -> bool {
        self.operation.values().any(|op| !op.applied_done())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionError {
    pub code: String,
    pub message: String,
    pub addr: String,
}

/// Progress of one capture, persisted under the task position key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPosition {
    pub checkpoint_ts: Ts,
    pub resolved_ts: Ts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PositionError>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadInfo {
    pub workload: u64,
}

/// Per-table workload weights reported for owner-side balancing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskWorkload(pub BTreeMap<TableId, WorkloadInfo>);

/// Cluster-wide changefeed status published by the owner; read-only for
/// processors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeFeedStatus {
    pub resolved_ts: Ts,
    pub checkpoint_ts: Ts,
}

/// Read a JSON-encoded model together with its modification revision.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn CoordinationStore,
    key: &str,
) -> Result<Option<(T, i64)>> {
    match store.get(key).await? {
        Some(kv) => {
            let value = serde_json::from_slice(&kv.value)?;
            Ok(Some((value, kv.mod_revision)))
        }
        None => Ok(None),
    }
}

pub async fn put_json<T: Serialize>(
    store: &dyn CoordinationStore,
    key: &str,
    value: &T,
) -> Result<i64> {
    store.put(key, serde_json::to_vec(value)?).await
}

pub async fn put_json_cas<T: Serialize>(
    store: &dyn CoordinationStore,
    key: &str,
    value: &T,
    expected_mod_revision: i64,
) -> Result<i64> {
    store
        .put_cas(key, serde_json::to_vec(value)?, expected_mod_revision)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dirty_flag_not_persisted() {
        let status = TaskStatus {
            dirty: true,
            ..Default::default()
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(!json.contains("dirty"));
        let back: TaskStatus = serde_json::from_str(&json).unwrap();
        assert!(!back.dirty);
    }

    #[test]
    fn test_some_operations_unapplied() {
        let mut status = TaskStatus::default();
        assert!(!status.some_operations_unapplied());

        status.operation.insert(1, TableOperation::default());
        assert!(status.some_operations_unapplied());

        status.operation.get_mut(&1).unwrap().status = OperationStatus::Finished;
        assert!(status.some_operations_unapplied());
        status.operation.get_mut(&1).unwrap().done = true;
        assert!(!status.some_operations_unapplied());
    }

    #[test]
    fn test_position_error_omitted_when_absent() {
        let position = TaskPosition {
            checkpoint_ts: 5,
            resolved_ts: 7,
            error: None,
        };
        let json = serde_json::to_string(&position).unwrap();
        assert!(!json.contains("error"));
    }

    #[test]
    fn test_status_round_trip() {
        let mut status = TaskStatus::default();
        status.tables.insert(
            99,
            ReplicaInfo {
                start_ts: 100,
                mark_table_id: 0,
            },
        );
        status.operation.insert(
            99,
            TableOperation {
                delete: true,
                boundary_ts: 180,
                done: false,
                status: OperationStatus::Processed,
            },
        );
        let json = serde_json::to_vec(&status).unwrap();
        let back: TaskStatus = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, status);
    }
}
