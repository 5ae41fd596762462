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

//! Key layout of a changefeed in the coordination store.

pub const ROOT_PREFIX: &str = "/rivulet/cdc";

/// Task status of one capture for one changefeed; owner and processor both
/// write it, guarded by CAS.
pub fn task_status_key(changefeed_id: &str, capture_id: &str) -> String {
    format!("{ROOT_PREFIX}/task/status/{changefeed_id}/{capture_id}")
}

/// Checkpoint and resolved ts reported by one capture.
pub fn task_position_key(changefeed_id: &str, capture_id: &str) -> String {
    format!("{ROOT_PREFIX}/task/position/{changefeed_id}/{capture_id}")
}

/// Workload report of one capture, refreshed periodically.
pub fn task_workload_key(changefeed_id: &str, capture_id: &str) -> String {
    format!("{ROOT_PREFIX}/task/workload/{changefeed_id}/{capture_id}")
}

/// Cluster-wide changefeed status published by the owner.
pub fn job_key(changefeed_id: &str) -> String {
    format!("{ROOT_PREFIX}/job/{changefeed_id}")
}
