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

//! The shared coordination store and the task-level state persisted in it.
//!
//! All cross-capture state of a changefeed lives here: the owner assigns
//! tables by writing task statuses, processors report progress through task
//! positions and workloads, and the cluster-wide watermark is published under
//! the job key. The store is an etcd-style KV with per-key modification
//! revisions used as compare-and-swap guards.

mod error;
pub mod etcd;
pub mod keys;
pub mod mem;
pub mod model;
mod store;

pub use error::{Error, Result};
pub use store::{CoordinationStore, KeyValue, WatchEvent, WatchStream};
