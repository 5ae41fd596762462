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

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub mod_revision: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put(KeyValue),
    Delete { key: String, mod_revision: i64 },
    /// The watch can no longer be served from `from_revision`; re-read and
    /// re-watch from the current state.
    Compacted { compact_revision: i64 },
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent>>;

/// An etcd-style coordination store: per-key modification revisions,
/// compare-and-swap writes guarded by them, and single-key watches.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    /// Unconditional write. Returns the new modification revision.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<i64>;

    /// Write guarded by the key's current modification revision;
    /// `expected_mod_revision == 0` requires the key to not exist yet.
    /// Returns the new modification revision, or [`Error::Conflict`].
    async fn put_cas(&self, key: &str, value: Vec<u8>, expected_mod_revision: i64) -> Result<i64>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Stream updates of `key` with modification revision strictly greater
    /// than `from_revision`.
    async fn watch(&self, key: &str, from_revision: i64) -> Result<WatchStream>;
}
