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

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The guarded modification revision no longer matches; the caller must
    /// re-read and retry.
    #[error("compare-and-swap conflict on key {key}")]
    Conflict { key: String },

    /// The watched revision has been compacted away; the caller must re-read
    /// from scratch and re-watch.
    #[error("watch revision compacted (compact revision {0})")]
    Compacted(i64),

    #[error("etcd: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("value codec: {0}")]
    Codec(#[from] serde_json::Error),
}

impl Error {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    pub fn is_compacted(&self) -> bool {
        matches!(self, Error::Compacted(_))
    }
}
