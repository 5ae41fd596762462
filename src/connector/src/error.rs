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

use std::path::PathBuf;

use rivulet_common::types::Ts;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to create sort dir {path}")]
    SortDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("sorter spill: {0}")]
    Spill(#[from] std::io::Error),

    #[error("schema snapshot at ts {requested} already gc'ed (earliest retained {earliest})")]
    SchemaCompacted { requested: Ts, earliest: Ts },

    #[error("ddl job at ts {commit_ts} cannot be applied: {reason}")]
    DdlApply { commit_ts: Ts, reason: String },

    #[error("upstream source: {0}")]
    Upstream(#[source] anyhow::Error),

    #[error("sink: {0}")]
    Sink(#[source] anyhow::Error),
}
