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

use rivulet_common::types::{TableId, Ts};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProcessorError>;

#[derive(Error, Debug)]
pub enum ProcessorError {
    /// The owner set a stop-state admin job; the processor tears down
    /// cleanly without recording a position error.
    #[error("processor stopped by admin job")]
    AdminStop,

    #[error("processor cancelled")]
    Cancelled,

    #[error("coordination store: {0}")]
    Coordination(#[from] rivulet_coordination::Error),

    /// An add operation without a matching replica entry in the task status.
    #[error("table {0} not found in task status")]
    TableNotFound(TableId),

    #[error("cyclic replication requires a mark table for table {0}")]
    MarkTableRequired(TableId),

    #[error("connector: {0}")]
    Connector(#[from] rivulet_connector::Error),

    /// A row with commit ts at or below the already-published watermark
    /// reached the emitter; this is a bug, never an environment condition.
    #[error("resolved ts regression: row commit ts {commit_ts} <= resolved ts {resolved_ts}")]
    InvariantViolation { commit_ts: Ts, resolved_ts: Ts },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProcessorError {
    /// The stable code persisted into the task position on fatal exit.
    pub fn code(&self) -> &'static str {
        use rivulet_connector::Error as ConnectorError;
        use rivulet_coordination::Error as CoordinationError;
        match self {
            ProcessorError::AdminStop => "CDC:ErrAdminStopProcessor",
            ProcessorError::Coordination(CoordinationError::Conflict { .. }) => {
                "CDC:ErrEtcdTxnConflict"
            }
            ProcessorError::Coordination(CoordinationError::Compacted(_)) => "CDC:ErrEtcdCompacted",
            ProcessorError::TableNotFound(_) => "CDC:ErrTableNotFound",
            ProcessorError::MarkTableRequired(_) => "CDC:ErrMarkTableRequired",
            ProcessorError::Connector(ConnectorError::SortDir { .. }) => "CDC:ErrCreateSortDir",
            ProcessorError::Connector(
                ConnectorError::SchemaCompacted { .. } | ConnectorError::DdlApply { .. },
            ) => "CDC:ErrSchemaStorage",
            ProcessorError::Connector(ConnectorError::Sink(_)) => "CDC:ErrSinkFlush",
            ProcessorError::InvariantViolation { .. } => "CDC:ErrResolvedTsRegression",
            _ => "CDC:ErrProcessorUnknown",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProcessorError::Cancelled)
    }

    pub fn is_admin_stop(&self) -> bool {
        matches!(self, ProcessorError::AdminStop)
    }
}
