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
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::Ts;

/// Sorter backend selection. Unknown values fail deserialization; the
/// processor additionally fails construction when the selected engine cannot
/// be set up (e.g. the sort directory is not writable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortEngine {
    InMemory,
    OnDisk,
    Unified,
}

impl Default for SortEngine {
    fn default() -> Self {
        SortEngine::Unified
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CyclicConfig {
    /// When enabled, every replicated table is paired with a mark table and
    /// an add operation without a mark table id is rejected.
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MounterConfig {
    #[serde(default = "default::mounter::worker_num")]
    pub worker_num: usize,
}

impl Default for MounterConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

/// Per-changefeed processor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Minimum interval between checkpoint persistences. Zero persists on
    /// every advance. Resolved-ts persistence is intentionally not subject
    /// to this throttle.
    #[serde(default)]
    pub flush_checkpoint_interval_ms: u64,

    #[serde(default)]
    pub sort_engine: SortEngine,

    #[serde(default = "default::sort_dir")]
    pub sort_dir: PathBuf,

    /// Whether key-ranges are requested with old values attached.
    #[serde(default)]
    pub enable_old_value: bool,

    #[serde(default)]
    pub cyclic: CyclicConfig,

    /// Upper bound of the changefeed; pipelines self-finish once their
    /// resolved ts crosses it.
    #[serde(default = "default::target_ts")]
    pub target_ts: Ts,

    #[serde(default)]
    pub mounter: MounterConfig,

    /// Capacity of the shared sorted-output queue. Sized to absorb
    /// sorted-but-unmounted backlog; the default suits 50-100k QPS
    /// workloads.
    #[serde(default = "default::output_channel_size")]
    pub output_channel_size: usize,

    #[serde(default = "default::mounter_input_channel_size")]
    pub mounter_input_channel_size: usize,

    /// Byte budget shared by all pullers of this processor.
    #[serde(default = "default::puller_memory_limit")]
    pub puller_memory_limit: u64,

    /// In-memory bytes a unified sorter accumulates before spilling a run.
    #[serde(default = "default::unified_sorter_memory_threshold")]
    pub unified_sorter_memory_threshold: u64,
}

impl ProcessorConfig {
    pub fn flush_checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.flush_checkpoint_interval_ms)
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

mod default {
    use std::path::PathBuf;

    use crate::types::Ts;

    pub fn sort_dir() -> PathBuf {
        PathBuf::from("/tmp/rivulet/sorter")
    }

    pub fn target_ts() -> Ts {
        Ts::MAX
    }

    pub fn output_channel_size() -> usize {
        1 << 20
    }

    pub fn mounter_input_channel_size() -> usize {
        1 << 16
    }

    pub fn puller_memory_limit() -> u64 {
        10 << 30
    }

    pub fn unified_sorter_memory_threshold() -> u64 {
        64 << 20
    }

    pub mod mounter {
        pub fn worker_num() -> usize {
            4
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProcessorConfig::default();
        assert_eq!(config.sort_engine, SortEngine::Unified);
        assert_eq!(config.target_ts, Ts::MAX);
        assert_eq!(config.flush_checkpoint_interval(), Duration::ZERO);
        assert!(!config.cyclic.enabled);
        assert_eq!(config.mounter.worker_num, 4);
    }

    #[test]
    fn test_sort_engine_names() {
        let config: ProcessorConfig =
            serde_json::from_str(r#"{"sort_engine": "inMemory"}"#).unwrap();
        assert_eq!(config.sort_engine, SortEngine::InMemory);
        assert!(serde_json::from_str::<ProcessorConfig>(r#"{"sort_engine": "bubble"}"#).is_err());
    }
}
