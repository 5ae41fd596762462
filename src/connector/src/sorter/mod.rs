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

//! Sort engines: an ordering stage between puller and rectifier.
//!
//! A sorter consumes row events in arrival order interleaved with
//! watermarks, and releases events in non-decreasing commit-ts order. A
//! watermark may only be released after every event at or below it has been.

mod memory;
mod spill;

use std::cmp::Ordering;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use memory::EntrySorter;
pub use spill::SpillSorter;

use rivulet_common::config::SortEngine;
use rivulet_common::event::{OpType, PipelineEvent, RowEvent};
use rivulet_common::types::TableId;

use crate::error::{Error, Result};

#[async_trait]
pub trait EventSorter: Send + 'static {
    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()>;
}

pub struct SorterOptions<'a> {
    pub table_id: TableId,
    pub sort_dir: &'a Path,
    /// Bytes buffered in memory before a sorted run spills. Zero spills
    /// every run (the on-disk engine).
    pub memory_threshold: u64,
    pub channel_capacity: usize,
}

pub struct SorterBuild {
    pub sorter: Box<dyn EventSorter>,
    pub input: mpsc::Sender<PipelineEvent>,
    pub output: mpsc::Receiver<PipelineEvent>,
}

/// Construct the configured sort engine. Spilling engines require the sort
/// directory to exist; it is created `0o755` when missing and a failure to
/// do so is fatal.
pub fn build(engine: SortEngine, opts: &SorterOptions<'_>) -> Result<SorterBuild> {
    let (input_tx, input_rx) = mpsc::channel(opts.channel_capacity);
    let (output_tx, output_rx) = mpsc::channel(opts.channel_capacity);
    let sorter: Box<dyn EventSorter> = match engine {
        SortEngine::InMemory => Box::new(EntrySorter::new(input_rx, output_tx)),
        SortEngine::OnDisk => Box::new(SpillSorter::new(
            input_rx,
            output_tx,
            ensure_sort_dir(opts.sort_dir)?,
            opts.table_id,
            0,
        )),
        SortEngine::Unified => Box::new(SpillSorter::new(
            input_rx,
            output_tx,
            ensure_sort_dir(opts.sort_dir)?,
            opts.table_id,
            opts.memory_threshold,
        )),
    };
    Ok(SorterBuild {
        sorter,
        input: input_tx,
        output: output_rx,
    })
}

fn ensure_sort_dir(path: &Path) -> Result<std::path::PathBuf> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o755);
    }
    builder.create(path).map_err(|source| Error::SortDir {
        path: path.to_owned(),
        source,
    })?;
    Ok(path.to_owned())
}

/// Total order over row events: commit ts first, then start ts, with deletes
/// sorted before puts of the same transaction so a replace reads correctly.
pub(crate) fn cmp_events(a: &Arc<RowEvent>, b: &Arc<RowEvent>) -> Ordering {
    (a.commit_ts, a.start_ts, op_rank(a.raw.op_type), a.raw.key.as_ref()).cmp(&(
        b.commit_ts,
        b.start_ts,
        op_rank(b.raw.op_type),
        b.raw.key.as_ref(),
    ))
}

fn op_rank(op: OpType) -> u8 {
    match op {
        OpType::Delete => 0,
        OpType::Put => 1,
        OpType::Resolved => 2,
    }
}
