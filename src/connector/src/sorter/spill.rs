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

use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use rivulet_common::event::{OpType, PipelineEvent, RawKv, RowEvent};
use rivulet_common::types::{RegionId, TableId, Ts};

use super::{cmp_events, EventSorter};
use crate::error::{Error, Result};

static SORTER_INSTANCE_SEQ: AtomicU64 = AtomicU64::new(0);

/// The spilling sort engine behind the `onDisk` and `unified` selections.
///
/// Same release protocol as the in-memory engine, but sorted runs beyond the
/// in-memory byte threshold are written as run files under the sort
/// directory and merged back at the next watermark. A zero threshold spills
/// every run.
pub struct SpillSorter {
    input: mpsc::Receiver<PipelineEvent>,
    output: mpsc::Sender<PipelineEvent>,
    dir: PathBuf,
    table_id: TableId,
    instance: u64,
    threshold: u64,
    mem: Vec<Arc<RowEvent>>,
    mem_bytes: u64,
    carry: Vec<Arc<RowEvent>>,
    runs: Vec<PathBuf>,
    run_seq: u64,
}

impl SpillSorter {
    pub fn new(
        input: mpsc::Receiver<PipelineEvent>,
        output: mpsc::Sender<PipelineEvent>,
        dir: PathBuf,
        table_id: TableId,
        threshold: u64,
    ) -> Self {
        Self {
            input,
            output,
            dir,
            table_id,
            instance: SORTER_INSTANCE_SEQ.fetch_add(1, Ordering::Relaxed),
            threshold,
            mem: Vec::new(),
            mem_bytes: 0,
            carry: Vec::new(),
            runs: Vec::new(),
            run_seq: 0,
        }
    }

    async fn spill_run(&mut self) -> Result<()> {
        if self.mem.is_empty() {
            return Ok(());
        }
        self.mem.sort_by(cmp_events);
        let entries: Vec<SpilledEntry> = self.mem.drain(..).map(|ev| (&*ev).into()).collect();
        self.mem_bytes = 0;

        let path = self.dir.join(format!(
            "{}-{}-{}.run",
            self.table_id, self.instance, self.run_seq
        ));
        self.run_seq += 1;
        debug!(path = %path.display(), entries = entries.len(), "spilling sorted run");
        let write_path = path.clone();
        run_blocking(move || write_run(&write_path, &entries)).await?;
        self.runs.push(path);
        Ok(())
    }

    async fn release(&mut self, resolved_ts: Ts) -> Result<Vec<Arc<RowEvent>>> {
        self.mem.sort_by(cmp_events);
        let mut merged = std::mem::take(&mut self.mem);
        self.mem_bytes = 0;
        merged.append(&mut self.carry);

        let runs = std::mem::take(&mut self.runs);
        if !runs.is_empty() {
            let loaded = run_blocking(move || {
                let mut entries = Vec::new();
                for path in &runs {
                    entries.extend(read_run(path)?);
                    let _ = std::fs::remove_file(path);
                }
                Ok(entries)
            })
            .await?;
            merged.extend(
                loaded
                    .into_iter()
                    .map(|entry| RowEvent::new(self.table_id, entry.into())),
            );
        }

        merged.sort_by(cmp_events);
        let split = merged.partition_point(|ev| ev.commit_ts <= resolved_ts);
        self.carry = merged.split_off(split);
        Ok(merged)
    }
}

#[async_trait]
impl EventSorter for SpillSorter {
    async fn run(mut self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                event = self.input.recv() => match event {
                    None => return Ok(()),
                    Some(event) => event,
                },
            };
            match event {
                PipelineEvent::Row(ev) => {
                    self.mem_bytes += ev.raw.size();
                    self.mem.push(ev);
                    if self.mem_bytes > self.threshold {
                        self.spill_run().await?;
                    }
                }
                PipelineEvent::Resolved(resolved) => {
                    for ev in self.release(resolved.ts).await? {
                        if self.output.send(PipelineEvent::Row(ev)).await.is_err() {
                            return Ok(());
                        }
                    }
                    if self
                        .output
                        .send(PipelineEvent::Resolved(resolved))
                        .await
                        .is_err()
                    {
                        return Ok(());
                    }
                }
                other => {
                    if self.output.send(other).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

impl Drop for SpillSorter {
    fn drop(&mut self) {
        for path in &self.runs {
            let _ = std::fs::remove_file(path);
        }
    }
}

async fn run_blocking<T: Send + 'static>(
    f: impl FnOnce() -> std::io::Result<T> + Send + 'static,
) -> Result<T> {
    let joined = tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
    joined.map_err(Error::Spill)
}

#[derive(Serialize, Deserialize)]
struct SpilledEntry {
    op_delete: bool,
    key: Vec<u8>,
    value: Vec<u8>,
    old_value: Option<Vec<u8>>,
    start_ts: Ts,
    commit_ts: Ts,
    region_id: RegionId,
}

impl From<&RowEvent> for SpilledEntry {
    fn from(ev: &RowEvent) -> Self {
        Self {
            op_delete: ev.raw.op_type == OpType::Delete,
            key: ev.raw.key.to_vec(),
            value: ev.raw.value.to_vec(),
            old_value: ev.raw.old_value.as_ref().map(|v| v.to_vec()),
            start_ts: ev.start_ts,
            commit_ts: ev.commit_ts,
            region_id: ev.raw.region_id,
        }
    }
}

impl From<SpilledEntry> for RawKv {
    fn from(entry: SpilledEntry) -> Self {
        RawKv {
            op_type: if entry.op_delete {
                OpType::Delete
            } else {
                OpType::Put
            },
            key: entry.key.into(),
            value: entry.value.into(),
            old_value: entry.old_value.map(Into::into),
            start_ts: entry.start_ts,
            commit_ts: entry.commit_ts,
            region_id: entry.region_id,
        }
    }
}

fn write_run(path: &Path, entries: &[SpilledEntry]) -> std::io::Result<()> {
    let file = std::fs::File::create(path)?;
    let mut writer = BufWriter::new(file);
    for entry in entries {
        serde_json::to_writer(&mut writer, entry)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()
}

fn read_run(path: &Path) -> std::io::Result<Vec<SpilledEntry>> {
    let file = std::fs::File::open(path)?;
    let reader = BufReader::new(file);
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        entries.push(serde_json::from_str(&line)?);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::*;
    use super::super::SorterBuild;
    use super::*;

    fn build_spill_sorter(dir: PathBuf, threshold: u64) -> SorterBuild {
        let (input_tx, input_rx) = mpsc::channel(1024);
        let (output_tx, output_rx) = mpsc::channel(1024);
        SorterBuild {
            sorter: Box::new(SpillSorter::new(input_rx, output_tx, dir, 1, threshold)),
            input: input_tx,
            output: output_rx,
        }
    }

    #[tokio::test]
    async fn test_spill_every_run_matches_memory_order() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_sorter(
            build_spill_sorter(dir.path().to_owned(), 0),
            vec![
                row_event(1, 3, 30),
                row_event(1, 1, 10),
                row_event(1, 2, 20),
                resolved_event(25),
                row_event(1, 4, 40),
                resolved_event(45),
            ],
        )
        .await;
        assert_eq!(
            commit_ts_sequence(&out),
            vec![
                (false, 10),
                (false, 20),
                (true, 25),
                (false, 30),
                (false, 40),
                (true, 45)
            ]
        );
        // run files are removed once merged
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_large_threshold_never_spills() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_sorter(
            build_spill_sorter(dir.path().to_owned(), u64::MAX),
            vec![row_event(1, 2, 20), row_event(1, 1, 10), resolved_event(30)],
        )
        .await;
        assert_eq!(
            commit_ts_sequence(&out),
            vec![(false, 10), (false, 20), (true, 30)]
        );
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_spilled_entry_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0.run");
        let ev = match row_event(1, 5, 50) {
            PipelineEvent::Row(ev) => ev,
            _ => unreachable!(),
        };
        write_run(&path, &[(&*ev).into()]).unwrap();
        let back = read_run(&path).unwrap();
        assert_eq!(back.len(), 1);
        let raw: RawKv = back.into_iter().next().unwrap().into();
        assert_eq!(raw.commit_ts, 50);
        assert_eq!(raw.key, ev.raw.key);
    }
}
