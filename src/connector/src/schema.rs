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

//! Multi-version schema storage.
//!
//! Snapshots are keyed by the commit ts of the DDL job that produced them.
//! A reader asking for the schema at `ts` suspends until the storage's
//! resolved ts covers `ts`, guaranteeing the snapshot is final.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::debug;

use rivulet_common::event::{DdlEvent, DdlJobType};
use rivulet_common::types::{TableId, TableName, Ts};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub id: TableId,
    pub name: TableName,
}

#[derive(Debug, Default, Clone)]
pub struct SchemaSnapshot {
    tables: HashMap<TableId, TableSchema>,
}

impl SchemaSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_tables(tables: impl IntoIterator<Item = TableSchema>) -> Self {
        Self {
            tables: tables.into_iter().map(|t| (t.id, t)).collect(),
        }
    }

    pub fn table_by_id(&self, table_id: TableId) -> Option<&TableSchema> {
        self.tables.get(&table_id)
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }
}

pub struct SchemaStorage {
    /// Snapshots in ascending ts order; never empty.
    snapshots: RwLock<VecDeque<(Ts, Arc<SchemaSnapshot>)>>,
    resolved_ts: watch::Sender<Ts>,
}

impl SchemaStorage {
    pub fn new(initial: SchemaSnapshot, initial_ts: Ts) -> Self {
        let (resolved_ts, _) = watch::channel(initial_ts);
        let mut snapshots = VecDeque::new();
        snapshots.push_back((initial_ts, Arc::new(initial)));
        Self {
            snapshots: RwLock::new(snapshots),
            resolved_ts,
        }
    }

    pub fn resolved_ts(&self) -> Ts {
        *self.resolved_ts.borrow()
    }

    pub fn advance_resolved_ts(&self, ts: Ts) {
        self.resolved_ts.send_if_modified(|current| {
            if ts > *current {
                *current = ts;
                true
            } else {
                false
            }
        });
    }

    pub fn latest_snapshot(&self) -> Arc<SchemaSnapshot> {
        self.snapshots.read().back().expect("never empty").1.clone()
    }

    /// The read-consistent snapshot at `ts`. Suspends until the resolved ts
    /// covers `ts`; fails if the version has been gc'ed away.
    pub async fn snapshot_at(&self, ts: Ts) -> Result<Arc<SchemaSnapshot>> {
        {
            let mut rx = self.resolved_ts.subscribe();
            // the sender lives as long as `self`
            let _ = rx.wait_for(|resolved| *resolved >= ts).await;
        }
        let snapshots = self.snapshots.read();
        let (earliest, _) = snapshots.front().expect("never empty");
        match snapshots.iter().rev().find(|(snap_ts, _)| *snap_ts <= ts) {
            Some((_, snapshot)) => Ok(snapshot.clone()),
            None => Err(Error::SchemaCompacted {
                requested: ts,
                earliest: *earliest,
            }),
        }
    }

    /// Apply a DDL job. Jobs must arrive in commit-ts order; application
    /// failure is fatal to the changefeed.
    pub fn handle_ddl_job(&self, event: &DdlEvent) -> Result<()> {
        let mut snapshots = self.snapshots.write();
        let (last_ts, last) = snapshots.back().expect("never empty");
        if event.commit_ts <= *last_ts {
            return Err(Error::DdlApply {
                commit_ts: event.commit_ts,
                reason: format!("out of order: last applied ts {last_ts}"),
            });
        }

        let mut tables = last.tables.clone();
        let job = &event.job;
        let missing = |what: &str| Error::DdlApply {
            commit_ts: event.commit_ts,
            reason: format!("{what} (job {} on table {})", job.id, job.table_id),
        };
        match job.job_type {
            DdlJobType::CreateTable => {
                let prev = tables.insert(
                    job.table_id,
                    TableSchema {
                        id: job.table_id,
                        name: TableName::new(&job.schema_name, &job.table_name),
                    },
                );
                if prev.is_some() {
                    return Err(missing("create of an existing table"));
                }
            }
            DdlJobType::DropTable => {
                if tables.remove(&job.table_id).is_none() {
                    return Err(missing("drop of an unknown table"));
                }
            }
            DdlJobType::TruncateTable => {
                // truncation allocates a fresh table id upstream: retire any
                // table with the same name, install the new id
                let name = TableName::new(&job.schema_name, &job.table_name);
                tables.retain(|_, schema| schema.name != name);
                tables.insert(
                    job.table_id,
                    TableSchema {
                        id: job.table_id,
                        name,
                    },
                );
            }
            DdlJobType::RenameTable => {
                let schema = tables
                    .get_mut(&job.table_id)
                    .ok_or_else(|| missing("rename of an unknown table"))?;
                schema.name = TableName::new(&job.schema_name, &job.table_name);
            }
            DdlJobType::CreateSchema => {}
            DdlJobType::DropSchema => {
                tables.retain(|_, schema| schema.name.schema != job.schema_name);
            }
        }

        debug!(
            commit_ts = event.commit_ts,
            job_id = job.id,
            ?job.job_type,
            "applied ddl job"
        );
        snapshots.push_back((event.commit_ts, Arc::new(SchemaSnapshot { tables })));
        Ok(())
    }

    /// Drop snapshot versions no reader at or after `ts` can observe: all
    /// but the last snapshot with version ts at or below `ts`.
    pub fn do_gc(&self, ts: Ts) {
        let mut snapshots = self.snapshots.write();
        while snapshots.len() > 1 {
            if snapshots[1].0 <= ts {
                snapshots.pop_front();
            } else {
                break;
            }
        }
    }
}
