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

//! End-to-end scenarios: a processor wired to the in-memory coordination
//! store, a scriptable event source, and a recording sink, driven the way
//! the owner and the upstream store would.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use pretty_assertions::assert_eq;

use rivulet_common::config::{ProcessorConfig, SortEngine};
use rivulet_common::event::{OpType, RawKv};
use rivulet_common::span::{meta_key, row_key};
use rivulet_common::types::{TableId, Ts};
use rivulet_connector::schema::{SchemaSnapshot, SchemaStorage, TableSchema};
use rivulet_connector::sink::{MemorySink, Sink, SinkRecord};
use rivulet_connector::source::mock::MockEventSource;
use rivulet_connector::source::EventSource;
use rivulet_coordination::keys;
use rivulet_coordination::mem::MemStore;
use rivulet_coordination::model::{
    self, AdminJobType, ChangeFeedStatus, OperationStatus, ReplicaInfo, TableOperation,
    TaskPosition, TaskStatus,
};
use rivulet_coordination::CoordinationStore;
use rivulet_processor::{Processor, ProcessorError, ProcessorHandle, ProcessorMetrics, ProcessorParams};

const CHANGEFEED: &str = "feed-1";
const CAPTURE: &str = "capture-1";
const WAIT: Duration = Duration::from_secs(60);

struct Harness {
    store: Arc<dyn CoordinationStore>,
    source: MockEventSource,
    sink: Arc<MemorySink>,
    handle: ProcessorHandle,
    runner: tokio::task::JoinHandle<rivulet_processor::Result<()>>,
}

impl Harness {
    async fn start(tables: &[(TableId, &str)]) -> Self {
        Self::start_with(tables, ProcessorConfig::default(), MemStore::new().into_shared()).await
    }

    async fn start_with(
        tables: &[(TableId, &str)],
        mut config: ProcessorConfig,
        store: Arc<dyn CoordinationStore>,
    ) -> Self {
        config.sort_engine = SortEngine::InMemory;
        let source = MockEventSource::new();
        let sink = Arc::new(MemorySink::new());
        let schemas = tables.iter().map(|(id, name)| TableSchema {
            id: *id,
            name: rivulet_common::types::TableName::new("db", *name),
        });
        let schema_storage = Arc::new(SchemaStorage::new(SchemaSnapshot::with_tables(schemas), 0));

        let processor = Processor::new(ProcessorParams {
            changefeed_id: CHANGEFEED.to_owned(),
            capture_id: CAPTURE.to_owned(),
            advertised_addr: "127.0.0.1:8300".to_owned(),
            config,
            store: store.clone(),
            source: Arc::new(source.clone()) as Arc<dyn EventSource>,
            sink: sink.clone() as Arc<dyn Sink>,
            schema_storage,
            metrics: ProcessorMetrics::for_test(),
        });
        let handle = processor.handle();
        let runner = tokio::spawn(processor.run());
        Self {
            store,
            source,
            sink,
            handle,
            runner,
        }
    }

    async fn stop(self) -> rivulet_processor::Result<()> {
        self.handle.stop();
        self.runner.await.expect("processor panicked")
    }

    async fn write_status(&self, f: impl FnOnce(&mut TaskStatus)) {
        let key = keys::task_status_key(CHANGEFEED, CAPTURE);
        let mut status = model::get_json::<TaskStatus>(self.store.as_ref(), &key)
            .await
            .unwrap()
            .map(|(status, _)| status)
            .unwrap_or_default();
        f(&mut status);
        model::put_json(self.store.as_ref(), &key, &status).await.unwrap();
    }

    async fn publish_global(&self, resolved_ts: Ts, checkpoint_ts: Ts) {
        let key = keys::job_key(CHANGEFEED);
        let status = ChangeFeedStatus {
            resolved_ts,
            checkpoint_ts,
        };
        model::put_json(self.store.as_ref(), &key, &status).await.unwrap();
    }

    async fn wait_subscriptions(&self, n: usize) {
        tokio::time::timeout(WAIT, self.source.wait_subscriptions(n))
            .await
            .unwrap_or_else(|_| panic!("timeout waiting for {n} source subscriptions"));
    }

    fn send_row(&self, table_id: TableId, handle: i64, commit_ts: Ts) {
        self.source.send(RawKv {
            op_type: OpType::Put,
            key: row_key(table_id, handle),
            value: Bytes::from(format!(r#"{{"id": {handle}}}"#)),
            old_value: None,
            start_ts: commit_ts - 1,
            commit_ts,
            region_id: 1,
        });
    }

    fn send_table_resolved(&self, table_id: TableId, ts: Ts) {
        self.source.send(RawKv::resolved(ts, 1, row_key(table_id, 0)));
    }

    fn send_ddl_resolved(&self, ts: Ts) {
        self.source.send(RawKv::resolved(ts, 1, meta_key()));
    }

    async fn position(&self) -> Option<TaskPosition> {
        let key = keys::task_position_key(CHANGEFEED, CAPTURE);
        model::get_json::<TaskPosition>(self.store.as_ref(), &key)
            .await
            .unwrap()
            .map(|(position, _)| position)
    }

    async fn status(&self) -> Option<TaskStatus> {
        let key = keys::task_status_key(CHANGEFEED, CAPTURE);
        model::get_json::<TaskStatus>(self.store.as_ref(), &key)
            .await
            .unwrap()
            .map(|(status, _)| status)
    }

    async fn wait_position(&self, what: &str, f: impl Fn(&TaskPosition) -> bool) -> TaskPosition {
        tokio::time::timeout(WAIT, async {
            loop {
                if let Some(position) = self.position().await {
                    if f(&position) {
                        return position;
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timeout waiting for position: {what}"))
    }

    async fn wait_status(&self, what: &str, f: impl Fn(&TaskStatus) -> bool) -> TaskStatus {
        tokio::time::timeout(WAIT, async {
            loop {
                if let Some(status) = self.status().await {
                    if f(&status) {
                        return status;
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timeout waiting for status: {what}"))
    }

    async fn wait_sink(&self, what: &str, f: impl Fn(&[SinkRecord]) -> bool) {
        tokio::time::timeout(WAIT, async {
            loop {
                if f(&self.sink.call_sequence()) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timeout waiting for sink: {what}"))
    }

    /// Add one plain table and wait for it to reach a steady checkpoint.
    async fn bootstrap_table(&self, table_id: TableId, sub_count: usize, steady_ts: Ts) {
        self.write_status(|status| {
            status.tables.insert(
                table_id,
                ReplicaInfo {
                    start_ts: 0,
                    mark_table_id: 0,
                },
            );
            status.operation.insert(table_id, TableOperation::default());
        })
        .await;
        self.wait_subscriptions(sub_count).await;
        self.send_ddl_resolved(1_000_000);
        self.send_row(table_id, 1, steady_ts - 50);
        self.send_table_resolved(table_id, steady_ts);
        self.publish_global(steady_ts, 0).await;
        self.wait_position("steady checkpoint", |p| p.checkpoint_ts == steady_ts)
            .await;
    }
}

fn flush_targets(records: &[SinkRecord]) -> Vec<(Ts, Ts)> {
    records
        .iter()
        .filter_map(|record| match record {
            SinkRecord::Flush { target, returned } => Some((*target, *returned)),
            SinkRecord::EmitRows(_) => None,
        })
        .collect()
}

fn emitted_commit_ts(records: &[SinkRecord]) -> Vec<Vec<Ts>> {
    records
        .iter()
        .filter_map(|record| match record {
            SinkRecord::EmitRows(rows) if !rows.is_empty() => {
                Some(rows.iter().map(|row| row.commit_ts).collect())
            }
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_single_table_add_steady_state() {
    let h = Harness::start(&[(99, "orders")]).await;
    h.write_status(|status| {
        status.tables.insert(
            99,
            ReplicaInfo {
                start_ts: 100,
                mark_table_id: 0,
            },
        );
        status.operation.insert(99, TableOperation::default());
    })
    .await;
    h.wait_subscriptions(2).await;

    h.send_ddl_resolved(1000);
    h.send_row(99, 1, 150);
    h.send_table_resolved(99, 200);
    h.publish_global(200, 0).await;

    let position = h
        .wait_position("checkpoint 200", |p| {
            p.checkpoint_ts == 200 && p.resolved_ts == 200
        })
        .await;
    assert!(position.error.is_none());

    h.wait_status("operation finished", |s| {
        s.operation
            .get(&99)
            .is_some_and(|op| op.status == OperationStatus::Finished && op.done)
    })
    .await;

    let records = h.sink.call_sequence();
    assert_eq!(emitted_commit_ts(&records), vec![vec![150]]);
    assert_eq!(flush_targets(&records), vec![(200, 200)]);
    let rows = h.sink.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].table.table, "orders");

    let sink = h.sink.clone();
    h.stop().await.unwrap();
    assert!(sink.is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_row_resolved_interleaving_law() {
    let h = Harness::start(&[(1, "t")]).await;
    h.write_status(|status| {
        status.tables.insert(1, ReplicaInfo::default());
        status.operation.insert(1, TableOperation::default());
    })
    .await;
    h.wait_subscriptions(2).await;
    h.send_ddl_resolved(1000);
    h.publish_global(1000, 0).await;

    h.send_row(1, 10, 10);
    h.send_row(1, 20, 20);
    h.send_table_resolved(1, 25);
    h.wait_sink("first flush", |records| {
        flush_targets(records).contains(&(25, 25))
    })
    .await;

    h.send_row(1, 30, 30);
    h.send_table_resolved(1, 40);
    h.wait_sink("second flush", |records| {
        flush_targets(records).contains(&(40, 40))
    })
    .await;

    let records = h.sink.call_sequence();
    assert_eq!(emitted_commit_ts(&records), vec![vec![10, 20], vec![30]]);
    assert_eq!(flush_targets(&records), vec![(25, 25), (40, 40)]);
    h.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_two_table_watermark_is_minimum() {
    let h = Harness::start(&[(1, "a"), (2, "b")]).await;
    h.write_status(|status| {
        status.tables.insert(1, ReplicaInfo::default());
        status.tables.insert(2, ReplicaInfo::default());
        status.operation.insert(1, TableOperation::default());
        status.operation.insert(2, TableOperation::default());
    })
    .await;
    h.wait_subscriptions(3).await;
    h.send_ddl_resolved(1000);
    h.publish_global(1000, 0).await;

    h.send_table_resolved(1, 50);
    h.send_table_resolved(2, 40);

    let position = h.wait_position("resolved 40", |p| p.resolved_ts >= 40).await;
    assert_eq!(position.resolved_ts, 40);
    h.wait_sink("flush 40", |records| {
        flush_targets(records).contains(&(40, 40))
    })
    .await;
    assert!(flush_targets(&h.sink.call_sequence())
        .iter()
        .all(|(target, _)| *target <= 40));
    h.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_delete_at_boundary() {
    let h = Harness::start(&[(99, "orders")]).await;
    h.bootstrap_table(99, 2, 200).await;

    h.write_status(|status| {
        status.tables.remove(&99);
        status.operation.insert(
            99,
            TableOperation {
                delete: true,
                boundary_ts: 180,
                done: false,
                status: OperationStatus::Dispatched,
            },
        );
    })
    .await;

    let status = h
        .wait_status("delete finished", |s| {
            s.operation.get(&99).is_some_and(|op| op.applied_done())
        })
        .await;
    // the boundary was lifted to the rectifier's terminal watermark
    assert!(status.operation[&99].boundary_ts >= 180);

    // events after removal no longer reach the sink
    let rows_before = h.sink.rows().len();
    h.send_row(99, 2, 250);
    h.send_table_resolved(99, 260);
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(h.sink.rows().len(), rows_before);
    h.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_delete_deferred_past_boundary() {
    let h = Harness::start(&[(99, "orders")]).await;
    h.bootstrap_table(99, 2, 200).await;

    h.write_status(|status| {
        status.tables.remove(&99);
        status.operation.insert(
            99,
            TableOperation {
                delete: true,
                boundary_ts: 300,
                done: false,
                status: OperationStatus::Dispatched,
            },
        );
    })
    .await;

    // boundary 300 > checkpoint 200: the operation must not even dispatch a
    // safe stop, and the table keeps replicating
    tokio::time::sleep(Duration::from_secs(3)).await;
    let status = h.status().await.unwrap();
    assert_eq!(status.operation[&99].status, OperationStatus::Dispatched);

    h.send_row(99, 2, 250);
    h.send_table_resolved(99, 320);
    h.publish_global(320, 200).await;
    h.wait_sink("row 250 replicated", |records| {
        emitted_commit_ts(records).iter().any(|batch| batch.contains(&250))
    })
    .await;

    // once the checkpoint crosses the boundary the table is removed
    h.wait_position("checkpoint 320", |p| p.checkpoint_ts >= 300).await;
    h.wait_status("delete finished", |s| {
        s.operation.get(&99).is_some_and(|op| op.applied_done())
    })
    .await;
    h.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_global_watermark_lagging_local() {
    let h = Harness::start(&[(1, "t")]).await;
    h.write_status(|status| {
        status.tables.insert(1, ReplicaInfo::default());
        status.operation.insert(1, TableOperation::default());
    })
    .await;
    h.wait_subscriptions(2).await;
    h.send_ddl_resolved(1000);

    h.send_table_resolved(1, 500);
    h.publish_global(300, 0).await;

    // the local watermark runs ahead, the flush is clamped by the global one
    let position = h
        .wait_position("resolved 500 checkpoint 300", |p| {
            p.resolved_ts == 500 && p.checkpoint_ts == 300
        })
        .await;
    assert_eq!(position.checkpoint_ts, 300);
    assert!(flush_targets(&h.sink.call_sequence())
        .iter()
        .all(|(target, _)| *target <= 300));
    h.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_table_readd_while_dying() {
    let h = Harness::start(&[(99, "orders")]).await;
    h.bootstrap_table(99, 2, 200).await;

    // delete in flight...
    h.write_status(|status| {
        status.tables.remove(&99);
        status.operation.insert(
            99,
            TableOperation {
                delete: true,
                boundary_ts: 180,
                done: false,
                status: OperationStatus::Dispatched,
            },
        );
    })
    .await;
    // ...and the owner changes its mind: re-add with a later start ts
    h.write_status(|status| {
        status.tables.insert(
            99,
            ReplicaInfo {
                start_ts: 400,
                mark_table_id: 0,
            },
        );
        status.operation.insert(99, TableOperation::default());
    })
    .await;

    // the replacement pipeline subscribes anew and replicates
    h.wait_subscriptions(3).await;
    h.send_row(99, 5, 500);
    h.send_table_resolved(99, 520);
    h.publish_global(520, 200).await;
    h.wait_sink("row 500 replicated", |records| {
        emitted_commit_ts(records).iter().any(|batch| batch.contains(&500))
    })
    .await;
    h.wait_status("re-add finished", |s| {
        s.operation.get(&99).is_some_and(|op| op.applied_done())
    })
    .await;
    h.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_target_ts_finishes_pipeline() {
    let mut config = ProcessorConfig::default();
    config.target_ts = 100;
    let h = Harness::start_with(&[(1, "t")], config, MemStore::new().into_shared()).await;
    h.write_status(|status| {
        status.tables.insert(1, ReplicaInfo::default());
        status.operation.insert(1, TableOperation::default());
    })
    .await;
    h.wait_subscriptions(2).await;
    h.send_ddl_resolved(1000);
    h.publish_global(1000, 0).await;

    h.send_row(1, 1, 50);
    h.send_row(1, 2, 150); // beyond the target: dropped
    h.send_table_resolved(1, 200);

    h.wait_position("resolved clamps to target", |p| p.resolved_ts == 100).await;
    h.wait_sink("row 50 flushed", |records| {
        flush_targets(records).iter().any(|(target, _)| *target == 100)
    })
    .await;
    let rows = h.sink.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].commit_ts, 50);
    h.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_admin_stop() {
    let h = Harness::start(&[]).await;
    h.wait_subscriptions(1).await;
    h.write_status(|status| {
        status.admin_job_type = AdminJobType::Stop;
    })
    .await;

    let result = h.runner.await.expect("processor panicked");
    assert!(matches!(result, Err(ProcessorError::AdminStop)));
    // a stopped capture releases its keys and closes the sink
    assert!(h
        .store
        .get(&keys::task_status_key(CHANGEFEED, CAPTURE))
        .await
        .unwrap()
        .is_none());
    assert!(h.sink.is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_cyclic_add_requires_mark_table() {
    let mut config = ProcessorConfig::default();
    config.cyclic.enabled = true;
    let h = Harness::start_with(&[(1, "t")], config, MemStore::new().into_shared()).await;
    h.write_status(|status| {
        status.tables.insert(1, ReplicaInfo::default());
        status.operation.insert(1, TableOperation::default());
    })
    .await;

    let result = h.runner.await.expect("processor panicked");
    assert!(matches!(result, Err(ProcessorError::MarkTableRequired(1))));

    // the fatal cause is recorded in the task position, which survives
    let position = model::get_json::<TaskPosition>(
        h.store.as_ref(),
        &keys::task_position_key(CHANGEFEED, CAPTURE),
    )
    .await
    .unwrap()
    .expect("position persisted")
    .0;
    let error = position.error.expect("error recorded");
    assert_eq!(error.code, "CDC:ErrMarkTableRequired");
    assert_eq!(error.addr, "127.0.0.1:8300");
}

/// A store that fails the first CAS write, exercising the conflict retry.
struct ConflictOnce {
    inner: Arc<MemStore>,
    remaining: std::sync::atomic::AtomicUsize,
}

#[async_trait::async_trait]
impl CoordinationStore for ConflictOnce {
    async fn get(&self, key: &str) -> rivulet_coordination::Result<Option<rivulet_coordination::KeyValue>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> rivulet_coordination::Result<i64> {
        self.inner.put(key, value).await
    }

    async fn put_cas(
        &self,
        key: &str,
        value: Vec<u8>,
        expected_mod_revision: i64,
    ) -> rivulet_coordination::Result<i64> {
        use std::sync::atomic::Ordering;
        if self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(rivulet_coordination::Error::Conflict {
                key: key.to_owned(),
            });
        }
        self.inner.put_cas(key, value, expected_mod_revision).await
    }

    async fn delete(&self, key: &str) -> rivulet_coordination::Result<()> {
        self.inner.delete(key).await
    }

    async fn watch(
        &self,
        key: &str,
        from_revision: i64,
    ) -> rivulet_coordination::Result<rivulet_coordination::WatchStream> {
        self.inner.watch(key, from_revision).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_status_write_conflict_retries() {
    let store = Arc::new(ConflictOnce {
        inner: MemStore::new().into_shared(),
        remaining: std::sync::atomic::AtomicUsize::new(1),
    });
    let h = Harness::start_with(
        &[(99, "orders")],
        ProcessorConfig::default(),
        store as Arc<dyn CoordinationStore>,
    )
    .await;
    h.write_status(|status| {
        status.tables.insert(99, ReplicaInfo::default());
        status.operation.insert(99, TableOperation::default());
    })
    .await;
    h.wait_subscriptions(2).await;
    h.send_ddl_resolved(1000);
    h.send_row(99, 1, 150);
    h.send_table_resolved(99, 200);
    h.publish_global(200, 0).await;

    // the loser re-reads, re-applies the scheduler and converges
    h.wait_status("operation finished despite conflict", |s| {
        s.operation.get(&99).is_some_and(|op| op.applied_done())
    })
    .await;
    h.wait_position("checkpoint 200", |p| p.checkpoint_ts == 200).await;
    h.stop().await.unwrap();
}
