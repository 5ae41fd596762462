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

//! Processor assembly: owns the shared core, spawns every long-running
//! task, propagates the first error through a capacity-1 channel, and tears
//! the changefeed down in order (task keys deleted, sink closed last).

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror_ext::AsReport;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use rivulet_common::config::ProcessorConfig;
use rivulet_common::event::{PipelineEvent, RowEvent};
use rivulet_common::limiter::MemoryLimiter;
use rivulet_common::notify::Notifier;
use rivulet_common::types::TableId;
use rivulet_connector::schema::SchemaStorage;
use rivulet_connector::sink::Sink;
use rivulet_connector::source::EventSource;
use rivulet_coordination::keys;
use rivulet_coordination::model::{self, PositionError, TaskPosition};
use rivulet_coordination::CoordinationStore;

use crate::coordinator::{
    flush_position, run_global_status_worker, run_position_worker, run_status_worker,
    run_workload_worker,
};
use crate::ddl::spawn_ddl_pipeline;
use crate::error::{ProcessorError, Result};
use crate::merger::run_output_merger;
use crate::metrics::ProcessorMetrics;
use crate::mounter::run_mounter_worker;
use crate::pipeline::TableInfo;
use crate::sink_driver::run_sink_driver;
use crate::tracker::{run_resolved_fanout, run_resolved_tracker};

pub struct ProcessorParams {
    pub changefeed_id: String,
    pub capture_id: String,
    pub advertised_addr: String,
    pub config: ProcessorConfig,
    pub store: Arc<dyn CoordinationStore>,
    pub source: Arc<dyn EventSource>,
    pub sink: Arc<dyn Sink>,
    pub schema_storage: Arc<SchemaStorage>,
    pub metrics: Arc<ProcessorMetrics>,
}

pub(crate) struct TableState {
    pub tables: HashMap<TableId, Arc<TableInfo>>,
    /// Mark table ids currently pulled alongside their owning tables; a
    /// mark id leaves the set iff its owning table is removed.
    pub mark_table_ids: HashSet<TableId>,
}

pub(crate) struct ProcessorCore {
    pub changefeed_id: String,
    pub capture_id: String,
    pub advertised_addr: String,
    pub config: ProcessorConfig,
    pub store: Arc<dyn CoordinationStore>,
    pub source: Arc<dyn EventSource>,
    pub sink: Arc<dyn Sink>,
    pub schema_storage: Arc<SchemaStorage>,
    pub limiter: Arc<MemoryLimiter>,
    pub metrics: Arc<ProcessorMetrics>,

    // single-scalar watermarks; anything composite is under a mutex
    pub local_resolved_ts: AtomicU64,
    pub global_resolved_ts: AtomicU64,
    pub global_checkpoint_ts: AtomicU64,
    pub sink_emitted_resolved_ts: AtomicU64,
    pub checkpoint_ts: AtomicU64,

    pub position: Mutex<TaskPosition>,
    pub last_flushed_position: Mutex<Option<Vec<u8>>>,
    pub status_mod_revision: AtomicI64,
    pub state: Mutex<TableState>,

    pub output_tx: mpsc::Sender<PipelineEvent>,
    pub output_rx: Mutex<Option<mpsc::Receiver<PipelineEvent>>>,
    pub mounter_tx: mpsc::Sender<Arc<RowEvent>>,
    pub mounter_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<RowEvent>>>,
    pub op_done_tx: mpsc::UnboundedSender<TableId>,
    pub op_done_rx: Mutex<Option<mpsc::UnboundedReceiver<TableId>>>,

    pub watermark_notifier: Notifier,
    pub local_resolved_notifier: Notifier,
    pub sink_emitted_notifier: Notifier,
    pub checkpoint_notifier: Notifier,
    pub pending_ops: AtomicBool,

    pub shutdown: CancellationToken,
    err_tx: mpsc::Sender<ProcessorError>,
    tasks: Mutex<JoinSet<()>>,
}

impl ProcessorCore {
    /// Report a task failure. The first error wins the capacity-1 channel
    /// and cancels the whole processor scope.
    pub fn report_error(&self, err: ProcessorError) {
        if err.is_cancelled() {
            return;
        }
        if self.err_tx.try_send(err).is_err() {
            // a first cause is already recorded
            debug!("subsequent processor error dropped");
        }
        self.shutdown.cancel();
    }

    /// Spawn a long-running task whose error tears the processor down.
    pub fn spawn_task<F>(self: &Arc<Self>, name: &'static str, fut: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let core = self.clone();
        self.tasks.lock().spawn(async move {
            match fut.await {
                Ok(()) => debug!(task = name, "task exited"),
                Err(err) => {
                    if !core.shutdown.is_cancelled() {
                        error!(task = name, error = %err.as_report(), "task failed");
                    }
                    core.report_error(err);
                }
            }
        });
    }
}

/// A handle to stop a running processor from outside.
#[derive(Clone)]
pub struct ProcessorHandle {
    shutdown: CancellationToken,
}

impl ProcessorHandle {
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

pub struct Processor {
    core: Arc<ProcessorCore>,
    err_rx: mpsc::Receiver<ProcessorError>,
}

impl Processor {
    pub fn new(params: ProcessorParams) -> Self {
        let (output_tx, output_rx) = mpsc::channel(params.config.output_channel_size);
        let (mounter_tx, mounter_rx) = mpsc::channel(params.config.mounter_input_channel_size);
        let (op_done_tx, op_done_rx) = mpsc::unbounded_channel();
        let (err_tx, err_rx) = mpsc::channel(1);
        let limiter = Arc::new(MemoryLimiter::new(params.config.puller_memory_limit));

        let core = Arc::new(ProcessorCore {
            changefeed_id: params.changefeed_id,
            capture_id: params.capture_id,
            advertised_addr: params.advertised_addr,
            config: params.config,
            store: params.store,
            source: params.source,
            sink: params.sink,
            schema_storage: params.schema_storage,
            limiter,
            metrics: params.metrics,
            local_resolved_ts: AtomicU64::new(0),
            global_resolved_ts: AtomicU64::new(0),
            global_checkpoint_ts: AtomicU64::new(0),
            sink_emitted_resolved_ts: AtomicU64::new(0),
            checkpoint_ts: AtomicU64::new(0),
            position: Mutex::new(TaskPosition::default()),
            last_flushed_position: Mutex::new(None),
            status_mod_revision: AtomicI64::new(0),
            state: Mutex::new(TableState {
                tables: HashMap::new(),
                mark_table_ids: HashSet::new(),
            }),
            output_tx,
            output_rx: Mutex::new(Some(output_rx)),
            mounter_tx,
            mounter_rx: tokio::sync::Mutex::new(mounter_rx),
            op_done_tx,
            op_done_rx: Mutex::new(Some(op_done_rx)),
            watermark_notifier: Notifier::new(),
            local_resolved_notifier: Notifier::new(),
            sink_emitted_notifier: Notifier::new(),
            checkpoint_notifier: Notifier::new(),
            pending_ops: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            err_tx,
            tasks: Mutex::new(JoinSet::new()),
        });
        Self { core, err_rx }
    }

    pub fn handle(&self) -> ProcessorHandle {
        ProcessorHandle {
            shutdown: self.core.shutdown.clone(),
        }
    }

    /// Run the processor until an admin stop, a fatal error, or an external
    /// [`ProcessorHandle::stop`].
    pub async fn run(mut self) -> Result<()> {
        let core = &self.core;
        self.restore_position().await?;

        core.spawn_task("position-worker", run_position_worker(core.clone()));
        core.spawn_task("global-status-worker", run_global_status_worker(core.clone()));
        core.spawn_task("status-worker", run_status_worker(core.clone()));
        core.spawn_task("resolved-tracker", run_resolved_tracker(core.clone()));
        core.spawn_task("resolved-fanout", run_resolved_fanout(core.clone()));
        core.spawn_task("sink-driver", run_sink_driver(core.clone()));
        core.spawn_task("sync-resolved", run_output_merger(core.clone()));
        core.spawn_task("collect-metrics", run_metrics_collector(core.clone()));
        core.spawn_task("workload-worker", run_workload_worker(core.clone()));
        for _ in 0..core.config.mounter.worker_num.max(1) {
            core.spawn_task("mounter", run_mounter_worker(core.clone()));
        }
        spawn_ddl_pipeline(core);

        info!(
            changefeed_id = %core.changefeed_id,
            capture_id = %core.capture_id,
            "processor started"
        );

        let first_err = tokio::select! {
            err = self.err_rx.recv() => err,
            _ = core.shutdown.cancelled() => None,
        };
        core.shutdown.cancel();

        // collapse the task set before touching shared state
        let mut tasks = { std::mem::take(&mut *core.tasks.lock()) };
        while tasks.join_next().await.is_some() {}

        self.teardown(first_err).await
    }

    async fn restore_position(&self) -> Result<()> {
        let position_key = keys::task_position_key(&self.core.changefeed_id, &self.core.capture_id);
        if let Some((position, _)) =
            model::get_json::<TaskPosition>(self.core.store.as_ref(), &position_key).await?
        {
            self.core
                .checkpoint_ts
                .store(position.checkpoint_ts, Ordering::Release);
            debug!(
                checkpoint_ts = position.checkpoint_ts,
                resolved_ts = position.resolved_ts,
                "restored task position"
            );
            *self.core.position.lock() = position;
        }
        Ok(())
    }

    /// Ordered teardown: record a fatal cause in the position, delete this
    /// capture's task keys, close the sink last.
    async fn teardown(&self, first_err: Option<ProcessorError>) -> Result<()> {
        let core = &self.core;
        let fatal = first_err
            .as_ref()
            .is_some_and(|err| !err.is_admin_stop() && !err.is_cancelled());
        if let Some(err) = &first_err {
            if fatal {
                core.position.lock().error = Some(PositionError {
                    code: err.code().to_owned(),
                    message: err.as_report().to_string(),
                    addr: core.advertised_addr.clone(),
                });
            }
        }
        // one last position flush, best effort
        if let Err(err) = flush_position(core, true).await {
            warn!(error = %err.as_report(), "final position flush failed");
        }

        if !fatal {
            // a cleanly stopped capture releases its keys
            for key in [
                keys::task_status_key(&core.changefeed_id, &core.capture_id),
                keys::task_position_key(&core.changefeed_id, &core.capture_id),
                keys::task_workload_key(&core.changefeed_id, &core.capture_id),
            ] {
                if let Err(err) = core.store.delete(&key).await {
                    warn!(key = %key, error = %err.as_report(), "failed to delete task key");
                }
            }
        }

        // the sink goes last
        if let Err(err) = core.sink.close().await {
            warn!(error = %err.as_report(), "sink close failed");
        }
        info!(changefeed_id = %core.changefeed_id, "processor stopped");

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

async fn run_metrics_collector(core: Arc<ProcessorCore>) -> Result<()> {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = core.shutdown.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }
        let now_millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64);
        let lag = |ts: u64| {
            if ts == 0 {
                0.0
            } else {
                let physical = rivulet_common::types::extract_physical_millis(ts);
                now_millis.saturating_sub(physical) as f64 / 1000.0
            }
        };
        core.metrics
            .resolved_ts_lag_seconds
            .set(lag(core.local_resolved_ts.load(Ordering::Acquire)));
        core.metrics
            .checkpoint_ts_lag_seconds
            .set(lag(core.checkpoint_ts.load(Ordering::Acquire)));
    }
}
