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

use prometheus::core::{AtomicU64, GenericCounter};
use prometheus::{
    register_gauge_with_registry, register_histogram_with_registry,
    register_int_counter_with_registry, register_int_gauge_with_registry, Gauge, Histogram,
    IntGauge, Registry,
};

pub struct ProcessorMetrics {
    pub registry: Registry,
    pub resolved_ts: IntGauge,
    pub checkpoint_ts: IntGauge,
    pub resolved_ts_lag_seconds: Gauge,
    pub checkpoint_ts_lag_seconds: Gauge,
    pub table_count: IntGauge,
    pub emitted_rows: GenericCounter<AtomicU64>,
    pub skipped_rows: GenericCounter<AtomicU64>,
    pub flush_duration_seconds: Histogram,
}

impl ProcessorMetrics {
    pub fn new(registry: Registry) -> Self {
        let resolved_ts = register_int_gauge_with_registry!(
            "processor_resolved_ts",
            "local resolved ts of the processor",
            &registry
        )
        .unwrap();

        let checkpoint_ts = register_int_gauge_with_registry!(
            "processor_checkpoint_ts",
            "checkpoint ts flushed to the sink",
            &registry
        )
        .unwrap();

        let resolved_ts_lag_seconds = register_gauge_with_registry!(
            "processor_resolved_ts_lag_seconds",
            "lag between wall clock and the local resolved ts",
            &registry
        )
        .unwrap();

        let checkpoint_ts_lag_seconds = register_gauge_with_registry!(
            "processor_checkpoint_ts_lag_seconds",
            "lag between wall clock and the checkpoint ts",
            &registry
        )
        .unwrap();

        let table_count = register_int_gauge_with_registry!(
            "processor_table_count",
            "tables currently replicated by this processor",
            &registry
        )
        .unwrap();

        let emitted_rows = register_int_counter_with_registry!(
            "processor_emitted_rows_total",
            "rows handed to the sink",
            &registry
        )
        .unwrap();

        let skipped_rows = register_int_counter_with_registry!(
            "processor_skipped_rows_total",
            "rows skipped because they could not be decoded",
            &registry
        )
        .unwrap();

        let flush_duration_seconds = register_histogram_with_registry!(
            "processor_flush_duration_seconds",
            "duration of sink flushes",
            &registry,
        )
        .unwrap();

        Self {
            registry,
            resolved_ts,
            checkpoint_ts,
            resolved_ts_lag_seconds,
            checkpoint_ts_lag_seconds,
            table_count,
            emitted_rows,
            skipped_rows,
            flush_duration_seconds,
        }
    }

    pub fn for_test() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::new(Registry::new()))
    }
}
