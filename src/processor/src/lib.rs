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

//! The changefeed processor.
//!
//! A processor replicates the tables one capture owns for one changefeed:
//! per table it runs a puller → sorter → rectifier chain, fans the per-table
//! watermarks into a local resolved ts, serializes all row events and
//! periodic watermarks through a single output queue into the sink, and
//! advances a monotone checkpoint bounded by the cluster-wide watermark the
//! owner publishes. Scheduling operations (add, safe-stop, remove) arrive
//! asynchronously through the coordination store and are applied by the
//! table scheduler under a compare-and-swap protocol.

mod coordinator;
mod ddl;
mod error;
mod merger;
mod metrics;
mod mounter;
mod pipeline;
mod processor;
mod rectifier;
mod scheduler;
mod sink_driver;
mod tracker;

pub use error::{ProcessorError, Result};
pub use metrics::ProcessorMetrics;
pub use processor::{Processor, ProcessorHandle, ProcessorParams};
pub use rectifier::RectifierStatus;
