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

//! Drives sink flushes: whenever the sink-emitted watermark or the
//! cluster-wide one moves, flush to their minimum and advance the
//! checkpoint to whatever the sink reports durable.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use rivulet_connector::sink::Sink;

use crate::error::Result;
use crate::processor::ProcessorCore;

const FLUSH_DEBOUNCE: Duration = Duration::from_millis(50);
const SLOW_FLUSH_WARN: Duration = Duration::from_secs(3);

pub(crate) async fn run_sink_driver(core: Arc<ProcessorCore>) -> Result<()> {
    let Some(mut ticks) = core.sink_emitted_notifier.receiver(FLUSH_DEBOUNCE) else {
        return Ok(());
    };
    loop {
        tokio::select! {
            _ = core.shutdown.cancelled() => return Ok(()),
            tick = ticks.tick() => {
                if tick.is_none() {
                    return Ok(());
                }
            }
        }

        let emitted = core.sink_emitted_resolved_ts.load(Ordering::Acquire);
        let global = core.global_resolved_ts.load(Ordering::Acquire);
        let min_ts = emitted.min(global);
        if min_ts == 0 || min_ts <= core.checkpoint_ts.load(Ordering::Acquire) {
            continue;
        }

        let started = Instant::now();
        let flushed = core.sink.flush(min_ts).await?;
        let elapsed = started.elapsed();
        core.metrics
            .flush_duration_seconds
            .observe(elapsed.as_secs_f64());
        if elapsed > SLOW_FLUSH_WARN {
            warn!(target_ts = min_ts, ?elapsed, "sink flush is slow");
        }
        debug_assert!(flushed <= min_ts, "sink reported durability beyond target");

        let previous = core.checkpoint_ts.fetch_max(flushed, Ordering::AcqRel);
        if flushed > previous {
            core.metrics.checkpoint_ts.set(flushed as i64);
            debug!(checkpoint_ts = flushed, "checkpoint advanced");
            core.checkpoint_notifier.notify();
        }
    }
}
