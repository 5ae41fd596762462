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

//! Edge-triggered, coalescing wake-up primitive.
//!
//! [`Notifier::notify`] is non-blocking; any number of notifications between
//! two ticks of a [`NotifyReceiver`] collapse into one, and each receiver
//! delivers at most one tick per its minimum interval. Used to debounce
//! watermark updates.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;

pub struct Notifier {
    // `None` after `stop()`; dropping the sender terminates all receivers.
    tx: Mutex<Option<watch::Sender<u64>>>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }

    /// Wake all receivers. Never blocks.
    pub fn notify(&self) {
        if let Some(tx) = self.tx.lock().as_ref() {
            tx.send_modify(|seq| *seq = seq.wrapping_add(1));
        }
    }

    /// Subscribe with a minimum inter-tick interval. May be called at any
    /// time; ticks notified before subscription are not replayed.
    pub fn receiver(&self, min_interval: Duration) -> Option<NotifyReceiver> {
        self.tx.lock().as_ref().map(|tx| NotifyReceiver {
            rx: tx.subscribe(),
            min_interval,
            last_tick: None,
        })
    }

    /// Terminate all receivers. Idempotent.
    pub fn stop(&self) {
        self.tx.lock().take();
    }
}

pub struct NotifyReceiver {
    rx: watch::Receiver<u64>,
    min_interval: Duration,
    last_tick: Option<Instant>,
}

impl NotifyReceiver {
    /// Wait for the next tick. Returns `None` once the notifier is stopped.
    pub async fn tick(&mut self) -> Option<()> {
        self.rx.changed().await.ok()?;
        if let Some(last) = self.last_tick {
            let elapsed = last.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        // everything notified while we were pacing collapses into this tick
        self.rx.borrow_and_update();
        self.last_tick = Some(Instant::now());
        Some(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_notifications_coalesce() {
        let notifier = Notifier::new();
        let mut rx = notifier.receiver(Duration::from_millis(50)).unwrap();
        for _ in 0..100 {
            notifier.notify();
        }
        assert_eq!(rx.tick().await, Some(()));
        // all hundred collapsed into the single tick above
        let pending = tokio::time::timeout(Duration::from_millis(200), rx.tick()).await;
        assert!(pending.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_interval_paces_ticks() {
        let notifier = Notifier::new();
        let mut rx = notifier.receiver(Duration::from_millis(50)).unwrap();
        notifier.notify();
        rx.tick().await.unwrap();
        let start = Instant::now();
        notifier.notify();
        rx.tick().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_stop_terminates_receivers() {
        let notifier = Notifier::new();
        let mut rx = notifier.receiver(Duration::from_millis(1)).unwrap();
        notifier.stop();
        notifier.stop();
        assert_eq!(rx.tick().await, None);
        assert!(notifier.receiver(Duration::from_millis(1)).is_none());
        // notify after stop is a no-op
        notifier.notify();
    }
}
