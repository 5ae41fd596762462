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

use tokio::sync::watch;

/// A blurred byte budget shared by all pullers of a processor.
///
/// "Blurred": acquisition succeeds whenever usage is still below the quota,
/// so a single oversized entry may overshoot it. Acquisition suspends while
/// the quota is exhausted; there is no fairness guarantee among waiters.
pub struct MemoryLimiter {
    quota: u64,
    used: watch::Sender<u64>,
}

impl MemoryLimiter {
    pub fn new(quota: u64) -> Self {
        let (used, _) = watch::channel(0);
        Self { quota, used }
    }

    pub async fn acquire(&self, bytes: u64) {
        let mut rx = self.used.subscribe();
        loop {
            let mut acquired = false;
            self.used.send_if_modified(|used| {
                if *used < self.quota {
                    *used += bytes;
                    acquired = true;
                    true
                } else {
                    false
                }
            });
            if acquired {
                return;
            }
            // checks the current value first, so a release racing with the
            // attempt above cannot be missed
            let _ = rx.wait_for(|used| *used < self.quota).await;
        }
    }

    pub fn release(&self, bytes: u64) {
        self.used.send_modify(|used| *used = used.saturating_sub(bytes));
    }

    pub fn used(&self) -> u64 {
        *self.used.borrow()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_overshoot_then_block() {
        let limiter = Arc::new(MemoryLimiter::new(100));
        // blurred: a single large acquisition may exceed the quota
        limiter.acquire(1000).await;
        assert_eq!(limiter.used(), 1000);

        let blocked = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire(10).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        limiter.release(950);
        blocked.await.unwrap();
        assert_eq!(limiter.used(), 60);
    }

    #[tokio::test]
    async fn test_release_below_zero_saturates() {
        let limiter = MemoryLimiter::new(10);
        limiter.acquire(5).await;
        limiter.release(100);
        assert_eq!(limiter.used(), 0);
    }
}
