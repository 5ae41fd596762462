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

//! The upstream event-source contract.
//!
//! An [`EventSource`] provides an async stream of raw entries for a set of
//! key spans from a given start ts. The upstream guarantees that on any
//! single region it never emits a resolved entry whose ts is less than the
//! commit ts of a previously emitted entry.

use async_trait::async_trait;
use futures::stream::BoxStream;

use rivulet_common::event::RawKv;
use rivulet_common::span::KeySpan;
use rivulet_common::types::Ts;

use crate::error::Result;

pub type RawKvStream = BoxStream<'static, Result<RawKv>>;

#[async_trait]
pub trait EventSource: Send + Sync + 'static {
    /// Open a feed over `spans` replaying from `start_ts`. The stream ends
    /// when the subscription is dropped upstream.
    async fn open(&self, spans: Vec<KeySpan>, start_ts: Ts) -> Result<RawKvStream>;
}

pub mod mock {
    //! A scriptable event source for tests: entries pushed through the
    //! handle are routed to every open subscription whose spans contain the
    //! entry key.

    use std::sync::Arc;

    use futures::StreamExt;
    use parking_lot::Mutex;
    use tokio::sync::{mpsc, watch};
    use tokio_stream::wrappers::UnboundedReceiverStream;

    use rivulet_common::event::RawKv;
    use rivulet_common::span::KeySpan;
    use rivulet_common::types::Ts;

    use super::{EventSource, RawKvStream};
    use crate::error::Result;

    struct Subscription {
        spans: Vec<KeySpan>,
        tx: mpsc::UnboundedSender<Result<RawKv>>,
    }

    #[derive(Clone)]
    pub struct MockEventSource {
        subs: Arc<Mutex<Vec<Subscription>>>,
        sub_count: Arc<watch::Sender<usize>>,
    }

    impl Default for MockEventSource {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockEventSource {
        pub fn new() -> Self {
            let (sub_count, _) = watch::channel(0);
            Self {
                subs: Arc::new(Mutex::new(Vec::new())),
                sub_count: Arc::new(sub_count),
            }
        }

        /// Deliver an entry to all subscriptions covering its key.
        pub fn send(&self, raw: RawKv) {
            let mut subs = self.subs.lock();
            subs.retain(|sub| {
                if !sub.spans.iter().any(|span| span.contains(&raw.key)) {
                    return true;
                }
                sub.tx.send(Ok(raw.clone())).is_ok()
            });
        }

        /// Wait until at least `n` subscriptions have been opened since
        /// construction.
        pub async fn wait_subscriptions(&self, n: usize) {
            let mut rx = self.sub_count.subscribe();
            rx.wait_for(|count| *count >= n)
                .await
                .expect("mock source dropped");
        }
    }

    #[async_trait::async_trait]
    impl EventSource for MockEventSource {
        async fn open(&self, spans: Vec<KeySpan>, _start_ts: Ts) -> Result<RawKvStream> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.subs.lock().push(Subscription { spans, tx });
            self.sub_count.send_modify(|count| *count += 1);
            Ok(UnboundedReceiverStream::new(rx).boxed())
        }
    }
}
