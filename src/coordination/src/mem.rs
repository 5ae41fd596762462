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

//! In-memory coordination store with etcd-compatible semantics: a global
//! revision counter, per-key modification revisions, replayable watches and
//! simulated compaction. Backs all tests; never used in production.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::{Error, Result};
use crate::store::{CoordinationStore, KeyValue, WatchEvent, WatchStream};

struct Core {
    revision: i64,
    compact_revision: i64,
    data: HashMap<String, (Vec<u8>, i64)>,
    log: Vec<WatchEvent>,
}

pub struct MemStore {
    core: Mutex<Core>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            core: Mutex::new(Core {
                revision: 0,
                compact_revision: 0,
                data: HashMap::new(),
                log: Vec::new(),
            }),
            events,
        }
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn current_revision(&self) -> i64 {
        self.core.lock().revision
    }

    /// Discard watch history up to `revision`, as an etcd compaction would.
    /// Watches starting below it will observe [`WatchEvent::Compacted`].
    pub fn compact(&self, revision: i64) {
        let mut core = self.core.lock();
        core.compact_revision = core.compact_revision.max(revision);
        let compacted = core.compact_revision;
        core.log.retain(|ev| event_revision(ev) > compacted);
    }

    fn publish(&self, core: &mut Core, event: WatchEvent) {
        core.log.push(event.clone());
        // send while holding the core lock so watchers observe a gap-free
        // revision order
        let _ = self.events.send(event);
    }
}

fn event_revision(event: &WatchEvent) -> i64 {
    match event {
        WatchEvent::Put(kv) => kv.mod_revision,
        WatchEvent::Delete { mod_revision, .. } => *mod_revision,
        WatchEvent::Compacted { compact_revision } => *compact_revision,
    }
}

fn event_key(event: &WatchEvent) -> Option<&str> {
    match event {
        WatchEvent::Put(kv) => Some(&kv.key),
        WatchEvent::Delete { key, .. } => Some(key),
        WatchEvent::Compacted { .. } => None,
    }
}

#[async_trait]
impl CoordinationStore for MemStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let core = self.core.lock();
        Ok(core.data.get(key).map(|(value, mod_revision)| KeyValue {
            key: key.to_owned(),
            value: value.clone(),
            mod_revision: *mod_revision,
        }))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<i64> {
        let mut core = self.core.lock();
        core.revision += 1;
        let revision = core.revision;
        core.data.insert(key.to_owned(), (value.clone(), revision));
        self.publish(
            &mut core,
            WatchEvent::Put(KeyValue {
                key: key.to_owned(),
                value,
                mod_revision: revision,
            }),
        );
        Ok(revision)
    }

    async fn put_cas(&self, key: &str, value: Vec<u8>, expected_mod_revision: i64) -> Result<i64> {
        let mut core = self.core.lock();
        let current = core.data.get(key).map(|(_, rev)| *rev).unwrap_or(0);
        if current != expected_mod_revision {
            return Err(Error::Conflict {
                key: key.to_owned(),
            });
        }
        core.revision += 1;
        let revision = core.revision;
        core.data.insert(key.to_owned(), (value.clone(), revision));
        self.publish(
            &mut core,
            WatchEvent::Put(KeyValue {
                key: key.to_owned(),
                value,
                mod_revision: revision,
            }),
        );
        Ok(revision)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut core = self.core.lock();
        if core.data.remove(key).is_some() {
            core.revision += 1;
            let revision = core.revision;
            self.publish(
                &mut core,
                WatchEvent::Delete {
                    key: key.to_owned(),
                    mod_revision: revision,
                },
            );
        }
        Ok(())
    }

    async fn watch(&self, key: &str, from_revision: i64) -> Result<WatchStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let core = self.core.lock();
            if from_revision < core.compact_revision {
                let _ = tx.send(Ok(WatchEvent::Compacted {
                    compact_revision: core.compact_revision,
                }));
                return Ok(UnboundedReceiverStream::new(rx).boxed());
            }

            let mut last_sent = from_revision;
            for event in &core.log {
                if event_key(event) == Some(key) && event_revision(event) > from_revision {
                    last_sent = event_revision(event);
                    let _ = tx.send(Ok(event.clone()));
                }
            }

            // subscribe under the lock: nothing can be published between the
            // replay above and the live feed below
            let mut live = self.events.subscribe();
            let key = key.to_owned();
            tokio::spawn(async move {
                loop {
                    match live.recv().await {
                        Ok(event) => {
                            if event_key(&event) != Some(key.as_str())
                                || event_revision(&event) <= last_sent
                            {
                                continue;
                            }
                            last_sent = event_revision(&event);
                            if tx.send(Ok(event)).is_err() {
                                return;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            // the watcher fell behind the retained history
                            let _ = tx.send(Ok(WatchEvent::Compacted {
                                compact_revision: last_sent,
                            }));
                            return;
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            });
        }
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}
