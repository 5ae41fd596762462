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

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, EventType, Txn, TxnOp, WatchOptions,
};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::warn;

use crate::error::{Error, Result};
use crate::store::{CoordinationStore, KeyValue, WatchEvent, WatchStream};

/// Coordination store backed by an etcd cluster.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    pub async fn connect<S: AsRef<str>>(
        endpoints: impl AsRef<[S]>,
        options: Option<ConnectOptions>,
    ) -> Result<Self> {
        let client = Client::connect(endpoints, options).await?;
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let mut kv = self.client.kv_client();
        let resp = kv.get(key, None).await?;
        Ok(resp.kvs().first().map(|kv| KeyValue {
            key: key.to_owned(),
            value: kv.value().to_vec(),
            mod_revision: kv.mod_revision(),
        }))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<i64> {
        let mut kv = self.client.kv_client();
        let resp = kv.put(key, value, None).await?;
        Ok(resp.header().map(|h| h.revision()).unwrap_or(0))
    }

    async fn put_cas(&self, key: &str, value: Vec<u8>, expected_mod_revision: i64) -> Result<i64> {
        let mut kv = self.client.kv_client();
        // a missing key compares equal to mod revision 0, which matches the
        // `expected == 0` convention of the trait
        let txn = Txn::new()
            .when(vec![Compare::mod_revision(
                key,
                CompareOp::Equal,
                expected_mod_revision,
            )])
            .and_then(vec![TxnOp::put(key, value, None)]);
        let resp = kv.txn(txn).await?;
        if !resp.succeeded() {
            return Err(Error::Conflict {
                key: key.to_owned(),
            });
        }
        Ok(resp.header().map(|h| h.revision()).unwrap_or(0))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut kv = self.client.kv_client();
        kv.delete(key, None).await?;
        Ok(())
    }

    async fn watch(&self, key: &str, from_revision: i64) -> Result<WatchStream> {
        let mut watch_client = self.client.watch_client();
        let options = WatchOptions::new().with_start_revision(from_revision + 1);
        let (watcher, mut stream) = watch_client.watch(key, Some(options)).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            // hold the watcher for the lifetime of the stream
            let _watcher = watcher;
            while let Some(resp) = stream.next().await {
                let resp = match resp {
                    Ok(resp) => resp,
                    Err(err) => {
                        let _ = tx.send(Err(err.into()));
                        return;
                    }
                };
                if resp.compact_revision() > 0 {
                    let _ = tx.send(Ok(WatchEvent::Compacted {
                        compact_revision: resp.compact_revision(),
                    }));
                    return;
                }
                if resp.canceled() {
                    warn!("etcd watch canceled by server");
                    return;
                }
                for event in resp.events() {
                    let Some(kv) = event.kv() else {
                        continue;
                    };
                    let mapped = match event.event_type() {
                        EventType::Put => WatchEvent::Put(KeyValue {
                            key: String::from_utf8_lossy(kv.key()).into_owned(),
                            value: kv.value().to_vec(),
                            mod_revision: kv.mod_revision(),
                        }),
                        EventType::Delete => WatchEvent::Delete {
                            key: String::from_utf8_lossy(kv.key()).into_owned(),
                            mod_revision: kv.mod_revision(),
                        },
                    };
                    if tx.send(Ok(mapped)).is_err() {
                        return;
                    }
                }
            }
        });
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}
