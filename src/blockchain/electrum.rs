use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use bitcoin::{Amount, Script, ScriptBuf, Transaction, Txid};
use electrum_client::{Client, ConfigBuilder, ElectrumApi};
use futures::future::BoxFuture;
use tokio::task::spawn_blocking;

use crate::blockchain::{
    Blockchain, HeaderCallback, StatusCallback, Tip, TxHistory, TxHistoryEntry,
};

/// [`Blockchain`] implementation over a single Electrum server.
///
/// Request/reply calls run on the blocking pool. A polling task pings the
/// server and drains header and script notifications, dispatching the
/// registered callbacks from its own task so subscribers never re-enter
/// under their locks.
pub struct ElectrumBlockchain {
    inner: Arc<ElectrumInner>,
}

struct ElectrumInner {
    client: Arc<Client>,
    subscriptions: Mutex<HashMap<ScriptBuf, StatusCallback>>,
    header_callbacks: Mutex<Vec<HeaderCallback>>,
}

impl ElectrumBlockchain {
    const POLL_INTERVAL: Duration = Duration::from_secs(5);

    pub async fn new(url: String) -> Result<Self> {
        let config = ConfigBuilder::new().timeout(Some(10)).retry(2).build();

        let client = backoff::future::retry(
            ExponentialBackoff {
                max_elapsed_time: Some(Duration::from_secs(60)),
                ..ExponentialBackoff::default()
            },
            || {
                let url = url.clone();
                let config = config.clone();
                async move {
                    spawn_blocking(move || Client::from_config(&url, config))
                        .await
                        .map_err(|error| backoff::Error::permanent(anyhow!(error)))?
                        .map_err(|error| {
                            tracing::debug!(?error, "Failed to connect to electrum server, retrying");
                            backoff::Error::transient(anyhow!(
                                "failed to connect to electrum server: {error:?}"
                            ))
                        })
                }
            },
        )
        .await?;

        let inner = Arc::new(ElectrumInner {
            client: Arc::new(client),
            subscriptions: Mutex::new(HashMap::new()),
            header_callbacks: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Self::POLL_INTERVAL);
            loop {
                interval.tick().await;
                let inner = match weak.upgrade() {
                    Some(inner) => inner,
                    None => break,
                };
                let dispatches = match spawn_blocking(move || inner.poll()).await {
                    Ok(Ok(dispatches)) => dispatches,
                    Ok(Err(error)) => {
                        tracing::debug!(?error, "Failed to poll electrum server");
                        continue;
                    }
                    Err(_) => break,
                };
                for dispatch in dispatches {
                    tokio::spawn(dispatch);
                }
            }
        });

        Ok(Self { inner })
    }

    async fn blocking<T: Send + 'static>(
        &self,
        f: impl FnOnce(&Client) -> Result<T> + Send + 'static,
    ) -> Result<T> {
        let client = self.inner.client.clone();
        spawn_blocking(move || f(&client))
            .await
            .context("electrum task failed")?
    }
}

impl ElectrumInner {
    /// One poll round: ping, then drain header and script notifications
    /// into callback invocations for the caller to dispatch.
    fn poll(&self) -> Result<Vec<BoxFuture<'static, ()>>> {
        self.client
            .ping()
            .map_err(|error| anyhow!("failed to ping electrum server: {error:?}"))?;

        let mut dispatches = Vec::new();

        let latest_header = std::iter::from_fn(|| self.client.block_headers_pop().transpose())
            .last()
            .transpose()
            .map_err(|error| anyhow!("failed to pop header notification: {error:?}"))?;
        if let Some(notification) = latest_header {
            let tip = Tip {
                height: notification.height as u32,
            };
            for callback in self.header_callbacks.lock().expect("not poisoned").iter() {
                dispatches.push(callback(tip));
            }
        }

        let subscriptions: Vec<(ScriptBuf, StatusCallback)> = self
            .subscriptions
            .lock()
            .expect("not poisoned")
            .iter()
            .map(|(script, callback)| (script.clone(), callback.clone()))
            .collect();
        for (script, on_status) in subscriptions {
            let latest_status = std::iter::from_fn(|| self.client.script_pop(&script).transpose())
                .last()
                .transpose()
                .map_err(|error| anyhow!("failed to pop script notification: {error:?}"))?;
            if let Some(status) = latest_status {
                dispatches.push(on_status(hex::encode(*status)));
            }
        }

        Ok(dispatches)
    }
}

#[async_trait]
impl Blockchain for ElectrumBlockchain {
    async fn headers_subscribe(&self, on_header: HeaderCallback) -> Result<()> {
        self.inner
            .header_callbacks
            .lock()
            .expect("not poisoned")
            .push(on_header.clone());

        let notification = self
            .blocking(|client| {
                client.block_headers_subscribe().map_err(|error| {
                    anyhow!("failed to subscribe to header notifications: {error:?}")
                })
            })
            .await?;

        tokio::spawn(on_header(Tip {
            height: notification.height as u32,
        }));
        Ok(())
    }

    async fn estimate_fee(&self, blocks: u16) -> Result<Option<Amount>> {
        let btc_per_kb = self
            .blocking(move |client| {
                client
                    .estimate_fee(blocks as usize)
                    .map_err(|error| anyhow!("failed to estimate fee: {error:?}"))
            })
            .await?;

        if btc_per_kb < 0.0 {
            // The server has no estimate for this target.
            return Ok(None);
        }
        let fee_rate =
            Amount::from_btc(btc_per_kb).context("server returned an invalid fee rate")?;
        Ok(Some(fee_rate))
    }

    async fn relay_fee(&self) -> Result<Amount> {
        let btc_per_kb = self
            .blocking(|client| {
                client
                    .relay_fee()
                    .map_err(|error| anyhow!("failed to fetch the relay fee: {error:?}"))
            })
            .await?;
        Amount::from_btc(btc_per_kb).context("server returned an invalid relay fee")
    }

    async fn script_hash_subscribe(
        &self,
        script: &Script,
        on_status: StatusCallback,
    ) -> Result<()> {
        {
            let mut subscriptions = self.inner.subscriptions.lock().expect("not poisoned");
            if subscriptions.contains_key(script) {
                return Ok(());
            }
            subscriptions.insert(script.to_owned(), on_status.clone());
        }

        let script_buf = script.to_owned();
        let status = self
            .blocking(move |client| {
                client.script_subscribe(&script_buf).map_err(|error| {
                    anyhow!("failed to subscribe to script notifications: {error:?}")
                })
            })
            .await?;

        // Deliver the initial status from a separate task; the subscriber
        // may hold its lock across this call.
        let initial = status.map(|status| hex::encode(*status)).unwrap_or_default();
        tokio::spawn(on_status(initial));
        Ok(())
    }

    async fn script_hash_get_history(&self, script: &Script) -> Result<TxHistory> {
        let script_buf = script.to_owned();
        let history = self
            .blocking(move |client| {
                client
                    .script_get_history(&script_buf)
                    .map_err(|error| anyhow!("failed to get script history: {error:?}"))
            })
            .await?;

        Ok(TxHistory(
            history
                .into_iter()
                .map(|entry| TxHistoryEntry {
                    txid: entry.tx_hash,
                    height: entry.height,
                })
                .collect(),
        ))
    }

    async fn transaction_get(&self, txid: Txid) -> Result<Transaction> {
        self.blocking(move |client| {
            client
                .transaction_get(&txid)
                .map_err(|error| anyhow!("failed to fetch transaction {txid}: {error:?}"))
        })
        .await
    }

    async fn transaction_broadcast(&self, transaction: &Transaction) -> Result<Txid> {
        let transaction = transaction.clone();
        let txid = self
            .blocking(move |client| {
                client
                    .transaction_broadcast(&transaction)
                    .map_err(|error| anyhow!("failed to broadcast transaction: {error:?}"))
            })
            .await?;
        tracing::info!(%txid, "Broadcast transaction");
        Ok(txid)
    }
}
