//! Coin reconciliation loop.
//!
//! Discovers configured coins from the persisted store on a fixed interval
//! and drives each coin's live tracker lifecycle to match: a changed
//! endpoint list restarts the tracker, an emptied list tears it down, and
//! an unchanged list leaves a healthy tracker alone. The endpoint-list
//! comparison is order- and length-sensitive; reordering endpoints counts
//! as a change.
//!
//! Poll failures never stop the loop. The next poll is scheduled a fixed
//! delay after the previous one *completes*, so a slow or failing store
//! pushes polls out instead of stacking them.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{info, warn};

use coinlens_core::error::{ReconcileError, TrackerError};
use coinlens_core::store::{ExecuteOptions, Row, StoreClient};
use coinlens_core::traits::{LiveTracker, TrackerConnector};

use crate::config::ServeConfig;
use crate::registry::{Coin, CoinRegistry};

/// Drives the [`CoinRegistry`] from the store's coin-configuration table.
pub struct Reconciler {
    registry: Arc<CoinRegistry>,
    store: Arc<dyn StoreClient>,
    connector: Arc<dyn TrackerConnector>,
    coins_keyspace: String,
    poll_interval: Duration,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Reconciler {
    pub fn new(
        registry: Arc<CoinRegistry>,
        store: Arc<dyn StoreClient>,
        connector: Arc<dyn TrackerConnector>,
        config: &ServeConfig,
    ) -> Self {
        Self {
            registry,
            store,
            connector,
            coins_keyspace: config.coins_keyspace.clone(),
            poll_interval: config.poll_interval,
            shutdown: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Begin the reconciliation loop. No-op when already started.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let (shutdown, shutdown_rx) = watch::channel(false);
        *self.shutdown.lock() = Some(shutdown);
        let this = Arc::clone(self);
        *task = Some(tokio::spawn(this.run(shutdown_rx)));
        info!("coin reconciler started");
    }

    /// Halt the loop (waiting out any in-flight poll) and release every
    /// owned live tracker.
    pub async fn stop(&self) {
        let shutdown = self.shutdown.lock().take();
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(true);
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        for coin in self.registry.coins() {
            if let Some(tracker) = &coin.tracker {
                tracker.stop();
            }
        }
        self.registry.clear();
        info!("coin reconciler stopped");
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if let Err(e) = self.poll_once().await {
                warn!(error = %e, "coin reconciliation cycle failed");
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = sleep(self.poll_interval) => {}
            }
        }
    }

    /// One reconciliation cycle: load every configuration row and reconcile
    /// each coin as its own concurrent task, joining all before returning.
    ///
    /// A row failure is confined to that row's task; only a cycle-level
    /// failure (the configuration query itself) is returned.
    pub async fn poll_once(self: &Arc<Self>) -> Result<(), ReconcileError> {
        let query = format!("SELECT * FROM {}.available_coins", self.coins_keyspace);
        let result = self
            .store
            .execute(&query, &[], ExecuteOptions::default())
            .await?;

        let mut tasks = Vec::with_capacity(result.rows.len());
        for row in result.rows {
            let this = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                if let Err(e) = this.reconcile_row(&row).await {
                    warn!(error = %e, "coin reconciliation failed");
                }
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }

    /// Reconcile one coin against its configuration row.
    async fn reconcile_row(&self, row: &Row) -> Result<(), ReconcileError> {
        let name = row.string("name")?;
        let keyspace = row.string("key_space")?;
        let rpc_urls = row.string_list("rpc_urls")?;

        let existing = self.registry.get(&name);
        if let Some(coin) = &existing {
            // A coin with a non-empty list but no tracker means a previous
            // start failed; fall through and retry even though the list is
            // unchanged.
            let healthy =
                coin.rpc_urls == rpc_urls && (rpc_urls.is_empty() || coin.tracker.is_some());
            if healthy {
                if coin.keyspace != keyspace {
                    self.registry.insert(Coin {
                        name,
                        keyspace,
                        rpc_urls,
                        tracker: coin.tracker.clone(),
                    });
                }
                return Ok(());
            }
        }
        let previous = existing.and_then(|coin| coin.tracker.clone());

        if rpc_urls.is_empty() {
            self.registry.insert(Coin {
                name: name.clone(),
                keyspace,
                rpc_urls,
                tracker: None,
            });
            if let Some(previous) = previous {
                previous.stop();
                info!(coin = %name, "stopped live tracker (no rpc endpoints)");
            }
            return Ok(());
        }

        let started: Result<Arc<dyn LiveTracker>, TrackerError> = async {
            let tracker = self
                .connector
                .connect(&name, &keyspace, &rpc_urls)
                .await?;
            tracker.start().await?;
            Ok(tracker)
        }
        .await;

        match started {
            Ok(tracker) => {
                self.registry.insert(Coin {
                    name: name.clone(),
                    keyspace,
                    rpc_urls,
                    tracker: Some(tracker),
                });
                if let Some(previous) = previous {
                    previous.stop();
                }
                info!(coin = %name, "live tracker started");
                Ok(())
            }
            Err(e) => {
                // Record the new endpoints with no tracker: the missing
                // tracker makes the next cycle retry the start.
                self.registry.insert(Coin {
                    name: name.clone(),
                    keyspace,
                    rpc_urls,
                    tracker: None,
                });
                if let Some(previous) = previous {
                    previous.stop();
                }
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use coinlens_core::error::{GatewayError, StoreError};
    use coinlens_core::store::ResultSet;
    use coinlens_core::traits::LiveView;
    use coinlens_core::types::{BlockRef, Inpoint, MempoolTx, Outpoint, TxId};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // ------------------------------------------------------------------
    // Scripted store: serves the coin-configuration table
    // ------------------------------------------------------------------

    #[derive(Default)]
    struct ConfigStore {
        rows: Mutex<Vec<Row>>,
        unavailable: Mutex<bool>,
        cycles: AtomicUsize,
    }

    impl ConfigStore {
        fn set_rows(&self, rows: Vec<Row>) {
            *self.rows.lock() = rows;
        }
    }

    #[async_trait]
    impl StoreClient for ConfigStore {
        async fn execute(
            &self,
            _query: &str,
            _args: &[Value],
            _options: ExecuteOptions,
        ) -> Result<ResultSet, StoreError> {
            self.cycles.fetch_add(1, Ordering::SeqCst);
            if *self.unavailable.lock() {
                return Err(StoreError::Unavailable("connection refused".into()));
            }
            Ok(ResultSet {
                rows: self.rows.lock().clone(),
                paging_state: None,
            })
        }
    }

    fn coin_row(name: &str, urls: &[&str]) -> Row {
        Row::new()
            .with("name", json!(name))
            .with("key_space", json!(format!("{name}_ks")))
            .with("rpc_urls", json!(urls))
    }

    // ------------------------------------------------------------------
    // Scripted tracker and connector
    // ------------------------------------------------------------------

    struct CountingTracker {
        starts: AtomicUsize,
        stops: AtomicUsize,
        fail_start: bool,
    }

    impl CountingTracker {
        fn new(fail_start: bool) -> Arc<Self> {
            Arc::new(Self {
                starts: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
                fail_start,
            })
        }
    }

    impl LiveView for CountingTracker {
        fn has_transaction(&self, _txid: &TxId) -> bool {
            false
        }
        fn transaction(&self, _txid: &TxId) -> Option<MempoolTx> {
            None
        }
        fn block_by_height(&self, _height: u64) -> Option<BlockRef> {
            None
        }
        fn spending_inpoint(&self, _outpoint: &Outpoint) -> Option<Inpoint> {
            None
        }
    }

    #[async_trait]
    impl LiveTracker for CountingTracker {
        async fn start(&self) -> Result<(), TrackerError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_start {
                Err(GatewayError::AllEndpointsFailed("refused".into()).into())
            } else {
                Ok(())
            }
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Hands out one scripted tracker per connect call and remembers them
    /// per coin, in order.
    #[derive(Default)]
    struct ScriptedConnector {
        fail_start_for: Mutex<Vec<String>>,
        built: Mutex<HashMap<String, Vec<Arc<CountingTracker>>>>,
    }

    impl ScriptedConnector {
        fn built_for(&self, coin: &str) -> Vec<Arc<CountingTracker>> {
            self.built.lock().get(coin).cloned().unwrap_or_default()
        }
    }

    #[async_trait]
    impl TrackerConnector for ScriptedConnector {
        async fn connect(
            &self,
            coin: &str,
            _keyspace: &str,
            _rpc_urls: &[String],
        ) -> Result<Arc<dyn LiveTracker>, TrackerError> {
            let fail = self.fail_start_for.lock().contains(&coin.to_string());
            let tracker = CountingTracker::new(fail);
            self.built
                .lock()
                .entry(coin.to_string())
                .or_default()
                .push(Arc::clone(&tracker));
            Ok(tracker)
        }
    }

    fn reconciler(
        store: Arc<ConfigStore>,
        connector: Arc<ScriptedConnector>,
    ) -> (Arc<Reconciler>, Arc<CoinRegistry>) {
        let registry = Arc::new(CoinRegistry::new());
        let config = ServeConfig {
            poll_interval: Duration::from_millis(50),
            ..ServeConfig::default()
        };
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&registry),
            store,
            connector,
            &config,
        ));
        (reconciler, registry)
    }

    // ------------------------------------------------------------------
    // Per-row reconciliation
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn first_poll_starts_trackers() {
        let store = Arc::new(ConfigStore::default());
        store.set_rows(vec![coin_row("bitcoin", &["http://a", "http://b"])]);
        let connector = Arc::new(ScriptedConnector::default());
        let (reconciler, registry) = reconciler(store, Arc::clone(&connector));

        reconciler.poll_once().await.unwrap();

        let coin = registry.get("bitcoin").unwrap();
        assert_eq!(coin.keyspace, "bitcoin_ks");
        assert_eq!(coin.rpc_urls, vec!["http://a", "http://b"]);
        assert!(coin.tracker.is_some());
        let built = connector.built_for("bitcoin");
        assert_eq!(built.len(), 1);
        assert_eq!(built[0].starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unchanged_endpoints_do_not_restart() {
        let store = Arc::new(ConfigStore::default());
        store.set_rows(vec![coin_row("bitcoin", &["http://a", "http://b"])]);
        let connector = Arc::new(ScriptedConnector::default());
        let (reconciler, registry) = reconciler(store, Arc::clone(&connector));

        reconciler.poll_once().await.unwrap();
        let first = registry.get("bitcoin").unwrap();
        reconciler.poll_once().await.unwrap();
        reconciler.poll_once().await.unwrap();

        // Same tracker instance, started exactly once, never stopped.
        let second = registry.get("bitcoin").unwrap();
        let built = connector.built_for("bitcoin");
        assert_eq!(built.len(), 1);
        assert_eq!(built[0].starts.load(Ordering::SeqCst), 1);
        assert_eq!(built[0].stops.load(Ordering::SeqCst), 0);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn reordered_endpoints_restart_exactly_once() {
        let store = Arc::new(ConfigStore::default());
        store.set_rows(vec![coin_row("alpha", &["u1", "u2"])]);
        let connector = Arc::new(ScriptedConnector::default());
        let (reconciler, registry) = reconciler(Arc::clone(&store), Arc::clone(&connector));
        reconciler.poll_once().await.unwrap();

        store.set_rows(vec![coin_row("alpha", &["u2", "u1"])]);
        reconciler.poll_once().await.unwrap();

        let built = connector.built_for("alpha");
        assert_eq!(built.len(), 2);
        assert_eq!(built[0].stops.load(Ordering::SeqCst), 1);
        assert_eq!(built[1].starts.load(Ordering::SeqCst), 1);
        assert_eq!(built[1].stops.load(Ordering::SeqCst), 0);
        assert_eq!(registry.get("alpha").unwrap().rpc_urls, vec!["u2", "u1"]);

        // Seeing the same reordered list again is a no-op.
        reconciler.poll_once().await.unwrap();
        assert_eq!(connector.built_for("alpha").len(), 2);
    }

    #[tokio::test]
    async fn emptied_endpoints_stop_and_clear_tracker() {
        let store = Arc::new(ConfigStore::default());
        store.set_rows(vec![coin_row("bitcoin", &["http://a"])]);
        let connector = Arc::new(ScriptedConnector::default());
        let (reconciler, registry) = reconciler(Arc::clone(&store), Arc::clone(&connector));
        reconciler.poll_once().await.unwrap();

        store.set_rows(vec![coin_row("bitcoin", &[])]);
        reconciler.poll_once().await.unwrap();

        let coin = registry.get("bitcoin").unwrap();
        assert!(coin.tracker.is_none());
        assert!(coin.rpc_urls.is_empty());
        let built = connector.built_for("bitcoin");
        assert_eq!(built[0].stops.load(Ordering::SeqCst), 1);

        // Still empty next cycle: nothing to do, nothing new built.
        reconciler.poll_once().await.unwrap();
        assert_eq!(connector.built_for("bitcoin").len(), 1);
    }

    #[tokio::test]
    async fn null_endpoint_list_counts_as_empty() {
        let store = Arc::new(ConfigStore::default());
        store.set_rows(vec![Row::new()
            .with("name", json!("bitcoin"))
            .with("key_space", json!("bitcoin_ks"))
            .with("rpc_urls", Value::Null)]);
        let connector = Arc::new(ScriptedConnector::default());
        let (reconciler, registry) = reconciler(store, Arc::clone(&connector));

        reconciler.poll_once().await.unwrap();
        let coin = registry.get("bitcoin").unwrap();
        assert!(coin.tracker.is_none());
        assert!(connector.built_for("bitcoin").is_empty());
    }

    #[tokio::test]
    async fn keyspace_change_alone_preserves_tracker() {
        let store = Arc::new(ConfigStore::default());
        store.set_rows(vec![coin_row("bitcoin", &["http://a"])]);
        let connector = Arc::new(ScriptedConnector::default());
        let (reconciler, registry) = reconciler(Arc::clone(&store), Arc::clone(&connector));
        reconciler.poll_once().await.unwrap();

        store.set_rows(vec![Row::new()
            .with("name", json!("bitcoin"))
            .with("key_space", json!("bitcoin_v2"))
            .with("rpc_urls", json!(["http://a"]))]);
        reconciler.poll_once().await.unwrap();

        let coin = registry.get("bitcoin").unwrap();
        assert_eq!(coin.keyspace, "bitcoin_v2");
        assert!(coin.tracker.is_some());
        assert_eq!(connector.built_for("bitcoin").len(), 1);
    }

    // ------------------------------------------------------------------
    // Failure isolation
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn start_failure_leaves_no_tracker_and_retries_next_cycle() {
        let store = Arc::new(ConfigStore::default());
        store.set_rows(vec![coin_row("bitcoin", &["http://a"])]);
        let connector = Arc::new(ScriptedConnector::default());
        connector.fail_start_for.lock().push("bitcoin".into());
        let (reconciler, registry) = reconciler(store, Arc::clone(&connector));

        reconciler.poll_once().await.unwrap();
        let coin = registry.get("bitcoin").unwrap();
        assert!(coin.tracker.is_none());
        assert_eq!(coin.rpc_urls, vec!["http://a"]);

        // The endpoint list is unchanged but the tracker is missing, so the
        // next cycle retries; once starts succeed the coin comes up.
        connector.fail_start_for.lock().clear();
        reconciler.poll_once().await.unwrap();
        assert!(registry.get("bitcoin").unwrap().tracker.is_some());
        assert_eq!(connector.built_for("bitcoin").len(), 2);
    }

    #[tokio::test]
    async fn one_failing_coin_does_not_block_others() {
        let store = Arc::new(ConfigStore::default());
        store.set_rows(vec![
            coin_row("bitcoin", &["http://a"]),
            coin_row("litecoin", &["http://b"]),
        ]);
        let connector = Arc::new(ScriptedConnector::default());
        connector.fail_start_for.lock().push("bitcoin".into());
        let (reconciler, registry) = reconciler(store, Arc::clone(&connector));

        reconciler.poll_once().await.unwrap();
        assert!(registry.get("bitcoin").unwrap().tracker.is_none());
        assert!(registry.get("litecoin").unwrap().tracker.is_some());
    }

    #[tokio::test]
    async fn malformed_row_is_isolated() {
        let store = Arc::new(ConfigStore::default());
        store.set_rows(vec![
            // No name column: this row's task fails.
            Row::new().with("key_space", json!("broken_ks")),
            coin_row("litecoin", &["http://b"]),
        ]);
        let connector = Arc::new(ScriptedConnector::default());
        let (reconciler, registry) = reconciler(store, Arc::clone(&connector));

        reconciler.poll_once().await.unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.get("litecoin").unwrap().tracker.is_some());
    }

    #[tokio::test]
    async fn store_outage_leaves_registry_untouched() {
        let store = Arc::new(ConfigStore::default());
        store.set_rows(vec![coin_row("bitcoin", &["http://a"])]);
        let connector = Arc::new(ScriptedConnector::default());
        let (reconciler, registry) = reconciler(Arc::clone(&store), Arc::clone(&connector));
        reconciler.poll_once().await.unwrap();

        *store.unavailable.lock() = true;
        let err = reconciler.poll_once().await.unwrap_err();
        assert!(matches!(err, ReconcileError::Store(_)));

        // Previously started trackers keep running untouched.
        let coin = registry.get("bitcoin").unwrap();
        assert!(coin.tracker.is_some());
        let built = connector.built_for("bitcoin");
        assert_eq!(built[0].stops.load(Ordering::SeqCst), 0);
    }

    // ------------------------------------------------------------------
    // Loop lifecycle
    // ------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn loop_polls_and_stop_cancels_cleanly() {
        let store = Arc::new(ConfigStore::default());
        store.set_rows(vec![coin_row("bitcoin", &["http://a"])]);
        let connector = Arc::new(ScriptedConnector::default());
        let (reconciler, registry) = reconciler(Arc::clone(&store), Arc::clone(&connector));

        reconciler.start();
        // Double start is a no-op.
        reconciler.start();

        tokio::time::sleep(Duration::from_millis(175)).await;
        let cycles_while_running = store.cycles.load(Ordering::SeqCst);
        assert!(cycles_while_running >= 2);
        assert!(registry.get("bitcoin").unwrap().tracker.is_some());

        reconciler.stop().await;
        assert!(registry.is_empty());
        let built = connector.built_for("bitcoin");
        assert_eq!(built[0].stops.load(Ordering::SeqCst), 1);

        // No further cycles run after stop.
        let cycles_at_stop = store.cycles.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store.cycles.load(Ordering::SeqCst), cycles_at_stop);
    }
}
