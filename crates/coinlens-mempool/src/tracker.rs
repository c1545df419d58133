//! Per-coin live tracker.
//!
//! Maintains the in-memory view of one coin's recent chain state: mempool
//! transactions, blocks not yet visible in the persisted canonical chain,
//! and the spent-outpoint index derived from both. The three indices are
//! kept mutually consistent under one lock (a tracked transaction's inputs
//! are always reflected in the spent-outpoint index), but no consistency
//! with the persisted store is promised; the read path reconciles the two.
//!
//! `start` runs initial synchronization against the node gateway and then
//! keeps the view fresh from a background refresh task until `stop`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use coinlens_core::error::TrackerError;
use coinlens_core::store::{ExecuteOptions, StoreClient};
use coinlens_core::traits::{LiveTracker, LiveView};
use coinlens_core::types::{BlockRef, Inpoint, MempoolTx, Outpoint, TxId};

use crate::gateway::{ChainRpc, RpcBlock};

/// How many blocks below the node tip the tracker will index before giving
/// up on finding the persisted boundary. The store check is the real
/// boundary; this only bounds work when persistence lags badly.
const TRACKED_BLOCK_WINDOW: u64 = 20;

/// Delay between refresh passes while running.
const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    Stopped,
    Starting,
    Running,
}

/// A tracked recent block: chain position plus the ids of the transactions
/// indexed from it.
#[derive(Clone, Debug)]
struct TrackedBlock {
    summary: BlockRef,
    txids: Vec<TxId>,
}

/// The three read indices plus the bookkeeping needed to diff refreshes.
#[derive(Default)]
struct Indexes {
    block_by_height: HashMap<u64, TrackedBlock>,
    tx_by_id: HashMap<TxId, MempoolTx>,
    spent_outpoints: HashMap<Outpoint, Inpoint>,
    /// Ids currently in the node's mempool (as opposed to recent blocks).
    mempool_txids: HashSet<TxId>,
    /// Node tip as of the last completed block walk.
    synced_tip: Option<u64>,
}

impl Indexes {
    /// Index a transaction and its input spends in one critical section.
    fn insert_tx(&mut self, tx: MempoolTx) {
        for (index, vin) in tx.vin.iter().enumerate() {
            if let Some(outpoint) = vin.spent_outpoint() {
                self.spent_outpoints.insert(
                    outpoint,
                    Inpoint {
                        spending_txid: tx.txid.clone(),
                        spending_index: index as u32,
                    },
                );
            }
        }
        self.tx_by_id.insert(tx.txid.clone(), tx);
    }

    /// Drop a transaction together with its spent-outpoint entries.
    fn remove_tx(&mut self, txid: &TxId) {
        if let Some(tx) = self.tx_by_id.remove(txid) {
            for vin in &tx.vin {
                if let Some(outpoint) = vin.spent_outpoint() {
                    self.spent_outpoints.remove(&outpoint);
                }
            }
        }
    }

    fn in_tracked_block(&self, txid: &TxId) -> bool {
        self.block_by_height
            .values()
            .any(|block| block.txids.contains(txid))
    }

    /// Untrack a block, dropping its transactions unless they are still in
    /// the mempool or held by another tracked block.
    fn drop_block(&mut self, height: u64) {
        if let Some(block) = self.block_by_height.remove(&height) {
            for txid in block.txids {
                if !self.mempool_txids.contains(&txid) && !self.in_tracked_block(&txid) {
                    self.remove_tx(&txid);
                }
            }
        }
    }

    fn clear(&mut self) {
        *self = Indexes::default();
    }
}

/// The pieces the background refresh task shares with the tracker handle.
#[derive(Clone)]
struct Syncer {
    coin: String,
    keyspace: String,
    rpc: Arc<dyn ChainRpc>,
    store: Arc<dyn StoreClient>,
    indexes: Arc<RwLock<Indexes>>,
}

impl Syncer {
    async fn full_sync(&self) -> Result<(), TrackerError> {
        self.sync_mempool().await?;
        self.sync_recent_blocks(true).await?;
        Ok(())
    }

    async fn refresh(&self) -> Result<(), TrackerError> {
        self.sync_mempool().await?;
        self.sync_recent_blocks(false).await?;
        Ok(())
    }

    /// Diff the node's mempool ids against the view: fetch new
    /// transactions, drop departed ones.
    async fn sync_mempool(&self) -> Result<(), TrackerError> {
        let current: HashSet<TxId> = self.rpc.mempool_txids().await?.into_iter().collect();

        let (stale, missing) = {
            let idx = self.indexes.read();
            let stale: Vec<TxId> = idx
                .mempool_txids
                .iter()
                .filter(|txid| !current.contains(*txid))
                .cloned()
                .collect();
            let missing: Vec<TxId> = current
                .iter()
                .filter(|txid| !idx.tx_by_id.contains_key(*txid))
                .cloned()
                .collect();
            (stale, missing)
        };

        let mut fetched = Vec::with_capacity(missing.len());
        for txid in missing {
            match self.rpc.transaction(&txid).await {
                Ok(tx) => fetched.push(tx),
                // The transaction may have left the mempool between the id
                // listing and the detail fetch.
                Err(e) => {
                    debug!(coin = %self.coin, %txid, error = %e, "skipping mempool transaction")
                }
            }
        }

        let mut idx = self.indexes.write();
        for txid in stale {
            idx.mempool_txids.remove(&txid);
            if !idx.in_tracked_block(&txid) {
                idx.remove_tx(&txid);
            }
        }
        for tx in fetched {
            idx.mempool_txids.insert(tx.txid.clone());
            idx.insert_tx(tx);
        }
        Ok(())
    }

    /// Walk block heights down from the node tip, tracking every block the
    /// persisted canonical chain does not have yet.
    ///
    /// Stops at the first persisted height or after
    /// [`TRACKED_BLOCK_WINDOW`] blocks. Blocks that became persisted since
    /// the last walk are untracked.
    async fn sync_recent_blocks(&self, force: bool) -> Result<(), TrackerError> {
        let tip = self.rpc.block_count().await?;
        if !force && self.indexes.read().synced_tip == Some(tip) {
            return Ok(());
        }

        let floor = tip.saturating_sub(TRACKED_BLOCK_WINDOW);
        let mut tracked_heights = HashSet::new();
        let mut fetched: Vec<RpcBlock> = Vec::new();
        let mut height = tip;
        while height > floor {
            if self.is_persisted(height).await? {
                break;
            }
            tracked_heights.insert(height);
            let hash = self.rpc.block_hash(height).await?;
            let cached = self
                .indexes
                .read()
                .block_by_height
                .get(&height)
                .map(|block| block.summary.hash.clone());
            if cached.as_deref() != Some(hash.as_str()) {
                fetched.push(self.rpc.block(&hash).await?);
            }
            height -= 1;
        }

        let mut idx = self.indexes.write();
        let departed: Vec<u64> = idx
            .block_by_height
            .keys()
            .filter(|height| !tracked_heights.contains(*height))
            .copied()
            .collect();
        for height in departed {
            idx.drop_block(height);
        }
        for block in fetched {
            // Replaces any previously tracked block at this height (reorg).
            idx.drop_block(block.height);
            let txids: Vec<TxId> = block.tx.iter().map(|tx| tx.txid.clone()).collect();
            for tx in block.tx {
                idx.insert_tx(tx);
            }
            idx.block_by_height.insert(
                block.height,
                TrackedBlock {
                    summary: BlockRef {
                        hash: block.hash,
                        height: block.height,
                    },
                    txids,
                },
            );
        }
        idx.synced_tip = Some(tip);
        Ok(())
    }

    /// Whether the persisted canonical chain already has this height.
    async fn is_persisted(&self, height: u64) -> Result<bool, TrackerError> {
        let query = format!(
            "SELECT hash FROM {}.longest_chain WHERE height=?",
            self.keyspace
        );
        let result = self
            .store
            .execute(&query, &[json!(height)], ExecuteOptions::prepared())
            .await?;
        Ok(!result.rows.is_empty())
    }
}

struct RefreshHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Live tracker for one coin, bound to a node gateway.
pub struct MempoolTracker {
    coin: String,
    refresh_interval: Duration,
    lifecycle: Mutex<Lifecycle>,
    syncer: Syncer,
    refresh_task: Mutex<Option<RefreshHandle>>,
}

impl MempoolTracker {
    pub fn new(
        coin: &str,
        keyspace: &str,
        rpc: Arc<dyn ChainRpc>,
        store: Arc<dyn StoreClient>,
    ) -> Self {
        Self {
            coin: coin.to_owned(),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            lifecycle: Mutex::new(Lifecycle::Stopped),
            syncer: Syncer {
                coin: coin.to_owned(),
                keyspace: keyspace.to_owned(),
                rpc,
                store,
                indexes: Arc::new(RwLock::new(Indexes::default())),
            },
            refresh_task: Mutex::new(None),
        }
    }

    /// Override the refresh cadence (tests use a short interval).
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    fn indexes(&self) -> &RwLock<Indexes> {
        &self.syncer.indexes
    }
}

#[async_trait]
impl LiveTracker for MempoolTracker {
    async fn start(&self) -> Result<(), TrackerError> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle != Lifecycle::Stopped {
                return Err(TrackerError::AlreadyStarted);
            }
            *lifecycle = Lifecycle::Starting;
        }

        if let Err(e) = self.syncer.full_sync().await {
            self.indexes().write().clear();
            *self.lifecycle.lock() = Lifecycle::Stopped;
            return Err(e);
        }

        let running = {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle == Lifecycle::Starting {
                *lifecycle = Lifecycle::Running;
                true
            } else {
                false
            }
        };
        if !running {
            // stop() raced the initial sync; leave the tracker stopped.
            self.indexes().write().clear();
            return Ok(());
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let syncer = self.syncer.clone();
        let interval = self.refresh_interval;
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = sleep(interval) => {}
                }
                if let Err(e) = syncer.refresh().await {
                    warn!(coin = %syncer.coin, error = %e, "live tracker refresh failed");
                }
            }
        });
        *self.refresh_task.lock() = Some(RefreshHandle { shutdown, task });

        let idx = self.indexes().read();
        info!(
            coin = %self.coin,
            mempool_txs = idx.mempool_txids.len(),
            tracked_blocks = idx.block_by_height.len(),
            "live tracker running"
        );
        Ok(())
    }

    fn stop(&self) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle == Lifecycle::Stopped {
                return;
            }
            *lifecycle = Lifecycle::Stopped;
        }
        if let Some(handle) = self.refresh_task.lock().take() {
            let _ = handle.shutdown.send(true);
            handle.task.abort();
        }
        self.indexes().write().clear();
        info!(coin = %self.coin, "live tracker stopped");
    }
}

impl LiveView for MempoolTracker {
    fn has_transaction(&self, txid: &TxId) -> bool {
        self.indexes().read().tx_by_id.contains_key(txid)
    }

    fn transaction(&self, txid: &TxId) -> Option<MempoolTx> {
        self.indexes().read().tx_by_id.get(txid).cloned()
    }

    fn block_by_height(&self, height: u64) -> Option<BlockRef> {
        self.indexes()
            .read()
            .block_by_height
            .get(&height)
            .map(|block| block.summary.clone())
    }

    fn spending_inpoint(&self, outpoint: &Outpoint) -> Option<Inpoint> {
        self.indexes().read().spent_outpoints.get(outpoint).cloned()
    }
}

impl Drop for MempoolTracker {
    fn drop(&mut self) {
        if let Some(handle) = self.refresh_task.lock().take() {
            handle.task.abort();
        }
    }
}
