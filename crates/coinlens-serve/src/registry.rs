//! Coin registry: the process-wide table of configured coins.
//!
//! An owned object with explicit construction and teardown rather than
//! ambient module state, so independent instances can coexist (tests run
//! several) and shutdown is deterministic.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use coinlens_core::traits::LiveTracker;

/// One configured blockchain network.
///
/// Records are immutable snapshots: the reconciler installs a fresh
/// `Arc<Coin>` on every change, so a reader sees either the old or the new
/// record, never a half-updated one. The tracker reference is owned by the
/// record but its lifecycle is driven exclusively by the reconciler.
#[derive(Clone)]
pub struct Coin {
    /// Unique name; the registry key.
    pub name: String,
    /// Persisted-store keyspace holding this coin's chain history.
    pub keyspace: String,
    /// Ordered RPC endpoint list. Order matters: a reorder counts as a
    /// configuration change.
    pub rpc_urls: Vec<String>,
    /// Live tracker, present while the coin has working endpoints.
    pub tracker: Option<Arc<dyn LiveTracker>>,
}

impl fmt::Debug for Coin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coin")
            .field("name", &self.name)
            .field("keyspace", &self.keyspace)
            .field("rpc_urls", &self.rpc_urls)
            .field("tracker", &self.tracker.is_some())
            .finish()
    }
}

/// Registry of coins keyed by name.
///
/// Mutated only by the reconciler; the read path takes point-in-time
/// snapshots via [`get`](Self::get).
#[derive(Default)]
pub struct CoinRegistry {
    coins: RwLock<HashMap<String, Arc<Coin>>>,
}

impl CoinRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one coin's current record.
    pub fn get(&self, name: &str) -> Option<Arc<Coin>> {
        self.coins.read().get(name).cloned()
    }

    /// Install (or replace) a coin record.
    pub fn insert(&self, coin: Coin) {
        self.coins.write().insert(coin.name.clone(), Arc::new(coin));
    }

    /// Snapshots of every registered coin.
    pub fn coins(&self) -> Vec<Arc<Coin>> {
        self.coins.read().values().cloned().collect()
    }

    /// Names of every registered coin.
    pub fn names(&self) -> Vec<String> {
        self.coins.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.coins.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.coins.read().is_empty()
    }

    /// Drop every record. Trackers are not stopped here; teardown order is
    /// the reconciler's responsibility.
    pub fn clear(&self) {
        self.coins.write().clear();
    }
}
