//! Contract traits between crates.
//!
//! - [`LiveView`] — read contract of a coin's live tracker (coinlens-mempool implements)
//! - [`LiveTracker`] — lifecycle on top of [`LiveView`]
//! - [`TrackerConnector`] — builds a tracker for a coin's endpoints (coinlens-mempool implements)

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::TrackerError;
use crate::types::{BlockRef, Inpoint, MempoolTx, Outpoint, TxId};

/// Read-only view of one coin's live chain state: unconfirmed transactions
/// and blocks too recent to be guaranteed visible in the persisted store.
///
/// All lookups are non-blocking point reads. Absence is not an error; it
/// is the normal signal to fall back to the persisted store. The read path
/// routes every "is this served live?" decision through
/// [`has_transaction`](Self::has_transaction) so the source-selection rule
/// lives in one place.
pub trait LiveView: Send + Sync {
    /// Whether the view holds full detail for this transaction.
    fn has_transaction(&self, txid: &TxId) -> bool;

    /// Full input/output detail for an unconfirmed or very recent transaction.
    fn transaction(&self, txid: &TxId) -> Option<MempoolTx>;

    /// A recent block not yet guaranteed visible in the persisted canonical chain.
    fn block_by_height(&self, height: u64) -> Option<BlockRef>;

    /// The inpoint spending the given outpoint, when the spend is known
    /// only to the live view.
    fn spending_inpoint(&self, outpoint: &Outpoint) -> Option<Inpoint>;
}

/// A live tracker: a [`LiveView`] with an explicit start/stop lifecycle
/// bound to a node gateway connection.
#[async_trait]
pub trait LiveTracker: LiveView {
    /// Perform initial synchronization with the node and make the view
    /// queryable. On failure the tracker is left stopped.
    async fn start(&self) -> Result<(), TrackerError>;

    /// Release gateway resources and clear the view. Safe to call on an
    /// already-stopped tracker.
    fn stop(&self);
}

/// Builds an unstarted [`LiveTracker`] bound to a coin's RPC endpoints.
///
/// The reconciler goes through this seam so lifecycle logic can be
/// exercised without a node or a store.
#[async_trait]
pub trait TrackerConnector: Send + Sync {
    async fn connect(
        &self,
        coin: &str,
        keyspace: &str,
        rpc_urls: &[String],
    ) -> Result<Arc<dyn LiveTracker>, TrackerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    // ------------------------------------------------------------------
    // Mock: LiveView over plain maps
    // ------------------------------------------------------------------

    #[derive(Default)]
    struct MapView {
        txs: HashMap<TxId, MempoolTx>,
        blocks: HashMap<u64, BlockRef>,
        spends: HashMap<Outpoint, Inpoint>,
    }

    impl LiveView for MapView {
        fn has_transaction(&self, txid: &TxId) -> bool {
            self.txs.contains_key(txid)
        }

        fn transaction(&self, txid: &TxId) -> Option<MempoolTx> {
            self.txs.get(txid).cloned()
        }

        fn block_by_height(&self, height: u64) -> Option<BlockRef> {
            self.blocks.get(&height).cloned()
        }

        fn spending_inpoint(&self, outpoint: &Outpoint) -> Option<Inpoint> {
            self.spends.get(outpoint).cloned()
        }
    }

    // ------------------------------------------------------------------
    // Mock: lifecycle flag
    // ------------------------------------------------------------------

    struct FlagTracker {
        view: MapView,
        running: AtomicBool,
    }

    #[async_trait]
    impl LiveTracker for FlagTracker {
        async fn start(&self) -> Result<(), TrackerError> {
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&self) {
            self.running.store(false, Ordering::SeqCst);
        }
    }

    impl LiveView for FlagTracker {
        fn has_transaction(&self, txid: &TxId) -> bool {
            self.view.has_transaction(txid)
        }

        fn transaction(&self, txid: &TxId) -> Option<MempoolTx> {
            self.view.transaction(txid)
        }

        fn block_by_height(&self, height: u64) -> Option<BlockRef> {
            self.view.block_by_height(height)
        }

        fn spending_inpoint(&self, outpoint: &Outpoint) -> Option<Inpoint> {
            self.view.spending_inpoint(outpoint)
        }
    }

    #[test]
    fn absent_keys_are_none_not_errors() {
        let view = MapView::default();
        let txid = TxId::from("aa");
        assert!(!view.has_transaction(&txid));
        assert!(view.transaction(&txid).is_none());
        assert!(view.block_by_height(5).is_none());
        assert!(
            view.spending_inpoint(&Outpoint { txid, vout: 0 })
                .is_none()
        );
    }

    #[test]
    fn present_keys_resolve() {
        let mut view = MapView::default();
        let txid = TxId::from("aa");
        view.txs.insert(
            txid.clone(),
            MempoolTx { txid: txid.clone(), vin: vec![], vout: vec![] },
        );
        view.blocks.insert(7, BlockRef { hash: "bb".into(), height: 7 });
        view.spends.insert(
            Outpoint { txid: txid.clone(), vout: 1 },
            Inpoint { spending_txid: TxId::from("cc"), spending_index: 0 },
        );

        assert!(view.has_transaction(&txid));
        assert_eq!(view.transaction(&txid).unwrap().txid, txid);
        assert_eq!(view.block_by_height(7).unwrap().hash, "bb");
        assert_eq!(
            view.spending_inpoint(&Outpoint { txid, vout: 1 })
                .unwrap()
                .spending_txid,
            TxId::from("cc")
        );
    }

    #[tokio::test]
    async fn lifecycle_round_trip_and_idempotent_stop() {
        let tracker = FlagTracker { view: MapView::default(), running: AtomicBool::new(false) };
        tracker.start().await.unwrap();
        assert!(tracker.running.load(Ordering::SeqCst));
        tracker.stop();
        tracker.stop();
        assert!(!tracker.running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn tracker_usable_as_dyn() {
        let tracker: Arc<dyn LiveTracker> = Arc::new(FlagTracker {
            view: MapView::default(),
            running: AtomicBool::new(false),
        });
        tracker.start().await.unwrap();
        assert!(!tracker.has_transaction(&TxId::from("aa")));
        tracker.stop();
    }
}
