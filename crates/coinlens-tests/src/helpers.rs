//! Shared test doubles and builders for integration tests.
//!
//! [`FakeStore`] is an in-memory stand-in for the persisted column store
//! that honors the real client's paging contract: it applies `fetch_size`,
//! applies ordinal lower-bound predicates, and returns a continuation
//! token exactly when rows remain beyond the page. [`FakeNode`] scripts a
//! coin node behind the gateway trait, and [`FakeTracker`]/[`FakeConnector`]
//! script tracker lifecycles for reconciler tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use coinlens_core::error::{GatewayError, StoreError, TrackerError};
use coinlens_core::store::{ExecuteOptions, PageState, ResultSet, Row, StoreClient};
use coinlens_core::traits::{LiveTracker, LiveView, TrackerConnector};
use coinlens_core::types::{
    BlockRef, Inpoint, MempoolTx, MempoolVin, MempoolVout, Outpoint, ScriptPubKey, TxId,
};
use coinlens_mempool::{ChainRpc, RpcBlock};

/// Install a test subscriber once per process; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

// ----------------------------------------------------------------------
// Row builders
// ----------------------------------------------------------------------

/// A coin-configuration row as the store returns it.
pub fn coin_row(name: &str, keyspace: &str, urls: &[&str]) -> Row {
    Row::new()
        .with("name", json!(name))
        .with("key_space", json!(keyspace))
        .with("rpc_urls", json!(urls))
}

/// A `transaction_input` row.
pub fn input_row(spending_txid: &str, spending_index: u32, prev: (&str, u32)) -> Row {
    Row::new()
        .with("coinbase", Value::Null)
        .with("scriptsig", json!("00ab"))
        .with("sequence", json!(4294967295u64))
        .with("txid", json!(prev.0))
        .with("vout", json!(prev.1))
        .with("spending_txid", json!(spending_txid))
        .with("spending_index", json!(spending_index))
}

/// A `transaction_output` row, optionally already spent.
pub fn output_row(txid: &str, n: u32, value: f64, spent_by: Option<(&str, u32)>) -> Row {
    let mut row = Row::new()
        .with("txid", json!(txid))
        .with("n", json!(n))
        .with("value", json!(value))
        .with(
            "scriptpubkey",
            json!({"hex": "76a914", "type": "pubkeyhash"}),
        );
    if let Some((spender, index)) = spent_by {
        row = row
            .with("spending_txid", json!(spender))
            .with("spending_index", json!(index));
    }
    row
}

/// A live transaction spending `spends` and creating `outputs` outputs.
pub fn mempool_tx(txid: &str, spends: &[(&str, u32)], outputs: u32) -> MempoolTx {
    MempoolTx {
        txid: TxId::from(txid),
        vin: spends
            .iter()
            .map(|(prev, vout)| MempoolVin {
                txid: Some(TxId::from(*prev)),
                vout: Some(*vout),
                ..MempoolVin::default()
            })
            .collect(),
        vout: (0..outputs)
            .map(|n| MempoolVout {
                value: f64::from(n) + 0.5,
                n,
                script_pub_key: ScriptPubKey {
                    hex: Some("76a914".into()),
                    script_type: Some("pubkeyhash".into()),
                    ..ScriptPubKey::default()
                },
            })
            .collect(),
    }
}

// ----------------------------------------------------------------------
// FakeStore
// ----------------------------------------------------------------------

#[derive(Default)]
struct FakeStoreState {
    coins: Vec<Row>,
    chain: HashMap<u64, Vec<Row>>,
    inputs: HashMap<String, BTreeMap<u32, Row>>,
    outputs: HashMap<String, BTreeMap<u32, Row>>,
}

/// In-memory persisted store honoring the paging contract.
#[derive(Default)]
pub struct FakeStore {
    state: Mutex<FakeStoreState>,
    unavailable: AtomicBool,
    pub queries: Mutex<Vec<String>>,
}

impl FakeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_coins(&self, rows: Vec<Row>) {
        self.state.lock().coins = rows;
    }

    pub fn add_chain_row(&self, height: u64, hash: &str) {
        self.state
            .lock()
            .chain
            .entry(height)
            .or_default()
            .push(Row::new().with("hash", json!(hash)).with("height", json!(height)));
    }

    pub fn add_input(&self, row: Row) {
        let txid = row.string("spending_txid").unwrap();
        let index = row.u32("spending_index").unwrap();
        self.state
            .lock()
            .inputs
            .entry(txid)
            .or_default()
            .insert(index, row);
    }

    pub fn add_output(&self, row: Row) {
        let txid = row.string("txid").unwrap();
        let n = row.u32("n").unwrap();
        self.state
            .lock()
            .outputs
            .entry(txid)
            .or_default()
            .insert(n, row);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

/// Apply an ordinal lower bound and fetch size the way the store does:
/// the continuation token is present exactly when rows remain.
fn paginate_table(
    table: Option<&BTreeMap<u32, Row>>,
    after: Option<u64>,
    options: ExecuteOptions,
) -> ResultSet {
    let Some(table) = table else {
        return ResultSet::default();
    };
    let matching: Vec<&Row> = table
        .iter()
        .filter(|(ordinal, _)| after.is_none_or(|bound| u64::from(**ordinal) > bound))
        .map(|(_, row)| row)
        .collect();
    let fetch = options
        .fetch_size
        .map_or(matching.len(), |size| size as usize);
    let rows: Vec<Row> = matching.iter().take(fetch).map(|row| (*row).clone()).collect();
    let has_more = matching.len() > rows.len();
    ResultSet {
        rows,
        paging_state: has_more.then(|| PageState(b"more".to_vec())),
    }
}

#[async_trait]
impl StoreClient for FakeStore {
    async fn execute(
        &self,
        query: &str,
        args: &[Value],
        options: ExecuteOptions,
    ) -> Result<ResultSet, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("fake store down".into()));
        }
        self.queries.lock().push(query.to_owned());
        let state = self.state.lock();
        if query.contains(".available_coins") {
            return Ok(ResultSet {
                rows: state.coins.clone(),
                paging_state: None,
            });
        }
        if query.contains(".longest_chain") {
            let height = args.first().and_then(Value::as_u64).unwrap_or_default();
            return Ok(ResultSet {
                rows: state.chain.get(&height).cloned().unwrap_or_default(),
                paging_state: None,
            });
        }
        if query.contains(".transaction_input") {
            let txid = args.first().and_then(Value::as_str).unwrap_or_default();
            let after = query
                .contains("spending_index>?")
                .then(|| args.get(1).and_then(Value::as_u64))
                .flatten();
            return Ok(paginate_table(state.inputs.get(txid), after, options));
        }
        if query.contains(".transaction_output") {
            let txid = args.first().and_then(Value::as_str).unwrap_or_default();
            let after = query
                .contains("n>?")
                .then(|| args.get(1).and_then(Value::as_u64))
                .flatten();
            return Ok(paginate_table(state.outputs.get(txid), after, options));
        }
        Err(StoreError::Query(format!("unrecognized query: {query}")))
    }
}

// ----------------------------------------------------------------------
// FakeNode (gateway-level double)
// ----------------------------------------------------------------------

/// Scripted coin node behind the [`ChainRpc`] trait.
#[derive(Default)]
pub struct FakeNode {
    pub mempool: Mutex<Vec<TxId>>,
    pub txs: Mutex<HashMap<TxId, MempoolTx>>,
    pub blocks: Mutex<Vec<RpcBlock>>,
    pub down: AtomicBool,
}

impl FakeNode {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_mempool_tx(&self, tx: MempoolTx) {
        self.mempool.lock().push(tx.txid.clone());
        self.txs.lock().insert(tx.txid.clone(), tx);
    }

    pub fn add_block(&self, hash: &str, height: u64, txs: Vec<MempoolTx>) {
        for tx in &txs {
            self.txs.lock().insert(tx.txid.clone(), tx.clone());
        }
        self.blocks.lock().push(RpcBlock {
            hash: hash.into(),
            height,
            tx: txs,
        });
    }

    fn check_up(&self) -> Result<(), GatewayError> {
        if self.down.load(Ordering::SeqCst) {
            Err(GatewayError::AllEndpointsFailed("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ChainRpc for FakeNode {
    async fn mempool_txids(&self) -> Result<Vec<TxId>, GatewayError> {
        self.check_up()?;
        Ok(self.mempool.lock().clone())
    }

    async fn transaction(&self, txid: &TxId) -> Result<MempoolTx, GatewayError> {
        self.check_up()?;
        self.txs
            .lock()
            .get(txid)
            .cloned()
            .ok_or_else(|| GatewayError::Rpc(format!("no such tx {txid}")))
    }

    async fn block_count(&self) -> Result<u64, GatewayError> {
        self.check_up()?;
        Ok(self
            .blocks
            .lock()
            .iter()
            .map(|block| block.height)
            .max()
            .unwrap_or(0))
    }

    async fn block_hash(&self, height: u64) -> Result<String, GatewayError> {
        self.check_up()?;
        self.blocks
            .lock()
            .iter()
            .rev()
            .find(|block| block.height == height)
            .map(|block| block.hash.clone())
            .ok_or_else(|| GatewayError::Rpc(format!("no block at {height}")))
    }

    async fn block(&self, hash: &str) -> Result<RpcBlock, GatewayError> {
        self.check_up()?;
        self.blocks
            .lock()
            .iter()
            .find(|block| block.hash == hash)
            .cloned()
            .ok_or_else(|| GatewayError::Rpc(format!("no block {hash}")))
    }
}

// ----------------------------------------------------------------------
// FakeTracker / FakeConnector (lifecycle doubles)
// ----------------------------------------------------------------------

/// Scripted live tracker recording its lifecycle.
#[derive(Default)]
pub struct FakeTracker {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub fail_start: AtomicBool,
    pub txs: Mutex<HashMap<TxId, MempoolTx>>,
    pub blocks: Mutex<HashMap<u64, BlockRef>>,
    pub spends: Mutex<HashMap<Outpoint, Inpoint>>,
}

impl FakeTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Index a transaction together with its input spends, the way a real
    /// tracker keeps the two consistent.
    pub fn insert_tx(&self, tx: MempoolTx) {
        for (index, vin) in tx.vin.iter().enumerate() {
            if let Some(outpoint) = vin.spent_outpoint() {
                self.spends.lock().insert(
                    outpoint,
                    Inpoint {
                        spending_txid: tx.txid.clone(),
                        spending_index: index as u32,
                    },
                );
            }
        }
        self.txs.lock().insert(tx.txid.clone(), tx);
    }

    pub fn insert_block(&self, hash: &str, height: u64) {
        self.blocks
            .lock()
            .insert(height, BlockRef { hash: hash.into(), height });
    }
}

impl LiveView for FakeTracker {
    fn has_transaction(&self, txid: &TxId) -> bool {
        self.txs.lock().contains_key(txid)
    }

    fn transaction(&self, txid: &TxId) -> Option<MempoolTx> {
        self.txs.lock().get(txid).cloned()
    }

    fn block_by_height(&self, height: u64) -> Option<BlockRef> {
        self.blocks.lock().get(&height).cloned()
    }

    fn spending_inpoint(&self, outpoint: &Outpoint) -> Option<Inpoint> {
        self.spends.lock().get(outpoint).cloned()
    }
}

#[async_trait]
impl LiveTracker for FakeTracker {
    async fn start(&self) -> Result<(), TrackerError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start.load(Ordering::SeqCst) {
            Err(GatewayError::AllEndpointsFailed("refused".into()).into())
        } else {
            Ok(())
        }
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out [`FakeTracker`]s and remembers every one built per coin.
#[derive(Default)]
pub struct FakeConnector {
    fail_start_for: Mutex<HashSet<String>>,
    seeded: Mutex<HashMap<String, Vec<Arc<FakeTracker>>>>,
    built: Mutex<HashMap<String, Vec<Arc<FakeTracker>>>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every tracker built for `coin` fail its start.
    pub fn fail_starts_for(&self, coin: &str, fail: bool) {
        let mut set = self.fail_start_for.lock();
        if fail {
            set.insert(coin.to_owned());
        } else {
            set.remove(coin);
        }
    }

    /// Queue a prepared tracker to hand out on the next connect for `coin`.
    pub fn seed_tracker(&self, coin: &str, tracker: Arc<FakeTracker>) {
        self.seeded
            .lock()
            .entry(coin.to_owned())
            .or_default()
            .push(tracker);
    }

    /// Every tracker built for `coin`, in construction order.
    pub fn built_for(&self, coin: &str) -> Vec<Arc<FakeTracker>> {
        self.built.lock().get(coin).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl TrackerConnector for FakeConnector {
    async fn connect(
        &self,
        coin: &str,
        _keyspace: &str,
        _rpc_urls: &[String],
    ) -> Result<Arc<dyn LiveTracker>, TrackerError> {
        let seeded = self
            .seeded
            .lock()
            .get_mut(coin)
            .and_then(|queue| (!queue.is_empty()).then(|| queue.remove(0)));
        let tracker = seeded.unwrap_or_else(FakeTracker::new);
        if self.fail_start_for.lock().contains(coin) {
            tracker.fail_start.store(true, Ordering::SeqCst);
        }
        self.built
            .lock()
            .entry(coin.to_owned())
            .or_default()
            .push(Arc::clone(&tracker));
        Ok(tracker)
    }
}
