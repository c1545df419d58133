//! Core data model: transactions, outpoints, page items.
//!
//! Two families of types live here. The `Mempool*` structs are the live
//! tracker's view of a transaction and deserialize directly from a node's
//! verbose JSON-RPC output. `TransactionInput`/`TransactionOutput` are the
//! projected page items served to callers; their field set matches the
//! persisted store's column layout so a page reads identically no matter
//! which source produced it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Hex-encoded transaction identifier.
///
/// Treated as opaque; the service never parses or recomputes ids.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct TxId(pub String);

impl TxId {
    /// Borrow the inner hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TxId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for TxId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Reference to a specific output of a specific transaction.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Outpoint {
    /// Transaction containing the referenced output.
    pub txid: TxId,
    /// Index of the output within that transaction.
    pub vout: u32,
}

impl fmt::Display for Outpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

/// The spending side of an outpoint: which input of which transaction
/// consumes it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Inpoint {
    /// Transaction whose input spends the outpoint.
    pub spending_txid: TxId,
    /// Index of that input within the spending transaction.
    pub spending_index: u32,
}

/// Canonical-chain block summary: enough to answer "which block contains
/// this transaction".
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BlockRef {
    /// Block hash, hex-encoded.
    pub hash: String,
    /// Height of the block in the canonical chain.
    pub height: u64,
}

/// The parent entity a child query is asked about.
///
/// Handed in by the schema layer; `height` is `None` while the transaction
/// is unconfirmed.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub txid: TxId,
    pub height: Option<u64>,
}

/// Unlock script of an input as reported by the node.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ScriptSig {
    #[serde(default)]
    pub asm: String,
    #[serde(default)]
    pub hex: String,
}

/// Lock script of an output.
///
/// Serde names follow the node RPC (`reqSigs`, `type`); the store's column
/// spellings are accepted as aliases so the same struct decodes both.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ScriptPubKey {
    #[serde(default)]
    pub asm: Option<String>,
    #[serde(default)]
    pub hex: Option<String>,
    #[serde(rename = "reqSigs", alias = "reqsigs", default)]
    pub req_sigs: Option<u32>,
    #[serde(rename = "type", default)]
    pub script_type: Option<String>,
    #[serde(default)]
    pub addresses: Option<Vec<String>>,
}

/// One input of a live-tracked transaction.
///
/// Coinbase inputs carry `coinbase` and no previous outpoint.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct MempoolVin {
    #[serde(default)]
    pub coinbase: Option<String>,
    #[serde(default)]
    pub txid: Option<TxId>,
    #[serde(default)]
    pub vout: Option<u32>,
    #[serde(rename = "scriptSig", default)]
    pub script_sig: Option<ScriptSig>,
    #[serde(default)]
    pub sequence: Option<u64>,
}

impl MempoolVin {
    /// The outpoint this input spends, if it spends one (coinbase inputs
    /// do not).
    pub fn spent_outpoint(&self) -> Option<Outpoint> {
        match (&self.txid, self.vout) {
            (Some(txid), Some(vout)) => Some(Outpoint {
                txid: txid.clone(),
                vout,
            }),
            _ => None,
        }
    }
}

/// One output of a live-tracked transaction.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MempoolVout {
    pub value: f64,
    pub n: u32,
    #[serde(rename = "scriptPubKey", default)]
    pub script_pub_key: ScriptPubKey,
}

/// A transaction as held by a live tracker: full input/output detail,
/// decoded straight from the node's verbose transaction encoding.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MempoolTx {
    pub txid: TxId,
    #[serde(default)]
    pub vin: Vec<MempoolVin>,
    #[serde(default)]
    pub vout: Vec<MempoolVout>,
}

/// A transaction input page item.
///
/// `spending_txid`/`spending_index` locate this input itself; the optional
/// `txid`/`vout` pair is the outpoint it consumes (absent for coinbase).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TransactionInput {
    pub coinbase: Option<String>,
    pub scriptsig: Option<String>,
    pub sequence: Option<u64>,
    pub txid: Option<TxId>,
    pub vout: Option<u32>,
    pub spending_txid: TxId,
    pub spending_index: u32,
}

/// A transaction output page item.
///
/// `spending_txid`/`spending_index` are filled when the spend is known,
/// whether from the store or from a live tracker's spent-outpoint index.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TransactionOutput {
    pub txid: TxId,
    pub n: u32,
    pub value: f64,
    pub scriptpubkey: ScriptPubKey,
    pub spending_txid: Option<TxId>,
    pub spending_index: Option<u32>,
}

impl TransactionOutput {
    /// This output's own outpoint.
    pub fn outpoint(&self) -> Outpoint {
        Outpoint {
            txid: self.txid.clone(),
            vout: self.n,
        }
    }

    /// Whether spend information is already present.
    pub fn has_spend(&self) -> bool {
        self.spending_txid.is_some()
    }
}

/// One page of a paginated child sequence.
///
/// `has_more == false` guarantees no further items existed at call time;
/// live data may still grow between calls.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub has_more: bool,
}

/// Cursor into a transaction's input sequence: the ordinal of the last
/// input already returned.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct InputCursor {
    pub spending_index: u32,
}

/// Cursor into a transaction's output sequence: the ordinal of the last
/// output already returned.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutputCursor {
    pub n: u32,
}
