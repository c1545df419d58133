//! Dual-source read path for transaction child queries.
//!
//! Each query is answered by exactly one source. If the coin's live
//! tracker holds the parent transaction, the entire page is sliced from
//! memory; otherwise the persisted store is scanned. Cursors are ordinal
//! positions within the parent, not store page tokens, so a cursor minted
//! by one source stays valid when the other source answers the next call.
//!
//! The one exception to strict single-sourcing is spend back-references on
//! outputs: a persisted output whose spending transaction is still only in
//! the mempool gets its spend filled in from the live spent-outpoint
//! index. Persisted spend information is authoritative and never
//! overwritten.

use std::sync::Arc;

use serde_json::json;

use coinlens_core::error::{QueryError, RowError};
use coinlens_core::store::{ExecuteOptions, Row, StoreClient};
use coinlens_core::types::{
    BlockRef, InputCursor, MempoolTx, OutputCursor, Page, Transaction, TransactionInput,
    TransactionOutput, TxId,
};

use crate::registry::Coin;

/// Resolves a transaction's children: containing block, inputs, outputs.
pub struct TxResolver {
    store: Arc<dyn StoreClient>,
}

impl TxResolver {
    pub fn new(store: Arc<dyn StoreClient>) -> Self {
        Self { store }
    }

    /// The canonical-chain block containing the transaction, or `None`
    /// while it is unconfirmed.
    ///
    /// The tracker's block index covers blocks too recent to appear in the
    /// persisted canonical-chain table. Multiple persisted rows at one
    /// height (a fork) are resolved by taking the first row.
    pub async fn containing_block(
        &self,
        coin: &Coin,
        tx: &Transaction,
    ) -> Result<Option<BlockRef>, QueryError> {
        let Some(height) = tx.height else {
            return Ok(None);
        };
        if let Some(tracker) = &coin.tracker {
            if let Some(block) = tracker.block_by_height(height) {
                return Ok(Some(block));
            }
        }
        let query = format!(
            "SELECT * FROM {}.longest_chain WHERE height=?",
            coin.keyspace
        );
        let result = self
            .store
            .execute(&query, &[json!(height)], ExecuteOptions::prepared())
            .await?;
        let Some(row) = result.rows.first() else {
            return Ok(None);
        };
        Ok(Some(BlockRef {
            hash: row.string("hash")?,
            height: row.u64("height")?,
        }))
    }

    /// One page of the transaction's inputs, in spending-index order.
    pub async fn inputs(
        &self,
        coin: &Coin,
        tx: &Transaction,
        cursor: Option<InputCursor>,
        limit: usize,
    ) -> Result<Page<TransactionInput>, QueryError> {
        if let Some(live) = live_tx(coin, &tx.txid) {
            let start = cursor.map_or(0, |c| c.spending_index as usize + 1);
            return Ok(paginate_slice(&live.vin, start, limit, |ordinal, vin| {
                TransactionInput {
                    coinbase: vin.coinbase.clone(),
                    scriptsig: vin.script_sig.as_ref().map(|sig| sig.hex.clone()),
                    sequence: vin.sequence,
                    txid: vin.txid.clone(),
                    vout: vin.vout,
                    spending_txid: live.txid.clone(),
                    spending_index: ordinal as u32,
                }
            }));
        }

        let mut query = format!(
            "SELECT * FROM {}.transaction_input WHERE spending_txid=?",
            coin.keyspace
        );
        let mut args = vec![json!(tx.txid)];
        if let Some(cursor) = cursor {
            query.push_str(" AND spending_index>?");
            args.push(json!(cursor.spending_index));
        }
        let result = self
            .store
            .execute(
                &query,
                &args,
                ExecuteOptions::prepared_with_fetch_size(limit as i32),
            )
            .await?;
        let items = result
            .rows
            .iter()
            .map(input_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page {
            items,
            has_more: result.has_more_pages(),
        })
    }

    /// One page of the transaction's outputs, in output-index order, with
    /// spend back-references filled in where known.
    pub async fn outputs(
        &self,
        coin: &Coin,
        tx: &Transaction,
        cursor: Option<OutputCursor>,
        limit: usize,
    ) -> Result<Page<TransactionOutput>, QueryError> {
        if let Some(live) = live_tx(coin, &tx.txid) {
            let start = cursor.map_or(0, |c| c.n as usize + 1);
            let mut page = paginate_slice(&live.vout, start, limit, |ordinal, vout| {
                TransactionOutput {
                    txid: live.txid.clone(),
                    n: ordinal as u32,
                    value: vout.value,
                    scriptpubkey: vout.script_pub_key.clone(),
                    spending_txid: None,
                    spending_index: None,
                }
            });
            for output in &mut page.items {
                fill_spend(coin, output);
            }
            return Ok(page);
        }

        let mut query = format!(
            "SELECT * FROM {}.transaction_output WHERE txid=?",
            coin.keyspace
        );
        let mut args = vec![json!(tx.txid)];
        if let Some(cursor) = cursor {
            query.push_str(" AND n>?");
            args.push(json!(cursor.n));
        }
        let result = self
            .store
            .execute(
                &query,
                &args,
                ExecuteOptions::prepared_with_fetch_size(limit as i32),
            )
            .await?;
        let mut items = result
            .rows
            .iter()
            .map(output_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        for output in &mut items {
            fill_spend(coin, output);
        }
        Ok(Page {
            items,
            has_more: result.has_more_pages(),
        })
    }
}

/// Source selection, enforced in one place: the page is served from the
/// live tracker iff the tracker holds the parent transaction.
fn live_tx(coin: &Coin, txid: &TxId) -> Option<MempoolTx> {
    let tracker = coin.tracker.as_ref()?;
    if tracker.has_transaction(txid) {
        tracker.transaction(txid)
    } else {
        None
    }
}

/// Fill in an output's spend reference from the live spent-outpoint index.
///
/// Skipped when spend information is already present: persisted data, once
/// written, is authoritative.
fn fill_spend(coin: &Coin, output: &mut TransactionOutput) {
    if output.has_spend() {
        return;
    }
    let Some(tracker) = &coin.tracker else {
        return;
    };
    if let Some(inpoint) = tracker.spending_inpoint(&output.outpoint()) {
        output.spending_txid = Some(inpoint.spending_txid);
        output.spending_index = Some(inpoint.spending_index);
    }
}

/// Ordinal pagination over an in-memory child list.
///
/// Reproduces the persisted path's truncation exactly: starting at
/// `start`, take up to `limit` items; `has_more` is set only when an item
/// remains beyond the page.
fn paginate_slice<T, U>(
    items: &[T],
    start: usize,
    limit: usize,
    mut project: impl FnMut(usize, &T) -> U,
) -> Page<U> {
    let mut page = Vec::new();
    for (ordinal, item) in items.iter().enumerate().skip(start) {
        if page.len() == limit {
            return Page {
                items: page,
                has_more: true,
            };
        }
        page.push(project(ordinal, item));
    }
    Page {
        items: page,
        has_more: false,
    }
}

fn input_from_row(row: &Row) -> Result<TransactionInput, RowError> {
    Ok(TransactionInput {
        coinbase: row.opt_string("coinbase"),
        scriptsig: row.opt_string("scriptsig"),
        sequence: row.opt_u64("sequence"),
        txid: row.opt_string("txid").map(TxId::from),
        vout: row.opt_u32("vout"),
        spending_txid: TxId::from(row.string("spending_txid")?),
        spending_index: row.u32("spending_index")?,
    })
}

fn output_from_row(row: &Row) -> Result<TransactionOutput, RowError> {
    Ok(TransactionOutput {
        txid: TxId::from(row.string("txid")?),
        n: row.u32("n")?,
        value: row.f64("value")?,
        scriptpubkey: row.object("scriptpubkey")?,
        spending_txid: row.opt_string("spending_txid").map(TxId::from),
        spending_index: row.opt_u32("spending_index"),
    })
}
