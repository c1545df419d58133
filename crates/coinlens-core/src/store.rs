//! Consumed surface of the persisted column store.
//!
//! Confirmed chain history lives in a keyspace-partitioned column store
//! reached through a throttled client that is an external collaborator;
//! this module defines only the interface the service depends on. Queries
//! are parameterized strings with positional `?` markers. A result page
//! carries an opaque continuation token when more rows exist beyond the
//! fetch size; the token's presence, not the row count, is the
//! authoritative "more rows" signal.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{RowError, StoreError};

/// Opaque continuation token for a paginated scan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageState(pub Vec<u8>);

/// One column-keyed row of a result set.
///
/// Column values are JSON values; a JSON null is treated the same as an
/// absent column, matching the store's null semantics.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Row(Map<String, Value>);

impl Row {
    /// Empty row, extended with [`with`](Self::with).
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Builder-style column insert.
    pub fn with(mut self, column: &str, value: Value) -> Self {
        self.0.insert(column.to_owned(), value);
        self
    }

    /// Raw column value; `None` when the column is absent or null.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column).filter(|v| !v.is_null())
    }

    /// Required text column.
    pub fn string(&self, column: &'static str) -> Result<String, RowError> {
        self.opt_string(column)
            .ok_or(RowError::MissingColumn(column))
    }

    /// Optional text column.
    pub fn opt_string(&self, column: &str) -> Option<String> {
        self.get(column).and_then(Value::as_str).map(str::to_owned)
    }

    /// Required unsigned integer column.
    pub fn u64(&self, column: &'static str) -> Result<u64, RowError> {
        self.opt_u64(column).ok_or(RowError::MissingColumn(column))
    }

    /// Optional unsigned integer column.
    pub fn opt_u64(&self, column: &str) -> Option<u64> {
        self.get(column).and_then(Value::as_u64)
    }

    /// Required 32-bit ordinal column.
    pub fn u32(&self, column: &'static str) -> Result<u32, RowError> {
        let raw = self.u64(column)?;
        u32::try_from(raw).map_err(|_| RowError::InvalidColumn {
            column,
            reason: format!("{raw} out of range"),
        })
    }

    /// Optional 32-bit ordinal column.
    pub fn opt_u32(&self, column: &str) -> Option<u32> {
        self.opt_u64(column).and_then(|raw| u32::try_from(raw).ok())
    }

    /// Required floating-point column.
    pub fn f64(&self, column: &'static str) -> Result<f64, RowError> {
        self.get(column)
            .and_then(Value::as_f64)
            .ok_or(RowError::MissingColumn(column))
    }

    /// Text-list column. Absent and null both decode to the empty list;
    /// a present non-list value is an error.
    pub fn string_list(&self, column: &'static str) -> Result<Vec<String>, RowError> {
        let Some(value) = self.get(column) else {
            return Ok(Vec::new());
        };
        let items = value.as_array().ok_or_else(|| RowError::InvalidColumn {
            column,
            reason: "expected a list".into(),
        })?;
        items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| RowError::InvalidColumn {
                        column,
                        reason: "expected a list of text".into(),
                    })
            })
            .collect()
    }

    /// Structured column decoded into `T` (used for script objects).
    pub fn object<T: DeserializeOwned>(&self, column: &'static str) -> Result<T, RowError> {
        let value = self
            .get(column)
            .cloned()
            .ok_or(RowError::MissingColumn(column))?;
        serde_json::from_value(value).map_err(|e| RowError::InvalidColumn {
            column,
            reason: e.to_string(),
        })
    }
}

/// Per-execution options.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Use a prepared statement.
    pub prepare: bool,
    /// Bound on rows fetched in this page; `None` uses the client default.
    pub fetch_size: Option<i32>,
}

impl ExecuteOptions {
    /// Prepared statement, default fetch size.
    pub fn prepared() -> Self {
        Self {
            prepare: true,
            fetch_size: None,
        }
    }

    /// Prepared statement with an explicit fetch size.
    pub fn prepared_with_fetch_size(fetch_size: i32) -> Self {
        Self {
            prepare: true,
            fetch_size: Some(fetch_size),
        }
    }
}

/// An ordered page of rows plus the continuation token, if any.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResultSet {
    pub rows: Vec<Row>,
    pub paging_state: Option<PageState>,
}

impl ResultSet {
    /// Whether the store signalled rows beyond this page.
    pub fn has_more_pages(&self) -> bool {
        self.paging_state.is_some()
    }
}

/// The persisted store's entire consumed surface.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Execute a parameterized query and return one page of rows.
    async fn execute(
        &self,
        query: &str,
        args: &[Value],
        options: ExecuteOptions,
    ) -> Result<ResultSet, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ------------------------------------------------------------------
    // Row accessors
    // ------------------------------------------------------------------

    #[test]
    fn string_and_missing() {
        let row = Row::new().with("name", json!("bitcoin"));
        assert_eq!(row.string("name").unwrap(), "bitcoin");
        assert_eq!(
            row.string("keyspace").unwrap_err(),
            RowError::MissingColumn("keyspace")
        );
    }

    #[test]
    fn null_counts_as_absent() {
        let row = Row::new().with("spending_txid", Value::Null);
        assert!(row.get("spending_txid").is_none());
        assert_eq!(row.opt_string("spending_txid"), None);
    }

    #[test]
    fn u32_rejects_out_of_range() {
        let row = Row::new().with("n", json!(u64::from(u32::MAX) + 1));
        assert!(matches!(
            row.u32("n").unwrap_err(),
            RowError::InvalidColumn { column: "n", .. }
        ));
    }

    #[test]
    fn u32_accepts_ordinal() {
        let row = Row::new().with("n", json!(7));
        assert_eq!(row.u32("n").unwrap(), 7);
        assert_eq!(row.opt_u32("n"), Some(7));
    }

    #[test]
    fn string_list_null_is_empty() {
        let row = Row::new().with("rpc_urls", Value::Null);
        assert_eq!(row.string_list("rpc_urls").unwrap(), Vec::<String>::new());
        assert_eq!(Row::new().string_list("rpc_urls").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn string_list_decodes_in_order() {
        let row = Row::new().with("rpc_urls", json!(["http://a", "http://b"]));
        assert_eq!(row.string_list("rpc_urls").unwrap(), vec!["http://a", "http://b"]);
    }

    #[test]
    fn string_list_rejects_non_list() {
        let row = Row::new().with("rpc_urls", json!("http://a"));
        assert!(matches!(
            row.string_list("rpc_urls").unwrap_err(),
            RowError::InvalidColumn { column: "rpc_urls", .. }
        ));
    }

    #[test]
    fn object_decodes_script() {
        use crate::types::ScriptPubKey;
        let row = Row::new().with("scriptpubkey", json!({"hex": "76a9", "type": "pubkeyhash"}));
        let spk: ScriptPubKey = row.object("scriptpubkey").unwrap();
        assert_eq!(spk.hex.as_deref(), Some("76a9"));
    }

    // ------------------------------------------------------------------
    // Options and result sets
    // ------------------------------------------------------------------

    #[test]
    fn execute_options_builders() {
        assert_eq!(
            ExecuteOptions::prepared(),
            ExecuteOptions { prepare: true, fetch_size: None }
        );
        assert_eq!(
            ExecuteOptions::prepared_with_fetch_size(25),
            ExecuteOptions { prepare: true, fetch_size: Some(25) }
        );
    }

    #[test]
    fn has_more_pages_tracks_token() {
        let mut rs = ResultSet::default();
        assert!(!rs.has_more_pages());
        rs.paging_state = Some(PageState(vec![1, 2, 3]));
        assert!(rs.has_more_pages());
    }

    // ------------------------------------------------------------------
    // Object safety
    // ------------------------------------------------------------------

    struct EmptyStore;

    #[async_trait]
    impl StoreClient for EmptyStore {
        async fn execute(
            &self,
            _query: &str,
            _args: &[Value],
            _options: ExecuteOptions,
        ) -> Result<ResultSet, StoreError> {
            Ok(ResultSet::default())
        }
    }

    #[tokio::test]
    async fn store_client_as_dyn() {
        let store: &dyn StoreClient = &EmptyStore;
        let rs = store.execute("SELECT 1", &[], ExecuteOptions::default()).await.unwrap();
        assert!(rs.rows.is_empty());
    }
}
