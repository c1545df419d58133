//! JSON-RPC gateway to a coin's nodes.
//!
//! One gateway serves one coin and multiplexes over that coin's endpoint
//! list: a request is tried against each endpoint in order, transport
//! failures fail over to the next endpoint, and an error object returned by
//! a reachable node is surfaced as-is (every node would give the same
//! answer, so there is nothing to fail over to).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use coinlens_core::error::GatewayError;
use coinlens_core::types::{MempoolTx, TxId};

/// Time to wait for a node response.
const RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// A block fetched with full transaction detail.
#[derive(Deserialize, Clone, Debug)]
pub struct RpcBlock {
    pub hash: String,
    pub height: u64,
    #[serde(default)]
    pub tx: Vec<MempoolTx>,
}

/// Node operations consumed by the live tracker.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Ids of all transactions currently in the node's mempool.
    async fn mempool_txids(&self) -> Result<Vec<TxId>, GatewayError>;

    /// A transaction with full input/output detail.
    async fn transaction(&self, txid: &TxId) -> Result<MempoolTx, GatewayError>;

    /// Height of the node's chain tip.
    async fn block_count(&self) -> Result<u64, GatewayError>;

    /// Hash of the block at the given height on the node's best chain.
    async fn block_hash(&self, height: u64) -> Result<String, GatewayError>;

    /// A block by hash, with full transaction detail.
    async fn block(&self, hash: &str) -> Result<RpcBlock, GatewayError>;
}

/// JSON-RPC 2.0 client over a coin's endpoint list.
pub struct NodeGateway {
    client: Client,
    endpoints: Vec<String>,
    username: String,
    password: String,
}

impl NodeGateway {
    pub fn new(endpoints: Vec<String>, username: &str, password: &str) -> Self {
        Self {
            client: Client::builder()
                .timeout(RPC_TIMEOUT)
                .build()
                .expect("build reqwest client"),
            endpoints,
            username: username.to_owned(),
            password: password.to_owned(),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, GatewayError> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });
        let mut last_error = String::from("no endpoints configured");
        for endpoint in &self.endpoints {
            let sent = self
                .client
                .post(endpoint)
                .basic_auth(&self.username, Some(&self.password))
                .json(&body)
                .send()
                .await;
            let response = match sent {
                Ok(response) => response,
                Err(e) => {
                    warn!(%endpoint, method, error = %e, "rpc endpoint unreachable, failing over");
                    last_error = e.to_string();
                    continue;
                }
            };
            let payload: Value = match response.json().await {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(%endpoint, method, error = %e, "undecodable rpc response, failing over");
                    last_error = e.to_string();
                    continue;
                }
            };
            if let Some(err) = payload.get("error") {
                if !err.is_null() {
                    return Err(GatewayError::Rpc(err.to_string()));
                }
            }
            let result = payload.get("result").cloned().unwrap_or(Value::Null);
            return serde_json::from_value(result)
                .map_err(|e| GatewayError::InvalidResponse(e.to_string()));
        }
        Err(GatewayError::AllEndpointsFailed(last_error))
    }
}

#[async_trait]
impl ChainRpc for NodeGateway {
    async fn mempool_txids(&self) -> Result<Vec<TxId>, GatewayError> {
        self.call("getrawmempool", json!([])).await
    }

    async fn transaction(&self, txid: &TxId) -> Result<MempoolTx, GatewayError> {
        self.call("getrawtransaction", json!([txid.as_str(), true]))
            .await
    }

    async fn block_count(&self) -> Result<u64, GatewayError> {
        self.call("getblockcount", json!([])).await
    }

    async fn block_hash(&self, height: u64) -> Result<String, GatewayError> {
        self.call("getblockhash", json!([height])).await
    }

    async fn block(&self, hash: &str) -> Result<RpcBlock, GatewayError> {
        self.call("getblock", json!([hash, 2])).await
    }
}
