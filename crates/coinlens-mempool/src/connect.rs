//! Gateway-bound tracker construction for the reconciler.

use std::sync::Arc;

use async_trait::async_trait;

use coinlens_core::error::TrackerError;
use coinlens_core::store::StoreClient;
use coinlens_core::traits::{LiveTracker, TrackerConnector};

use crate::gateway::NodeGateway;
use crate::tracker::MempoolTracker;

/// Builds a [`MempoolTracker`] behind a [`NodeGateway`] for each coin,
/// using one shared credential pair for every gateway.
pub struct NodeTrackerConnector {
    store: Arc<dyn StoreClient>,
    username: String,
    password: String,
}

impl NodeTrackerConnector {
    pub fn new(
        store: Arc<dyn StoreClient>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            store,
            username: username.into(),
            password: password.into(),
        }
    }
}

#[async_trait]
impl TrackerConnector for NodeTrackerConnector {
    async fn connect(
        &self,
        coin: &str,
        keyspace: &str,
        rpc_urls: &[String],
    ) -> Result<Arc<dyn LiveTracker>, TrackerError> {
        let gateway = Arc::new(NodeGateway::new(
            rpc_urls.to_vec(),
            &self.username,
            &self.password,
        ));
        Ok(Arc::new(MempoolTracker::new(
            coin,
            keyspace,
            gateway,
            Arc::clone(&self.store),
        )))
    }
}
