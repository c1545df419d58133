//! # coinlens-mempool
//! Node RPC gateway and the per-coin live tracker built on it.

pub mod connect;
pub mod gateway;
pub mod tracker;

pub use connect::NodeTrackerConnector;
pub use gateway::{ChainRpc, NodeGateway, RpcBlock};
pub use tracker::MempoolTracker;
