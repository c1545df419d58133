//! # coinlens-serve
//! Coin registry, reconciliation loop, and the dual-source read path.

pub mod config;
pub mod reconciler;
pub mod registry;
pub mod resolvers;

pub use config::ServeConfig;
pub use reconciler::Reconciler;
pub use registry::{Coin, CoinRegistry};
pub use resolvers::TxResolver;
