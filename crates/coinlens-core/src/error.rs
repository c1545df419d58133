//! Error types for the coinlens service.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")] Unavailable(String),
    #[error("query failed: {0}")] Query(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RowError {
    #[error("missing column: {0}")] MissingColumn(&'static str),
    #[error("invalid column {column}: {reason}")] InvalidColumn { column: &'static str, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("transport: {0}")] Transport(String),
    #[error("rpc error: {0}")] Rpc(String),
    #[error("invalid response: {0}")] InvalidResponse(String),
    #[error("all rpc endpoints failed, last: {0}")] AllEndpointsFailed(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    #[error("tracker already started")] AlreadyStarted,
    #[error(transparent)] Gateway(#[from] GatewayError),
    #[error(transparent)] Store(#[from] StoreError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error(transparent)] Store(#[from] StoreError),
    #[error(transparent)] Row(#[from] RowError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error(transparent)] Store(#[from] StoreError),
    #[error(transparent)] Row(#[from] RowError),
    #[error(transparent)] Tracker(#[from] TrackerError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {var}: {reason}")] Invalid { var: &'static str, reason: String },
}
