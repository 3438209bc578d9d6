// ===============================
// src/error.rs
// ===============================
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    /// The venue adapter does not provide this hook.
    #[error("adapter hook `{0}` is not implemented")]
    Unimplemented(&'static str),
    /// The venue has no such feature (e.g. positions on a spot venue).
    #[error("not supported by venue: {0}")]
    Unsupported(&'static str),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("invalid order: {0}")]
    InvalidOrder(String),
    #[error("signing failed: {0}")]
    Signing(String),
}

impl From<serde_json::Error> for AdapterError {
    fn from(e: serde_json::Error) -> Self {
        AdapterError::Decode(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("rest response not successful (status {0})")]
    RestStatus(u16),
    #[error("engine is not running")]
    NotRunning,
    #[error("engine has been stopped")]
    Stopped,
    #[error("unknown order {symbol}/{client_order_id}")]
    UnknownOrder {
        symbol: String,
        client_order_id: String,
    },
}

impl EngineError {
    /// Adapter contract errors: retrying on a schedule can never fix these.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            EngineError::Adapter(AdapterError::Unimplemented(_))
                | EngineError::Adapter(AdapterError::Unsupported(_))
        )
    }
}
