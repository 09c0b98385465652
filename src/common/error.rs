//! Error types for minipd

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Input Errors ===
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Cluster Errors ===
    #[error("Cluster {0} already bootstrapped")]
    AlreadyBootstrapped(u64),

    #[error("Cluster {0} is not bootstrapped")]
    NotBootstrapped(u64),

    #[error("Cluster identity error: {0}")]
    ClusterIdentity(String),

    // === Leadership Errors ===
    #[error("Not leader: {0}")]
    NotLeader(String),

    #[error("Lease {0} expired or not found")]
    LeaseExpired(i64),

    // === Metadata Store Errors ===
    #[error("Metadata store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Persist failed (value applied in memory): {0}")]
    Persist(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Metadata corrupted: {0}")]
    MetadataCorrupted(String),

    // === Local Storage Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Serialization error: {0}")]
    Serde(String),

    // === Network Errors ===
    #[error("HTTP error: {0}")]
    Http(String),

    // === Generic ===
    #[error("Server is closed")]
    Closed,

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::StoreUnavailable(_)
                | Error::Persist(_)
                | Error::NotLeader(_)
                | Error::Http(_)
        )
    }

    /// Wrap a store-layer failure with the operation that hit it
    pub fn store(op: &str, err: impl std::fmt::Display) -> Self {
        Error::StoreUnavailable(format!("{}: {}", op, err))
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::NotLeader(_) => StatusCode::TEMPORARY_REDIRECT,
            Error::Validation(_) | Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::AlreadyBootstrapped(_) => StatusCode::CONFLICT,
            Error::NotBootstrapped(_) => StatusCode::PRECONDITION_FAILED,
            Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::StoreUnavailable(_) | Error::Closed => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serde(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serde(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.to_string())
    }
}
