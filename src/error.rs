// Error taxonomy for the fetch-normalize-cache-persist pipeline.
//
// Fetch failures feed the fallback chain, schema mismatches degrade to an
// empty batch, and store failures only reach HTTP callers when they are the
// last link of the chain.

use std::sync::Arc;
use std::time::Duration;

/// Network, transport or decode failure talking to the upstream feed.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream returned status {0}")]
    Status(reqwest::StatusCode),

    #[error("upstream did not answer within {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("invalid JSON payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("refresh task aborted: {0}")]
    Aborted(String),
}

/// The upstream payload matched none of the recognized shapes.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unrecognized upstream payload: top level is {found}")]
pub struct SchemaMismatch {
    pub found: String,
}

/// Failures of the SQLite retention store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("seed file is not valid JSON: {0}")]
    Seed(#[from] serde_json::Error),

    #[error("store task failed: {0}")]
    Task(String),
}

/// Why the store could not stand in for a failed fetch.
#[derive(Debug, thiserror::Error)]
pub enum StoreFallbackError {
    #[error("no positions persisted in the recent window")]
    Empty,

    #[error(transparent)]
    Query(#[from] StoreError),
}

/// Every tier of the fallback chain came up empty: no snapshot, the fetch
/// failed and the store had nothing usable.
#[derive(Debug, thiserror::Error)]
#[error("no vehicle data available: {fetch}; store fallback failed: {store}")]
pub struct HardFailure {
    pub fetch: Arc<FetchError>,
    pub store: StoreFallbackError,
}
