//! Error types for sync operations

use lightwallet_params::BlockHeight;

/// Result type
pub type Result<T> = std::result::Result<T, Error>;

/// Transport failure reported by the network collaborator
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
    /// Server could not be reached; retry after reconnecting
    #[error("Connection unavailable: {0}")]
    Unavailable(String),

    /// Server answered with an error status
    #[error("Server rejected request ({code}): {message}")]
    Rejected {
        /// Status code reported by the server
        code: i32,
        /// Status message
        message: String,
    },

    /// Requested object does not exist on the server
    #[error("Not found: {0}")]
    NotFound(String),
}

impl NetworkError {
    /// Only connection failures are worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, NetworkError::Unavailable(_))
    }
}

/// Failure reported by the backend's scan primitive
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    /// Scanned blocks do not connect to the stored chain
    #[error("Chain continuity error at {height:?}: {message}")]
    Continuity {
        /// Height the backend detected the break at, if known
        height: Option<BlockHeight>,
        /// Backend diagnostic
        message: String,
    },

    /// Any other scan failure
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Network error
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Backend (scanning / derived state) error
    #[error("Backend error: {0}")]
    Backend(#[source] anyhow::Error),

    /// Derived-data repository error
    #[error("Repository error: {0}")]
    Repository(#[source] anyhow::Error),

    /// Compact block cache error
    #[error("Block cache error: {0}")]
    Cache(#[source] anyhow::Error),

    /// Balance query failed
    #[error("Failed to get balance for account {account}: {source}")]
    Balance {
        /// Account index
        account: u32,
        /// Backend failure
        #[source]
        source: anyhow::Error,
    },

    /// Invalid height from a collaborator
    #[error("Invalid height: {0}")]
    Params(#[from] lightwallet_params::Error),

    /// Configuration rejected
    #[error("Configuration error: {0}")]
    Config(String),

    /// Wallet storage has not been initialized
    #[error("Wallet storage is not initialized")]
    Uninitialized,

    /// No account exists in the wallet
    #[error("Wallet has no accounts")]
    NoAccount,

    /// Server info could not be fetched
    #[error("Server info unavailable: {0}")]
    ServerInfoUnavailable(NetworkError),

    /// Server reported a height outside the network's valid range
    #[error("Server reported a bad block height: {0}")]
    BadBlockHeight(u64),

    /// Server and client disagree on the consensus branch
    #[error("Consensus branch mismatch: client {client}, server {server}")]
    MismatchedConsensusBranch {
        /// Branch id computed locally (hex)
        client: String,
        /// Branch id reported by the server (hex)
        server: String,
    },

    /// Server serves a different network
    #[error("Network mismatch: client {client}, server {server}")]
    MismatchedNetwork {
        /// Local network name
        client: String,
        /// Server chain name
        server: String,
    },

    /// Block download failed after retries
    #[error("Failed to download blocks starting at {height}: {source}")]
    DownloadFailed {
        /// Batch start height
        height: BlockHeight,
        /// Last failure
        #[source]
        source: NetworkError,
    },

    /// Backend scan failed
    #[error("Failed to scan blocks starting at {height}: {source}")]
    ScanFailed {
        /// Height the failure is anchored at
        height: BlockHeight,
        /// Backend failure
        #[source]
        source: ScanError,
    },

    /// Cached block files could not be removed
    #[error("Failed to delete cached blocks: {0}")]
    DeleteFailed(#[source] anyhow::Error),

    /// Transaction enhancement failed
    #[error("Failed to enhance transaction {txid}: {message}")]
    EnhanceFailed {
        /// Transaction id (hex)
        txid: String,
        /// Failure description
        message: String,
    },

    /// Subtree roots could not be stored
    #[error("Failed to store subtree roots: {0}")]
    SubtreeRoots(#[source] anyhow::Error),

    /// Transparent UTXO refresh failed
    #[error("Failed to fetch UTXOs for account {account}: {message}")]
    FetchUtxos {
        /// Account index
        account: u32,
        /// Failure description
        message: String,
    },

    /// Reorg could not be repaired within the error ceiling
    #[error("Failed to repair chain reorg near height {height} after {attempts} attempts")]
    FailedReorgRepair {
        /// Height of the last continuity failure
        height: BlockHeight,
        /// Consecutive failures observed
        attempts: u32,
    },

    /// Passes kept failing outside the scanner
    #[error("Failed to synchronize at height {height} after {attempts} attempts: {source}")]
    FailedSynchronization {
        /// Height the last failure was anchored at
        height: BlockHeight,
        /// Consecutive failures observed
        attempts: u32,
        /// Last failure
        #[source]
        source: Box<Error>,
    },

    /// `start` called on an engine that is already running
    #[error("Processor already started")]
    AlreadyStarted,

    /// Engine was stopped and cannot be restarted
    #[error("Processor is stopped")]
    Stopped,

    /// Another processor holds this identity
    #[error("A processor is already running for {0}")]
    ProcessorAlreadyRunning(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True for errors raised by setup verification
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            Error::Uninitialized
                | Error::NoAccount
                | Error::ServerInfoUnavailable(_)
                | Error::BadBlockHeight(_)
                | Error::MismatchedConsensusBranch { .. }
                | Error::MismatchedNetwork { .. }
        )
    }
}
