use ethers::providers::{ProviderError, WsClientError};
use ethers::signers::WalletError;
use ethers::types::TransactionReceipt;

use crate::decoder::DecodeError;

/// An enum of all possible errors that could be encountered during the
/// execution of the bridge.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An Io error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// JSON Error occurred.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Config loading error.
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    /// Error while parsing a URL.
    #[error(transparent)]
    Url(#[from] url::ParseError),
    /// Error in the underlying Http server.
    #[error(transparent)]
    Warp(#[from] warp::Error),
    /// Error in the ethers JSON-RPC provider.
    #[error(transparent)]
    EthersProvider(#[from] ProviderError),
    /// Error in the websocket transport to the RSK node.
    #[error(transparent)]
    EthersWsClient(#[from] WsClientError),
    /// Error in the local signing wallet.
    #[error(transparent)]
    Wallet(#[from] WalletError),
    /// Sled database error.
    #[error(transparent)]
    Sled(#[from] sled::Error),
    /// Error in the Http client for the Chainlink node API.
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    /// A malformed oracle request log.
    #[error(transparent)]
    Decode(#[from] DecodeError),
    /// The Chainlink node rejected a job run operation.
    #[error("job service error: {}", _0)]
    JobService(String),
    /// Node credentials are missing from the store.
    #[error("bridge credentials are not configured yet")]
    CredentialsNotConfigured,
    /// A transaction broadcast raced another writer on the account nonce.
    #[error("nonce conflict: {}", _0)]
    NonceConflict(String),
    /// A transaction was mined but reverted or emitted no logs.
    #[error(
        "transaction {} was mined but reverted or emitted no logs",
        receipt.transaction_hash
    )]
    ReceiptRejected {
        /// The receipt the node returned for the rejected transaction.
        receipt: Box<TransactionReceipt>,
    },
    /// Generic error.
    #[error("{}", _0)]
    Generic(&'static str),
}

/// A type alias for the result of the bridge, that uses the `Error` enum.
pub type Result<T> = std::result::Result<T, Error>;
