//! error types for the payout pipeline

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PayoutError {
    // === transient ===
    #[error("network error: {0}")]
    Network(String),

    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    // === protocol / validation ===
    #[error("unknown planet id: {0}")]
    UnknownPlanet(String),

    #[error("batch for nonce {nonce} has {size} recipients, max {max}")]
    BatchTooLarge { nonce: u64, size: usize, max: usize },

    #[error("malformed public key: {0}")]
    MalformedPublicKey(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid csv row {line}: {reason}")]
    InvalidRow { line: usize, reason: String },

    #[error("raid {0} has no recorded rewards")]
    EmptyRaid(u64),

    #[error("amount check failed: {0}")]
    AmountMismatch(String),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("decoding error: {0}")]
    Decoding(String),

    #[error("signature error: {0}")]
    Signature(String),

    #[error("config error: {0}")]
    Config(String),

    // === remote services ===
    #[error("kms error: {0}")]
    Kms(String),

    #[error("graphql error: {0}")]
    GraphQl(String),

    #[error("http error: {0}")]
    Http(String),

    // === persistence ===
    #[error("storage error: {0}")]
    Storage(String),

    #[error("nonce space exhausted after {0}")]
    NonceExhausted(u64),

    #[error("no transaction for signer {signer} at nonce {nonce}")]
    MissingTransaction { signer: String, nonce: u64 },

    #[error("task failed: {0}")]
    Task(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PayoutError {
    /// connection-level failures are the only retryable class
    pub fn is_transient(&self) -> bool {
        matches!(self, PayoutError::Network(_))
    }
}

pub type Result<T> = std::result::Result<T, PayoutError>;

impl From<sled::Error> for PayoutError {
    fn from(e: sled::Error) -> Self {
        PayoutError::Storage(e.to_string())
    }
}

impl From<bincode::Error> for PayoutError {
    fn from(e: bincode::Error) -> Self {
        PayoutError::Storage(format!("bincode: {}", e))
    }
}

impl From<reqwest::Error> for PayoutError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            PayoutError::Network(e.to_string())
        } else {
            PayoutError::Http(e.to_string())
        }
    }
}
