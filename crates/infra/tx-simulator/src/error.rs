//! Error types for the dispatch engine.

use thiserror::Error;

/// Boxed transport-level cause carried by [`LedgerError`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors returned by a [`LedgerClient`](crate::LedgerClient).
#[derive(Debug, Error)]
pub enum LedgerError {
    /// A read-only RPC query (nonce, balance, fee, status) failed.
    #[error("{method} failed: {source}")]
    Query {
        /// The RPC method that failed.
        method: &'static str,
        /// Underlying transport cause.
        #[source]
        source: BoxError,
    },
    /// The endpoint rejected the transaction or the transport failed at send time.
    #[error("eth_sendRawTransaction failed: {0}")]
    Submit(#[source] BoxError),
}

impl LedgerError {
    /// Creates a [`LedgerError::Query`] for the given RPC method.
    pub fn query(method: &'static str, source: impl Into<BoxError>) -> Self {
        Self::Query { method, source: source.into() }
    }

    /// Creates a [`LedgerError::Submit`].
    pub fn submit(source: impl Into<BoxError>) -> Self {
        Self::Submit(source.into())
    }
}

/// Errors that occur while building or signing a transaction.
#[derive(Debug, Error)]
pub enum SignError {
    /// The transaction fields cannot form a valid transaction.
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),
    /// The key failed to produce a signature.
    #[error("signature failed: {0}")]
    Signature(#[from] alloy_signer::Error),
}

/// Errors that end a single send attempt or a dispatch loop.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Nonce allocation failed; never retried.
    #[error("failed to get nonce: {0}")]
    Nonce(#[source] LedgerError),
    /// Fee estimation kept failing after all retries.
    #[error("failed to get gas price after {retries} retries: {source}")]
    FeeEstimate {
        /// Retries performed before giving up.
        retries: u32,
        /// Last error observed.
        #[source]
        source: LedgerError,
    },
    /// Signing failed; never retried.
    #[error("failed to sign transaction: {0}")]
    Sign(#[from] SignError),
    /// Submission kept failing after all retries.
    #[error("failed to send transaction after {retries} retries: {source}")]
    Submit {
        /// Retries performed before giving up.
        retries: u32,
        /// Last error observed.
        #[source]
        source: LedgerError,
    },
    /// The periodic balance check could not be performed.
    #[error("balance check failed: {0}")]
    BalanceCheck(#[source] LedgerError),
}
