#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/base/node-reth/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod admission;
pub use admission::{AdmissionGate, AdmissionPolicy, DEFAULT_ADMISSION_CAPACITY};

mod client;
pub use client::{AlloyLedgerClient, LedgerClient, ReceiptSummary, TxStatus};

pub mod config;

pub mod contract;

mod coordinator;
pub use coordinator::{DispatchCoordinator, FleetConfig, LoopOutcome, LoopReport, RunSummary};

mod dispatch;
pub use dispatch::{DispatchConfig, DispatchContext, DispatchLoop, LoopExit};

mod error;
pub use error::{BoxError, DispatchError, LedgerError, SignError};

mod funding;
pub use funding::{
    DEFAULT_FUNDING_CONCURRENCY, FundingDistributor, FundingReport, TRANSFER_GAS_LIMIT,
};

mod metrics;
pub use metrics::{DEFAULT_ERROR_CAPACITY, DispatchMetrics, MetricsSummary};

mod nonce;
pub use nonce::NonceAllocator;

mod sequential;
pub use sequential::{SequentialConfig, SequentialSender};

mod signer;
pub use signer::{Eip155Signer, SignedTransaction, TransactionSigner, TransferRequest};

mod wallet;
pub use wallet::{Wallet, WalletFleet, generate_wallets, random_addresses};

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
