//! Fan-out funding of generated accounts.

use std::{fmt, sync::Arc};

use alloy_primitives::{Address, Bytes, TxKind, U256};
use indicatif::ProgressBar;
use serde::{Deserialize, Serialize};
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{debug, info, warn};

use crate::{LedgerClient, TransactionSigner, TransferRequest, Wallet};

/// Default number of funding transfers in flight at once.
pub const DEFAULT_FUNDING_CONCURRENCY: usize = 50;

/// Gas limit of a plain value transfer.
pub const TRANSFER_GAS_LIMIT: u64 = 21_000;

/// Outcome of a funding round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingReport {
    /// Targets whose funding transfer was accepted.
    pub funded: Vec<Address>,
    /// Targets whose funding transfer failed, with the cause.
    pub failures: Vec<(Address, String)>,
}

impl FundingReport {
    /// Number of failed transfers.
    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    /// Number of transfers attempted.
    pub fn attempted(&self) -> usize {
        self.funded.len() + self.failures.len()
    }
}

/// Sends a fixed amount from one source account to many targets.
///
/// Nonces come from the source's single allocator, so transfers run in parallel
/// without colliding. Reset the allocator before funding.
pub struct FundingDistributor<C, S> {
    client: Arc<C>,
    signer: Arc<S>,
    concurrency: usize,
    chain_id: u64,
    progress: ProgressBar,
}

impl<C, S> fmt::Debug for FundingDistributor<C, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FundingDistributor")
            .field("concurrency", &self.concurrency)
            .field("chain_id", &self.chain_id)
            .finish_non_exhaustive()
    }
}

impl<C: LedgerClient, S: TransactionSigner> FundingDistributor<C, S> {
    /// Creates a distributor with [`DEFAULT_FUNDING_CONCURRENCY`] slots.
    pub fn new(client: Arc<C>, signer: Arc<S>, chain_id: u64) -> Self {
        Self {
            client,
            signer,
            concurrency: DEFAULT_FUNDING_CONCURRENCY,
            chain_id,
            progress: ProgressBar::hidden(),
        }
    }

    /// Sets how many transfers may be in flight at once.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Reports progress on `progress`, one tick per finished transfer.
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    /// Sends `amount` wei from `source` to every target.
    ///
    /// Individual failures are collected into the report and never stop the
    /// remaining transfers.
    pub async fn fund(
        &self,
        source: &Arc<Wallet<C>>,
        targets: &[Address],
        amount: U256,
    ) -> FundingReport {
        info!(
            source = %source.address(),
            targets = targets.len(),
            %amount,
            concurrency = self.concurrency,
            "funding accounts"
        );
        self.progress.set_length(targets.len() as u64);

        let slots = Arc::new(Semaphore::new(self.concurrency));
        let mut transfers = JoinSet::new();

        for &target in targets {
            let slots = Arc::clone(&slots);
            let client = Arc::clone(&self.client);
            let signer = Arc::clone(&self.signer);
            let source = Arc::clone(source);
            let chain_id = self.chain_id;

            transfers.spawn(async move {
                let Ok(_slot) = slots.acquire_owned().await else {
                    return (target, Err("funding cancelled".to_string()));
                };
                let result = fund_one(&*client, &*signer, &source, target, amount, chain_id).await;
                (target, result)
            });
        }

        let mut report = FundingReport::default();
        while let Some(joined) = transfers.join_next().await {
            match joined {
                Ok((target, Ok(()))) => {
                    debug!(%target, "account funded");
                    report.funded.push(target);
                }
                Ok((target, Err(e))) => {
                    warn!(%target, error = %e, "failed to fund account");
                    report.failures.push((target, e));
                }
                Err(e) => warn!(error = %e, "funding task panicked"),
            }
            self.progress.inc(1);
        }

        self.progress.finish_with_message("funding complete");
        info!(funded = report.funded.len(), failed = report.failed(), "funding finished");
        report
    }
}

async fn fund_one<C: LedgerClient, S: TransactionSigner>(
    client: &C,
    signer: &S,
    source: &Wallet<C>,
    target: Address,
    amount: U256,
    chain_id: u64,
) -> Result<(), String> {
    let nonce = source.nonces().allocate().await.map_err(|e| format!("failed to get nonce: {e}"))?;
    let gas_price = client.gas_price().await.map_err(|e| e.to_string())?;

    let request = TransferRequest {
        nonce,
        to: TxKind::Call(target),
        value: amount,
        gas_limit: TRANSFER_GAS_LIMIT,
        gas_price,
        input: Bytes::new(),
        chain_id,
    };
    let signed = signer.sign(source.key(), &request).map_err(|e| e.to_string())?;
    client.send_raw_transaction(signed.raw).await.map_err(|e| e.to_string())
}
