//! One-at-a-time workloads: plain transfers, contract deployments and contract calls.

use std::{sync::Arc, time::Duration};

use alloy_primitives::{Address, B256, Bytes, TxKind, U256};
use eyre::{Result, WrapErr, bail};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    LedgerClient, ReceiptSummary, TransactionSigner, TransferRequest, Wallet,
    contract::{encode_set_call, simple_storage_bytecode},
};

/// Settings for [`SequentialSender`].
#[derive(Clone, Debug)]
pub struct SequentialConfig {
    /// Wei sent with each transaction.
    pub value: U256,
    /// Gas budget of each transaction.
    pub gas_limit: u64,
    /// Call data attached to plain transfers.
    pub payload: Bytes,
    /// Pause between transactions. Zero means "wait for the node instead".
    pub delay: Duration,
    /// How long to wait for a transfer receipt.
    pub receipt_timeout: Duration,
    /// Receipt polling interval.
    pub receipt_poll_interval: Duration,
    /// How long to wait for the pending nonce to move after a deployment.
    pub inclusion_wait: Duration,
    /// Gas price attempts for deployments and contract calls.
    pub fee_attempts: u32,
    /// Base delay between gas price attempts, multiplied by the attempt number.
    pub fee_retry_delay: Duration,
}

impl Default for SequentialConfig {
    fn default() -> Self {
        Self {
            value: U256::from(1),
            gas_limit: 210_000,
            payload: Bytes::new(),
            delay: Duration::from_secs(1),
            receipt_timeout: Duration::from_secs(30),
            receipt_poll_interval: Duration::from_millis(500),
            inclusion_wait: Duration::from_secs(2),
            fee_attempts: 3,
            fee_retry_delay: Duration::from_millis(200),
        }
    }
}

impl SequentialConfig {
    /// Sets the wei sent per transaction.
    pub fn with_value(mut self, value: U256) -> Self {
        self.value = value;
        self
    }

    /// Sets the gas limit per transaction.
    pub fn with_gas_limit(mut self, gas_limit: u64) -> Self {
        self.gas_limit = gas_limit;
        self
    }

    /// Sets the call data of plain transfers.
    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self
    }

    /// Sets the pause between transactions.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sets the receipt timeout and polling interval.
    pub fn with_receipt_polling(mut self, timeout: Duration, interval: Duration) -> Self {
        self.receipt_timeout = timeout;
        self.receipt_poll_interval = interval;
        self
    }

    /// Sets the base delay between gas price attempts.
    pub fn with_fee_retry_delay(mut self, delay: Duration) -> Self {
        self.fee_retry_delay = delay;
        self
    }
}

/// Sends transactions from one account, one after the other.
///
/// Several senders may share a wallet; its nonce allocator keeps them apart.
/// Any failure aborts the workload.
#[derive(Debug)]
pub struct SequentialSender<C, S> {
    client: Arc<C>,
    signer: Arc<S>,
    wallet: Arc<Wallet<C>>,
    chain_id: u64,
    config: SequentialConfig,
    rng: ChaCha8Rng,
}

impl<C: LedgerClient, S: TransactionSigner> SequentialSender<C, S> {
    /// Creates a sender for `wallet`.
    pub fn new(
        client: Arc<C>,
        signer: Arc<S>,
        wallet: Arc<Wallet<C>>,
        chain_id: u64,
        config: SequentialConfig,
    ) -> Self {
        Self { client, signer, wallet, chain_id, config, rng: ChaCha8Rng::from_os_rng() }
    }

    /// Uses a deterministic random sequence.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
        self
    }

    /// Sends `count` transfers to random `recipients`.
    ///
    /// After every transfer but the last, waits for its receipt. With a non-zero
    /// delay, a receipt that never shows up is replaced by sleeping the delay.
    pub async fn send_transfers(
        &mut self,
        recipients: &[Address],
        count: usize,
        shutdown: &CancellationToken,
    ) -> Result<Vec<B256>> {
        if recipients.is_empty() {
            bail!("at least one recipient is required");
        }

        let mut hashes = Vec::with_capacity(count);
        for i in 0..count {
            if shutdown.is_cancelled() {
                break;
            }

            let recipient = recipients[self.rng.random_range(0..recipients.len())];
            info!(to = %recipient, "sending transaction {}/{}", i + 1, count);

            let nonce = self.next_nonce().await?;
            let gas_price = self.client.gas_price().await.wrap_err("failed to get gas price")?;
            let hash = self
                .send(nonce, TxKind::Call(recipient), gas_price, self.config.payload.clone())
                .await?;
            info!(%hash, nonce, "transaction sent");
            hashes.push(hash);

            if i + 1 < count {
                match self.wait_for_receipt(hash, shutdown).await {
                    Some(receipt) => {
                        debug!(%hash, block = ?receipt.block_number, "transaction confirmed")
                    }
                    None if !self.config.delay.is_zero() => self.pause(shutdown).await,
                    None => {}
                }
            }
        }

        Ok(hashes)
    }

    /// Deploys the SimpleStorage contract `count` times and returns the
    /// addresses the contracts will live at.
    pub async fn deploy_contracts(
        &mut self,
        count: usize,
        shutdown: &CancellationToken,
    ) -> Result<Vec<Address>> {
        let bytecode = simple_storage_bytecode()?;
        let from = self.wallet.address();

        let mut deployed = Vec::with_capacity(count);
        for i in 0..count {
            if shutdown.is_cancelled() {
                break;
            }
            info!("deploying contract {}/{}", i + 1, count);

            let nonce = self.next_nonce().await?;
            let gas_price = self.gas_price_with_retry(shutdown).await?;
            let hash = self.send(nonce, TxKind::Create, gas_price, bytecode.clone()).await?;

            let contract = from.create(nonce);
            info!(%hash, %contract, "deployment sent");
            deployed.push(contract);

            if i + 1 < count {
                if self.config.delay.is_zero() {
                    let wait = self.config.inclusion_wait;
                    if !self.wallet.nonces().wait_for_inclusion(nonce, wait, shutdown).await {
                        debug!(nonce, "pending nonce did not advance, continuing");
                    }
                } else {
                    self.pause(shutdown).await;
                }
            }
        }

        Ok(deployed)
    }

    /// Calls `set(uint256)` with a random value on random `contracts`, `count` times.
    pub async fn interact(
        &mut self,
        contracts: &[Address],
        count: usize,
        shutdown: &CancellationToken,
    ) -> Result<Vec<B256>> {
        if contracts.is_empty() {
            bail!("at least one contract address is required for interaction");
        }

        let mut hashes = Vec::with_capacity(count);
        for i in 0..count {
            if shutdown.is_cancelled() {
                break;
            }

            let contract = contracts[self.rng.random_range(0..contracts.len())];
            let value = U256::from(self.rng.random_range(1..=1_000_000u64));
            info!(%contract, %value, "calling contract {}/{}", i + 1, count);

            let nonce = self.next_nonce().await?;
            let gas_price = self.gas_price_with_retry(shutdown).await?;
            let hash =
                self.send(nonce, TxKind::Call(contract), gas_price, encode_set_call(value)).await?;
            info!(%hash, "interaction sent");
            hashes.push(hash);

            if i + 1 < count {
                self.pause(shutdown).await;
            }
        }

        Ok(hashes)
    }

    /// Polls for the receipt of `hash` until it appears or the receipt timeout passes.
    pub async fn wait_for_receipt(
        &self,
        hash: B256,
        shutdown: &CancellationToken,
    ) -> Option<ReceiptSummary> {
        let deadline = Instant::now() + self.config.receipt_timeout;
        let mut ticker = tokio::time::interval(self.config.receipt_poll_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(%hash, "timeout waiting for transaction receipt");
                    return None;
                }
                _ = ticker.tick() => {}
            }

            if let Ok(Some(receipt)) = self.client.transaction_receipt(hash).await {
                return Some(receipt);
            }
        }
    }

    async fn next_nonce(&self) -> Result<u64> {
        self.wallet.nonces().allocate().await.wrap_err("failed to get nonce")
    }

    async fn gas_price_with_retry(&self, shutdown: &CancellationToken) -> Result<u128> {
        let attempts = self.config.fee_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.client.gas_price().await {
                Ok(gas_price) => return Ok(gas_price),
                Err(e) if attempt == attempts || shutdown.is_cancelled() => {
                    return Err(e)
                        .wrap_err(format!("failed to get gas price after {attempts} attempts"));
                }
                Err(e) => {
                    debug!(attempt, error = %e, "gas price query failed, retrying");
                    tokio::time::sleep(self.config.fee_retry_delay * attempt).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn send(&self, nonce: u64, to: TxKind, gas_price: u128, input: Bytes) -> Result<B256> {
        let request = TransferRequest {
            nonce,
            to,
            value: self.config.value,
            gas_limit: self.config.gas_limit,
            gas_price,
            input,
            chain_id: self.chain_id,
        };
        let signed = self
            .signer
            .sign(self.wallet.key(), &request)
            .wrap_err("failed to sign transaction")?;
        self.client
            .send_raw_transaction(signed.raw)
            .await
            .wrap_err("failed to send transaction")?;
        Ok(signed.hash)
    }

    async fn pause(&self, shutdown: &CancellationToken) {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(self.config.delay) => {}
        }
    }
}
