//! Per-account send loop with admission control, balance checks and retries.

use std::{sync::Arc, time::Duration};

use alloy_primitives::{Address, B256, Bytes, TxKind, U256};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use crate::{
    AdmissionGate, DispatchError, DispatchMetrics, LedgerClient, LedgerError, TransactionSigner,
    TransferRequest, TxStatus, Wallet,
};

/// Tunables for every [`DispatchLoop`] in a run.
#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// Wei sent with each transaction.
    pub value: U256,
    /// Gas budget of each transaction.
    pub gas_limit: u64,
    /// Call data attached to each transaction.
    pub payload: Bytes,
    /// Attempts between two balance checks.
    pub balance_check_interval: u64,
    /// How long a fetched balance is reused.
    pub balance_cache_ttl: Duration,
    /// Retries after the first failed fee estimate or submission.
    pub max_retries: u32,
    /// Base delay between retries, multiplied by the retry number.
    pub retry_delay: Duration,
    /// Delay before checking that a submitted transaction is known to the node.
    /// `None` disables verification.
    pub verify_delay: Option<Duration>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            value: U256::from(1),
            gas_limit: 210_000,
            payload: Bytes::new(),
            balance_check_interval: 100,
            balance_cache_ttl: Duration::from_secs(1),
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            verify_delay: Some(Duration::from_millis(500)),
        }
    }
}

impl DispatchConfig {
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

    /// Sets the call data per transaction.
    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self
    }

    /// Sets the number of attempts between balance checks.
    pub fn with_balance_check_interval(mut self, interval: u64) -> Self {
        self.balance_check_interval = interval;
        self
    }

    /// Sets how long a fetched balance is reused.
    pub fn with_balance_cache_ttl(mut self, ttl: Duration) -> Self {
        self.balance_cache_ttl = ttl;
        self
    }

    /// Sets the retry budget.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the base retry delay.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Sets the verification delay, or disables verification with `None`.
    pub fn with_verify_delay(mut self, delay: Option<Duration>) -> Self {
        self.verify_delay = delay;
        self
    }

    /// Wei an account must hold to afford one more transaction at `gas_price`.
    pub fn required_balance(&self, gas_price: u128) -> U256 {
        U256::from(gas_price) * U256::from(self.gas_limit) + self.value
    }
}

/// Collaborators shared by every loop and attempt of a run.
#[derive(Debug)]
pub struct DispatchContext<C, S> {
    client: Arc<C>,
    signer: Arc<S>,
    gate: Arc<AdmissionGate>,
    metrics: Arc<DispatchMetrics>,
    config: DispatchConfig,
    chain_id: u64,
    recipients: Arc<[Address]>,
    verifications: TaskTracker,
}

impl<C: LedgerClient, S: TransactionSigner> DispatchContext<C, S> {
    /// Bundles the collaborators for a run against `chain_id`.
    ///
    /// Each transaction goes to a random entry of `recipients`; an empty list
    /// makes accounts send to themselves.
    pub fn new(
        client: Arc<C>,
        signer: Arc<S>,
        gate: Arc<AdmissionGate>,
        metrics: Arc<DispatchMetrics>,
        config: DispatchConfig,
        chain_id: u64,
        recipients: Vec<Address>,
    ) -> Self {
        Self {
            client,
            signer,
            gate,
            metrics,
            config,
            chain_id,
            recipients: recipients.into(),
            verifications: TaskTracker::new(),
        }
    }

    /// Returns the ledger client.
    pub const fn client(&self) -> &Arc<C> {
        &self.client
    }

    /// Returns the admission gate.
    pub const fn gate(&self) -> &Arc<AdmissionGate> {
        &self.gate
    }

    /// Returns the shared metrics.
    pub const fn metrics(&self) -> &Arc<DispatchMetrics> {
        &self.metrics
    }

    /// Returns the dispatch configuration.
    pub const fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Waits for every verification spawned so far to resolve.
    ///
    /// Closes the tracker, so call it once no more attempts will be admitted.
    pub async fn wait_for_verifications(&self) {
        self.verifications.close();
        self.verifications.wait().await;
    }
}

/// Why a [`DispatchLoop`] stopped without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopExit {
    /// The account can no longer afford a transaction.
    BalanceExhausted,
    /// Shutdown was requested.
    Cancelled,
}

#[derive(Debug)]
struct BalanceCache {
    balance: U256,
    fetched_at: Instant,
}

/// Sends transactions from one account until its balance runs out or the run
/// is cancelled.
///
/// Each admitted attempt runs as a detached task holding an admission permit.
/// Attempt failures are recorded in the shared metrics and never stop the loop.
#[derive(Debug)]
pub struct DispatchLoop<C, S> {
    wallet: Arc<Wallet<C>>,
    ctx: Arc<DispatchContext<C, S>>,
    rng: ChaCha8Rng,
    balance: Option<BalanceCache>,
}

impl<C: LedgerClient, S: TransactionSigner> DispatchLoop<C, S> {
    /// Creates a loop sending from `wallet`.
    pub fn new(wallet: Arc<Wallet<C>>, ctx: Arc<DispatchContext<C, S>>) -> Self {
        Self { wallet, ctx, rng: ChaCha8Rng::from_os_rng(), balance: None }
    }

    /// Uses a deterministic recipient sequence.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
        self
    }

    /// Returns the sending account.
    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    /// Runs until the balance is exhausted or `shutdown` fires.
    ///
    /// The balance is checked after every `balance_check_interval` admitted
    /// attempts. A failing balance or fee query ends the loop with
    /// [`DispatchError::BalanceCheck`].
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<LoopExit, DispatchError> {
        let wallet = self.wallet.address();
        let interval = self.ctx.config.balance_check_interval.max(1);
        let mut attempts: u64 = 0;
        let mut last_check: u64 = 0;

        info!(%wallet, "dispatch loop started");

        loop {
            if shutdown.is_cancelled() {
                info!(%wallet, attempts, "dispatch loop cancelled");
                return Ok(LoopExit::Cancelled);
            }

            if attempts - last_check >= interval {
                last_check = attempts;
                let affordable = tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!(%wallet, attempts, "dispatch loop cancelled during balance check");
                        return Ok(LoopExit::Cancelled);
                    }
                    result = self.can_afford_next() => result,
                };
                match affordable {
                    Ok(true) => {}
                    Ok(false) => {
                        info!(%wallet, attempts, "balance exhausted, stopping dispatch loop");
                        return Ok(LoopExit::BalanceExhausted);
                    }
                    Err(e) => {
                        warn!(%wallet, error = %e, "balance check failed, stopping dispatch loop");
                        self.ctx.metrics.record_error(format!("{wallet}: {e}"));
                        return Err(e);
                    }
                }
            }

            let Some(permit) = self.ctx.gate.acquire(&shutdown).await else {
                continue;
            };

            attempts += 1;
            self.ctx.metrics.record_attempt();

            let to = self.next_recipient();
            let sender = Arc::clone(&self.wallet);
            let ctx = Arc::clone(&self.ctx);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                run_attempt(&ctx, &sender, to, &shutdown).await;
                drop(permit);
            });
        }
    }

    fn next_recipient(&mut self) -> Address {
        let recipients = &self.ctx.recipients;
        if recipients.is_empty() {
            return self.wallet.address();
        }
        recipients[self.rng.random_range(0..recipients.len())]
    }

    async fn can_afford_next(&mut self) -> Result<bool, DispatchError> {
        let balance = self.current_balance().await?;
        let gas_price = self.ctx.client.gas_price().await.map_err(DispatchError::BalanceCheck)?;
        let required = self.ctx.config.required_balance(gas_price);

        debug!(wallet = %self.wallet.address(), %balance, %required, "balance check");
        Ok(balance >= required)
    }

    async fn current_balance(&mut self) -> Result<U256, DispatchError> {
        let ttl = self.ctx.config.balance_cache_ttl;
        if let Some(cached) = &self.balance {
            if cached.fetched_at.elapsed() < ttl {
                return Ok(cached.balance);
            }
        }

        let balance = self
            .ctx
            .client
            .balance(self.wallet.address())
            .await
            .map_err(DispatchError::BalanceCheck)?;
        self.balance = Some(BalanceCache { balance, fetched_at: Instant::now() });
        Ok(balance)
    }
}

/// Runs one send attempt to completion and records its outcome.
pub(crate) async fn run_attempt<C: LedgerClient, S: TransactionSigner>(
    ctx: &Arc<DispatchContext<C, S>>,
    wallet: &Arc<Wallet<C>>,
    to: Address,
    shutdown: &CancellationToken,
) {
    match send_with_retry(ctx, wallet, TxKind::Call(to), shutdown).await {
        Ok((hash, nonce)) => {
            ctx.metrics.record_submitted();
            debug!(wallet = %wallet.address(), nonce, %hash, "transaction submitted");
            if let Some(delay) = ctx.config.verify_delay {
                ctx.verifications.spawn(verify(Arc::clone(ctx), hash, delay, shutdown.clone()));
            }
        }
        Err(e) => {
            warn!(wallet = %wallet.address(), error = %e, "transaction failed");
            ctx.metrics.record_failed(format!("{}: {e}", wallet.address()));
        }
    }
}

enum Failure {
    Fee(LedgerError),
    Submit(LedgerError),
}

/// Allocates a nonce, then estimates the fee, signs and submits, retrying the
/// fee estimate and the submission with linear backoff.
///
/// Every retry reuses the allocated nonce. Nonce and signing failures are
/// returned immediately.
pub(crate) async fn send_with_retry<C: LedgerClient, S: TransactionSigner>(
    ctx: &DispatchContext<C, S>,
    wallet: &Wallet<C>,
    to: TxKind,
    shutdown: &CancellationToken,
) -> Result<(B256, u64), DispatchError> {
    let config = &ctx.config;
    let nonce = wallet.nonces().allocate().await.map_err(DispatchError::Nonce)?;

    let mut retries = 0;
    loop {
        let failure = match ctx.client.gas_price().await {
            Err(e) => Failure::Fee(e),
            Ok(gas_price) => {
                let request = TransferRequest {
                    nonce,
                    to,
                    value: config.value,
                    gas_limit: config.gas_limit,
                    gas_price,
                    input: config.payload.clone(),
                    chain_id: ctx.chain_id,
                };
                let signed = ctx.signer.sign(wallet.key(), &request)?;
                match ctx.client.send_raw_transaction(signed.raw).await {
                    Ok(()) => return Ok((signed.hash, nonce)),
                    Err(e) => Failure::Submit(e),
                }
            }
        };

        if retries == config.max_retries || shutdown.is_cancelled() {
            return Err(match failure {
                Failure::Fee(source) => DispatchError::FeeEstimate { retries, source },
                Failure::Submit(source) => DispatchError::Submit { retries, source },
            });
        }

        retries += 1;
        debug!(wallet = %wallet.address(), nonce, retries, "retrying transaction");
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(config.retry_delay * retries) => {}
        }
    }
}

async fn verify<C: LedgerClient, S>(
    ctx: Arc<DispatchContext<C, S>>,
    hash: B256,
    delay: Duration,
    shutdown: CancellationToken,
) {
    tokio::select! {
        _ = shutdown.cancelled() => return,
        _ = tokio::time::sleep(delay) => {}
    }

    match ctx.client.transaction_status(hash).await {
        Ok(TxStatus::Pending | TxStatus::Included) => ctx.metrics.record_succeeded(),
        Ok(TxStatus::Unknown) => debug!(%hash, "transaction not yet visible"),
        Err(e) => debug!(%hash, error = %e, "transaction status query failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        AdmissionPolicy,
        test_utils::{MockLedger, MockSigner},
    };

    struct Harness {
        ledger: Arc<MockLedger>,
        wallet: Arc<Wallet<MockLedger>>,
        ctx: Arc<DispatchContext<MockLedger, MockSigner>>,
    }

    fn harness(
        ledger: MockLedger,
        signer: MockSigner,
        gate: AdmissionGate,
        config: DispatchConfig,
    ) -> Harness {
        let ledger = Arc::new(ledger);
        let wallet = Arc::new(Wallet::random(Arc::clone(&ledger)));
        let ctx = Arc::new(DispatchContext::new(
            Arc::clone(&ledger),
            Arc::new(signer),
            Arc::new(gate),
            Arc::new(DispatchMetrics::new()),
            config,
            1337,
            vec![Address::repeat_byte(0x11), Address::repeat_byte(0x22)],
        ));
        Harness { ledger, wallet, ctx }
    }

    fn fast_config() -> DispatchConfig {
        DispatchConfig::default()
            .with_gas_limit(21_000)
            .with_retry_delay(Duration::ZERO)
            .with_verify_delay(None)
    }

    #[tokio::test]
    async fn test_submission_retried_then_recorded_once() {
        let h = harness(MockLedger::new(), MockSigner::new(), AdmissionGate::new(1), fast_config());
        h.ledger.set_balance(h.wallet.address(), U256::from(u64::MAX));
        h.ledger.set_fail_submissions(true);

        run_attempt(&h.ctx, &h.wallet, Address::repeat_byte(0x11), &CancellationToken::new())
            .await;

        assert_eq!(h.ledger.submit_calls(), 4);
        assert_eq!(h.ctx.metrics.failed(), 1);
        assert_eq!(h.ctx.metrics.submitted(), 0);
    }

    #[tokio::test]
    async fn test_retries_reuse_the_nonce() {
        let h = harness(MockLedger::new(), MockSigner::new(), AdmissionGate::new(1), fast_config());
        h.ledger.set_fail_submissions(true);

        let err = send_with_retry(&h.ctx, &h.wallet, TxKind::Call(Address::ZERO), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Submit { retries: 3, .. }));

        // only one nonce was consumed by four submissions
        assert_eq!(h.wallet.nonces().allocate().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_backoff_is_linear() {
        let config = fast_config().with_retry_delay(Duration::from_millis(100));
        let h = harness(MockLedger::new(), MockSigner::new(), AdmissionGate::new(1), config);
        h.ledger.set_fail_submissions(true);

        let start = Instant::now();
        let _ = send_with_retry(&h.ctx, &h.wallet, TxKind::Call(Address::ZERO), &CancellationToken::new())
            .await;
        // 100 + 200 + 300
        assert!(start.elapsed() >= Duration::from_millis(600));
        assert!(start.elapsed() < Duration::from_millis(700));
    }

    #[tokio::test]
    async fn test_gas_price_failure_is_retried() {
        let h = harness(MockLedger::new(), MockSigner::new(), AdmissionGate::new(1), fast_config());
        h.ledger.set_fail_gas_price(true);

        let err = send_with_retry(&h.ctx, &h.wallet, TxKind::Call(Address::ZERO), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::FeeEstimate { retries: 3, .. }));
        assert_eq!(h.ledger.gas_price_calls(), 4);
        assert_eq!(h.ledger.submit_calls(), 0);
    }

    #[tokio::test]
    async fn test_sign_failure_is_not_retried() {
        let h =
            harness(MockLedger::new(), MockSigner::failing(), AdmissionGate::new(1), fast_config());

        run_attempt(&h.ctx, &h.wallet, Address::ZERO, &CancellationToken::new()).await;

        assert_eq!(h.ledger.gas_price_calls(), 1);
        assert_eq!(h.ledger.submit_calls(), 0);
        assert_eq!(h.ctx.metrics.failed(), 1);
    }

    #[tokio::test]
    async fn test_nonce_failure_ends_attempt() {
        let h = harness(MockLedger::new(), MockSigner::new(), AdmissionGate::new(1), fast_config());
        h.ledger.set_fail_nonce_queries(true);

        let err = send_with_retry(&h.ctx, &h.wallet, TxKind::Call(Address::ZERO), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Nonce(_)));
        assert_eq!(h.ledger.gas_price_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_verification_counts_success() {
        let config = fast_config().with_verify_delay(Some(Duration::from_millis(500)));
        let h = harness(MockLedger::new(), MockSigner::new(), AdmissionGate::new(1), config);
        h.ledger.set_balance(h.wallet.address(), U256::from(u64::MAX));

        run_attempt(&h.ctx, &h.wallet, Address::repeat_byte(0x11), &CancellationToken::new())
            .await;
        assert_eq!(h.ctx.metrics.submitted(), 1);
        assert_eq!(h.ctx.metrics.succeeded(), 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(h.ctx.metrics.succeeded(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_or_failed_status_leaves_attempt_unresolved() {
        let config = fast_config().with_verify_delay(Some(Duration::from_millis(500)));
        let h = harness(MockLedger::new(), MockSigner::new(), AdmissionGate::new(1), config);
        h.ledger.set_balance(h.wallet.address(), U256::from(u64::MAX));
        let shutdown = CancellationToken::new();

        h.ledger.set_status_override(Some(TxStatus::Unknown));
        run_attempt(&h.ctx, &h.wallet, Address::repeat_byte(0x11), &shutdown).await;
        tokio::time::sleep(Duration::from_millis(600)).await;

        h.ledger.set_status_override(None);
        h.ledger.set_fail_status_queries(true);
        run_attempt(&h.ctx, &h.wallet, Address::repeat_byte(0x22), &shutdown).await;
        h.ctx.wait_for_verifications().await;

        assert_eq!(h.ctx.metrics.submitted(), 2);
        assert_eq!(h.ctx.metrics.succeeded(), 0);
        assert_eq!(h.ctx.metrics.failed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_balance_is_cached_for_ttl() {
        let config = fast_config().with_balance_cache_ttl(Duration::from_secs(1));
        let h = harness(MockLedger::new(), MockSigner::new(), AdmissionGate::new(1), config);
        h.ledger.set_balance(h.wallet.address(), U256::from(1_000_000));
        let mut dispatch = DispatchLoop::new(Arc::clone(&h.wallet), Arc::clone(&h.ctx));

        assert!(dispatch.can_afford_next().await.unwrap());
        // a drained account still reads as funded until the cached value expires
        h.ledger.set_balance(h.wallet.address(), U256::ZERO);
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(dispatch.can_afford_next().await.unwrap());
        assert_eq!(h.ledger.balance_calls(), 1);

        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(!dispatch.can_afford_next().await.unwrap());
        assert_eq!(h.ledger.balance_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_hung_balance_check() {
        let ledger = MockLedger::new().with_balance_latency(Duration::from_secs(3600));
        let gate = AdmissionGate::new(1).with_policy(AdmissionPolicy::Wait);
        let config = fast_config().with_balance_check_interval(1);
        let h = harness(ledger, MockSigner::new(), gate, config);
        h.ledger.set_balance(h.wallet.address(), U256::from(u64::MAX));

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(
            DispatchLoop::new(Arc::clone(&h.wallet), Arc::clone(&h.ctx)).run(shutdown.clone()),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.ledger.balance_calls(), 1);

        let start = Instant::now();
        shutdown.cancel();
        let exit = handle.await.unwrap().unwrap();

        assert_eq!(exit, LoopExit::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_loop_stops_gracefully_within_one_interval() {
        let gate = AdmissionGate::new(1).with_policy(AdmissionPolicy::Wait);
        let config = fast_config().with_balance_check_interval(5).with_balance_cache_ttl(Duration::ZERO);
        let h = harness(MockLedger::new(), MockSigner::new(), gate, config);
        // enough for exactly three transfers
        h.ledger.set_balance(h.wallet.address(), U256::from(3 * 21_001));

        let exit = DispatchLoop::new(Arc::clone(&h.wallet), Arc::clone(&h.ctx))
            .run(CancellationToken::new())
            .await
            .unwrap();
        h.ctx.gate.drain().await;

        assert_eq!(exit, LoopExit::BalanceExhausted);
        assert_eq!(h.ctx.metrics.attempted(), 5);
        assert_eq!(h.ctx.metrics.submitted(), 3);
        assert_eq!(h.ctx.metrics.failed(), 2);
    }

    #[tokio::test]
    async fn test_balance_query_failure_ends_loop_with_error() {
        let config = fast_config().with_balance_check_interval(1);
        let gate = AdmissionGate::new(1).with_policy(AdmissionPolicy::Wait);
        let h = harness(MockLedger::new(), MockSigner::new(), gate, config);
        h.ledger.set_balance(h.wallet.address(), U256::from(u64::MAX));
        h.ledger.set_fail_balance_queries(true);

        let result = DispatchLoop::new(Arc::clone(&h.wallet), Arc::clone(&h.ctx))
            .run(CancellationToken::new())
            .await;

        assert!(matches!(result, Err(DispatchError::BalanceCheck(_))));
        assert_eq!(h.ctx.metrics.summary().total_errors, 1);
    }

    #[tokio::test]
    async fn test_cancelled_loop_exits() {
        let h = harness(MockLedger::new(), MockSigner::new(), AdmissionGate::new(8), fast_config());
        h.ledger.set_balance(h.wallet.address(), U256::from(u64::MAX));
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let exit =
            DispatchLoop::new(Arc::clone(&h.wallet), Arc::clone(&h.ctx)).run(shutdown).await.unwrap();
        assert_eq!(exit, LoopExit::Cancelled);
        assert_eq!(h.ctx.metrics.attempted(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_in_flight_attempts_never_exceed_capacity() {
        let ledger = MockLedger::new().with_submit_latency(Duration::from_millis(20));
        let gate = AdmissionGate::new(4).with_saturation_backoff(Duration::from_millis(1));
        let h = harness(ledger, MockSigner::new(), gate, fast_config());

        let shutdown = CancellationToken::new();
        let mut loops = tokio::task::JoinSet::new();
        for _ in 0..3 {
            let wallet = Arc::new(Wallet::random(Arc::clone(&h.ledger)));
            h.ledger.set_balance(wallet.address(), U256::from(u64::MAX));
            loops.spawn(DispatchLoop::new(wallet, Arc::clone(&h.ctx)).run(shutdown.clone()));
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.cancel();
        while let Some(result) = loops.join_next().await {
            assert_eq!(result.unwrap().unwrap(), LoopExit::Cancelled);
        }
        h.ctx.gate.drain().await;

        assert!(h.ledger.max_in_flight() <= 4);
        assert!(h.ledger.max_in_flight() > 0);
        assert!(h.ctx.metrics.submitted() > 0);
    }
}
