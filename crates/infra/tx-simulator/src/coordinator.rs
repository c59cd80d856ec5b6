//! Fleet assembly and the parallel run.

use std::{collections::HashSet, fmt, fs::File, io::BufWriter, path::Path, sync::Arc};

use alloy_primitives::{Address, U256};
use eyre::{Result, WrapErr};
use indicatif::ProgressBar;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    AdmissionGate, DEFAULT_ADMISSION_CAPACITY, DEFAULT_FUNDING_CONCURRENCY, DispatchConfig,
    DispatchContext, DispatchLoop, DispatchMetrics, FundingDistributor, FundingReport,
    LedgerClient, LoopExit, MetricsSummary, TransactionSigner, Wallet, WalletFleet,
    generate_wallets,
};

/// How the fleet of extra sender accounts is built.
#[derive(Clone, Debug)]
pub struct FleetConfig {
    /// Accounts generated when the source can afford them.
    pub wallet_count: usize,
    /// Wei sent to each generated account.
    pub funding_amount: U256,
    /// Funding transfers in flight at once.
    pub funding_concurrency: usize,
    /// The source must hold strictly more than this for a fleet to be created.
    pub min_balance: U256,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            wallet_count: 1000,
            funding_amount: U256::from(100),
            funding_concurrency: DEFAULT_FUNDING_CONCURRENCY,
            min_balance: U256::from(100_000),
        }
    }
}

impl FleetConfig {
    /// Sets the number of generated accounts.
    pub fn with_wallet_count(mut self, count: usize) -> Self {
        self.wallet_count = count;
        self
    }

    /// Sets the wei sent to each generated account.
    pub fn with_funding_amount(mut self, amount: U256) -> Self {
        self.funding_amount = amount;
        self
    }

    /// Sets the funding concurrency.
    pub fn with_funding_concurrency(mut self, concurrency: usize) -> Self {
        self.funding_concurrency = concurrency;
        self
    }

    /// Sets the source balance threshold for fleet creation.
    pub fn with_min_balance(mut self, min_balance: U256) -> Self {
        self.min_balance = min_balance;
        self
    }
}

/// How a single dispatch loop ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum LoopOutcome {
    /// The account ran out of funds.
    BalanceExhausted,
    /// The run was cancelled.
    Cancelled,
    /// The loop stopped on an error.
    Failed(String),
}

impl From<LoopExit> for LoopOutcome {
    fn from(exit: LoopExit) -> Self {
        match exit {
            LoopExit::BalanceExhausted => Self::BalanceExhausted,
            LoopExit::Cancelled => Self::Cancelled,
        }
    }
}

/// Final state of one account's loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopReport {
    /// Sending account.
    pub wallet: Address,
    /// How its loop ended.
    pub outcome: LoopOutcome,
}

/// Everything a parallel run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Chain the run targeted.
    pub chain_id: u64,
    /// Number of accounts that ran a dispatch loop.
    pub accounts: usize,
    /// Funding outcome, when a fleet was created.
    pub funding: Option<FundingReport>,
    /// One entry per dispatch loop.
    pub loops: Vec<LoopReport>,
    /// Send counters and recent errors.
    pub metrics: MetricsSummary,
}

impl RunSummary {
    /// Writes the summary to `path` as pretty-printed JSON.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .wrap_err_with(|| format!("Failed to create {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .wrap_err("Failed to write run summary")?;
        Ok(())
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Chain ID: {}", self.chain_id)?;
        writeln!(f, "Accounts: {}", self.accounts)?;
        if let Some(funding) = &self.funding {
            writeln!(f, "Funded: {}/{}", funding.funded.len(), funding.attempted())?;
        }
        let exhausted =
            self.loops.iter().filter(|l| l.outcome == LoopOutcome::BalanceExhausted).count();
        let failed = self.loops.iter().filter(|l| matches!(l.outcome, LoopOutcome::Failed(_))).count();
        writeln!(f, "Loops exhausted: {exhausted}, failed: {failed}")?;
        write!(f, "{}", self.metrics)
    }
}

/// Builds the sender fleet and runs one [`DispatchLoop`] per account.
pub struct DispatchCoordinator<C, S> {
    client: Arc<C>,
    signer: Arc<S>,
    dispatch: DispatchConfig,
    fleet: FleetConfig,
    gate: Arc<AdmissionGate>,
    metrics: Arc<DispatchMetrics>,
    funding_progress: ProgressBar,
}

impl<C, S> fmt::Debug for DispatchCoordinator<C, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchCoordinator")
            .field("dispatch", &self.dispatch)
            .field("fleet", &self.fleet)
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}

impl<C: LedgerClient, S: TransactionSigner> DispatchCoordinator<C, S> {
    /// Creates a coordinator with default fleet settings and a
    /// [`DEFAULT_ADMISSION_CAPACITY`] admission gate.
    pub fn new(client: Arc<C>, signer: Arc<S>, dispatch: DispatchConfig) -> Self {
        Self {
            client,
            signer,
            dispatch,
            fleet: FleetConfig::default(),
            gate: Arc::new(AdmissionGate::new(DEFAULT_ADMISSION_CAPACITY)),
            metrics: Arc::new(DispatchMetrics::new()),
            funding_progress: ProgressBar::hidden(),
        }
    }

    /// Sets the fleet settings.
    pub fn with_fleet(mut self, fleet: FleetConfig) -> Self {
        self.fleet = fleet;
        self
    }

    /// Replaces the admission gate.
    pub fn with_gate(mut self, gate: AdmissionGate) -> Self {
        self.gate = Arc::new(gate);
        self
    }

    /// Reports funding progress on `progress`.
    pub fn with_funding_progress(mut self, progress: ProgressBar) -> Self {
        self.funding_progress = progress;
        self
    }

    /// Returns the metrics shared by every loop, for live reporting.
    pub fn metrics(&self) -> Arc<DispatchMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Assembles the fleet, runs every loop to completion and summarizes the run.
    ///
    /// Only setup failures (chain id, source balance, source nonce reset) are
    /// returned as errors; loop and attempt failures end up in the summary.
    /// Unless cancelled, in-flight attempts and their verifications finish
    /// before the summary is taken.
    pub async fn run(
        &self,
        source: Arc<Wallet<C>>,
        recipients: Vec<Address>,
        shutdown: CancellationToken,
    ) -> Result<RunSummary> {
        let chain_id = self.client.chain_id().await.wrap_err("Failed to get chain ID")?;
        let (fleet, funding) = self.assemble_fleet(source, chain_id).await?;

        let ctx = Arc::new(DispatchContext::new(
            Arc::clone(&self.client),
            Arc::clone(&self.signer),
            Arc::clone(&self.gate),
            Arc::clone(&self.metrics),
            self.dispatch.clone(),
            chain_id,
            recipients,
        ));

        info!(
            accounts = fleet.len(),
            capacity = self.gate.capacity(),
            policy = ?self.gate.policy(),
            "starting dispatch loops"
        );

        let mut loops = JoinSet::new();
        for wallet in fleet.all() {
            let address = wallet.address();
            let dispatch = DispatchLoop::new(Arc::clone(wallet), Arc::clone(&ctx));
            let shutdown = shutdown.clone();
            loops.spawn(async move { (address, dispatch.run(shutdown).await) });
        }

        let mut reports = Vec::with_capacity(fleet.len());
        while let Some(joined) = loops.join_next().await {
            match joined {
                Ok((wallet, Ok(exit))) => reports.push(LoopReport { wallet, outcome: exit.into() }),
                Ok((wallet, Err(e))) => {
                    reports.push(LoopReport { wallet, outcome: LoopOutcome::Failed(e.to_string()) })
                }
                Err(e) => warn!(error = %e, "dispatch loop panicked"),
            }
        }

        if !shutdown.is_cancelled() {
            info!("waiting for in-flight transactions");
            self.gate.drain().await;
            ctx.wait_for_verifications().await;
        }

        let summary = RunSummary {
            chain_id,
            accounts: fleet.len(),
            funding,
            loops: reports,
            metrics: self.metrics.summary(),
        };
        info!(
            attempted = summary.metrics.attempted,
            submitted = summary.metrics.submitted,
            failed = summary.metrics.failed,
            "parallel run finished"
        );
        Ok(summary)
    }

    async fn assemble_fleet(
        &self,
        source: Arc<Wallet<C>>,
        chain_id: u64,
    ) -> Result<(WalletFleet<C>, Option<FundingReport>)> {
        let balance = self
            .client
            .balance(source.address())
            .await
            .wrap_err("Failed to check source balance")?;

        let mut fleet = WalletFleet::new(Arc::clone(&source));
        if balance <= self.fleet.min_balance || self.fleet.wallet_count == 0 {
            info!(%balance, min_balance = %self.fleet.min_balance, "sending from the source account only");
            return Ok((fleet, None));
        }

        source.nonces().reset().await.wrap_err("Failed to initialize source nonce")?;

        let generated = generate_wallets(self.fleet.wallet_count, &self.client);
        let targets: Vec<Address> = generated.iter().map(|w| w.address()).collect();

        let report = FundingDistributor::new(Arc::clone(&self.client), Arc::clone(&self.signer), chain_id)
            .with_concurrency(self.fleet.funding_concurrency)
            .with_progress(self.funding_progress.clone())
            .fund(&source, &targets, self.fleet.funding_amount)
            .await;

        // unfunded accounts would only produce failing attempts
        let funded: HashSet<Address> = report.funded.iter().copied().collect();
        fleet.extend(generated.into_iter().filter(|w| funded.contains(&w.address())));
        Ok((fleet, Some(report)))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        AdmissionPolicy,
        test_utils::{MockLedger, MockSigner},
    };

    fn coordinator(ledger: &Arc<MockLedger>) -> DispatchCoordinator<MockLedger, MockSigner> {
        let dispatch = DispatchConfig::default()
            .with_gas_limit(21_000)
            .with_balance_check_interval(2)
            .with_balance_cache_ttl(Duration::ZERO)
            .with_retry_delay(Duration::ZERO)
            .with_verify_delay(None);
        DispatchCoordinator::new(Arc::clone(ledger), Arc::new(MockSigner::new()), dispatch)
            .with_gate(AdmissionGate::new(1).with_policy(AdmissionPolicy::Wait))
    }

    #[tokio::test]
    async fn test_poor_source_runs_alone() {
        let ledger = Arc::new(MockLedger::new());
        let source = Arc::new(Wallet::random(Arc::clone(&ledger)));
        ledger.set_balance(source.address(), U256::from(100_000));

        let summary = coordinator(&ledger)
            .run(source, vec![Address::with_last_byte(1)], CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.accounts, 1);
        assert!(summary.funding.is_none());
        assert_eq!(summary.loops.len(), 1);
        assert_eq!(summary.loops[0].outcome, LoopOutcome::BalanceExhausted);
        // four transfers of 21_001 fit in 100_000
        assert_eq!(summary.metrics.submitted, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_summary_counts_verifications_still_pending_at_exhaustion() {
        let ledger = Arc::new(MockLedger::new());
        let source = Arc::new(Wallet::random(Arc::clone(&ledger)));
        ledger.set_balance(source.address(), U256::from(100_000));

        let coordinator = DispatchCoordinator::new(
            Arc::clone(&ledger),
            Arc::new(MockSigner::new()),
            DispatchConfig::default()
                .with_gas_limit(21_000)
                .with_balance_check_interval(2)
                .with_balance_cache_ttl(Duration::ZERO)
                .with_retry_delay(Duration::ZERO)
                .with_verify_delay(Some(Duration::from_millis(500))),
        )
        .with_gate(AdmissionGate::new(1).with_policy(AdmissionPolicy::Wait));

        let summary = coordinator
            .run(source, vec![Address::with_last_byte(1)], CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.metrics.submitted, 4);
        assert_eq!(summary.metrics.succeeded, summary.metrics.submitted);
    }

    #[tokio::test]
    async fn test_rich_source_funds_fleet_and_every_loop_exhausts() {
        let ledger = Arc::new(MockLedger::new());
        let source = Arc::new(Wallet::random(Arc::clone(&ledger)));
        ledger.set_balance(source.address(), U256::from(1_000_000));

        let fleet = FleetConfig::default()
            .with_wallet_count(5)
            .with_funding_amount(U256::from(50_000))
            .with_funding_concurrency(2);
        let summary = coordinator(&ledger)
            .with_fleet(fleet)
            .run(source, vec![Address::with_last_byte(1)], CancellationToken::new())
            .await
            .unwrap();

        let funding = summary.funding.as_ref().unwrap();
        assert_eq!(funding.funded.len(), 5);
        assert_eq!(summary.accounts, 6);
        assert_eq!(summary.loops.len(), 6);
        assert!(summary.loops.iter().all(|l| l.outcome == LoopOutcome::BalanceExhausted));
        for wallet in &funding.funded {
            // 50_000 covers two transfers
            assert_eq!(ledger.accepted_nonces(*wallet), vec![0, 1]);
        }
    }

    #[tokio::test]
    async fn test_only_funded_wallets_join_the_fleet() {
        let ledger = Arc::new(MockLedger::new());
        let source = Arc::new(Wallet::random(Arc::clone(&ledger)));
        // three funding transfers of 21_000 + 50_000 fit, the other two are rejected
        ledger.set_balance(source.address(), U256::from(250_000));

        let fleet = FleetConfig::default()
            .with_wallet_count(5)
            .with_funding_amount(U256::from(50_000))
            .with_funding_concurrency(5);
        let summary = coordinator(&ledger)
            .with_fleet(fleet)
            .run(Arc::clone(&source), vec![Address::with_last_byte(1)], CancellationToken::new())
            .await
            .unwrap();

        let funding = summary.funding.as_ref().unwrap();
        assert_eq!(funding.funded.len(), 3);
        assert_eq!(funding.failed(), 2);
        assert_eq!(summary.accounts, 4);
        let looped: HashSet<Address> = summary.loops.iter().map(|l| l.wallet).collect();
        assert!(looped.contains(&source.address()));
        assert!(funding.funded.iter().all(|wallet| looped.contains(wallet)));
        assert!(funding.failures.iter().all(|(wallet, _)| !looped.contains(wallet)));
    }

    #[tokio::test]
    async fn test_setup_failure_is_fatal() {
        let ledger = Arc::new(MockLedger::new());
        let source = Arc::new(Wallet::random(Arc::clone(&ledger)));
        ledger.set_fail_balance_queries(true);

        let result =
            coordinator(&ledger).run(source, Vec::new(), CancellationToken::new()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_cancelled_run_reports_cancelled_loops() {
        let ledger = Arc::new(MockLedger::new());
        let source = Arc::new(Wallet::random(Arc::clone(&ledger)));
        ledger.set_balance(source.address(), U256::from(10));
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let summary = coordinator(&ledger).run(source, Vec::new(), shutdown).await.unwrap();
        assert_eq!(summary.loops[0].outcome, LoopOutcome::Cancelled);
        assert_eq!(summary.metrics.attempted, 0);
    }

    #[test]
    fn test_write_json() {
        let summary = RunSummary {
            chain_id: 8453,
            accounts: 1,
            funding: None,
            loops: vec![LoopReport {
                wallet: Address::with_last_byte(7),
                outcome: LoopOutcome::Failed("balance query failed".into()),
            }],
            metrics: MetricsSummary::default(),
        };
        let path =
            std::env::temp_dir().join(format!("tx-simulator-summary-{}.json", std::process::id()));

        summary.write_json(&path).unwrap();
        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(written["chain_id"], 8453);
        assert_eq!(written["loops"][0]["outcome"]["status"], "failed");
        assert_eq!(written["loops"][0]["outcome"]["error"], "balance query failed");
    }
}
