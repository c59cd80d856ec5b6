//! Command line and environment configuration.

use std::{path::PathBuf, time::Duration};

use alloy_primitives::{Bytes, U256};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use eyre::{Result, ensure};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use url::Url;

use crate::{
    AdmissionGate, AdmissionPolicy, DEFAULT_ADMISSION_CAPACITY, DEFAULT_FUNDING_CONCURRENCY,
    DispatchConfig, FleetConfig, SequentialConfig,
};

/// Highest accepted gas limit.
pub const MAX_GAS_LIMIT: u64 = 30_000_000;
/// Highest accepted fleet size.
pub const MAX_WALLET_COUNT: usize = 10_000;
/// Highest accepted admission capacity.
pub const MAX_CONCURRENT_REQUESTS: usize = 10_000;
/// Highest accepted funding concurrency.
pub const MAX_FUNDING_CONCURRENCY: usize = 1_000;

#[derive(Parser, Debug)]
#[command(name = "tx-simulator")]
#[command(about = "Generates sustained transaction load against an Ethereum JSON-RPC endpoint")]
pub struct Cli {
    /// JSON-RPC endpoint of the target node
    #[arg(long, env = "RPC_URL", default_value = "http://127.0.0.1:8545", global = true)]
    pub rpc_url: String,

    /// Private key of the funded source account
    #[arg(long, env = "PRIVATE_KEY", hide_env_values = true, global = true)]
    pub private_key: Option<String>,

    /// Write the run summary to this file as JSON
    #[arg(long, global = true)]
    pub output: Option<PathBuf>,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fund a fleet of accounts and send from all of them concurrently
    Parallel(ParallelArgs),
    /// Send transfers one at a time to random recipients
    Transfer(TxArgs),
    /// Deploy contracts (30%) alongside transfers (70%) from one account
    Deploy(TxArgs),
    /// Deploy a few contracts, then call them
    Interact(InteractArgs),
    /// Run transfers and deployments side by side from one account
    All(TxArgs),
}

/// Transaction shape shared by every workload.
#[derive(Args, Debug, Clone)]
pub struct TxArgs {
    /// Wei sent with each transaction
    #[arg(long, env = "VALUE", default_value = "1")]
    pub value: U256,

    /// Gas limit of each transaction
    #[arg(long, env = "GAS_LIMIT", default_value = "210000")]
    pub gas_limit: u64,

    /// UTF-8 call data attached to each transfer
    #[arg(long, env = "TX_DATA", default_value = "")]
    pub tx_data: String,

    /// Number of transactions for sequential workloads
    #[arg(long, env = "MAX_TRANSACTIONS", default_value = "10000")]
    pub max_transactions: usize,

    /// Seconds to pause between sequential transactions
    #[arg(long, env = "DELAY_SECONDS", default_value = "1")]
    pub delay_seconds: u64,

    /// Random seed for reproducible recipients
    #[arg(long)]
    pub seed: Option<u64>,
}

impl TxArgs {
    /// Call data as bytes.
    pub fn payload(&self) -> Bytes {
        Bytes::copy_from_slice(self.tx_data.as_bytes())
    }

    /// Settings for the sequential workloads.
    pub fn sequential_config(&self) -> SequentialConfig {
        SequentialConfig::default()
            .with_value(self.value)
            .with_gas_limit(self.gas_limit)
            .with_payload(self.payload())
            .with_delay(Duration::from_secs(self.delay_seconds))
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            (1..=MAX_GAS_LIMIT).contains(&self.gas_limit),
            "GAS_LIMIT must be between 1 and {MAX_GAS_LIMIT} (got {})",
            self.gas_limit
        );
        Ok(())
    }
}

#[derive(Args, Debug, Clone)]
pub struct InteractArgs {
    #[command(flatten)]
    pub tx: TxArgs,

    /// Contracts deployed before interacting
    #[arg(long, default_value = "5")]
    pub contracts: usize,
}

#[derive(Args, Debug, Clone)]
pub struct ParallelArgs {
    #[command(flatten)]
    pub tx: TxArgs,

    /// Minimum source balance (wei) required to create a fleet
    #[arg(long, env = "MIN_BALANCE", default_value = "100000")]
    pub min_balance: U256,

    /// Number of accounts to generate
    #[arg(long, env = "WALLET_COUNT", default_value = "1000")]
    pub wallet_count: usize,

    /// Wei sent to each generated account
    #[arg(long, env = "FUNDING_AMOUNT", default_value = "100")]
    pub funding_amount: U256,

    /// Maximum send attempts in flight across all accounts
    #[arg(long, env = "MAX_CONCURRENT_REQUESTS", default_value_t = DEFAULT_ADMISSION_CAPACITY)]
    pub max_concurrent_requests: usize,

    /// What to do when every admission slot is taken
    #[arg(long, env = "ADMISSION_POLICY", value_enum, default_value_t = AdmissionPolicy::Skip)]
    pub admission_policy: AdmissionPolicy,

    /// Check the balance every N attempts
    #[arg(long, env = "BALANCE_CHECK_INTERVAL", default_value = "100")]
    pub balance_check_interval: u64,

    /// Funding transfers in flight at once
    #[arg(long, env = "FUNDING_CONCURRENCY", default_value_t = DEFAULT_FUNDING_CONCURRENCY)]
    pub funding_concurrency: usize,

    /// Retries after a failed fee estimate or submission
    #[arg(long, env = "MAX_RETRIES", default_value = "3")]
    pub max_retries: u32,

    /// Base retry delay in milliseconds
    #[arg(long, env = "RETRY_DELAY_MS", default_value = "100")]
    pub retry_delay_ms: u64,
}

impl ParallelArgs {
    /// Settings for every dispatch loop.
    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig::default()
            .with_value(self.tx.value)
            .with_gas_limit(self.tx.gas_limit)
            .with_payload(self.tx.payload())
            .with_balance_check_interval(self.balance_check_interval)
            .with_max_retries(self.max_retries)
            .with_retry_delay(Duration::from_millis(self.retry_delay_ms))
    }

    /// Fleet settings.
    pub fn fleet_config(&self) -> FleetConfig {
        FleetConfig::default()
            .with_wallet_count(self.wallet_count)
            .with_funding_amount(self.funding_amount)
            .with_funding_concurrency(self.funding_concurrency)
            .with_min_balance(self.min_balance)
    }

    /// The global admission gate.
    pub fn admission_gate(&self) -> AdmissionGate {
        AdmissionGate::new(self.max_concurrent_requests).with_policy(self.admission_policy)
    }

    fn validate(&self) -> Result<()> {
        self.tx.validate()?;
        ensure!(
            self.wallet_count <= MAX_WALLET_COUNT,
            "WALLET_COUNT must be at most {MAX_WALLET_COUNT} (got {})",
            self.wallet_count
        );
        ensure!(
            (1..=MAX_CONCURRENT_REQUESTS).contains(&self.max_concurrent_requests),
            "MAX_CONCURRENT_REQUESTS must be between 1 and {MAX_CONCURRENT_REQUESTS} (got {})",
            self.max_concurrent_requests
        );
        ensure!(self.balance_check_interval > 0, "BALANCE_CHECK_INTERVAL must be positive");
        ensure!(
            (1..=MAX_FUNDING_CONCURRENCY).contains(&self.funding_concurrency),
            "FUNDING_CONCURRENCY must be between 1 and {MAX_FUNDING_CONCURRENCY} (got {})",
            self.funding_concurrency
        );
        Ok(())
    }
}

impl Cli {
    /// Loads `.env` when present, then parses arguments and environment.
    pub fn load() -> Self {
        dotenvy::dotenv().ok();
        Self::parse()
    }

    /// Checks the configuration before anything touches the network.
    pub fn validate(&self) -> Result<()> {
        let private_key = self.private_key.as_deref().unwrap_or_default();
        ensure!(!private_key.is_empty(), "PRIVATE_KEY is required");
        let private_key = private_key.trim().trim_start_matches("0x");
        ensure!(
            private_key.len() == 64,
            "PRIVATE_KEY must be 64 hex characters (got {})",
            private_key.len()
        );
        ensure!(hex::decode(private_key).is_ok(), "PRIVATE_KEY is not valid hex");

        let url = Url::parse(&self.rpc_url).map_err(|e| eyre::eyre!("RPC_URL is invalid: {e}"))?;
        ensure!(
            matches!(url.scheme(), "http" | "https"),
            "RPC_URL must start with http:// or https://"
        );

        match &self.command {
            Commands::Parallel(args) => args.validate(),
            Commands::Interact(args) => args.tx.validate(),
            Commands::Transfer(args) | Commands::Deploy(args) | Commands::All(args) => {
                args.validate()
            }
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Timestamp, level, target and message.
    #[default]
    Full,
    /// Level and message only.
    Compact,
    /// One JSON object per event.
    Json,
}

/// Verbosity and format of log output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Args)]
pub struct LoggingArgs {
    /// Increase logging verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub verbosity: u8,

    /// Log output format
    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Full, global = true)]
    pub format: LogFormat,
}

impl LoggingArgs {
    /// Maps the verbosity count to a level filter.
    pub const fn log_level_filter(&self) -> LevelFilter {
        match self.verbosity {
            0 => LevelFilter::WARN,
            1 => LevelFilter::INFO,
            2 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }

    /// Installs the global tracing subscriber. `RUST_LOG` overrides the verbosity.
    pub fn init_tracing(&self) {
        let filter = EnvFilter::builder()
            .with_default_directive(self.log_level_filter().into())
            .from_env_lossy();

        match self.format {
            LogFormat::Full => tracing_subscriber::fmt().with_env_filter(filter).init(),
            LogFormat::Compact => tracing_subscriber::fmt().compact().with_env_filter(filter).init(),
            LogFormat::Json => {
                tracing_subscriber::fmt().json().with_env_filter(filter).with_ansi(false).init()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("tx-simulator").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_parallel_defaults() {
        let cli = parse(&["--private-key", KEY, "parallel"]);
        cli.validate().unwrap();

        let Commands::Parallel(args) = &cli.command else { panic!("expected parallel") };
        assert_eq!(args.wallet_count, 1000);
        assert_eq!(args.max_concurrent_requests, 2000);
        assert_eq!(args.funding_concurrency, 50);
        assert_eq!(args.admission_policy, AdmissionPolicy::Skip);

        let dispatch = args.dispatch_config();
        assert_eq!(dispatch.gas_limit, 210_000);
        assert_eq!(dispatch.value, U256::from(1));
        assert_eq!(dispatch.balance_check_interval, 100);

        let fleet = args.fleet_config();
        assert_eq!(fleet.min_balance, U256::from(100_000));
        assert_eq!(fleet.funding_amount, U256::from(100));
    }

    #[test]
    fn test_rejects_bad_private_key() {
        assert!(parse(&["transfer"]).validate().is_err());
        assert!(parse(&["--private-key", "0x1234", "transfer"]).validate().is_err());
        let not_hex = format!("0x{}", "zz".repeat(32));
        assert!(parse(&["--private-key", &not_hex, "transfer"]).validate().is_err());
    }

    #[test]
    fn test_rejects_unsupported_rpc_scheme() {
        let cli = parse(&["--private-key", KEY, "--rpc-url", "ftp://node:8545", "transfer"]);
        assert!(cli.validate().is_err());
        let cli = parse(&["--private-key", KEY, "--rpc-url", "wss://node:8546", "transfer"]);
        assert!(cli.validate().is_err());
        let cli = parse(&["--private-key", KEY, "--rpc-url", "https://node:8545", "transfer"]);
        cli.validate().unwrap();
    }

    #[test]
    fn test_rejects_out_of_range_limits() {
        let cli = parse(&["--private-key", KEY, "transfer", "--gas-limit", "30000001"]);
        assert!(cli.validate().is_err());

        let cli = parse(&["--private-key", KEY, "parallel", "--wallet-count", "10001"]);
        assert!(cli.validate().is_err());

        let cli = parse(&["--private-key", KEY, "parallel", "--max-concurrent-requests", "0"]);
        assert!(cli.validate().is_err());

        let cli = parse(&["--private-key", KEY, "parallel", "--funding-concurrency", "1001"]);
        assert!(cli.validate().is_err());

        let cli = parse(&["--private-key", KEY, "parallel", "--balance-check-interval", "0"]);
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_wait_policy_and_verbosity() {
        let cli = parse(&["-vv", "--private-key", KEY, "parallel", "--admission-policy", "wait"]);
        assert_eq!(cli.logging.log_level_filter(), LevelFilter::DEBUG);
        let Commands::Parallel(args) = &cli.command else { panic!("expected parallel") };
        assert_eq!(args.admission_gate().policy(), AdmissionPolicy::Wait);
    }
}
