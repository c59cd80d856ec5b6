use std::{sync::Arc, time::Duration};

use alloy_primitives::Address;
use eyre::{Result, WrapErr};
use indicatif::{ProgressBar, ProgressStyle};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tx_simulator::{
    AlloyLedgerClient, DispatchCoordinator, Eip155Signer, LedgerClient, SequentialSender, Wallet,
    config::{Cli, Commands, InteractArgs, ParallelArgs, TxArgs},
    random_addresses,
};

const RECIPIENT_COUNT: usize = 25;

type Client = AlloyLedgerClient;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::load();
    cli.logging.init_tracing();
    cli.validate()?;

    let client = Arc::new(AlloyLedgerClient::new_http(&cli.rpc_url)?);
    let private_key = cli.private_key.as_deref().unwrap_or_default();
    let source = Arc::new(Wallet::from_private_key(private_key, Arc::clone(&client))?);
    info!(rpc_url = %cli.rpc_url, source = %source.address(), "tx-simulator starting");

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, shutting down");
                shutdown.cancel();
            }
        });
    }

    match &cli.command {
        Commands::Parallel(args) => run_parallel(&cli, args, client, source, shutdown).await,
        Commands::Transfer(args) => run_transfer(args, client, source, &shutdown).await,
        Commands::Deploy(args) => run_deploy(args, client, source, &shutdown).await,
        Commands::Interact(args) => run_interact(args, client, source, &shutdown).await,
        Commands::All(args) => run_all(args, client, source, &shutdown).await,
    }
}

fn recipients(seed: Option<u64>) -> Vec<Address> {
    let mut rng = match seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::from_os_rng(),
    };
    random_addresses(RECIPIENT_COUNT, &mut rng)
}

async fn sequential_sender(
    args: &TxArgs,
    client: &Arc<Client>,
    source: &Arc<Wallet<Client>>,
    stream: u64,
) -> Result<SequentialSender<Client, Eip155Signer>> {
    let chain_id = client.chain_id().await.wrap_err("Failed to get chain ID")?;
    let sender = SequentialSender::new(
        Arc::clone(client),
        Arc::new(Eip155Signer),
        Arc::clone(source),
        chain_id,
        args.sequential_config(),
    );
    Ok(match args.seed {
        Some(seed) => sender.with_seed(seed.wrapping_add(stream)),
        None => sender,
    })
}

async fn run_parallel(
    cli: &Cli,
    args: &ParallelArgs,
    client: Arc<Client>,
    source: Arc<Wallet<Client>>,
    shutdown: CancellationToken,
) -> Result<()> {
    let funding_bar = ProgressBar::new(args.wallet_count as u64);
    funding_bar.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .wrap_err("invalid progress template")?
            .progress_chars("##-"),
    );

    let coordinator = DispatchCoordinator::new(client, Arc::new(Eip155Signer), args.dispatch_config())
        .with_fleet(args.fleet_config())
        .with_gate(args.admission_gate())
        .with_funding_progress(funding_bar);

    let metrics = coordinator.metrics();
    let ticker = tokio::spawn(async move {
        let spinner = ProgressBar::new_spinner();
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            spinner.set_message(format!(
                "Submitted: {} | Failed: {} | Succeeded: {}",
                metrics.submitted(),
                metrics.failed(),
                metrics.succeeded()
            ));
            spinner.tick();
        }
    });

    let result = coordinator.run(source, recipients(args.tx.seed), shutdown).await;
    ticker.abort();
    let summary = result?;

    println!("{summary}");
    if let Some(path) = &cli.output {
        summary.write_json(path)?;
        info!(path = %path.display(), "run summary written");
    }
    Ok(())
}

async fn run_transfer(
    args: &TxArgs,
    client: Arc<Client>,
    source: Arc<Wallet<Client>>,
    shutdown: &CancellationToken,
) -> Result<()> {
    let mut sender = sequential_sender(args, &client, &source, 0).await?;
    let sent = sender
        .send_transfers(&recipients(args.seed), args.max_transactions, shutdown)
        .await
        .wrap_err("Failed to send transactions")?;
    println!("Sent {} transactions", sent.len());
    Ok(())
}

async fn run_deploy(
    args: &TxArgs,
    client: Arc<Client>,
    source: Arc<Wallet<Client>>,
    shutdown: &CancellationToken,
) -> Result<()> {
    source.nonces().reset().await.wrap_err("Failed to initialize nonce allocator")?;

    let deployments = args.max_transactions * 3 / 10;
    let transfers = args.max_transactions * 7 / 10;
    let mut deployer = sequential_sender(args, &client, &source, 0).await?;
    let mut sender = sequential_sender(args, &client, &source, 1).await?;
    let recipients = recipients(args.seed);

    let (deployed, sent) = tokio::join!(
        deployer.deploy_contracts(deployments, shutdown),
        sender.send_transfers(&recipients, transfers, shutdown),
    );
    report_side_by_side(deployed, sent)
}

async fn run_interact(
    args: &InteractArgs,
    client: Arc<Client>,
    source: Arc<Wallet<Client>>,
    shutdown: &CancellationToken,
) -> Result<()> {
    let mut sender = sequential_sender(&args.tx, &client, &source, 0).await?;
    let contracts = sender
        .deploy_contracts(args.contracts, shutdown)
        .await
        .wrap_err("Failed to deploy contracts")?;
    let calls = sender
        .interact(&contracts, args.tx.max_transactions, shutdown)
        .await
        .wrap_err("Failed to interact with contracts")?;
    println!("Deployed {} contracts, sent {} calls", contracts.len(), calls.len());
    Ok(())
}

async fn run_all(
    args: &TxArgs,
    client: Arc<Client>,
    source: Arc<Wallet<Client>>,
    shutdown: &CancellationToken,
) -> Result<()> {
    source.nonces().reset().await.wrap_err("Failed to initialize nonce allocator")?;

    let mut sender = sequential_sender(args, &client, &source, 0).await?;
    let mut deployer = sequential_sender(args, &client, &source, 1).await?;
    let recipients = recipients(args.seed);

    let (sent, deployed) = tokio::join!(
        sender.send_transfers(&recipients, args.max_transactions, shutdown),
        deployer.deploy_contracts(args.max_transactions, shutdown),
    );
    report_side_by_side(deployed, sent)
}

fn report_side_by_side<A, B>(deployed: Result<Vec<A>>, sent: Result<Vec<B>>) -> Result<()> {
    match (&deployed, &sent) {
        (Ok(deployed), Ok(sent)) => {
            println!("Deployed {} contracts, sent {} transactions", deployed.len(), sent.len());
        }
        _ => {
            if let Err(e) = &deployed {
                warn!(error = ?e, "failed to deploy contracts");
            }
            if let Err(e) = &sent {
                warn!(error = ?e, "failed to send transactions");
            }
        }
    }
    deployed.and(sent).map(|_| ())
}
