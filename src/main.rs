//! Derivative client - deploy, inspect, and fund two-party custom derivatives
//!
//! One-shot commands act on a single instance and exit. `serve` keeps the
//! snapshot fresh and exposes it over HTTP alongside Prometheus metrics.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use clap::{Parser, Subcommand};
use ethers::types::{Address, H256};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

use derivative_client::api::{self, AppState};
use derivative_client::assets::{AssetRegistry, Explorer};
use derivative_client::chain::finality::recommended_confirmations;
use derivative_client::chain::{ChainProvider, IdentityWatcher, SigningProvider, WalletSigner};
use derivative_client::config::{Settings, CONFIG_ENV};
use derivative_client::metrics::{self, MetricsServer};
use derivative_client::orchestrator::{
    ContractInteractionOrchestrator, DeployRequest, DepositIntent, SnapshotPoller,
};
use derivative_client::state::{Position, Role, SnapshotView};
use derivative_client::ClientError;

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "derivative-client", version, about)]
struct Cli {
    /// Configuration file
    #[arg(long, env = CONFIG_ENV, default_value = "config/default.toml")]
    config: PathBuf,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Override the configured confirmation timeout, in seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Read and display an instance
    Show {
        #[arg(long, value_parser = parse_address)]
        contract: Option<Address>,
    },
    /// Deploy a new instance through the factory
    Deploy {
        /// Underlying asset symbol, e.g. ETH
        #[arg(long)]
        underlying: String,
        /// Strike price as a decimal
        #[arg(long)]
        strike: String,
        /// Settlement time as RFC 3339 or unix seconds
        #[arg(long, value_parser = parse_settlement)]
        settlement: DateTime<Utc>,
        /// Collateral asset symbol, e.g. USDC
        #[arg(long)]
        collateral: String,
        /// Collateral amount each party deposits
        #[arg(long)]
        amount: String,
        /// Deployer's side: long or short
        #[arg(long)]
        position: Position,
    },
    /// Deposit collateral for a role, approving the token first if needed
    Deposit {
        #[arg(long, value_parser = parse_address)]
        contract: Option<Address>,
        /// deployer or counterparty
        #[arg(long = "as")]
        role: Role,
    },
    /// Settle an instance after its settlement time
    Settle {
        #[arg(long, value_parser = parse_address)]
        contract: Option<Address>,
    },
    /// Request cancellation as the connected party
    Cancel {
        #[arg(long, value_parser = parse_address)]
        contract: Option<Address>,
    },
    /// Cancel an instance whose counterparty never deposited
    CancelIncomplete {
        #[arg(long, value_parser = parse_address)]
        contract: Option<Address>,
    },
    /// Look up a submitted transaction
    TxStatus {
        #[arg(value_parser = parse_hash)]
        hash: H256,
    },
    /// Poll an instance and serve it over HTTP
    Serve {
        #[arg(long, value_parser = parse_address)]
        contract: Option<Address>,
    },
}

/// Everything the commands share
struct Client {
    settings: Settings,
    provider: Arc<ChainProvider>,
    orchestrator: Arc<ContractInteractionOrchestrator>,
    explorer: Arc<Explorer>,
    timeout: Duration,
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let settings = Settings::load_from(&cli.config)?;
    info!(
        "Derivative client v{} on {} (chain {})",
        env!("CARGO_PKG_VERSION"),
        settings.network.name,
        settings.network.chain_id
    );

    let client = Client::connect(settings, cli.timeout, cli.json).await?;
    match cli.command {
        Command::Show { contract } => client.show(contract).await,
        Command::Deploy {
            underlying,
            strike,
            settlement,
            collateral,
            amount,
            position,
        } => {
            let request = DeployRequest {
                underlying,
                strike_price: strike,
                settlement_time: settlement,
                collateral,
                collateral_amount: amount,
                position,
            };
            client.deploy(request).await
        }
        Command::Deposit { contract, role } => client.deposit(contract, role).await,
        Command::Settle { contract } => {
            let contract = client.contract(contract)?;
            let receipt = client
                .orchestrator
                .settle(contract, client.timeout)
                .await
                .map_err(explain)?;
            client.print_tx("Settled", receipt.tx_hash)?;
            client.show(Some(contract)).await
        }
        Command::Cancel { contract } => {
            let contract = client.contract(contract)?;
            let receipt = client
                .orchestrator
                .request_cancellation(contract, client.timeout)
                .await
                .map_err(explain)?;
            client.print_tx("Cancellation requested", receipt.tx_hash)?;
            client.show(Some(contract)).await
        }
        Command::CancelIncomplete { contract } => {
            let contract = client.contract(contract)?;
            let receipt = client
                .orchestrator
                .cancel_incomplete_deposit(contract, client.timeout)
                .await
                .map_err(explain)?;
            client.print_tx("Cancelled", receipt.tx_hash)?;
            client.show(Some(contract)).await
        }
        Command::TxStatus { hash } => {
            let status = client.orchestrator.transaction_status(hash).await?;
            if client.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("{:?}: {:?}", hash, status);
                println!("{}", client.explorer.tx_url(&hash));
            }
            Ok(())
        }
        Command::Serve { contract } => client.serve(contract).await,
    }
}

impl Client {
    async fn connect(settings: Settings, timeout: Option<u64>, json: bool) -> Result<Self> {
        let provider = Arc::new(ChainProvider::new(settings.network.clone())?);
        let signer = Arc::new(WalletSigner::from_env(
            provider.clone(),
            settings.wallet.private_key_env.as_deref(),
        )?);

        let chain_id = signer
            .network()
            .await
            .context("Failed to reach the configured network")?;
        if chain_id != settings.network.chain_id {
            bail!(
                "RPC reports chain {} but configuration expects {}",
                chain_id,
                settings.network.chain_id
            );
        }
        let recommended = recommended_confirmations(chain_id);
        if settings.network.confirmation_blocks < recommended {
            warn!(
                "confirmation_blocks = {} is below the {} recommended for chain {}",
                settings.network.confirmation_blocks, recommended, chain_id
            );
        }

        let assets = Arc::new(AssetRegistry::from_config(&settings.assets)?);
        info!(
            "Assets: underlying {:?}, collateral {:?}",
            assets.underlying_symbols(),
            assets.collateral_symbols()
        );
        let orchestrator = Arc::new(ContractInteractionOrchestrator::new(
            provider.clone(),
            signer,
            assets,
            settings.factory_address()?,
        ));

        Ok(Self {
            explorer: Arc::new(Explorer::new(&settings.explorer)),
            timeout: timeout
                .map(Duration::from_secs)
                .unwrap_or_else(|| settings.confirmation_timeout()),
            settings,
            provider,
            orchestrator,
            json,
        })
    }

    /// Instance from the command line, falling back to configuration
    fn contract(&self, arg: Option<Address>) -> Result<Address> {
        match arg {
            Some(contract) => Ok(contract),
            None => self
                .settings
                .derivative_address()?
                .context("No --contract given and contracts.derivative_address is not set"),
        }
    }

    async fn show(&self, contract: Option<Address>) -> Result<()> {
        let contract = self.contract(contract)?;
        // A failed read still shows the last snapshot when there is one
        let snapshot = match self.orchestrator.read_snapshot(contract).await {
            Ok(snapshot) => snapshot,
            Err(e) => match self.orchestrator.store().current(&contract) {
                Some(snapshot) => {
                    warn!("{}", e);
                    snapshot
                }
                None => return Err(e.into()),
            },
        };

        let identity = self.orchestrator.signer().identity().await?;
        let view = SnapshotView::render(
            &snapshot,
            self.orchestrator.assets(),
            &self.explorer,
            identity,
            self.orchestrator.store().has_unconfirmed_patch(&contract),
        );
        self.print(&view, &view)
    }

    async fn deploy(&self, request: DeployRequest) -> Result<()> {
        let receipt = self
            .orchestrator
            .deploy(request, self.timeout)
            .await
            .map_err(explain)?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&receipt)?);
            return Ok(());
        }
        println!("Deployed in {}", self.explorer.tx_url(&receipt.tx_hash));
        match receipt.instance {
            Some(instance) => {
                println!("Contract Address: {}", self.explorer.address_url(&instance));
                self.show(Some(instance)).await
            }
            None => {
                println!("The transaction confirmed without announcing the new address");
                Ok(())
            }
        }
    }

    async fn deposit(&self, contract: Option<Address>, role: Role) -> Result<()> {
        let contract = self.contract(contract)?;
        let acting_address = self
            .orchestrator
            .signer()
            .identity()
            .await?
            .ok_or(ClientError::NoSigningIdentity)?;

        let intent = DepositIntent {
            contract,
            acting_address,
            as_role: role,
        };
        let receipt = self
            .orchestrator
            .deposit_collateral(intent, self.timeout)
            .await
            .map_err(explain)?;
        self.print_tx("Deposited", receipt.tx_hash)?;

        let Some(snapshot) = self.orchestrator.store().current(&contract) else {
            return Ok(());
        };
        let view = SnapshotView::render(
            &snapshot,
            self.orchestrator.assets(),
            &self.explorer,
            Some(acting_address),
            self.orchestrator.store().has_unconfirmed_patch(&contract),
        );
        self.print(&view, &view)
    }

    async fn serve(self, contract: Option<Address>) -> Result<()> {
        let contract = self.contract(contract)?;
        let settings = &self.settings;

        if let Err(e) = self.orchestrator.read_snapshot(contract).await {
            warn!("Initial read of {:?} failed, serving once a poll succeeds: {}", contract, e);
        }

        let poller = Arc::new(SnapshotPoller::new(
            self.orchestrator.clone(),
            contract,
            Duration::from_secs(settings.client.snapshot_poll_interval_secs),
        ));
        let watcher = Arc::new(IdentityWatcher::new(
            self.orchestrator.signer().clone(),
            Duration::from_secs(settings.client.identity_poll_interval_secs),
        ));
        watcher.refresh().await;

        // Start API server
        let api_handle = tokio::spawn({
            let config = settings.api.clone();
            let state = AppState {
                orchestrator: self.orchestrator.clone(),
                explorer: self.explorer.clone(),
                identity: watcher.subscribe(),
                contract,
            };
            async move {
                if let Err(e) = api::run_server(config, state).await {
                    error!("API server error: {}", e);
                }
            }
        });

        // Start metrics server
        let metrics_handle = settings.metrics.enabled.then(|| {
            let server = MetricsServer::new(settings.metrics.port);
            tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    error!("Metrics server error: {}", e);
                }
            })
        });

        let poller_handle = tokio::spawn({
            let poller = poller.clone();
            async move { poller.run().await }
        });

        let watcher_handle = tokio::spawn({
            let watcher = watcher.clone();
            async move { watcher.run().await }
        });

        // Health check loop
        let health_handle = tokio::spawn({
            let provider = self.provider.clone();
            async move {
                loop {
                    tokio::time::sleep(HEALTH_CHECK_INTERVAL).await;
                    if provider.health_check().await {
                        metrics::record_health_check();
                    } else {
                        warn!("RPC health check failed for chain {}", provider.chain_id());
                        metrics::record_health_check_failure();
                    }
                }
            }
        });

        info!("Serving {:?}", contract);
        info!("API server: http://{}:{}", settings.api.host, settings.api.port);
        if settings.metrics.enabled {
            info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
        }

        shutdown_signal().await;
        info!("Shutdown signal received, stopping...");

        poller.stop().await;
        watcher.stop().await;

        let mut handles = vec![api_handle, poller_handle, watcher_handle, health_handle];
        handles.extend(metrics_handle);
        for handle in &handles {
            handle.abort();
        }
        futures::future::join_all(handles).await;

        info!("Derivative client stopped");
        Ok(())
    }

    fn print_tx(&self, label: &str, tx_hash: H256) -> Result<()> {
        #[derive(Serialize)]
        struct TxOutput<'a> {
            result: &'a str,
            tx_hash: String,
            tx_url: String,
        }

        let output = TxOutput {
            result: label,
            tx_hash: format!("{:?}", tx_hash),
            tx_url: self.explorer.tx_url(&tx_hash),
        };
        if self.json {
            println!("{}", serde_json::to_string_pretty(&output)?);
        } else {
            println!("{}: {}", output.result, output.tx_url);
        }
        Ok(())
    }

    fn print<T: Serialize, D: std::fmt::Display>(&self, value: &T, display: &D) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            print!("{}", display);
        }
        Ok(())
    }
}

/// Log follow-up guidance for a failed write before it is returned
fn explain(e: ClientError) -> anyhow::Error {
    if let Some(tx_hash) = e.pending_tx() {
        warn!(
            "{:?} may still confirm; check it with `tx-status {:?}` before retrying",
            tx_hash, tx_hash
        );
    }
    if e.funds_may_have_moved() {
        warn!("On-chain state may have changed; run `show` before retrying");
    } else if e.is_user_actionable() {
        info!("Nothing was sent to the chain");
    }
    e.into()
}

fn parse_address(s: &str) -> std::result::Result<Address, String> {
    s.parse().map_err(|_| format!("invalid address {:?}", s))
}

fn parse_hash(s: &str) -> std::result::Result<H256, String> {
    s.parse().map_err(|_| format!("invalid transaction hash {:?}", s))
}

fn parse_settlement(s: &str) -> std::result::Result<DateTime<Utc>, String> {
    if let Ok(seconds) = s.parse::<i64>() {
        return Utc
            .timestamp_opt(seconds, 0)
            .single()
            .ok_or_else(|| format!("timestamp {} out of range", seconds));
    }
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("invalid settlement time {:?}: {}", s, e))
}

fn init_logging(json: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,derivative_client=debug,hyper=warn"));

    // stdout carries command output
    let layer = fmt::layer().with_target(true).with_writer(std::io::stderr);
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer.json())
            .init();
    } else {
        tracing_subscriber::registry().with(filter).with(layer).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
