use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use payflux_core::config::AppConfig;
use payflux_core::event::EventBus;
use payflux_core::traits::FlowStore;
use payflux_engine::{
    payment_flow, register_payment_handlers, AllocationRequest, ChargeNotice, ControlPlane,
    FlowRuntime, HandlerRegistry, PaperExchange, PaperGateway, RecoveryManager, RuntimeRegistry,
    StepExecutor,
};
use payflux_gateway::GatewayServer;
use payflux_store::{MemoryFlowStore, SqliteFlowStore};

#[derive(Parser)]
#[command(name = "payflux", version, about = "Durable payment flow engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "payflux.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the engine and the HTTP/WebSocket gateway
    Serve {
        /// Submit this many demo charges on startup
        #[arg(long, default_value = "0")]
        demo: usize,
    },
    /// Run crash recovery against the store and exit
    Recover,
    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("payflux=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        warn!(path = %cli.config.display(), "Config file not found, using defaults");
        AppConfig::default()
    };

    match cli.command {
        Some(Commands::Config) => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Some(Commands::Recover) => {
            let runtime = build_runtime(&config)?;
            let recovery = RecoveryManager::new(runtime);
            let report = recovery.recover_crashed().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Some(Commands::Serve { demo }) => serve(config, demo).await,
        None => serve(config, 0).await,
    }
}

fn build_runtime(config: &AppConfig) -> anyhow::Result<Arc<FlowRuntime>> {
    let store: Arc<dyn FlowStore> = if config.store.path == ":memory:" {
        Arc::new(MemoryFlowStore::new())
    } else {
        Arc::new(SqliteFlowStore::open(std::path::Path::new(
            &config.store.path,
        ))?)
    };

    let gateway = Arc::new(PaperGateway::new());
    let exchange = Arc::new(PaperExchange::new().with_polls_until_fill(2));
    let mut handlers = HandlerRegistry::new();
    register_payment_handlers(
        &mut handlers,
        gateway,
        exchange,
        config.engine.reconcile_tolerance,
    );

    let executor = Arc::new(StepExecutor::new(
        Arc::new(handlers),
        config.engine.default_step_timeout_secs,
    ));
    Ok(Arc::new(FlowRuntime::new(
        store,
        executor,
        Arc::new(RuntimeRegistry::new()),
        Arc::new(EventBus::default()),
        config.engine.clone(),
    )))
}

async fn serve(config: AppConfig, demo: usize) -> anyhow::Result<()> {
    let runtime = build_runtime(&config)?;
    let control = Arc::new(ControlPlane::new(runtime.clone()));
    let recovery = Arc::new(RecoveryManager::new(runtime.clone()));

    // Boot-time recovery: repair crashed flows, then restart the rest
    let report = recovery.recover_crashed().await?;
    if report.scanned > 0 {
        info!(
            recovered = report.recovered_flows.len(),
            failed = report.failed_flows.len(),
            "Crash recovery finished"
        );
    }
    recovery.restore_runtime().await?;

    if demo > 0 {
        submit_demo_charges(&runtime, demo).await?;
    }

    let server = GatewayServer::new(
        config.gateway.clone(),
        control,
        recovery,
        runtime.bus().clone(),
    );

    let cancel = tokio_util::sync::CancellationToken::new();
    let cancel_clone = cancel.clone();
    let registry = runtime.registry().clone();

    // Graceful shutdown on Ctrl-C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down gateway...");
        cancel_clone.cancel();
    });

    server.run(cancel).await?;

    // Let run loops stop at their step boundaries before exiting
    registry.begin_shutdown();
    registry.drain().await;
    Ok(())
}

async fn submit_demo_charges(runtime: &Arc<FlowRuntime>, count: usize) -> anyhow::Result<()> {
    for i in 0..count {
        let notice = ChargeNotice {
            charge_id: format!("ch_demo_{i}"),
            user_id: format!("user-{}", i % 3),
            amount: 100.0 + i as f64 * 25.0,
            currency: "USD".to_string(),
            allocations: vec![
                AllocationRequest {
                    asset: "BTC".to_string(),
                    percent: 60.0,
                },
                AllocationRequest {
                    asset: "ETH".to_string(),
                    percent: 40.0,
                },
            ],
        };
        let flow = payment_flow(&notice)?;
        let flow_id = runtime.submit(flow).await?;
        info!(flow_id = %flow_id, charge_id = %notice.charge_id, "Demo charge submitted");
    }
    Ok(())
}
