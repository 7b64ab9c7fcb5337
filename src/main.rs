//! CYCLER — unattended perp position cycling
//!
//! Entry point. Loads configuration, initialises structured logging,
//! connects the configured gateway, and runs the open → hold → close loop
//! until account health is depleted or Ctrl+C is pressed.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

use cycler::config::{self, GatewayMode};
use cycler::engine::controller::{ControllerConfig, CycleController};
use cycler::engine::timing::{shutdown_channel, Randomizer, RngRandomizer};
use cycler::gateway::paper::PaperGateway;
use cycler::gateway::vertex::VertexClient;
use cycler::gateway::ExchangeGateway;
use cycler::types::CyclerError;

const BANNER: &str = r#"
  ______   ______ _     _____ ____
 / ___\ \ / / ___| |   | ____|  _ \
| |    \ V / |   | |   |  _| | |_) |
| |___  | || |___| |___| |___|  _ <
 \____| |_| \____|_____|_____|_| \_\

  Perp position cycler
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let cfg = config::AppConfig::load(&config_path)?;

    init_logging();

    println!("{BANNER}");

    cfg.validate().context("Invalid configuration")?;

    // -- Gateway ---------------------------------------------------------

    let (gateway, rng): (Arc<dyn ExchangeGateway>, Box<dyn Randomizer>) = match cfg.gateway.mode {
        GatewayMode::Vertex => {
            let key = cfg.private_key()?;
            let client = VertexClient::new(&key, cfg.vertex_config())?;
            info!(subaccount = %client.subaccount_hex(), "Vertex subaccount");
            let gateway: Arc<dyn ExchangeGateway> = Arc::new(client);
            let rng: Box<dyn Randomizer> = Box::new(RngRandomizer::from_entropy());
            (gateway, rng)
        }
        GatewayMode::Paper => {
            warn!("Paper mode: no real orders will be placed");
            let rng = match cfg.paper.seed {
                Some(seed) => RngRandomizer::seeded(seed),
                None => RngRandomizer::from_entropy(),
            };
            let gateway: Arc<dyn ExchangeGateway> = Arc::new(PaperGateway::new(cfg.paper_config()));
            let rng: Box<dyn Randomizer> = Box::new(rng);
            (gateway, rng)
        }
    };

    let controller_config = ControllerConfig::from_app(&cfg)?;
    info!(
        gateway = gateway.name(),
        products = %controller_config.tracked,
        percent = %controller_config.percent,
        before_close = %controller_config.before_close,
        between_trades = %controller_config.between_trades,
        slippage = %controller_config.slippage,
        "CYCLER starting up"
    );

    // -- Shutdown --------------------------------------------------------

    let (trigger, shutdown) = shutdown_channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received.");
                trigger.trigger();
            }
            Err(e) => error!(error = %e, "Failed to listen for Ctrl+C"),
        }
    });

    // -- Main loop -------------------------------------------------------

    info!("Entering main loop. Press Ctrl+C to stop.");
    let mut controller = CycleController::new(gateway, controller_config, rng, shutdown);

    match controller.run().await {
        Ok(summary) => {
            info!(
                cycles = summary.cycles,
                opened = summary.opened,
                completed = summary.completed,
                skipped = summary.skipped,
                failed_opens = summary.failed_opens,
                failed_closes = summary.failed_closes,
                forced_closes = summary.forced_closes,
                net_change = summary
                    .net_change()
                    .map(|d| format!("{d:.4}"))
                    .unwrap_or_else(|| "-".to_string()),
                reason = %summary.exit_reason,
                "CYCLER shut down cleanly."
            );
            Ok(())
        }
        Err(e @ CyclerError::UnsafeResidual { .. }) => {
            error!(error = %e, "Manual intervention required");
            Err(e.into())
        }
        Err(e) => {
            error!(error = %e, "CYCLER stopped");
            Err(e.into())
        }
    }
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("cycler=info"));

    let json_logging = std::env::var("CYCLER_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
