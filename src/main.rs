//! CLI for Spectrobus
//!
//! Subcommands:
//! - `serve`: run the simulated spectrometer on the first reachable broker
//! - `broker`: run a standalone wire broker

use std::sync::Arc;

use clap::{Parser, Subcommand};
use spectrobus::config::{Settings, load_config};
use spectrobus::spectrometer::Spectrometer;
use spectrobus::supervisor::ConnectionSupervisor;
use spectrobus::transport::WireProtocolBroker;
use spectrobus::utils::logging;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "spectrobus", version, about = "Spectrometer simulator over a pub/sub broker")]
struct Cli {
    /// Override `server.host`
    #[arg(long, global = true)]
    host: Option<String>,
    /// Override `server.port`
    #[arg(long, global = true)]
    port: Option<u16>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the spectrometer until Ctrl-C
    Serve,
    /// Run a standalone wire broker until Ctrl-C
    Broker,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    logging::init(&settings.log.level);

    if let Some(host) = cli.host {
        settings.server.host = host;
    }
    if let Some(port) = cli.port {
        settings.server.port = port;
    }

    let outcome = match cli.command {
        Command::Serve => run_serve(settings).await,
        Command::Broker => run_broker(settings).await,
    };
    if let Err(e) = outcome {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run_serve(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let spectrometer = Arc::new(Spectrometer::from_settings(&settings.spectrometer)?);
    let mut supervisor = ConnectionSupervisor::new(
        settings.server.clone(),
        settings.supervisor.clone(),
        spectrometer.clone(),
    );

    let kind = supervisor.start().await?;
    info!("Spectrometer running on the {kind}");
    if let Err(e) = spectrometer.generate_reading(&supervisor) {
        warn!("No initial reading: {e}");
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Exiting gracefully.");
    supervisor.stop().await;
    Ok(())
}

async fn run_broker(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let broker = WireProtocolBroker::start(
        &settings.server.bind_addr(),
        settings.supervisor.shutdown_timeout(),
    )
    .await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Exiting gracefully.");
    broker.stop().await;
    Ok(())
}
