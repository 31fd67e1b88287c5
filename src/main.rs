use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;

use testbed_scheduler::api::booking_dto::BookingsDto;
use testbed_scheduler::api::config_dto::ServerConfigDto;
use testbed_scheduler::domain::bus::in_process_bus::InProcessBus;
use testbed_scheduler::domain::bus::message::PreparationMessage;
use testbed_scheduler::domain::clock::{SharedClock, SimulatedClock, WallClock};
use testbed_scheduler::domain::statistics;
use testbed_scheduler::loader::parser::parse_json_file;
use testbed_scheduler::logger;
use testbed_scheduler::server::TestbedServer;

const BUS_CAPACITY: usize = 1024;

#[derive(Parser, Debug)]
#[command(author, version, about = "Books, activates and tracks experiments on a shared hardware testbed")]
struct Args {
    /// Server configuration (JSON)
    #[arg(short, long)]
    config: PathBuf,

    /// Overrides the log directory of the configuration
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config: ServerConfigDto = parse_json_file(&args.config).with_context(|| format!("loading configuration '{}'", args.config.display()))?;

    logger::init(args.log_dir.as_deref().unwrap_or(config.log_directory.as_path()));
    statistics::init_global(config.statistics_file.clone()).context("starting the statistics writer")?;

    let clock: SharedClock = match config.simulation_start {
        Some(start) => {
            log::info!("Running on a simulated clock starting at {}.", start);
            Arc::new(SimulatedClock::starting_at(start))
        }
        None => Arc::new(WallClock),
    };

    let bus = Arc::new(InProcessBus::new(BUS_CAPACITY));
    tokio::spawn(log_preparation_messages(bus.subscribe_preparation()));

    let server = TestbedServer::start(&config, clock, bus).await.context("starting the testbed server")?;

    if let Some(bookings_file) = &config.bookings_file {
        let bookings: BookingsDto = parse_json_file(bookings_file).with_context(|| format!("loading bookings '{}'", bookings_file.display()))?;
        let total = bookings.bookings.len();
        let admitted = server.admit_bookings(bookings);
        log::info!("Admitted {}/{} bookings from '{}'.", admitted, total, bookings_file.display());
    }

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    server.shutdown().await;

    Ok(())
}

/// Stand-in for the node workers: prints every preparation message.
async fn log_preparation_messages(mut messages: tokio::sync::broadcast::Receiver<PreparationMessage>) {
    loop {
        match messages.recv().await {
            Ok(message) => match message.to_json() {
                Ok(json) => log::info!("[Experiment {}] Preparation message: {}", message.experiment_id, String::from_utf8_lossy(&json)),
                Err(e) => log::warn!("[Experiment {}] Could not encode preparation message: {}", message.experiment_id, e),
            },
            Err(RecvError::Lagged(skipped)) => log::warn!("Preparation log fell behind, skipped {} messages.", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}
