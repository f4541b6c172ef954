/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use spalloc_comms::transceiver::mock::MockBmpTransceiver;
use spalloc_comms::transceiver::udp::UdpBmpTransceiver;
use spalloc_comms::BmpTransceiver;
use spalloc_server::config::machine::load_machines;
use spalloc_server::config::AllocatorConfig;
use spalloc_server::service::{bmp_endpoints, Allocator};

// ── CLI argument definition ───────────────────────────────────────────────────

/// SpiNNaker board allocator.
///
/// Example:
///   spalloc-server -c spalloc.yaml -m machines.json
#[derive(Debug, Parser)]
#[command(
    name = "spalloc-server",
    about = "SpiNNaker board allocator",
    long_about = None,
)]
struct Cli {
    /// Path to the YAML service configuration file.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Path to the JSON machine definitions.
    #[arg(short = 'm', long = "machines")]
    machines: PathBuf,

    /// Drive in-memory boards instead of real BMPs.
    #[arg(long = "dry-run", default_value_t = false)]
    dry_run: bool,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // Level is controlled by the RUST_LOG env-var (e.g. RUST_LOG=debug).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    info!(
        config   = ?cli.config,
        machines = %cli.machines.display(),
        dry_run  = cli.dry_run,
        "spalloc-server starting up"
    );

    // ── Load configuration ────────────────────────────────────────────────────
    let config = match &cli.config {
        Some(path) => match AllocatorConfig::load_from_file(path) {
            Ok(c) => c,
            Err(e) => {
                error!("Failed to load configuration: {:#}", e);
                process::exit(1);
            }
        },
        None => {
            warn!("No configuration file provided, using default settings");
            AllocatorConfig::default()
        }
    };

    let machines = match load_machines(&cli.machines) {
        Ok(m) => m,
        Err(e) => {
            error!("Failed to load machine definitions: {:#}", e);
            process::exit(1);
        }
    };

    // ── BMP transceiver ───────────────────────────────────────────────────────
    let txrx: Arc<dyn BmpTransceiver> = if cli.dry_run || config.bmp.dummy {
        warn!("Using in-memory boards; no BMP will be contacted");
        Arc::new(MockBmpTransceiver::new())
    } else {
        let endpoints = match bmp_endpoints(&machines) {
            Ok(e) => e,
            Err(e) => {
                error!("Bad BMP addressing: {:#}", e);
                process::exit(1);
            }
        };
        match UdpBmpTransceiver::connect(endpoints, config.transceiver_config()).await {
            Ok(t) => Arc::new(t),
            Err(e) => {
                error!("Cannot open BMP sockets: {}", e);
                process::exit(1);
            }
        }
    };

    let allocator = match Allocator::new(config, &machines, txrx) {
        Ok(a) => a,
        Err(e) => {
            error!("Failed to start allocator: {:#}", e);
            process::exit(1);
        }
    };

    allocator
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Cannot listen for shutdown signal: {}", e);
            }
        })
        .await;
    info!("spalloc-server stopped");
}
