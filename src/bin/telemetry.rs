//! Field telemetry CLI binary.
//!
//! # Commands
//!
//! - `server` - Run the collector until Ctrl-C
//! - `device` - Upload one JSON payload as a device

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use telemetry::{
    Config, DeviceClient, Dispatcher, ReadingChannel, SampleBatch, TelemetryPayload, VERSION,
};

#[derive(Parser)]
#[command(name = "telemetry")]
#[command(version = VERSION)]
#[command(about = "Field telemetry collector and device client", long_about = None)]
struct Cli {
    /// Config file (default: <config dir>/field-telemetry/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the collector
    Server {
        /// Listen host
        #[arg(long)]
        host: Option<String>,

        /// Listen port
        #[arg(short, long)]
        port: Option<u16>,

        /// RSA key size (521, 1024, 2048, 4092)
        #[arg(short, long)]
        key_size: Option<u32>,

        /// SQLite database file
        #[arg(short, long)]
        database: Option<PathBuf>,
    },

    /// Upload one payload to a collector
    Device {
        /// Collector host
        #[arg(short, long)]
        server: Option<String>,

        /// Collector port
        #[arg(short, long)]
        port: Option<u16>,

        /// JSON payload file (epoch second -> readings)
        #[arg(short, long)]
        input: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Server {
            host,
            port,
            key_size,
            database,
        } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(bits) = key_size {
                config.server.key_size = bits;
            }
            if let Some(database) = database {
                config.storage.database = database;
            }
            config.validate()?;
            cmd_server(config)
        },

        Commands::Device {
            server,
            port,
            input,
        } => {
            if let Some(server) = server {
                config.device.server = server;
            }
            if let Some(port) = port {
                config.device.port = port;
            }
            config.validate()?;
            cmd_device(config, input)
        },
    }
}

fn cmd_server(config: Config) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let dispatcher = Dispatcher::new(Arc::new(config));
        let shutdown = dispatcher.shutdown_handle();

        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("cannot listen for Ctrl-C: {}", e);
                return;
            }
            shutdown.shutdown().await;
        });

        dispatcher.run().await.map_err(|e| anyhow::anyhow!("{}", e))
    })
}

fn cmd_device(config: Config, input: PathBuf) -> anyhow::Result<()> {
    let raw = std::fs::read(&input).with_context(|| format!("reading {}", input.display()))?;
    let payload = TelemetryPayload::from_json(&raw)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let (tx, readings) = ReadingChannel::bounded(1);
        tx.send(SampleBatch::from(payload)).await;
        drop(tx);

        let mut client = DeviceClient::new(config.device);
        let report = client
            .run(readings)
            .await
            .context("upload did not complete")?;

        if report.provisioning_pending {
            println!("collector could not provision this device; samples not stored");
        } else {
            println!("Device ID: {}", report.device_id);
            if report.reassigned {
                println!("(assigned by the collector; set device.device_id to keep it)");
            }
        }
        Ok(())
    })
}
