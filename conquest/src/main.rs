use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::exit;

use anyhow::Result;
use chrono::Local;
use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};
use conquest_common::{DEFAULT_QUEUE_WIDTH, PROTO_TCP};
use tracing_subscriber::EnvFilter;

mod app;
mod capability;
mod codec;
mod config;
mod console;
mod controller;
mod error;
mod fabric;
mod model;
mod node;
mod packet;
mod rules;
mod scheduler;
mod services;
mod store;
mod strategy;
mod whitelist;

use crate::{
    codec::{ReportCodec, hex_string},
    config::NodeConfig,
    model::{CongestionReport, FlowKey},
    strategy::BlockingMode,
};

#[derive(Parser)]
#[command(name = "conquest")]
#[command(about = "Congestion report processing and flow-blocking agent", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the report pipeline with an admin console on stdin
    Run(RunCommand),
    /// Print the hex payload of a congestion report
    EncodeReport(EncodeCommand),
}

#[derive(Args)]
struct RunCommand {
    /// JSON node configuration
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Overrides the configured block duration. 0 disables, negative is permanent
    #[arg(long, value_name = "MILLIS", allow_negative_numbers = true)]
    block_duration_ms: Option<i64>,
    /// Overrides the configured blocking mode
    #[arg(long, value_enum)]
    blocking_mode: Option<BlockingMode>,
    /// Overrides the width of the queue-size field in report payloads (bytes)
    #[arg(long, value_name = "BYTES")]
    queue_width: Option<u8>,
    /// Number of workers handling packet-ins
    #[arg(long)]
    workers: Option<usize>,
    /// Do not read admin commands from stdin
    #[arg(long = "no-console", action = ArgAction::SetTrue)]
    disable_console: bool,
}

#[derive(Args)]
struct EncodeCommand {
    #[arg(long)]
    src: Ipv4Addr,
    #[arg(long)]
    dst: Ipv4Addr,
    #[arg(long, default_value_t = 0)]
    sport: u16,
    #[arg(long, default_value_t = 0)]
    dport: u16,
    #[arg(long, default_value_t = PROTO_TCP)]
    proto: u8,
    /// Queue size in bytes
    #[arg(long, default_value_t = 0)]
    queue: u64,
    #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_QUEUE_WIDTH)]
    queue_width: u8,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "conquest=info".into()),
        )
        .init();

    if let Err(err) = run().await {
        eprintln!("conquest error: {err:?}");
        exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Run(cmd)) => {
            let mut config = NodeConfig::from_option(cmd.config.as_deref())?;
            if let Some(ms) = cmd.block_duration_ms {
                config.block_duration_ms = ms;
            }
            if let Some(mode) = cmd.blocking_mode {
                config.blocking_mode = mode;
            }
            if let Some(width) = cmd.queue_width {
                config.queue_width_bytes = width;
            }
            if let Some(workers) = cmd.workers {
                config.packet_workers = workers;
            }
            let opts = node::NodeOptions {
                config,
                console: !cmd.disable_console,
            };
            node::run_node(opts).await?;
        }
        Some(Commands::EncodeReport(cmd)) => {
            let codec = ReportCodec::new(cmd.queue_width)?;
            let report = CongestionReport::new(
                FlowKey {
                    src_addr: cmd.src,
                    dst_addr: cmd.dst,
                    src_port: cmd.sport,
                    dst_port: cmd.dport,
                    protocol: cmd.proto,
                },
                cmd.queue,
                Local::now(),
            );
            println!("{}", hex_string(&codec.encode(&report)));
        }
        None => {
            Cli::command().print_help().ok();
            println!();
        }
    }

    Ok(())
}
