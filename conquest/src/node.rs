use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{self, AsyncBufReadExt, BufReader},
    signal,
    sync::{Mutex, mpsc},
    task,
};
use tracing::{info, warn};

use crate::{
    app::{AppOptions, Conquest, PacketOutcome},
    codec::ReportCodec,
    config::NodeConfig,
    console::{self, AdminCommand, Console},
    fabric::SimulatedFabric,
    packet::PacketIn,
    services::{DeviceId, Services},
    whitelist::Whitelist,
};

pub const PACKET_QUEUE_DEPTH: usize = 1024;

pub struct NodeOptions {
    pub config: NodeConfig,
    /// Read admin commands from stdin.
    pub console: bool,
}

pub fn build_app(config: &NodeConfig) -> Result<(Arc<SimulatedFabric>, Conquest)> {
    let codec = ReportCodec::new(config.queue_width_bytes).context("invalid queue width")?;
    let whitelist = Whitelist::from_entries(&config.whitelist)?;
    if config.devices.is_empty() {
        warn!("no devices configured, reports can only be blocked once devices exist");
    }
    let fabric = Arc::new(SimulatedFabric::new(
        config
            .devices
            .iter()
            .map(|device| (DeviceId::new(device.id.clone()), device.pipeconf.clone())),
    ));
    let app = Conquest::new(
        Services::from_platform(fabric.clone()),
        AppOptions {
            blocking_mode: config.blocking_mode,
            block_duration_ms: config.block_duration_ms,
            codec,
            program_marker: config.program_marker.clone(),
            whitelist,
        },
    );
    Ok((fabric, app))
}

pub async fn run_node(opts: NodeOptions) -> Result<()> {
    let workers = opts.config.packet_workers;
    if workers == 0 {
        return Err(anyhow!("packet workers must be at least 1"));
    }

    let (_fabric, app) = build_app(&opts.config)?;
    let app = Arc::new(app);
    app.activate().context("failed to activate")?;
    info!(
        mode = ?opts.config.blocking_mode,
        block_duration_ms = opts.config.block_duration_ms,
        workers,
        "node started"
    );

    let (tx, rx) = mpsc::channel::<PacketIn>(PACKET_QUEUE_DEPTH);
    let rx = Arc::new(Mutex::new(rx));
    let mut handles = Vec::with_capacity(workers);
    for worker_id in 0..workers {
        let app = app.clone();
        let rx = rx.clone();
        handles.push(task::spawn(async move {
            worker_loop(worker_id, app, rx).await
        }));
    }

    let console = Console::new(app.clone(), tx.clone());
    let interactive = opts.console;
    let mut console_task = task::spawn(async move {
        if interactive {
            console_loop(console).await
        } else {
            std::future::pending::<Result<()>>().await
        }
    });

    tokio::select! {
        res = signal::ctrl_c() => {
            res.context("failed to wait for ctrl-c")?;
            println!("Received shutdown signal, draining...");
            console_task.abort();
            let _ = console_task.await;
        }
        res = &mut console_task => {
            match res {
                Ok(Ok(())) => println!("Console closed, draining..."),
                Ok(Err(err)) => warn!(error = %err, "console stopped"),
                Err(err) => warn!(error = %err, "console task failed"),
            }
        }
    }
    drop(tx);

    for handle in handles {
        if let Err(err) = handle.await {
            return Err(anyhow!("packet worker panicked: {err}"));
        }
    }

    app.deactivate().context("failed to deactivate")?;
    Ok(())
}

async fn worker_loop(
    worker_id: usize,
    app: Arc<Conquest>,
    packets: Arc<Mutex<mpsc::Receiver<PacketIn>>>,
) {
    loop {
        let packet = { packets.lock().await.recv().await };
        let Some(packet) = packet else {
            break;
        };
        match app.process_packet(&packet) {
            Ok(PacketOutcome::Malformed(_)) | Ok(PacketOutcome::Ignored) => {}
            Ok(PacketOutcome::Handled(outcome)) => {
                info!(worker_id, device = %packet.device, ?outcome, "report handled")
            }
            Err(err) => warn!(worker_id, device = %packet.device, error = %err, "failed to handle report"),
        }
    }
}

/// Returns once the operator asks to quit. Stdin closing leaves the node running.
async fn console_loop(console: Console) -> Result<()> {
    let mut lines = BufReader::new(io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let command = match console::parse_line(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(err) => {
                println!("{err}");
                continue;
            }
        };
        let quit = matches!(command, AdminCommand::Quit);
        match console.execute(command).await {
            Ok(out) => print!("{out}"),
            Err(err) => println!("error: {err:#}"),
        }
        if quit {
            return Ok(());
        }
    }
    std::future::pending().await
}
