use std::{fmt::Write, net::Ipv4Addr, sync::Arc};

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use ipnet::Ipv4Net;
use tokio::sync::mpsc;

use crate::{
    app::{Conquest, TriggerOutcome},
    model::{CongestionReport, FlowKey, format_time, protocol_label},
    packet::{PacketIn, build_report_frame},
    services::DeviceId,
};

#[derive(Parser)]
#[command(name = "conquest", no_binary_name = true, disable_version_flag = true)]
struct ConsoleLine {
    #[command(subcommand)]
    command: AdminCommand,
}

#[derive(Debug, Subcommand)]
pub enum AdminCommand {
    /// Set block duration in milliseconds. 0 disables blocking, negative blocks permanently
    SetBlockDuration {
        #[arg(allow_negative_numbers = true)]
        ms: i64,
    },
    /// Show the current block duration
    BlockDuration,
    /// Inject a synthetic report for a flow to test blocking
    BlockFlow {
        device: String,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        sport: u16,
        dport: u16,
        protocol: u8,
    },
    /// Encode a report and deliver it through the packet pipeline
    InjectFrame {
        device: String,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        sport: u16,
        dport: u16,
        protocol: u8,
        #[arg(default_value_t = 0)]
        queue: u64,
    },
    /// List currently blocked 5-tuples
    BlockedFlows {
        /// Include device, block time and the triggering report
        #[arg(long, short)]
        verbose: bool,
    },
    /// Lift the block on one 5-tuple
    Unblock {
        src: Ipv4Addr,
        dst: Ipv4Addr,
        sport: u16,
        dport: u16,
        protocol: u8,
    },
    /// Lift every active block
    ClearBlocks,
    /// Received reports grouped by 5-tuple
    ReadReports,
    /// Received reports in arrival order
    ReadReportsFlat,
    /// Forget all received reports
    ClearReports,
    /// Exempt a prefix from blocking
    Whitelist { prefix: Ipv4Net },
    /// Remove a prefix from the whitelist
    Unwhitelist { prefix: Ipv4Net },
    /// List whitelisted prefixes
    ReadWhitelist,
    /// Remove every whitelisted prefix
    ClearWhitelist,
    /// Install report triggers on one device, or every qualifying device
    AddTrigger {
        device: Option<String>,
        #[arg(long, default_value_t = 0)]
        min_queue_delay: u64,
        #[arg(long, default_value_t = 0)]
        min_flow_size: u64,
    },
    /// Remove report triggers from one device, or every device
    RemoveTriggers { device: Option<String> },
    /// Remove every rule installed by this application
    RemoveAllEntries,
    /// List available devices and whether they run the conquest pipeline
    Devices,
    /// Stop the node
    Quit,
}

/// Parses one console line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<AdminCommand>, clap::Error> {
    let words: Vec<&str> = line.split_whitespace().collect();
    if words.is_empty() {
        return Ok(None);
    }
    ConsoleLine::try_parse_from(words).map(|parsed| Some(parsed.command))
}

pub struct Console {
    app: Arc<Conquest>,
    packets: mpsc::Sender<PacketIn>,
}

impl Console {
    pub fn new(app: Arc<Conquest>, packets: mpsc::Sender<PacketIn>) -> Self {
        Self { app, packets }
    }

    /// Runs one command and returns the text to show the operator.
    pub async fn execute(&self, command: AdminCommand) -> Result<String> {
        let controller = self.app.controller();
        let mut out = String::new();
        match command {
            AdminCommand::SetBlockDuration { ms } => {
                controller.set_block_duration(ms);
                writeln!(out, "Block duration set to {}", describe_duration(ms))?;
            }
            AdminCommand::BlockDuration => {
                writeln!(out, "{}", describe_duration(controller.block_duration()))?;
            }
            AdminCommand::BlockFlow {
                device,
                src,
                dst,
                sport,
                dport,
                protocol,
            } => {
                let report = CongestionReport::new(
                    FlowKey {
                        src_addr: src,
                        dst_addr: dst,
                        src_port: sport,
                        dst_port: dport,
                        protocol,
                    },
                    0,
                    Local::now(),
                );
                writeln!(out, "Blocking flow for report {report}")?;
                let outcome = self.app.block_flow(&DeviceId::new(device), report)?;
                writeln!(out, "{outcome:?}")?;
            }
            AdminCommand::InjectFrame {
                device,
                src,
                dst,
                sport,
                dport,
                protocol,
                queue,
            } => {
                let report = CongestionReport::new(
                    FlowKey {
                        src_addr: src,
                        dst_addr: dst,
                        src_port: sport,
                        dst_port: dport,
                        protocol,
                    },
                    queue,
                    Local::now(),
                );
                let frame = build_report_frame(&self.app.codec().encode(&report));
                self.packets
                    .send(PacketIn {
                        device: DeviceId::new(device),
                        frame,
                    })
                    .await
                    .context("packet pipeline is closed")?;
                writeln!(out, "Queued report frame for {}", report.flow())?;
            }
            AdminCommand::BlockedFlows { verbose: false } => {
                let blocked = controller.currently_blocked();
                for flow in &blocked {
                    writeln!(out, "{flow}")?;
                }
                writeln!(out, "{} flows blocked", blocked.len())?;
            }
            AdminCommand::BlockedFlows { verbose: true } => {
                let blocked = controller.blocked_flows();
                for (flow, record) in &blocked {
                    let until = match record.expiry {
                        Some(_) => "until expiry",
                        None => "permanently",
                    };
                    writeln!(
                        out,
                        "{flow} on {} since {} {until}, reported queue {}",
                        record.device,
                        format_time(&record.blocked_at),
                        record.report.queue_size_label()
                    )?;
                }
                writeln!(
                    out,
                    "{} flows blocked, {} expiries pending",
                    blocked.len(),
                    controller.pending_expiries()
                )?;
            }
            AdminCommand::Unblock {
                src,
                dst,
                sport,
                dport,
                protocol,
            } => {
                let flow = FlowKey {
                    src_addr: src,
                    dst_addr: dst,
                    src_port: sport,
                    dst_port: dport,
                    protocol,
                };
                if controller.unblock(&flow)? {
                    writeln!(out, "Unblocked {flow}")?;
                } else {
                    writeln!(out, "{flow} is not blocked")?;
                }
            }
            AdminCommand::ClearBlocks => {
                let cleared = controller.clear_blocks()?;
                writeln!(out, "Cleared {cleared} blocks")?;
            }
            AdminCommand::ReadReports => render_grouped_reports(&self.app, &mut out)?,
            AdminCommand::ReadReportsFlat => {
                let reports = controller.received_reports();
                for (idx, report) in reports.iter().enumerate() {
                    writeln!(out, "{}) {report}", idx + 1)?;
                }
                writeln!(out, "{} reports found", reports.len())?;
            }
            AdminCommand::ClearReports => {
                let cleared = controller.clear_received_reports();
                writeln!(out, "Cleared {cleared} reports")?;
            }
            AdminCommand::Whitelist { prefix } => {
                writeln!(out, "Whitelisting {}", prefix.trunc())?;
                controller.whitelist().add(prefix);
            }
            AdminCommand::Unwhitelist { prefix } => {
                if controller.whitelist().remove(&prefix) {
                    writeln!(out, "Removed {} from whitelist", prefix.trunc())?;
                } else {
                    writeln!(out, "{} was not whitelisted", prefix.trunc())?;
                }
            }
            AdminCommand::ReadWhitelist => {
                let prefixes = controller.whitelist().list();
                for prefix in &prefixes {
                    writeln!(out, "{prefix}")?;
                }
                writeln!(out, "{} whitelisted prefixes", prefixes.len())?;
            }
            AdminCommand::ClearWhitelist => {
                controller.whitelist().clear();
                writeln!(out, "Whitelist cleared")?;
            }
            AdminCommand::AddTrigger {
                device,
                min_queue_delay,
                min_flow_size,
            } => match device {
                Some(device) => {
                    let device = DeviceId::new(device);
                    match self
                        .app
                        .add_report_trigger(&device, min_queue_delay, min_flow_size)?
                    {
                        TriggerOutcome::Installed(count) => {
                            writeln!(out, "Installed {count} trigger rules on {device}")?
                        }
                        TriggerOutcome::NotQualifying => {
                            writeln!(out, "{device} does not run the conquest pipeline")?
                        }
                    }
                }
                None => {
                    let devices = self
                        .app
                        .add_report_trigger_everywhere(min_queue_delay, min_flow_size)?;
                    writeln!(out, "Installed report triggers on {devices} devices")?;
                }
            },
            AdminCommand::RemoveTriggers { device } => {
                let removed = match device {
                    Some(device) => self.app.remove_report_triggers(&DeviceId::new(device))?,
                    None => self.app.remove_all_report_triggers()?,
                };
                writeln!(out, "Removed {removed} trigger rules")?;
            }
            AdminCommand::RemoveAllEntries => {
                let removed = self.app.remove_all_entries()?;
                writeln!(out, "Removed {removed} table entries")?;
            }
            AdminCommand::Devices => {
                for device in self.app.target_devices() {
                    writeln!(out, "{device} (conquest)")?;
                }
            }
            AdminCommand::Quit => writeln!(out, "Bye")?,
        }
        Ok(out)
    }
}

fn describe_duration(ms: i64) -> String {
    match ms {
        0 => "0ms (blocking disabled)".to_string(),
        ms if ms < 0 => format!("{ms}ms (permanent)"),
        ms => format!("{ms}ms"),
    }
}

fn render_grouped_reports(app: &Conquest, out: &mut String) -> Result<()> {
    let groups = app.controller().grouped_reports();
    let mut total_reports = 0;
    let mut total_flows = 0;
    for group in &groups {
        writeln!(
            out,
            "SrcIp {}, DstIp {}, {} Distinct 5-tuples",
            group.src_addr,
            group.dst_addr,
            group.flows.len()
        )?;
        total_flows += group.flows.len();
        for flow in &group.flows {
            total_reports += flow.reports.len();
            let latest = flow
                .latest()
                .map(|at| format_time(&at))
                .unwrap_or_default();
            writeln!(
                out,
                "--Proto {}, SrcPort {}, DstPort {}, {} reports, latest {}",
                protocol_label(flow.flow.protocol),
                flow.flow.src_port,
                flow.flow.dst_port,
                flow.reports.len(),
                latest
            )?;
            for report in &flow.reports {
                writeln!(
                    out,
                    "----{} queue size at time {}",
                    report.queue_size_label(),
                    format_time(&report.received_at())
                )?;
            }
        }
    }
    writeln!(
        out,
        "{total_reports} total reports received from {total_flows} flows"
    )?;
    Ok(())
}
