use std::fmt;

use conquest_common::{
    ACL_DROP_ACTION, ACL_TABLE, ECN_VALUES, FIELD_ECN, FIELD_FLOW_SIZE_IN_QUEUE, FIELD_IP_PROTO,
    FIELD_IPV4_DST, FIELD_IPV4_SRC, FIELD_L4_DPORT, FIELD_L4_SPORT, FIELD_QUEUE_DELAY,
    FLOW_SIZE_RANGE_MAX, QUEUE_DELAY_RANGE_MAX, REPORT_TRIGGER_TABLE, TRIGGER_REPORT_ACTION,
};
use ipnet::Ipv4Net;
use tracing::warn;

use crate::{
    model::{CongestionReport, protocol_label},
    services::{AppId, DeviceId, PolicyId},
};

pub const TRIGGER_PRIORITY: u32 = 10;
// Must outrank TRIGGER_PRIORITY.
pub const BLOCK_PRIORITY: u32 = 40_000;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FieldMatch {
    Exact {
        field: &'static str,
        value: u64,
    },
    Ternary {
        field: &'static str,
        value: u64,
        mask: u64,
    },
    Range {
        field: &'static str,
        low: u64,
        high: u64,
    },
}

impl FieldMatch {
    #[cfg(test)]
    pub fn field(&self) -> &'static str {
        match self {
            FieldMatch::Exact { field, .. }
            | FieldMatch::Ternary { field, .. }
            | FieldMatch::Range { field, .. } => field,
        }
    }

    fn ternary_exact(field: &'static str, value: u64, width_bits: u32) -> Self {
        FieldMatch::Ternary {
            field,
            value,
            mask: conquest_common::range_max(width_bits),
        }
    }
}

impl fmt::Display for FieldMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldMatch::Exact { field, value } => write!(f, "{field}={value}"),
            FieldMatch::Ternary { field, value, mask } => {
                write!(f, "{field}={value:#x}&&&{mask:#x}")
            }
            FieldMatch::Range { field, low, high } => write!(f, "{field}=[{low}..{high}]"),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RuleAction {
    TriggerReport,
    Drop,
}

impl RuleAction {
    pub fn id(&self) -> &'static str {
        match self {
            RuleAction::TriggerReport => TRIGGER_REPORT_ACTION,
            RuleAction::Drop => ACL_DROP_ACTION,
        }
    }
}

/// A match-action table entry targeted at one device.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FlowRule {
    pub device: DeviceId,
    pub app: AppId,
    pub table: &'static str,
    pub priority: u32,
    pub matches: Vec<FieldMatch>,
    pub action: RuleAction,
    pub permanent: bool,
}

impl FlowRule {
    #[cfg(test)]
    pub fn find(&self, field: &str) -> Option<&FieldMatch> {
        self.matches.iter().find(|m| m.field() == field)
    }
}

impl fmt::Display for FlowRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let matches: Vec<String> = self.matches.iter().map(ToString::to_string).collect();
        write!(
            f,
            "{} table={} prio={} match=[{}] action={}{}",
            self.device,
            self.table,
            self.priority,
            matches.join(", "),
            self.action.id(),
            if self.permanent { " permanent" } else { "" }
        )
    }
}

/// Rules making `device` emit reports once both thresholds are exceeded.
///
/// A zero threshold leaves that dimension ungated: the range clause is
/// omitted entirely rather than matching from zero.
pub fn build_trigger_rules(
    app: &AppId,
    device: &DeviceId,
    min_queue_delay: u64,
    min_flow_size_in_queue: u64,
) -> Vec<FlowRule> {
    let min_queue_delay = clamp_threshold("queue delay", min_queue_delay, QUEUE_DELAY_RANGE_MAX);
    let min_flow_size_in_queue =
        clamp_threshold("flow size in queue", min_flow_size_in_queue, FLOW_SIZE_RANGE_MAX);
    ECN_VALUES
        .iter()
        .map(|ecn| {
            let mut matches = vec![FieldMatch::Exact {
                field: FIELD_ECN,
                value: *ecn as u64,
            }];
            if min_flow_size_in_queue != 0 {
                matches.push(FieldMatch::Range {
                    field: FIELD_FLOW_SIZE_IN_QUEUE,
                    low: min_flow_size_in_queue,
                    high: FLOW_SIZE_RANGE_MAX,
                });
            }
            if min_queue_delay != 0 {
                matches.push(FieldMatch::Range {
                    field: FIELD_QUEUE_DELAY,
                    low: min_queue_delay,
                    high: QUEUE_DELAY_RANGE_MAX,
                });
            }
            FlowRule {
                device: device.clone(),
                app: app.clone(),
                table: REPORT_TRIGGER_TABLE,
                priority: TRIGGER_PRIORITY,
                matches,
                action: RuleAction::TriggerReport,
                permanent: true,
            }
        })
        .collect()
}

fn clamp_threshold(name: &'static str, requested: u64, max: u64) -> u64 {
    if requested > max {
        warn!(
            threshold = name,
            requested, max, "threshold exceeds what the data plane can match, using the maximum"
        );
        return max;
    }
    requested
}

/// Drop rule for exactly the report's 5-tuple.
pub fn build_block_rule(app: &AppId, device: &DeviceId, report: &CongestionReport) -> FlowRule {
    let flow = report.flow();
    let mut matches = vec![
        FieldMatch::ternary_exact(FIELD_IP_PROTO, flow.protocol as u64, 8),
        FieldMatch::ternary_exact(FIELD_IPV4_SRC, u32::from(flow.src_addr) as u64, 32),
        FieldMatch::ternary_exact(FIELD_IPV4_DST, u32::from(flow.dst_addr) as u64, 32),
    ];
    if flow.is_tcp_or_udp() {
        matches.push(FieldMatch::ternary_exact(FIELD_L4_SPORT, flow.src_port as u64, 16));
        matches.push(FieldMatch::ternary_exact(FIELD_L4_DPORT, flow.dst_port as u64, 16));
    }
    FlowRule {
        device: device.clone(),
        app: app.clone(),
        table: ACL_TABLE,
        priority: BLOCK_PRIORITY,
        matches,
        action: RuleAction::Drop,
        permanent: true,
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TrafficSelector {
    pub protocol: u8,
    pub src: Ipv4Net,
    pub dst: Ipv4Net,
    pub l4_ports: Option<(u16, u16)>,
}

impl fmt::Display for TrafficSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{proto={}, src={}, dst={}",
            protocol_label(self.protocol),
            self.src,
            self.dst
        )?;
        if let Some((sport, dport)) = self.l4_ports {
            write!(f, ", sport={sport}, dport={dport}")?;
        }
        write!(f, "}}")
    }
}

/// Binds a selector to a shared policy in the centralized policy service.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TrafficMatch {
    pub selector: TrafficSelector,
    pub policy: PolicyId,
}

pub fn build_traffic_match(report: &CongestionReport, policy: PolicyId) -> TrafficMatch {
    let flow = report.flow();
    TrafficMatch {
        selector: TrafficSelector {
            protocol: flow.protocol,
            src: Ipv4Net::from(flow.src_addr),
            dst: Ipv4Net::from(flow.dst_addr),
            l4_ports: flow
                .is_tcp_or_udp()
                .then_some((flow.src_port, flow.dst_port)),
        },
        policy,
    }
}
