use std::{fmt, net::Ipv4Addr};

use chrono::{DateTime, Local};
use conquest_common::{PROTO_ICMP, PROTO_TCP, PROTO_UDP};

/// Flow identity used for deduplicating blocks.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct FlowKey {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
}

impl FlowKey {
    pub fn is_tcp_or_udp(&self) -> bool {
        self.protocol == PROTO_TCP || self.protocol == PROTO_UDP
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}:{}->{}:{})",
            protocol_label(self.protocol),
            self.src_addr,
            self.src_port,
            self.dst_addr,
            self.dst_port
        )
    }
}

/// A decoded congestion report. Never mutated after construction.
#[derive(Clone, Debug, PartialEq)]
pub struct CongestionReport {
    flow: FlowKey,
    queue_size: u64,
    received_at: DateTime<Local>,
}

impl CongestionReport {
    pub fn new(flow: FlowKey, queue_size: u64, received_at: DateTime<Local>) -> Self {
        Self {
            flow,
            queue_size,
            received_at,
        }
    }

    pub fn flow(&self) -> FlowKey {
        self.flow
    }

    pub fn src_addr(&self) -> Ipv4Addr {
        self.flow.src_addr
    }

    pub fn dst_addr(&self) -> Ipv4Addr {
        self.flow.dst_addr
    }

    pub fn protocol(&self) -> u8 {
        self.flow.protocol
    }

    pub fn queue_size(&self) -> u64 {
        self.queue_size
    }

    pub fn received_at(&self) -> DateTime<Local> {
        self.received_at
    }

    pub fn queue_size_label(&self) -> String {
        human_size(self.queue_size)
    }
}

impl fmt::Display for CongestionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}:{}->{}:{}, Size:{}, Received:{})",
            protocol_label(self.flow.protocol),
            self.flow.src_addr,
            self.flow.src_port,
            self.flow.dst_addr,
            self.flow.dst_port,
            self.queue_size_label(),
            format_time(&self.received_at)
        )
    }
}

pub fn protocol_label(protocol: u8) -> String {
    match protocol {
        PROTO_ICMP => "ICMP".to_string(),
        PROTO_TCP => "TCP".to_string(),
        PROTO_UDP => "UDP".to_string(),
        other => format!("PROTO:{other}"),
    }
}

pub fn format_time(at: &DateTime<Local>) -> String {
    at.format("%H:%M:%S%.3f").to_string()
}

fn human_size(size: u64) -> String {
    let bytes = size as f64;
    let kib = bytes / 1024.0;
    let mib = bytes / (1024.0 * 1024.0);
    if mib > 1.0 {
        format!("{mib:.2} MB")
    } else if kib > 1.0 {
        format!("{kib:.2} KB")
    } else {
        format!("{bytes:.2} Bytes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow(protocol: u8) -> FlowKey {
        FlowKey {
            src_addr: Ipv4Addr::new(10, 0, 0, 1),
            dst_addr: Ipv4Addr::new(10, 0, 0, 2),
            src_port: 1234,
            dst_port: 80,
            protocol,
        }
    }

    #[test]
    fn flow_display_uses_protocol_label() {
        assert_eq!(flow(PROTO_TCP).to_string(), "(TCP, 10.0.0.1:1234->10.0.0.2:80)");
        assert_eq!(flow(47).to_string(), "(PROTO:47, 10.0.0.1:1234->10.0.0.2:80)");
    }

    #[test]
    fn only_tcp_and_udp_are_blockable() {
        assert!(flow(PROTO_TCP).is_tcp_or_udp());
        assert!(flow(PROTO_UDP).is_tcp_or_udp());
        assert!(!flow(PROTO_ICMP).is_tcp_or_udp());
        assert!(!flow(0).is_tcp_or_udp());
    }

    #[test]
    fn human_size_picks_unit() {
        assert_eq!(human_size(512), "512.00 Bytes");
        assert_eq!(human_size(5000), "4.88 KB");
        assert_eq!(human_size(3 * 1024 * 1024), "3.00 MB");
    }

    #[test]
    fn identity_ignores_payload() {
        let now = Local::now();
        let a = CongestionReport::new(flow(PROTO_TCP), 10, now);
        let b = CongestionReport::new(flow(PROTO_TCP), 99_999, now);
        assert_eq!(a.flow(), b.flow());
        assert_ne!(a, b);
    }
}
