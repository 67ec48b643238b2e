#![no_std]

// Constants shared between the control plane and data-plane tooling.
// Keep this crate `no_std` friendly so switch-side generators can reuse it.

/// Ethernet type carried by telemetry frames cloned to the control plane.
pub const CONQUEST_ETHERTYPE: u16 = 0x9001;

pub const ETH_HEADER_LEN: usize = 14;
pub const ETH_TYPE_OFFSET: usize = 12;

// Report payload layout. All fields are network byte order.
pub const REPORT_SRC_ADDR_OFFSET: usize = 0;
pub const REPORT_DST_ADDR_OFFSET: usize = 4;
pub const REPORT_SRC_PORT_OFFSET: usize = 8;
pub const REPORT_DST_PORT_OFFSET: usize = 10;
pub const REPORT_PROTOCOL_OFFSET: usize = 12;
pub const REPORT_QUEUE_OFFSET: usize = 13;

/// Width of the queue-occupancy field unless configured otherwise.
pub const DEFAULT_QUEUE_WIDTH: u8 = 4;
pub const MAX_QUEUE_WIDTH: u8 = 8;

pub const fn report_len(queue_width: u8) -> usize {
    REPORT_QUEUE_OFFSET + queue_width as usize
}

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// Mirror sessions cloning report packets toward the controller.
pub const MIRROR_SESSION_IDS: [u32; 4] = [400, 401, 402, 403];

/// Values of the 2-bit ECN field; trigger rules fan out over all of them.
pub const ECN_VALUES: [u8; 4] = [0, 1, 2, 3];

pub const FLOW_SIZE_ORIGINAL_BIT_WIDTH: u32 = 32;
// Least-significant bits dropped by the data plane.
pub const FLOW_SIZE_UPPER_BITS_DISCARDED: u32 = 5;
// Most-significant bits dropped by the data plane.
pub const FLOW_SIZE_LOWER_BITS_DISCARDED: u32 = 8;

pub const FLOW_SIZE_RANGE_MAX: u64 = range_max(
    FLOW_SIZE_ORIGINAL_BIT_WIDTH - (FLOW_SIZE_UPPER_BITS_DISCARDED + FLOW_SIZE_LOWER_BITS_DISCARDED),
);

pub const QUEUE_DELAY_BIT_WIDTH: u32 = 18;
pub const QUEUE_DELAY_RANGE_MAX: u64 = range_max(QUEUE_DELAY_BIT_WIDTH);

/// Largest value representable in `bits` bits.
pub const fn range_max(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

// Program entities. Names must match the compiled switch pipeline.
pub const REPORT_TRIGGER_TABLE: &str = "FabricEgress.conquest_egress.tb_per_flow_action";
pub const ACL_TABLE: &str = "FabricEgress.acl.acl";

pub const TRIGGER_REPORT_ACTION: &str = "FabricEgress.conquest_egress.trigger_report";
pub const ACL_DROP_ACTION: &str = "FabricEgress.acl.drop";

pub const FIELD_ECN: &str = "ecn";
pub const FIELD_FLOW_SIZE_IN_QUEUE: &str = "flow_size_in_queue";
pub const FIELD_QUEUE_DELAY: &str = "queue_delay";
pub const FIELD_IPV4_SRC: &str = "ipv4_src";
pub const FIELD_IPV4_DST: &str = "ipv4_dst";
pub const FIELD_L4_SPORT: &str = "l4_sport";
pub const FIELD_L4_DPORT: &str = "l4_dport";
pub const FIELD_IP_PROTO: &str = "ip_proto";
