use std::net::Ipv4Addr;

use chrono::{DateTime, Local};
use conquest_common::{
    DEFAULT_QUEUE_WIDTH, MAX_QUEUE_WIDTH, REPORT_DST_ADDR_OFFSET, REPORT_DST_PORT_OFFSET,
    REPORT_PROTOCOL_OFFSET, REPORT_QUEUE_OFFSET, REPORT_SRC_ADDR_OFFSET, REPORT_SRC_PORT_OFFSET,
    report_len,
};

use crate::{
    error::{ConquestError, Result},
    model::{CongestionReport, FlowKey},
};

/// Fixed-layout codec for report payloads. The queue field width is set per deployment.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ReportCodec {
    queue_width: u8,
}

impl Default for ReportCodec {
    fn default() -> Self {
        Self {
            queue_width: DEFAULT_QUEUE_WIDTH,
        }
    }
}

impl ReportCodec {
    pub fn new(queue_width: u8) -> Result<Self> {
        if queue_width == 0 || queue_width > MAX_QUEUE_WIDTH {
            return Err(ConquestError::InvalidQueueWidth(queue_width));
        }
        Ok(Self { queue_width })
    }

    pub fn queue_width(&self) -> u8 {
        self.queue_width
    }

    pub fn payload_len(&self) -> usize {
        report_len(self.queue_width)
    }

    pub fn decode(&self, payload: &[u8], received_at: DateTime<Local>) -> Result<CongestionReport> {
        let fields = Fields { buf: payload };
        let src_addr = Ipv4Addr::from(fields.array::<4>("source address", REPORT_SRC_ADDR_OFFSET)?);
        let dst_addr = Ipv4Addr::from(fields.array::<4>("destination address", REPORT_DST_ADDR_OFFSET)?);
        let src_port = u16::from_be_bytes(fields.array::<2>("source port", REPORT_SRC_PORT_OFFSET)?);
        let dst_port = u16::from_be_bytes(fields.array::<2>("destination port", REPORT_DST_PORT_OFFSET)?);
        let [protocol] = fields.array::<1>("protocol", REPORT_PROTOCOL_OFFSET)?;
        let queue_size = fields
            .slice("queue size", REPORT_QUEUE_OFFSET, self.queue_width as usize)?
            .iter()
            .fold(0u64, |acc, b| (acc << 8) | *b as u64);

        let flow = FlowKey {
            src_addr,
            dst_addr,
            src_port,
            dst_port,
            protocol,
        };
        Ok(CongestionReport::new(flow, queue_size, received_at))
    }

    pub fn decode_now(&self, payload: &[u8]) -> Result<CongestionReport> {
        self.decode(payload, Local::now())
    }

    /// Inverse of [`ReportCodec::decode`]; queue sizes wider than the field are truncated.
    pub fn encode(&self, report: &CongestionReport) -> Vec<u8> {
        let flow = report.flow();
        let mut out = Vec::with_capacity(self.payload_len());
        out.extend_from_slice(&flow.src_addr.octets());
        out.extend_from_slice(&flow.dst_addr.octets());
        out.extend_from_slice(&flow.src_port.to_be_bytes());
        out.extend_from_slice(&flow.dst_port.to_be_bytes());
        out.push(flow.protocol);
        let queue = report.queue_size().to_be_bytes();
        out.extend_from_slice(&queue[queue.len() - self.queue_width as usize..]);
        out
    }
}

struct Fields<'a> {
    buf: &'a [u8],
}

impl<'a> Fields<'a> {
    fn slice(&self, field: &'static str, offset: usize, len: usize) -> Result<&'a [u8]> {
        self.buf
            .get(offset..offset + len)
            .ok_or(ConquestError::MalformedPayload {
                field,
                needed: len,
                remaining: self.buf.len().saturating_sub(offset),
            })
    }

    fn array<const N: usize>(&self, field: &'static str, offset: usize) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.slice(field, offset, N)?);
        Ok(out)
    }
}

pub fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use conquest_common::{PROTO_TCP, PROTO_UDP};

    fn sample(queue_size: u64) -> CongestionReport {
        CongestionReport::new(
            FlowKey {
                src_addr: Ipv4Addr::new(10, 0, 0, 1),
                dst_addr: Ipv4Addr::new(10, 0, 0, 2),
                src_port: 1234,
                dst_port: 80,
                protocol: PROTO_TCP,
            },
            queue_size,
            Local::now(),
        )
    }

    #[test]
    fn decodes_documented_layout() {
        let payload = [
            10, 0, 0, 1, // src
            10, 0, 0, 2, // dst
            0x04, 0xd2, // 1234
            0x00, 0x50, // 80
            PROTO_UDP, 0x00, 0x00, 0x13, 0x88, // 5000
        ];
        let report = ReportCodec::default().decode_now(&payload).unwrap();
        let flow = report.flow();
        assert_eq!(flow.src_addr, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(flow.dst_addr, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(flow.src_port, 1234);
        assert_eq!(flow.dst_port, 80);
        assert_eq!(flow.protocol, PROTO_UDP);
        assert_eq!(report.queue_size(), 5000);
    }

    #[test]
    fn round_trips_at_default_width() {
        let codec = ReportCodec::default();
        let report = sample(5000);
        let bytes = codec.encode(&report);
        assert_eq!(bytes.len(), 17);
        assert_eq!(codec.decode(&bytes, report.received_at()).unwrap(), report);
    }

    #[test]
    fn round_trips_at_wider_queue_field() {
        let codec = ReportCodec::new(8).unwrap();
        let report = sample(u64::MAX - 7);
        let bytes = codec.encode(&report);
        assert_eq!(bytes.len(), 21);
        assert_eq!(codec.decode(&bytes, report.received_at()).unwrap(), report);
    }

    #[test]
    fn ten_byte_payload_is_malformed() {
        let err = ReportCodec::default().decode_now(&[0u8; 10]).unwrap_err();
        assert_eq!(
            err,
            ConquestError::MalformedPayload {
                field: "destination port",
                needed: 2,
                remaining: 0,
            }
        );
    }

    #[test]
    fn missing_queue_bytes_are_not_defaulted() {
        let codec = ReportCodec::default();
        let mut bytes = codec.encode(&sample(1));
        bytes.pop();
        assert!(matches!(
            codec.decode_now(&bytes),
            Err(ConquestError::MalformedPayload {
                field: "queue size",
                needed: 4,
                remaining: 3,
            })
        ));
    }

    #[test]
    fn protocol_zero_is_not_rejected() {
        let mut bytes = ReportCodec::default().encode(&sample(1));
        bytes[12] = 0;
        let report = ReportCodec::default().decode_now(&bytes).unwrap();
        assert_eq!(report.protocol(), 0);
    }

    #[test]
    fn rejects_out_of_range_widths() {
        assert_eq!(ReportCodec::new(0), Err(ConquestError::InvalidQueueWidth(0)));
        assert_eq!(ReportCodec::new(9), Err(ConquestError::InvalidQueueWidth(9)));
    }

    #[test]
    fn hex_string_is_lowercase_pairs() {
        assert_eq!(hex_string(&[0x90, 0x01, 0x0a]), "90010a");
    }
}
