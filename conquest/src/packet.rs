use conquest_common::{CONQUEST_ETHERTYPE, ETH_HEADER_LEN, ETH_TYPE_OFFSET};

use crate::services::DeviceId;

/// A frame punted to the controller by a device.
#[derive(Clone, Debug)]
pub struct PacketIn {
    pub device: DeviceId,
    pub frame: Vec<u8>,
}

pub struct EthernetFrame<'a> {
    pub ether_type: u16,
    pub payload: &'a [u8],
}

impl EthernetFrame<'_> {
    pub fn is_report(&self) -> bool {
        self.ether_type == CONQUEST_ETHERTYPE
    }
}

pub fn parse_frame(frame: &[u8]) -> Option<EthernetFrame<'_>> {
    if frame.len() < ETH_HEADER_LEN {
        return None;
    }
    let ether_type = u16::from_be_bytes([frame[ETH_TYPE_OFFSET], frame[ETH_TYPE_OFFSET + 1]]);
    Some(EthernetFrame {
        ether_type,
        payload: &frame[ETH_HEADER_LEN..],
    })
}

/// Wraps a report payload in an Ethernet header as the data plane would.
pub fn build_report_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ETH_HEADER_LEN + payload.len());
    // dst/src MACs are irrelevant to the control plane.
    frame.extend_from_slice(&[0u8; 12]);
    frame.extend_from_slice(&CONQUEST_ETHERTYPE.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_report_ethertype() {
        let frame = build_report_frame(&[1, 2, 3]);
        let parsed = parse_frame(&frame).unwrap();
        assert!(parsed.is_report());
        assert_eq!(parsed.payload, &[1, 2, 3]);
    }

    #[test]
    fn other_ethertypes_are_not_reports() {
        let mut frame = vec![0u8; 12];
        frame.extend_from_slice(&0x0800u16.to_be_bytes());
        frame.extend_from_slice(&[0x45; 20]);
        let parsed = parse_frame(&frame).unwrap();
        assert_eq!(parsed.ether_type, 0x0800);
        assert!(!parsed.is_report());
    }

    #[test]
    fn short_frames_are_rejected() {
        assert!(parse_frame(&[0u8; 13]).is_none());
    }
}
