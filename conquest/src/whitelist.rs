use std::{net::Ipv4Addr, sync::Mutex};

use anyhow::{Context, Result};
use ipnet::Ipv4Net;
use prefix_trie::PrefixMap;

use crate::model::CongestionReport;

/// Which side of a report hit the whitelist.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WhitelistHit {
    Source(Ipv4Net),
    Destination(Ipv4Net),
}

/// IPv4 prefixes exempt from blocking.
pub struct Whitelist {
    prefixes: Mutex<PrefixMap<Ipv4Net, ()>>,
}

impl Default for Whitelist {
    fn default() -> Self {
        Self {
            prefixes: Mutex::new(PrefixMap::new()),
        }
    }
}

impl Whitelist {
    pub fn from_entries<S: AsRef<str>>(entries: &[S]) -> Result<Self> {
        let list = Self::default();
        for (idx, entry) in entries.iter().enumerate() {
            let raw = entry.as_ref().trim();
            let net: Ipv4Net = raw
                .parse()
                .with_context(|| format!("invalid whitelist prefix '{raw}' at entry {}", idx + 1))?;
            list.add(net);
        }
        Ok(list)
    }

    /// Returns false if the prefix was already present.
    pub fn add(&self, prefix: Ipv4Net) -> bool {
        let mut guard = self.prefixes.lock().expect("whitelist mutex poisoned");
        guard.insert(prefix.trunc(), ()).is_none()
    }

    pub fn remove(&self, prefix: &Ipv4Net) -> bool {
        let mut guard = self.prefixes.lock().expect("whitelist mutex poisoned");
        guard.remove(&prefix.trunc()).is_some()
    }

    pub fn clear(&self) {
        let mut guard = self.prefixes.lock().expect("whitelist mutex poisoned");
        *guard = PrefixMap::new();
    }

    pub fn list(&self) -> Vec<Ipv4Net> {
        let guard = self.prefixes.lock().expect("whitelist mutex poisoned");
        let mut out: Vec<Ipv4Net> = guard.iter().map(|(net, _)| *net).collect();
        out.sort();
        out
    }

    #[cfg(test)]
    pub fn contains(&self, addr: Ipv4Addr) -> Option<Ipv4Net> {
        let guard = self.prefixes.lock().expect("whitelist mutex poisoned");
        lookup(&guard, addr)
    }

    /// Source address is checked first; the first hit wins.
    pub fn matching_prefix(&self, report: &CongestionReport) -> Option<WhitelistHit> {
        let guard = self.prefixes.lock().expect("whitelist mutex poisoned");
        if let Some(net) = lookup(&guard, report.src_addr()) {
            return Some(WhitelistHit::Source(net));
        }
        lookup(&guard, report.dst_addr()).map(WhitelistHit::Destination)
    }
}

fn lookup(map: &PrefixMap<Ipv4Net, ()>, addr: Ipv4Addr) -> Option<Ipv4Net> {
    map.get_lpm(&Ipv4Net::from(addr)).map(|(net, _)| *net)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FlowKey;
    use chrono::Local;

    fn report(src: [u8; 4], dst: [u8; 4]) -> CongestionReport {
        CongestionReport::new(
            FlowKey {
                src_addr: Ipv4Addr::from(src),
                dst_addr: Ipv4Addr::from(dst),
                src_port: 1234,
                dst_port: 80,
                protocol: 6,
            },
            0,
            Local::now(),
        )
    }

    fn net(raw: &str) -> Ipv4Net {
        raw.parse().unwrap()
    }

    #[test]
    fn matches_source_or_destination() {
        let list = Whitelist::default();
        list.add(net("10.0.0.0/8"));

        assert_eq!(
            list.matching_prefix(&report([10, 0, 0, 1], [192, 168, 0, 1])),
            Some(WhitelistHit::Source(net("10.0.0.0/8")))
        );
        assert_eq!(
            list.matching_prefix(&report([192, 168, 0, 1], [10, 9, 9, 9])),
            Some(WhitelistHit::Destination(net("10.0.0.0/8")))
        );
        assert_eq!(
            list.matching_prefix(&report([192, 168, 0, 1], [172, 16, 0, 1])),
            None
        );
    }

    #[test]
    fn host_bits_are_truncated_on_insert() {
        let list = Whitelist::default();
        assert!(list.add(net("10.1.2.3/16")));
        assert!(!list.add(net("10.1.0.0/16")));
        assert_eq!(list.list(), vec![net("10.1.0.0/16")]);
        assert_eq!(list.contains(Ipv4Addr::new(10, 1, 200, 4)), Some(net("10.1.0.0/16")));
    }

    #[test]
    fn remove_and_clear_are_idempotent() {
        let list = Whitelist::default();
        list.add(net("192.168.0.0/24"));
        assert!(list.remove(&net("192.168.0.0/24")));
        assert!(!list.remove(&net("192.168.0.0/24")));
        list.clear();
        list.clear();
        assert!(list.list().is_empty());
    }

    #[test]
    fn from_entries_rejects_bad_prefix() {
        assert!(Whitelist::from_entries(&["10.0.0.0/8", " 172.16.0.0/12 "]).is_ok());
        let err = Whitelist::from_entries(&["10.0.0.0/33"]).err().unwrap();
        assert!(err.to_string().contains("entry 1"));
    }
}
