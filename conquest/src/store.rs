use std::{
    collections::{BTreeMap, HashMap, hash_map::DefaultHasher},
    hash::{Hash, Hasher},
    net::Ipv4Addr,
    sync::{Mutex, MutexGuard},
};

use chrono::{DateTime, Local};

use crate::{
    model::{CongestionReport, FlowKey},
    scheduler::ExpiryToken,
    services::DeviceId,
    strategy::BlockHandle,
};

pub const BLOCK_SHARDS: usize = 64;

#[derive(Clone, Debug)]
pub struct BlockedFlowRecord {
    pub report: CongestionReport,
    pub device: DeviceId,
    pub handle: BlockHandle,
    /// `None` for permanent blocks.
    pub expiry: Option<ExpiryToken>,
    pub blocked_at: DateTime<Local>,
}

pub type BlockShard = HashMap<FlowKey, BlockedFlowRecord>;

/// Active blocks, sharded by flow so unrelated flows never contend.
pub struct BlockTable {
    shards: Vec<Mutex<BlockShard>>,
}

impl BlockTable {
    fn new() -> Self {
        let mut shards = Vec::with_capacity(BLOCK_SHARDS);
        for _ in 0..BLOCK_SHARDS {
            shards.push(Mutex::new(HashMap::new()));
        }
        Self { shards }
    }

    fn shard_index(&self, key: &FlowKey) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len().max(1)
    }

    /// Locks the shard owning `key`. Holding the guard serializes every
    /// operation on that flow.
    pub fn lock(&self, key: &FlowKey) -> MutexGuard<'_, BlockShard> {
        let idx = self.shard_index(key);
        self.shards[idx].lock().expect("block shard mutex poisoned")
    }

    pub fn snapshot(&self) -> Vec<(FlowKey, BlockedFlowRecord)> {
        let mut merged = Vec::new();
        for shard in &self.shards {
            let guard = shard.lock().expect("block shard mutex poisoned");
            merged.extend(guard.iter().map(|(key, record)| (*key, record.clone())));
        }
        merged.sort_by_key(|(key, _)| *key);
        merged
    }

    pub fn keys(&self) -> Vec<FlowKey> {
        self.snapshot().into_iter().map(|(key, _)| key).collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().expect("block shard mutex poisoned").len())
            .sum()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BlockTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Reports for one 5-tuple, oldest first.
#[derive(Clone, Debug)]
pub struct FlowReports {
    pub flow: FlowKey,
    pub reports: Vec<CongestionReport>,
}

impl FlowReports {
    pub fn latest(&self) -> Option<DateTime<Local>> {
        self.reports.iter().map(|r| r.received_at()).max()
    }
}

/// Reports sharing a source/destination address pair.
#[derive(Clone, Debug)]
pub struct ReportGroup {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub flows: Vec<FlowReports>,
}

#[derive(Default)]
pub struct ReportLog {
    reports: Mutex<Vec<CongestionReport>>,
}

impl ReportLog {
    pub fn push(&self, report: CongestionReport) {
        let mut guard = self.reports.lock().expect("report log mutex poisoned");
        guard.push(report);
    }

    pub fn snapshot(&self) -> Vec<CongestionReport> {
        let guard = self.reports.lock().expect("report log mutex poisoned");
        guard.clone()
    }

    pub fn clear(&self) -> usize {
        let mut guard = self.reports.lock().expect("report log mutex poisoned");
        let count = guard.len();
        guard.clear();
        count
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.reports.lock().expect("report log mutex poisoned").len()
    }

    pub fn grouped(&self) -> Vec<ReportGroup> {
        let mut by_pair: BTreeMap<(Ipv4Addr, Ipv4Addr), BTreeMap<FlowKey, Vec<CongestionReport>>> =
            BTreeMap::new();
        for report in self.snapshot() {
            by_pair
                .entry((report.src_addr(), report.dst_addr()))
                .or_default()
                .entry(report.flow())
                .or_default()
                .push(report);
        }

        by_pair
            .into_iter()
            .map(|((src_addr, dst_addr), flows)| ReportGroup {
                src_addr,
                dst_addr,
                flows: flows
                    .into_iter()
                    .map(|(flow, mut reports)| {
                        reports.sort_by_key(|r| r.received_at());
                        FlowReports { flow, reports }
                    })
                    .collect(),
            })
            .collect()
    }
}
