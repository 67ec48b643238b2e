use std::{
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use chrono::Local;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    error::{ConquestError, Result},
    model::{CongestionReport, FlowKey},
    scheduler::{ExpiryScheduler, ExpiryToken},
    services::DeviceId,
    store::{BlockTable, BlockedFlowRecord, ReportGroup, ReportLog},
    strategy::BlockStrategy,
    whitelist::{Whitelist, WhitelistHit},
};

pub const DEFAULT_BLOCK_DURATION_MS: i64 = 1000;

/// What `handle_report` decided for one report.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BlockOutcome {
    UnsupportedProtocol,
    /// Block duration is 0.
    Disabled,
    Whitelisted(WhitelistHit),
    /// The flow already has a block; its expiry is left untouched.
    AlreadyBlocked,
    /// `expires_in` is `None` for permanent blocks.
    Blocked { expires_in: Option<Duration> },
}

/// Owns every active block and decides which reports produce new ones.
pub struct BlockController {
    blocked: BlockTable,
    reports: ReportLog,
    whitelist: Whitelist,
    block_duration_ms: AtomicI64,
    strategy: Box<dyn BlockStrategy>,
    scheduler: ExpiryScheduler<FlowKey>,
}

impl BlockController {
    pub fn new(strategy: Box<dyn BlockStrategy>, whitelist: Whitelist, block_duration_ms: i64) -> Self {
        Self {
            blocked: BlockTable::default(),
            reports: ReportLog::default(),
            whitelist,
            block_duration_ms: AtomicI64::new(block_duration_ms),
            strategy,
            scheduler: ExpiryScheduler::new(),
        }
    }

    /// Starts the expiry driver and the worker applying fired expiries.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.scheduler.spawn_driver(tx);
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(expired) = rx.recv().await {
                controller.on_expiry(expired.payload, expired.token);
            }
        })
    }

    /// Stops firing expiries. Blocks still recorded stay until cleared.
    pub fn stop(&self) {
        self.scheduler.shutdown();
    }

    pub fn strategy(&self) -> &dyn BlockStrategy {
        self.strategy.as_ref()
    }

    pub fn whitelist(&self) -> &Whitelist {
        &self.whitelist
    }

    pub fn set_block_duration(&self, ms: i64) {
        self.block_duration_ms.store(ms, Ordering::Relaxed);
        info!(block_duration_ms = ms, "block duration updated");
    }

    pub fn block_duration(&self) -> i64 {
        self.block_duration_ms.load(Ordering::Relaxed)
    }

    pub fn handle_report(&self, device: &DeviceId, report: CongestionReport) -> Result<BlockOutcome> {
        self.reports.push(report.clone());

        let flow = report.flow();
        if !flow.is_tcp_or_udp() {
            info!(protocol = report.protocol(), "not blocking non-TCP/UDP flow");
            return Ok(BlockOutcome::UnsupportedProtocol);
        }

        let duration_ms = self.block_duration();
        if duration_ms == 0 {
            info!("block duration is 0, not blocking flow");
            return Ok(BlockOutcome::Disabled);
        }

        if let Some(hit) = self.whitelist.matching_prefix(&report) {
            match hit {
                WhitelistHit::Source(prefix) => {
                    info!(%prefix, "source address matches whitelisted prefix, not blocking")
                }
                WhitelistHit::Destination(prefix) => {
                    info!(%prefix, "destination address matches whitelisted prefix, not blocking")
                }
            }
            return Ok(BlockOutcome::Whitelisted(hit));
        }

        let mut shard = self.blocked.lock(&flow);
        if shard.contains_key(&flow) {
            debug!(%flow, "flow already blocked");
            return Ok(BlockOutcome::AlreadyBlocked);
        }

        let expires_in = u64::try_from(duration_ms).ok().map(Duration::from_millis);
        match expires_in {
            Some(after) => info!(%flow, "blocking for {}ms in response to report", after.as_millis()),
            None => info!(%flow, "blocking ~forever~ in response to report"),
        }

        let handle = self.strategy.install(device, &report)?;
        let expiry = expires_in.map(|after| self.scheduler.schedule(after, flow));
        shard.insert(
            flow,
            BlockedFlowRecord {
                report,
                device: device.clone(),
                handle,
                expiry,
                blocked_at: Local::now(),
            },
        );
        Ok(BlockOutcome::Blocked { expires_in })
    }

    /// Lifts the block armed with `token`. Returns false when that block is
    /// already gone, including when the flow was cleared and blocked again.
    pub fn on_expiry(&self, flow: FlowKey, token: ExpiryToken) -> bool {
        let mut shard = self.blocked.lock(&flow);
        let current = shard
            .get(&flow)
            .is_some_and(|record| record.expiry == Some(token));
        if !current {
            debug!(%flow, "ignoring stale expiry");
            return false;
        }
        let Some(record) = shard.remove(&flow) else {
            return false;
        };
        info!(%flow, "unblocking");
        if let Err(err) = self.strategy.remove(record.handle) {
            warn!(%flow, error = %err, "failed to remove block, rule may linger on the device");
        }
        true
    }

    /// Removes the block for `flow` now. Returns false if it was not blocked.
    pub fn unblock(&self, flow: &FlowKey) -> Result<bool> {
        let mut shard = self.blocked.lock(flow);
        let Some(record) = shard.get(flow) else {
            return Ok(false);
        };
        self.strategy.remove(record.handle)?;
        if let Some(token) = record.expiry {
            self.scheduler.cancel(token);
        }
        shard.remove(flow);
        info!(%flow, "unblocked by request");
        Ok(true)
    }

    /// Unblocks every flow. Pending expiries are cancelled with their records.
    pub fn clear_blocks(&self) -> Result<usize> {
        let mut cleared = 0;
        let mut first_err: Option<ConquestError> = None;
        for flow in self.blocked.keys() {
            match self.unblock(&flow) {
                Ok(true) => cleared += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(%flow, error = %err, "failed to clear block");
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(cleared),
        }
    }

    /// Removes every block from the network and drops its record.
    ///
    /// Records are purged even when removal fails; the first failure is
    /// returned after every block was attempted.
    pub fn release_blocks(&self) -> Result<usize> {
        let mut released = 0;
        let mut first_err: Option<ConquestError> = None;
        for flow in self.blocked.keys() {
            let mut shard = self.blocked.lock(&flow);
            let Some(record) = shard.remove(&flow) else {
                continue;
            };
            if let Some(token) = record.expiry {
                self.scheduler.cancel(token);
            }
            match self.strategy.remove(record.handle) {
                Ok(()) => released += 1,
                Err(err) => {
                    warn!(%flow, error = %err, "failed to remove block, rule may linger on the device");
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(released),
        }
    }

    #[cfg(test)]
    pub fn is_blocked(&self, flow: &FlowKey) -> bool {
        self.blocked.lock(flow).contains_key(flow)
    }

    pub fn blocked_flows(&self) -> Vec<(FlowKey, BlockedFlowRecord)> {
        self.blocked.snapshot()
    }

    pub fn currently_blocked(&self) -> Vec<String> {
        self.blocked.keys().iter().map(ToString::to_string).collect()
    }

    pub fn pending_expiries(&self) -> usize {
        self.scheduler.pending()
    }

    pub fn received_reports(&self) -> Vec<CongestionReport> {
        self.reports.snapshot()
    }

    pub fn grouped_reports(&self) -> Vec<ReportGroup> {
        self.reports.grouped()
    }

    pub fn clear_received_reports(&self) -> usize {
        self.reports.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fabric::SimulatedFabric,
        services::AppId,
        strategy::{BlockingMode, strategy_for},
    };
    use conquest_common::{PROTO_ICMP, PROTO_TCP, PROTO_UDP};
    use std::{net::Ipv4Addr, sync::Barrier};
    use tokio::{task, time};

    fn device() -> DeviceId {
        DeviceId::from("device:s1")
    }

    fn setup(mode: BlockingMode, duration_ms: i64) -> (Arc<BlockController>, Arc<SimulatedFabric>) {
        let fabric = Arc::new(SimulatedFabric::new([(device(), Some("conquest".to_string()))]));
        let strategy = strategy_for(mode, AppId::new("test-app"), fabric.clone(), fabric.clone());
        strategy.prepare().unwrap();
        let controller = Arc::new(BlockController::new(
            strategy,
            Whitelist::default(),
            duration_ms,
        ));
        (controller, fabric)
    }

    fn report(protocol: u8) -> CongestionReport {
        CongestionReport::new(
            FlowKey {
                src_addr: Ipv4Addr::new(10, 0, 0, 1),
                dst_addr: Ipv4Addr::new(10, 0, 0, 2),
                src_port: 1234,
                dst_port: 80,
                protocol,
            },
            5000,
            Local::now(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn blocks_then_expires_after_duration() {
        let (controller, fabric) = setup(BlockingMode::DeviceRules, 500);
        let _worker = controller.start();

        let outcome = controller.handle_report(&device(), report(PROTO_TCP)).unwrap();
        assert_eq!(
            outcome,
            BlockOutcome::Blocked {
                expires_in: Some(Duration::from_millis(500))
            }
        );
        assert_eq!(
            controller.currently_blocked(),
            vec!["(TCP, 10.0.0.1:1234->10.0.0.2:80)".to_string()]
        );
        assert_eq!(fabric.installed_rules().len(), 1);

        time::sleep(Duration::from_millis(499)).await;
        assert!(controller.is_blocked(&report(PROTO_TCP).flow()));

        time::sleep(Duration::from_millis(2)).await;
        assert!(controller.currently_blocked().is_empty());
        assert!(fabric.installed_rules().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn whitelisted_reports_are_never_blocked() {
        let (controller, fabric) = setup(BlockingMode::DeviceRules, -1);
        controller.whitelist().add("10.0.0.0/8".parse().unwrap());

        let outcome = controller.handle_report(&device(), report(PROTO_TCP)).unwrap();
        assert!(matches!(outcome, BlockOutcome::Whitelisted(WhitelistHit::Source(_))));
        assert!(controller.currently_blocked().is_empty());
        assert!(fabric.installed_rules().is_empty());
        assert_eq!(controller.received_reports().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn non_tcp_udp_is_logged_but_not_blocked() {
        let (controller, _fabric) = setup(BlockingMode::DeviceRules, 500);
        for proto in [PROTO_ICMP, 0, 47] {
            assert_eq!(
                controller.handle_report(&device(), report(proto)).unwrap(),
                BlockOutcome::UnsupportedProtocol
            );
        }
        assert!(controller.currently_blocked().is_empty());
        assert_eq!(controller.received_reports().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_duration_disables_blocking() {
        let (controller, fabric) = setup(BlockingMode::DeviceRules, 0);
        assert_eq!(
            controller.handle_report(&device(), report(PROTO_UDP)).unwrap(),
            BlockOutcome::Disabled
        );
        assert!(fabric.installed_rules().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn negative_duration_blocks_permanently() {
        let (controller, _fabric) = setup(BlockingMode::DeviceRules, -1);
        let _worker = controller.start();
        assert_eq!(
            controller.handle_report(&device(), report(PROTO_TCP)).unwrap(),
            BlockOutcome::Blocked { expires_in: None }
        );
        assert_eq!(controller.pending_expiries(), 0);
        time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(controller.currently_blocked().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_reports_do_not_refresh_or_duplicate() {
        let (controller, fabric) = setup(BlockingMode::DeviceRules, 500);
        let _worker = controller.start();
        controller.handle_report(&device(), report(PROTO_TCP)).unwrap();

        time::sleep(Duration::from_millis(300)).await;
        assert_eq!(
            controller.handle_report(&device(), report(PROTO_TCP)).unwrap(),
            BlockOutcome::AlreadyBlocked
        );
        assert_eq!(fabric.installed_rules().len(), 1);
        assert_eq!(controller.pending_expiries(), 1);

        // Original deadline still applies.
        time::sleep(Duration::from_millis(201)).await;
        assert!(controller.currently_blocked().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_duplicates_install_once() {
        let (controller, fabric) = setup(BlockingMode::DeviceRules, -1);
        let other = DeviceId::from("device:s2");
        fabric.set_pipeconf(&other, Some("conquest".to_string()));

        let reporters = 16;
        let barrier = Arc::new(Barrier::new(reporters));
        let mut handles = Vec::with_capacity(reporters);
        for i in 0..reporters {
            let controller = controller.clone();
            let barrier = barrier.clone();
            let from = if i % 2 == 0 { device() } else { other.clone() };
            handles.push(task::spawn_blocking(move || {
                barrier.wait();
                controller.handle_report(&from, report(PROTO_TCP)).unwrap()
            }));
        }
        let mut blocked = 0;
        for handle in handles {
            match handle.await.unwrap() {
                BlockOutcome::Blocked { .. } => blocked += 1,
                outcome => assert_eq!(outcome, BlockOutcome::AlreadyBlocked),
            }
        }
        assert_eq!(blocked, 1);
        assert_eq!(fabric.installed_rules().len(), 1);
        assert_eq!(controller.received_reports().len(), reporters);
    }

    #[tokio::test(start_paused = true)]
    async fn duration_change_applies_to_future_blocks_only() {
        let (controller, _fabric) = setup(BlockingMode::DeviceRules, 100);
        let _worker = controller.start();
        controller.handle_report(&device(), report(PROTO_TCP)).unwrap();
        controller.set_block_duration(-1);

        let udp = report(PROTO_UDP);
        controller.handle_report(&device(), udp.clone()).unwrap();

        time::sleep(Duration::from_millis(150)).await;
        assert_eq!(controller.currently_blocked(), vec![udp.flow().to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_unblock_makes_expiry_a_no_op() {
        let (controller, fabric) = setup(BlockingMode::Policy, 500);
        let _worker = controller.start();
        let flow = report(PROTO_TCP).flow();
        controller.handle_report(&device(), report(PROTO_TCP)).unwrap();
        let token = controller.blocked_flows()[0].1.expiry.unwrap();

        assert!(controller.unblock(&flow).unwrap());
        assert!(!controller.unblock(&flow).unwrap());
        assert!(fabric.traffic_matches().is_empty());
        assert_eq!(controller.pending_expiries(), 0);
        assert!(!controller.on_expiry(flow, token));

        // A later block of the same flow is not lifted by the stale token.
        controller.handle_report(&device(), report(PROTO_TCP)).unwrap();
        assert!(!controller.on_expiry(flow, token));
        assert!(controller.is_blocked(&flow));
    }

    #[tokio::test(start_paused = true)]
    async fn removal_failure_on_expiry_still_purges_record() {
        let (controller, fabric) = setup(BlockingMode::DeviceRules, 50);
        let _worker = controller.start();
        controller.handle_report(&device(), report(PROTO_TCP)).unwrap();
        fabric.fail_removals(true);

        time::sleep(Duration::from_millis(60)).await;
        assert!(controller.currently_blocked().is_empty());
        assert_eq!(fabric.installed_rules().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn install_failure_propagates_without_record() {
        let (controller, fabric) = setup(BlockingMode::DeviceRules, 500);
        fabric.fail_installs(true);
        let err = controller
            .handle_report(&device(), report(PROTO_TCP))
            .unwrap_err();
        assert!(matches!(err, ConquestError::RuleInstallFailure { .. }));
        assert!(controller.currently_blocked().is_empty());
        assert_eq!(controller.pending_expiries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_blocks_cancels_pending_expiries() {
        let (controller, fabric) = setup(BlockingMode::DeviceRules, 500);
        let _worker = controller.start();
        controller.handle_report(&device(), report(PROTO_TCP)).unwrap();
        controller.handle_report(&device(), report(PROTO_UDP)).unwrap();

        assert_eq!(controller.clear_blocks().unwrap(), 2);
        assert_eq!(controller.clear_blocks().unwrap(), 0);
        assert_eq!(controller.pending_expiries(), 0);
        assert!(fabric.installed_rules().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn release_blocks_removes_from_network() {
        let (controller, fabric) = setup(BlockingMode::Policy, 500);
        let _worker = controller.start();
        controller.handle_report(&device(), report(PROTO_TCP)).unwrap();
        controller.handle_report(&device(), report(PROTO_UDP)).unwrap();
        assert_eq!(fabric.traffic_matches().len(), 2);

        assert_eq!(controller.release_blocks().unwrap(), 2);
        assert!(controller.currently_blocked().is_empty());
        assert!(fabric.traffic_matches().is_empty());
        assert_eq!(controller.pending_expiries(), 0);
        assert_eq!(controller.release_blocks().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn release_blocks_purges_records_despite_failures() {
        let (controller, fabric) = setup(BlockingMode::DeviceRules, 500);
        let _worker = controller.start();
        controller.handle_report(&device(), report(PROTO_TCP)).unwrap();
        controller.handle_report(&device(), report(PROTO_UDP)).unwrap();
        fabric.fail_removals(true);

        let err = controller.release_blocks().unwrap_err();
        assert!(matches!(err, ConquestError::RuleRemovalFailure(_)));
        assert!(controller.currently_blocked().is_empty());
        assert_eq!(controller.pending_expiries(), 0);
        assert_eq!(fabric.installed_rules().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_unblock_keeps_record_for_retry() {
        let (controller, fabric) = setup(BlockingMode::DeviceRules, 500);
        let _worker = controller.start();
        let flow = report(PROTO_TCP).flow();
        controller.handle_report(&device(), report(PROTO_TCP)).unwrap();
        fabric.fail_removals(true);

        assert!(matches!(
            controller.unblock(&flow),
            Err(ConquestError::RuleRemovalFailure(_))
        ));
        assert!(controller.is_blocked(&flow));
        assert_eq!(controller.pending_expiries(), 1);

        fabric.fail_removals(false);
        assert!(controller.unblock(&flow).unwrap());
        assert!(fabric.installed_rules().is_empty());
        assert_eq!(controller.pending_expiries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn same_flow_from_two_devices_blocks_once() {
        let (controller, fabric) = setup(BlockingMode::DeviceRules, -1);
        let other = DeviceId::from("device:s2");
        fabric.set_pipeconf(&other, Some("conquest".to_string()));

        assert_eq!(
            controller.handle_report(&device(), report(PROTO_TCP)).unwrap(),
            BlockOutcome::Blocked { expires_in: None }
        );
        assert_eq!(
            controller.handle_report(&other, report(PROTO_TCP)).unwrap(),
            BlockOutcome::AlreadyBlocked
        );
        let rules = fabric.installed_rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].rule.device, device());
        assert_eq!(controller.blocked_flows()[0].1.device, device());
    }
}
