use std::sync::{Arc, Mutex};

use conquest_common::{MIRROR_SESSION_IDS, REPORT_TRIGGER_TABLE};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    capability::CapabilityCache,
    codec::{ReportCodec, hex_string},
    controller::{BlockController, BlockOutcome},
    error::{ConquestError, Result},
    model::CongestionReport,
    packet::{PacketIn, parse_frame},
    rules::build_trigger_rules,
    services::{AppId, CloneGroup, DeviceId, OutputPort, Services},
    strategy::{BlockingMode, strategy_for},
    whitelist::Whitelist,
};

pub const APP_NAME: &str = "org.princeton.conquest-app";

#[derive(Debug, Eq, PartialEq)]
pub enum PacketOutcome {
    /// Not a report frame; left for other handlers.
    Ignored,
    Malformed(ConquestError),
    Handled(BlockOutcome),
}

#[derive(Debug, Eq, PartialEq)]
pub enum TriggerOutcome {
    Installed(usize),
    NotQualifying,
}

pub struct AppOptions {
    pub blocking_mode: BlockingMode,
    pub block_duration_ms: i64,
    pub codec: ReportCodec,
    pub program_marker: String,
    pub whitelist: Whitelist,
}

/// The congestion-response application bound to one platform.
pub struct Conquest {
    app: AppId,
    services: Services,
    capabilities: CapabilityCache,
    codec: ReportCodec,
    controller: Arc<BlockController>,
    expiry_worker: Mutex<Option<JoinHandle<()>>>,
}

impl Conquest {
    pub fn new(services: Services, opts: AppOptions) -> Self {
        let app = AppId::new(APP_NAME);
        let strategy = strategy_for(
            opts.blocking_mode,
            app.clone(),
            services.flow_rules.clone(),
            services.policies.clone(),
        );
        Self {
            capabilities: CapabilityCache::new(services.pipeconfs.clone(), opts.program_marker),
            controller: Arc::new(BlockController::new(
                strategy,
                opts.whitelist,
                opts.block_duration_ms,
            )),
            codec: opts.codec,
            app,
            services,
            expiry_worker: Mutex::new(None),
        }
    }

    pub fn controller(&self) -> &BlockController {
        &self.controller
    }

    pub fn codec(&self) -> ReportCodec {
        self.codec
    }

    pub fn is_target_device(&self, device: &DeviceId) -> bool {
        self.capabilities.is_target_device(device)
    }

    pub fn target_devices(&self) -> Vec<DeviceId> {
        self.services
            .inventory
            .available_devices()
            .into_iter()
            .filter(|device| self.is_target_device(device))
            .collect()
    }

    /// Installs clone sessions and the blocking policy, then starts expiries.
    /// Must be called from within a tokio runtime.
    pub fn activate(&self) -> Result<()> {
        self.controller.strategy().prepare()?;
        for device in self.target_devices() {
            self.add_clone_sessions(&device)?;
        }
        info!("added all clone sessions");

        let mut worker = self.expiry_worker.lock().expect("expiry worker mutex poisoned");
        if worker.is_none() {
            *worker = Some(self.controller.start());
        }
        info!(app = %self.app, queue_width = self.codec.queue_width(), "started");
        Ok(())
    }

    /// Removes everything this application installed. Safe to repeat.
    ///
    /// Every cleanup step runs even when an earlier one fails; the first
    /// failure is returned once all of them were attempted.
    pub fn deactivate(&self) -> Result<()> {
        self.controller.stop();
        if let Some(handle) = self
            .expiry_worker
            .lock()
            .expect("expiry worker mutex poisoned")
            .take()
        {
            handle.abort();
        }

        info!("cleaning up groups and table entries that may be hanging around");
        let mut first_err: Option<ConquestError> = None;
        let mut record = |step: &'static str, result: Result<()>| {
            if let Err(err) = result {
                warn!(step, error = %err, "cleanup step failed, continuing");
                first_err.get_or_insert(err);
            }
        };
        for device in self.target_devices() {
            record("clone sessions", self.remove_clone_sessions(&device));
        }
        record("blocks", self.controller.release_blocks().map(|_| ()));
        record(
            "flow rules",
            self.services.flow_rules.remove_by_app(&self.app).map(|_| ()),
        );
        record("blocking strategy", self.controller.strategy().teardown());

        match first_err {
            Some(err) => Err(err),
            None => {
                info!(app = %self.app, "stopped");
                Ok(())
            }
        }
    }

    fn add_clone_sessions(&self, device: &DeviceId) -> Result<()> {
        for session_id in MIRROR_SESSION_IDS {
            info!(session_id, %device, "adding clone session");
            self.services.groups.add_clone_group(CloneGroup {
                device: device.clone(),
                app: self.app.clone(),
                session_id,
                ports: vec![OutputPort::Controller],
            })?;
        }
        Ok(())
    }

    fn remove_clone_sessions(&self, device: &DeviceId) -> Result<()> {
        let mut first_err = None;
        for group in self.services.groups.groups(device, &self.app) {
            if let Err(err) = self
                .services
                .groups
                .remove_group(device, group.session_id, &self.app)
            {
                warn!(%device, session_id = group.session_id, error = %err, "failed to remove clone session");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub fn process_packet(&self, packet: &PacketIn) -> Result<PacketOutcome> {
        let Some(frame) = parse_frame(&packet.frame) else {
            debug!(device = %packet.device, len = packet.frame.len(), "runt packet-in, ignoring");
            return Ok(PacketOutcome::Ignored);
        };
        if !frame.is_report() {
            debug!(
                device = %packet.device,
                ether_type = frame.ether_type,
                frame = %hex_string(&packet.frame),
                "packet-in not for us"
            );
            return Ok(PacketOutcome::Ignored);
        }

        debug!(frame = %hex_string(&packet.frame), "received report packet-in");
        let report = match self.codec.decode_now(frame.payload) {
            Ok(report) => report,
            Err(err) => {
                warn!(device = %packet.device, error = %err, "dropping malformed report");
                return Ok(PacketOutcome::Malformed(err));
            }
        };
        info!(device = %packet.device, %report, "received report");
        self.controller
            .handle_report(&packet.device, report)
            .map(PacketOutcome::Handled)
    }

    /// Feeds a synthetic report through the blocking path.
    pub fn block_flow(&self, device: &DeviceId, report: CongestionReport) -> Result<BlockOutcome> {
        if !self.services.inventory.contains(device) {
            return Err(ConquestError::UnknownDevice(device.clone()));
        }
        info!(%report, "blocking flow for injected report");
        self.controller.handle_report(device, report)
    }

    pub fn add_report_trigger(
        &self,
        device: &DeviceId,
        min_queue_delay: u64,
        min_flow_size_in_queue: u64,
    ) -> Result<TriggerOutcome> {
        if !self.is_target_device(device) {
            debug!(%device, "device does not run the conquest pipeline, skipping triggers");
            return Ok(TriggerOutcome::NotQualifying);
        }
        let rules = build_trigger_rules(&self.app, device, min_queue_delay, min_flow_size_in_queue);
        let count = rules.len();
        for rule in rules {
            info!(%rule, "installing trigger rule");
            self.services.flow_rules.apply(rule)?;
        }
        info!(%device, "added report trigger flow rules");
        Ok(TriggerOutcome::Installed(count))
    }

    /// Returns how many devices received triggers.
    pub fn add_report_trigger_everywhere(
        &self,
        min_queue_delay: u64,
        min_flow_size_in_queue: u64,
    ) -> Result<usize> {
        let mut devices = 0;
        for device in self.services.inventory.available_devices() {
            if let TriggerOutcome::Installed(_) =
                self.add_report_trigger(&device, min_queue_delay, min_flow_size_in_queue)?
            {
                devices += 1;
            }
        }
        Ok(devices)
    }

    pub fn remove_report_triggers(&self, device: &DeviceId) -> Result<usize> {
        let count = self
            .services
            .flow_rules
            .remove_by_table(&self.app, device, REPORT_TRIGGER_TABLE)?;
        info!(count, %device, "removed trigger rules from device");
        Ok(count)
    }

    pub fn remove_all_report_triggers(&self) -> Result<usize> {
        let mut count = 0;
        for entry in self.services.flow_rules.entries_by_app(&self.app) {
            if entry.rule.table == REPORT_TRIGGER_TABLE {
                self.services.flow_rules.remove(entry.id)?;
                count += 1;
            }
        }
        info!(count, "removed trigger rules from the network");
        Ok(count)
    }

    /// Removes every rule owned by the application, blocks included.
    /// Returns how many entries were removed.
    pub fn remove_all_entries(&self) -> Result<usize> {
        info!("clearing table entries installed by this app");
        let released = self.controller.release_blocks();
        let removed = self.services.flow_rules.remove_by_app(&self.app);
        let released = released?;
        Ok(released + removed?)
    }
}
