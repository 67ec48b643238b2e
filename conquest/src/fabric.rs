//! In-memory platform standing in for a controller's device, flow-rule,
//! group and policy services. Used by the node runner and by tests.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use tracing::debug;

use crate::{
    error::{ConquestError, Result},
    rules::{FlowRule, TrafficMatch},
    services::{
        AppId, CloneGroup, DeviceId, DeviceInventory, FlowEntry, FlowRuleService, GroupService,
        PipelineConfigService, PolicyId, PolicyService, RuleId, TrafficMatchId,
    },
};

#[derive(Default)]
struct FabricState {
    devices: BTreeMap<DeviceId, Option<String>>,
    rules: BTreeMap<RuleId, FlowRule>,
    groups: Vec<CloneGroup>,
    drop_policy: Option<PolicyId>,
    traffic_matches: HashMap<TrafficMatchId, TrafficMatch>,
    next_id: u64,
}

impl FabricState {
    fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct SimulatedFabric {
    state: Mutex<FabricState>,
    fail_installs: AtomicBool,
    fail_removals: AtomicBool,
    pipeconf_lookups: AtomicUsize,
}

impl SimulatedFabric {
    pub fn new<I>(devices: I) -> Self
    where
        I: IntoIterator<Item = (DeviceId, Option<String>)>,
    {
        let fabric = Self::default();
        {
            let mut state = fabric.state.lock().expect("fabric mutex poisoned");
            state.devices.extend(devices);
        }
        fabric
    }

    fn removal_failure(&self, what: &str) -> Option<ConquestError> {
        self.fail_removals
            .load(Ordering::Relaxed)
            .then(|| ConquestError::RuleRemovalFailure(format!("{what}: device unreachable")))
    }
}

#[cfg(test)]
impl SimulatedFabric {
    pub fn set_pipeconf(&self, device: &DeviceId, pipeconf: Option<String>) {
        let mut state = self.state.lock().expect("fabric mutex poisoned");
        state.devices.insert(device.clone(), pipeconf);
    }

    pub fn fail_installs(&self, fail: bool) {
        self.fail_installs.store(fail, Ordering::Relaxed);
    }

    pub fn fail_removals(&self, fail: bool) {
        self.fail_removals.store(fail, Ordering::Relaxed);
    }

    pub fn pipeconf_lookups(&self) -> usize {
        self.pipeconf_lookups.load(Ordering::Relaxed)
    }

    pub fn installed_rules(&self) -> Vec<FlowEntry> {
        let state = self.state.lock().expect("fabric mutex poisoned");
        state
            .rules
            .iter()
            .map(|(id, rule)| FlowEntry {
                id: *id,
                rule: rule.clone(),
            })
            .collect()
    }

    pub fn clone_groups(&self) -> Vec<CloneGroup> {
        let state = self.state.lock().expect("fabric mutex poisoned");
        state.groups.clone()
    }

    pub fn traffic_matches(&self) -> Vec<TrafficMatch> {
        let state = self.state.lock().expect("fabric mutex poisoned");
        state.traffic_matches.values().cloned().collect()
    }

    pub fn drop_policy(&self) -> Option<PolicyId> {
        let state = self.state.lock().expect("fabric mutex poisoned");
        state.drop_policy
    }
}

impl DeviceInventory for SimulatedFabric {
    fn available_devices(&self) -> Vec<DeviceId> {
        let state = self.state.lock().expect("fabric mutex poisoned");
        state.devices.keys().cloned().collect()
    }
}

impl PipelineConfigService for SimulatedFabric {
    fn pipeconf_id(&self, device: &DeviceId) -> Option<String> {
        self.pipeconf_lookups.fetch_add(1, Ordering::Relaxed);
        let state = self.state.lock().expect("fabric mutex poisoned");
        state.devices.get(device).cloned().flatten()
    }
}

impl FlowRuleService for SimulatedFabric {
    fn apply(&self, rule: FlowRule) -> Result<RuleId> {
        let mut state = self.state.lock().expect("fabric mutex poisoned");
        if self.fail_installs.load(Ordering::Relaxed) {
            return Err(ConquestError::RuleInstallFailure {
                device: rule.device,
                reason: "write rejected by device".to_string(),
            });
        }
        if !state.devices.contains_key(&rule.device) {
            return Err(ConquestError::RuleInstallFailure {
                device: rule.device,
                reason: "device not available".to_string(),
            });
        }
        let id = RuleId(state.allocate());
        debug!(rule = %rule, id = id.0, "applied flow rule");
        state.rules.insert(id, rule);
        Ok(id)
    }

    fn remove(&self, id: RuleId) -> Result<()> {
        if let Some(err) = self.removal_failure("flow rule") {
            return Err(err);
        }
        let mut state = self.state.lock().expect("fabric mutex poisoned");
        state.rules.remove(&id);
        Ok(())
    }

    fn remove_by_app(&self, app: &AppId) -> Result<usize> {
        if let Some(err) = self.removal_failure("flow rules") {
            return Err(err);
        }
        let mut state = self.state.lock().expect("fabric mutex poisoned");
        let before = state.rules.len();
        state.rules.retain(|_, rule| &rule.app != app);
        Ok(before - state.rules.len())
    }

    fn remove_by_table(&self, app: &AppId, device: &DeviceId, table: &str) -> Result<usize> {
        if let Some(err) = self.removal_failure("flow rules") {
            return Err(err);
        }
        let mut state = self.state.lock().expect("fabric mutex poisoned");
        let before = state.rules.len();
        state
            .rules
            .retain(|_, rule| !(&rule.app == app && &rule.device == device && rule.table == table));
        Ok(before - state.rules.len())
    }

    fn entries_by_app(&self, app: &AppId) -> Vec<FlowEntry> {
        let state = self.state.lock().expect("fabric mutex poisoned");
        state
            .rules
            .iter()
            .filter(|(_, rule)| &rule.app == app)
            .map(|(id, rule)| FlowEntry {
                id: *id,
                rule: rule.clone(),
            })
            .collect()
    }
}

impl GroupService for SimulatedFabric {
    fn add_clone_group(&self, group: CloneGroup) -> Result<()> {
        let mut state = self.state.lock().expect("fabric mutex poisoned");
        if !state.devices.contains_key(&group.device) {
            return Err(ConquestError::GroupFailure {
                device: group.device,
                reason: "device not available".to_string(),
            });
        }
        state
            .groups
            .retain(|g| !(g.device == group.device && g.session_id == group.session_id));
        debug!(device = %group.device, session_id = group.session_id, ports = ?group.ports, "added clone group");
        state.groups.push(group);
        Ok(())
    }

    fn groups(&self, device: &DeviceId, app: &AppId) -> Vec<CloneGroup> {
        let state = self.state.lock().expect("fabric mutex poisoned");
        state
            .groups
            .iter()
            .filter(|g| &g.device == device && &g.app == app)
            .cloned()
            .collect()
    }

    fn remove_group(&self, device: &DeviceId, session_id: u32, app: &AppId) -> Result<()> {
        if let Some(err) = self.removal_failure("clone session") {
            return Err(err);
        }
        let mut state = self.state.lock().expect("fabric mutex poisoned");
        state
            .groups
            .retain(|g| !(&g.device == device && g.session_id == session_id && &g.app == app));
        Ok(())
    }
}

impl PolicyService for SimulatedFabric {
    fn add_or_update_drop_policy(&self) -> Result<PolicyId> {
        let mut state = self.state.lock().expect("fabric mutex poisoned");
        if let Some(id) = state.drop_policy {
            return Ok(id);
        }
        let id = PolicyId(state.allocate());
        state.drop_policy = Some(id);
        Ok(id)
    }

    fn remove_policy(&self, id: PolicyId) -> Result<()> {
        if let Some(err) = self.removal_failure("policy") {
            return Err(err);
        }
        let mut state = self.state.lock().expect("fabric mutex poisoned");
        let bound = state
            .traffic_matches
            .values()
            .filter(|m| m.policy == id)
            .count();
        if bound > 0 {
            return Err(ConquestError::PolicyFailure(format!(
                "policy {} still has {bound} traffic matches",
                id.0
            )));
        }
        if state.drop_policy == Some(id) {
            state.drop_policy = None;
        }
        Ok(())
    }

    fn add_or_update_traffic_match(&self, traffic_match: TrafficMatch) -> Result<TrafficMatchId> {
        let mut state = self.state.lock().expect("fabric mutex poisoned");
        if self.fail_installs.load(Ordering::Relaxed) {
            return Err(ConquestError::PolicyFailure(
                "traffic match rejected".to_string(),
            ));
        }
        if state.drop_policy != Some(traffic_match.policy) {
            return Err(ConquestError::PolicyFailure(format!(
                "unknown policy {}",
                traffic_match.policy.0
            )));
        }
        if let Some((id, _)) = state
            .traffic_matches
            .iter()
            .find(|(_, existing)| **existing == traffic_match)
        {
            return Ok(*id);
        }
        let id = TrafficMatchId(state.allocate());
        state.traffic_matches.insert(id, traffic_match);
        Ok(id)
    }

    fn remove_traffic_match(&self, id: TrafficMatchId) -> Result<()> {
        if let Some(err) = self.removal_failure("traffic match") {
            return Err(err);
        }
        let mut state = self.state.lock().expect("fabric mutex poisoned");
        state.traffic_matches.remove(&id);
        Ok(())
    }
}
