//! Interfaces of the network platform this application runs against.
//!
//! All calls are synchronous: they either complete or fail before returning.

use std::{fmt, sync::Arc};

use crate::{
    error::Result,
    rules::{FlowRule, TrafficMatch},
};

#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity used to tag, enumerate and purge everything this application installs.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct AppId(String);

impl AppId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct RuleId(pub u64);

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct PolicyId(pub u64);

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct TrafficMatchId(pub u64);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OutputPort {
    Controller,
}

/// Clone (mirror) session duplicating matching packets to `ports`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CloneGroup {
    pub device: DeviceId,
    pub app: AppId,
    pub session_id: u32,
    pub ports: Vec<OutputPort>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FlowEntry {
    pub id: RuleId,
    pub rule: FlowRule,
}

pub trait DeviceInventory: Send + Sync {
    fn available_devices(&self) -> Vec<DeviceId>;

    fn contains(&self, device: &DeviceId) -> bool {
        self.available_devices().iter().any(|d| d == device)
    }
}

pub trait PipelineConfigService: Send + Sync {
    /// Program identifier installed on the device, if any.
    fn pipeconf_id(&self, device: &DeviceId) -> Option<String>;
}

pub trait FlowRuleService: Send + Sync {
    fn apply(&self, rule: FlowRule) -> Result<RuleId>;
    /// Removing an unknown rule succeeds.
    fn remove(&self, id: RuleId) -> Result<()>;
    fn remove_by_app(&self, app: &AppId) -> Result<usize>;
    fn remove_by_table(&self, app: &AppId, device: &DeviceId, table: &str) -> Result<usize>;
    fn entries_by_app(&self, app: &AppId) -> Vec<FlowEntry>;
}

pub trait GroupService: Send + Sync {
    fn add_clone_group(&self, group: CloneGroup) -> Result<()>;
    fn groups(&self, device: &DeviceId, app: &AppId) -> Vec<CloneGroup>;
    fn remove_group(&self, device: &DeviceId, session_id: u32, app: &AppId) -> Result<()>;
}

pub trait PolicyService: Send + Sync {
    fn add_or_update_drop_policy(&self) -> Result<PolicyId>;
    fn remove_policy(&self, id: PolicyId) -> Result<()>;
    fn add_or_update_traffic_match(&self, traffic_match: TrafficMatch) -> Result<TrafficMatchId>;
    fn remove_traffic_match(&self, id: TrafficMatchId) -> Result<()>;
}

/// Handles to every platform service the application consumes.
#[derive(Clone)]
pub struct Services {
    pub inventory: Arc<dyn DeviceInventory>,
    pub pipeconfs: Arc<dyn PipelineConfigService>,
    pub flow_rules: Arc<dyn FlowRuleService>,
    pub groups: Arc<dyn GroupService>,
    pub policies: Arc<dyn PolicyService>,
}

impl Services {
    pub fn from_platform<P>(platform: Arc<P>) -> Self
    where
        P: DeviceInventory
            + PipelineConfigService
            + FlowRuleService
            + GroupService
            + PolicyService
            + 'static,
    {
        Self {
            inventory: platform.clone(),
            pipeconfs: platform.clone(),
            flow_rules: platform.clone(),
            groups: platform.clone(),
            policies: platform,
        }
    }
}
