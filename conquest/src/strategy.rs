use std::sync::{Arc, Mutex};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    error::{ConquestError, Result},
    model::CongestionReport,
    rules::{build_block_rule, build_traffic_match},
    services::{AppId, DeviceId, FlowRuleService, PolicyId, PolicyService, RuleId, TrafficMatchId},
};

/// How blocks are realised on the network, fixed for the life of a deployment.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BlockingMode {
    /// A drop rule in the ACL table of the reporting device.
    #[default]
    DeviceRules,
    /// A traffic match bound to a shared drop policy.
    Policy,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BlockHandle {
    Rule(RuleId),
    TrafficMatch(TrafficMatchId),
}

pub trait BlockStrategy: Send + Sync {
    /// Installs whatever shared state blocks depend on.
    fn prepare(&self) -> Result<()> {
        Ok(())
    }

    fn install(&self, device: &DeviceId, report: &CongestionReport) -> Result<BlockHandle>;

    fn remove(&self, handle: BlockHandle) -> Result<()>;

    fn teardown(&self) -> Result<()> {
        Ok(())
    }
}

pub fn strategy_for(
    mode: BlockingMode,
    app: AppId,
    flow_rules: Arc<dyn FlowRuleService>,
    policies: Arc<dyn PolicyService>,
) -> Box<dyn BlockStrategy> {
    match mode {
        BlockingMode::DeviceRules => Box::new(DeviceRuleStrategy::new(app, flow_rules)),
        BlockingMode::Policy => Box::new(PolicyStrategy::new(policies)),
    }
}

pub struct DeviceRuleStrategy {
    app: AppId,
    flow_rules: Arc<dyn FlowRuleService>,
}

impl DeviceRuleStrategy {
    pub fn new(app: AppId, flow_rules: Arc<dyn FlowRuleService>) -> Self {
        Self { app, flow_rules }
    }
}

impl BlockStrategy for DeviceRuleStrategy {
    fn install(&self, device: &DeviceId, report: &CongestionReport) -> Result<BlockHandle> {
        let rule = build_block_rule(&self.app, device, report);
        info!(%rule, "installing block rule");
        self.flow_rules.apply(rule).map(BlockHandle::Rule)
    }

    fn remove(&self, handle: BlockHandle) -> Result<()> {
        match handle {
            BlockHandle::Rule(id) => self.flow_rules.remove(id),
            BlockHandle::TrafficMatch(id) => Err(ConquestError::RuleRemovalFailure(format!(
                "traffic match {} is not managed by per-device blocking",
                id.0
            ))),
        }
    }
}

pub struct PolicyStrategy {
    policies: Arc<dyn PolicyService>,
    drop_policy: Mutex<Option<PolicyId>>,
}

impl PolicyStrategy {
    pub fn new(policies: Arc<dyn PolicyService>) -> Self {
        Self {
            policies,
            drop_policy: Mutex::new(None),
        }
    }

    fn drop_policy(&self) -> Result<PolicyId> {
        let mut guard = self.drop_policy.lock().expect("drop policy mutex poisoned");
        match *guard {
            Some(id) => Ok(id),
            None => {
                let id = self.policies.add_or_update_drop_policy()?;
                *guard = Some(id);
                Ok(id)
            }
        }
    }
}

impl BlockStrategy for PolicyStrategy {
    fn prepare(&self) -> Result<()> {
        self.drop_policy().map(|_| ())
    }

    // The policy service applies the match network-wide, so the reporting device is unused.
    fn install(&self, _device: &DeviceId, report: &CongestionReport) -> Result<BlockHandle> {
        let traffic_match = build_traffic_match(report, self.drop_policy()?);
        info!(selector = %traffic_match.selector, "installing traffic match");
        self.policies
            .add_or_update_traffic_match(traffic_match)
            .map(BlockHandle::TrafficMatch)
    }

    fn remove(&self, handle: BlockHandle) -> Result<()> {
        match handle {
            BlockHandle::TrafficMatch(id) => self.policies.remove_traffic_match(id),
            BlockHandle::Rule(id) => Err(ConquestError::RuleRemovalFailure(format!(
                "rule {} is not managed by policy blocking",
                id.0
            ))),
        }
    }

    fn teardown(&self) -> Result<()> {
        let mut guard = self.drop_policy.lock().expect("drop policy mutex poisoned");
        if let Some(id) = *guard {
            self.policies.remove_policy(id)?;
            *guard = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fabric::SimulatedFabric, model::FlowKey};
    use chrono::Local;
    use std::net::Ipv4Addr;

    fn report() -> CongestionReport {
        CongestionReport::new(
            FlowKey {
                src_addr: Ipv4Addr::new(10, 0, 0, 1),
                dst_addr: Ipv4Addr::new(10, 0, 0, 2),
                src_port: 1234,
                dst_port: 80,
                protocol: 6,
            },
            5000,
            Local::now(),
        )
    }

    fn fabric() -> (Arc<SimulatedFabric>, DeviceId) {
        let device = DeviceId::from("device:s1");
        let fabric = SimulatedFabric::new([(device.clone(), Some("conquest".to_string()))]);
        (Arc::new(fabric), device)
    }

    #[test]
    fn device_rules_install_and_remove_acl_entry() {
        let (fabric, device) = fabric();
        let strategy = strategy_for(
            BlockingMode::DeviceRules,
            AppId::new("ours"),
            fabric.clone(),
            fabric.clone(),
        );
        let handle = strategy.install(&device, &report()).unwrap();
        assert!(matches!(handle, BlockHandle::Rule(_)));
        assert_eq!(fabric.installed_rules().len(), 1);
        strategy.remove(handle).unwrap();
        assert!(fabric.installed_rules().is_empty());
    }

    #[test]
    fn policy_mode_binds_matches_to_one_drop_policy() {
        let (fabric, device) = fabric();
        let strategy = strategy_for(
            BlockingMode::Policy,
            AppId::new("ours"),
            fabric.clone(),
            fabric.clone(),
        );
        strategy.prepare().unwrap();
        let policy = fabric.drop_policy().unwrap();

        let handle = strategy.install(&device, &report()).unwrap();
        assert!(matches!(handle, BlockHandle::TrafficMatch(_)));
        assert_eq!(fabric.traffic_matches()[0].policy, policy);
        assert!(fabric.installed_rules().is_empty());

        strategy.remove(handle).unwrap();
        assert!(fabric.traffic_matches().is_empty());
        strategy.teardown().unwrap();
        strategy.teardown().unwrap();
        assert!(fabric.drop_policy().is_none());
    }
}
