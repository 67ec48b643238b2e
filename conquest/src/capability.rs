use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tracing::debug;

use crate::services::{DeviceId, PipelineConfigService};

pub const DEFAULT_PROGRAM_MARKER: &str = "conquest";

/// Remembers which devices run our data-plane program.
///
/// Answers are cached for the life of the process and never re-verified, so
/// a device reprogrammed at runtime keeps its first answer.
pub struct CapabilityCache {
    pipeconfs: Arc<dyn PipelineConfigService>,
    marker: String,
    answers: Mutex<HashMap<DeviceId, bool>>,
}

impl CapabilityCache {
    pub fn new(pipeconfs: Arc<dyn PipelineConfigService>, marker: impl Into<String>) -> Self {
        Self {
            pipeconfs,
            marker: marker.into(),
            answers: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_target_device(&self, device: &DeviceId) -> bool {
        let mut guard = self.answers.lock().expect("capability cache mutex poisoned");
        if let Some(answer) = guard.get(device) {
            return *answer;
        }
        let answer = self
            .pipeconfs
            .pipeconf_id(device)
            .is_some_and(|id| id.contains(&self.marker));
        debug!(%device, answer, "cached device capability");
        guard.insert(device.clone(), answer);
        answer
    }
}
