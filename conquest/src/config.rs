use std::{fs, path::Path};

use anyhow::{Context, Result};
use conquest_common::DEFAULT_QUEUE_WIDTH;
use serde::{Deserialize, Serialize};

use crate::{
    capability::DEFAULT_PROGRAM_MARKER, controller::DEFAULT_BLOCK_DURATION_MS,
    strategy::BlockingMode,
};

fn default_block_duration_ms() -> i64 {
    DEFAULT_BLOCK_DURATION_MS
}

fn default_queue_width() -> u8 {
    DEFAULT_QUEUE_WIDTH
}

fn default_program_marker() -> String {
    DEFAULT_PROGRAM_MARKER.to_string()
}

fn default_packet_workers() -> usize {
    1
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    /// Program identifier installed on the device, if any.
    #[serde(default)]
    pub pipeconf: Option<String>,
}

/// Node configuration loaded from a JSON file.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// 0 disables blocking, negative values block permanently.
    #[serde(default = "default_block_duration_ms")]
    pub block_duration_ms: i64,
    #[serde(default)]
    pub blocking_mode: BlockingMode,
    #[serde(default = "default_queue_width")]
    pub queue_width_bytes: u8,
    #[serde(default = "default_program_marker")]
    pub program_marker: String,
    #[serde(default = "default_packet_workers")]
    pub packet_workers: usize,
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            block_duration_ms: default_block_duration_ms(),
            blocking_mode: BlockingMode::default(),
            queue_width_bytes: default_queue_width(),
            program_marker: default_program_marker(),
            packet_workers: default_packet_workers(),
            whitelist: Vec::new(),
            devices: Vec::new(),
        }
    }
}

impl NodeConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn from_option(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }
}
