//! Configuration for loopd.
//!
//! Two layers:
//! 1. Global config (explicit path, ~/.config/loopd/loopd.yml or ./loopd.yml)
//! 2. Per-loop definitions in YAML, passed to `loopd up --file`

use eyre::{Context, Result};
use std::fs;
use std::path::Path;

use crate::domain::LoopConfig;

pub use self::global::{DaemonSection, GlobalConfig, OwnershipSection, RunnerSection, StaleSection, StorageConfig};

mod global;

/// Load a loop definition from a YAML file and validate it.
pub fn load_loop_file(path: &Path) -> Result<LoopConfig> {
    let content = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let config: LoopConfig =
        serde_yaml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid loop definition in {}", path.display()))?;
    Ok(config)
}
