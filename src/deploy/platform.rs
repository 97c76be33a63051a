// src/deploy/platform.rs

//! Platform-specific bundle adjustments
//!
//! Devices, GPU libraries and similar host resources differ per platform.
//! Implementations are registered statically under the platform identifier
//! reported by the target.

use crate::error::{Error, Result};
use crate::exec::CommandRunner;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

const VERSION_FILE: &str = "/version.txt";

/// Adjusts a runtime configuration for one platform
pub trait PlatformCapability {
    /// Identifier this capability is registered under
    fn id(&self) -> &str;

    /// Add platform mounts, devices and environment to a bundle config
    fn update_bundle_config(&self, runner: &dyn CommandRunner, config: &mut Value) -> Result<()>;
}

/// Platform identifier to capability mapping
#[derive(Default)]
pub struct PlatformRegistry {
    capabilities: BTreeMap<String, Box<dyn PlatformCapability>>,
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability, replacing any previous one with the same id
    pub fn register(&mut self, capability: Box<dyn PlatformCapability>) {
        self.capabilities
            .insert(capability.id().to_string(), capability);
    }

    pub fn get(&self, id: &str) -> Result<&dyn PlatformCapability> {
        self.capabilities
            .get(id)
            .map(|capability| capability.as_ref())
            .ok_or_else(|| Error::UnsupportedPlatform(id.to_string()))
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.capabilities.keys().map(String::as_str)
    }
}

/// Platform identifier of the target
///
/// Image names in `/version.txt` look like `<image>-<platform>-<build>`; the
/// platform is the second-to-last dash-separated field of the first line.
/// `None` when the file is absent or has no such field.
pub fn detect_platform(runner: &dyn CommandRunner) -> Option<String> {
    let contents = runner.read_file(Path::new(VERSION_FILE)).ok()?;
    let first_line = contents.lines().next()?.trim();
    let fields: Vec<&str> = first_line.split('-').collect();
    if fields.len() < 2 {
        return None;
    }

    let platform = fields[fields.len() - 2];
    debug!("Detected platform {:?} from {}", platform, VERSION_FILE);
    (!platform.is_empty()).then(|| platform.to_string())
}
