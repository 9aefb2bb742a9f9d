//! Configuration of the Boss
//!
//! Which modules to start, which to leave alone, how long to wait for them,
//! where the bus address lives and how the broker spawns services. The file
//! is JSON; every field has a default and a missing file means defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bus::address::DEFAULT_ADDRESS_FILE;
use crate::bus::names::{is_valid_bus_name, WILDCARD_SUFFIX};
use crate::constants::{
    ADDONS_NAMESPACE, DEFAULT_KICKSTART_SECTIONS, DEFAULT_START_TIMEOUT_SECS, MODULES_NAMESPACE,
};
use crate::modules::ModuleStartConfig;

/// How the broker starts one activatable service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    /// Well-known name the service claims
    pub name: String,
    /// Program to run
    pub exec: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BossConfig {
    /// Service names or `<namespace>.*` wildcards to start
    pub activatable: Vec<String>,
    /// Names or wildcards never to start
    pub forbidden: Vec<String>,
    /// Namespaces whose modules may fail to start
    pub optional: Vec<String>,
    pub start_timeout_secs: u64,
    pub address_file: PathBuf,
    /// Section names a kickstart may use besides addons
    pub kickstart_sections: Vec<String>,
    pub services: Vec<ServiceEntry>,
}

impl Default for BossConfig {
    fn default() -> Self {
        Self {
            activatable: vec![
                format!("{}{}", MODULES_NAMESPACE, WILDCARD_SUFFIX),
                format!("{}{}", ADDONS_NAMESPACE, WILDCARD_SUFFIX),
            ],
            forbidden: Vec::new(),
            optional: vec![ADDONS_NAMESPACE.to_string()],
            start_timeout_secs: DEFAULT_START_TIMEOUT_SECS,
            address_file: PathBuf::from(DEFAULT_ADDRESS_FILE),
            kickstart_sections: DEFAULT_KICKSTART_SECTIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            services: Vec::new(),
        }
    }
}

/// A name or a `<namespace>.*` wildcard with a valid namespace.
fn is_valid_pattern(pattern: &str) -> bool {
    let name = pattern.strip_suffix(WILDCARD_SUFFIX).unwrap_or(pattern);
    !name.contains('*') && is_valid_bus_name(name)
}

impl BossConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Load and validate `path`; a missing file gives the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = if path.as_ref().exists() {
            Self::load_from_file(&path)?
        } else {
            log::info!(
                "No configuration at {}, using defaults",
                path.as_ref().display()
            );
            Self::default()
        };
        config
            .validate()
            .with_context(|| format!("Invalid configuration in {:?}", path.as_ref()))?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize configuration to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        for (field, patterns) in [
            ("activatable", &self.activatable),
            ("forbidden", &self.forbidden),
        ] {
            for pattern in patterns {
                if pattern.trim().is_empty() {
                    anyhow::bail!("Empty name in {}", field);
                }
                if !is_valid_pattern(pattern) {
                    anyhow::bail!("Invalid name or wildcard {:?} in {}", pattern, field);
                }
            }
        }

        for namespace in &self.optional {
            let namespace = namespace.strip_suffix(WILDCARD_SUFFIX).unwrap_or(namespace);
            if !is_valid_bus_name(namespace) {
                anyhow::bail!("Invalid optional namespace {:?}", namespace);
            }
        }

        if self.start_timeout_secs == 0 {
            anyhow::bail!("Start timeout must be positive");
        }

        if self.kickstart_sections.iter().any(|s| s.trim().is_empty()) {
            anyhow::bail!("Empty kickstart section name");
        }

        let mut seen = HashSet::new();
        for service in &self.services {
            if !is_valid_bus_name(&service.name) {
                anyhow::bail!("Invalid service name {:?}", service.name);
            }
            if service.exec.as_os_str().is_empty() {
                anyhow::bail!("Service {} has no program", service.name);
            }
            if !seen.insert(service.name.as_str()) {
                anyhow::bail!("Service {} is listed twice", service.name);
            }
        }

        Ok(())
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    /// What [`crate::modules::StartModulesTask`] needs.
    pub fn module_start_config(&self) -> ModuleStartConfig {
        ModuleStartConfig {
            activatable: self.activatable.clone(),
            forbidden: self.forbidden.clone(),
            optional: self.optional.clone(),
            timeout: self.start_timeout(),
        }
    }
}
