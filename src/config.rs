use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::classfile::descriptor::field_slots;
use crate::error::WeaveError;

pub const CONFIG_ENV: &str = "CREATION_CONFIG";
pub const APPLICATION_PLUGIN: &str = "com.android.application";

/// Everything the weaver needs to know about the runtime it targets.
///
/// Missing fields fall back to [`WeaverConfig::default`], so a config file
/// only has to name what it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeaverConfig {
    /// A disabled weaver copies every input through untouched.
    pub enable: bool,
    pub host_marker: String,
    pub module_marker: String,
    pub priority_attribute: String,
    pub default_priority: i32,
    pub dispatcher_class: String,
    pub dispatcher_accessor: String,
    pub provider_class: String,
    pub provider_interface: String,
    pub module_interface: String,
    pub provider_output_name: String,
    pub provider_class_version: u16,
    pub max_class_major_version: u16,
    /// Dotted package prefixes whose classes are never decoded.
    pub excluded_prefixes: Vec<String>,
    pub workers: Option<usize>,
    pub clean_timeout_secs: u64,
    pub scan_timeout_secs: u64,
    pub required_plugin: String,
}

impl Default for WeaverConfig {
    fn default() -> Self {
        Self {
            enable: false,
            host_marker: "Lwin/techflowing/android/runtime/annotation/AppApplication;".to_string(),
            module_marker: "Lwin/techflowing/android/runtime/annotation/ModuleApplication;"
                .to_string(),
            priority_attribute: "priority".to_string(),
            default_priority: 1000,
            dispatcher_class: "win/techflowing/android/runtime/ModuleApplicationContainer"
                .to_string(),
            dispatcher_accessor: "get".to_string(),
            provider_class: "win/techflowing/android/runtime/ModuleListProviderImpl".to_string(),
            provider_interface: "win/techflowing/android/runtime/IModuleListProvider".to_string(),
            module_interface: "win/techflowing/android/runtime/IModuleApplication".to_string(),
            provider_output_name: "creation-generate".to_string(),
            provider_class_version: 52,
            max_class_major_version: 69,
            excluded_prefixes: vec!["androidx.".to_string(), "android.".to_string()],
            workers: None,
            clean_timeout_secs: 60,
            scan_timeout_secs: 60,
            required_plugin: APPLICATION_PLUGIN.to_string(),
        }
    }
}

impl WeaverConfig {
    /// Reads a JSON config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Resolves the config: explicit path, then `CREATION_CONFIG`, then
    /// `<config dir>/creation/config.json`, then defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let config = match resolve_config_path(explicit) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), WeaveError> {
        for (key, descriptor) in [
            ("host_marker", &self.host_marker),
            ("module_marker", &self.module_marker),
        ] {
            let is_object = descriptor.starts_with('L') && descriptor.ends_with(';');
            if !is_object || field_slots(descriptor).is_err() {
                return Err(WeaveError::Configuration(format!(
                    "{key} is not an object type descriptor: {descriptor:?}"
                )));
            }
        }

        for (key, name) in [
            ("priority_attribute", &self.priority_attribute),
            ("dispatcher_class", &self.dispatcher_class),
            ("dispatcher_accessor", &self.dispatcher_accessor),
            ("provider_class", &self.provider_class),
            ("provider_interface", &self.provider_interface),
            ("module_interface", &self.module_interface),
            ("provider_output_name", &self.provider_output_name),
        ] {
            if name.trim().is_empty() {
                return Err(WeaveError::Configuration(format!("{key} must not be empty")));
            }
            if name.contains('.') && key != "provider_output_name" {
                return Err(WeaveError::Configuration(format!(
                    "{key} must use internal '/' separated names: {name:?}"
                )));
            }
        }

        if !(45..=self.max_class_major_version).contains(&self.provider_class_version) {
            return Err(WeaveError::Configuration(format!(
                "provider_class_version {} is outside 45..={}",
                self.provider_class_version, self.max_class_major_version
            )));
        }
        if self.workers == Some(0) {
            return Err(WeaveError::Configuration("workers must be at least 1".to_string()));
        }
        if self.clean_timeout_secs == 0 || self.scan_timeout_secs == 0 {
            return Err(WeaveError::Configuration("timeouts must be positive".to_string()));
        }
        Ok(())
    }

    pub fn dispatcher_descriptor(&self) -> String {
        format!("()L{};", self.dispatcher_class)
    }

    pub fn clean_timeout(&self) -> Duration {
        Duration::from_secs(self.clean_timeout_secs)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = explicit {
        return Some(p.to_path_buf());
    }

    if let Ok(p) = env::var(CONFIG_ENV)
        && !p.is_empty()
    {
        return Some(PathBuf::from(p));
    }

    let default_path = dirs::config_dir()?.join("creation").join("config.json");
    default_path.exists().then_some(default_path)
}
