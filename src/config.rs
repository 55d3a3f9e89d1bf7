//! Configuration management for stagehand.
//!
//! This module defines the structure of the `stagehand.toml` configuration
//! file and provides functionality to load, parse, and validate it.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::service::ServiceSpec;

/// Top-level configuration structure corresponding to `stagehand.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Global settings.
    #[serde(default)]
    pub settings: Settings,
    /// List of services to manage.
    #[serde(rename = "service", default)]
    pub services: Vec<ServiceConfig>,
}

/// Global settings from the `[settings]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Directory holding one working copy per service, relative to the
    /// config file unless absolute.
    #[serde(default = "default_services_dir")]
    pub services_dir: String,
    /// Seconds between backup sweeps.
    #[serde(default = "default_backup_interval")]
    pub backup_interval_secs: u64,
    /// Whether the backup agent pushes the backup branch to origin.
    #[serde(default)]
    pub backup_push: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            services_dir: default_services_dir(),
            backup_interval_secs: default_backup_interval(),
            backup_push: false,
        }
    }
}

/// Configuration for a single service.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Unique service name.
    pub name: String,
    /// Git repository URL or GitHub `owner/repo` shorthand.
    pub repo: String,
    /// Branch to track (default: "main").
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Command that starts the service.
    #[serde(default)]
    pub start_command: String,
    /// URL to probe for HTTP health.
    pub url: Option<String>,
    /// Whether to snapshot uncommitted changes to the backup branch
    /// (default: true).
    #[serde(default = "default_backup")]
    pub backup: bool,
}

fn default_services_dir() -> String {
    "services".to_string()
}

fn default_backup_interval() -> u64 {
    300
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_backup() -> bool {
    true
}

impl ServiceConfig {
    pub fn to_spec(&self) -> ServiceSpec {
        ServiceSpec {
            name: self.name.clone(),
            repo: self.repo.clone(),
            branch: self.branch.clone(),
            start_command: self.start_command.clone(),
            url: self.url.clone(),
            backup: self.backup,
        }
    }
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    validate(&config)?;
    Ok(config)
}

/// Rejects duplicate names and services that cannot be started.
fn validate(config: &Config) -> Result<()> {
    let mut seen = HashSet::new();
    for service in &config.services {
        if service.name.trim().is_empty() {
            bail!("service with empty name");
        }
        if !seen.insert(service.name.as_str()) {
            bail!("duplicate service name: {}", service.name);
        }
        if service.start_command.trim().is_empty() {
            bail!("service {} has no start_command", service.name);
        }
    }
    Ok(())
}
