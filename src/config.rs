//! Configuration management
//!
//! Invocation timeouts, pool caps, escalation rules and event history size.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::types::{JoinType, Severity};

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub escalation: EscalationConfig,
    #[serde(default)]
    pub events: EventsConfig,
}

/// Pipeline execution settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Per-invocation timeout
    #[serde(default = "default_invocation_timeout")]
    pub invocation_timeout_secs: u64,
    #[serde(default = "default_max_schema_agents")]
    pub max_schema_agents: usize,
    #[serde(default = "default_max_merge_agents")]
    pub max_merge_agents: usize,
    /// Join used when a request does not name one
    #[serde(default)]
    pub default_join_type: JoinType,
}

fn default_invocation_timeout() -> u64 {
    300
}

fn default_max_schema_agents() -> usize {
    3
}

fn default_max_merge_agents() -> usize {
    10
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            invocation_timeout_secs: default_invocation_timeout(),
            max_schema_agents: default_max_schema_agents(),
            max_merge_agents: default_max_merge_agents(),
            default_join_type: JoinType::default(),
        }
    }
}

/// When a mapping set needs human approval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationConfig {
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_escalate_severities")]
    pub escalate_severities: Vec<Severity>,
    /// Issue tracker project for escalation tickets
    #[serde(default = "default_ticket_project_key")]
    pub ticket_project_key: String,
}

fn default_confidence_threshold() -> f64 {
    0.70
}

fn default_escalate_severities() -> Vec<Severity> {
    vec![Severity::Critical, Severity::High]
}

fn default_ticket_project_key() -> String {
    "DI".to_string()
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            escalate_severities: default_escalate_severities(),
            ticket_project_key: default_ticket_project_key(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Events kept for `history`
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_history_limit() -> usize {
    1000
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
        }
    }
}

impl Config {
    /// Load configuration from the default location, writing defaults on first use
    pub fn load() -> Result<Self> {
        let config_path = config_path()?;

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
        let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Reject settings the orchestrator cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.orchestrator.invocation_timeout_secs == 0 {
            anyhow::bail!("orchestrator.invocation_timeout_secs must be positive");
        }
        if self.orchestrator.max_schema_agents == 0 || self.orchestrator.max_merge_agents == 0 {
            anyhow::bail!("pool caps must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.escalation.confidence_threshold) {
            anyhow::bail!(
                "escalation.confidence_threshold must be within 0..=1, got {}",
                self.escalation.confidence_threshold
            );
        }
        Ok(())
    }
}

/// Get the configuration file path
pub fn config_path() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "data-integrator", "data-integrator")
        .context("Failed to get project directories")?;
    Ok(base.config_dir().join("config.toml"))
}

/// Show current configuration
pub fn show_config() -> Result<()> {
    let config = Config::load()?;

    println!("Configuration ({})", config_path()?.display());
    println!();
    println!("[orchestrator]");
    println!("  invocation timeout   {}s", config.orchestrator.invocation_timeout_secs);
    println!("  max schema agents    {}", config.orchestrator.max_schema_agents);
    println!("  max merge agents     {}", config.orchestrator.max_merge_agents);
    println!("  default join type    {}", config.orchestrator.default_join_type);
    println!("[escalation]");
    println!("  confidence threshold {:.2}", config.escalation.confidence_threshold);
    println!(
        "  escalate severities  {}",
        config
            .escalation
            .escalate_severities
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("  ticket project       {}", config.escalation.ticket_project_key);
    println!("[events]");
    println!("  history limit        {}", config.events.history_limit);

    Ok(())
}

/// Reset configuration to defaults
pub fn reset_config() -> Result<()> {
    Config::default().save()?;
    println!("Configuration reset to defaults.");
    Ok(())
}
