//! Layered configuration loaded with figment.
//!
//! Sources, highest priority first:
//! 1. Environment variables (`COPILOT_` prefix, `__` between sections),
//!    e.g. `COPILOT_PIPELINE__VERIFICATION_DELAY_SECS=60`
//! 2. `copilot.toml` in the working directory
//! 3. Built-in defaults

use crate::error::Result;
use crate::llm::LlmConfig;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const CONFIG_FILE: &str = "copilot.toml";
pub const ENV_PREFIX: &str = "COPILOT_";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CopilotConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub report: ReportConfig,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("incidents.db")
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".into()
}

impl Default for CopilotConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            listen_addr: default_listen_addr(),
            llm: LlmConfig::default(),
            chat: ChatConfig::default(),
            pipeline: PipelineConfig::default(),
            report: ReportConfig::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatConfig {
    pub temperature: f64,
    pub max_tokens: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            temperature: 0.5,
            max_tokens: 2048,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Delay before the critical-severity verification reminder.
    pub verification_delay_secs: u64,
    /// Attempts per step, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Skip the reminder when the incident is already resolved or monitoring.
    pub skip_verification_when_closed: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            verification_delay_secs: 300,
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            skip_verification_when_closed: true,
        }
    }
}

impl PipelineConfig {
    pub fn verification_delay(&self) -> Duration {
        Duration::from_secs(self.verification_delay_secs)
    }

    /// Exponential backoff before retry number `attempt` (1-based), capped at
    /// `max_delay_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Conversation entries fed to the executive summary prompt.
    pub history_entries: usize,
    /// Characters kept from each of those entries.
    pub entry_chars: usize,
    pub temperature: f64,
    pub max_tokens: u64,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            history_entries: 10,
            entry_chars: 200,
            temperature: 0.4,
            max_tokens: 1024,
        }
    }
}

impl CopilotConfig {
    pub fn load() -> Result<Self> {
        Self::from_figment(Self::figment())
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        Ok(figment.extract()?)
    }

    /// Provider chain used by [`CopilotConfig::load`]; public so callers can
    /// layer extra providers on top.
    pub fn figment() -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        let local = PathBuf::from(CONFIG_FILE);
        if local.exists() {
            figment = figment.merge(Toml::file(local));
        }

        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_match_documented_values() {
        let config = CopilotConfig::default();
        assert_eq!(config.chat.temperature, 0.5);
        assert_eq!(config.chat.max_tokens, 2048);
        assert_eq!(config.pipeline.verification_delay(), Duration::from_secs(300));
        assert_eq!(config.report.history_entries, 10);
        assert_eq!(config.llm.model, "gpt-4o-mini");
    }

    #[test]
    fn toml_and_env_layers_override_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                CONFIG_FILE,
                r#"
                database_path = "/var/lib/copilot/incidents.db"

                [pipeline]
                verification_delay_secs = 60
                "#,
            )?;
            jail.set_env("COPILOT_PIPELINE__MAX_ATTEMPTS", "5");
            jail.set_env("COPILOT_LLM__MODEL", "gpt-4o");

            let config = CopilotConfig::load().expect("load");
            assert_eq!(config.database_path, PathBuf::from("/var/lib/copilot/incidents.db"));
            assert_eq!(config.pipeline.verification_delay_secs, 60);
            assert_eq!(config.pipeline.max_attempts, 5);
            assert_eq!(config.pipeline.base_delay_ms, 500);
            assert_eq!(config.llm.model, "gpt-4o");
            Ok(())
        });
    }

    #[test]
    fn malformed_values_are_config_errors() {
        Jail::expect_with(|jail| {
            jail.set_env("COPILOT_CHAT__MAX_TOKENS", "lots");
            assert!(matches!(
                CopilotConfig::load(),
                Err(crate::error::IncidentError::Config(_))
            ));
            Ok(())
        });
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let pipeline = PipelineConfig::default();
        assert_eq!(pipeline.backoff(1), Duration::from_millis(500));
        assert_eq!(pipeline.backoff(2), Duration::from_millis(1_000));
        assert_eq!(pipeline.backoff(3), Duration::from_millis(2_000));
        assert_eq!(pipeline.backoff(10), Duration::from_millis(8_000));
    }
}
