use crate::callfiltering::screening::{ScreeningServiceInfo, BIND_SCREENING_SERVICE_PERMISSION};
use anyhow::Context;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_CALL_SCREENING_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_timeout_ms")]
    pub call_screening_timeout_ms: u64,
    #[serde(default)]
    pub block_list: BlockListConfig,
    #[serde(default)]
    pub voicemail: VoicemailConfig,
    #[serde(default)]
    pub screening: ScreeningConfig,
    pub statistics: Option<StatisticsConfig>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockListConfig {
    #[serde(default)]
    pub numbers: Vec<String>,
    #[serde(default)]
    pub patterns: Vec<String>, // Regexes over the normalized number
    #[serde(default)]
    pub emergency_suppression_seconds: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VoicemailConfig {
    #[serde(default)]
    pub numbers: Vec<String>,
    #[serde(default)]
    pub lookup_delay_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScreeningConfig {
    pub default_dialer: Option<String>,
    #[serde(default)]
    pub services: Vec<ScreeningServiceInfo>,
    #[serde(default)]
    pub reject_patterns: Vec<String>,
    #[serde(default)]
    pub response_delay_ms: u64,
    #[serde(default)]
    pub drop_connection: bool, // Provider disconnects instead of answering
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticsConfig {
    pub enabled: bool,
    pub path: String,
    pub flush_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

/// Source of the filtering timeout, consulted once per filtering session.
pub trait Timeouts: Send + Sync {
    fn call_screening_timeout(&self) -> Duration;
}

fn default_timeout_ms() -> u64 {
    DEFAULT_CALL_SCREENING_TIMEOUT_MS
}

impl Default for Config {
    fn default() -> Self {
        Config {
            call_screening_timeout_ms: DEFAULT_CALL_SCREENING_TIMEOUT_MS,
            block_list: BlockListConfig {
                numbers: vec!["+15555550100".to_string()],
                patterns: vec![r"^\+1900".to_string()],
                emergency_suppression_seconds: 48 * 60 * 60,
            },
            voicemail: VoicemailConfig {
                numbers: vec!["+15555550199".to_string()],
                lookup_delay_ms: 0,
            },
            screening: ScreeningConfig {
                default_dialer: Some("com.example.dialer".to_string()),
                services: vec![ScreeningServiceInfo {
                    package: "com.example.dialer".to_string(),
                    component: "com.example.dialer/.CallScreener".to_string(),
                    permission: Some(BIND_SCREENING_SERVICE_PERMISSION.to_string()),
                }],
                reject_patterns: vec![r"^\+1555555".to_string()],
                response_delay_ms: 50,
                drop_connection: false,
            },
            statistics: Some(StatisticsConfig {
                enabled: true,
                path: "/var/lib/call-filter/stats.json".to_string(),
                flush_interval_seconds: Some(60),
            }),
            logging: Some(LoggingConfig {
                level: "info".to_string(),
            }),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file: {path}"))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse configuration file: {path}"))?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write configuration file: {path}"))?;
        Ok(())
    }

    /// Check every regex in the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        for pattern in self
            .block_list
            .patterns
            .iter()
            .chain(self.screening.reject_patterns.iter())
        {
            Regex::new(pattern).with_context(|| format!("Invalid pattern: {pattern}"))?;
        }
        if self.call_screening_timeout_ms == 0 {
            anyhow::bail!("call_screening_timeout_ms must be greater than zero");
        }
        Ok(())
    }
}

impl Timeouts for Config {
    fn call_screening_timeout(&self) -> Duration {
        Duration::from_millis(self.call_screening_timeout_ms)
    }
}
