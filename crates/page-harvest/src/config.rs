// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::time::Duration;

use crate::attributes::Attributes;
use crate::constants::MAX_BUCKETS;
use crate::errors::ConfigError;

const DEFAULT_MAX_LCP_TIME_SECONDS: u64 = 60;
const DEFAULT_INITIAL_HARVEST_SECONDS: u64 = 10;
const DEFAULT_HARVEST_SECONDS: u64 = 30;
const DEFAULT_TIMEOUT_SECONDS: u64 = 5;
const DEFAULT_ENDPOINT: &str = "https://bam.nr-data.net";

/// Configuration for the harvest pipeline
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    /// Disables the whole pipeline when false
    pub enabled: bool,
    /// Ceiling after which LCP is recorded even without user interaction
    pub max_lcp_time: Duration,
    /// Delay before the first harvest
    pub initial_harvest: Duration,
    /// Steady-state delay between harvests
    pub harvest_interval: Duration,
    /// Delay between first interaction and LCP finalization
    pub lcp_settle_window: Duration,
    /// Whether the environment reports layout shifts
    pub cls_supported: bool,
    /// Collector base URL
    pub endpoint: String,
    pub license_key: Option<String>,
    /// Host-wide attributes added to every timing sample
    pub custom_attributes: Attributes,
    /// Bucket bound per aggregation kind
    pub max_xhr_buckets: usize,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
    /// Per-request timeout for collector sends
    pub timeout: Duration,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_lcp_time: Duration::from_secs(DEFAULT_MAX_LCP_TIME_SECONDS),
            initial_harvest: Duration::from_secs(DEFAULT_INITIAL_HARVEST_SECONDS),
            harvest_interval: Duration::from_secs(DEFAULT_HARVEST_SECONDS),
            lcp_settle_window: Duration::ZERO,
            cls_supported: true,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            license_key: None,
            custom_attributes: Attributes::new(),
            max_xhr_buckets: MAX_BUCKETS,
            log_level: "info".to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECONDS),
        }
    }
}

/// Reads a positive integer; zero or garbage falls back to `default`.
fn positive_env(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|val| val.trim().parse::<u64>().ok())
        .filter(|val| *val > 0)
        .unwrap_or(default)
}

fn bool_env(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|val| val.to_lowercase() != "false")
        .unwrap_or(default)
}

impl HarvestConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            enabled: bool_env("HARVEST_ENABLED", defaults.enabled),
            max_lcp_time: Duration::from_secs(positive_env(
                "HARVEST_MAX_LCP_TIME_SECONDS",
                DEFAULT_MAX_LCP_TIME_SECONDS,
            )),
            initial_harvest: Duration::from_secs(positive_env(
                "HARVEST_INITIAL_SECONDS",
                DEFAULT_INITIAL_HARVEST_SECONDS,
            )),
            harvest_interval: Duration::from_secs(positive_env(
                "HARVEST_INTERVAL_SECONDS",
                DEFAULT_HARVEST_SECONDS,
            )),
            lcp_settle_window: Duration::from_millis(positive_env("HARVEST_LCP_SETTLE_MS", 0)),
            cls_supported: bool_env("HARVEST_CLS_SUPPORTED", defaults.cls_supported),
            endpoint: env::var("HARVEST_ENDPOINT").unwrap_or(defaults.endpoint),
            license_key: env::var("HARVEST_LICENSE_KEY").ok(),
            custom_attributes: env::var("HARVEST_CUSTOM_ATTRIBUTES")
                .map(|val| Attributes::from_env_string(&val))
                .unwrap_or_default(),
            max_xhr_buckets: usize::try_from(positive_env(
                "HARVEST_MAX_XHR_BUCKETS",
                MAX_BUCKETS as u64,
            ))
            .unwrap_or(MAX_BUCKETS),
            log_level: env::var("HARVEST_LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or(defaults.log_level),
            timeout: Duration::from_secs(positive_env(
                "HARVEST_TIMEOUT_SECONDS",
                DEFAULT_TIMEOUT_SECONDS,
            )),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "HARVEST_ENDPOINT cannot be empty".to_string(),
            ));
        }

        if self.harvest_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "harvest interval must be greater than 0".to_string(),
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }
}
