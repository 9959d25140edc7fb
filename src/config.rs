//! Run configuration
//!
//! [`DetectorConfig`] is built once at process start (from JSON, the process
//! environment, or code) and passed by reference into every component. Nothing
//! below this module reads the environment.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::DetectorError;
use crate::types::Vendor;

/// Default training window in days
pub const DEFAULT_TRAINING_WINDOW_DAYS: u32 = 90;
/// Smallest training window accepted
pub const MIN_TRAINING_WINDOW_DAYS: u32 = 7;
/// Default expected anomaly fraction
pub const DEFAULT_CONTAMINATION: f64 = 0.05;

/// Vendor account credentials. Which fields are required depends on the vendor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

impl Credentials {
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..Default::default()
        }
    }

    pub fn with_login(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
            token: None,
        }
    }

    /// Copy with secrets replaced, for display
    pub fn redacted(&self) -> Self {
        let mask = |v: &Option<String>| v.as_ref().map(|_| "***".to_string());
        Self {
            username: self.username.clone(),
            password: mask(&self.password),
            token: mask(&self.token),
        }
    }
}

/// Isolation forest hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Expected fraction of anomalous days, in (0, 0.5]
    pub contamination: f64,
    pub n_estimators: usize,
    pub seed: u64,
    /// Fewer training rows than this fails the device run
    pub min_training_rows: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            contamination: DEFAULT_CONTAMINATION,
            n_estimators: 256,
            seed: 42,
            min_training_rows: 20,
        }
    }
}

/// Gap and outlier handling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    /// Largest tolerated share of missing training days
    pub max_missing_fraction: f64,
    pub clip_low_percentile: f64,
    pub clip_high_percentile: f64,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            max_missing_fraction: 0.5,
            clip_low_percentile: 1.0,
            clip_high_percentile: 99.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Lifetime of today's entries; past days never expire
    pub ttl_hours: u64,
    pub dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_hours: 1,
            dir: PathBuf::from("./cache"),
        }
    }
}

impl CacheConfig {
    pub fn ttl_seconds(&self) -> u64 {
        self.ttl_hours.saturating_mul(3600)
    }
}

/// Upstream fetch behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Attempts per date for transient failures, including the first
    pub max_attempts: u32,
    /// Backoff before the first retry; doubles on each further retry
    pub retry_backoff_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff_ms: 500,
            request_timeout_secs: 30,
        }
    }
}

/// Push alerting for anomalous latest days
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub enabled: bool,
    pub pushover_token: Option<String>,
    pub pushover_user: Option<String>,
}

/// Natural-language explanation of anomalous latest days
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplainerConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for ExplainerConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "o3".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            timeout_secs: 60,
        }
    }
}

/// Complete, immutable configuration of a detection run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub vendor: Vendor,
    pub credentials: Credentials,
    /// Explicit device ids; empty means auto-discover
    pub device_ids: Vec<String>,
    pub training_window_days: u32,
    pub model: ModelConfig,
    pub preprocess: PreprocessConfig,
    pub cache: CacheConfig,
    pub fetch: FetchConfig,
    /// Date to mark anomalous regardless of score
    pub force_outlier_date: Option<NaiveDate>,
    /// Devices processed concurrently; 1 runs them sequentially
    pub parallelism: usize,
    pub alert: AlertConfig,
    pub explainer: Option<ExplainerConfig>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            vendor: Vendor::default(),
            credentials: Credentials::default(),
            device_ids: Vec::new(),
            training_window_days: DEFAULT_TRAINING_WINDOW_DAYS,
            model: ModelConfig::default(),
            preprocess: PreprocessConfig::default(),
            cache: CacheConfig::default(),
            fetch: FetchConfig::default(),
            force_outlier_date: None,
            parallelism: 1,
            alert: AlertConfig::default(),
            explainer: None,
        }
    }
}

impl DetectorConfig {
    /// Check value ranges; returns the first violation
    pub fn validate(&self) -> Result<(), DetectorError> {
        let c = self.model.contamination;
        if !(c > 0.0 && c <= 0.5) {
            return Err(DetectorError::Configuration(format!(
                "contamination must be in (0, 0.5], got {c}"
            )));
        }
        if self.training_window_days < MIN_TRAINING_WINDOW_DAYS {
            return Err(DetectorError::Configuration(format!(
                "training window must be at least {MIN_TRAINING_WINDOW_DAYS} days, got {}",
                self.training_window_days
            )));
        }
        if self.model.n_estimators == 0 {
            return Err(DetectorError::Configuration(
                "n_estimators must be positive".to_string(),
            ));
        }
        if self.model.min_training_rows < 2 {
            return Err(DetectorError::Configuration(
                "min_training_rows must be at least 2".to_string(),
            ));
        }
        if self.model.min_training_rows > self.training_window_days as usize {
            return Err(DetectorError::Configuration(format!(
                "min_training_rows ({}) exceeds the {}-day training window",
                self.model.min_training_rows, self.training_window_days
            )));
        }
        let p = &self.preprocess;
        if !(0.0..=1.0).contains(&p.max_missing_fraction) {
            return Err(DetectorError::Configuration(format!(
                "max_missing_fraction must be in [0, 1], got {}",
                p.max_missing_fraction
            )));
        }
        if !(0.0 <= p.clip_low_percentile
            && p.clip_low_percentile < p.clip_high_percentile
            && p.clip_high_percentile <= 100.0)
        {
            return Err(DetectorError::Configuration(format!(
                "clip percentiles must satisfy 0 <= low < high <= 100, got {} / {}",
                p.clip_low_percentile, p.clip_high_percentile
            )));
        }
        if self.fetch.max_attempts == 0 {
            return Err(DetectorError::Configuration(
                "fetch.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.parallelism == 0 {
            return Err(DetectorError::Configuration(
                "parallelism must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> Result<Self, DetectorError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, DetectorError> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            DetectorError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&json)
    }

    /// Build from the process environment
    pub fn from_env() -> Result<Self, DetectorError> {
        Self::from_env_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup, starting from defaults.
    ///
    /// Unset or empty variables keep the default value.
    pub fn from_env_lookup<F>(lookup: F) -> Result<Self, DetectorError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(tracker) = get("SLEEP_TRACKER") {
            config.vendor = tracker.parse()?;
        }
        let prefix = config.vendor.env_prefix();
        let scoped = |name: &str| get(&format!("{prefix}_{name}"));

        config.credentials = Credentials {
            username: scoped("USERNAME"),
            password: scoped("PASSWORD"),
            token: scoped("TOKEN").or_else(|| scoped("API_TOKEN")),
        };

        if let Some(list) = scoped("DEVICE_IDS") {
            config.device_ids = list
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect();
        } else if let Some(single) = scoped("DEVICE_ID") {
            config.device_ids = vec![single.trim().to_string()];
        }

        if let Some(v) = get("IFOREST_CONTAM") {
            config.model.contamination = parse_var("IFOREST_CONTAM", &v)?;
        }
        if let Some(v) = get("IFOREST_TRAIN_WINDOW") {
            config.training_window_days = parse_var("IFOREST_TRAIN_WINDOW", &v)?;
        }
        if let Some(v) = get("EMFIT_CACHE_DIR") {
            config.cache.dir = PathBuf::from(v);
        }
        if let Some(v) = get("EMFIT_CACHE_ENABLED") {
            config.cache.enabled = v.trim().eq_ignore_ascii_case("true");
        }
        if let Some(v) = get("EMFIT_CACHE_TTL_HOURS") {
            config.cache.ttl_hours = parse_var("EMFIT_CACHE_TTL_HOURS", &v)?;
        }

        config.alert.pushover_token = get("PUSHOVER_APIKEY");
        config.alert.pushover_user = get("PUSHOVER_USERKEY");

        if let Some(api_key) = get("OPENAI_API_KEY") {
            config.explainer = Some(ExplainerConfig {
                api_key,
                ..Default::default()
            });
        }

        config.validate()?;
        Ok(config)
    }

    /// Copy with credentials and API keys masked
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.credentials = self.credentials.redacted();
        let mask = |v: &Option<String>| v.as_ref().map(|_| "***".to_string());
        copy.alert.pushover_token = mask(&self.alert.pushover_token);
        copy.alert.pushover_user = mask(&self.alert.pushover_user);
        if let Some(explainer) = copy.explainer.as_mut() {
            explainer.api_key = "***".to_string();
        }
        copy
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, DetectorError> {
    value.trim().parse().map_err(|_| {
        DetectorError::Configuration(format!("invalid value for '{key}': {value}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = DetectorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.training_window_days, 90);
        assert_eq!(config.model.contamination, 0.05);
        assert_eq!(config.cache.ttl_seconds(), 3600);
    }

    #[test]
    fn test_contamination_out_of_range_rejected() {
        let mut config = DetectorConfig::default();
        config.model.contamination = 0.0;
        assert!(matches!(
            config.validate(),
            Err(DetectorError::Configuration(_))
        ));
        config.model.contamination = 0.7;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_short_window_rejected() {
        let mut config = DetectorConfig::default();
        config.training_window_days = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_window_shorter_than_min_rows_rejected() {
        let mut config = DetectorConfig::default();
        config.training_window_days = 10;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, DetectorError::Configuration(_)));
        assert!(err.to_string().contains("min_training_rows (20)"));

        config.model.min_training_rows = 10;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_lookup_reads_vendor_scoped_variables() {
        let config = DetectorConfig::from_env_lookup(lookup(&[
            ("SLEEP_TRACKER", "oura"),
            ("OURA_API_TOKEN", "tok"),
            ("OURA_DEVICE_IDS", "ring-1, ring-2,,"),
            ("IFOREST_CONTAM", "0.1"),
            ("IFOREST_TRAIN_WINDOW", "30"),
            ("EMFIT_CACHE_ENABLED", "false"),
            ("EMFIT_CACHE_TTL_HOURS", "6"),
        ]))
        .unwrap();

        assert_eq!(config.vendor, Vendor::Oura);
        assert_eq!(config.credentials.token.as_deref(), Some("tok"));
        assert_eq!(config.device_ids, vec!["ring-1", "ring-2"]);
        assert_eq!(config.model.contamination, 0.1);
        assert_eq!(config.training_window_days, 30);
        assert!(!config.cache.enabled);
        assert_eq!(config.cache.ttl_hours, 6);
        assert!(config.explainer.is_none());
    }

    #[test]
    fn test_env_lookup_single_device_and_bad_number() {
        let config =
            DetectorConfig::from_env_lookup(lookup(&[("EMFIT_DEVICE_ID", "4242")])).unwrap();
        assert_eq!(config.vendor, Vendor::Emfit);
        assert_eq!(config.device_ids, vec!["4242"]);

        let err = DetectorConfig::from_env_lookup(lookup(&[("IFOREST_CONTAM", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("IFOREST_CONTAM"));
    }

    #[test]
    fn test_json_partial_config_uses_defaults() {
        let config = DetectorConfig::from_json_str(
            r#"{
                "vendor": "eight",
                "device_ids": ["pod-1"],
                "model": { "contamination": 0.1 },
                "force_outlier_date": "2024-02-03"
            }"#,
        )
        .unwrap();

        assert_eq!(config.vendor, Vendor::Eight);
        assert_eq!(config.model.contamination, 0.1);
        assert_eq!(config.model.n_estimators, 256);
        assert_eq!(config.training_window_days, 90);
        assert_eq!(
            config.force_outlier_date,
            NaiveDate::from_ymd_opt(2024, 2, 3)
        );
    }

    #[test]
    fn test_redacted_masks_secrets() {
        let mut config = DetectorConfig::default();
        config.credentials = Credentials::with_login("me@example.com", "hunter2");
        config.alert.pushover_token = Some("abc".into());
        let redacted = config.redacted();
        assert_eq!(redacted.credentials.username.as_deref(), Some("me@example.com"));
        assert_eq!(redacted.credentials.password.as_deref(), Some("***"));
        assert_eq!(redacted.alert.pushover_token.as_deref(), Some("***"));
    }
}
