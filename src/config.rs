//! Quota subsystem configuration
//!
//! The reconciliation window, the usage-snapshot cache TTL and the metering
//! timeouts jointly bound how far a bucket can be over-admitted, so all of
//! them are explicit settings rather than constants.
//!
//! ```toml
//! enabled = true
//! failure_mode = "open"
//! reconciliation_window_ms = 5000
//! flush_interval_ms = 1000
//!
//! [metering]
//! endpoint = "http://127.0.0.1:8100"
//! request_timeout_ms = 500
//! ```

use crate::error::{QuotaError, QuotaResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// What to do when the metering service cannot answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Admit the operation (availability over strict enforcement)
    #[default]
    Open,
    /// Deny the operation
    Closed,
}

/// Usage metering client settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeteringSettings {
    /// Base URL of the metering service
    pub endpoint: String,
    /// Timeout for a usage fetch
    pub request_timeout_ms: u64,
    /// Timeout for a health check
    pub health_timeout_ms: u64,
    /// Check health before fetching usage
    pub health_check: bool,
    /// How long a health check result is reused
    pub health_ttl_ms: u64,
    /// How long a usage snapshot may be served from cache (0 disables caching)
    pub snapshot_ttl_ms: u64,
    /// Maximum number of cached snapshots
    pub snapshot_cache_capacity: usize,
    /// Metrics reported older than this are treated as unavailable
    pub max_staleness_ms: u64,
}

impl Default for MeteringSettings {
    fn default() -> Self {
        MeteringSettings {
            endpoint: "http://127.0.0.1:8100".to_string(),
            request_timeout_ms: 500,
            health_timeout_ms: 200,
            health_check: true,
            health_ttl_ms: 1000,
            snapshot_ttl_ms: 0,
            snapshot_cache_capacity: 1024,
            max_staleness_ms: 24 * 60 * 60 * 1000,
        }
    }
}

impl MeteringSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn health_ttl(&self) -> Duration {
        Duration::from_millis(self.health_ttl_ms)
    }

    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_millis(self.snapshot_ttl_ms)
    }

    pub fn max_staleness(&self) -> Duration {
        Duration::from_millis(self.max_staleness_ms)
    }
}

/// Top-level quota settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaSettings {
    /// Global switch; when false every operation is admitted
    pub enabled: bool,
    /// Behaviour when metering is unavailable
    pub failure_mode: FailureMode,
    /// Age after commit at which a ledger entry is presumed confirmed
    pub reconciliation_window_ms: u64,
    /// Period of the reconciliation sweep
    pub flush_interval_ms: u64,
    /// Bound on the time between admission and commit/rollback
    pub operation_timeout_ms: u64,
    /// Access key allowed to send restore-completion writes. Unset means
    /// the restore marker is ignored on the S3 surface.
    pub restore_access_key: Option<String>,
    pub metering: MeteringSettings,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        QuotaSettings {
            enabled: true,
            failure_mode: FailureMode::Open,
            reconciliation_window_ms: 5000,
            flush_interval_ms: 1000,
            operation_timeout_ms: 30_000,
            restore_access_key: None,
            metering: MeteringSettings::default(),
        }
    }
}

impl QuotaSettings {
    /// Parse settings from a TOML document and validate them
    pub fn from_toml_str(text: &str) -> QuotaResult<Self> {
        let settings: QuotaSettings =
            toml::from_str(text).map_err(|e| QuotaError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a TOML file
    pub fn load(path: impl AsRef<Path>) -> QuotaResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| QuotaError::Config(format!("{}: {}", path.display(), e)))?;
        let settings = Self::from_toml_str(&text)?;
        info!("Loaded quota settings from {}", path.display());
        Ok(settings)
    }

    /// Check the settings for internal consistency
    pub fn validate(&self) -> QuotaResult<()> {
        if self.reconciliation_window_ms == 0 {
            return Err(QuotaError::Config(
                "reconciliation_window_ms must be greater than zero".to_string(),
            ));
        }
        if self.flush_interval_ms == 0 {
            return Err(QuotaError::Config(
                "flush_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.operation_timeout_ms == 0 {
            return Err(QuotaError::Config(
                "operation_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self
            .restore_access_key
            .as_deref()
            .is_some_and(|key| key.trim().is_empty())
        {
            return Err(QuotaError::Config(
                "restore_access_key cannot be empty".to_string(),
            ));
        }
        if self.metering.endpoint.trim().is_empty() {
            return Err(QuotaError::Config(
                "metering.endpoint cannot be empty".to_string(),
            ));
        }
        if self.metering.request_timeout_ms == 0 || self.metering.health_timeout_ms == 0 {
            return Err(QuotaError::Config(
                "metering timeouts must be greater than zero".to_string(),
            ));
        }
        // A cached snapshot must be refreshed before a flushed entry stops
        // being counted, otherwise the flushed bytes vanish from both sides.
        if self.metering.snapshot_ttl_ms >= self.reconciliation_window_ms {
            return Err(QuotaError::Config(format!(
                "metering.snapshot_ttl_ms ({}) must be smaller than reconciliation_window_ms ({})",
                self.metering.snapshot_ttl_ms, self.reconciliation_window_ms
            )));
        }
        if self.metering.snapshot_ttl_ms > 0 && self.metering.snapshot_cache_capacity == 0 {
            return Err(QuotaError::Config(
                "metering.snapshot_cache_capacity must be greater than zero when caching is enabled"
                    .to_string(),
            ));
        }
        Ok(())
    }

    pub fn reconciliation_window(&self) -> Duration {
        Duration::from_millis(self.reconciliation_window_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Age at which a never-resolved reservation is considered leaked
    pub fn max_pending_age(&self) -> Duration {
        self.operation_timeout() + self.reconciliation_window()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let settings = QuotaSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.failure_mode, FailureMode::Open);
        assert_eq!(settings.reconciliation_window(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let settings = QuotaSettings::from_toml_str(
            r#"
            reconciliation_window_ms = 2000

            [metering]
            endpoint = "http://metering:8100"
            "#,
        )
        .unwrap();

        assert_eq!(settings.reconciliation_window_ms, 2000);
        assert_eq!(settings.metering.endpoint, "http://metering:8100");
        assert_eq!(settings.metering.request_timeout_ms, 500);
        assert!(settings.enabled);
        assert_eq!(settings.restore_access_key, None);
    }

    #[test]
    fn test_restore_access_key() {
        let settings =
            QuotaSettings::from_toml_str(r#"restore_access_key = "cold-storage""#).unwrap();
        assert_eq!(settings.restore_access_key.as_deref(), Some("cold-storage"));

        assert!(QuotaSettings::from_toml_str(r#"restore_access_key = "  ""#).is_err());
    }

    #[test]
    fn test_failure_mode_parsing() {
        let settings = QuotaSettings::from_toml_str(r#"failure_mode = "closed""#).unwrap();
        assert_eq!(settings.failure_mode, FailureMode::Closed);

        assert!(QuotaSettings::from_toml_str(r#"failure_mode = "sideways""#).is_err());
    }

    #[test]
    fn test_rejects_snapshot_ttl_longer_than_window() {
        let err = QuotaSettings::from_toml_str(
            r#"
            reconciliation_window_ms = 1000

            [metering]
            snapshot_ttl_ms = 1000
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, QuotaError::Config(_)));
    }

    #[test]
    fn test_rejects_zero_bounds() {
        let mut settings = QuotaSettings::default();
        settings.reconciliation_window_ms = 0;
        assert!(settings.validate().is_err());

        let mut settings = QuotaSettings::default();
        settings.metering.request_timeout_ms = 0;
        assert!(settings.validate().is_err());

        let mut settings = QuotaSettings::default();
        settings.metering.endpoint = "  ".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "flush_interval_ms = 250").unwrap();
        writeln!(file, "[metering]").unwrap();
        writeln!(file, "health_check = false").unwrap();

        let settings = QuotaSettings::load(file.path()).unwrap();
        assert_eq!(settings.flush_interval(), Duration::from_millis(250));
        assert!(!settings.metering.health_check);
    }

    #[test]
    fn test_load_missing_file() {
        let err = QuotaSettings::load("/nonexistent/quota.toml").unwrap_err();
        assert!(matches!(err, QuotaError::Config(_)));
    }
}
