//! Daemon configuration.

use std::path::Path;
use std::time::Duration;

use kestrel_hypervisor::{CellError, Result};
use serde::{Deserialize, Serialize};

/// Ceiling a single module operation may take before it is considered
/// failed; scheduler tasks are exempt.
pub const DEFAULT_OPERATE_TIMEOUT_SECS: u64 = 10;

/// The cell's domain configuration file (JSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    pub domain: String,
    pub group_address: String,
    pub group_port: u16,
    /// Operate timeout in seconds; zero falls back to the default.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub timeout: u64,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            domain: "kestrel".to_string(),
            group_address: "224.0.0.226".to_string(),
            group_port: 5599,
            timeout: DEFAULT_OPERATE_TIMEOUT_SECS,
        }
    }
}

impl DomainConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| CellError::Internal(format!("read config {}: {e}", path.display())))?;
        serde_json::from_str(&data)
            .map_err(|e| CellError::Internal(format!("parse config {}: {e}", path.display())))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self)
            .map_err(|e| CellError::Internal(format!("encode config: {e}")))?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Load the config, generating the default file when absent.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let config = Self::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn operate_timeout(&self) -> Duration {
        let seconds = if self.timeout == 0 {
            DEFAULT_OPERATE_TIMEOUT_SECS
        } else {
            self.timeout
        };
        Duration::from_secs(seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_round_trips_through_json() {
        let config = DomainConfig {
            domain: "prod".to_string(),
            group_address: "224.0.0.1".to_string(),
            group_port: 5801,
            timeout: 30,
        };
        let encoded = serde_json::to_string(&config).unwrap();
        let decoded: DomainConfig = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.domain, "prod");
        assert_eq!(decoded.operate_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn zero_timeout_falls_back_to_default() {
        let decoded: DomainConfig = serde_json::from_str(
            r#"{"domain":"d","group_address":"224.0.0.2","group_port":5599}"#,
        )
        .unwrap();
        assert_eq!(
            decoded.operate_timeout(),
            Duration::from_secs(DEFAULT_OPERATE_TIMEOUT_SECS)
        );
    }

    #[test]
    fn generates_default_file_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config").join("domain.cfg");
        let config = DomainConfig::load_or_generate(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.domain, "kestrel");

        let reloaded = DomainConfig::load_or_generate(&path).unwrap();
        assert_eq!(reloaded.group_port, config.group_port);
    }
}
