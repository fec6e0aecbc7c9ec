//! Analysis configuration
//!
//! Controls which replay passes run and how the in-process transport
//! behaves. Loadable from TOML; every field has a default.
//!
//! ```toml
//! delay_analysis = true
//! critical_path = false
//! pending_pool_capacity = 128
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ReplayError, Result};
use crate::replay::PassPlan;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Attribute wait states to root causes (needs all five passes)
    pub delay_analysis: bool,
    /// Critical-path analysis by downstream patterns (needs all five passes)
    pub critical_path: bool,
    /// Only run the main forward pass; overrides the two flags above
    pub single_pass: bool,
    /// Soft capacity of the pending non-blocking send pool
    pub pending_pool_capacity: usize,
    /// Synchronize at collectives during the point-to-point-only passes
    pub progress_barrier: bool,
    /// Poll interval of blocking receives while watching for job aborts
    pub recv_poll_interval_ms: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            delay_analysis: true,
            critical_path: false,
            single_pass: false,
            pending_pool_capacity: 64,
            progress_barrier: true,
            recv_poll_interval_ms: 50,
        }
    }
}

impl AnalysisConfig {
    /// Wait-state detection only (main and backward wait-state passes)
    pub fn basic() -> Self {
        Self {
            delay_analysis: false,
            critical_path: false,
            ..Default::default()
        }
    }

    /// Everything enabled
    pub fn full() -> Self {
        Self {
            delay_analysis: true,
            critical_path: true,
            ..Default::default()
        }
    }

    /// Main pass only
    pub fn single() -> Self {
        Self {
            single_pass: true,
            ..Self::basic()
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.pending_pool_capacity == 0 {
            return Err("pending_pool_capacity must be at least 1".to_string());
        }
        if self.recv_poll_interval_ms == 0 || self.recv_poll_interval_ms > 60_000 {
            return Err(format!(
                "recv_poll_interval_ms must be within 1..=60000, got {}",
                self.recv_poll_interval_ms
            ));
        }
        Ok(())
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| ReplayError::Config(e.to_string()))?;
        config.validate().map_err(ReplayError::Config)?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Replay passes implied by the enabled analyses
    pub fn pass_plan(&self) -> PassPlan {
        if self.single_pass {
            PassPlan::Single
        } else if self.delay_analysis || self.critical_path {
            PassPlan::Full
        } else {
            PassPlan::Basic
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.recv_poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AnalysisConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pass_plan(), PassPlan::Full);
    }

    #[test]
    fn test_presets_select_passes() {
        assert_eq!(AnalysisConfig::basic().pass_plan(), PassPlan::Basic);
        assert_eq!(AnalysisConfig::full().pass_plan(), PassPlan::Full);
        assert_eq!(AnalysisConfig::single().pass_plan(), PassPlan::Single);

        let critical_only = AnalysisConfig {
            delay_analysis: false,
            critical_path: true,
            ..Default::default()
        };
        assert_eq!(critical_only.pass_plan(), PassPlan::Full);
    }

    #[test]
    fn test_validation_rejects_zero_capacity() {
        let config = AnalysisConfig {
            pending_pool_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_partial_overrides() {
        let config = AnalysisConfig::from_toml_str("delay_analysis = false\nrecv_poll_interval_ms = 5\n").unwrap();
        assert!(!config.delay_analysis);
        assert_eq!(config.recv_poll_interval_ms, 5);
        assert_eq!(config.pending_pool_capacity, 64);
    }

    #[test]
    fn test_toml_invalid_values() {
        assert!(matches!(
            AnalysisConfig::from_toml_str("recv_poll_interval_ms = 0"),
            Err(ReplayError::Config(_))
        ));
        assert!(AnalysisConfig::from_toml_str("delay_analysis = \"yes\"").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("analysis.toml");
        std::fs::write(&path, "single_pass = true\n").unwrap();
        let config = AnalysisConfig::load(&path).unwrap();
        assert_eq!(config.pass_plan(), PassPlan::Single);
    }
}
