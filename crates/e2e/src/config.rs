//! Harness configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::E2eResult;
use crate::playwright::PlaywrightConfig;

/// Top-level harness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Base URL of the server under test
    pub base_url: String,

    /// Credentials for the HTTP control plane (basic auth)
    pub username: Option<String>,
    pub password: Option<String>,

    /// Container path used when a call does not name one
    pub default_container: String,

    /// How long to wait for the server to answer before giving up
    pub startup_timeout_ms: u64,

    /// Bounded waits for elements and page transitions
    pub wait: WaitConfig,

    /// Polling of background pipeline jobs
    pub jobs: WaitConfig,

    /// Browser backend
    pub playwright: PlaywrightConfig,

    /// Read-only sample data root
    pub sample_data_root: PathBuf,

    /// Where exported archives are written
    pub export_dir: PathBuf,

    /// Where results are written
    pub output_dir: PathBuf,

    /// Directory containing YAML plans
    pub plans_dir: PathBuf,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080/labkey".to_string(),
            username: None,
            password: None,
            default_container: "home".to_string(),
            startup_timeout_ms: 120_000,
            wait: WaitConfig::default(),
            jobs: WaitConfig {
                timeout_ms: 600_000,
                poll_interval_ms: 1_000,
            },
            playwright: PlaywrightConfig::default(),
            sample_data_root: PathBuf::from("sampledata"),
            export_dir: PathBuf::from("test-results/exports"),
            output_dir: PathBuf::from("test-results"),
            plans_dir: PathBuf::from("tests/plans"),
        }
    }
}

/// Timeout and poll interval for a family of waits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitConfig {
    pub timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            poll_interval_ms: 100,
        }
    }
}

impl WaitConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl HarnessConfig {
    /// Load configuration from file, falling back to defaults when absent
    pub fn load(path: &Path) -> E2eResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> E2eResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::E2eError::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    /// Resolve a file under the sample data root
    pub fn sample_file(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.sample_data_root.join(relative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = HarnessConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.wait.timeout_ms, 10_000);
        assert_eq!(config.jobs.poll_interval_ms, 1_000);
    }

    #[test]
    fn save_then_load_preserves_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/harness.toml");

        let mut config = HarnessConfig::default();
        config.base_url = "http://localhost:9999".to_string();
        config.wait.timeout_ms = 250;
        config.save(&path).unwrap();

        let loaded = HarnessConfig::load(&path).unwrap();
        assert_eq!(loaded.base_url, "http://localhost:9999");
        assert_eq!(loaded.wait.timeout(), Duration::from_millis(250));
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harness.toml");
        std::fs::write(&path, "default_container = \"StudyVerifyProject\"\n").unwrap();

        let config = HarnessConfig::load(&path).unwrap();
        assert_eq!(config.default_container, "StudyVerifyProject");
        assert_eq!(config.wait, WaitConfig::default());
    }
}
