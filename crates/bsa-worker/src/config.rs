use std::path::PathBuf;

use bsa_kar::{EngineConfig, WorkerConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Where knowledge artifact definitions are read from
    #[serde(default)]
    pub artifacts: ArtifactsConfig,
    /// Where submitted reports are written
    #[serde(default)]
    pub reports: ReportsConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        // Worker validations
        if self.worker.poll_interval_ms == 0 {
            return Err("worker.poll_interval_ms must be > 0".into());
        }
        if self.worker.batch_size == 0 {
            return Err("worker.batch_size must be > 0".into());
        }
        if self.worker.retry_base_secs == 0 {
            return Err("worker.retry_base_secs must be > 0".into());
        }
        if self.worker.claim_timeout_secs == 0 {
            return Err("worker.claim_timeout_secs must be > 0".into());
        }
        // Engine validation
        if self.engine.default_timing_offset.is_zero() {
            return Err("engine.default_timing_offset must be > 0".into());
        }
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        if self.artifacts.dir.as_os_str().is_empty() {
            return Err("artifacts.dir must not be empty".into());
        }
        if self.reports.output_dir.as_os_str().is_empty() {
            return Err("reports.output_dir must not be empty".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactsConfig {
    /// Directory scanned for `*.json` artifact definitions
    #[serde(default = "default_artifacts_dir")]
    pub dir: PathBuf,
}
fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("artifacts")
}
impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            dir: default_artifacts_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportsConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("reports")
}
impl Default for ReportsConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
        }
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    /// Default configuration file, used when neither `--config` nor
    /// `BSA_CONFIG` is given.
    pub const DEFAULT_CONFIG_PATH: &str = "bsa.toml";

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_PATH));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        }
        // Environment variable overrides, e.g., BSA__WORKER__BATCH_SIZE=10
        builder = builder.add_source(
            Environment::with_prefix("BSA")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}
