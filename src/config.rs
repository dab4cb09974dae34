//! Configuration loaded from `imagewarden.toml`.
//!
//! [`WardenConfig`] holds every tunable of the supervisor. Fields missing
//! from the file fall back to sensible defaults. The `IMAGEWARDEN_ENGINE`
//! environment variable takes precedence over the file for the engine path.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::state_machine::{Compression, Firmware, RetryConfig};

pub const DEFAULT_CONFIG_FILE: &str = "imagewarden.toml";
pub const ENGINE_ENV_VAR: &str = "IMAGEWARDEN_ENGINE";

/// Top-level configuration loaded from `imagewarden.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct WardenConfig {
    /// Imaging engine executable.
    #[serde(default = "default_engine_path")]
    pub engine_path: PathBuf,

    /// Boot configuration tool executable.
    #[serde(default = "default_boot_tool_path")]
    pub boot_tool_path: PathBuf,

    /// Volume dirty-bit probe executable.
    #[serde(default = "default_volume_probe_path")]
    pub volume_probe_path: PathBuf,

    /// Append-only log of files that could not be captured.
    #[serde(default = "default_skip_log_path")]
    pub skip_log_path: PathBuf,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Engine worker threads; 0 means one per logical CPU.
    #[serde(default)]
    pub threads: u32,

    #[serde(default)]
    pub compression: Compression,

    /// Exclusions added to the built-in list for every capture.
    #[serde(default)]
    pub extra_exclusions: Vec<String>,

    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    /// Show engine read/write rates on the progress line.
    #[serde(default)]
    pub sample_io_rates: bool,

    /// Image index used for apply and per-file update.
    #[serde(default = "default_image_index")]
    pub image_index: u32,

    #[serde(default)]
    pub firmware: Firmware,
}

fn default_engine_path() -> PathBuf {
    PathBuf::from("wimlib-imagex.exe")
}

fn default_boot_tool_path() -> PathBuf {
    PathBuf::from("bcdboot.exe")
}

fn default_volume_probe_path() -> PathBuf {
    PathBuf::from("fsutil.exe")
}

fn default_skip_log_path() -> PathBuf {
    PathBuf::from("skipped_files.log")
}

fn default_probe_timeout_secs() -> u64 {
    15
}

fn default_image_index() -> u32 {
    1
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            engine_path: default_engine_path(),
            boot_tool_path: default_boot_tool_path(),
            volume_probe_path: default_volume_probe_path(),
            skip_log_path: default_skip_log_path(),
            retry: RetryConfig::default(),
            threads: 0,
            compression: Compression::default(),
            extra_exclusions: Vec::new(),
            probe_timeout_secs: default_probe_timeout_secs(),
            sample_io_rates: false,
            image_index: default_image_index(),
            firmware: Firmware::default(),
        }
    }
}

impl WardenConfig {
    /// Loads configuration from `path`, or from `imagewarden.toml` in the
    /// current directory. Uses defaults if the file does not exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str::<WardenConfig>(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Self::default()
        };

        if let Ok(engine) = std::env::var(ENGINE_ENV_VAR) {
            if !engine.is_empty() {
                config.engine_path = PathBuf::from(engine);
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        Ok(())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Thread count to pass to the engine, resolving 0 to the CPU count.
    pub fn effective_threads(&self, requested: Option<u32>) -> u32 {
        match requested.unwrap_or(self.threads) {
            0 => std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1),
            n => n,
        }
    }
}
