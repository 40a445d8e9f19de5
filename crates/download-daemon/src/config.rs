//! Configuration loading and management

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Daemon configuration, stored as `config.json` in the config directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Where downloaded pages are kept
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Directory mirroring the device (expects a `SAVED` folder inside)
    #[serde(default)]
    pub device_dir: Option<PathBuf>,

    /// Press Save whenever a page appears in the device's `SAVED` folder
    #[serde(default = "default_true")]
    pub watch_saved_folder: bool,

    /// Bring the device link up at startup, which starts a run on its own
    #[serde(default)]
    pub connect_on_start: bool,

    /// Abort a run that has not finished after this many seconds
    #[serde(default)]
    pub run_timeout_secs: Option<u64>,
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_true() -> bool {
    true
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            device_dir: None,
            watch_saved_folder: true,
            connect_on_start: false,
            run_timeout_secs: None,
        }
    }
}

/// Command-line values that win over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub storage_dir: Option<PathBuf>,
    pub device_dir: Option<PathBuf>,
    pub connect_on_start: bool,
    pub no_watch: bool,
    pub run_timeout_secs: Option<u64>,
}

impl DaemonConfig {
    /// Load configuration from the config directory, writing defaults if absent
    pub fn load(config_dir: &Path) -> Result<Self> {
        let config_file = config_dir.join("config.json");

        if config_file.exists() {
            let content = std::fs::read_to_string(&config_file)
                .with_context(|| format!("Failed to read config file: {:?}", config_file))?;
            let config: DaemonConfig = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {:?}", config_file))?;
            tracing::info!("Loaded configuration from {:?}", config_file);
            Ok(config)
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_file);
            let config = DaemonConfig::default();

            std::fs::create_dir_all(config_dir).with_context(|| {
                format!("Failed to create config directory: {:?}", config_dir)
            })?;

            let content = serde_json::to_string_pretty(&config)?;
            std::fs::write(&config_file, content)
                .with_context(|| format!("Failed to write default config: {:?}", config_file))?;
            tracing::info!("Created default config at {:?}", config_file);

            Ok(config)
        }
    }

    pub fn apply(mut self, overrides: ConfigOverrides) -> Self {
        if let Some(storage_dir) = overrides.storage_dir {
            self.storage_dir = storage_dir;
        }
        if let Some(device_dir) = overrides.device_dir {
            self.device_dir = Some(device_dir);
        }
        if overrides.connect_on_start {
            self.connect_on_start = true;
        }
        if overrides.no_watch {
            self.watch_saved_folder = false;
        }
        if let Some(secs) = overrides.run_timeout_secs {
            self.run_timeout_secs = Some(secs);
        }
        self
    }

    /// The device directory, which has no default.
    pub fn device_dir(&self) -> Result<&Path> {
        match &self.device_dir {
            Some(dir) => Ok(dir),
            None => bail!("No device directory configured (set device_dir or pass --device)"),
        }
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}
