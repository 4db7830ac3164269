//! Persisted configuration for the agent.
//!
//! The configuration lives in a single YAML document, by default at
//! `~/.tether/config.yaml`. Missing file means defaults. The [`Store`]
//! wraps a config with copy-on-read access and persist-on-update; the
//! supervisor reads a fresh copy per session attempt and is restarted
//! (never mutated in place) when the config changes.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_BROWSER_PORT, DEFAULT_WEB_PORT};
use crate::error::{Error, Result};

/// Complete agent configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Hub connection settings.
    pub agent: AgentConfig,
    /// Computer role settings.
    pub computer: ComputerConfig,
    /// Browser role settings.
    pub browser: BrowserConfig,
    /// Management panel settings.
    pub web: WebConfig,
}

/// Hub connection settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Hub address, e.g. `ws://hub.example.com:50051`.
    pub address: String,
    /// Bearer token echoed in the registration message.
    pub token: String,
}

/// Computer role settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputerConfig {
    pub id: String,
    pub description: String,
    pub allowed_paths: Vec<String>,
}

/// Browser role settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub id: String,
    pub description: String,
    pub port: u16,
}

/// Management panel settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub port: u16,
}

impl Config {
    /// Returns true when the minimum connection settings are present: a Hub
    /// address plus at least one role identity.
    pub fn is_configured(&self) -> bool {
        !self.agent.address.is_empty()
            && (!self.computer.id.is_empty() || !self.browser.id.is_empty())
    }

    /// Fill in default ports where unset.
    pub fn apply_defaults(&mut self) {
        if self.browser.port == 0 {
            self.browser.port = DEFAULT_BROWSER_PORT;
        }
        if self.web.port == 0 {
            self.web.port = DEFAULT_WEB_PORT;
        }
    }

    /// Configuration with default ports and nothing else.
    pub fn with_defaults() -> Self {
        let mut cfg = Self::default();
        cfg.apply_defaults();
        cfg
    }
}

/// Default configuration directory: `~/.tether`.
pub fn default_config_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|h| h.join(".tether"))
        .ok_or_else(|| Error::Config {
            message: "获取 home 目录失败".into(),
        })
}

/// Default configuration file path: `~/.tether/config.yaml`.
pub fn default_config_path() -> Result<PathBuf> {
    Ok(default_config_dir()?.join("config.yaml"))
}

/// Load a configuration file. A missing file yields defaults.
pub fn load(path: &Path) -> Result<Config> {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Config::with_defaults());
        }
        Err(e) => {
            return Err(Error::Config {
                message: format!("读取配置文件失败: {e}"),
            });
        }
    };

    let mut cfg: Config = serde_yaml::from_str(&data).map_err(|e| Error::Config {
        message: format!("解析配置文件失败: {e}"),
    })?;
    cfg.apply_defaults();
    Ok(cfg)
}

/// Persist a configuration file (file 0600, directory 0755).
pub fn save(path: &Path, cfg: &Config) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| Error::Config {
            message: format!("创建配置目录失败: {e}"),
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(dir, fs::Permissions::from_mode(0o755));
        }
    }

    let data = serde_yaml::to_string(cfg).map_err(|e| Error::Config {
        message: format!("序列化配置失败: {e}"),
    })?;
    fs::write(path, data).map_err(|e| Error::Config {
        message: format!("写入配置文件失败: {e}"),
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
    }
    Ok(())
}

/// Thread-safe configuration holder with optional file persistence.
#[derive(Debug)]
pub struct Store {
    cfg: RwLock<Config>,
    path: Option<PathBuf>,
}

impl Store {
    /// Open a store backed by a file, loading the current contents.
    pub fn open(path: PathBuf) -> Result<Self> {
        let cfg = load(&path)?;
        Ok(Self {
            cfg: RwLock::new(cfg),
            path: Some(path),
        })
    }

    /// Build a store that lives only in memory (legacy CLI mode).
    pub fn in_memory(mut cfg: Config) -> Self {
        cfg.apply_defaults();
        Self {
            cfg: RwLock::new(cfg),
            path: None,
        }
    }

    /// Return a copy of the current configuration.
    pub fn get(&self) -> Config {
        self.cfg.read().expect("config lock poisoned").clone()
    }

    /// Replace the configuration, persisting first when file-backed.
    pub fn update(&self, mut cfg: Config) -> Result<()> {
        cfg.apply_defaults();
        if let Some(path) = &self.path {
            save(path, &cfg)?;
        }
        *self.cfg.write().expect("config lock poisoned") = cfg;
        Ok(())
    }

    /// Path of the backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}
