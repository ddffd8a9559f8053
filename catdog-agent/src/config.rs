use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// Variable d'env pointant vers le roster YAML
pub const CONFIG_ENV: &str = "CATDOG_AGENT_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "agent.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AgentConfig {
    pub device: DeviceConf,
    pub relay: RelayConf,
    pub vibes: VibesConf,
    pub monitor: MonitorConf,
    /// Chemin du binaire `catdog-module`, par défaut à côté de l'agent
    pub launcher: Option<PathBuf>,
    pub modules: Vec<ModuleSpec>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DeviceConf {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RelayConf {
    /// Héberger le canal global dans ce process (agent primaire)
    pub serve: bool,
    pub bind: String,
    pub address: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct VibesConf {
    pub enabled: bool,
    pub port: u16,
    pub interval_secs: f64,
    pub target: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MonitorConf {
    pub heartbeat_timeout_secs: f64,
    pub check_interval_secs: f64,
    pub startup_timeout_secs: f64,
    pub heartbeat_interval_ms: u64,
    pub shutdown_grace_secs: f64,
}

/// Une entrée du roster : une instance de module = un sous-processus
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ModuleSpec {
    pub name: String,
    /// Identifiant dans le registre, ex: `debug.dummy_sensor`
    pub module: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for DeviceConf {
    fn default() -> Self {
        let name = gethostname::gethostname().to_string_lossy().into_owned();
        Self {
            name: if name.is_empty() { "unknown".into() } else { name },
        }
    }
}

impl Default for RelayConf {
    fn default() -> Self {
        Self {
            serve: false,
            bind: "0.0.0.0:9000".into(),
            address: "127.0.0.1:9000".into(),
        }
    }
}

impl Default for VibesConf {
    fn default() -> Self {
        Self {
            enabled: true,
            port: catdog_core::VIBE_PORT,
            interval_secs: 5.0,
            target: "255.255.255.255".into(),
        }
    }
}

impl Default for MonitorConf {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: 10.0,
            check_interval_secs: 2.0,
            startup_timeout_secs: 10.0,
            heartbeat_interval_ms: 2000,
            shutdown_grace_secs: 5.0,
        }
    }
}

impl MonitorConf {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.heartbeat_timeout_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.check_interval_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.startup_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs_f64(self.shutdown_grace_secs)
    }
}

impl VibesConf {
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval_secs)
    }
}

impl AgentConfig {
    /// Lit et valide le roster
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let txt = fs::read_to_string(path).await.map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&txt)
    }

    pub fn from_yaml(txt: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig = serde_yaml::from_str(txt)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.modules.is_empty() {
            return Err(ConfigError::Invalid("no module declared".into()));
        }

        let mut seen = HashSet::new();
        for spec in &self.modules {
            if spec.name.trim().is_empty() {
                return Err(ConfigError::Invalid("module with an empty name".into()));
            }
            if spec.module.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("module '{}' has no module id", spec.name)));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate module name '{}'", spec.name)));
            }
            if !(spec.params.is_null() || spec.params.is_object()) {
                return Err(ConfigError::Invalid(format!("params of '{}' must be a mapping", spec.name)));
            }
        }

        let m = &self.monitor;
        for (label, value) in [
            ("heartbeat_timeout_secs", m.heartbeat_timeout_secs),
            ("check_interval_secs", m.check_interval_secs),
            ("startup_timeout_secs", m.startup_timeout_secs),
            ("shutdown_grace_secs", m.shutdown_grace_secs),
            ("vibes.interval_secs", self.vibes.interval_secs),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::Invalid(format!("{label} must be a positive number")));
            }
        }
        if m.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid("heartbeat_interval_ms must be positive".into()));
        }
        Ok(())
    }

    /// Binaire lancé pour chaque module
    pub fn launcher_path(&self) -> Result<PathBuf, ConfigError> {
        if let Some(path) = &self.launcher {
            return Ok(path.clone());
        }
        let exe = std::env::current_exe().map_err(|source| ConfigError::Io {
            path: PathBuf::from("<current executable>"),
            source,
        })?;
        let dir = exe
            .parent()
            .ok_or_else(|| ConfigError::Invalid("cannot locate the agent executable directory".into()))?;
        Ok(dir.join(format!("catdog-module{}", std::env::consts::EXE_SUFFIX)))
    }
}
