use std::path::PathBuf;

use catdog_core::LinkError;

use crate::config::ConfigError;

/// Erreurs de l'agent (démarrage, supervision)
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot spawn module '{name}' with {launcher}: {source}")]
    Spawn {
        name: String,
        launcher: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot encode params of module '{name}': {source}")]
    Params {
        name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("startup timed out, modules not online: {}", .pending.join(", "))]
    StartupTimeout { pending: Vec<String> },
    #[error("module '{name}' exited during startup (code {code:?})")]
    ModuleExited { name: String, code: Option<i32> },
    #[error("cannot host the global channel on {bind}: {source}")]
    RelayBind {
        bind: String,
        #[source]
        source: LinkError,
    },
    #[error("agent already started")]
    AlreadyStarted,
}
