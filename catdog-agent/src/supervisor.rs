/**
 * MODULE PROCESS - Un module du roster = un sous-processus isolé
 *
 * ROLE : Lance `catdog-module --module <id> --params <json>` avec un
 * environnement explicite, surveille la sortie du processus et l'arrête
 * proprement (SIGTERM, délai de grâce, puis kill).
 */

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::process::{Child, Command};
use tokio::time::{timeout_at, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ModuleSpec;
use crate::error::AgentError;

pub const ENV_MODULE_NAME: &str = "CATDOG_MODULE_NAME";
pub const ENV_RELAY_ADDR: &str = "CATDOG_RELAY_ADDR";
pub const ENV_INSTANCE_ID: &str = "CATDOG_MODULE_INSTANCE_ID";
pub const ENV_HEARTBEAT_INTERVAL_MS: &str = "CATDOG_HEARTBEAT_INTERVAL_MS";

/// Ce que l'agent transmet à chaque module en plus de sa spec
#[derive(Debug, Clone)]
pub struct LaunchEnv {
    pub relay_addr: String,
    pub heartbeat_interval: Duration,
}

#[derive(Debug)]
pub struct ModuleProcess {
    name: String,
    module: String,
    instance_id: String,
    started_at: OffsetDateTime,
    child: Child,
    exit: Option<ExitStatus>,
}

impl ModuleProcess {
    pub fn spawn(launcher: &Path, spec: &ModuleSpec, env: &LaunchEnv) -> Result<Self, AgentError> {
        let instance_id = Uuid::new_v4().to_string();
        let params = if spec.params.is_null() {
            "{}".to_string()
        } else {
            serde_json::to_string(&spec.params).map_err(|e| AgentError::Params {
                name: spec.name.clone(),
                source: e,
            })?
        };

        let mut cmd = Command::new(launcher);
        cmd.arg("--module")
            .arg(&spec.module)
            .arg("--params")
            .arg(&params)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        // Variables spécifiques au module d'abord, l'identité ne se surcharge pas
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }
        cmd.env(ENV_MODULE_NAME, &spec.name)
            .env(ENV_RELAY_ADDR, &env.relay_addr)
            .env(ENV_INSTANCE_ID, &instance_id)
            .env(
                ENV_HEARTBEAT_INTERVAL_MS,
                env.heartbeat_interval.as_millis().to_string(),
            );

        let child = cmd.spawn().map_err(|source| AgentError::Spawn {
            name: spec.name.clone(),
            launcher: launcher.to_path_buf(),
            source,
        })?;

        info!(
            module = %spec.name,
            id = %spec.module,
            pid = ?child.id(),
            instance = %instance_id,
            "module process spawned"
        );

        Ok(Self {
            name: spec.name.clone(),
            module: spec.module.clone(),
            instance_id,
            started_at: OffsetDateTime::now_utc(),
            child,
            exit: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn started_at(&self) -> OffsetDateTime {
        self.started_at
    }

    /// `None` une fois le processus terminé
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Statut de sortie si le processus est terminé (mis en cache)
    pub fn try_wait(&mut self) -> Option<ExitStatus> {
        if self.exit.is_none() {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    info!(module = %self.name, %status, "module process exited");
                    self.exit = Some(status);
                }
                Ok(None) => {}
                Err(e) => warn!(module = %self.name, error = %e, "cannot poll module process"),
            }
        }
        self.exit
    }

    /// Demande un arrêt propre ; false si le processus est déjà terminé
    pub fn signal_stop(&mut self) -> bool {
        if self.try_wait().is_some() {
            return false;
        }
        if send_sigterm(&self.child) {
            return true;
        }
        // Pas de SIGTERM possible : arrêt immédiat
        if let Err(e) = self.child.start_kill() {
            warn!(module = %self.name, error = %e, "kill failed");
        }
        true
    }

    /// Attend la sortie jusqu'à `deadline`, tue le processus au-delà
    pub async fn wait_or_kill(&mut self, deadline: Instant) -> Option<ExitStatus> {
        if let Some(status) = self.try_wait() {
            return Some(status);
        }
        match timeout_at(deadline, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(module = %self.name, %status, "module stopped");
                self.exit = Some(status);
            }
            Ok(Err(e)) => warn!(module = %self.name, error = %e, "wait failed"),
            Err(_) => {
                warn!(module = %self.name, "grace period elapsed, force killing");
                if let Err(e) = self.child.kill().await {
                    warn!(module = %self.name, error = %e, "force kill failed");
                }
                self.exit = self.child.try_wait().ok().flatten();
            }
        }
        self.exit
    }

    pub async fn terminate(&mut self, grace: Duration) -> Option<ExitStatus> {
        self.signal_stop();
        self.wait_or_kill(Instant::now() + grace).await
    }
}

#[cfg(unix)]
fn send_sigterm(child: &Child) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return false;
    };
    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            warn!(pid, error = %e, "SIGTERM failed");
            false
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) -> bool {
    false
}
