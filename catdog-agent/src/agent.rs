/**
 * AGENT - Superviseur des modules d'un device
 *
 * ROLE : Lance chaque module du roster dans son propre processus, suit leur
 * santé via les heartbeats du canal global et la sortie des processus,
 * diffuse la santé du device en vibes.
 *
 * DÉMARRAGE : (relay si primaire) -> client du canal global -> spawn des
 * modules -> attente `online` (timeout) -> moniteur + vibes. Un échec à
 * n'importe quelle étape arrête tout ce qui a été lancé.
 *
 * SUPERVISION : consultative uniquement. Heartbeat manquant, processus
 * sorti ou heartbeat `dying` => warning + publication sur le canal de
 * fautes ; aucun redémarrage automatique.
 */

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use catdog_core::{GlobalChannel, LinkClient, LinkClientHandle, VibeListener, VibeMap, VibeSender};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::health::HealthTracker;
use crate::heartbeats::HeartbeatTable;
use crate::supervisor::{LaunchEnv, ModuleProcess};

const FAULT_CHANNEL_CAPACITY: usize = 64;
const STARTUP_POLL: Duration = Duration::from_millis(100);

/// Anomalie relevée par le moniteur
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModuleFault {
    MissedHeartbeat { module: String, silent_for_secs: f64 },
    Exited { module: String, code: Option<i32> },
    Dying { module: String, error: Option<String> },
}

impl ModuleFault {
    pub fn module(&self) -> &str {
        match self {
            ModuleFault::MissedHeartbeat { module, .. }
            | ModuleFault::Exited { module, .. }
            | ModuleFault::Dying { module, .. } => module,
        }
    }
}

/// État partagé entre l'agent et sa tâche de monitoring
struct Supervision {
    table: HeartbeatTable,
    processes: Mutex<Vec<ModuleProcess>>,
    faults: broadcast::Sender<ModuleFault>,
    /// Sorties et dying déjà signalés (événements uniques)
    reported: parking_lot::Mutex<HashSet<String>>,
    heartbeat_timeout: Duration,
}

impl Supervision {
    fn first_report(&self, key: String) -> bool {
        self.reported.lock().insert(key)
    }

    async fn check(&self) -> Vec<ModuleFault> {
        let mut faults = Vec::new();

        for (module, silent_for_secs) in self.table.stale(self.heartbeat_timeout) {
            faults.push(ModuleFault::MissedHeartbeat {
                module,
                silent_for_secs,
            });
        }

        {
            let mut processes = self.processes.lock().await;
            for process in processes.iter_mut() {
                if let Some(status) = process.try_wait() {
                    if self.first_report(format!("exited:{}", process.name())) {
                        faults.push(ModuleFault::Exited {
                            module: process.name().to_string(),
                            code: status.code(),
                        });
                    }
                }
            }
        }

        for (module, error) in self.table.dying() {
            if self.first_report(format!("dying:{module}")) {
                faults.push(ModuleFault::Dying { module, error });
            }
        }

        for fault in &faults {
            match fault {
                ModuleFault::MissedHeartbeat { module, silent_for_secs } => {
                    warn!(%module, silent_for_secs, "no heartbeat from module")
                }
                ModuleFault::Exited { module, code } => warn!(%module, ?code, "module process exited"),
                ModuleFault::Dying { module, error } => warn!(%module, ?error, "module announced its death"),
            }
            // Personne n'écoute : pas une erreur
            let _ = self.faults.send(fault.clone());
        }
        faults
    }
}

pub struct Agent {
    config: AgentConfig,
    launcher: PathBuf,
    serve_relay: bool,
    supervision: Arc<Supervision>,
    health: HealthTracker,
    relay: Option<GlobalChannel>,
    relay_client: Option<LinkClientHandle>,
    relay_addr: Option<String>,
    vibe_map: Option<VibeMap>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    started: bool,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        config.validate()?;
        let launcher = config.launcher_path()?;
        let (faults, _) = broadcast::channel(FAULT_CHANNEL_CAPACITY);
        let supervision = Arc::new(Supervision {
            table: HeartbeatTable::new(),
            processes: Mutex::new(Vec::new()),
            faults,
            reported: parking_lot::Mutex::new(HashSet::new()),
            heartbeat_timeout: config.monitor.heartbeat_timeout(),
        });
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            serve_relay: config.relay.serve,
            config,
            launcher,
            supervision,
            health: HealthTracker::new(),
            relay: None,
            relay_client: None,
            relay_addr: None,
            vibe_map: None,
            shutdown,
            tasks: Vec::new(),
            started: false,
        })
    }

    pub fn with_launcher(mut self, launcher: impl Into<PathBuf>) -> Self {
        self.launcher = launcher.into();
        self
    }

    /// `--primary` : héberge le canal global quoi que dise la config
    pub fn primary(mut self, primary: bool) -> Self {
        self.serve_relay |= primary;
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn heartbeats(&self) -> &HeartbeatTable {
        &self.supervision.table
    }

    /// Adresse du canal global utilisée par l'agent et ses modules
    pub fn relay_addr(&self) -> Option<&str> {
        self.relay_addr.as_deref()
    }

    pub fn vibes(&self) -> Option<VibeMap> {
        self.vibe_map.clone()
    }

    pub fn subscribe_faults(&self) -> broadcast::Receiver<ModuleFault> {
        self.supervision.faults.subscribe()
    }

    pub fn health_snapshot(&self) -> Map<String, Value> {
        self.health.snapshot(&self.supervision.table)
    }

    /// Un passage du moniteur, à la demande
    pub async fn check_modules(&self) -> Vec<ModuleFault> {
        self.supervision.check().await
    }

    /// `(nom, pid)` de chaque module, pid absent une fois le processus terminé
    pub async fn module_pids(&self) -> Vec<(String, Option<u32>)> {
        self.supervision
            .processes
            .lock()
            .await
            .iter()
            .map(|p| (p.name().to_string(), p.pid()))
            .collect()
    }

    pub async fn start(&mut self) -> Result<(), AgentError> {
        if self.started {
            return Err(AgentError::AlreadyStarted);
        }
        self.started = true;
        info!(
            device = %self.config.device.name,
            modules = self.config.modules.len(),
            primary = self.serve_relay,
            "agent starting"
        );

        let relay_addr = if self.serve_relay {
            let bind = self.config.relay.bind.clone();
            let relay = match GlobalChannel::start(bind.as_str()).await {
                Ok(relay) => relay,
                Err(source) => return Err(AgentError::RelayBind { bind, source }),
            };
            // Les modules locaux passent par la loopback
            let addr = format!("127.0.0.1:{}", relay.local_addr().port());
            self.relay = Some(relay);
            addr
        } else {
            self.config.relay.address.clone()
        };
        self.relay_addr = Some(relay_addr.clone());

        let table = self.supervision.table.clone();
        self.relay_client = Some(LinkClient::new(relay_addr.clone()).spawn(move |message| table.observe(&message)));

        let env = LaunchEnv {
            relay_addr,
            heartbeat_interval: self.config.monitor.heartbeat_interval(),
        };
        let ready = match self.spawn_modules(&env).await {
            Ok(()) => self.await_online().await,
            Err(e) => Err(e),
        };
        if let Err(e) = ready {
            error!(error = %e, "agent startup failed, stopping everything");
            self.stop().await;
            return Err(e);
        }

        self.spawn_monitor();
        if self.config.vibes.enabled {
            self.start_vibes().await;
        }
        info!(device = %self.config.device.name, "agent operational");
        Ok(())
    }

    async fn spawn_modules(&self, env: &LaunchEnv) -> Result<(), AgentError> {
        let mut processes = self.supervision.processes.lock().await;
        for spec in &self.config.modules {
            self.supervision.table.register(&spec.name);
            processes.push(ModuleProcess::spawn(&self.launcher, spec, env)?);
        }
        Ok(())
    }

    /// Attend que chaque module soit `operational`/`processing`
    async fn await_online(&self) -> Result<(), AgentError> {
        let timeout = self.config.monitor.startup_timeout();
        let deadline = Instant::now() + timeout;
        info!(?timeout, "waiting for modules to come online");

        loop {
            if self.supervision.table.pending().is_empty() {
                info!("all modules online");
                return Ok(());
            }

            {
                let mut processes = self.supervision.processes.lock().await;
                for process in processes.iter_mut() {
                    if let Some(status) = process.try_wait() {
                        return Err(AgentError::ModuleExited {
                            name: process.name().to_string(),
                            code: status.code(),
                        });
                    }
                }
            }

            if Instant::now() >= deadline {
                return Err(AgentError::StartupTimeout {
                    pending: self.supervision.table.pending(),
                });
            }
            tokio::time::sleep(STARTUP_POLL).await;
        }
    }

    fn spawn_monitor(&mut self) {
        let supervision = self.supervision.clone();
        let every = self.config.monitor.check_interval();
        let mut shutdown = self.shutdown.subscribe();
        info!(?every, timeout = ?supervision.heartbeat_timeout, "heartbeat monitoring started");

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        supervision.check().await;
                    }
                }
            }
        }));
    }

    async fn start_vibes(&mut self) {
        let vibes = self.config.vibes.clone();
        let ip: IpAddr = match vibes.target.parse() {
            Ok(ip) => ip,
            Err(e) => {
                warn!(target = %vibes.target, error = %e, "invalid vibes target, vibes disabled");
                return;
            }
        };

        let table = self.supervision.table.clone();
        let health = self.health.clone();
        let sender = VibeSender::new(self.config.device.name.clone(), move || health.snapshot(&table))
            .with_target(SocketAddr::new(ip, vibes.port))
            .with_interval(vibes.interval());
        let shutdown = self.shutdown.subscribe();
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = sender.run(shutdown).await {
                warn!(error = %e, "vibe sender stopped");
            }
        }));

        match VibeListener::bind((Ipv4Addr::UNSPECIFIED, vibes.port)).await {
            Ok(listener) => {
                let listener = listener.with_interval(vibes.interval());
                self.vibe_map = Some(listener.map());
                self.tasks.push(tokio::spawn(listener.run(self.shutdown.subscribe())));
            }
            Err(e) => warn!(port = vibes.port, error = %e, "vibe listener unavailable"),
        }
    }

    /// Arrête moniteur et vibes, SIGTERM à chaque module (délai de grâce puis
    /// kill), puis le client et le relay.
    pub async fn stop(&mut self) {
        info!("agent stopping");
        self.shutdown.send_replace(true);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "agent task ended abnormally");
            }
        }

        {
            let mut processes = self.supervision.processes.lock().await;
            for process in processes.iter_mut() {
                process.signal_stop();
            }
            let deadline = Instant::now() + self.config.monitor.shutdown_grace();
            for process in processes.iter_mut() {
                process.wait_or_kill(deadline).await;
            }
        }

        if let Some(client) = self.relay_client.take() {
            client.join().await;
        }
        if let Some(relay) = self.relay.take() {
            relay.shutdown();
        }
        info!("agent stopped");
    }
}
