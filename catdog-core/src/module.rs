/**
 * MODULE RUNTIME - Lifecycle host for a single catdog module
 *
 * ROLE : Drives a `ModuleDriver` through boot -> start -> selftest ->
 * operational, multiplexes inbound messages / ticks / stop requests onto the
 * driver hooks, and runs the heartbeat loop next to it.
 *
 * STATE : `ModuleState` lives behind a mutex shared by the main body, the
 * heartbeat loop and link observers. Only the main body (and the processing
 * guard it hands out) writes `status` and `last_function`.
 *
 * FAILURE : an `Err` or a panic out of any hook turns into `status = error`,
 * `alive = false`, one final dying heartbeat, then `run` returns the error.
 */

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::{Map, Value};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{LinkError, ModuleError};
use crate::heartbeat::{Diagnostics, Heartbeat, HeartbeatStatus};
use crate::link::{ConnectionStatus, LinkObserver, MessageSink};
use crate::message::Message;
use crate::state::{new_state, Shared};

/// Default period between two heartbeats
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

/// Inbound messages waiting for a hook; beyond that they are dropped
pub const INBOX_CAPACITY: usize = 256;

/// Capability contract implemented by every module.
///
/// Hooks are called one at a time from the runtime's main body, never
/// concurrently.
#[async_trait]
pub trait ModuleDriver: Send {
    /// One-time diagnostics, before the module joins any link.
    async fn boot(&mut self, _ctx: &ModuleContext) -> Result<(), ModuleError> {
        Ok(())
    }

    /// Opens connections and launches background work.
    async fn start(&mut self, ctx: &ModuleContext) -> Result<(), ModuleError>;

    /// A data message received on one of the module's link clients.
    async fn handle(&mut self, _ctx: &ModuleContext, _message: Message) -> Result<(), ModuleError> {
        Ok(())
    }

    /// A message relayed by the global channel (heartbeats and own echoes filtered out).
    async fn handle_global(&mut self, _ctx: &ModuleContext, _message: Message) -> Result<(), ModuleError> {
        Ok(())
    }

    fn tick_interval(&self) -> Option<Duration> {
        None
    }

    async fn tick(&mut self, _ctx: &ModuleContext) -> Result<(), ModuleError> {
        Ok(())
    }

    async fn stop(&mut self, _ctx: &ModuleContext) -> Result<(), ModuleError> {
        Ok(())
    }

    fn selftest(&self) -> Result<(), ModuleError> {
        Ok(())
    }
}

#[derive(Debug)]
pub struct ModuleState {
    name: String,
    status: HeartbeatStatus,
    last_status_change: Instant,
    last_function: String,
    alive: bool,
    error_info: Option<String>,
    /// One slot per data link observer, in registration order
    links: Vec<ConnectionStatus>,
}

impl ModuleState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HeartbeatStatus::Booting,
            last_status_change: Instant::now(),
            last_function: "initializing".into(),
            alive: true,
            error_info: None,
            links: Vec::new(),
        }
    }

    /// `connected` only while every data link is up (and with no link at all).
    pub fn connection_status(&self) -> ConnectionStatus {
        if self.links.iter().all(|link| *link == ConnectionStatus::Connected) {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Lost
        }
    }

    fn set_status(&mut self, status: HeartbeatStatus) {
        if self.status != status {
            debug!(module = %self.name, from = %self.status, to = %status, "status change");
            self.status = status;
            self.last_status_change = Instant::now();
        }
    }

    fn fail(&mut self, error: &ModuleError) {
        self.error_info = Some(error.to_string());
        self.set_status(HeartbeatStatus::Error);
        self.alive = false;
    }

    /// Heartbeat describing the current state: nominal when operational and
    /// alive, full diagnostics otherwise.
    pub fn heartbeat(&self) -> Heartbeat {
        let dying = !self.alive;
        if self.status == HeartbeatStatus::Operational && !dying {
            return Heartbeat::nominal(&self.name);
        }
        Heartbeat::detailed(
            &self.name,
            self.status,
            dying,
            Diagnostics {
                last_function: self.last_function.clone(),
                active: self.status == HeartbeatStatus::Operational,
                connected: self.connection_status() == ConnectionStatus::Connected,
                error: self.error_info.clone(),
                time_in_status_seconds: self.last_status_change.elapsed().as_secs_f64(),
            },
        )
    }
}

#[derive(Debug)]
enum Inbound {
    Data(Message),
    Global(Message),
}

/// Handle given to driver hooks: state accessors, processing guard, message
/// handlers for link clients and the global channel outlet.
#[derive(Clone)]
pub struct ModuleContext {
    name: Arc<str>,
    state: Shared<ModuleState>,
    inbox: mpsc::Sender<Inbound>,
    global: Arc<OnceLock<Arc<dyn MessageSink>>>,
    running: watch::Receiver<bool>,
}

impl ModuleContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> HeartbeatStatus {
        self.state.lock().status
    }

    pub fn last_function(&self) -> String {
        self.state.lock().last_function.clone()
    }

    pub fn error_info(&self) -> Option<String> {
        self.state.lock().error_info.clone()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.state.lock().connection_status()
    }

    pub fn is_alive(&self) -> bool {
        self.state.lock().alive
    }

    /// False once a stop was requested.
    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    pub fn set_last_function(&self, function: impl Into<String>) {
        self.state.lock().last_function = function.into();
    }

    /// Current heartbeat, as the emitter would send it now.
    pub fn heartbeat(&self) -> Heartbeat {
        self.state.lock().heartbeat()
    }

    /// Enters `processing` for one unit of work. Returns `None` when another
    /// unit is already in progress or the module is not operational.
    pub fn begin_processing(&self, label: impl Into<String>) -> Option<ProcessingGuard> {
        let mut state = self.state.lock();
        if state.status != HeartbeatStatus::Operational {
            return None;
        }
        state.last_function = label.into();
        state.set_status(HeartbeatStatus::Processing);
        Some(ProcessingGuard {
            state: self.state.clone(),
        })
    }

    /// Handler for a [`crate::link::LinkClient`] feeding `ModuleDriver::handle`.
    pub fn data_handler(&self) -> impl FnMut(Message) + Send + 'static {
        let inbox = self.inbox.clone();
        let name = self.name.clone();
        move |message| enqueue(&inbox, &name, Inbound::Data(message))
    }

    /// Handler for the global channel client. Heartbeats and the module's own
    /// echoes never reach `ModuleDriver::handle_global`.
    pub fn global_handler(&self) -> impl FnMut(Message) + Send + 'static {
        let inbox = self.inbox.clone();
        let name = self.name.clone();
        move |message| {
            if message.is_heartbeat() || message.sender() == &*name {
                return;
            }
            enqueue(&inbox, &name, Inbound::Global(message));
        }
    }

    /// Observer for one data link client. Each call registers a new link,
    /// down until its client reports `connected`; the module is connected
    /// only while all of them are. The global channel client takes none.
    pub fn link_observer(&self) -> Arc<dyn LinkObserver> {
        let state = self.state.clone();
        let slot = {
            let mut state = state.lock();
            state.links.push(ConnectionStatus::Lost);
            state.links.len() - 1
        };
        Arc::new(move |status: ConnectionStatus| {
            let mut state = state.lock();
            if state.links[slot] != status {
                info!(module = %state.name, link = slot, connection = ?status, "upstream link status changed");
            }
            state.links[slot] = status;
        })
    }

    /// Publishes `content` as a data message on the global channel.
    pub fn broadcast_global(&self, content: Map<String, Value>) -> Result<(), LinkError> {
        let sink = self.global.get().ok_or(LinkError::Closed)?;
        sink.send(Message::data(self.name(), content))
    }
}

fn enqueue(inbox: &mpsc::Sender<Inbound>, module: &str, inbound: Inbound) {
    match inbox.try_send(inbound) {
        Ok(()) => {}
        Err(TrySendError::Full(dropped)) => {
            warn!(%module, message = ?dropped, "inbox full, message dropped")
        }
        Err(TrySendError::Closed(_)) => debug!(%module, "module stopped, message dropped"),
    }
}

/// Reverts `processing` to `operational` when dropped, whatever the outcome
/// of the unit of work.
pub struct ProcessingGuard {
    state: Shared<ModuleState>,
}

impl Drop for ProcessingGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if state.status == HeartbeatStatus::Processing {
            state.set_status(HeartbeatStatus::Operational);
        }
    }
}

/// Requests a graceful stop of a running module.
#[derive(Clone)]
pub struct StopHandle {
    running: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.running.send_replace(false);
    }
}

pub struct ModuleRuntime {
    ctx: ModuleContext,
    driver: Box<dyn ModuleDriver>,
    inbox: mpsc::Receiver<Inbound>,
    running: Arc<watch::Sender<bool>>,
    heartbeat_interval: Duration,
}

impl ModuleRuntime {
    pub fn new(name: impl Into<String>, driver: Box<dyn ModuleDriver>) -> Self {
        let name: String = name.into();
        let (inbox_tx, inbox) = mpsc::channel(INBOX_CAPACITY);
        let (running, running_rx) = watch::channel(true);
        let ctx = ModuleContext {
            name: Arc::from(name.as_str()),
            state: new_state(ModuleState::new(name)),
            inbox: inbox_tx,
            global: Arc::new(OnceLock::new()),
            running: running_rx,
        };
        Self {
            ctx,
            driver,
            inbox,
            running: Arc::new(running),
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }

    pub fn with_heartbeat_interval(mut self, every: Duration) -> Self {
        self.heartbeat_interval = every;
        self
    }

    pub fn context(&self) -> &ModuleContext {
        &self.ctx
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            running: self.running.clone(),
        }
    }

    /// Runs the driver's boot diagnostics. A failure leaves the module in
    /// `error` and is always reported as [`ModuleError::Boot`].
    pub async fn boot(&mut self) -> Result<(), ModuleError> {
        info!(module = self.ctx.name(), "booting");
        self.ctx.set_last_function("boot");
        let result = guarded(self.driver.boot(&self.ctx)).await.map_err(|e| match e {
            ModuleError::Boot(_) => e,
            other => ModuleError::Boot(other.to_string()),
        });
        if let Err(e) = &result {
            error!(module = self.ctx.name(), error = %e, "boot failed");
            self.ctx.state.lock().fail(e);
        }
        result
    }

    /// Runs the module until it is stopped or fails, emitting heartbeats on
    /// `sink` the whole time. Returns once the final dying heartbeat is out.
    pub async fn run(mut self, sink: Arc<dyn MessageSink>) -> Result<(), ModuleError> {
        if self.ctx.global.set(sink.clone()).is_err() {
            debug!(module = self.ctx.name(), "global sink already set");
        }
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.ctx.state.clone(),
            sink,
            self.heartbeat_interval,
        ));

        let outcome = guarded(self.drive()).await;

        match &outcome {
            Ok(()) => {
                info!(module = self.ctx.name(), "stopping");
                self.ctx.set_last_function("stop");
                if let Err(e) = guarded(self.driver.stop(&self.ctx)).await {
                    warn!(module = self.ctx.name(), error = %e, "stop hook failed");
                    self.ctx.state.lock().error_info = Some(e.to_string());
                }
                self.ctx.state.lock().alive = false;
            }
            Err(e) => {
                error!(module = self.ctx.name(), error = %e, "module crashed");
                self.ctx.state.lock().fail(e);
                if let Err(stop_err) = guarded(self.driver.stop(&self.ctx)).await {
                    warn!(module = self.ctx.name(), error = %stop_err, "stop hook failed after crash");
                }
            }
        }

        if let Err(e) = heartbeat.await {
            warn!(module = self.ctx.name(), error = %e, "heartbeat task ended abnormally");
        }
        outcome
    }

    async fn drive(&mut self) -> Result<(), ModuleError> {
        self.ctx.set_last_function("start");
        self.driver.start(&self.ctx).await?;
        self.ctx.set_last_function("selftest");
        self.driver.selftest()?;

        self.ctx.state.lock().set_status(HeartbeatStatus::Operational);
        info!(module = self.ctx.name(), "operational");

        let mut ticker = self.driver.tick_interval().map(|every| {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        let mut running = self.ctx.running.clone();

        loop {
            if !*running.borrow_and_update() {
                break;
            }
            tokio::select! {
                changed = running.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(inbound) = self.inbox.recv() => match inbound {
                    Inbound::Data(message) => self.driver.handle(&self.ctx, message).await?,
                    Inbound::Global(message) => self.driver.handle_global(&self.ctx, message).await?,
                },
                _ = next_tick(&mut ticker) => self.driver.tick(&self.ctx).await?,
            }
        }
        Ok(())
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Awaits a hook, turning a panic into [`ModuleError::Panicked`].
async fn guarded<F>(hook: F) -> Result<(), ModuleError>
where
    F: std::future::Future<Output = Result<(), ModuleError>>,
{
    match AssertUnwindSafe(hook).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(ModuleError::Panicked(panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}

async fn heartbeat_loop(state: Shared<ModuleState>, sink: Arc<dyn MessageSink>, every: Duration) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let (heartbeat, dying) = {
            let state = state.lock();
            (state.heartbeat(), !state.alive)
        };
        let module = heartbeat.module_name.clone();
        if let Err(e) = sink.send(heartbeat.into_message()) {
            warn!(%module, error = %e, "heartbeat not sent");
        }
        if dying {
            debug!(%module, "final heartbeat sent");
            break;
        }
    }
}
