/**
 * VIBES - Network-wide presence over UDP broadcast
 *
 * ROLE : `VibeSender` periodically shouts a `{device_name, timestamp, health,
 * uptime}` datagram; `VibeListener` keeps the latest one per device.
 *
 * BEST EFFORT : no ack, no retry. Listener entries are only ever overwritten,
 * views flag them `stale` after three missed intervals.
 */

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{lookup_host, ToSocketAddrs, UdpSocket};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::LinkError;
use crate::message::unix_now;
use crate::state::{new_state, Shared};

pub const VIBE_PORT: u16 = 30303;
pub const VIBE_INTERVAL: Duration = Duration::from_secs(5);

/// Missed intervals before an entry is reported stale
const STALE_AFTER_INTERVALS: u32 = 3;
const MAX_DATAGRAM: usize = 8192;

pub type HealthFn = Arc<dyn Fn() -> Map<String, Value> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vibe {
    #[serde(default = "unknown_device")]
    pub device_name: String,
    #[serde(default)]
    pub timestamp: f64,
    #[serde(default)]
    pub health: Map<String, Value>,
    #[serde(default)]
    pub uptime: f64,
}

fn unknown_device() -> String {
    "unknown".into()
}

pub struct VibeSender {
    device_name: String,
    health: HealthFn,
    target: SocketAddr,
    every: Duration,
    started: Instant,
}

impl VibeSender {
    pub fn new<F>(device_name: impl Into<String>, health: F) -> Self
    where
        F: Fn() -> Map<String, Value> + Send + Sync + 'static,
    {
        Self {
            device_name: device_name.into(),
            health: Arc::new(health),
            target: SocketAddr::from((Ipv4Addr::BROADCAST, VIBE_PORT)),
            every: VIBE_INTERVAL,
            started: Instant::now(),
        }
    }

    pub fn with_target(mut self, target: SocketAddr) -> Self {
        self.target = target;
        self
    }

    pub fn with_interval(mut self, every: Duration) -> Self {
        self.every = every;
        self
    }

    pub fn snapshot(&self) -> Vibe {
        Vibe {
            device_name: self.device_name.clone(),
            timestamp: unix_now(),
            health: (self.health)(),
            uptime: self.started.elapsed().as_secs_f64(),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), LinkError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.set_broadcast(true)?;
        info!(device = %self.device_name, target = %self.target, every = ?self.every, "[vibes] broadcasting");

        let mut ticker = interval(self.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let payload = match serde_json::to_vec(&self.snapshot()) {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!(error = %e, "[vibes] snapshot not serializable");
                            continue;
                        }
                    };
                    if let Err(e) = socket.send_to(&payload, self.target).await {
                        debug!(target = %self.target, error = %e, "[vibes] send failed");
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct VibeEntry {
    vibe: Vibe,
    received_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VibeView {
    pub device_name: String,
    pub timestamp: f64,
    pub health: Map<String, Value>,
    pub uptime: f64,
    pub stale: bool,
    pub age_seconds: f64,
}

/// Shared view on the listener's device map.
#[derive(Clone)]
pub struct VibeMap {
    entries: Shared<HashMap<String, VibeEntry>>,
    stale_after: Duration,
}

impl VibeMap {
    pub fn new(broadcast_interval: Duration) -> Self {
        Self {
            entries: new_state(HashMap::new()),
            stale_after: broadcast_interval * STALE_AFTER_INTERVALS,
        }
    }

    /// Replaces whatever was known about the device.
    pub fn record(&self, vibe: Vibe) {
        let entry = VibeEntry {
            vibe,
            received_at: Instant::now(),
        };
        self.entries.lock().insert(entry.vibe.device_name.clone(), entry);
    }

    pub fn get(&self, device_name: &str) -> Option<Vibe> {
        self.entries.lock().get(device_name).map(|e| e.vibe.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn views(&self) -> Vec<VibeView> {
        let mut views: Vec<VibeView> = self
            .entries
            .lock()
            .values()
            .map(|e| {
                let age = e.received_at.elapsed();
                VibeView {
                    device_name: e.vibe.device_name.clone(),
                    timestamp: e.vibe.timestamp,
                    health: e.vibe.health.clone(),
                    uptime: e.vibe.uptime,
                    stale: age > self.stale_after,
                    age_seconds: age.as_secs_f64(),
                }
            })
            .collect();
        views.sort_by(|a, b| a.device_name.cmp(&b.device_name));
        views
    }
}

fn reusable_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

pub struct VibeListener {
    socket: UdpSocket,
    map: VibeMap,
}

impl VibeListener {
    /// Binds with `SO_REUSEADDR` so several agents on one host can listen
    /// on the vibes port.
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self, LinkError> {
        let addr = lookup_host(addr).await?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "no address to bind the vibe listener")
        })?;
        let socket = reusable_udp(addr)?;
        Ok(Self {
            socket,
            map: VibeMap::new(VIBE_INTERVAL),
        })
    }

    /// Interval the senders are expected to use, drives the stale flag.
    pub fn with_interval(mut self, every: Duration) -> Self {
        self.map.stale_after = every * STALE_AFTER_INTERVALS;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, LinkError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn map(&self) -> VibeMap {
        self.map.clone()
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        info!(addr = ?self.socket.local_addr().ok(), "[vibes] listening");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => match serde_json::from_slice::<Vibe>(&buf[..len]) {
                        Ok(vibe) => {
                            debug!(%from, device = %vibe.device_name, "[vibes] received");
                            self.map.record(vibe);
                        }
                        Err(e) => warn!(%from, error = %e, "[vibes] dropping unparsable datagram"),
                    },
                    Err(e) => warn!(error = %e, "[vibes] receive failed"),
                }
            }
        }
    }
}
