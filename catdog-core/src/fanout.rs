//! Subscriber fan-out shared by the link server and the global channel.
//!
//! Every accepted connection gets its own bounded queue and writer task, so a
//! slow or dead subscriber only loses its own frames. Membership changes only
//! when a connection is attached or its read side reports a close; delivery
//! never touches the set.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::state::{new_state, Shared};

/// Frames buffered per subscriber before new ones get dropped
const SUBSCRIBER_QUEUE: usize = 256;

pub(crate) type SubscriberId = u64;

struct Subscriber {
    peer: SocketAddr,
    tx: mpsc::Sender<Arc<str>>,
}

#[derive(Clone)]
pub(crate) struct Fanout {
    component: &'static str,
    next_id: Arc<AtomicU64>,
    subscribers: Shared<HashMap<SubscriberId, Subscriber>>,
}

impl Fanout {
    pub(crate) fn new(component: &'static str) -> Self {
        Self {
            component,
            next_id: Arc::new(AtomicU64::new(1)),
            subscribers: new_state(HashMap::new()),
        }
    }

    pub(crate) fn attach(&self, peer: SocketAddr, writer: OwnedWriteHalf) -> SubscriberId {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().insert(id, Subscriber { peer, tx });
        tokio::spawn(write_frames(self.component, peer, writer, rx));
        id
    }

    pub(crate) fn detach(&self, id: SubscriberId) -> bool {
        self.subscribers.lock().remove(&id).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Drops every subscriber; writer tasks end and the peers see EOF.
    pub(crate) fn clear(&self) {
        self.subscribers.lock().clear();
    }

    /// Queues `frame` (without newline) for every subscriber, returns how many accepted it.
    pub(crate) fn broadcast(&self, frame: &str) -> usize {
        let line: Arc<str> = Arc::from(format!("{frame}\n"));

        // Snapshot under the lock, deliver outside of it
        let targets: Vec<(SocketAddr, mpsc::Sender<Arc<str>>)> = self
            .subscribers
            .lock()
            .values()
            .map(|s| (s.peer, s.tx.clone()))
            .collect();

        let mut delivered = 0;
        for (peer, tx) in targets {
            match tx.try_send(line.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(component = self.component, %peer, "subscriber queue full, frame dropped");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(component = self.component, %peer, "subscriber writer gone, awaiting disconnect");
                }
            }
        }
        delivered
    }
}

async fn write_frames(
    component: &'static str,
    peer: SocketAddr,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Arc<str>>,
) {
    while let Some(line) = rx.recv().await {
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            warn!(component, %peer, error = %e, "send to subscriber failed");
            break;
        }
    }
}

/// Accepts connections until `shutdown` flips, handing each one to [`serve_connection`].
pub(crate) async fn accept_loop<F>(
    listener: TcpListener,
    fanout: Fanout,
    mut shutdown: watch::Receiver<bool>,
    on_line: F,
) where
    F: Fn(&Fanout, SocketAddr, &str) + Clone + Send + Sync + 'static,
{
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(serve_connection(
                        stream,
                        peer,
                        fanout.clone(),
                        shutdown.clone(),
                        on_line.clone(),
                    ));
                }
                Err(e) => {
                    warn!(component = fanout.component, error = %e, "accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }
    debug!(component = fanout.component, "accept loop stopped");
}

/// Registers the connection as a subscriber and reads its lines until the
/// peer half-closes, then removes it from the set.
pub(crate) async fn serve_connection<F>(
    stream: TcpStream,
    peer: SocketAddr,
    fanout: Fanout,
    mut shutdown: watch::Receiver<bool>,
    on_line: F,
) where
    F: Fn(&Fanout, SocketAddr, &str),
{
    let (reader, writer) = stream.into_split();
    let id = fanout.attach(peer, writer);
    info!(component = fanout.component, %peer, subscribers = fanout.len(), "client connected");

    let mut lines = BufReader::new(reader).lines();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !line.trim().is_empty() {
                        on_line(&fanout, peer, &line);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(component = fanout.component, %peer, error = %e, "read failed");
                    break;
                }
            }
        }
    }

    fanout.detach(id);
    info!(component = fanout.component, %peer, subscribers = fanout.len(), "client disconnected");
}
