//! Global channel: a TCP relay that echoes every message it receives to all
//! connected clients, the sender included. Consumers filter on `sender`.

use std::net::SocketAddr;

use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::LinkError;
use crate::fanout::{accept_loop, Fanout};
use crate::message::Message;

/// Default relay port
pub const RELAY_PORT: u16 = 9000;

pub struct GlobalChannel {
    local_addr: SocketAddr,
    fanout: Fanout,
    shutdown: watch::Sender<bool>,
}

impl GlobalChannel {
    pub async fn start(addr: impl ToSocketAddrs) -> Result<Self, LinkError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let fanout = Fanout::new("global-channel");
        let (shutdown, rx) = watch::channel(false);

        tokio::spawn(accept_loop(listener, fanout.clone(), rx, relay_line));

        info!(%local_addr, "[global] relay listening");
        Ok(Self {
            local_addr,
            fanout,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn client_count(&self) -> usize {
        self.fanout.len()
    }

    pub fn shutdown(&self) {
        if !self.shutdown.send_replace(true) {
            info!(local_addr = %self.local_addr, "[global] relay shutting down");
        }
        self.fanout.clear();
    }
}

impl Drop for GlobalChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn relay_line(fanout: &Fanout, peer: SocketAddr, line: &str) {
    match Message::from_frame(line) {
        Ok(message) => {
            let delivered = fanout.broadcast(line.trim());
            debug!(%peer, sender = message.sender(), kind = ?message.kind(), delivered, "[global] relayed");
        }
        Err(e) => warn!(%peer, error = %e, "[global] dropping malformed frame"),
    }
}
