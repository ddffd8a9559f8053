use std::net::SocketAddr;

use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::LinkError;
use crate::fanout::{accept_loop, Fanout};
use crate::message::Message;

/// Publishing side of a direct link.
///
/// Subscribers only listen: anything they write is read (so a half-close is
/// noticed) and discarded.
pub struct LinkServer {
    local_addr: SocketAddr,
    fanout: Fanout,
    shutdown: watch::Sender<bool>,
}

impl LinkServer {
    /// Binds `addr` and starts accepting subscribers in the background.
    pub async fn start(addr: impl ToSocketAddrs) -> Result<Self, LinkError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let fanout = Fanout::new("link-server");
        let (shutdown, rx) = watch::channel(false);

        tokio::spawn(accept_loop(listener, fanout.clone(), rx, |_: &Fanout, peer: SocketAddr, line: &str| {
            debug!(%peer, bytes = line.len(), "ignoring inbound line from subscriber");
        }));

        info!(%local_addr, "[link-server] listening");
        Ok(Self {
            local_addr,
            fanout,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn subscriber_count(&self) -> usize {
        self.fanout.len()
    }

    /// Sends `message` to every live subscriber and returns how many got it queued.
    pub fn broadcast(&self, message: &Message) -> Result<usize, LinkError> {
        let frame = message.to_frame()?;
        Ok(self.fanout.broadcast(&frame))
    }

    /// Stops accepting and disconnects every subscriber.
    pub fn shutdown(&self) {
        if !self.shutdown.send_replace(true) {
            info!(local_addr = %self.local_addr, "[link-server] shutting down");
        }
        self.fanout.clear();
    }
}

impl Drop for LinkServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
