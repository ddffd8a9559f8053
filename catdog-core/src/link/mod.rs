/**
 * LINK - Direct publish/subscribe between modules
 *
 * ROLE : `LinkServer` fans a module's output out to every subscriber,
 * `LinkClient` keeps one connection to a server alive forever and hands
 * each decoded message to its owner.
 *
 * SEAMS : `LinkObserver` lets the owning module track connectivity,
 * `MessageSink` is where heartbeats and global broadcasts are pushed.
 */

mod client;
mod server;

pub use client::{LinkClient, LinkClientHandle, LinkSender, RECONNECT_BACKOFF};
pub use server::LinkServer;

use serde::Serialize;
use tracing::info;

use crate::error::LinkError;
use crate::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Lost,
}

/// Receives `connected`/`lost` transitions from a [`LinkClient`].
pub trait LinkObserver: Send + Sync {
    fn on_status(&self, status: ConnectionStatus);
}

impl<F> LinkObserver for F
where
    F: Fn(ConnectionStatus) + Send + Sync,
{
    fn on_status(&self, status: ConnectionStatus) {
        self(status)
    }
}

/// Non-blocking outlet for outgoing messages.
pub trait MessageSink: Send + Sync {
    fn send(&self, message: Message) -> Result<(), LinkError>;
}

/// Sink used when no relay is configured: messages only reach the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl MessageSink for LogSink {
    fn send(&self, message: Message) -> Result<(), LinkError> {
        let content = serde_json::Value::Object(message.content().clone());
        info!(sender = message.sender(), kind = ?message.kind(), %content, "[no relay] outgoing message");
        Ok(())
    }
}
