//! Wiring of a module process to the global channel.

use std::sync::Arc;

use catdog_core::{LinkClient, LinkClientHandle, MessageSink, ModuleContext};
use tracing::info;

/// File d'envoi vers le relay (heartbeats + messages globaux)
pub const OUTBOUND_CAPACITY: usize = 64;

/// Connects the module to the relay at `addr`: returns the sink for
/// heartbeats and `broadcast_global`, and the client feeding `handle_global`.
///
/// The relay client carries no link observer, `connected` in heartbeats
/// only reflects the module's own data links.
pub fn join_global_channel(ctx: &ModuleContext, addr: &str) -> (Arc<dyn MessageSink>, LinkClientHandle) {
    let mut client = LinkClient::new(addr);
    let sender = client.sender(OUTBOUND_CAPACITY);
    info!(module = ctx.name(), relay = %addr, "joining global channel");
    (Arc::new(sender), client.spawn(ctx.global_handler()))
}
