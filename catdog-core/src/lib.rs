//! catdog core: what every module process and agent shares.
//!
//! - [`message`] / [`heartbeat`]: wire envelope and heartbeat payloads
//! - [`link`]: direct server/client pub-sub between modules
//! - [`relay`]: the global channel every module and agent joins
//! - [`module`]: lifecycle runtime hosting a [`ModuleDriver`]
//! - [`vibes`]: UDP presence broadcast and listener

pub mod error;
mod fanout;
pub mod heartbeat;
pub mod link;
pub mod message;
pub mod module;
pub mod relay;
pub mod state;
pub mod vibes;

pub use error::{LinkError, ModuleError};
pub use heartbeat::{Diagnostics, Heartbeat, HeartbeatError, HeartbeatReport, HeartbeatStatus};
pub use link::{
    ConnectionStatus, LinkClient, LinkClientHandle, LinkObserver, LinkSender, LinkServer, LogSink,
    MessageSink, RECONNECT_BACKOFF,
};
pub use message::{unix_now, Message, MessageError, MessageType};
pub use module::{
    ModuleContext, ModuleDriver, ModuleRuntime, ModuleState, ProcessingGuard, StopHandle,
    HEARTBEAT_INTERVAL, INBOX_CAPACITY,
};
pub use relay::{GlobalChannel, RELAY_PORT};
pub use state::{new_state, snapshot, Shared};
pub use vibes::{Vibe, VibeListener, VibeMap, VibeSender, VibeView, VIBE_INTERVAL, VIBE_PORT};

/// Re-exported so drivers implement [`ModuleDriver`] with the same macro version.
pub use async_trait::async_trait;
