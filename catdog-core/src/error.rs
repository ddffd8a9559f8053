/// Errors raised by the networking side of catdog (links, global channel, vibes)
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed message: {0}")]
    Malformed(#[from] crate::message::MessageError),
    #[error("outbound queue full, message dropped")]
    QueueFull,
    #[error("link closed")]
    Closed,
}

/// Errors raised by a module driver or by the runtime that hosts it
#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    #[error("boot failed: {0}")]
    Boot(String),
    #[error("start failed: {0}")]
    Start(String),
    #[error("selftest failed: {0}")]
    Selftest(String),
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
    #[error("{0}")]
    Runtime(String),
    #[error("panicked: {0}")]
    Panicked(String),
    #[error("link error: {0}")]
    Link(#[from] LinkError),
}

impl ModuleError {
    pub fn runtime(msg: impl std::fmt::Display) -> Self {
        ModuleError::Runtime(msg.to_string())
    }
}
