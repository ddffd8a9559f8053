/*!
Mock relay outlet pour tests sans réseau

Stands in for the global channel: every message a module sends is recorded,
and tests assert on heartbeats or data afterwards.
*/

use std::sync::Arc;

use catdog_core::{
    snapshot, ConnectionStatus, HeartbeatReport, LinkError, LinkObserver, Message, MessageSink, Shared,
};

#[derive(Clone, Default)]
pub struct MockSink {
    sent: Shared<Vec<Message>>,
    refuse: Shared<bool>,
}

impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ready to hand to `ModuleRuntime::run`.
    pub fn shared(&self) -> Arc<dyn MessageSink> {
        Arc::new(self.clone())
    }

    /// Makes every following `send` fail with `QueueFull` (still recorded).
    pub fn refuse_sends(&self, refuse: bool) {
        *self.refuse.lock() = refuse;
    }

    pub fn messages(&self) -> Vec<Message> {
        snapshot(&self.sent)
    }

    pub fn data_messages(&self) -> Vec<Message> {
        self.sent.lock().iter().filter(|m| !m.is_heartbeat()).cloned().collect()
    }

    /// Heartbeats decoded as a consumer would see them.
    pub fn heartbeats(&self) -> Vec<HeartbeatReport> {
        self.sent
            .lock()
            .iter()
            .filter_map(|m| HeartbeatReport::from_message(m).ok())
            .collect()
    }

    pub fn heartbeat_messages(&self) -> Vec<Message> {
        self.sent.lock().iter().filter(|m| m.is_heartbeat()).cloned().collect()
    }

    pub fn dying_count(&self) -> usize {
        self.heartbeats().iter().filter(|h| h.dying).count()
    }

    pub fn last_heartbeat(&self) -> Option<HeartbeatReport> {
        self.heartbeats().pop()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

impl MessageSink for MockSink {
    fn send(&self, message: Message) -> Result<(), LinkError> {
        self.sent.lock().push(message);
        if *self.refuse.lock() {
            return Err(LinkError::QueueFull);
        }
        Ok(())
    }
}

/// Records every status a link client reports.
#[derive(Clone, Default)]
pub struct RecordingObserver {
    seen: Shared<Vec<ConnectionStatus>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(&self) -> Arc<dyn LinkObserver> {
        Arc::new(self.clone())
    }

    pub fn statuses(&self) -> Vec<ConnectionStatus> {
        snapshot(&self.seen)
    }

    pub fn last(&self) -> Option<ConnectionStatus> {
        self.seen.lock().last().copied()
    }
}

impl LinkObserver for RecordingObserver {
    fn on_status(&self, status: ConnectionStatus) {
        self.seen.lock().push(status);
    }
}
