use std::time::Duration;

use catdog_core::{async_trait, LinkServer, Message, ModuleContext, ModuleDriver, ModuleError};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::registry::parse_params;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DummySensorParams {
    pub host: String,
    pub port: u16,
    /// Fake reading sent in every message
    pub value: i64,
    pub interval_ms: u64,
    /// Stop emitting after this many readings
    pub max_messages: Option<u64>,
}

impl Default for DummySensorParams {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 9100,
            value: 42,
            interval_ms: 5000,
            max_messages: None,
        }
    }
}

/// Publishes `{"value": .., "play_sound": true}` on its link server at a
/// fixed pace, as long as somebody listens.
pub struct DummySensor {
    params: DummySensorParams,
    server: Option<LinkServer>,
    sent: u64,
}

impl DummySensor {
    pub const ID: &'static str = "debug.dummy_sensor";

    pub fn new(params: DummySensorParams) -> Self {
        Self {
            params,
            server: None,
            sent: 0,
        }
    }

    pub fn from_params(params: Value) -> Result<Box<dyn ModuleDriver>, ModuleError> {
        Ok(Box::new(Self::new(parse_params(params)?)))
    }

    fn reading(&self, ctx: &ModuleContext) -> Result<Message, ModuleError> {
        Message::data_from_value(ctx.name(), json!({"value": self.params.value, "play_sound": true}))
            .map_err(ModuleError::runtime)
    }
}

#[async_trait]
impl ModuleDriver for DummySensor {
    async fn start(&mut self, ctx: &ModuleContext) -> Result<(), ModuleError> {
        let addr = format!("{}:{}", self.params.host, self.params.port);
        let server = LinkServer::start(addr.as_str())
            .await
            .map_err(|e| ModuleError::Start(format!("link server on {addr}: {e}")))?;
        info!(module = ctx.name(), addr = %server.local_addr(), "dummy sensor serving");
        self.server = Some(server);
        Ok(())
    }

    fn selftest(&self) -> Result<(), ModuleError> {
        match self.server {
            Some(_) => Ok(()),
            None => Err(ModuleError::Selftest("link server not running".into())),
        }
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(Duration::from_millis(self.params.interval_ms.max(1)))
    }

    async fn tick(&mut self, ctx: &ModuleContext) -> Result<(), ModuleError> {
        if self.params.max_messages.is_some_and(|max| self.sent >= max) {
            return Ok(());
        }
        let Some(server) = &self.server else {
            return Err(ModuleError::runtime("link server vanished"));
        };
        if server.subscriber_count() == 0 {
            debug!(module = ctx.name(), "no subscriber, reading skipped");
            return Ok(());
        }

        ctx.set_last_function("capturing dummy data");
        let message = self.reading(ctx)?;
        let delivered = server.broadcast(&message)?;
        self.sent += 1;
        info!(module = ctx.name(), delivered, sent = self.sent, "reading emitted");
        Ok(())
    }

    async fn stop(&mut self, ctx: &ModuleContext) -> Result<(), ModuleError> {
        if let Some(server) = self.server.take() {
            server.shutdown();
        }
        info!(module = ctx.name(), sent = self.sent, "dummy sensor stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_defaults_and_overrides() {
        let params: DummySensorParams = parse_params(json!({"port": 9200, "max_messages": 1})).unwrap();
        assert_eq!(params.port, 9200);
        assert_eq!(params.value, 42);
        assert_eq!(params.interval_ms, 5000);
        assert_eq!(params.max_messages, Some(1));
    }

    #[test]
    fn test_unknown_params_are_rejected() {
        assert!(parse_params::<DummySensorParams>(json!({"colour": "red"})).is_err());
    }

    #[test]
    fn test_selftest_requires_server() {
        let sensor = DummySensor::new(DummySensorParams::default());
        assert!(matches!(sensor.selftest(), Err(ModuleError::Selftest(_))));
    }
}
