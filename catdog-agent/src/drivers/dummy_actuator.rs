use std::path::PathBuf;
use std::time::Duration;

use catdog_core::{
    async_trait, LinkClient, LinkClientHandle, Message, ModuleContext, ModuleDriver, ModuleError,
    RECONNECT_BACKOFF,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::registry::parse_params;

#[derive(Debug, Clone, Deserialize)]
pub struct Upstream {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DummyActuatorParams {
    /// Link server to subscribe to, usually a sensor
    pub upstream: Option<Upstream>,
    /// File that must exist for boot to succeed (stands in for a sound asset)
    pub required_asset: Option<PathBuf>,
    pub playback_ms: u64,
    pub reconnect_ms: Option<u64>,
}

impl Default for DummyActuatorParams {
    fn default() -> Self {
        Self {
            upstream: None,
            required_asset: None,
            playback_ms: 200,
            reconnect_ms: None,
        }
    }
}

/// "Plays a sound" for every `play_sound: true` message it receives, one
/// playback at a time.
pub struct DummyActuator {
    params: DummyActuatorParams,
    client: Option<LinkClientHandle>,
    playback: Option<JoinHandle<()>>,
    played: u64,
}

impl DummyActuator {
    pub const ID: &'static str = "debug.dummy_actuator";

    pub fn new(params: DummyActuatorParams) -> Self {
        Self {
            params,
            client: None,
            playback: None,
            played: 0,
        }
    }

    pub fn from_params(params: Value) -> Result<Box<dyn ModuleDriver>, ModuleError> {
        Ok(Box::new(Self::new(parse_params(params)?)))
    }

    pub fn played(&self) -> u64 {
        self.played
    }
}

/// Annonce sur le canal global : `{event: "played", count, from, payload}`
fn played_event(message: &Message, count: u64) -> Map<String, Value> {
    let mut event = Map::new();
    event.insert("event".into(), Value::from("played"));
    event.insert("count".into(), Value::from(count));
    event.insert("from".into(), Value::from(message.sender()));
    event.insert("payload".into(), Value::Object(message.content().clone()));
    event
}

#[async_trait]
impl ModuleDriver for DummyActuator {
    async fn boot(&mut self, ctx: &ModuleContext) -> Result<(), ModuleError> {
        if let Some(asset) = &self.params.required_asset {
            ctx.set_last_function("checking assets");
            if !tokio::fs::try_exists(asset).await.unwrap_or(false) {
                return Err(ModuleError::Boot(format!("required asset {} not found", asset.display())));
            }
            debug!(module = ctx.name(), asset = %asset.display(), "asset present");
        }
        Ok(())
    }

    async fn start(&mut self, ctx: &ModuleContext) -> Result<(), ModuleError> {
        match &self.params.upstream {
            Some(upstream) => {
                let backoff = self
                    .params
                    .reconnect_ms
                    .map(Duration::from_millis)
                    .unwrap_or(RECONNECT_BACKOFF);
                let client = LinkClient::new(format!("{}:{}", upstream.host, upstream.port))
                    .with_backoff(backoff)
                    .with_observer(ctx.link_observer())
                    .spawn(ctx.data_handler());
                info!(module = ctx.name(), host = %upstream.host, port = upstream.port, "listening upstream");
                self.client = Some(client);
            }
            None => warn!(module = ctx.name(), "no upstream configured, nothing will be played"),
        }
        Ok(())
    }

    async fn handle(&mut self, ctx: &ModuleContext, message: Message) -> Result<(), ModuleError> {
        if message.get("play_sound") != Some(&Value::Bool(true)) {
            debug!(module = ctx.name(), from = message.sender(), "message without play_sound ignored");
            return Ok(());
        }

        let Some(guard) = ctx.begin_processing("playing sound") else {
            info!(module = ctx.name(), from = message.sender(), "already playing, request skipped");
            return Ok(());
        };

        self.played += 1;
        info!(module = ctx.name(), from = message.sender(), played = self.played, "playing sound");
        if let Err(e) = ctx.broadcast_global(played_event(&message, self.played)) {
            warn!(module = ctx.name(), error = %e, "playback not announced");
        }
        let playback = Duration::from_millis(self.params.playback_ms);
        self.playback = Some(tokio::spawn(async move {
            let _guard = guard;
            tokio::time::sleep(playback).await;
        }));
        Ok(())
    }

    async fn stop(&mut self, ctx: &ModuleContext) -> Result<(), ModuleError> {
        if let Some(playback) = self.playback.take() {
            if let Err(e) = playback.await {
                warn!(module = ctx.name(), error = %e, "playback task ended abnormally");
            }
        }
        if let Some(client) = self.client.take() {
            client.join().await;
        }
        info!(module = ctx.name(), played = self.played, "dummy actuator stopped");
        Ok(())
    }
}
