//! catdog agent: supervises the modules of one device.
//!
//! The agent reads a YAML roster, starts every module in its own
//! `catdog-module` process, follows their heartbeats on the global channel
//! and broadcasts the device health as vibes.

pub mod agent;
pub mod config;
pub mod drivers;
pub mod error;
pub mod health;
pub mod heartbeats;
pub mod launcher;
pub mod registry;
pub mod signals;
pub mod supervisor;

pub use agent::{Agent, ModuleFault};
pub use config::{AgentConfig, ConfigError, ModuleSpec, CONFIG_ENV, DEFAULT_CONFIG_PATH};
pub use error::AgentError;
pub use health::HealthTracker;
pub use heartbeats::{HeartbeatEntry, HeartbeatTable};
pub use registry::{parse_params, ModuleFactory, ModuleRegistry, RegistryError};
pub use supervisor::{LaunchEnv, ModuleProcess};
