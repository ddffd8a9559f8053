//! Drivers de debug : exercent le substrat sans matériel.

mod dummy_actuator;
mod dummy_sensor;

pub use dummy_actuator::{DummyActuator, DummyActuatorParams, Upstream};
pub use dummy_sensor::{DummySensor, DummySensorParams};
