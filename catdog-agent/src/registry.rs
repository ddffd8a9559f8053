/**
 * MODULE REGISTRY - Table identifiant stable -> constructeur de driver
 *
 * ROLE : Le roster et le launcher désignent un module par un identifiant
 * (`debug.dummy_sensor`), jamais par un chemin de type. Le registre est
 * rempli au démarrage ; un identifiant inconnu est une erreur d'invocation.
 */

use std::collections::BTreeMap;

use catdog_core::{ModuleDriver, ModuleError};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::drivers::{DummyActuator, DummySensor};

pub type ModuleFactory = fn(Value) -> Result<Box<dyn ModuleDriver>, ModuleError>;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown module id '{0}'")]
    UnknownModule(String),
    #[error(transparent)]
    Params(#[from] ModuleError),
}

#[derive(Clone, Default)]
pub struct ModuleRegistry {
    factories: BTreeMap<&'static str, ModuleFactory>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registre avec les drivers livrés avec catdog
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(DummySensor::ID, DummySensor::from_params);
        registry.register(DummyActuator::ID, DummyActuator::from_params);
        registry
    }

    pub fn register(&mut self, id: &'static str, factory: ModuleFactory) {
        self.factories.insert(id, factory);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    pub fn create(&self, id: &str, params: Value) -> Result<Box<dyn ModuleDriver>, RegistryError> {
        let factory = self
            .factories
            .get(id)
            .ok_or_else(|| RegistryError::UnknownModule(id.to_string()))?;
        Ok(factory(params)?)
    }
}

/// Décode les paramètres JSON d'un driver ; `null` vaut `{}`.
pub fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, ModuleError> {
    let params = if params.is_null() {
        Value::Object(Default::default())
    } else {
        params
    };
    serde_json::from_value(params).map_err(|e| ModuleError::InvalidParams(e.to_string()))
}
