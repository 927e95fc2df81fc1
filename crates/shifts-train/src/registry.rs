//! String-keyed component registries

use serde_yaml::Value;
use shifts_types::{ConfigError, FromParams, Params};
use std::collections::BTreeMap;

type Factory<T> = Box<dyn Fn(Params) -> Result<Box<T>, ConfigError> + Send + Sync>;

/// Closed mapping from type name to a factory for one component domain
pub struct Registry<T: ?Sized> {
    domain: &'static str,
    factories: BTreeMap<&'static str, Factory<T>>,
}

impl<T: ?Sized + 'static> Registry<T> {
    /// Empty registry; `domain` is used in log lines and errors
    pub fn new(domain: &'static str) -> Self {
        Self {
            domain,
            factories: BTreeMap::new(),
        }
    }

    /// Register `C` under `name`; `wrap` boxes it as the domain trait object
    pub fn with<C>(mut self, name: &'static str, wrap: fn(C) -> Box<T>) -> Self
    where
        C: FromParams + 'static,
    {
        let domain = self.domain;
        let factory: Factory<T> = Box::new(move |params| {
            let typed: C::Params = serde_yaml::from_value(Value::Mapping(params)).map_err(
                |source| ConfigError::InvalidParams {
                    domain: domain.to_string(),
                    kind: name.to_string(),
                    source,
                },
            )?;
            Ok(wrap(C::from_params(typed)?))
        });
        self.factories.insert(name, factory);
        self
    }

    pub fn domain(&self) -> &'static str {
        self.domain
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Construct `name` from its params block
    pub fn create(&self, name: &str, params: Params) -> Result<Box<T>, ConfigError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| ConfigError::UnknownType {
                domain: self.domain.to_string(),
                kind: name.to_string(),
            })?;
        factory(params)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }
}
