//! A station: the set of parameters known to the process.
//!
//! Metadata import resolves parameter identities against a station, the
//! same way live handles are resolved against the instrument rack that
//! produced an exported configuration.

use crate::error::{Result, SweepError};
use crate::parameter::Parameter;
use std::collections::BTreeMap;

/// Registry of parameters keyed by qualified identity (`instrument.name`).
#[derive(Default)]
pub struct Station {
    parameters: BTreeMap<String, Parameter>,
}

impl Station {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parameter. Replaces any previous entry with the same
    /// qualified identity.
    pub fn add(&mut self, parameter: Parameter) -> &mut Self {
        self.parameters.insert(parameter.key(), parameter);
        self
    }

    /// Register every parameter of an instrument at once.
    pub fn add_all(&mut self, parameters: impl IntoIterator<Item = Parameter>) -> &mut Self {
        for p in parameters {
            self.add(p);
        }
        self
    }

    /// Look up by qualified identity, e.g. `"dac.voltage"`.
    pub fn get(&self, key: &str) -> Option<&Parameter> {
        self.parameters.get(key)
    }

    /// Resolve a qualified identity or fail with a configuration error
    /// naming the missing parameter.
    pub fn resolve(&self, key: &str) -> Result<Parameter> {
        self.get(key).cloned().ok_or_else(|| {
            SweepError::config(format!("parameter {key} not found in station"))
        })
    }

    /// All parameters owned by `instrument`.
    pub fn instrument(&self, instrument: &str) -> Vec<&Parameter> {
        self.parameters
            .values()
            .filter(|p| p.instrument() == instrument)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(name: &str, instrument: &str) -> Parameter {
        Parameter::builder(name, instrument).getter(|| Ok(0.0)).build()
    }

    #[test]
    fn resolve_by_qualified_key() {
        let mut station = Station::new();
        station.add(param("voltage", "dac"));
        station.add(param("current", "meter"));

        assert!(station.resolve("dac.voltage").is_ok());
        assert!(station.resolve("meter.current").is_ok());
        let err = station.resolve("dac.missing").unwrap_err();
        assert!(err.to_string().contains("dac.missing"));
    }

    #[test]
    fn instrument_listing() {
        let mut station = Station::new();
        station.add_all([param("v1", "dac"), param("v2", "dac"), param("i", "meter")]);
        assert_eq!(station.instrument("dac").len(), 2);
        assert_eq!(station.len(), 3);
    }
}
