//! Self-describing sweep metadata records.
//!
//! Every sweep can export a JSON record describing its kind, attributes,
//! controlled parameters and follow set. The record round-trips: importing
//! it against a [`Station`](crate::station::Station) holding the same
//! parameters and exporting again yields the identical document (serde_json
//! keeps object keys sorted, so the encoding is canonical).

use crate::error::{Result, SweepError};
use crate::parameter::Parameter;
use crate::sweep::trajectory::Trajectory;
use serde_json::{json, Map, Value};

/// Builder for the exported metadata record.
pub struct MetadataRecord {
    kind: &'static str,
    attributes: Map<String, Value>,
    controlled: Option<Map<String, Value>>,
    followed: Map<String, Value>,
}

impl MetadataRecord {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            attributes: Map::new(),
            controlled: None,
            followed: Map::new(),
        }
    }

    /// Add one attribute value (delays, flags, multipliers, ...).
    pub fn attribute(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    /// Record a controlled parameter together with its trajectory.
    pub fn controlled(mut self, parameter: &Parameter, trajectory: &Trajectory) -> Self {
        let entry = json!({
            "instrument": parameter.instrument(),
            "name": parameter.name(),
            "unit": parameter.unit(),
            "start": trajectory.start,
            "stop": trajectory.stop,
            "step": trajectory.step,
        });
        self.controlled
            .get_or_insert_with(Map::new)
            .insert(parameter.key(), entry);
        self
    }

    /// Record one followed parameter.
    pub fn followed(mut self, parameter: &Parameter) -> Self {
        self.followed.insert(
            parameter.key(),
            Value::String(parameter.instrument().to_string()),
        );
        self
    }

    /// Finish the record.
    pub fn build(self) -> Value {
        json!({
            "kind": self.kind,
            "module": module_name(),
            "attributes": Value::Object(self.attributes),
            "controlled": match self.controlled {
                Some(map) => Value::Object(map),
                None => Value::Null,
            },
            "followed": Value::Object(self.followed),
        })
    }
}

fn module_name() -> &'static str {
    concat!(env!("CARGO_PKG_NAME"), "::sweep")
}

/// Typed view over an imported metadata record.
pub struct MetadataReader<'a> {
    value: &'a Value,
}

impl<'a> MetadataReader<'a> {
    pub fn new(value: &'a Value) -> Result<Self> {
        if !value.is_object() {
            return Err(SweepError::config("metadata record must be a JSON object"));
        }
        for key in ["kind", "module", "attributes", "followed"] {
            if value.get(key).is_none() {
                return Err(SweepError::config(format!(
                    "metadata record is missing the '{key}' key"
                )));
            }
        }
        Ok(Self { value })
    }

    pub fn kind(&self) -> Result<&str> {
        self.value
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| SweepError::config("metadata 'kind' must be a string"))
    }

    pub fn attr_f64(&self, key: &str) -> Option<f64> {
        self.value.get("attributes")?.get(key)?.as_f64()
    }

    pub fn attr_bool(&self, key: &str) -> Option<bool> {
        self.value.get("attributes")?.get(key)?.as_bool()
    }

    pub fn attr_u64(&self, key: &str) -> Option<u64> {
        self.value.get("attributes")?.get(key)?.as_u64()
    }

    pub fn attr_str(&self, key: &str) -> Option<String> {
        self.value
            .get("attributes")?
            .get(key)?
            .as_str()
            .map(str::to_string)
    }

    /// Controlled entries as `(qualified_key, start, stop, step)` in key
    /// order.
    pub fn controlled(&self) -> Result<Vec<ControlledEntry>> {
        let mut out = Vec::new();
        match self.value.get("controlled") {
            None | Some(Value::Null) => {}
            Some(Value::Object(map)) => {
                for (key, entry) in map {
                    let get = |field: &str| -> Result<f64> {
                        entry.get(field).and_then(Value::as_f64).ok_or_else(|| {
                            SweepError::config(format!(
                                "controlled entry {key} is missing '{field}'"
                            ))
                        })
                    };
                    out.push(ControlledEntry {
                        key: key.clone(),
                        start: get("start")?,
                        stop: get("stop")?,
                        step: get("step")?,
                    });
                }
            }
            Some(_) => {
                return Err(SweepError::config(
                    "metadata 'controlled' must be an object or null",
                ))
            }
        }
        Ok(out)
    }

    /// Qualified keys of the follow set, in key order.
    pub fn followed(&self) -> Result<Vec<String>> {
        match self.value.get("followed") {
            Some(Value::Object(map)) => Ok(map.keys().cloned().collect()),
            _ => Err(SweepError::config("metadata 'followed' must be an object")),
        }
    }
}

/// One controlled-parameter line of a metadata record.
#[derive(Debug, Clone)]
pub struct ControlledEntry {
    pub key: String,
    pub start: f64,
    pub stop: f64,
    pub step: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sweep::trajectory::SweepMode;

    fn param(name: &str, instrument: &str) -> Parameter {
        Parameter::builder(name, instrument)
            .unit("V")
            .getter(|| Ok(0.0))
            .build()
    }

    #[test]
    fn record_has_required_top_level_keys() {
        let p = param("voltage", "dac");
        let t = Trajectory::new(0.0, 1.0, 0.1, SweepMode::OneShot).unwrap();
        let record = MetadataRecord::new("Sweep1D")
            .attribute("inter_delay", 0.01)
            .controlled(&p, &t)
            .followed(&param("current", "meter"))
            .build();

        for key in ["kind", "module", "attributes", "controlled", "followed"] {
            assert!(record.get(key).is_some(), "missing key {key}");
        }
        assert_eq!(record["kind"], "Sweep1D");
        assert_eq!(record["controlled"]["dac.voltage"]["step"], 0.1);
        assert_eq!(record["followed"]["meter.current"], "meter");
    }

    #[test]
    fn time_only_record_has_null_controlled() {
        let record = MetadataRecord::new("Sweep0D")
            .attribute("max_time", 10.0)
            .build();
        assert!(record["controlled"].is_null());
    }

    #[test]
    fn reader_rejects_missing_keys() {
        let bad = json!({"kind": "Sweep1D"});
        assert!(MetadataReader::new(&bad).is_err());
    }

    #[test]
    fn reader_extracts_controlled_entries() {
        let p = param("voltage", "dac");
        let t = Trajectory::new(1.0, -1.0, 0.25, SweepMode::Bidirectional).unwrap();
        let record = MetadataRecord::new("Sweep1D").controlled(&p, &t).build();

        let reader = MetadataReader::new(&record).unwrap();
        let entries = reader.controlled().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, "dac.voltage");
        assert_eq!(entries[0].start, 1.0);
        assert_eq!(entries[0].step, -0.25);
    }
}
