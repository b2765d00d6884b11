//! Parameter binding: a uniform read/write handle over instrument channels.
//!
//! A [`Parameter`] is a cheap, cloneable handle to one channel of an
//! instrument. The instrument owns the channel; the sweep engine only holds
//! the handle. Reads and writes go through closures supplied at
//! construction so any driver can be bound without the engine knowing its
//! transport.
//!
//! # Example
//!
//! ```rust,ignore
//! let gate = Parameter::builder("voltage", "dac")
//!     .unit("V")
//!     .label("Gate voltage")
//!     .range(-2.0, 2.0)
//!     .getter(move || Ok(dac.read_channel(0)?))
//!     .setter(move |v| Ok(dac.write_channel(0, v)?))
//!     .build();
//! ```

use crate::error::{ParameterError, ParameterErrorKind, Result};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Closure signature for reading the current value from the instrument.
pub type GetFn = dyn Fn() -> std::result::Result<f64, String> + Send + Sync;
/// Closure signature for writing a value to the instrument.
pub type SetFn = dyn Fn(f64) -> std::result::Result<(), String> + Send + Sync;

/// Wait before the single `get` retry.
const GET_RETRY_DELAY: Duration = Duration::from_secs(1);

struct ParameterInner {
    name: String,
    instrument: String,
    unit: String,
    label: Option<String>,
    range: Option<(f64, f64)>,
    getter: Option<Arc<GetFn>>,
    setter: Option<Arc<SetFn>>,
}

/// Handle to one instrument channel.
///
/// Equality and hashing use the qualified identity `instrument.name`, which
/// must be unique within a station.
#[derive(Clone)]
pub struct Parameter {
    inner: Arc<ParameterInner>,
}

impl Parameter {
    /// Start building a parameter owned by `instrument`.
    pub fn builder(name: impl Into<String>, instrument: impl Into<String>) -> ParameterBuilder {
        ParameterBuilder {
            name: name.into(),
            instrument: instrument.into(),
            unit: String::new(),
            label: None,
            range: None,
            getter: None,
            setter: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Name of the owning instrument.
    pub fn instrument(&self) -> &str {
        &self.inner.instrument
    }

    pub fn unit(&self) -> &str {
        &self.inner.unit
    }

    /// Display label, falling back to the parameter name.
    pub fn label(&self) -> &str {
        self.inner.label.as_deref().unwrap_or(&self.inner.name)
    }

    pub fn range(&self) -> Option<(f64, f64)> {
        self.inner.range
    }

    /// Qualified identity, `instrument.name`.
    pub fn key(&self) -> String {
        format!("{}.{}", self.inner.instrument, self.inner.name)
    }

    /// Whether this parameter can be written.
    pub fn is_settable(&self) -> bool {
        self.inner.setter.is_some()
    }

    fn get_once(&self) -> std::result::Result<f64, String> {
        match &self.inner.getter {
            Some(getter) => getter(),
            None => Err("parameter has no get capability".to_string()),
        }
    }

    /// Read the parameter, retrying once after a 1 s pause.
    ///
    /// Reads are assumed side-effect free, so one retry is safe. The retry
    /// delay gives flaky busses a chance to settle, matching typical
    /// instrument recovery times.
    pub fn safe_get(&self) -> Result<f64> {
        match self.get_once() {
            Ok(v) => Ok(v),
            Err(first) => {
                log::warn!(
                    "read of {} failed ({}), retrying in {:?}",
                    self.key(),
                    first,
                    GET_RETRY_DELAY
                );
                std::thread::sleep(GET_RETRY_DELAY);
                self.get_once().map_err(|cause| {
                    ParameterError {
                        kind: ParameterErrorKind::Get,
                        parameter: self.key(),
                        value: None,
                        cause,
                    }
                    .into()
                })
            }
        }
    }

    /// Write the parameter. No retry: a failed set may already have moved
    /// the instrument, so the decision to re-issue belongs to the caller.
    pub fn safe_set(&self, value: f64) -> Result<()> {
        let fail = |cause: String| ParameterError {
            kind: ParameterErrorKind::Set,
            parameter: self.key(),
            value: Some(value),
            cause,
        };

        if let Some((lo, hi)) = self.inner.range {
            if value < lo || value > hi {
                return Err(fail(format!("value outside range [{}, {}]", lo, hi)).into());
            }
        }
        match &self.inner.setter {
            Some(setter) => setter(value).map_err(|cause| fail(cause).into()),
            None => Err(fail("parameter has no set capability".to_string()).into()),
        }
    }
}

impl PartialEq for Parameter {
    fn eq(&self, other: &Self) -> bool {
        self.inner.name == other.inner.name && self.inner.instrument == other.inner.instrument
    }
}

impl Eq for Parameter {}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("key", &self.key())
            .field("unit", &self.inner.unit)
            .field("settable", &self.is_settable())
            .finish()
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Fluent builder for [`Parameter`].
pub struct ParameterBuilder {
    name: String,
    instrument: String,
    unit: String,
    label: Option<String>,
    range: Option<(f64, f64)>,
    getter: Option<Arc<GetFn>>,
    setter: Option<Arc<SetFn>>,
}

impl ParameterBuilder {
    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Valid numeric range; writes outside it fail as Set errors.
    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.range = Some((min, max));
        self
    }

    pub fn getter(
        mut self,
        get: impl Fn() -> std::result::Result<f64, String> + Send + Sync + 'static,
    ) -> Self {
        self.getter = Some(Arc::new(get));
        self
    }

    pub fn setter(
        mut self,
        set: impl Fn(f64) -> std::result::Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.setter = Some(Arc::new(set));
        self
    }

    pub fn build(self) -> Parameter {
        Parameter {
            inner: Arc::new(ParameterInner {
                name: self.name,
                instrument: self.instrument,
                unit: self.unit,
                label: self.label,
                range: self.range,
                getter: self.getter,
                setter: self.setter,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SweepError;
    use parking_lot::Mutex;

    fn stored(initial: f64) -> (Parameter, Arc<Mutex<f64>>) {
        let store = Arc::new(Mutex::new(initial));
        let read = store.clone();
        let write = store.clone();
        let p = Parameter::builder("value", "mock")
            .unit("V")
            .getter(move || Ok(*read.lock()))
            .setter(move |v| {
                *write.lock() = v;
                Ok(())
            })
            .build();
        (p, store)
    }

    #[test]
    fn get_and_set_round_trip() {
        let (p, store) = stored(1.5);
        assert_eq!(p.safe_get().unwrap(), 1.5);
        p.safe_set(2.5).unwrap();
        assert_eq!(*store.lock(), 2.5);
    }

    #[test]
    fn set_without_capability_fails_as_set_error() {
        let p = Parameter::builder("temp", "sensor")
            .getter(|| Ok(4.2))
            .build();
        let err = p.safe_set(1.0).unwrap_err();
        match err {
            SweepError::Parameter(e) => {
                assert_eq!(e.kind, ParameterErrorKind::Set);
                assert!(e.to_string().contains("Could not set sensor.temp"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn out_of_range_set_is_rejected() {
        let (p, store) = stored(0.0);
        let bounded = Parameter::builder("value", "mock2")
            .range(-1.0, 1.0)
            .getter({
                let s = store.clone();
                move || Ok(*s.lock())
            })
            .setter({
                let s = store.clone();
                move |v| {
                    *s.lock() = v;
                    Ok(())
                }
            })
            .build();
        assert!(bounded.safe_set(2.0).is_err());
        assert_eq!(*store.lock(), 0.0);
        drop(p);
    }

    #[test]
    fn identity_is_instrument_qualified() {
        let (a, _) = stored(0.0);
        let b = Parameter::builder("value", "mock").getter(|| Ok(0.0)).build();
        let c = Parameter::builder("value", "other").getter(|| Ok(0.0)).build();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.key(), "mock.value");
    }
}
