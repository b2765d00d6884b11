//! Custom error types for the sweep engine.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SweepError>;

/// Which half of the parameter binding failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterErrorKind {
    Get,
    Set,
}

/// An instrument I/O failure raised by `safe_get`/`safe_set`.
///
/// Get failures are only reported after the single 1 s retry has also
/// failed; set failures are reported immediately because setting may have
/// side effects on the instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterError {
    pub kind: ParameterErrorKind,
    /// Qualified parameter identity (`instrument.name`).
    pub parameter: String,
    /// The value being written, for Set failures.
    pub value: Option<f64>,
    /// Message from the underlying instrument call.
    pub cause: String,
}

impl std::fmt::Display for ParameterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            ParameterErrorKind::Get => {
                write!(f, "Could not get {}: {}", self.parameter, self.cause)
            }
            ParameterErrorKind::Set => write!(
                f,
                "Could not set {} to {}: {}",
                self.parameter,
                self.value.unwrap_or(f64::NAN),
                self.cause
            ),
        }
    }
}

impl std::error::Error for ParameterError {}

/// Error taxonomy for sweep construction and execution.
#[derive(Debug, Clone, Error)]
pub enum SweepError {
    /// Invalid construction arguments. Fails before any state change.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Instrument I/O failed during a point.
    #[error(transparent)]
    Parameter(#[from] ParameterError),

    /// A ramp finished away from its target.
    #[error(
        "Ramp did not converge for {parameter}: expected {expected}, read {actual} (tolerance={tolerance})"
    )]
    RampConvergence {
        parameter: String,
        expected: f64,
        actual: f64,
        tolerance: f64,
    },

    /// `start()` blocked by an unrelated active sweep.
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Dataset context could not be opened or a row could not be appended.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// A queue entry failed; the queue stops and preserves what remains.
    #[error("Queue error: {0}")]
    Queue(String),
}

impl SweepError {
    /// Construction-argument failure with a formatted message.
    pub fn config(msg: impl Into<String>) -> Self {
        SweepError::Config(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        SweepError::Persistence(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_error_message_names_parameter_and_value() {
        let err = ParameterError {
            kind: ParameterErrorKind::Set,
            parameter: "dac.voltage".to_string(),
            value: Some(0.5),
            cause: "bus timeout".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("Could not set dac.voltage to 0.5"));
        assert!(msg.contains("bus timeout"));
    }

    #[test]
    fn ramp_error_message_reports_tolerance() {
        let err = SweepError::RampConvergence {
            parameter: "dac.voltage".to_string(),
            expected: 1.0,
            actual: 0.2,
            tolerance: 0.05,
        };
        assert!(err.to_string().contains("tolerance=0.05"));
    }
}
