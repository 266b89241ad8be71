//! Error types for convolution configuration, packing and dispatch.

use thiserror::Error;

use crate::conv::ConvState;

pub type Result<T> = std::result::Result<T, ConvError>;

/// Everything that can go wrong between selecting a tiling and submitting a
/// dispatch.
///
/// Every variant carries enough context (stage, constraint, state) for the
/// caller to log it or decide on a retry. Nothing in this crate retries on
/// its own.
#[derive(Debug, Error)]
pub enum ConvError {
    /// Non-positive dimensions, data/shape mismatches, weights that do not
    /// match the configured problem.
    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    /// The selector could not satisfy a hard device constraint.
    #[error("Unsupported device capability: {constraint}")]
    UnsupportedCapability { constraint: String },

    /// Buffer or linear storage allocation failed.
    #[error("Allocation failed while uploading {stage}: {message}")]
    AllocationFailure { stage: &'static str, message: String },

    /// Kernel source generation or kernel building failed.
    #[error("Kernel compilation failed: {0}")]
    CompilationFailure(String),

    /// An operation was requested in a state that does not allow it.
    #[error("Cannot {action} while operation is {state}")]
    InvalidStateTransition { action: &'static str, state: ConvState },

    /// Compute device bring-up failed.
    #[error("Device initialization failed: {0}")]
    DeviceInit(String),

    /// A device profile could not be parsed.
    #[error("Invalid device profile: {0}")]
    InvalidProfile(String),
}

impl ConvError {
    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        ConvError::InvalidShape(msg.into())
    }

    pub(crate) fn unsupported(constraint: impl Into<String>) -> Self {
        ConvError::UnsupportedCapability {
            constraint: constraint.into(),
        }
    }

    pub(crate) fn allocation(stage: &'static str, message: impl Into<String>) -> Self {
        ConvError::AllocationFailure {
            stage,
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for ConvError {
    fn from(e: serde_json::Error) -> Self {
        ConvError::InvalidProfile(e.to_string())
    }
}

#[cfg(feature = "python")]
impl From<ConvError> for pyo3::PyErr {
    fn from(e: ConvError) -> Self {
        use pyo3::exceptions::{PyRuntimeError, PyValueError};
        match e {
            ConvError::InvalidShape(_) | ConvError::InvalidProfile(_) => {
                PyValueError::new_err(e.to_string())
            }
            _ => PyRuntimeError::new_err(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_carry_context() {
        let err = ConvError::allocation("weights", "budget exhausted");
        assert_eq!(
            err.to_string(),
            "Allocation failed while uploading weights: budget exhausted"
        );

        let err = ConvError::InvalidStateTransition {
            action: "dispatch",
            state: ConvState::Compiled,
        };
        assert_eq!(err.to_string(), "Cannot dispatch while operation is Compiled");
    }

    #[test]
    fn test_json_error_maps_to_profile() {
        let bad = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: ConvError = bad.into();
        assert!(matches!(err, ConvError::InvalidProfile(_)));
    }
}
