//! Error types shared by the sampler and the model wrapper.
//!
//! Every fallible operation returns [`MetaResult`]. Errors are raised at the
//! call that detects the violation and are never retried internally.

use std::fmt;

use crate::checkpoint::CheckpointError;

/// Result type alias for harness operations
pub type MetaResult<T> = Result<T, MetaError>;

/// Coarse classification of a [`MetaError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Shape,
    State,
    Io,
}

/// Error type for sampler and model operations
#[derive(Debug)]
pub enum MetaError {
    /// Invalid label sets, batch geometry or configuration value
    Config { parameter: String, reason: String },

    /// Tensor dimensions do not line up
    Shape {
        context: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// Graph-dependent operation invoked on an unbuilt model
    State { operation: String },

    /// File access failure while reading configuration or datasets
    Io(std::io::Error),

    /// Checkpoint could not be written or read back
    Checkpoint(CheckpointError),
}

impl MetaError {
    pub fn config(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        MetaError::Config {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }

    pub fn shape(context: impl Into<String>, expected: &[usize], got: &[usize]) -> Self {
        MetaError::Shape {
            context: context.into(),
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }

    pub fn state(operation: impl Into<String>) -> Self {
        MetaError::State {
            operation: operation.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            MetaError::Config { .. } => ErrorKind::Config,
            MetaError::Shape { .. } => ErrorKind::Shape,
            MetaError::State { .. } => ErrorKind::State,
            MetaError::Io(_) | MetaError::Checkpoint(_) => ErrorKind::Io,
        }
    }
}

impl fmt::Display for MetaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaError::Config { parameter, reason } => {
                write!(f, "Invalid configuration for '{}': {}", parameter, reason)
            }
            MetaError::Shape {
                context,
                expected,
                got,
            } => write!(
                f,
                "Shape mismatch in {}: expected {:?}, got {:?}",
                context, expected, got
            ),
            MetaError::State { operation } => write!(
                f,
                "Model not built: operation '{}' requires build() to be called first",
                operation
            ),
            MetaError::Io(err) => write!(f, "I/O error: {err}"),
            MetaError::Checkpoint(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for MetaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MetaError::Io(err) => Some(err),
            MetaError::Checkpoint(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for MetaError {
    fn from(err: std::io::Error) -> Self {
        MetaError::Io(err)
    }
}

impl From<CheckpointError> for MetaError {
    fn from(err: CheckpointError) -> Self {
        MetaError::Checkpoint(err)
    }
}
