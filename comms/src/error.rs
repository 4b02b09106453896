use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

use safetensors::SafeTensorError;

/// The result type used in the entire comms module.
pub type Result<T> = std::result::Result<T, CommsErr>;

/// The comms module's error type.
#[derive(Debug)]
pub enum CommsErr {
    SizeMismatch {
        name: String,
        got: usize,
        expected: usize,
    },
    UnknownPrecision(String),
    UnsupportedDtype(String),
    Checkpoint(SafeTensorError),
    Spec(serde_json::Error),
    Io(io::Error),
}

impl Display for CommsErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SizeMismatch {
                name,
                got,
                expected,
            } => write!(
                f,
                "item {name} has {got} bytes but its shape and precision require {expected}"
            ),
            Self::UnknownPrecision(s) => write!(f, "unknown precision type {s:?}"),
            Self::UnsupportedDtype(s) => write!(f, "unsupported checkpoint dtype {s}"),
            Self::Checkpoint(e) => write!(f, "malformed checkpoint container: {e}"),
            Self::Spec(e) => write!(f, "invalid optimizer spec: {e}"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for CommsErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Checkpoint(e) => Some(e),
            Self::Spec(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CommsErr {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<SafeTensorError> for CommsErr {
    fn from(e: SafeTensorError) -> Self {
        Self::Checkpoint(e)
    }
}

impl From<serde_json::Error> for CommsErr {
    fn from(e: serde_json::Error) -> Self {
        Self::Spec(e)
    }
}
