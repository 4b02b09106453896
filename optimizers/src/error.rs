use std::{
    error::Error,
    fmt::{self, Display},
};

use comms::{CommsErr, Precision};

/// The result type used in the entire optimizers crate.
pub type Result<T> = std::result::Result<T, OptimErr>;

/// The optimizers crate's error type.
#[derive(Debug)]
pub enum OptimErr {
    InvalidConfig(String),
    SizeMismatch {
        a: &'static str,
        b: &'static str,
        got: usize,
        expected: usize,
    },
    PrecisionMismatch {
        got: Precision,
        expected: Precision,
    },
    MissingState(String),
    CorruptCheckpoint(String),
    Comms(CommsErr),
}

impl Display for OptimErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(msg) => write!(f, "invalid optimizer config: {msg}"),
            Self::SizeMismatch {
                a,
                b,
                got,
                expected,
            } => write!(
                f,
                "There's a size mismatch between {a} and {b}, got {got} and expected {expected}"
            ),
            Self::PrecisionMismatch { got, expected } => {
                write!(f, "got a {got} buffer where a {expected} buffer was expected")
            }
            Self::MissingState(name) => write!(f, "optimizer state {name} was never allocated"),
            Self::CorruptCheckpoint(msg) => write!(f, "corrupt checkpoint: {msg}"),
            Self::Comms(e) => write!(f, "{e}"),
        }
    }
}

impl Error for OptimErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Comms(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CommsErr> for OptimErr {
    fn from(e: CommsErr) -> Self {
        Self::Comms(e)
    }
}

/// Checks that two buffers that must be paired element by element have the same length.
pub(crate) fn check_len(
    a: &'static str,
    b: &'static str,
    got: usize,
    expected: usize,
) -> Result<()> {
    if got != expected {
        return Err(OptimErr::SizeMismatch {
            a,
            b,
            got,
            expected,
        });
    }

    Ok(())
}
