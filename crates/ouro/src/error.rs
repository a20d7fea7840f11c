//! Runtime error types.

use ouro_uring::RingError;
use std::fmt;

#[derive(Debug)]
pub enum RuntimeError {
    /// Ring or notifier construction failed.
    Setup(i32),
    /// An option combination is illegal.
    Config(&'static str),
    /// An option or operation the running stack cannot express.
    Unsupported(&'static str),
    /// The ring reported a fatal error while pumping completions.
    Ring(RingError),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Setup(e) => write!(f, "runtime setup: errno {}", e),
            Self::Config(what) => write!(f, "illegal runtime options: {}", what),
            Self::Unsupported(what) => write!(f, "unsupported runtime option: {}", what),
            Self::Ring(e) => write!(f, "ring failure: {}", e),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl From<RingError> for RuntimeError {
    fn from(e: RingError) -> Self {
        Self::Ring(e)
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
