//! Ring layer error types.

use std::fmt;

#[derive(Debug)]
pub enum RingError {
    /// Ring construction failed.
    Setup(i32),
    /// Submission to the kernel failed.
    Submit(i32),
    /// A register operation failed.
    Register(i32),
    /// Mapping memory for a provided-buffer group failed.
    Mmap(i32),
    /// The running kernel lacks a required feature.
    Unsupported(&'static str),
}

impl RingError {
    pub(crate) fn register_os(err: std::io::Error) -> Self {
        Self::Register(err.raw_os_error().unwrap_or(libc::EINVAL))
    }
}

impl fmt::Display for RingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Setup(e) => write!(f, "ring setup: errno {}", e),
            Self::Submit(e) => write!(f, "ring submit: errno {}", e),
            Self::Register(e) => write!(f, "ring register: errno {}", e),
            Self::Mmap(e) => write!(f, "buffer ring mmap: errno {}", e),
            Self::Unsupported(what) => write!(f, "kernel does not support {}", what),
        }
    }
}

impl std::error::Error for RingError {}

pub type Result<T> = std::result::Result<T, RingError>;
