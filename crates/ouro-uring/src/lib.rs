//! io_uring wrapper layer.
//!
//! Owns the lifecycle of one ring instance and the kernel resources attached
//! to it: registered file and buffer tables, provided-buffer groups, and the
//! opcode probe. Everything above this crate talks to the kernel exclusively
//! through [`Ring`] and the types here.

pub mod cqe;
pub mod error;
pub mod probe;
pub mod provided;
pub mod ring;
pub mod sys;
pub mod tables;

pub use cqe::Cqe;
pub use error::{Result, RingError};
pub use probe::Features;
pub use ring::Ring;
