//! ouro - a coroutine runtime for Linux built on io_uring.
//!
//! User code writes futures that await asynchronous operations; a
//! [`Runtime`] schedules them on its own thread, submits operation
//! descriptors to its ring, and resumes them as completions are reaped.
//! Multiple runtimes coexist in one process and communicate through
//! cross-runtime scheduling and [`Channel`]s; there is no global executor.
//!
//! ```no_run
//! use ouro::{block_on_default, async_nop};
//!
//! let res = block_on_default(async { async_nop().await });
//! assert_eq!(res, 0);
//! ```

pub mod bufgroup;
pub mod channel;
pub mod combine;
pub mod context;
pub mod error;
pub mod op;
pub mod ops;
pub mod options;
pub mod runtime;
pub mod task;

mod handle;
mod notifier;

#[doc(hidden)]
pub use handle::Target;

pub use bufgroup::{provided_buffer_pool, provided_buffer_queue};
pub use channel::Channel;
pub use combine::{
    all, any, hard_link, hard_linked, link, linked, parallel_all, parallel_any, wait_all,
    wait_any, AnyOf2, AnyOf3, AnyOf4, OpTuple,
};
pub use error::{Result, RuntimeError};
pub use op::{with_flags, RingOp};
pub use ops::*;
pub use options::RuntimeOptions;
pub use runtime::Runtime;
pub use task::{block_on, block_on_default, spawn, spawn_on, switch_to, Task};

/// SQE flag bits accepted by [`with_flags`] (drain, async, ...).
pub use io_uring::squeue::Flags as SqeFlags;

pub use ouro_core::{odebug, oerror, oinfo, otrace, owarn};
pub use ouro_uring::provided::{
    bundled, BufferInfo, BufferRing, Bundled, ProvidedBuffer, ProvidedBufferPool,
    ProvidedBufferQueue,
};
pub use ouro_uring::Features;
