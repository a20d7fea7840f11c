//! Core primitives shared by the ouro runtime crates.
//!
//! This crate is deliberately free of any io_uring types: it holds the
//! tagged-pointer work encoding, the intrusive queues the runtime and the
//! channel are built on, and the logging facility. Everything here is usable
//! from both the ring layer and the runtime itself.

pub mod env;
pub mod list;
pub mod olog;
pub mod work;

cfg_if::cfg_if! {
    if #[cfg(not(all(target_os = "linux", target_pointer_width = "64")))] {
        compile_error!(
            "ouro targets 64-bit Linux: work tags are stored in the low bits \
             of 8-byte-aligned pointers handed to the kernel"
        );
    }
}
