//! Thread-local runtime context.
//!
//! Established on entry to `Runtime::run` and cleared on exit. Leaf
//! awaiters, channel waiters and buffer-group constructors consume it
//! implicitly; nothing outside a running event loop sees a current runtime.

use crate::runtime::Runtime;
use crate::task::TaskHeader;
use std::cell::Cell;
use std::ptr;

thread_local! {
    static CURRENT_RUNTIME: Cell<*const Runtime> = const { Cell::new(ptr::null()) };
    static CURRENT_TASK: Cell<*mut TaskHeader> = const { Cell::new(ptr::null_mut()) };
    static NEXT_BGID: Cell<u16> = const { Cell::new(0) };
    static CRED_ID: Cell<u16> = const { Cell::new(0) };
}

pub(crate) fn enter_runtime(rt: *const Runtime) {
    CURRENT_RUNTIME.with(|c| c.set(rt));
    NEXT_BGID.with(|c| c.set(0));
    CRED_ID.with(|c| c.set(0));
}

pub(crate) fn exit_runtime() {
    CURRENT_RUNTIME.with(|c| c.set(ptr::null()));
    NEXT_BGID.with(|c| c.set(0));
    CRED_ID.with(|c| c.set(0));
}

pub(crate) fn current_runtime_ptr() -> *const Runtime {
    CURRENT_RUNTIME.with(|c| c.get())
}

/// The runtime driving this thread, if any.
///
/// The reference is valid for the duration of the caller's synchronous
/// execution slice: the runtime cannot be dropped while its own `run` is on
/// this thread's stack.
pub(crate) fn current_runtime<'a>() -> Option<&'a Runtime> {
    let ptr = current_runtime_ptr();
    if ptr.is_null() {
        None
    } else {
        Some(unsafe { &*ptr })
    }
}

pub(crate) fn set_current_task(task: *mut TaskHeader) {
    CURRENT_TASK.with(|c| c.set(task));
}

pub(crate) fn current_task() -> *mut TaskHeader {
    CURRENT_TASK.with(|c| c.get())
}

/// Hand out the next buffer-group id for this runtime thread.
pub(crate) fn next_bgid() -> u16 {
    NEXT_BGID.with(|c| {
        let id = c.get();
        c.set(id.wrapping_add(1));
        id
    })
}

/// Personality id applied to newly prepared ops (0 = none).
pub fn cred_id() -> u16 {
    CRED_ID.with(|c| c.get())
}

pub fn set_cred_id(id: u16) {
    CRED_ID.with(|c| c.set(id));
}

/// Whether the calling thread is inside a runtime's event loop.
pub fn in_runtime() -> bool {
    !current_runtime_ptr().is_null()
}
