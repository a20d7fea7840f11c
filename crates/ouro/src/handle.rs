//! Finish handles: the runtime-side state of one in-flight operation.
//!
//! A handle's address, tagged per [`WorkTag`], is the ring user-data of the
//! SQE it belongs to. When the matching CQE arrives the event loop calls the
//! handle's CQE handler, which stores the result and answers two questions:
//! should the handle be queued for resumption, and is the operation finished
//! for pending-work accounting. All handles start with [`OpHeader`]
//! (`#[repr(C)]`), so the loop can dispatch without knowing the concrete
//! kind.

use crate::context;
use ouro_core::work::{encode_work, Work, WorkTag};
use ouro_uring::cqe::{has_more, is_notif};
use ouro_uring::provided::BufferRing;
use std::cell::{Cell, UnsafeCell};
use std::mem;
use std::ptr;
use std::task::Waker;

/// Result sentinel: "the operation never completed".
pub(crate) const RESULT_UNSET: i32 = -libc::ENOTRECOVERABLE;

/// What the event loop should do with a handle after one CQE.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Action {
    pub queue_work: bool,
    pub op_finish: bool,
}

/// Where a finished handle reports to: the awaiting task's waker, or the
/// composite parent that owns it.
#[doc(hidden)]
pub enum Target {
    None,
    Waker(Waker),
    Parent {
        data: *mut (),
        hook: unsafe fn(*mut (), usize),
        idx: usize,
    },
}

impl Target {
    /// Fire the target once, leaving `None` behind.
    ///
    /// # Safety
    ///
    /// Parent targets must still point at a live, pinned composite core.
    pub(crate) unsafe fn fire(slot: *mut Target) {
        match mem::replace(&mut *slot, Target::None) {
            Target::None => {}
            Target::Waker(waker) => waker.wake(),
            Target::Parent { data, hook, idx } => hook(data, idx),
        }
    }
}

/// Common head of every operation finish handle.
#[repr(C)]
pub(crate) struct OpHeader {
    work: Work,
    handler: fn(*mut OpHeader, i32, u32) -> Action,
    tag: WorkTag,
    res: Cell<i32>,
    cqe_flags: Cell<u32>,
    resumable: Cell<bool>,
    target: UnsafeCell<Target>,
}

impl OpHeader {
    pub(crate) fn new(handler: fn(*mut OpHeader, i32, u32) -> Action, tag: WorkTag) -> Self {
        Self {
            work: Work::new(Self::resume),
            handler,
            tag,
            res: Cell::new(RESULT_UNSET),
            cqe_flags: Cell::new(0),
            resumable: Cell::new(false),
            target: UnsafeCell::new(Target::None),
        }
    }

    /// Queue-resume entry point: report to whoever awaits this op.
    unsafe fn resume(work: *mut Work) {
        let hdr = work as *mut OpHeader;
        Target::fire((*hdr).target.get());
    }

    pub(crate) fn set_target(&self, target: Target) {
        unsafe { *self.target.get() = target };
    }

    pub(crate) fn set_result(&self, res: i32, flags: u32) {
        self.res.set(res);
        self.cqe_flags.set(flags);
    }

    pub(crate) fn result(&self) -> i32 {
        self.res.get()
    }

    pub(crate) fn flags(&self) -> u32 {
        self.cqe_flags.get()
    }

    pub(crate) fn is_resumable(&self) -> bool {
        self.resumable.get()
    }

    pub(crate) fn set_resumable(&self) {
        self.resumable.set(true);
    }

    pub(crate) fn work_ptr(&self) -> *mut Work {
        &self.work as *const Work as *mut Work
    }

    /// Tagged ring user-data for this handle.
    pub(crate) fn user_data(&self) -> u64 {
        encode_work(self as *const OpHeader as *const (), self.tag)
    }

    /// Run the kind-specific CQE handler.
    ///
    /// # Safety
    ///
    /// `hdr` must be the header of a live handle whose SQE produced the CQE.
    pub(crate) unsafe fn dispatch(hdr: *mut OpHeader, res: i32, flags: u32) -> Action {
        ((*hdr).handler)(hdr, res, flags)
    }

    /// Submit a best-effort cancel against this handle's operation. The
    /// cancel CQE itself carries no work (Ignore tag, success skipped);
    /// the cancelled op still produces its own CQE.
    pub(crate) fn cancel(&self) {
        let rt = context::current_runtime().expect("cancel outside a runtime");
        let sqe = io_uring::opcode::AsyncCancel::new(self.user_data())
            .build()
            .flags(io_uring::squeue::Flags::SKIP_SUCCESS)
            .user_data(encode_work(ptr::null(), WorkTag::Ignore));
        rt.with_ring(|ring| ring.push_sqe(sqe));
    }
}

pub(crate) fn common_handler(hdr: *mut OpHeader, res: i32, flags: u32) -> Action {
    unsafe { (*hdr).set_result(res, flags) };
    Action {
        queue_work: true,
        op_finish: true,
    }
}

/// Single-shot handle; lives inline in its awaiter.
#[repr(C)]
pub(crate) struct OpHandle {
    pub(crate) hdr: OpHeader,
}

impl OpHandle {
    pub(crate) fn new() -> Self {
        Self {
            hdr: OpHeader::new(common_handler, WorkTag::Common),
        }
    }
}

/// Multi-shot handle: the callback runs for every intermediate CQE; the
/// terminating CQE (no "more" flag) follows the common path.
#[repr(C)]
pub(crate) struct MultiShotHandle<C> {
    pub(crate) hdr: OpHeader,
    cb: UnsafeCell<C>,
}

impl<C: FnMut(i32)> MultiShotHandle<C> {
    pub(crate) fn new(cb: C) -> Self {
        Self {
            hdr: OpHeader::new(Self::handler, WorkTag::MultiShot),
            cb: UnsafeCell::new(cb),
        }
    }

    fn handler(hdr: *mut OpHeader, res: i32, flags: u32) -> Action {
        let this = hdr as *mut Self;
        unsafe {
            (*hdr).set_result(res, flags);
            if has_more(flags) {
                (*(*this).cb.get())(res);
                Action {
                    queue_work: false,
                    op_finish: false,
                }
            } else {
                Action {
                    queue_work: true,
                    op_finish: true,
                }
            }
        }
    }
}

/// Buffer-select handle: completion flags are kept so the awaiter can
/// translate the buffer id into a provided buffer.
#[repr(C)]
pub(crate) struct SelectBufferHandle<B> {
    pub(crate) hdr: OpHeader,
    group: *const B,
}

impl<B: BufferRing> SelectBufferHandle<B> {
    pub(crate) fn new(group: &B) -> Self {
        Self {
            hdr: OpHeader::new(common_handler, WorkTag::Common),
            group,
        }
    }

    pub(crate) fn extract(&self) -> (i32, B::Out) {
        let res = self.hdr.result();
        let out = unsafe { (*self.group).on_complete(res, self.hdr.flags()) };
        (res, out)
    }
}

/// Multi-shot plus buffer-select: each intermediate CQE yields a selected
/// buffer to the callback.
#[repr(C)]
pub(crate) struct MultiShotSelectHandle<C, B> {
    pub(crate) hdr: OpHeader,
    cb: UnsafeCell<C>,
    group: *const B,
}

impl<B: BufferRing, C: FnMut(i32, B::Out)> MultiShotSelectHandle<C, B> {
    pub(crate) fn new(cb: C, group: &B) -> Self {
        Self {
            hdr: OpHeader::new(Self::handler, WorkTag::MultiShot),
            cb: UnsafeCell::new(cb),
            group,
        }
    }

    fn handler(hdr: *mut OpHeader, res: i32, flags: u32) -> Action {
        let this = hdr as *mut Self;
        unsafe {
            (*hdr).set_result(res, flags);
            if has_more(flags) {
                let out = (*(*this).group).on_complete(res, flags);
                (*(*this).cb.get())(res, out);
                Action {
                    queue_work: false,
                    op_finish: false,
                }
            } else {
                Action {
                    queue_work: true,
                    op_finish: true,
                }
            }
        }
    }

    pub(crate) fn extract(&self) -> (i32, B::Out) {
        let res = self.hdr.result();
        let out = unsafe { (*self.group).on_complete(res, self.hdr.flags()) };
        (res, out)
    }
}

/// Zero-copy handle. A single operation produces a result CQE and a
/// notification CQE, in either order relative to the awaiter's resumption;
/// the handle therefore lives on the heap and frees itself only after both
/// "resumed" and "notified" have been observed, at which point the free
/// callback runs with the notification result.
#[repr(C)]
pub(crate) struct ZeroCopyHandle<C> {
    pub(crate) hdr: OpHeader,
    free_cb: UnsafeCell<Option<C>>,
    notify_res: Cell<i32>,
    resumed: Cell<bool>,
    notified: Cell<bool>,
}

impl<C: FnOnce(i32)> ZeroCopyHandle<C> {
    pub(crate) fn boxed(free_cb: C) -> *mut Self {
        Box::into_raw(Box::new(Self {
            hdr: OpHeader::new(Self::handler, WorkTag::ZeroCopy),
            free_cb: UnsafeCell::new(Some(free_cb)),
            notify_res: Cell::new(RESULT_UNSET),
            resumed: Cell::new(false),
            notified: Cell::new(false),
        }))
    }

    /// Free a handle whose operation was never registered.
    ///
    /// # Safety
    ///
    /// `this` must come from [`boxed`](Self::boxed) and carry no in-flight op.
    pub(crate) unsafe fn discard(this: *mut Self) {
        drop(Box::from_raw(this));
    }

    fn handler(hdr: *mut OpHeader, res: i32, flags: u32) -> Action {
        let this = hdr as *mut Self;
        unsafe {
            if has_more(flags) {
                // Result CQE; the notification is still outstanding.
                (*hdr).set_result(res, flags);
                Action {
                    queue_work: true,
                    op_finish: false,
                }
            } else if is_notif(flags) {
                Self::notify(this, res);
                Action {
                    queue_work: false,
                    op_finish: true,
                }
            } else {
                // One lone CQE: the kernel skipped the notification
                // (EOPNOTSUPP fast path). Treat it as notified-with-zero.
                (*hdr).set_result(res, flags);
                Self::notify(this, 0);
                Action {
                    queue_work: true,
                    op_finish: true,
                }
            }
        }
    }

    unsafe fn notify(this: *mut Self, res: i32) {
        debug_assert_ne!(res, RESULT_UNSET);
        (*this).notify_res.set(res);
        (*this).notified.set(true);
        Self::maybe_finalize(this);
    }

    /// The awaiter has taken (or abandoned) the result.
    ///
    /// # Safety
    ///
    /// `this` must be live; it may be freed by this call.
    pub(crate) unsafe fn mark_resumed(this: *mut Self) {
        (*this).resumed.set(true);
        Self::maybe_finalize(this);
    }

    unsafe fn maybe_finalize(this: *mut Self) {
        if (*this).resumed.get() && (*this).notified.get() {
            let cb = (*(*this).free_cb.get()).take();
            let res = (*this).notify_res.get();
            drop(Box::from_raw(this));
            if let Some(cb) = cb {
                cb(res);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ouro_uring::cqe::{CQE_F_MORE, CQE_F_NOTIF};

    #[test]
    fn test_common_handler_stores_and_finishes() {
        let handle = OpHandle::new();
        let hdr = &handle.hdr as *const OpHeader as *mut OpHeader;
        assert_eq!(handle.hdr.result(), RESULT_UNSET);
        let action = unsafe { OpHeader::dispatch(hdr, 42, 3) };
        assert!(action.queue_work);
        assert!(action.op_finish);
        assert_eq!(handle.hdr.result(), 42);
        assert_eq!(handle.hdr.flags(), 3);
    }

    #[test]
    fn test_multishot_intermediate_calls_back() {
        let hits = std::rc::Rc::new(Cell::new(0));
        let hits2 = hits.clone();
        let handle = MultiShotHandle::new(move |res| hits2.set(hits2.get() + res));
        let hdr = &handle.hdr as *const OpHeader as *mut OpHeader;
        let action = unsafe { OpHeader::dispatch(hdr, 5, CQE_F_MORE) };
        assert!(!action.queue_work);
        assert!(!action.op_finish);
        let action = unsafe { OpHeader::dispatch(hdr, 6, CQE_F_MORE) };
        assert!(!action.op_finish);
        assert_eq!(hits.get(), 11);
        // Terminating CQE goes through the common path.
        let action = unsafe { OpHeader::dispatch(hdr, 0, 0) };
        assert!(action.queue_work);
        assert!(action.op_finish);
        assert_eq!(hits.get(), 11);
        assert_eq!(handle.hdr.result(), 0);
    }

    #[test]
    fn test_zero_copy_result_then_notification() {
        let freed = std::rc::Rc::new(Cell::new(None));
        let freed2 = freed.clone();
        let handle = ZeroCopyHandle::boxed(move |res| freed2.set(Some(res)));
        let hdr = handle as *mut OpHeader;

        let action = unsafe { OpHeader::dispatch(hdr, 100, CQE_F_MORE) };
        assert!(action.queue_work);
        assert!(!action.op_finish);
        unsafe { ZeroCopyHandle::mark_resumed(handle) };
        assert_eq!(freed.get(), None);

        let action = unsafe { OpHeader::dispatch(hdr, 0, CQE_F_NOTIF) };
        assert!(!action.queue_work);
        assert!(action.op_finish);
        assert_eq!(freed.get(), Some(0));
    }

    #[test]
    fn test_zero_copy_notification_before_resume() {
        let freed = std::rc::Rc::new(Cell::new(None));
        let freed2 = freed.clone();
        let handle = ZeroCopyHandle::boxed(move |res| freed2.set(Some(res)));
        let hdr = handle as *mut OpHeader;

        unsafe { OpHeader::dispatch(hdr, 100, CQE_F_MORE) };
        unsafe { OpHeader::dispatch(hdr, 7, CQE_F_NOTIF) };
        assert_eq!(freed.get(), None);
        unsafe { ZeroCopyHandle::mark_resumed(handle) };
        assert_eq!(freed.get(), Some(7));
    }

    #[test]
    fn test_zero_copy_single_cqe_fast_path() {
        let freed = std::rc::Rc::new(Cell::new(None));
        let freed2 = freed.clone();
        let handle = ZeroCopyHandle::boxed(move |res| freed2.set(Some(res)));
        let hdr = handle as *mut OpHeader;

        // Kernel produced no notification at all.
        let action = unsafe { OpHeader::dispatch(hdr, -libc::EOPNOTSUPP, 0) };
        assert!(action.queue_work);
        assert!(action.op_finish);
        assert_eq!(freed.get(), None);
        unsafe { ZeroCopyHandle::mark_resumed(handle) };
        assert_eq!(freed.get(), Some(0));
    }
}
