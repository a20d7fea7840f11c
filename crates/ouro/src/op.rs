//! Operation awaiters.
//!
//! A leaf awaiter owns a finish handle and an SQE-preparation closure. It is
//! never ready before suspending: the first poll installs the caller's waker
//! as the handle's target, acquires a submission slot, runs the prep closure
//! and goes to sleep. Registration only queues the SQE; the actual submit is
//! deferred to the next blocking reap or forced flush.
//!
//! [`RingOp`] is the seam composite awaiters build on: everything awaitable
//! on the ring implements it, including the composites themselves and
//! channel push/pop.

use crate::context;
use crate::handle::{
    MultiShotHandle, MultiShotSelectHandle, OpHandle, SelectBufferHandle, Target, ZeroCopyHandle,
};
use io_uring::squeue;
use ouro_core::oerror;
use ouro_uring::provided::BufferRing;
use std::future::Future;
use std::marker::{PhantomData, PhantomPinned};
use std::pin::Pin;
use std::task::{Context, Poll};

/// An awaitable ring operation.
///
/// The methods are the composition seam used by `combine`; user code only
/// awaits these types or passes them to combinators.
pub trait RingOp {
    type Output;

    #[doc(hidden)]
    fn set_target(self: Pin<&mut Self>, target: Target);

    #[doc(hidden)]
    fn register(self: Pin<&mut Self>, flags: squeue::Flags);

    #[doc(hidden)]
    fn cancel_op(self: Pin<&mut Self>);

    #[doc(hidden)]
    fn is_finished(&self) -> bool;

    #[doc(hidden)]
    fn take_result(self: Pin<&mut Self>) -> Self::Output;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpState {
    Created,
    Submitted,
    Done,
}

fn register_entry(mut entry: squeue::Entry) {
    let rt = context::current_runtime().expect("operation registered outside a runtime");
    let cred = context::cred_id();
    if cred != 0 {
        entry = entry.personality(cred);
    }
    rt.pend_work();
    rt.with_ring(|ring| ring.push_sqe(entry));
}

/// Single-shot operation future; output is the raw signed CQE result.
pub struct OpFuture<P, F> {
    payload: P,
    prep: Option<F>,
    base_flags: squeue::Flags,
    handle: OpHandle,
    state: OpState,
    _pin: PhantomPinned,
}

impl<P, F: FnOnce(&mut P) -> squeue::Entry> OpFuture<P, F> {
    pub(crate) fn new(payload: P, prep: F) -> Self {
        Self::with_flags(payload, prep, squeue::Flags::empty())
    }

    pub(crate) fn with_flags(payload: P, prep: F, base_flags: squeue::Flags) -> Self {
        Self {
            payload,
            prep: Some(prep),
            base_flags,
            handle: OpHandle::new(),
            state: OpState::Created,
            _pin: PhantomPinned,
        }
    }
}

impl<P, F: FnOnce(&mut P) -> squeue::Entry> RingOp for OpFuture<P, F> {
    type Output = i32;

    fn set_target(self: Pin<&mut Self>, target: Target) {
        self.handle.hdr.set_target(target);
    }

    fn register(self: Pin<&mut Self>, flags: squeue::Flags) {
        let this = unsafe { self.get_unchecked_mut() };
        debug_assert_eq!(this.state, OpState::Created);
        let prep = this.prep.take().expect("operation registered twice");
        let entry = prep(&mut this.payload)
            .flags(this.base_flags | flags)
            .user_data(this.handle.hdr.user_data());
        this.state = OpState::Submitted;
        register_entry(entry);
    }

    fn cancel_op(self: Pin<&mut Self>) {
        if self.state == OpState::Submitted && !self.handle.hdr.is_resumable() {
            self.handle.hdr.cancel();
        }
    }

    fn is_finished(&self) -> bool {
        self.handle.hdr.is_resumable()
    }

    fn take_result(self: Pin<&mut Self>) -> i32 {
        let this = unsafe { self.get_unchecked_mut() };
        debug_assert_eq!(this.state, OpState::Submitted);
        this.state = OpState::Done;
        this.handle.hdr.result()
    }
}

impl<P, F> Drop for OpFuture<P, F> {
    fn drop(&mut self) {
        if self.state == OpState::Submitted && !self.handle.hdr.is_resumable() {
            // The kernel still holds this future's address as user-data.
            oerror!("operation future dropped while in flight");
            std::process::abort();
        }
    }
}

macro_rules! impl_op_future {
    ($ty:ident <$($gen:tt),*> where $($bound:tt)*) => {
        impl<$($gen),*> Future for $ty<$($gen),*>
        where
            $($bound)*
        {
            type Output = <Self as RingOp>::Output;

            fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
                match self.state {
                    OpState::Created => {
                        self.as_mut().set_target(Target::Waker(cx.waker().clone()));
                        self.as_mut().register(squeue::Flags::empty());
                        if self.is_finished() {
                            Poll::Ready(self.take_result())
                        } else {
                            Poll::Pending
                        }
                    }
                    OpState::Submitted => {
                        if self.is_finished() {
                            Poll::Ready(self.take_result())
                        } else {
                            Poll::Pending
                        }
                    }
                    OpState::Done => panic!("operation polled after completion"),
                }
            }
        }
    };
}

impl_op_future!(OpFuture<P, F> where F: FnOnce(&mut P) -> squeue::Entry);

/// Multi-shot operation future. The callback fires once per intermediate
/// completion; the future resolves with the terminating CQE's result.
pub struct MultiShotOpFuture<P, F, C> {
    payload: P,
    prep: Option<F>,
    base_flags: squeue::Flags,
    handle: MultiShotHandle<C>,
    state: OpState,
    _pin: PhantomPinned,
}

impl<P, F: FnOnce(&mut P) -> squeue::Entry, C: FnMut(i32)> MultiShotOpFuture<P, F, C> {
    pub(crate) fn new(payload: P, prep: F, cb: C) -> Self {
        Self {
            payload,
            prep: Some(prep),
            base_flags: squeue::Flags::empty(),
            handle: MultiShotHandle::new(cb),
            state: OpState::Created,
            _pin: PhantomPinned,
        }
    }
}

impl<P, F: FnOnce(&mut P) -> squeue::Entry, C: FnMut(i32)> RingOp for MultiShotOpFuture<P, F, C> {
    type Output = i32;

    fn set_target(self: Pin<&mut Self>, target: Target) {
        self.handle.hdr.set_target(target);
    }

    fn register(self: Pin<&mut Self>, flags: squeue::Flags) {
        let this = unsafe { self.get_unchecked_mut() };
        debug_assert_eq!(this.state, OpState::Created);
        let prep = this.prep.take().expect("operation registered twice");
        let entry = prep(&mut this.payload)
            .flags(this.base_flags | flags)
            .user_data(this.handle.hdr.user_data());
        this.state = OpState::Submitted;
        register_entry(entry);
    }

    fn cancel_op(self: Pin<&mut Self>) {
        if self.state == OpState::Submitted && !self.handle.hdr.is_resumable() {
            self.handle.hdr.cancel();
        }
    }

    fn is_finished(&self) -> bool {
        self.handle.hdr.is_resumable()
    }

    fn take_result(self: Pin<&mut Self>) -> i32 {
        let this = unsafe { self.get_unchecked_mut() };
        this.state = OpState::Done;
        this.handle.hdr.result()
    }
}

impl<P, F, C> Drop for MultiShotOpFuture<P, F, C> {
    fn drop(&mut self) {
        if self.state == OpState::Submitted && !self.handle.hdr.is_resumable() {
            oerror!("multishot future dropped while in flight");
            std::process::abort();
        }
    }
}

impl_op_future!(MultiShotOpFuture<P, F, C> where F: FnOnce(&mut P) -> squeue::Entry, C: FnMut(i32));

/// Buffer-select operation future; resolves to the raw result plus the
/// buffer(s) the kernel picked from the named group.
pub struct SelectOpFuture<'g, P, F, B> {
    payload: P,
    prep: Option<F>,
    base_flags: squeue::Flags,
    handle: SelectBufferHandle<B>,
    state: OpState,
    _group: PhantomData<&'g B>,
    _pin: PhantomPinned,
}

impl<'g, P, F: FnOnce(&mut P) -> squeue::Entry, B: BufferRing> SelectOpFuture<'g, P, F, B> {
    pub(crate) fn new(payload: P, prep: F, group: &'g B) -> Self {
        Self {
            payload,
            prep: Some(prep),
            base_flags: squeue::Flags::BUFFER_SELECT,
            handle: SelectBufferHandle::new(group),
            state: OpState::Created,
            _group: PhantomData,
            _pin: PhantomPinned,
        }
    }
}

impl<P, F: FnOnce(&mut P) -> squeue::Entry, B: BufferRing> RingOp for SelectOpFuture<'_, P, F, B> {
    type Output = (i32, B::Out);

    fn set_target(self: Pin<&mut Self>, target: Target) {
        self.handle.hdr.set_target(target);
    }

    fn register(self: Pin<&mut Self>, flags: squeue::Flags) {
        let this = unsafe { self.get_unchecked_mut() };
        debug_assert_eq!(this.state, OpState::Created);
        let prep = this.prep.take().expect("operation registered twice");
        let entry = prep(&mut this.payload)
            .flags(this.base_flags | flags)
            .user_data(this.handle.hdr.user_data());
        this.state = OpState::Submitted;
        register_entry(entry);
    }

    fn cancel_op(self: Pin<&mut Self>) {
        if self.state == OpState::Submitted && !self.handle.hdr.is_resumable() {
            self.handle.hdr.cancel();
        }
    }

    fn is_finished(&self) -> bool {
        self.handle.hdr.is_resumable()
    }

    fn take_result(self: Pin<&mut Self>) -> (i32, B::Out) {
        let this = unsafe { self.get_unchecked_mut() };
        this.state = OpState::Done;
        this.handle.extract()
    }
}

impl<P, F, B> Drop for SelectOpFuture<'_, P, F, B> {
    fn drop(&mut self) {
        if self.state == OpState::Submitted && !self.handle.hdr.is_resumable() {
            oerror!("buffer-select future dropped while in flight");
            std::process::abort();
        }
    }
}

impl_op_future!(SelectOpFuture<'g, P, F, B> where F: FnOnce(&mut P) -> squeue::Entry, B: BufferRing);

/// Multi-shot buffer-select future: the callback receives each intermediate
/// result together with its selected buffer(s).
pub struct MultiShotSelectFuture<'g, P, F, C, B> {
    payload: P,
    prep: Option<F>,
    base_flags: squeue::Flags,
    handle: MultiShotSelectHandle<C, B>,
    state: OpState,
    _group: PhantomData<&'g B>,
    _pin: PhantomPinned,
}

impl<'g, P, F, C, B> MultiShotSelectFuture<'g, P, F, C, B>
where
    F: FnOnce(&mut P) -> squeue::Entry,
    B: BufferRing,
    C: FnMut(i32, B::Out),
{
    pub(crate) fn new(payload: P, prep: F, cb: C, group: &'g B) -> Self {
        Self {
            payload,
            prep: Some(prep),
            base_flags: squeue::Flags::BUFFER_SELECT,
            handle: MultiShotSelectHandle::new(cb, group),
            state: OpState::Created,
            _group: PhantomData,
            _pin: PhantomPinned,
        }
    }
}

impl<P, F, C, B> RingOp for MultiShotSelectFuture<'_, P, F, C, B>
where
    F: FnOnce(&mut P) -> squeue::Entry,
    B: BufferRing,
    C: FnMut(i32, B::Out),
{
    type Output = (i32, B::Out);

    fn set_target(self: Pin<&mut Self>, target: Target) {
        self.handle.hdr.set_target(target);
    }

    fn register(self: Pin<&mut Self>, flags: squeue::Flags) {
        let this = unsafe { self.get_unchecked_mut() };
        debug_assert_eq!(this.state, OpState::Created);
        let prep = this.prep.take().expect("operation registered twice");
        let entry = prep(&mut this.payload)
            .flags(this.base_flags | flags)
            .user_data(this.handle.hdr.user_data());
        this.state = OpState::Submitted;
        register_entry(entry);
    }

    fn cancel_op(self: Pin<&mut Self>) {
        if self.state == OpState::Submitted && !self.handle.hdr.is_resumable() {
            self.handle.hdr.cancel();
        }
    }

    fn is_finished(&self) -> bool {
        self.handle.hdr.is_resumable()
    }

    fn take_result(self: Pin<&mut Self>) -> (i32, B::Out) {
        let this = unsafe { self.get_unchecked_mut() };
        this.state = OpState::Done;
        this.handle.extract()
    }
}

impl<P, F, C, B> Drop for MultiShotSelectFuture<'_, P, F, C, B> {
    fn drop(&mut self) {
        if self.state == OpState::Submitted && !self.handle.hdr.is_resumable() {
            oerror!("multishot buffer-select future dropped while in flight");
            std::process::abort();
        }
    }
}

impl_op_future!(MultiShotSelectFuture<'g, P, F, C, B> where F: FnOnce(&mut P) -> squeue::Entry, B: BufferRing, C: FnMut(i32, B::Out));

/// Zero-copy operation future. The handle outlives the future on the heap
/// until both the awaiter's resumption and the kernel's notification have
/// been seen; the free callback then runs with the notification result.
pub struct ZeroCopyOpFuture<P, F, C: FnOnce(i32)> {
    payload: P,
    prep: Option<F>,
    base_flags: squeue::Flags,
    handle: *mut ZeroCopyHandle<C>,
    state: OpState,
    _pin: PhantomPinned,
}

impl<P, F: FnOnce(&mut P) -> squeue::Entry, C: FnOnce(i32)> ZeroCopyOpFuture<P, F, C> {
    pub(crate) fn new(payload: P, prep: F, free_cb: C) -> Self {
        Self {
            payload,
            prep: Some(prep),
            base_flags: squeue::Flags::empty(),
            handle: ZeroCopyHandle::boxed(free_cb),
            state: OpState::Created,
            _pin: PhantomPinned,
        }
    }

    fn hdr(&self) -> &crate::handle::OpHeader {
        unsafe { &(*self.handle).hdr }
    }
}

impl<P, F: FnOnce(&mut P) -> squeue::Entry, C: FnOnce(i32)> RingOp for ZeroCopyOpFuture<P, F, C> {
    type Output = i32;

    fn set_target(self: Pin<&mut Self>, target: Target) {
        self.hdr().set_target(target);
    }

    fn register(self: Pin<&mut Self>, flags: squeue::Flags) {
        let this = unsafe { self.get_unchecked_mut() };
        debug_assert_eq!(this.state, OpState::Created);
        let prep = this.prep.take().expect("operation registered twice");
        let user_data = unsafe { (*this.handle).hdr.user_data() };
        let entry = prep(&mut this.payload)
            .flags(this.base_flags | flags)
            .user_data(user_data);
        this.state = OpState::Submitted;
        register_entry(entry);
    }

    fn cancel_op(self: Pin<&mut Self>) {
        if self.state == OpState::Submitted && !self.hdr().is_resumable() {
            self.hdr().cancel();
        }
    }

    fn is_finished(&self) -> bool {
        self.hdr().is_resumable()
    }

    fn take_result(self: Pin<&mut Self>) -> i32 {
        let this = unsafe { self.get_unchecked_mut() };
        let res = unsafe { (*this.handle).hdr.result() };
        this.state = OpState::Done;
        // May free the handle if the notification already arrived.
        unsafe { ZeroCopyHandle::mark_resumed(this.handle) };
        res
    }
}

impl<P, F, C: FnOnce(i32)> Drop for ZeroCopyOpFuture<P, F, C> {
    fn drop(&mut self) {
        match self.state {
            OpState::Created => unsafe { ZeroCopyHandle::discard(self.handle) },
            OpState::Submitted => {
                let resumable = unsafe { (*self.handle).hdr.is_resumable() };
                if !resumable {
                    oerror!("zero-copy future dropped while in flight");
                    std::process::abort();
                }
                // Completed but never extracted; let the handle finalize.
                unsafe { ZeroCopyHandle::mark_resumed(self.handle) };
            }
            OpState::Done => {}
        }
    }
}

impl<P, F, C> Future for ZeroCopyOpFuture<P, F, C>
where
    F: FnOnce(&mut P) -> squeue::Entry,
    C: FnOnce(i32),
{
    type Output = i32;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<i32> {
        match self.state {
            OpState::Created => {
                self.as_mut().set_target(Target::Waker(cx.waker().clone()));
                self.as_mut().register(squeue::Flags::empty());
                Poll::Pending
            }
            OpState::Submitted => {
                if self.is_finished() {
                    Poll::Ready(self.take_result())
                } else {
                    Poll::Pending
                }
            }
            OpState::Done => panic!("operation polled after completion"),
        }
    }
}

/// Wrap an operation with extra SQE flag bits (drain, always-async, ...).
/// This is how fixed-fd, drain and async-first behaviour are expressed
/// without dedicated wrappers.
pub struct Flagged<T> {
    inner: T,
    extra: squeue::Flags,
    registered: bool,
}

/// Or extra SQE flags into an operation's registration.
pub fn with_flags<T: RingOp>(op: T, extra: squeue::Flags) -> Flagged<T> {
    Flagged {
        inner: op,
        extra,
        registered: false,
    }
}

impl<T: RingOp> Flagged<T> {
    fn inner_pin(self: Pin<&mut Self>) -> Pin<&mut T> {
        unsafe { self.map_unchecked_mut(|s| &mut s.inner) }
    }
}

impl<T: RingOp> RingOp for Flagged<T> {
    type Output = T::Output;

    fn set_target(self: Pin<&mut Self>, target: Target) {
        self.inner_pin().set_target(target);
    }

    fn register(self: Pin<&mut Self>, flags: squeue::Flags) {
        let extra = self.extra;
        let this = unsafe { self.get_unchecked_mut() };
        this.registered = true;
        unsafe { Pin::new_unchecked(&mut this.inner) }.register(flags | extra);
    }

    fn cancel_op(self: Pin<&mut Self>) {
        self.inner_pin().cancel_op();
    }

    fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    fn take_result(self: Pin<&mut Self>) -> T::Output {
        self.inner_pin().take_result()
    }
}

impl<T: RingOp> Future for Flagged<T> {
    type Output = T::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if !self.registered {
            self.as_mut().set_target(Target::Waker(cx.waker().clone()));
            self.as_mut().register(squeue::Flags::empty());
        }
        if self.is_finished() {
            Poll::Ready(self.as_mut().take_result())
        } else {
            Poll::Pending
        }
    }
}
