//! Thread-safe bounded channel.
//!
//! A ring buffer of capacity N (0 = unbuffered rendezvous), a closed flag
//! and two intrusive FIFO waiter lists behind one mutex. At any instant at
//! most one of the lists is non-empty. Waiters remember the runtime they
//! were created on; completing one means scheduling its work unit on that
//! runtime, so the channel is safe across runtimes. Push and pop awaiters
//! implement [`RingOp`] and compose with the combinators.

use crate::context;
use crate::handle::Target;
use crate::op::{OpState, RingOp};
use crate::runtime::Runtime;
use io_uring::squeue;
use ouro_core::list::{ListNode, NodeList};
use ouro_core::work::Work;
use std::cell::{Cell, UnsafeCell};
use std::collections::VecDeque;
use std::future::Future;
use std::marker::PhantomPinned;
use std::mem;
use std::pin::Pin;
use std::ptr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use std::task::{Context, Poll};

const W_WAITING: u8 = 0;
const W_GRANTED: u8 = 1;
const W_CLOSED: u8 = 2;
const W_CANCELED: u8 = 3;

/// Head shared by push and pop waiters. The list node comes first
/// (`repr(C)`) so a `*mut ListNode` is also a pointer to the waiter.
#[repr(C)]
struct WaiterCore {
    node: ListNode,
    work: Work,
    runtime: Cell<*const Runtime>,
    target: UnsafeCell<Target>,
    state: AtomicU8,
    pended: Cell<bool>,
    /// Set once the waiter's work ran on its home runtime; only then may
    /// the owning future complete.
    fired: Cell<bool>,
}

impl WaiterCore {
    fn new() -> Self {
        Self {
            node: ListNode::new(),
            work: Work::new(waiter_resume),
            runtime: Cell::new(ptr::null()),
            target: UnsafeCell::new(Target::None),
            state: AtomicU8::new(W_WAITING),
            pended: Cell::new(false),
            fired: Cell::new(false),
        }
    }

    fn work_ptr(&self) -> *mut Work {
        &self.work as *const Work as *mut Work
    }

    /// Queue this waiter for resumption on its home runtime. Callable from
    /// any thread (the peer side of the channel).
    unsafe fn schedule(core: *mut WaiterCore) {
        let rt = (*core).runtime.get();
        debug_assert!(!rt.is_null());
        (*rt).schedule_work((*core).work_ptr());
    }
}

unsafe fn waiter_resume(work: *mut Work) {
    let core =
        (work as *mut u8).sub(mem::offset_of!(WaiterCore, work)) as *mut WaiterCore;
    if (*core).pended.get() {
        (*core).pended.set(false);
        (*(*core).runtime.get()).resume_work();
    }
    (*core).fired.set(true);
    Target::fire((*core).target.get());
}

#[repr(C)]
struct PushWaiter<T> {
    core: WaiterCore,
    item: UnsafeCell<Option<T>>,
    /// Heap-allocated overflow entry from `force_push`; owns itself.
    fake: bool,
}

#[repr(C)]
struct PopWaiter<T> {
    core: WaiterCore,
    slot: UnsafeCell<Option<T>>,
}

struct Inner<T> {
    buf: VecDeque<T>,
    cap: usize,
    closed: bool,
    push_waiters: NodeList,
    pop_waiters: NodeList,
}

/// Bounded MPMC channel, closable, usable across runtimes.
pub struct Channel<T> {
    inner: Mutex<Inner<T>>,
}

unsafe impl<T: Send> Send for Channel<T> {}
unsafe impl<T: Send> Sync for Channel<T> {}

/// Hand `item` to the oldest pop waiter. Caller holds the lock.
unsafe fn grant_pop<T>(node: *mut ListNode, item: Option<T>, state: u8) {
    let waiter = node as *mut PopWaiter<T>;
    *(*waiter).slot.get() = item;
    (*waiter).core.state.store(state, Ordering::Release);
    WaiterCore::schedule(&mut (*waiter).core);
}

/// Take the oldest push waiter's item and wake (or free) it. Caller holds
/// the lock.
unsafe fn grant_push<T>(node: *mut ListNode) -> T {
    let waiter = node as *mut PushWaiter<T>;
    let item = (*(*waiter).item.get()).take().expect("push waiter without item");
    if (*waiter).fake {
        drop(Box::from_raw(waiter));
    } else {
        (*waiter).core.state.store(W_GRANTED, Ordering::Release);
        WaiterCore::schedule(&mut (*waiter).core);
    }
    item
}

impl<T> Inner<T> {
    /// Non-blocking push under the lock; hands off directly to a pop waiter
    /// when one is queued. The caller has already rejected closed channels.
    fn push_now(&mut self, item: T) -> Result<(), T> {
        debug_assert!(!self.closed);
        let node = self.pop_waiters.pop_front();
        if !node.is_null() {
            debug_assert!(self.buf.is_empty());
            unsafe { grant_pop(node, Some(item), W_GRANTED) };
            return Ok(());
        }
        if self.cap > 0 && self.buf.len() < self.cap {
            self.buf.push_back(item);
            return Ok(());
        }
        Err(item)
    }

    /// Non-blocking pop under the lock. FIFO: a queued push waiter's item
    /// goes behind whatever is already buffered.
    fn pop_now(&mut self) -> Option<T>
    where
        T: Default,
    {
        let node = self.push_waiters.pop_front();
        if !node.is_null() {
            let item = unsafe { grant_push::<T>(node) };
            if self.cap == 0 {
                // Rendezvous: direct transfer.
                return Some(item);
            }
            debug_assert_eq!(self.buf.len(), self.cap);
            let out = self.buf.pop_front();
            self.buf.push_back(item);
            return out;
        }
        if let Some(item) = self.buf.pop_front() {
            return Some(item);
        }
        if self.closed {
            // Default value signals "closed" to poppers.
            return Some(T::default());
        }
        None
    }
}

impl<T> Channel<T> {
    /// A channel holding up to `capacity` items; zero means unbuffered
    /// rendezvous.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                buf: VecDeque::with_capacity(capacity),
                cap: capacity,
                closed: false,
                push_waiters: NodeList::new(),
                pop_waiters: NodeList::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().cap
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Push without waiting. Returns false when the channel is full or
    /// closed.
    pub fn try_push(&self, item: T) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return false;
        }
        inner.push_now(item).is_ok()
    }

    /// Pop without waiting. `None` when empty; a default-constructed value
    /// when the channel is closed and drained (the "closed" signal).
    pub fn try_pop(&self) -> Option<T>
    where
        T: Default,
    {
        self.inner.lock().unwrap().pop_now()
    }

    /// Insert regardless of capacity. Overflow lands in a heap waiter that
    /// the next pop consumes, so fan-in callbacks routing completion
    /// results into a channel never block; size the channel for the
    /// worst-case fan-in or prefer the awaited [`push`](Self::push).
    ///
    /// Panics if the channel is closed.
    pub fn force_push(&self, item: T) {
        let mut inner = self.inner.lock().unwrap();
        assert!(!inner.closed, "push to closed channel");
        if let Err(item) = inner.push_now(item) {
            let waiter = Box::into_raw(Box::new(PushWaiter {
                core: WaiterCore::new(),
                item: UnsafeCell::new(Some(item)),
                fake: true,
            }));
            unsafe { inner.push_waiters.push_back(waiter as *mut ListNode) };
        }
    }

    /// Awaitable push; suspends while the channel is full. Resolves to
    /// true, or false when the wait was cancelled (the item is dropped).
    ///
    /// Panics if the channel is or becomes closed.
    pub fn push(&self, item: T) -> PushFuture<'_, T> {
        PushFuture {
            chan: self,
            waiter: PushWaiter {
                core: WaiterCore::new(),
                item: UnsafeCell::new(Some(item)),
                fake: false,
            },
            state: OpState::Created,
            _pin: PhantomPinned,
        }
    }

    /// Awaitable pop; suspends while the channel is empty. A closed channel
    /// yields `T::default()`.
    pub fn pop(&self) -> PopFuture<'_, T> {
        PopFuture {
            chan: self,
            waiter: PopWaiter {
                core: WaiterCore::new(),
                slot: UnsafeCell::new(None),
            },
            state: OpState::Created,
            _pin: PhantomPinned,
        }
    }

    /// Close the channel. Idempotent. Every queued pop waiter wakes with a
    /// default value; every queued push waiter wakes with the closed-channel
    /// error.
    pub fn push_close(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }
        inner.closed = true;
        loop {
            let node = inner.pop_waiters.pop_front();
            if node.is_null() {
                break;
            }
            unsafe { grant_pop::<T>(node, None, W_CLOSED) };
        }
        loop {
            let node = inner.push_waiters.pop_front();
            if node.is_null() {
                break;
            }
            unsafe {
                let waiter = node as *mut PushWaiter<T>;
                if (*waiter).fake {
                    drop(Box::from_raw(waiter));
                } else {
                    (*waiter).core.state.store(W_CLOSED, Ordering::Release);
                    WaiterCore::schedule(&mut (*waiter).core);
                }
            }
        }
    }
}

impl<T> Drop for Channel<T> {
    fn drop(&mut self) {
        // Waiter futures borrow the channel, so the lists are empty here;
        // buffered items and leftover fake waiters drop with the fields.
        let inner = self.inner.get_mut().unwrap();
        loop {
            let node = inner.push_waiters.pop_front();
            if node.is_null() {
                break;
            }
            let waiter = node as *mut PushWaiter<T>;
            unsafe {
                debug_assert!((*waiter).fake, "real waiter outlived its channel");
                drop(Box::from_raw(waiter));
            }
        }
    }
}

/// Awaiter for [`Channel::push`].
pub struct PushFuture<'a, T> {
    chan: &'a Channel<T>,
    waiter: PushWaiter<T>,
    state: OpState,
    _pin: PhantomPinned,
}

impl<T> PushFuture<'_, T> {
    fn result_now(&self) -> bool {
        match self.waiter.core.state.load(Ordering::Acquire) {
            W_GRANTED => true,
            W_CANCELED => false,
            W_CLOSED => panic!("push to closed channel"),
            _ => unreachable!("push completed while still waiting"),
        }
    }
}

impl<T> RingOp for PushFuture<'_, T> {
    type Output = bool;

    fn set_target(self: Pin<&mut Self>, target: Target) {
        unsafe { *self.waiter.core.target.get() = target };
    }

    fn register(self: Pin<&mut Self>, _flags: squeue::Flags) {
        let this = unsafe { self.get_unchecked_mut() };
        debug_assert_eq!(this.state, OpState::Created);
        let rt = context::current_runtime().expect("channel push outside a runtime");
        this.waiter.core.runtime.set(rt);
        this.state = OpState::Submitted;

        let mut inner = this.chan.inner.lock().unwrap();
        if inner.closed {
            drop(inner);
            panic!("push to closed channel");
        }
        let item = unsafe { (*this.waiter.item.get()).take().unwrap() };
        match inner.push_now(item) {
            Ok(()) => {
                drop(inner);
                // Completed without waiting; report through the queue so
                // the parent (or waker) fires on this runtime.
                this.waiter.core.state.store(W_GRANTED, Ordering::Release);
                unsafe { WaiterCore::schedule(&mut this.waiter.core) };
            }
            Err(item) => {
                unsafe { *this.waiter.item.get() = Some(item) };
                unsafe {
                    inner
                        .push_waiters
                        .push_back(&this.waiter.core.node as *const ListNode as *mut ListNode)
                };
                rt.pend_work();
                this.waiter.core.pended.set(true);
            }
        }
    }

    fn cancel_op(self: Pin<&mut Self>) {
        let this = unsafe { self.get_unchecked_mut() };
        if this.state != OpState::Submitted {
            return;
        }
        let node = &this.waiter.core.node as *const ListNode as *mut ListNode;
        let mut inner = this.chan.inner.lock().unwrap();
        let removed = unsafe { inner.push_waiters.remove(node) };
        drop(inner);
        if removed {
            this.waiter.core.state.store(W_CANCELED, Ordering::Release);
            let rt = this.waiter.core.runtime.get();
            unsafe { (*rt).resume_work() };
            this.waiter.core.pended.set(false);
            unsafe { WaiterCore::schedule(&mut this.waiter.core) };
        }
    }

    fn is_finished(&self) -> bool {
        self.waiter.core.fired.get()
    }

    fn take_result(self: Pin<&mut Self>) -> bool {
        let this = unsafe { self.get_unchecked_mut() };
        this.state = OpState::Done;
        this.result_now()
    }
}

impl<T> Future for PushFuture<'_, T> {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        match self.state {
            OpState::Created => {
                let this = unsafe { self.as_mut().get_unchecked_mut() };
                let rt = context::current_runtime().expect("channel push outside a runtime");
                this.waiter.core.runtime.set(rt);

                let mut inner = this.chan.inner.lock().unwrap();
                if inner.closed {
                    drop(inner);
                    panic!("push to closed channel");
                }
                let item = unsafe { (*this.waiter.item.get()).take().unwrap() };
                match inner.push_now(item) {
                    Ok(()) => {
                        this.state = OpState::Done;
                        Poll::Ready(true)
                    }
                    Err(item) => {
                        unsafe { *this.waiter.item.get() = Some(item) };
                        unsafe {
                            *this.waiter.core.target.get() =
                                Target::Waker(cx.waker().clone());
                            inner.push_waiters.push_back(
                                &this.waiter.core.node as *const ListNode as *mut ListNode,
                            );
                        }
                        rt.pend_work();
                        this.waiter.core.pended.set(true);
                        this.state = OpState::Submitted;
                        Poll::Pending
                    }
                }
            }
            OpState::Submitted => {
                if self.is_finished() {
                    Poll::Ready(self.take_result())
                } else {
                    Poll::Pending
                }
            }
            OpState::Done => panic!("channel push polled after completion"),
        }
    }
}

impl<T> Drop for PushFuture<'_, T> {
    fn drop(&mut self) {
        if self.state != OpState::Submitted || self.waiter.core.fired.get() {
            return;
        }
        // Still waiting: unlink gracefully. A granted-but-unfired waiter
        // has its work sitting in a runtime queue and cannot be freed.
        let node = &self.waiter.core.node as *const ListNode as *mut ListNode;
        let mut inner = self.chan.inner.lock().unwrap();
        let removed = unsafe { inner.push_waiters.remove(node) };
        drop(inner);
        if removed {
            if self.waiter.core.pended.get() {
                unsafe { (*self.waiter.core.runtime.get()).resume_work() };
            }
        } else {
            ouro_core::oerror!("channel waiter dropped while being woken");
            std::process::abort();
        }
    }
}

/// Awaiter for [`Channel::pop`].
pub struct PopFuture<'a, T> {
    chan: &'a Channel<T>,
    waiter: PopWaiter<T>,
    state: OpState,
    _pin: PhantomPinned,
}

impl<T: Default> PopFuture<'_, T> {
    fn result_now(&self) -> T {
        match self.waiter.core.state.load(Ordering::Acquire) {
            W_GRANTED => unsafe { (*self.waiter.slot.get()).take().unwrap_or_default() },
            W_CLOSED | W_CANCELED => T::default(),
            _ => unreachable!("pop completed while still waiting"),
        }
    }
}

impl<T: Default> RingOp for PopFuture<'_, T> {
    type Output = T;

    fn set_target(self: Pin<&mut Self>, target: Target) {
        unsafe { *self.waiter.core.target.get() = target };
    }

    fn register(self: Pin<&mut Self>, _flags: squeue::Flags) {
        let this = unsafe { self.get_unchecked_mut() };
        debug_assert_eq!(this.state, OpState::Created);
        let rt = context::current_runtime().expect("channel pop outside a runtime");
        this.waiter.core.runtime.set(rt);
        this.state = OpState::Submitted;

        let mut inner = this.chan.inner.lock().unwrap();
        match inner.pop_now() {
            Some(item) => {
                drop(inner);
                unsafe { *this.waiter.slot.get() = Some(item) };
                this.waiter.core.state.store(W_GRANTED, Ordering::Release);
                unsafe { WaiterCore::schedule(&mut this.waiter.core) };
            }
            None => {
                unsafe {
                    inner
                        .pop_waiters
                        .push_back(&this.waiter.core.node as *const ListNode as *mut ListNode)
                };
                rt.pend_work();
                this.waiter.core.pended.set(true);
            }
        }
    }

    fn cancel_op(self: Pin<&mut Self>) {
        let this = unsafe { self.get_unchecked_mut() };
        if this.state != OpState::Submitted {
            return;
        }
        let node = &this.waiter.core.node as *const ListNode as *mut ListNode;
        let mut inner = this.chan.inner.lock().unwrap();
        let removed = unsafe { inner.pop_waiters.remove(node) };
        drop(inner);
        if removed {
            this.waiter.core.state.store(W_CANCELED, Ordering::Release);
            let rt = this.waiter.core.runtime.get();
            unsafe { (*rt).resume_work() };
            this.waiter.core.pended.set(false);
            unsafe { WaiterCore::schedule(&mut this.waiter.core) };
        }
    }

    fn is_finished(&self) -> bool {
        self.waiter.core.fired.get()
    }

    fn take_result(self: Pin<&mut Self>) -> T {
        let this = unsafe { self.get_unchecked_mut() };
        this.state = OpState::Done;
        this.result_now()
    }
}

impl<T: Default> Future for PopFuture<'_, T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        match self.state {
            OpState::Created => {
                let this = unsafe { self.as_mut().get_unchecked_mut() };
                let rt = context::current_runtime().expect("channel pop outside a runtime");
                this.waiter.core.runtime.set(rt);

                let mut inner = this.chan.inner.lock().unwrap();
                match inner.pop_now() {
                    Some(item) => {
                        this.state = OpState::Done;
                        Poll::Ready(item)
                    }
                    None => {
                        unsafe {
                            *this.waiter.core.target.get() =
                                Target::Waker(cx.waker().clone());
                            inner.pop_waiters.push_back(
                                &this.waiter.core.node as *const ListNode as *mut ListNode,
                            );
                        }
                        rt.pend_work();
                        this.waiter.core.pended.set(true);
                        this.state = OpState::Submitted;
                        Poll::Pending
                    }
                }
            }
            OpState::Submitted => {
                if self.is_finished() {
                    Poll::Ready(self.take_result())
                } else {
                    Poll::Pending
                }
            }
            OpState::Done => panic!("channel pop polled after completion"),
        }
    }
}

impl<T> Drop for PopFuture<'_, T> {
    fn drop(&mut self) {
        if self.state != OpState::Submitted || self.waiter.core.fired.get() {
            return;
        }
        let node = &self.waiter.core.node as *const ListNode as *mut ListNode;
        let mut inner = self.chan.inner.lock().unwrap();
        let removed = unsafe { inner.pop_waiters.remove(node) };
        drop(inner);
        if removed {
            if self.waiter.core.pended.get() {
                unsafe { (*self.waiter.core.runtime.get()).resume_work() };
            }
        } else {
            ouro_core::oerror!("channel waiter dropped while being woken");
            std::process::abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_push_pop_roundtrip() {
        let chan: Channel<i32> = Channel::new(4);
        assert!(chan.try_push(1));
        assert!(chan.try_push(2));
        assert_eq!(chan.len(), 2);
        assert_eq!(chan.try_pop(), Some(1));
        assert_eq!(chan.try_pop(), Some(2));
        assert_eq!(chan.try_pop(), None);
    }

    #[test]
    fn test_try_push_full() {
        let chan: Channel<i32> = Channel::new(1);
        assert!(chan.try_push(1));
        assert!(!chan.try_push(2));
        assert_eq!(chan.try_pop(), Some(1));
        assert!(chan.try_push(2));
    }

    #[test]
    fn test_rendezvous_try_push_never_buffers() {
        let chan: Channel<i32> = Channel::new(0);
        assert!(!chan.try_push(1));
        assert_eq!(chan.try_pop(), None);
    }

    #[test]
    fn test_closed_pop_yields_default() {
        let chan: Channel<i32> = Channel::new(2);
        assert!(chan.try_push(9));
        chan.push_close();
        assert!(!chan.try_push(1));
        // Buffered item drains first, then the closed signal.
        assert_eq!(chan.try_pop(), Some(9));
        assert_eq!(chan.try_pop(), Some(0));
        assert_eq!(chan.try_pop(), Some(0));
    }

    #[test]
    fn test_close_is_idempotent() {
        let chan: Channel<i32> = Channel::new(1);
        chan.push_close();
        chan.push_close();
        assert!(chan.is_closed());
    }

    #[test]
    fn test_force_push_overflows_and_preserves_order() {
        let chan: Channel<i32> = Channel::new(1);
        chan.force_push(1);
        chan.force_push(2);
        chan.force_push(3);
        assert_eq!(chan.try_pop(), Some(1));
        assert_eq!(chan.try_pop(), Some(2));
        assert_eq!(chan.try_pop(), Some(3));
        assert_eq!(chan.try_pop(), None);
    }

    #[test]
    fn test_force_push_overflow_dropped_with_channel() {
        let chan: Channel<String> = Channel::new(1);
        chan.force_push("a".into());
        chan.force_push("b".into());
        drop(chan); // fake waiter freed, no leak
    }

    #[test]
    #[should_panic(expected = "closed channel")]
    fn test_force_push_closed_panics() {
        let chan: Channel<i32> = Channel::new(1);
        chan.push_close();
        chan.force_push(1);
    }
}
