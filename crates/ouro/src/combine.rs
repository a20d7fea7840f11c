//! Composite awaiters: wait-all, wait-any, link and hard-link over inner
//! operations.
//!
//! A composite owns its children and a core that counts completions in
//! arrival order. Children report through parent targets installed at
//! registration; wait-any cancels all siblings exactly once on the first
//! completion, and the composite only resolves after *every* child has
//! signalled, so late CQEs from cancelled children are always absorbed.
//! Composites implement [`RingOp`] themselves and therefore nest.

use crate::context;
use crate::handle::Target;
use crate::op::{OpState, RingOp};
use io_uring::squeue;
use std::cell::{Cell, UnsafeCell};
use std::future::Future;
use std::marker::PhantomPinned;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Shared completion accounting for one composite.
pub(crate) struct CompositeCore {
    n: Cell<usize>,
    canceled: Cell<bool>,
    cancel_on_first: bool,
    order: UnsafeCell<Vec<usize>>,
    target: UnsafeCell<Target>,
    owner: Cell<*mut ()>,
    cancel_siblings: Cell<Option<unsafe fn(*mut (), usize)>>,
}

impl CompositeCore {
    fn new(cancel_on_first: bool) -> Self {
        Self {
            n: Cell::new(usize::MAX),
            canceled: Cell::new(false),
            cancel_on_first,
            order: UnsafeCell::new(Vec::new()),
            target: UnsafeCell::new(Target::None),
            owner: Cell::new(std::ptr::null_mut()),
            cancel_siblings: Cell::new(None),
        }
    }

    fn set_target(&self, target: Target) {
        unsafe { *self.target.get() = target };
    }

    fn arm(&self, n: usize, owner: *mut (), cancel_siblings: unsafe fn(*mut (), usize)) {
        self.n.set(n);
        self.owner.set(owner);
        self.cancel_siblings.set(Some(cancel_siblings));
        unsafe { (*self.order.get()).reserve(n) };
    }

    fn is_finished(&self) -> bool {
        let n = self.n.get();
        n != usize::MAX && unsafe { (*self.order.get()).len() } == n
    }

    fn first_finished(&self) -> usize {
        unsafe { (&*self.order.get())[0] }
    }

    fn take_order(&self) -> Vec<usize> {
        unsafe { std::mem::take(&mut *self.order.get()) }
    }

    /// Claim the right to cancel the children. Idempotent.
    fn begin_cancel(&self) -> bool {
        if self.canceled.get() {
            return false;
        }
        self.canceled.set(true);
        true
    }

    /// Child completion hook; runs on the composite's runtime thread.
    pub(crate) unsafe fn child_finished(data: *mut (), idx: usize) {
        let core = &*(data as *const CompositeCore);
        (*core.order.get()).push(idx);
        if core.cancel_on_first && !core.canceled.get() {
            core.canceled.set(true);
            if let Some(cancel) = core.cancel_siblings.get() {
                cancel(core.owner.get(), idx);
            }
        }
        if (*core.order.get()).len() == core.n.get() {
            Target::fire(core.target.get());
        }
    }
}

fn parent_target(core: &CompositeCore, idx: usize) -> Target {
    Target::Parent {
        data: core as *const CompositeCore as *mut (),
        hook: CompositeCore::child_finished,
        idx,
    }
}

macro_rules! impl_composite_future {
    ($name:ident, $bound:ident) => {
        impl<T: $bound> Future for $name<T> {
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
                    OpState::Done => panic!("composite polled after completion"),
                }
            }
        }
    };
}

macro_rules! ranged_composite {
    (
        $(#[$meta:meta])*
        $name:ident, $ctor:ident,
        cancel_on_first: $cof:expr, link: $link:expr, nonempty: $ne:expr,
        output: $out:ty, extract: |$this:ident| $extract:block
    ) => {
        $(#[$meta])*
        pub struct $name<T: RingOp> {
            core: CompositeCore,
            children: Vec<T>,
            state: OpState,
            _pin: PhantomPinned,
        }

        $(#[$meta])*
        pub fn $ctor<T: RingOp>(children: Vec<T>) -> $name<T> {
            if $ne {
                assert!(!children.is_empty(), "composite needs at least one child");
            }
            $name {
                core: CompositeCore::new($cof),
                children,
                state: OpState::Created,
                _pin: PhantomPinned,
            }
        }

        impl<T: RingOp> $name<T> {
            unsafe fn extract_all(&mut self) -> Vec<T::Output> {
                self.children
                    .iter_mut()
                    .map(|c| Pin::new_unchecked(c).take_result())
                    .collect()
            }

            unsafe fn cancel_siblings(owner: *mut (), skip: usize) {
                let this = &mut *(owner as *mut Self);
                for (i, child) in this.children.iter_mut().enumerate() {
                    if i != skip {
                        Pin::new_unchecked(child).cancel_op();
                    }
                }
            }
        }

        impl<T: RingOp> RingOp for $name<T> {
            type Output = $out;

            fn set_target(self: Pin<&mut Self>, target: Target) {
                self.core.set_target(target);
            }

            fn register(self: Pin<&mut Self>, flags: squeue::Flags) {
                let this = unsafe { self.get_unchecked_mut() };
                debug_assert_eq!(this.state, OpState::Created);
                let n = this.children.len();
                let owner = this as *mut Self as *mut ();
                this.core.arm(n, owner, Self::cancel_siblings);
                let core = &this.core as *const CompositeCore;
                for (i, child) in this.children.iter_mut().enumerate() {
                    unsafe { Pin::new_unchecked(child).set_target(parent_target(&*core, i)) };
                }
                let link: Option<squeue::Flags> = $link;
                if link.is_some() {
                    // The whole chain must enter the kernel contiguously.
                    let rt = context::current_runtime()
                        .expect("composite registered outside a runtime");
                    rt.with_ring(|ring| ring.reserve_space(n));
                }
                for (i, child) in this.children.iter_mut().enumerate() {
                    let f = match link {
                        Some(lf) if i + 1 < n => flags | lf,
                        _ => flags,
                    };
                    unsafe { Pin::new_unchecked(child).register(f) };
                }
                this.state = OpState::Submitted;
            }

            fn cancel_op(self: Pin<&mut Self>) {
                let this = unsafe { self.get_unchecked_mut() };
                if this.state != OpState::Submitted || !this.core.begin_cancel() {
                    return;
                }
                for child in this.children.iter_mut() {
                    unsafe { Pin::new_unchecked(child).cancel_op() };
                }
            }

            fn is_finished(&self) -> bool {
                self.core.is_finished()
            }

            fn take_result(self: Pin<&mut Self>) -> $out {
                let $this = unsafe { self.get_unchecked_mut() };
                $this.state = OpState::Done;
                $extract
            }
        }

        impl_composite_future!($name, RingOp);
    };
}

ranged_composite!(
    /// Wait for every child; results come back in child order.
    WaitAll, wait_all,
    cancel_on_first: false, link: None, nonempty: false,
    output: Vec<T::Output>,
    extract: |this| { unsafe { this.extract_all() } }
);

ranged_composite!(
    /// Wait for the first child to finish, cancelling the rest; resolves to
    /// the winner's index and result once every child (cancelled ones
    /// included) has signalled.
    WaitAny, wait_any,
    cancel_on_first: true, link: None, nonempty: true,
    output: (usize, T::Output),
    extract: |this| {
        let winner = this.core.first_finished();
        let mut all = unsafe { this.extract_all() };
        (winner, all.swap_remove(winner))
    }
);

ranged_composite!(
    /// Like [`wait_all`] but also reports the completion order.
    ParallelAll, parallel_all,
    cancel_on_first: false, link: None, nonempty: false,
    output: (Vec<usize>, Vec<T::Output>),
    extract: |this| {
        let order = this.core.take_order();
        let all = unsafe { this.extract_all() };
        (order, all)
    }
);

ranged_composite!(
    /// Like [`wait_any`] but keeps every child's result alongside the
    /// completion order.
    ParallelAny, parallel_any,
    cancel_on_first: true, link: None, nonempty: true,
    output: (Vec<usize>, Vec<T::Output>),
    extract: |this| {
        let order = this.core.take_order();
        let all = unsafe { this.extract_all() };
        (order, all)
    }
);

ranged_composite!(
    /// Submit the children as one kernel-linked chain: each runs only after
    /// its predecessor succeeded.
    Link, link,
    cancel_on_first: false, link: Some(squeue::Flags::IO_LINK), nonempty: true,
    output: Vec<T::Output>,
    extract: |this| { unsafe { this.extract_all() } }
);

ranged_composite!(
    /// Like [`link`] but a failing child does not abort the tail.
    HardLink, hard_link,
    cancel_on_first: false, link: Some(squeue::Flags::IO_HARDLINK), nonempty: true,
    output: Vec<T::Output>,
    extract: |this| { unsafe { this.extract_all() } }
);

/// Winner of a two-way [`any`].
#[derive(Debug)]
pub enum AnyOf2<A, B> {
    First(A),
    Second(B),
}

/// Winner of a three-way [`any`].
#[derive(Debug)]
pub enum AnyOf3<A, B, C> {
    First(A),
    Second(B),
    Third(C),
}

/// Winner of a four-way [`any`].
#[derive(Debug)]
pub enum AnyOf4<A, B, C, D> {
    First(A),
    Second(B),
    Third(C),
    Fourth(D),
}

/// A fixed arity of heterogeneous operations, composable with [`all`],
/// [`any`], [`linked`] and [`hard_linked`].
pub trait OpTuple {
    type AllOutput;
    type AnyOutput;
    const LEN: usize;

    #[doc(hidden)]
    unsafe fn set_targets(&mut self, core: *const ());
    #[doc(hidden)]
    unsafe fn register_each(&mut self, flags: squeue::Flags, link: Option<squeue::Flags>);
    #[doc(hidden)]
    unsafe fn cancel_each(&mut self, skip: usize);
    #[doc(hidden)]
    unsafe fn take_all(&mut self) -> Self::AllOutput;
    #[doc(hidden)]
    unsafe fn take_any(&mut self, winner: usize) -> Self::AnyOutput;
}

macro_rules! impl_op_tuple {
    ($any:ident; $len:expr; $(($T:ident, $idx:tt, $var:ident)),+) => {
        impl<$($T: RingOp),+> OpTuple for ($($T,)+) {
            type AllOutput = ($($T::Output,)+);
            type AnyOutput = $any<$($T::Output),+>;
            const LEN: usize = $len;

            unsafe fn set_targets(&mut self, core: *const ()) {
                let core = core as *const CompositeCore;
                $(
                    Pin::new_unchecked(&mut self.$idx).set_target(parent_target(&*core, $idx));
                )+
            }

            unsafe fn register_each(&mut self, flags: squeue::Flags, link: Option<squeue::Flags>) {
                $(
                    let f = match link {
                        Some(lf) if $idx + 1 < $len => flags | lf,
                        _ => flags,
                    };
                    Pin::new_unchecked(&mut self.$idx).register(f);
                )+
            }

            unsafe fn cancel_each(&mut self, skip: usize) {
                $(
                    if $idx != skip {
                        Pin::new_unchecked(&mut self.$idx).cancel_op();
                    }
                )+
            }

            unsafe fn take_all(&mut self) -> Self::AllOutput {
                ($(
                    Pin::new_unchecked(&mut self.$idx).take_result(),
                )+)
            }

            unsafe fn take_any(&mut self, winner: usize) -> Self::AnyOutput {
                let all = self.take_all();
                match winner {
                    $($idx => $any::$var(all.$idx),)+
                    _ => unreachable!("winner index out of range"),
                }
            }
        }
    };
}

impl_op_tuple!(AnyOf2; 2; (A, 0, First), (B, 1, Second));
impl_op_tuple!(AnyOf3; 3; (A, 0, First), (B, 1, Second), (C, 2, Third));
impl_op_tuple!(AnyOf4; 4; (A, 0, First), (B, 1, Second), (C, 2, Third), (D, 3, Fourth));

macro_rules! tuple_composite {
    (
        $(#[$meta:meta])*
        $name:ident, $ctor:ident,
        cancel_on_first: $cof:expr, link: $link:expr,
        output: $outid:ident, extract: |$this:ident| $extract:block
    ) => {
        $(#[$meta])*
        pub struct $name<T: OpTuple> {
            core: CompositeCore,
            children: T,
            state: OpState,
            _pin: PhantomPinned,
        }

        $(#[$meta])*
        pub fn $ctor<T: OpTuple>(ops: T) -> $name<T> {
            $name {
                core: CompositeCore::new($cof),
                children: ops,
                state: OpState::Created,
                _pin: PhantomPinned,
            }
        }

        impl<T: OpTuple> $name<T> {
            unsafe fn cancel_siblings(owner: *mut (), skip: usize) {
                let this = &mut *(owner as *mut Self);
                this.children.cancel_each(skip);
            }
        }

        impl<T: OpTuple> RingOp for $name<T> {
            type Output = T::$outid;

            fn set_target(self: Pin<&mut Self>, target: Target) {
                self.core.set_target(target);
            }

            fn register(self: Pin<&mut Self>, flags: squeue::Flags) {
                let this = unsafe { self.get_unchecked_mut() };
                debug_assert_eq!(this.state, OpState::Created);
                let owner = this as *mut Self as *mut ();
                this.core.arm(T::LEN, owner, Self::cancel_siblings);
                let core = &this.core as *const CompositeCore as *const ();
                unsafe { this.children.set_targets(core) };
                let link: Option<squeue::Flags> = $link;
                if link.is_some() {
                    let rt = context::current_runtime()
                        .expect("composite registered outside a runtime");
                    rt.with_ring(|ring| ring.reserve_space(T::LEN));
                }
                unsafe { this.children.register_each(flags, link) };
                this.state = OpState::Submitted;
            }

            fn cancel_op(self: Pin<&mut Self>) {
                let this = unsafe { self.get_unchecked_mut() };
                if this.state != OpState::Submitted || !this.core.begin_cancel() {
                    return;
                }
                unsafe { this.children.cancel_each(usize::MAX) };
            }

            fn is_finished(&self) -> bool {
                self.core.is_finished()
            }

            fn take_result(self: Pin<&mut Self>) -> T::$outid {
                let $this = unsafe { self.get_unchecked_mut() };
                $this.state = OpState::Done;
                $extract
            }
        }

        impl_composite_future!($name, OpTuple);
    };
}

tuple_composite!(
    /// Wait for every operation of a heterogeneous tuple; resolves to the
    /// tuple of results.
    TupleAll, all,
    cancel_on_first: false, link: None,
    output: AllOutput,
    extract: |this| { unsafe { this.children.take_all() } }
);

tuple_composite!(
    /// Race a heterogeneous tuple: the first completion cancels its
    /// siblings and the sum type reports which child won.
    TupleAny, any,
    cancel_on_first: true, link: None,
    output: AnyOutput,
    extract: |this| {
        let winner = this.core.first_finished();
        unsafe { this.children.take_any(winner) }
    }
);

tuple_composite!(
    /// Kernel-linked heterogeneous chain.
    TupleLink, linked,
    cancel_on_first: false, link: Some(squeue::Flags::IO_LINK),
    output: AllOutput,
    extract: |this| { unsafe { this.children.take_all() } }
);

tuple_composite!(
    /// Kernel-hard-linked heterogeneous chain: failures do not abort the
    /// tail.
    TupleHardLink, hard_linked,
    cancel_on_first: false, link: Some(squeue::Flags::IO_HARDLINK),
    output: AllOutput,
    extract: |this| { unsafe { this.children.take_all() } }
);

#[cfg(test)]
mod tests {
    use super::*;

    /// A manually-completed child standing in for a ring op.
    struct TestOp {
        id: i32,
        target: UnsafeCell<Target>,
        registered: Cell<bool>,
        canceled: Cell<bool>,
        finished: Cell<bool>,
    }

    impl TestOp {
        fn new(id: i32) -> Self {
            Self {
                id,
                target: UnsafeCell::new(Target::None),
                registered: Cell::new(false),
                canceled: Cell::new(false),
                finished: Cell::new(false),
            }
        }

        /// Simulate the child's completion reaching the runtime queue.
        fn complete(&self) {
            assert!(self.registered.get());
            self.finished.set(true);
            unsafe { Target::fire(self.target.get()) };
        }
    }

    impl RingOp for TestOp {
        type Output = i32;

        fn set_target(self: Pin<&mut Self>, target: Target) {
            unsafe { *self.target.get() = target };
        }

        fn register(self: Pin<&mut Self>, _flags: squeue::Flags) {
            self.registered.set(true);
        }

        fn cancel_op(self: Pin<&mut Self>) {
            self.canceled.set(true);
        }

        fn is_finished(&self) -> bool {
            self.finished.get()
        }

        fn take_result(self: Pin<&mut Self>) -> i32 {
            self.id
        }
    }

    fn register<T: RingOp>(composite: Pin<&mut T>) {
        composite.register(squeue::Flags::empty());
    }

    #[test]
    fn test_wait_all_completes_after_every_child() {
        let mut c = Box::pin(wait_all(vec![TestOp::new(10), TestOp::new(11), TestOp::new(12)]));
        register(c.as_mut());
        assert!(!c.is_finished());
        c.children[1].complete();
        c.children[0].complete();
        assert!(!c.is_finished());
        c.children[2].complete();
        assert!(c.is_finished());
        assert_eq!(c.as_mut().take_result(), vec![10, 11, 12]);
    }

    #[test]
    fn test_wait_any_cancels_siblings_once() {
        let mut c = Box::pin(wait_any(vec![TestOp::new(0), TestOp::new(1), TestOp::new(2)]));
        register(c.as_mut());
        c.children[1].complete();
        assert!(c.children[0].canceled.get());
        assert!(!c.children[1].canceled.get());
        assert!(c.children[2].canceled.get());
        // Cancelled children still signal; only then does the composite
        // finish, reporting the winner.
        assert!(!c.is_finished());
        c.children[0].complete();
        c.children[2].complete();
        assert!(c.is_finished());
        let (winner, result) = c.as_mut().take_result();
        assert_eq!(winner, 1);
        assert_eq!(result, 1);
    }

    #[test]
    fn test_parallel_all_reports_order() {
        let mut c = Box::pin(parallel_all(vec![TestOp::new(7), TestOp::new(8), TestOp::new(9)]));
        register(c.as_mut());
        c.children[2].complete();
        c.children[0].complete();
        c.children[1].complete();
        let (order, results) = c.as_mut().take_result();
        assert_eq!(order, vec![2, 0, 1]);
        assert_eq!(results, vec![7, 8, 9]);
    }

    #[test]
    fn test_empty_wait_all_finishes_immediately() {
        let mut c = Box::pin(wait_all(Vec::<TestOp>::new()));
        register(c.as_mut());
        assert!(c.is_finished());
        assert!(c.as_mut().take_result().is_empty());
    }

    #[test]
    fn test_tuple_any_reports_winner_variant() {
        let mut c = Box::pin(any((TestOp::new(5), TestOp::new(6))));
        register(c.as_mut());
        c.children.1.complete();
        assert!(c.children.0.canceled.get());
        c.children.0.complete();
        assert!(c.is_finished());
        match c.as_mut().take_result() {
            AnyOf2::Second(v) => assert_eq!(v, 6),
            other => panic!("wrong winner: {:?}", other),
        }
    }

    #[test]
    fn test_nested_composition() {
        // (A && B) || (C && D)
        let mut c = Box::pin(any((
            all((TestOp::new(1), TestOp::new(2))),
            all((TestOp::new(3), TestOp::new(4))),
        )));
        register(c.as_mut());
        // Finish the second pair first; the first pair is cancelled but its
        // children still complete (as cancelled ops would).
        c.children.1.children.0.complete();
        c.children.1.children.1.complete();
        assert!(c.children.0.children.0.canceled.get());
        c.children.0.children.0.complete();
        c.children.0.children.1.complete();
        assert!(c.is_finished());
        match c.as_mut().take_result() {
            AnyOf2::Second((a, b)) => {
                assert_eq!(a, 3);
                assert_eq!(b, 4);
            }
            other => panic!("wrong winner: {:?}", other),
        }
    }

    #[test]
    #[should_panic(expected = "at least one child")]
    fn test_wait_any_rejects_empty() {
        let _ = wait_any(Vec::<TestOp>::new());
    }
}
