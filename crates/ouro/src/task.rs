//! Spawned tasks.
//!
//! A spawned future lives in a heap cell headed by the runtime's work link,
//! a reference count and the home-runtime pointer its waker schedules
//! through. [`Task`] is the move-only join handle: it must be awaited,
//! waited on (outside any runtime) or detached; dropping it un-joined
//! aborts the process. Panics inside a task are captured and rethrown at
//! the join point; a panic in a detached task aborts.

use crate::context;
use crate::options::RuntimeOptions;
use crate::runtime::Runtime;
use ouro_core::oerror;
use ouro_core::work::Work;
use std::any::Any;
use std::cell::{Cell, UnsafeCell};
use std::future::Future;
use std::marker::PhantomData;
use std::mem::{self, ManuallyDrop};
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::ptr;
use std::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex as StdMutex};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

const JOIN_EMPTY: u8 = 0;
const JOIN_REGISTERED: u8 = 1;
const JOIN_FINISHED: u8 = 2;

const FLAG_DETACHED: u8 = 1;

/// Who to tell when the task finishes.
enum JoinSlot {
    Empty,
    Waker(Waker),
    Thread(Arc<(StdMutex<bool>, Condvar)>),
}

/// Header shared by every task cell; always the first field (`repr(C)`),
/// so `*mut Work`, `*mut TaskHeader` and `*mut TaskCell<F>` coincide.
#[repr(C)]
pub(crate) struct TaskHeader {
    work: Work,
    refs: AtomicUsize,
    queued: AtomicBool,
    runtime: AtomicPtr<Runtime>,
    switch_to: Cell<*const Runtime>,
    join_state: AtomicU8,
    flags: AtomicU8,
    join: UnsafeCell<JoinSlot>,
    drop_cell: unsafe fn(*mut TaskHeader),
}

impl TaskHeader {
    pub(crate) fn work_ptr(&self) -> *mut Work {
        &self.work as *const Work as *mut Work
    }

    /// Reroute this task to another runtime at the next suspension point.
    pub(crate) fn request_switch(&self, target: *const Runtime) {
        self.switch_to.set(target);
    }
}

#[repr(C)]
struct TaskCell<F: Future> {
    header: TaskHeader,
    stage: UnsafeCell<Stage<F>>,
}

enum Stage<F: Future> {
    Running(F),
    Finished(Result<F::Output, Box<dyn Any + Send>>),
    Taken,
}

static TASK_WAKER_VTABLE: RawWakerVTable =
    RawWakerVTable::new(waker_clone, waker_wake, waker_wake_by_ref, waker_drop);

unsafe fn waker_clone(data: *const ()) -> RawWaker {
    let hdr = data as *mut TaskHeader;
    (*hdr).refs.fetch_add(1, Ordering::Relaxed);
    RawWaker::new(data, &TASK_WAKER_VTABLE)
}

unsafe fn waker_wake(data: *const ()) {
    let hdr = data as *mut TaskHeader;
    if (*hdr)
        .queued
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
    {
        // The waker's reference transfers to the queue.
        schedule_header(hdr);
    } else {
        drop_header_ref(hdr);
    }
}

unsafe fn waker_wake_by_ref(data: *const ()) {
    let hdr = data as *mut TaskHeader;
    if (*hdr)
        .queued
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
    {
        (*hdr).refs.fetch_add(1, Ordering::Relaxed);
        schedule_header(hdr);
    }
}

unsafe fn waker_drop(data: *const ()) {
    drop_header_ref(data as *mut TaskHeader);
}

unsafe fn schedule_header(hdr: *mut TaskHeader) {
    let rt = (*hdr).runtime.load(Ordering::Acquire);
    debug_assert!(!rt.is_null());
    (*rt).schedule_work((*hdr).work_ptr());
}

unsafe fn drop_header_ref(hdr: *mut TaskHeader) {
    if (*hdr).refs.fetch_sub(1, Ordering::AcqRel) == 1 {
        fence(Ordering::Acquire);
        ((*hdr).drop_cell)(hdr);
    }
}

unsafe fn drop_cell<F: Future>(hdr: *mut TaskHeader) {
    drop(Box::from_raw(hdr as *mut TaskCell<F>));
}

/// Poll entry point invoked from the runtime's ready queue.
unsafe fn task_resume<F: Future>(work: *mut Work) {
    let hdr = work as *mut TaskHeader;
    let cell = work as *mut TaskCell<F>;
    (*hdr).queued.store(false, Ordering::Release);

    let previous_task = context::current_task();
    context::set_current_task(hdr);
    let waker = ManuallyDrop::new(Waker::from_raw(RawWaker::new(
        hdr as *const (),
        &TASK_WAKER_VTABLE,
    )));
    let mut cx = Context::from_waker(&waker);
    let poll = {
        let stage = &mut *(*cell).stage.get();
        let fut = match stage {
            Stage::Running(f) => f,
            _ => unreachable!("completed task polled"),
        };
        catch_unwind(AssertUnwindSafe(|| Pin::new_unchecked(fut).poll(&mut cx)))
    };
    context::set_current_task(previous_task);

    match poll {
        Ok(Poll::Pending) => {
            let target = (*hdr).switch_to.replace(ptr::null());
            if !target.is_null() {
                // Clean handoff: requeue on the new home runtime, keeping
                // the queue reference.
                (*hdr).runtime.store(target as *mut Runtime, Ordering::Release);
                (*hdr).queued.store(true, Ordering::Release);
                (*target).schedule_work((*hdr).work_ptr());
            } else {
                drop_header_ref(hdr);
            }
        }
        Ok(Poll::Ready(value)) => finish_task::<F>(cell, Ok(value)),
        Err(payload) => finish_task::<F>(cell, Err(payload)),
    }
}

unsafe fn finish_task<F: Future>(
    cell: *mut TaskCell<F>,
    result: Result<F::Output, Box<dyn Any + Send>>,
) {
    let hdr = cell as *mut TaskHeader;
    let panicked = result.is_err();
    *(*cell).stage.get() = Stage::Finished(result);

    match (*hdr).join_state.compare_exchange(
        JOIN_EMPTY,
        JOIN_FINISHED,
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(_) => {}
        Err(_) => {
            // A joiner registered first; the slot is ours to fire.
            let slot = mem::replace(&mut *(*hdr).join.get(), JoinSlot::Empty);
            (*hdr).join_state.store(JOIN_FINISHED, Ordering::Release);
            match slot {
                JoinSlot::Waker(waker) => waker.wake(),
                JoinSlot::Thread(pair) => {
                    let (lock, cv) = &*pair;
                    *lock.lock().unwrap() = true;
                    cv.notify_one();
                }
                JoinSlot::Empty => {}
            }
        }
    }

    if (*hdr).flags.load(Ordering::Acquire) & FLAG_DETACHED != 0 && panicked {
        oerror!("unhandled panic in detached task");
        std::process::abort();
    }

    drop_header_ref(hdr);
}

fn spawn_inner<F: Future>(rt: &Runtime, future: F) -> Task<F::Output> {
    let cell = Box::into_raw(Box::new(TaskCell {
        header: TaskHeader {
            work: Work::new(task_resume::<F>),
            // One reference for the ready queue, one for the Task handle.
            refs: AtomicUsize::new(2),
            queued: AtomicBool::new(true),
            runtime: AtomicPtr::new(rt as *const Runtime as *mut Runtime),
            switch_to: Cell::new(ptr::null()),
            join_state: AtomicU8::new(JOIN_EMPTY),
            flags: AtomicU8::new(0),
            join: UnsafeCell::new(JoinSlot::Empty),
            drop_cell: drop_cell::<F>,
        },
        stage: UnsafeCell::new(Stage::Running(future)),
    }));
    let hdr = cell as *mut TaskHeader;
    rt.schedule_work(unsafe { (*hdr).work_ptr() });
    Task {
        hdr,
        take: take_result::<F>,
        pended: false,
        _marker: PhantomData,
    }
}

unsafe fn take_result<F: Future>(
    hdr: *mut TaskHeader,
) -> Result<F::Output, Box<dyn Any + Send>> {
    let cell = hdr as *mut TaskCell<F>;
    match mem::replace(&mut *(*cell).stage.get(), Stage::Taken) {
        Stage::Finished(result) => result,
        _ => unreachable!("task result taken before completion"),
    }
}

/// Spawn a coroutine onto the current runtime.
///
/// Panics when called outside a running runtime.
pub fn spawn<F>(future: F) -> Task<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send,
{
    let rt = context::current_runtime().expect("no current runtime to spawn onto");
    spawn_inner(rt, future)
}

/// Spawn a coroutine onto the given runtime, which may belong to another
/// thread.
pub fn spawn_on<F>(rt: &Runtime, future: F) -> Task<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send,
{
    spawn_inner(rt, future)
}

/// Move-only handle to a spawned coroutine.
///
/// A `Task` must be consumed: `.await` it from a coroutine, block on
/// [`wait`](Task::wait) from outside any runtime, or [`detach`](Task::detach)
/// it. Dropping an unconsumed `Task` aborts.
pub struct Task<T> {
    hdr: *mut TaskHeader,
    take: unsafe fn(*mut TaskHeader) -> Result<T, Box<dyn Any + Send>>,
    pended: bool,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for Task<T> {}

impl<T> Task<T> {
    /// Whether this handle can still be awaited or waited on.
    pub fn awaitable(&self) -> bool {
        !self.hdr.is_null()
    }

    /// Give up the join capability; the coroutine keeps running. An
    /// unhandled panic in a detached task aborts the process.
    pub fn detach(mut self) {
        let hdr = self.hdr;
        assert!(!hdr.is_null(), "task already consumed");
        unsafe {
            (*hdr).flags.fetch_or(FLAG_DETACHED, Ordering::AcqRel);
            if (*hdr).join_state.load(Ordering::Acquire) == JOIN_FINISHED {
                // Finished before we detached: surface a swallowed panic.
                match (self.take)(hdr) {
                    Ok(value) => drop(value),
                    Err(payload) => {
                        drop(payload);
                        oerror!("unhandled panic in detached task");
                        std::process::abort();
                    }
                }
            }
            drop_header_ref(hdr);
        }
        self.hdr = ptr::null_mut();
    }

    /// Block the calling thread until the coroutine finishes and return its
    /// result. Must not be called from inside any runtime.
    ///
    /// Panics (rethrows) if the coroutine panicked.
    pub fn wait(mut self) -> T {
        assert!(
            !context::in_runtime(),
            "blocking wait on a task from inside a runtime"
        );
        let hdr = self.hdr;
        assert!(!hdr.is_null(), "task not awaitable");
        unsafe {
            let pair = Arc::new((StdMutex::new(false), Condvar::new()));
            *(*hdr).join.get() = JoinSlot::Thread(pair.clone());
            if (*hdr)
                .join_state
                .compare_exchange(JOIN_EMPTY, JOIN_REGISTERED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let (lock, cv) = &*pair;
                let mut done = lock.lock().unwrap();
                while !*done {
                    done = cv.wait(done).unwrap();
                }
            } else {
                *(*hdr).join.get() = JoinSlot::Empty;
            }
            let result = (self.take)(hdr);
            drop_header_ref(hdr);
            self.hdr = ptr::null_mut();
            match result {
                Ok(value) => value,
                Err(payload) => resume_unwind(payload),
            }
        }
    }
}

impl<T> Future for Task<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = unsafe { self.get_unchecked_mut() };
        let hdr = this.hdr;
        assert!(!hdr.is_null(), "task polled after completion");
        unsafe {
            if !this.pended {
                let rt = context::current_runtime().expect("task awaited outside a runtime");
                // The caller suspends on us; keep its runtime alive.
                rt.pend_work();
                this.pended = true;
                *(*hdr).join.get() = JoinSlot::Waker(cx.waker().clone());
                if (*hdr)
                    .join_state
                    .compare_exchange(
                        JOIN_EMPTY,
                        JOIN_REGISTERED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    return Poll::Pending;
                }
                *(*hdr).join.get() = JoinSlot::Empty;
            }
            if (*hdr).join_state.load(Ordering::Acquire) == JOIN_FINISHED {
                let rt = context::current_runtime().expect("task awaited outside a runtime");
                rt.resume_work();
                let result = (this.take)(hdr);
                drop_header_ref(hdr);
                this.hdr = ptr::null_mut();
                match result {
                    Ok(value) => Poll::Ready(value),
                    Err(payload) => resume_unwind(payload),
                }
            } else {
                Poll::Pending
            }
        }
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        if !self.hdr.is_null() {
            oerror!("Task dropped without being awaited or detached");
            std::process::abort();
        }
    }
}

/// Reschedule the current coroutine onto `target`, producing a clean thread
/// handoff: the task finishes its current slice here and resumes over there.
pub fn switch_to(target: &Runtime) -> SwitchTo<'_> {
    SwitchTo {
        target,
        done: false,
    }
}

pub struct SwitchTo<'a> {
    target: &'a Runtime,
    done: bool,
}

impl Future for SwitchTo<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.done {
            return Poll::Ready(());
        }
        let task = context::current_task();
        assert!(!task.is_null(), "co_switch outside a spawned task");
        if ptr::eq(self.target as *const Runtime, context::current_runtime_ptr()) {
            return Poll::Ready(());
        }
        self.done = true;
        unsafe { (*task).request_switch(self.target as *const Runtime) };
        Poll::Pending
    }
}

/// Spawn `future` on `runtime`, run the runtime to completion on this
/// thread, and return the future's result.
pub fn block_on<F>(runtime: &Runtime, future: F) -> F::Output
where
    F: Future + 'static,
{
    // The future is created and polled on this very thread, so the usual
    // Send bound of spawn does not apply. Switching runtimes from inside a
    // block_on future requires the future to be Send regardless.
    let task = spawn_inner(runtime, future);
    runtime.allow_exit();
    if let Err(e) = runtime.run() {
        panic!("runtime failed: {}", e);
    }
    task.wait()
}

/// [`block_on`] with a freshly built default runtime.
pub fn block_on_default<F>(future: F) -> F::Output
where
    F: Future + 'static,
{
    let runtime = Runtime::new(RuntimeOptions::default())
        .unwrap_or_else(|e| panic!("cannot create runtime: {}", e));
    block_on(&runtime, future)
}
