//! The single-threaded event loop.
//!
//! A runtime owns one ring, a local intrusive ready queue and a
//! mutex-protected global inbox. Every in-flight operation contributes one
//! unit to the pending-work counter (seeded at 1 so the loop survives until
//! [`allow_exit`]); the loop exits when the counter reaches zero with an
//! empty ready queue. Work scheduled from other threads arrives either as a
//! ring-to-ring message or through the global inbox plus an eventfd poke.
//!
//! [`allow_exit`]: Runtime::allow_exit

use crate::context;
use crate::error::{Result, RuntimeError};
use crate::handle::OpHeader;
use crate::notifier::EventFd;
use crate::options::RuntimeOptions;
use io_uring::{opcode, types, IoUring};
use ouro_core::work::{decode_work, encode_work, Work, WorkList, WorkTag};
use ouro_core::{oerror, olog, owarn};
use ouro_uring::{Cqe, Features, Ring};
use std::cell::UnsafeCell;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr;
use std::sync::atomic::{fence, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;

const STATE_IDLE: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_ENABLED: u8 = 2;
const STATE_STOPPED: u8 = 3;

static NEXT_RUNTIME_ID: AtomicU32 = AtomicU32::new(0);

/// State owned exclusively by the loop thread.
struct Local {
    ring: Ring,
    queue: WorkList,
    tick: u64,
    scratch: Vec<Cqe>,
    notify_buf: u64,
}

/// Single-threaded cooperative executor pinned to the thread that calls
/// [`run`](Runtime::run). Multiple runtimes may coexist in one process and
/// talk through [`schedule`](Runtime::schedule_work)-based paths (task
/// wakeups, channels).
///
/// The runtime must outlive every task spawned onto it and every waiter
/// created from it; `run` does not return while such work is pending.
pub struct Runtime {
    id: u32,
    event_interval: u64,
    register_ring_fd: bool,
    ring_fd: RawFd,
    features: Features,
    state: AtomicU8,
    pending_works: AtomicUsize,
    global: Mutex<WorkList>,
    notifier: EventFd,
    local: UnsafeCell<Local>,
}

// The `local` field is touched only by the loop thread (guarded by the
// thread-local context); everything else is atomics, a mutex and the
// eventfd.
unsafe impl Send for Runtime {}
unsafe impl Sync for Runtime {}

impl Runtime {
    pub fn new(options: RuntimeOptions) -> Result<Self> {
        options.validate()?;

        let mut builder = IoUring::builder();
        builder
            .setup_clamp()
            .setup_single_issuer()
            .setup_submit_all()
            .setup_r_disabled();
        if options.cq_size != 0 {
            builder.setup_cqsize(options.cq_size);
        }
        if options.enable_iopoll {
            builder.setup_iopoll();
        }
        if options.enable_sqpoll {
            builder.setup_sqpoll(options.sqpoll_idle_ms);
            if let Some(cpu) = options.sqpoll_cpu {
                builder.setup_sqpoll_cpu(cpu);
            }
        }
        if let Some(fd) = options.attach_wq_fd {
            builder.setup_attach_wq(fd);
        }
        if options.enable_defer_taskrun {
            builder.setup_defer_taskrun().setup_taskrun_flag();
        }
        if options.enable_coop_taskrun {
            builder.setup_coop_taskrun().setup_taskrun_flag();
        }

        let io = builder
            .build(options.sq_size)
            .map_err(|e| RuntimeError::Setup(e.raw_os_error().unwrap_or(libc::EINVAL)))?;
        let features = match Features::probe(&io) {
            Ok(f) => f,
            Err(e) => {
                owarn!("kernel probe failed, optional ops disabled: {}", e);
                Features::none()
            }
        };
        let ring_fd = io.as_raw_fd();
        let notifier = EventFd::create()
            .map_err(|e| RuntimeError::Setup(e.raw_os_error().unwrap_or(libc::EINVAL)))?;

        Ok(Self {
            id: NEXT_RUNTIME_ID.fetch_add(1, Ordering::Relaxed),
            event_interval: options.event_interval,
            register_ring_fd: !options.disable_register_ring_fd,
            ring_fd,
            features,
            state: AtomicU8::new(STATE_IDLE),
            pending_works: AtomicUsize::new(1),
            global: Mutex::new(WorkList::new()),
            notifier,
            local: UnsafeCell::new(Local {
                ring: Ring::new(io, options.enable_sqpoll),
                queue: WorkList::new(),
                tick: 0,
                scratch: Vec::with_capacity(256),
                notify_buf: 0,
            }),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn ring_fd(&self) -> RawFd {
        self.ring_fd
    }

    /// Optional kernel operations detected at construction.
    pub fn features(&self) -> &Features {
        &self.features
    }

    /// Current pending-work count (in-flight ops plus explicit pends plus
    /// the construction seed).
    pub fn pending_works(&self) -> usize {
        self.pending_works.load(Ordering::Acquire)
    }

    /// Drop the pending-work unit seeded at construction, letting the loop
    /// exit once all remaining work completes. Safe from any thread.
    pub fn allow_exit(&self) {
        self.resume_work();
        if let Err(e) = self.notifier.notify() {
            oerror!("exit notify failed: {}", e);
        }
    }

    /// Account one unit of outstanding work.
    pub fn pend_work(&self) {
        self.pending_works.fetch_add(1, Ordering::AcqRel);
    }

    /// Retire one unit of outstanding work.
    pub fn resume_work(&self) {
        let prev = self.pending_works.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "pending-work underflow");
    }

    /// Access the loop thread's ring. Callable only from code running on
    /// this runtime's thread.
    pub(crate) fn with_ring<R>(&self, f: impl FnOnce(&mut Ring) -> R) -> R {
        debug_assert!(
            ptr::eq(context::current_runtime_ptr(), self),
            "ring accessed off the runtime thread"
        );
        let local = self.local.get();
        f(unsafe { &mut (*local).ring })
    }

    /// Run `f` with this runtime's registered-fd table. Must be called on
    /// the runtime's own thread (from one of its coroutines).
    pub fn with_fd_table<R>(&self, f: impl FnOnce(&ouro_uring::tables::FdTable) -> R) -> R {
        self.with_ring(|ring| f(&ring.fd_table()))
    }

    /// Run `f` with this runtime's registered-buffer table. Must be called
    /// on the runtime's own thread.
    pub fn with_buffer_table<R>(&self, f: impl FnOnce(&ouro_uring::tables::BufferTable) -> R) -> R {
        self.with_ring(|ring| f(&ring.buffer_table()))
    }

    /// Schedule a work unit onto this runtime from anywhere.
    ///
    /// Three paths: a local push when the caller already runs on this
    /// runtime; a ring-to-ring message when the caller sits inside another
    /// enabled runtime; otherwise the global inbox plus a notifier poke.
    ///
    /// # Safety contract (internal)
    ///
    /// `work` must stay valid until invoked; it is owned by the queue once
    /// pushed.
    pub(crate) fn schedule_work(&self, work: *mut Work) {
        let caller = context::current_runtime_ptr();
        if ptr::eq(caller, self) {
            let local = self.local.get();
            unsafe { (*local).queue.push_back(work) };
            return;
        }

        let state = self.state.load(Ordering::Acquire);
        if !caller.is_null() && state == STATE_ENABLED && self.features.msg_ring {
            // Ownership of `work` crosses through the kernel; the release
            // here pairs with the acquire in process_cqe on the target.
            fence(Ordering::Release);
            let caller = unsafe { &*caller };
            let entry = opcode::MsgRingData::new(
                types::Fd(self.ring_fd),
                0,
                encode_work(work as *const (), WorkTag::Schedule),
                None,
            )
            .build()
            .user_data(encode_work(ptr::null(), WorkTag::Schedule));
            // Keep the source ring alive until its msg CQE comes back.
            caller.pend_work();
            caller.with_ring(|ring| ring.push_sqe(entry));
            return;
        }

        let need_notify;
        {
            let mut global = self.global.lock().unwrap();
            need_notify = global.is_empty();
            unsafe { global.push_back(work) };
        }
        if need_notify {
            if let Err(e) = self.notifier.notify() {
                oerror!("schedule notify failed: {}", e);
            }
        }
    }

    /// Run the event loop on the current thread until all pending work has
    /// completed (after [`allow_exit`](Self::allow_exit)). A runtime runs
    /// once; it cannot be restarted.
    ///
    /// Panics if the runtime is already running or stopped.
    pub fn run(&self) -> Result<()> {
        if self
            .state
            .compare_exchange(STATE_IDLE, STATE_RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            panic!("runtime is already running or stopped");
        }

        context::enter_runtime(self);
        olog::set_runtime_id(self.id);
        struct ExitGuard<'a>(&'a Runtime);
        impl Drop for ExitGuard<'_> {
            fn drop(&mut self) {
                context::exit_runtime();
                olog::clear_runtime_id();
                self.0.state.store(STATE_STOPPED, Ordering::Release);
            }
        }
        let _guard = ExitGuard(self);

        self.with_ring(|ring| ring.enable())?;
        self.state.store(STATE_ENABLED, Ordering::Release);

        if self.register_ring_fd {
            if let Err(e) = self.with_ring(|ring| ring.register_ring_fd()) {
                owarn!("register ring fd failed ({}), continuing without", e);
            }
        }

        // Pull in anything scheduled before the loop started and arm the
        // notifier read.
        self.drain_global_queue();

        let local = self.local.get();
        loop {
            unsafe { (*local).tick = (*local).tick.wrapping_add(1) };

            if unsafe { (*local).tick } % self.event_interval == 0 {
                self.pump(false)?;
            }

            let work = unsafe { (*local).queue.pop_front() };
            if !work.is_null() {
                unsafe { Work::invoke(work) };
                continue;
            }

            if self.pending_works.load(Ordering::Acquire) == 0 {
                break;
            }

            self.pump(true)?;
        }
        Ok(())
    }

    /// Reap completions; `block` flushes the submission queue and waits for
    /// at least one.
    fn pump(&self, block: bool) -> Result<()> {
        let local = self.local.get();
        let mut scratch = unsafe { std::mem::take(&mut (*local).scratch) };
        scratch.clear();
        {
            let ring = unsafe { &mut (*local).ring };
            if block {
                ring.reap_wait(&mut scratch)?;
            } else {
                ring.reap(&mut scratch);
            }
        }
        for cqe in scratch.drain(..) {
            self.process_cqe(cqe);
        }
        unsafe { (*local).scratch = scratch };
        Ok(())
    }

    fn process_cqe(&self, cqe: Cqe) {
        let (data, tag) = decode_work(cqe.user_data);
        match tag {
            WorkTag::Ignore => {
                // Cancel completions land here; EINVAL would mean a
                // malformed request rather than a benign race.
                debug_assert_ne!(cqe.res, -libc::EINVAL, "ignored op rejected");
            }
            WorkTag::Notify => {
                if cqe.res == -libc::EOPNOTSUPP {
                    // eventfd reads can clash with iopoll rings; the wakeup
                    // still happened through the queue drain on other paths.
                    return;
                }
                self.drain_global_queue();
            }
            WorkTag::SendFd => {
                let payload = data as u64 >> 3;
                let index = if payload == 0 {
                    cqe.res
                } else {
                    (payload - 1) as i32
                };
                self.with_ring(|ring| ring.deliver_sent_fd(index));
            }
            WorkTag::Schedule => {
                if data.is_null() {
                    // Our own ring-to-ring send completed.
                    if cqe.res < 0 {
                        oerror!("ring-to-ring message failed: errno {}", -cqe.res);
                    }
                    self.resume_work();
                } else {
                    fence(Ordering::Acquire);
                    let local = self.local.get();
                    unsafe { (*local).queue.push_back(data as *mut Work) };
                }
            }
            WorkTag::Common | WorkTag::MultiShot | WorkTag::ZeroCopy => {
                let hdr = data as *mut OpHeader;
                let action = unsafe { OpHeader::dispatch(hdr, cqe.res, cqe.flags) };
                if action.queue_work && !unsafe { (*hdr).is_resumable() } {
                    unsafe { (*hdr).set_resumable() };
                    let local = self.local.get();
                    unsafe { (*local).queue.push_back((*hdr).work_ptr()) };
                }
                if action.op_finish {
                    self.resume_work();
                }
            }
        }
    }

    /// Splice the global inbox into the local queue and re-arm the posted
    /// notifier read.
    fn drain_global_queue(&self) {
        let local = self.local.get();
        {
            let mut global = self.global.lock().unwrap();
            unsafe { (*local).queue.append(&mut global) };
        }
        self.notifier.drain();
        let buf = unsafe { &mut (*local).notify_buf as *mut u64 as *mut u8 };
        let entry = opcode::Read::new(types::Fd(self.notifier.fd()), buf, 8)
            .build()
            .user_data(encode_work(ptr::null(), WorkTag::Notify));
        self.with_ring(|ring| ring.push_sqe(entry));
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let pending = self.pending_works.load(Ordering::Acquire);
        if self.state.load(Ordering::Acquire) == STATE_STOPPED && pending != 0 {
            owarn!("runtime dropped with {} pending works", pending);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_runtime_is_idle_with_seeded_pending() {
        let rt = Runtime::new(RuntimeOptions::default()).unwrap();
        assert_eq!(rt.pending_works(), 1);
        assert_eq!(rt.state.load(Ordering::Acquire), STATE_IDLE);
    }

    #[test]
    fn test_run_exits_after_allow_exit() {
        let rt = Runtime::new(RuntimeOptions::default()).unwrap();
        rt.allow_exit();
        rt.run().unwrap();
        assert_eq!(rt.state.load(Ordering::Acquire), STATE_STOPPED);
        assert_eq!(rt.pending_works(), 0);
    }

    #[test]
    fn test_allow_exit_from_another_thread_stops_the_loop() {
        let rt = std::sync::Arc::new(Runtime::new(RuntimeOptions::default()).unwrap());
        let rt2 = rt.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(50));
            rt2.allow_exit();
        });
        rt.run().unwrap();
        handle.join().unwrap();
    }

    #[test]
    #[should_panic(expected = "already running or stopped")]
    fn test_run_twice_panics() {
        let rt = Runtime::new(RuntimeOptions::default()).unwrap();
        rt.allow_exit();
        rt.run().unwrap();
        let _ = rt.run();
    }

    #[test]
    fn test_illegal_options_rejected() {
        let opts = RuntimeOptions::new()
            .enable_sqpoll(100, None)
            .enable_defer_taskrun();
        assert!(matches!(
            Runtime::new(opts),
            Err(RuntimeError::Config(_))
        ));
    }

    #[test]
    fn test_pend_resume_balance() {
        let rt = Runtime::new(RuntimeOptions::default()).unwrap();
        rt.pend_work();
        rt.pend_work();
        assert_eq!(rt.pending_works(), 3);
        rt.resume_work();
        rt.resume_work();
        assert_eq!(rt.pending_works(), 1);
    }
}
