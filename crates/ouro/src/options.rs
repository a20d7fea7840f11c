//! Runtime configuration.

use crate::error::RuntimeError;
use std::os::unix::io::RawFd;

/// Builder-style options for a [`Runtime`](crate::Runtime).
///
/// Most fields map to io_uring setup flags and must be chosen before the
/// ring is created. Illegal combinations are rejected by `Runtime::new`.
#[derive(Clone)]
pub struct RuntimeOptions {
    pub(crate) event_interval: u64,
    pub(crate) disable_register_ring_fd: bool,
    pub(crate) enable_iopoll: bool,
    pub(crate) enable_hybrid_iopoll: bool,
    pub(crate) enable_sqpoll: bool,
    pub(crate) sqpoll_idle_ms: u32,
    pub(crate) sqpoll_cpu: Option<u32>,
    pub(crate) enable_defer_taskrun: bool,
    pub(crate) enable_coop_taskrun: bool,
    pub(crate) sq_size: u32,
    pub(crate) cq_size: u32,
    pub(crate) attach_wq_fd: Option<RawFd>,
    pub(crate) enable_sqe128: bool,
    pub(crate) enable_cqe32: bool,
    pub(crate) enable_sqe_mixed: bool,
    pub(crate) enable_cqe_mixed: bool,
    pub(crate) enable_no_mmap: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            event_interval: 61,
            disable_register_ring_fd: false,
            enable_iopoll: false,
            enable_hybrid_iopoll: false,
            enable_sqpoll: false,
            sqpoll_idle_ms: 1000,
            sqpoll_cpu: None,
            enable_defer_taskrun: false,
            enable_coop_taskrun: false,
            sq_size: 128,
            cq_size: 0, // 0 means the kernel default (2 * sq_size)
            attach_wq_fd: None,
            enable_sqe128: false,
            enable_cqe32: false,
            enable_sqe_mixed: false,
            enable_cqe_mixed: false,
            enable_no_mmap: false,
        }
    }
}

impl RuntimeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ticks between opportunistic completion polls.
    pub fn event_interval(mut self, ticks: u64) -> Self {
        self.event_interval = ticks.max(1);
        self
    }

    /// Skip the registered-ring-fd optimisation.
    pub fn disable_register_ring_fd(mut self) -> Self {
        self.disable_register_ring_fd = true;
        self
    }

    /// Polling-based completions for O_DIRECT storage.
    pub fn enable_iopoll(mut self, hybrid: bool) -> Self {
        self.enable_iopoll = true;
        self.enable_hybrid_iopoll = hybrid;
        self
    }

    /// Kernel submission-poll thread.
    pub fn enable_sqpoll(mut self, idle_ms: u32, cpu: Option<u32>) -> Self {
        self.enable_sqpoll = true;
        self.sqpoll_idle_ms = idle_ms;
        self.sqpoll_cpu = cpu;
        self
    }

    /// Coalesced task running. Mutually exclusive with sqpoll and
    /// coop_taskrun.
    pub fn enable_defer_taskrun(mut self) -> Self {
        self.enable_defer_taskrun = true;
        self
    }

    /// Cooperative task running. Mutually exclusive with sqpoll and
    /// defer_taskrun.
    pub fn enable_coop_taskrun(mut self) -> Self {
        self.enable_coop_taskrun = true;
        self
    }

    /// Submission ring size.
    pub fn sq_size(mut self, entries: u32) -> Self {
        self.sq_size = entries.max(1);
        self
    }

    /// Completion ring size (0 = kernel default).
    pub fn cq_size(mut self, entries: u32) -> Self {
        self.cq_size = entries;
        self
    }

    /// Share the kernel async worker pool with another runtime.
    pub fn enable_attach_wq(mut self, other: &crate::Runtime) -> Self {
        self.attach_wq_fd = Some(other.ring_fd());
        self
    }

    /// 128-byte SQEs for NVMe passthrough.
    pub fn enable_sqe128(mut self) -> Self {
        self.enable_sqe128 = true;
        self
    }

    /// 32-byte CQEs for NVMe passthrough.
    pub fn enable_cqe32(mut self) -> Self {
        self.enable_cqe32 = true;
        self
    }

    /// Mixed 64/128-byte SQEs (newer kernels).
    pub fn enable_sqe_mixed(mut self) -> Self {
        self.enable_sqe_mixed = true;
        self
    }

    /// Mixed 16/32-byte CQEs (newer kernels).
    pub fn enable_cqe_mixed(mut self) -> Self {
        self.enable_cqe_mixed = true;
        self
    }

    /// Caller-provided ring memory.
    pub fn enable_no_mmap(mut self) -> Self {
        self.enable_no_mmap = true;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), RuntimeError> {
        if self.enable_sqpoll && (self.enable_defer_taskrun || self.enable_coop_taskrun) {
            return Err(RuntimeError::Config(
                "sqpoll cannot be combined with defer_taskrun or coop_taskrun",
            ));
        }
        if self.enable_defer_taskrun && self.enable_coop_taskrun {
            return Err(RuntimeError::Config(
                "defer_taskrun cannot be combined with coop_taskrun",
            ));
        }
        if self.enable_sqe128 && self.enable_sqe_mixed {
            return Err(RuntimeError::Config(
                "sqe128 cannot be combined with sqe_mixed",
            ));
        }
        if self.enable_cqe32 && self.enable_cqe_mixed {
            return Err(RuntimeError::Config(
                "cqe32 cannot be combined with cqe_mixed",
            ));
        }
        // The backing crate fixes the SQE/CQE layout and ring mapping at the
        // type level; these modes cannot be selected at runtime, so callers
        // depending on them fail fast here.
        if self.enable_hybrid_iopoll {
            return Err(RuntimeError::Unsupported("hybrid iopoll"));
        }
        if self.enable_sqe128 || self.enable_sqe_mixed {
            return Err(RuntimeError::Unsupported("large or mixed SQE format"));
        }
        if self.enable_cqe32 || self.enable_cqe_mixed {
            return Err(RuntimeError::Unsupported("large or mixed CQE format"));
        }
        if self.enable_no_mmap {
            return Err(RuntimeError::Unsupported("caller-provided ring memory"));
        }
        Ok(())
    }
}
