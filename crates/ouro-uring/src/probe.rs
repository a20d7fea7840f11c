//! Kernel feature detection.
//!
//! Version-gated operations carry a runtime feature flag initialised from
//! the kernel's opcode probe; callers that depend on one should check here
//! and fail fast instead of submitting an SQE the kernel will reject.

use crate::error::{Result, RingError};
use io_uring::{opcode, IoUring, Probe};

/// Supported optional operations of the running kernel.
#[derive(Debug, Clone, Copy)]
pub struct Features {
    /// Ring-to-ring messages (5.18).
    pub msg_ring: bool,
    /// Multishot accept (5.19).
    pub multishot_accept: bool,
    /// Provided-buffer rings (5.19). The registration itself is not an
    /// opcode, so multishot accept from the same kernel release stands in.
    pub buf_ring: bool,
    /// Zero-copy send (6.0).
    pub send_zc: bool,
    /// Futex wait/wake (6.7).
    pub futex: bool,
    /// Direct open/accept into the fixed-fd table (5.15).
    pub direct_fd: bool,
}

impl Features {
    /// Probe the kernel through `ring`.
    pub fn probe(ring: &IoUring) -> Result<Self> {
        let mut probe = Probe::new();
        ring.submitter()
            .register_probe(&mut probe)
            .map_err(RingError::register_os)?;
        let multishot_accept = probe.is_supported(opcode::AcceptMulti::CODE);
        Ok(Self {
            msg_ring: probe.is_supported(opcode::MsgRingData::CODE),
            multishot_accept,
            buf_ring: multishot_accept,
            send_zc: probe.is_supported(opcode::SendZc::CODE),
            futex: probe.is_supported(opcode::FutexWait::CODE),
            direct_fd: probe.is_supported(opcode::OpenAt::CODE),
        })
    }

    /// A conservative all-false set, for rings whose probe failed.
    pub fn none() -> Self {
        Self {
            msg_ring: false,
            multishot_accept: false,
            buf_ring: false,
            send_zc: false,
            futex: false,
            direct_fd: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_reports_baseline_ops() {
        let ring = IoUring::new(8).unwrap();
        let mut probe = Probe::new();
        ring.submitter().register_probe(&mut probe).unwrap();
        // Nop, read and write predate every kernel this runtime targets.
        assert!(probe.is_supported(opcode::Nop::CODE));
        assert!(probe.is_supported(opcode::Read::CODE));
        assert!(probe.is_supported(opcode::Write::CODE));
    }

    #[test]
    fn test_features_probe_runs() {
        let ring = IoUring::new(8).unwrap();
        let features = Features::probe(&ring).unwrap();
        // Nothing to assert about optional ops; just exercise the path.
        let _ = features.msg_ring;
    }
}
