//! Ring ownership: SQE acquisition with back-pressure and CQE reaping.

use crate::cqe::Cqe;
use crate::error::{Result, RingError};
use crate::sys;
use crate::tables::{BufferTable, FdTable};
use io_uring::{squeue, IoUring};
use ouro_core::owarn;
use std::cell::{Cell, RefCell};
use std::os::unix::io::{AsRawFd, RawFd};

/// One io_uring instance and the userspace state attached to it.
///
/// A ring is manipulated only by its runtime's thread; nothing here is
/// synchronized.
pub struct Ring {
    ring: IoUring,
    sqpoll: bool,
    fd_accepter: RefCell<Option<Box<dyn Fn(i32)>>>,
    buffer_table_init: Cell<bool>,
}

impl Ring {
    pub fn new(ring: IoUring, sqpoll: bool) -> Self {
        Self {
            ring,
            sqpoll,
            fd_accepter: RefCell::new(None),
            buffer_table_init: Cell::new(false),
        }
    }

    pub fn io(&self) -> &IoUring {
        &self.ring
    }

    pub fn fd(&self) -> RawFd {
        self.ring.as_raw_fd()
    }

    /// Enable a ring that was created disabled.
    pub fn enable(&self) -> Result<()> {
        self.ring
            .submitter()
            .register_enable_rings()
            .map_err(RingError::register_os)
    }

    /// Register the ring fd itself to shave a descriptor lookup off every
    /// enter. Optional optimisation; callers may ignore the error on old
    /// kernels.
    pub fn register_ring_fd(&self) -> Result<()> {
        let upd = sys::RsrcUpdate {
            offset: sys::IORING_RSRC_UPDATE_AUTO,
            resv: 0,
            data: self.fd() as u64,
        };
        let r = sys::io_uring_register(
            self.fd(),
            sys::IORING_REGISTER_RING_FDS,
            &upd as *const _ as *const libc::c_void,
            1,
        );
        // The kernel reports how many fds were registered.
        if r == 1 {
            Ok(())
        } else {
            Err(RingError::Register(if r < 0 { -r } else { libc::EINVAL }))
        }
    }

    /// Queue one SQE, flushing to the kernel whenever the submission ring is
    /// out of slots. Never drops an entry.
    pub fn push_sqe(&mut self, entry: squeue::Entry) {
        loop {
            let full = unsafe { self.ring.submission().push(&entry).is_err() };
            if !full {
                return;
            }
            self.flush_for_space();
        }
    }

    /// Guarantee `n` contiguous free submission slots before returning, so a
    /// link chain enters the kernel as one unit.
    pub fn reserve_space(&mut self, n: usize) {
        assert!(
            n <= self.ring.params().sq_entries() as usize,
            "link chain longer than the submission ring"
        );
        while self.space_left() < n {
            self.flush_for_space();
        }
    }

    fn space_left(&mut self) -> usize {
        let sq = self.ring.submission();
        sq.capacity() - sq.len()
    }

    fn flush_for_space(&mut self) {
        match self.ring.submit() {
            Ok(_) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => {}
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
                // Completion ring saturated; the kernel will drain it on the
                // next wait. Yield so sqpoll or irq work can run.
                std::thread::yield_now();
            }
            Err(e) => panic!("io_uring submit failed: {}", e),
        }
        if self.sqpoll {
            // Under sqpoll the submit above may not free slots until the
            // poller thread wakes; block until it has consumed some.
            if let Err(e) = self.ring.submitter().squeue_wait() {
                if e.raw_os_error() != Some(libc::EINTR) {
                    panic!("io_uring sqring wait failed: {}", e);
                }
            }
        }
    }

    /// Non-blocking flush of everything queued.
    pub fn submit(&mut self) -> Result<usize> {
        loop {
            match self.ring.submit() {
                Ok(n) => return Ok(n),
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => return Err(RingError::Submit(e.raw_os_error().unwrap_or(libc::EIO))),
            }
        }
    }

    /// Drain whatever completions are already available into `out`,
    /// acknowledging them as one batch. Returns the number reaped.
    pub fn reap(&mut self, out: &mut Vec<Cqe>) -> usize {
        let mut reaped = 0;
        for cqe in self.ring.completion() {
            out.push(Cqe {
                user_data: cqe.user_data(),
                res: cqe.result(),
                flags: cqe.flags(),
            });
            reaped += 1;
        }
        reaped
    }

    /// Flush queued SQEs and block until at least one completion is
    /// available, retrying transparently on interrupt, then drain.
    pub fn reap_wait(&mut self, out: &mut Vec<Cqe>) -> Result<usize> {
        loop {
            match self.ring.submit_and_wait(1) {
                Ok(_) => break,
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) if e.raw_os_error() == Some(libc::EBUSY) => break,
                Err(e) => return Err(RingError::Submit(e.raw_os_error().unwrap_or(libc::EIO))),
            }
        }
        Ok(self.reap(out))
    }

    /// Registered file descriptor table.
    pub fn fd_table(&self) -> FdTable<'_> {
        FdTable::new(&self.ring, &self.fd_accepter)
    }

    /// Registered buffer table.
    pub fn buffer_table(&self) -> BufferTable<'_> {
        BufferTable::new(&self.ring, &self.buffer_table_init)
    }

    /// Deliver a fixed fd sent by another ring to the accepter slot.
    /// Returns false when no accepter is installed.
    pub fn deliver_sent_fd(&self, fd_index: i32) -> bool {
        match &*self.fd_accepter.borrow() {
            Some(accepter) => {
                accepter(fd_index);
                true
            }
            None => {
                owarn!("fixed fd {} received but no accepter installed", fd_index);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use io_uring::opcode;

    fn test_ring() -> Ring {
        Ring::new(IoUring::new(8).expect("io_uring unavailable"), false)
    }

    #[test]
    fn test_nop_roundtrip() {
        let mut ring = test_ring();
        ring.push_sqe(opcode::Nop::new().build().user_data(0x99));
        let mut out = Vec::new();
        ring.reap_wait(&mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].user_data, 0x99);
        assert_eq!(out[0].res, 0);
    }

    #[test]
    fn test_push_beyond_sq_capacity_flushes() {
        let mut ring = test_ring();
        // 3x the SQ size; push_sqe must flush rather than fail.
        for i in 0..24u64 {
            ring.push_sqe(opcode::Nop::new().build().user_data(i));
        }
        let mut out = Vec::new();
        let mut total = 0;
        while total < 24 {
            total += ring.reap_wait(&mut out).unwrap();
        }
        assert_eq!(total, 24);
    }

    #[test]
    fn test_reserve_space() {
        let mut ring = test_ring();
        for i in 0..6u64 {
            ring.push_sqe(opcode::Nop::new().build().user_data(i));
        }
        ring.reserve_space(8);
        assert!(ring.space_left() >= 8);
        let mut out = Vec::new();
        let mut total = 0;
        while total < 6 {
            total += ring.reap_wait(&mut out).unwrap();
        }
    }

    #[test]
    fn test_reap_without_completions_is_empty() {
        let mut ring = test_ring();
        let mut out = Vec::new();
        assert_eq!(ring.reap(&mut out), 0);
        assert!(out.is_empty());
    }
}
