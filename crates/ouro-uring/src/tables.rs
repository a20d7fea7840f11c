//! Registered file and buffer tables.
//!
//! Both tables share the same contract: a sparse index space of fixed size
//! established at init time, partially updatable in place. Entries refer to
//! external resources (open fds, user memory) whose liveness is the caller's
//! responsibility. Ops name an entry through its 0-based index together with
//! the fixed-file flag or a fixed-buffer opcode.

use crate::error::{Result, RingError};
use crate::sys;
use io_uring::IoUring;
use std::cell::{Cell, RefCell};
use std::os::unix::io::{AsRawFd, RawFd};

/// View over the ring's registered file table.
pub struct FdTable<'r> {
    ring: &'r IoUring,
    accepter: &'r RefCell<Option<Box<dyn Fn(i32)>>>,
}

impl<'r> FdTable<'r> {
    pub(crate) fn new(
        ring: &'r IoUring,
        accepter: &'r RefCell<Option<Box<dyn Fn(i32)>>>,
    ) -> Self {
        Self { ring, accepter }
    }

    /// Establish a sparse table of `capacity` slots.
    pub fn init(&self, capacity: u32) -> Result<()> {
        self.ring
            .submitter()
            .register_files_sparse(capacity)
            .map_err(RingError::register_os)
    }

    /// Tear the table down.
    pub fn destroy(&self) -> Result<()> {
        self.ring
            .submitter()
            .unregister_files()
            .map_err(RingError::register_os)
    }

    /// Replace `fds.len()` slots starting at `index_base`. A value of -1
    /// clears a slot.
    pub fn update(&self, index_base: u32, fds: &[RawFd]) -> Result<usize> {
        self.ring
            .submitter()
            .register_files_update(index_base, fds)
            .map_err(RingError::register_os)
    }

    /// Restrict the range used when the kernel auto-allocates a slot
    /// (direct accept/open into the table).
    pub fn set_file_alloc_range(&self, offset: u32, len: u32) -> Result<()> {
        let range = sys::FileIndexRange {
            off: offset,
            len,
            resv: 0,
        };
        let r = sys::io_uring_register(
            self.ring.as_raw_fd(),
            sys::IORING_REGISTER_FILE_ALLOC_RANGE,
            &range as *const _ as *const libc::c_void,
            0,
        );
        if r < 0 {
            Err(RingError::Register(-r))
        } else {
            Ok(())
        }
    }

    /// Install the accepter invoked with the slot index whenever another
    /// ring sends a registered fd across. The mechanism behind fleet-wide
    /// socket passing.
    pub fn set_accepter(&self, accepter: impl Fn(i32) + 'static) {
        *self.accepter.borrow_mut() = Some(Box::new(accepter));
    }
}

/// View over the ring's registered buffer table.
pub struct BufferTable<'r> {
    ring: &'r IoUring,
    initialized: &'r Cell<bool>,
}

impl<'r> BufferTable<'r> {
    pub(crate) fn new(ring: &'r IoUring, initialized: &'r Cell<bool>) -> Self {
        Self { ring, initialized }
    }

    /// Establish a sparse table of `capacity` `{base,len}` slots.
    pub fn init(&self, capacity: u32) -> Result<()> {
        let reg = sys::RsrcRegister {
            nr: capacity,
            flags: sys::IORING_RSRC_REGISTER_SPARSE,
            resv2: 0,
            data: 0,
            tags: 0,
        };
        let r = sys::io_uring_register(
            self.ring.as_raw_fd(),
            sys::IORING_REGISTER_BUFFERS2,
            &reg as *const _ as *const libc::c_void,
            std::mem::size_of::<sys::RsrcRegister>() as u32,
        );
        if r < 0 {
            return Err(RingError::Register(-r));
        }
        self.initialized.set(true);
        Ok(())
    }

    /// Tear the table down.
    pub fn destroy(&self) -> Result<()> {
        self.initialized.set(false);
        self.ring
            .submitter()
            .unregister_buffers()
            .map_err(RingError::register_os)
    }

    /// Replace `vecs.len()` slots starting at `index_base`.
    ///
    /// # Safety
    ///
    /// Each iovec must describe memory that stays valid until the slot is
    /// replaced or the table destroyed.
    pub unsafe fn update(&self, index_base: u32, vecs: &[libc::iovec]) -> Result<()> {
        let upd = sys::RsrcUpdate2 {
            offset: index_base,
            resv: 0,
            data: vecs.as_ptr() as u64,
            tags: 0,
            nr: vecs.len() as u32,
            resv2: 0,
        };
        let r = sys::io_uring_register(
            self.ring.as_raw_fd(),
            sys::IORING_REGISTER_BUFFERS_UPDATE,
            &upd as *const _ as *const libc::c_void,
            std::mem::size_of::<sys::RsrcUpdate2>() as u32,
        );
        if r < 0 {
            Err(RingError::Register(-r))
        } else {
            Ok(())
        }
    }

    /// Clone `nr` registered buffers (0 = all) from another ring's table
    /// into this one, for fleet-wide buffer registration.
    pub fn clone_from(
        &self,
        src_ring_fd: RawFd,
        dst_off: u32,
        src_off: u32,
        nr: u32,
    ) -> Result<()> {
        let mut flags = 0;
        if self.initialized.get() {
            flags |= sys::IORING_REGISTER_DST_REPLACE;
        }
        let arg = sys::CloneBuffers {
            src_fd: src_ring_fd as u32,
            flags,
            src_off,
            dst_off,
            nr,
            pad: [0; 3],
        };
        let r = sys::io_uring_register(
            self.ring.as_raw_fd(),
            sys::IORING_REGISTER_CLONE_BUFFERS,
            &arg as *const _ as *const libc::c_void,
            1,
        );
        if r < 0 {
            return Err(RingError::Register(-r));
        }
        self.initialized.set(true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::ring::Ring;
    use io_uring::IoUring;

    #[test]
    fn test_fd_table_sparse_init_and_update() {
        let ring = Ring::new(IoUring::new(8).unwrap(), false);
        let table = ring.fd_table();
        table.init(16).unwrap();
        let mut pipe = [0; 2];
        assert_eq!(unsafe { libc::pipe(pipe.as_mut_ptr()) }, 0);
        assert_eq!(table.update(3, &pipe[..1]).unwrap(), 1);
        // Clearing the slot again.
        assert_eq!(table.update(3, &[-1]).unwrap(), 1);
        table.destroy().unwrap();
        unsafe {
            libc::close(pipe[0]);
            libc::close(pipe[1]);
        }
    }

    #[test]
    fn test_buffer_table_sparse_init_and_update() {
        let ring = Ring::new(IoUring::new(8).unwrap(), false);
        let table = ring.buffer_table();
        if let Err(e) = table.init(8) {
            // Sparse buffer registration needs 5.19; skip below that.
            eprintln!("skipping buffer table test: {}", e);
            return;
        }
        let mut buf = vec![0u8; 4096];
        let iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        unsafe { table.update(2, &[iov]) }.unwrap();
        table.destroy().unwrap();
    }

    #[test]
    fn test_accepter_slot() {
        let ring = Ring::new(IoUring::new(8).unwrap(), false);
        assert!(!ring.deliver_sent_fd(1));
        let seen = std::rc::Rc::new(std::cell::Cell::new(-1));
        let seen2 = seen.clone();
        ring.fd_table().set_accepter(move |idx| seen2.set(idx));
        assert!(ring.deliver_sent_fd(5));
        assert_eq!(seen.get(), 5);
    }
}
