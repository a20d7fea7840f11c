//! Cross-runtime wakeup notifier.
//!
//! An owned eventfd whose read side is kept posted on the runtime's ring as
//! a Notify-tagged op. Writes coalesce: any number of `notify` calls before
//! the posted read completes produce a single wakeup.

use std::os::unix::io::RawFd;

pub(crate) struct EventFd {
    fd: RawFd,
}

impl EventFd {
    pub(crate) fn create() -> std::io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    /// Wake the owner. EAGAIN means the counter is already saturated, which
    /// implies a wakeup is pending anyway.
    pub(crate) fn notify(&self) -> std::io::Result<()> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let errno = unsafe { *libc::__errno_location() };
            if errno == libc::EAGAIN {
                return Ok(());
            }
            return Err(std::io::Error::from_raw_os_error(errno));
        }
        Ok(())
    }

    /// Clear the counter before re-arming the posted read.
    pub(crate) fn drain(&self) {
        let mut val: u64 = 0;
        unsafe {
            libc::read(
                self.fd,
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
            self.fd = -1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_coalesces() {
        let efd = EventFd::create().unwrap();
        efd.notify().unwrap();
        efd.notify().unwrap();
        let mut val: u64 = 0;
        let n = unsafe {
            libc::read(
                efd.fd(),
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        assert_eq!(n, 8);
        assert_eq!(val, 2);
        // Counter now clear: a second read would block.
        let n = unsafe {
            libc::read(
                efd.fd(),
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        assert_eq!(n, -1);
    }

    #[test]
    fn test_drain_is_idempotent() {
        let efd = EventFd::create().unwrap();
        efd.notify().unwrap();
        efd.drain();
        efd.drain();
        efd.notify().unwrap();
    }
}
