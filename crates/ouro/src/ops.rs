//! Asynchronous operation wrappers.
//!
//! Each wrapper pairs an SQE preparation with the single-shot, multishot,
//! zero-copy or buffer-select builders; results surface as the raw signed
//! 32-bit CQE value (negative values are kernel error codes, never
//! translated into `Result`). Buffers and timespecs the kernel reads live
//! in the future's payload slot, pinned for the life of the operation.

use crate::op::{MultiShotOpFuture, MultiShotSelectFuture, OpFuture, SelectOpFuture, ZeroCopyOpFuture};
use crate::task::spawn;
use crate::channel::Channel;
use io_uring::{opcode, squeue, types};
use ouro_uring::provided::{BufferRing, ProvidedBufferPool};
use ouro_uring::sys::{FUTEX2_SIZE_U32, FUTEX_BITSET_MATCH_ANY};
use std::ffi::{CStr, CString};
use std::future::Future;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

pub use io_uring::types::TimeoutFlags;

/// A file descriptor argument: either a native fd or an index into the
/// runtime's registered file table.
#[derive(Debug, Clone, Copy)]
pub enum OpFd {
    Raw(RawFd),
    Fixed(u32),
}

impl From<RawFd> for OpFd {
    fn from(fd: RawFd) -> Self {
        OpFd::Raw(fd)
    }
}

/// Name an entry of the registered file table.
pub fn fixed(index: u32) -> OpFd {
    OpFd::Fixed(index)
}

macro_rules! with_fd {
    ($fd:expr, |$f:ident| $build:expr) => {
        match $fd {
            OpFd::Raw(fd) => {
                let $f = types::Fd(fd);
                $build
            }
            OpFd::Fixed(idx) => {
                let $f = types::Fixed(idx);
                $build
            }
        }
    };
}

/// No-op completion; useful for wakeups and tests.
pub fn async_nop() -> OpFuture<(), impl FnOnce(&mut ()) -> squeue::Entry> {
    OpFuture::new((), |_| opcode::Nop::new().build())
}

/// Read into `buf` at `offset` (`u64::MAX` = current file position).
pub fn async_read<'b>(
    fd: impl Into<OpFd>,
    buf: &'b mut [u8],
    offset: u64,
) -> OpFuture<&'b mut [u8], impl FnOnce(&mut &'b mut [u8]) -> squeue::Entry> {
    let fd = fd.into();
    OpFuture::new(buf, move |b| {
        let ptr = b.as_mut_ptr();
        let len = b.len() as u32;
        with_fd!(fd, |f| opcode::Read::new(f, ptr, len).offset(offset).build())
    })
}

/// Read into an entry of the registered buffer table.
pub fn async_read_fixed<'b>(
    fd: impl Into<OpFd>,
    buf: &'b mut [u8],
    offset: u64,
    buf_index: u16,
) -> OpFuture<&'b mut [u8], impl FnOnce(&mut &'b mut [u8]) -> squeue::Entry> {
    let fd = fd.into();
    OpFuture::new(buf, move |b| {
        let ptr = b.as_mut_ptr();
        let len = b.len() as u32;
        with_fd!(fd, |f| opcode::ReadFixed::new(f, ptr, len, buf_index)
            .offset(offset)
            .build())
    })
}

/// Write `buf` at `offset` (`u64::MAX` = current file position).
pub fn async_write<'b>(
    fd: impl Into<OpFd>,
    buf: &'b [u8],
    offset: u64,
) -> OpFuture<&'b [u8], impl FnOnce(&mut &'b [u8]) -> squeue::Entry> {
    let fd = fd.into();
    OpFuture::new(buf, move |b| {
        let ptr = b.as_ptr();
        let len = b.len() as u32;
        with_fd!(fd, |f| opcode::Write::new(f, ptr, len).offset(offset).build())
    })
}

/// Write from an entry of the registered buffer table.
pub fn async_write_fixed<'b>(
    fd: impl Into<OpFd>,
    buf: &'b [u8],
    offset: u64,
    buf_index: u16,
) -> OpFuture<&'b [u8], impl FnOnce(&mut &'b [u8]) -> squeue::Entry> {
    let fd = fd.into();
    OpFuture::new(buf, move |b| {
        let ptr = b.as_ptr();
        let len = b.len() as u32;
        with_fd!(fd, |f| opcode::WriteFixed::new(f, ptr, len, buf_index)
            .offset(offset)
            .build())
    })
}

/// Vectored read.
///
/// # Safety
///
/// Every iovec must describe writable memory outliving the operation.
pub unsafe fn async_readv<'v>(
    fd: impl Into<OpFd>,
    iovecs: &'v [libc::iovec],
    offset: u64,
) -> OpFuture<&'v [libc::iovec], impl FnOnce(&mut &'v [libc::iovec]) -> squeue::Entry> {
    let fd = fd.into();
    OpFuture::new(iovecs, move |v| {
        let ptr = v.as_ptr();
        let len = v.len() as u32;
        with_fd!(fd, |f| opcode::Readv::new(f, ptr, len).offset(offset).build())
    })
}

/// Vectored write.
///
/// # Safety
///
/// Every iovec must describe readable memory outliving the operation.
pub unsafe fn async_writev<'v>(
    fd: impl Into<OpFd>,
    iovecs: &'v [libc::iovec],
    offset: u64,
) -> OpFuture<&'v [libc::iovec], impl FnOnce(&mut &'v [libc::iovec]) -> squeue::Entry> {
    let fd = fd.into();
    OpFuture::new(iovecs, move |v| {
        let ptr = v.as_ptr();
        let len = v.len() as u32;
        with_fd!(fd, |f| opcode::Writev::new(f, ptr, len).offset(offset).build())
    })
}

/// Flush a file's data (and metadata unless `datasync`).
pub fn async_fsync(
    fd: impl Into<OpFd>,
    datasync: bool,
) -> OpFuture<(), impl FnOnce(&mut ()) -> squeue::Entry> {
    let fd = fd.into();
    OpFuture::new((), move |_| {
        let flags = if datasync {
            types::FsyncFlags::DATASYNC
        } else {
            types::FsyncFlags::empty()
        };
        with_fd!(fd, |f| opcode::Fsync::new(f).flags(flags).build())
    })
}

/// Receive into `buf`.
pub fn async_recv<'b>(
    fd: impl Into<OpFd>,
    buf: &'b mut [u8],
    flags: i32,
) -> OpFuture<&'b mut [u8], impl FnOnce(&mut &'b mut [u8]) -> squeue::Entry> {
    let fd = fd.into();
    OpFuture::new(buf, move |b| {
        let ptr = b.as_mut_ptr();
        let len = b.len() as u32;
        with_fd!(fd, |f| opcode::Recv::new(f, ptr, len).flags(flags).build())
    })
}

/// Receive into a kernel-selected buffer from a provided-buffer group.
pub fn async_recv_provided<'g, B: BufferRing>(
    fd: impl Into<OpFd>,
    group: &'g B,
    flags: i32,
) -> SelectOpFuture<'g, (), impl FnOnce(&mut ()) -> squeue::Entry, B> {
    let fd = fd.into();
    let bgid = group.bgid();
    SelectOpFuture::new(
        (),
        move |_| {
            with_fd!(fd, |f| opcode::Recv::new(f, std::ptr::null_mut(), 0)
                .flags(flags)
                .buf_group(bgid)
                .build())
        },
        group,
    )
}

/// Multishot receive: `on_recv` runs for every completed datagram/segment
/// with its selected buffer(s); the future resolves with the terminating
/// result.
pub fn async_recv_multishot<'g, B, C>(
    fd: impl Into<OpFd>,
    group: &'g B,
    on_recv: C,
) -> MultiShotSelectFuture<'g, (), impl FnOnce(&mut ()) -> squeue::Entry, C, B>
where
    B: BufferRing,
    C: FnMut(i32, B::Out),
{
    let fd = fd.into();
    let bgid = group.bgid();
    MultiShotSelectFuture::new(
        (),
        move |_| with_fd!(fd, |f| opcode::RecvMulti::new(f, bgid).build()),
        on_recv,
        group,
    )
}

/// Send `buf`.
pub fn async_send<'b>(
    fd: impl Into<OpFd>,
    buf: &'b [u8],
    flags: i32,
) -> OpFuture<&'b [u8], impl FnOnce(&mut &'b [u8]) -> squeue::Entry> {
    let fd = fd.into();
    OpFuture::new(buf, move |b| {
        let ptr = b.as_ptr();
        let len = b.len() as u32;
        with_fd!(fd, |f| opcode::Send::new(f, ptr, len).flags(flags).build())
    })
}

/// Zero-copy send of an owned buffer. The buffer is released when the
/// kernel's notification arrives, which may be well after the future
/// resolves.
pub fn async_send_zc(
    fd: impl Into<OpFd>,
    buf: Vec<u8>,
) -> ZeroCopyOpFuture<(), impl FnOnce(&mut ()) -> squeue::Entry, impl FnOnce(i32)> {
    async_send_zc_notify(fd, buf, |_res, _buf| {})
}

/// Zero-copy send; `on_done(notify_res, buf)` runs once the kernel no
/// longer references the buffer, handing it back for reuse.
pub fn async_send_zc_notify<F>(
    fd: impl Into<OpFd>,
    buf: Vec<u8>,
    on_done: F,
) -> ZeroCopyOpFuture<(), impl FnOnce(&mut ()) -> squeue::Entry, impl FnOnce(i32)>
where
    F: FnOnce(i32, Vec<u8>),
{
    let fd = fd.into();
    let ptr = buf.as_ptr();
    let len = buf.len() as u32;
    ZeroCopyOpFuture::new(
        (),
        move |_| with_fd!(fd, |f| opcode::SendZc::new(f, ptr, len).build()),
        move |notify_res| on_done(notify_res, buf),
    )
}

/// Accept one connection (no peer address).
pub fn async_accept(
    fd: impl Into<OpFd>,
    flags: i32,
) -> OpFuture<(), impl FnOnce(&mut ()) -> squeue::Entry> {
    let fd = fd.into();
    OpFuture::new((), move |_| {
        with_fd!(fd, |f| opcode::Accept::new(
            f,
            std::ptr::null_mut(),
            std::ptr::null_mut()
        )
        .flags(flags)
        .build())
    })
}

/// Multishot accept: `on_accept` runs with each accepted fd; the future
/// resolves when the kernel terminates the request.
pub fn async_multishot_accept<C: FnMut(i32)>(
    fd: impl Into<OpFd>,
    on_accept: C,
) -> MultiShotOpFuture<(), impl FnOnce(&mut ()) -> squeue::Entry, C> {
    let fd = fd.into();
    MultiShotOpFuture::new(
        (),
        move |_| with_fd!(fd, |f| opcode::AcceptMulti::new(f).build()),
        on_accept,
    )
}

/// Connect to a socket address.
pub fn async_connect(
    fd: impl Into<OpFd>,
    addr: SocketAddr,
) -> OpFuture<(libc::sockaddr_storage, libc::socklen_t), impl FnOnce(&mut (libc::sockaddr_storage, libc::socklen_t)) -> squeue::Entry>
{
    let fd = fd.into();
    let payload = sockaddr_from(addr);
    OpFuture::new(payload, move |(storage, len)| {
        let ptr = storage as *const libc::sockaddr_storage as *const libc::sockaddr;
        with_fd!(fd, |f| opcode::Connect::new(f, ptr, *len).build())
    })
}

/// Create a socket.
pub fn async_socket(
    domain: i32,
    socket_type: i32,
    protocol: i32,
) -> OpFuture<(), impl FnOnce(&mut ()) -> squeue::Entry> {
    OpFuture::new((), move |_| {
        opcode::Socket::new(domain, socket_type, protocol).build()
    })
}

/// Shut down part of a full-duplex connection.
pub fn async_shutdown(
    fd: impl Into<OpFd>,
    how: i32,
) -> OpFuture<(), impl FnOnce(&mut ()) -> squeue::Entry> {
    let fd = fd.into();
    OpFuture::new((), move |_| {
        with_fd!(fd, |f| opcode::Shutdown::new(f, how).build())
    })
}

/// Open relative to `dfd`.
pub fn async_openat(
    dfd: RawFd,
    path: &CStr,
    flags: i32,
    mode: u32,
) -> OpFuture<CString, impl FnOnce(&mut CString) -> squeue::Entry> {
    let path = path.to_owned();
    OpFuture::new(path, move |p| {
        opcode::OpenAt::new(types::Fd(dfd), p.as_ptr())
            .flags(flags)
            .mode(mode)
            .build()
    })
}

/// Close a file descriptor.
pub fn async_close(fd: RawFd) -> OpFuture<(), impl FnOnce(&mut ()) -> squeue::Entry> {
    OpFuture::new((), move |_| opcode::Close::new(types::Fd(fd)).build())
}

/// Splice bytes between two descriptors (offset -1 = current position).
pub fn async_splice(
    fd_in: impl Into<OpFd>,
    off_in: i64,
    fd_out: impl Into<OpFd>,
    off_out: i64,
    len: u32,
    flags: u32,
) -> OpFuture<(), impl FnOnce(&mut ()) -> squeue::Entry> {
    let fd_in = fd_in.into();
    let fd_out = fd_out.into();
    OpFuture::new((), move |_| {
        with_fd!(fd_in, |fin| with_fd!(fd_out, |fout| opcode::Splice::new(
            fin, off_in, fout, off_out, len
        )
        .flags(flags)
        .build()))
    })
}

/// Sleep for `dur`; completes with `-ETIME` on expiry, or earlier when
/// `count` other completions have been posted (0 = pure timer).
pub fn async_timeout(
    dur: Duration,
    count: u32,
    flags: TimeoutFlags,
) -> OpFuture<types::Timespec, impl FnOnce(&mut types::Timespec) -> squeue::Entry> {
    let ts = types::Timespec::new()
        .sec(dur.as_secs())
        .nsec(dur.subsec_nanos());
    OpFuture::new(ts, move |ts| {
        opcode::Timeout::new(ts as *const types::Timespec)
            .count(count)
            .flags(flags)
            .build()
    })
}

/// Repeating timeout: `on_tick` fires per expiry until cancelled.
pub fn async_timeout_multishot<C: FnMut(i32)>(
    dur: Duration,
    count: u32,
    flags: TimeoutFlags,
    on_tick: C,
) -> MultiShotOpFuture<types::Timespec, impl FnOnce(&mut types::Timespec) -> squeue::Entry, C> {
    let ts = types::Timespec::new()
        .sec(dur.as_secs())
        .nsec(dur.subsec_nanos());
    let flags = flags | TimeoutFlags::from_bits_retain(1 << 6); // IORING_TIMEOUT_MULTISHOT
    MultiShotOpFuture::new(
        ts,
        move |ts| {
            opcode::Timeout::new(ts as *const types::Timespec)
                .count(count)
                .flags(flags)
                .build()
        },
        on_tick,
    )
}

/// Wait until `*futex != expected` or a wake arrives.
pub fn async_futex_wait<'f>(
    futex: &'f AtomicU32,
    expected: u32,
) -> OpFuture<&'f AtomicU32, impl FnOnce(&mut &'f AtomicU32) -> squeue::Entry> {
    OpFuture::new(futex, move |f| {
        opcode::FutexWait::new(
            f.as_ptr(),
            expected as u64,
            FUTEX_BITSET_MATCH_ANY,
            FUTEX2_SIZE_U32,
        )
        .build()
    })
}

/// Wake up to `count` futex waiters; resolves with the number woken.
pub fn async_futex_wake<'f>(
    futex: &'f AtomicU32,
    count: u32,
) -> OpFuture<&'f AtomicU32, impl FnOnce(&mut &'f AtomicU32) -> squeue::Entry> {
    OpFuture::new(futex, move |f| {
        opcode::FutexWake::new(
            f.as_ptr(),
            count as u64,
            FUTEX_BITSET_MATCH_ANY,
            FUTEX2_SIZE_U32,
        )
        .build()
    })
}

/// Build a multishot callback that routes each result into `chan` without
/// back-pressure. The channel must be sized for the worst-case fan-in;
/// prefer awaited pushes when the producer can suspend.
pub fn will_push(chan: &Channel<i32>) -> impl FnMut(i32) + '_ {
    move |res| chan.force_push(res)
}

/// Build a multishot callback that spawns a detached coroutine per result.
pub fn will_spawn<Fut, F>(mut make: F) -> impl FnMut(i32)
where
    Fut: Future + Send + 'static,
    Fut::Output: Send,
    F: FnMut(i32) -> Fut,
{
    move |res| spawn(make(res)).detach()
}

fn sockaddr_from(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            std::mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            std::mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

/// Receive a single provided buffer from `pool` (convenience alias used by
/// recv paths; the generic [`async_recv_provided`] also accepts queues and
/// bundled views).
pub fn async_recv_pooled<'g>(
    fd: impl Into<OpFd>,
    pool: &'g ProvidedBufferPool,
    flags: i32,
) -> SelectOpFuture<'g, (), impl FnOnce(&mut ()) -> squeue::Entry, ProvidedBufferPool> {
    async_recv_provided(fd, pool, flags)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sockaddr_v4_conversion() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let (storage, len) = sockaddr_from(addr);
        assert_eq!(len as usize, std::mem::size_of::<libc::sockaddr_in>());
        let sin = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in) };
        assert_eq!(sin.sin_family, libc::AF_INET as libc::sa_family_t);
        assert_eq!(u16::from_be(sin.sin_port), 8080);
        assert_eq!(sin.sin_addr.s_addr, u32::from_ne_bytes([127, 0, 0, 1]));
    }

    #[test]
    fn test_sockaddr_v6_conversion() {
        let addr: SocketAddr = "[::1]:443".parse().unwrap();
        let (storage, len) = sockaddr_from(addr);
        assert_eq!(len as usize, std::mem::size_of::<libc::sockaddr_in6>());
        let sin6 = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in6) };
        assert_eq!(sin6.sin6_family, libc::AF_INET6 as libc::sa_family_t);
        assert_eq!(u16::from_be(sin6.sin6_port), 443);
    }

    #[test]
    fn test_fixed_fd_marker() {
        match fixed(3) {
            OpFd::Fixed(3) => {}
            other => panic!("unexpected: {:?}", other),
        }
        match OpFd::from(5) {
            OpFd::Raw(5) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }
}
