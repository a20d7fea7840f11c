//! User-provided buffer groups.
//!
//! Two flavours live alongside a ring: a *queue* of variable-sized
//! application buffers supplied one at a time, and a *pool* of fixed-sized
//! buffers carved from a single mapping that recycles returned buffers.
//! An op that opts into buffer selection names the group in its SQE; on
//! completion the kernel reports the chosen buffer id in the CQE flags and a
//! [`BufferRing`] implementation translates that into a typed buffer value.

use crate::cqe::{CQE_BUFFER_SHIFT, CQE_F_BUFFER, CQE_F_BUF_MORE};
use crate::error::{Result, RingError};
use crate::sys;
use io_uring::IoUring;
use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};
use std::cell::Cell;
use std::num::NonZeroUsize;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr::NonNull;
use std::rc::Rc;

/// Translate a buffer-select completion into a typed buffer value.
pub trait BufferRing {
    type Out;

    /// Buffer group id to name in the SQE.
    fn bgid(&self) -> u16;

    /// Account for a completion and hand back the selected buffer(s).
    fn on_complete(&self, res: i32, flags: u32) -> Self::Out;
}

/// struct io_uring_buf
#[repr(C)]
#[derive(Clone, Copy)]
struct BufRingEntry {
    addr: u64,
    len: u32,
    bid: u16,
    resv: u16,
}

/// The kernel reads the published tail through the resv field of entry 0.
const TAIL_OFFSET: usize = 14;

/// One mmap'd, registered buffer ring. `extra` bytes beyond the entry array
/// back the pool flavour's carved buffers.
struct BufRingMap {
    base: NonNull<libc::c_void>,
    map_len: usize,
    entries: u32,
    bgid: u16,
    ring_fd: RawFd,
    tail: Cell<u16>,
}

impl BufRingMap {
    fn create(ring: &IoUring, entries: u32, extra: usize, bgid: u16) -> Result<Self> {
        debug_assert!(entries.is_power_of_two());
        let map_len = entries as usize * std::mem::size_of::<BufRingEntry>() + extra;
        let base = unsafe {
            mmap_anonymous(
                None,
                NonZeroUsize::new(map_len).expect("empty buffer ring"),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            )
        }
        .map_err(|e| RingError::Mmap(e as i32))?;

        let registered = unsafe {
            ring.submitter()
                .register_buf_ring(base.as_ptr() as u64, entries as u16, bgid)
        };
        if let Err(e) = registered {
            let errno = e.raw_os_error().unwrap_or(libc::EINVAL);
            let _ = unsafe { munmap(base, map_len) };
            return Err(RingError::Register(errno));
        }
        Ok(Self {
            base,
            map_len,
            entries,
            bgid,
            ring_fd: ring.as_raw_fd(),
            tail: Cell::new(0),
        })
    }

    fn mask(&self) -> u16 {
        (self.entries - 1) as u16
    }

    unsafe fn entry_ptr(&self, idx: u16) -> *mut BufRingEntry {
        (self.base.as_ptr() as *mut BufRingEntry).add((idx & self.mask()) as usize)
    }

    /// Stage one buffer `offset` slots past the unpublished tail.
    fn add(&self, addr: *mut u8, len: u32, bid: u16, offset: u16) {
        let idx = self.tail.get().wrapping_add(offset);
        unsafe {
            *self.entry_ptr(idx) = BufRingEntry {
                addr: addr as u64,
                len,
                bid,
                resv: 0,
            };
        }
    }

    /// Publish `count` staged buffers to the kernel.
    fn advance(&self, count: u16) {
        let tail = self.tail.get().wrapping_add(count);
        self.tail.set(tail);
        let tail_ptr = unsafe { self.base.as_ptr().cast::<u8>().add(TAIL_OFFSET) };
        let atomic = unsafe { &*(tail_ptr as *const std::sync::atomic::AtomicU16) };
        atomic.store(tail, std::sync::atomic::Ordering::Release);
    }

    /// Start of the carved buffer area (pool flavour).
    fn buffers_base(&self) -> *mut u8 {
        unsafe {
            self.base
                .as_ptr()
                .cast::<u8>()
                .add(self.entries as usize * std::mem::size_of::<BufRingEntry>())
        }
    }
}

impl Drop for BufRingMap {
    fn drop(&mut self) {
        let reg = sys::BufReg {
            bgid: self.bgid,
            ..Default::default()
        };
        let r = sys::io_uring_register(
            self.ring_fd,
            sys::IORING_UNREGISTER_PBUF_RING,
            &reg as *const _ as *const libc::c_void,
            1,
        );
        if r < 0 {
            ouro_core::owarn!("unregister buf ring {} failed: errno {}", self.bgid, -r);
        }
        let _ = unsafe { munmap(self.base, self.map_len) };
    }
}

/// Identifies which buffers a bundled completion consumed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferInfo {
    pub bid: u16,
    pub num_buffers: u16,
}

/// A queue of caller-supplied buffers, pushed one at a time. Suited to send
/// paths where the application already owns the memory.
pub struct ProvidedBufferQueue {
    map: BufRingMap,
    size: Cell<u32>,
}

impl ProvidedBufferQueue {
    pub fn new(ring: &IoUring, capacity: u32, bgid: u16) -> Result<Self> {
        let entries = capacity.max(1).next_power_of_two();
        Ok(Self {
            map: BufRingMap::create(ring, entries, 0, bgid)?,
            size: Cell::new(0),
        })
    }

    pub fn capacity(&self) -> u32 {
        self.map.entries
    }

    pub fn len(&self) -> u32 {
        self.size.get()
    }

    pub fn is_empty(&self) -> bool {
        self.size.get() == 0
    }

    /// Hand one buffer to the kernel; returns its buffer id.
    ///
    /// # Safety
    ///
    /// The memory must stay valid until a completion consumes the buffer.
    /// Panics when the group already holds `capacity` buffers.
    pub unsafe fn push(&self, addr: *mut u8, len: u32) -> u16 {
        assert!(
            self.size.get() < self.capacity(),
            "provided buffer queue capacity exceeded"
        );
        let bid = self.map.tail.get() & self.map.mask();
        self.map.add(addr, len, bid, 0);
        self.map.advance(1);
        self.size.set(self.size.get() + 1);
        bid
    }
}

impl BufferRing for ProvidedBufferQueue {
    type Out = BufferInfo;

    fn bgid(&self) -> u16 {
        self.map.bgid
    }

    fn on_complete(&self, res: i32, flags: u32) -> BufferInfo {
        if res < 0 {
            return BufferInfo::default();
        }
        debug_assert!(flags & CQE_F_BUFFER != 0);
        let bid = (flags >> CQE_BUFFER_SHIFT) as u16;
        if flags & CQE_F_BUF_MORE != 0 {
            // Incremental consumption: the kernel retains the buffer.
            return BufferInfo {
                bid,
                num_buffers: 0,
            };
        }
        let mut bytes = res as i64;
        let mut consumed = 0u16;
        let mut curr = bid;
        while bytes > 0 {
            let entry = unsafe { *self.map.entry_ptr(curr) };
            bytes -= entry.len as i64;
            consumed += 1;
            curr = curr.wrapping_add(1);
        }
        debug_assert!(self.size.get() >= consumed as u32);
        self.size.set(self.size.get() - consumed as u32);
        BufferInfo {
            bid,
            num_buffers: consumed,
        }
    }
}

struct PoolShared {
    map: BufRingMap,
    buf_size: usize,
    /// Bytes of the current head buffer already handed out incrementally.
    partial: Cell<u32>,
    /// Consumption cursor over the entry ring.
    head: Cell<u16>,
}

impl PoolShared {
    fn buffer_at(&self, bid: u16) -> *mut u8 {
        unsafe { self.map.buffers_base().add(bid as usize * self.buf_size) }
    }

    fn recycle(&self, ptr: *mut u8) {
        let base = self.map.buffers_base();
        debug_assert!(ptr >= base);
        let offset = ptr as usize - base as usize;
        let bid = (offset / self.buf_size) as u16;
        debug_assert!((bid as u32) < self.map.entries);
        self.map
            .add(self.buffer_at(bid), self.buf_size as u32, bid, 0);
        self.map.advance(1);
    }
}

/// A fixed-size buffer selected by the kernel. Dropping it returns the
/// memory to its pool, re-entering the kernel's view of owned buffers.
pub struct ProvidedBuffer {
    data: *mut u8,
    len: usize,
    pool: Option<Rc<PoolShared>>,
}

impl ProvidedBuffer {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        if self.data.is_null() {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(self.data, self.len) }
        }
    }

    /// Whether dropping this buffer recycles pool memory (false for empty
    /// results and incremental views still owned by the kernel).
    pub fn owns_buffer(&self) -> bool {
        self.pool.is_some()
    }
}

impl Default for ProvidedBuffer {
    fn default() -> Self {
        Self {
            data: std::ptr::null_mut(),
            len: 0,
            pool: None,
        }
    }
}

impl Drop for ProvidedBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.recycle(self.data);
        }
    }
}

/// A pool of `num_buffers` fixed-size buffers carved from one mapping.
/// Suited to recv/read paths.
pub struct ProvidedBufferPool {
    shared: Rc<PoolShared>,
}

impl ProvidedBufferPool {
    pub fn new(ring: &IoUring, num_buffers: u32, buf_size: usize, bgid: u16) -> Result<Self> {
        let entries = num_buffers.max(1).next_power_of_two();
        let map = BufRingMap::create(ring, entries, entries as usize * buf_size, bgid)?;
        let shared = PoolShared {
            map,
            buf_size,
            partial: Cell::new(0),
            head: Cell::new(0),
        };
        for bid in 0..entries as u16 {
            shared
                .map
                .add(shared.buffer_at(bid), buf_size as u32, bid, bid);
        }
        shared.map.advance(entries as u16);
        Ok(Self {
            shared: Rc::new(shared),
        })
    }

    pub fn capacity(&self) -> u32 {
        self.shared.map.entries
    }

    pub fn buffer_size(&self) -> usize {
        self.shared.buf_size
    }

    fn collect(&self, res: i32, flags: u32) -> Vec<ProvidedBuffer> {
        let shared = &self.shared;
        let mut out = Vec::new();
        if res < 0 {
            return out;
        }
        debug_assert!(flags & CQE_F_BUFFER != 0);

        if flags & CQE_F_BUF_MORE != 0 {
            // Incremental consumption: a view into the head buffer; the
            // kernel keeps ownership until the final completion.
            let bid = (flags >> CQE_BUFFER_SHIFT) as u16;
            let data = unsafe { shared.buffer_at(bid).add(shared.partial.get() as usize) };
            out.push(ProvidedBuffer {
                data,
                len: res as usize,
                pool: None,
            });
            shared.partial.set(shared.partial.get() + res as u32);
            return out;
        }

        let mut bytes = res as usize;
        loop {
            let entry = unsafe { *shared.map.entry_ptr(shared.head.get()) };
            let partial = shared.partial.get() as usize;
            let avail = shared.buf_size - partial;
            let take = bytes.min(avail);
            out.push(ProvidedBuffer {
                data: unsafe { shared.buffer_at(entry.bid).add(partial) },
                len: take,
                pool: Some(shared.clone()),
            });
            shared.partial.set(0);
            shared.head.set(shared.head.get().wrapping_add(1));
            bytes -= take;
            if bytes == 0 {
                break;
            }
        }
        out
    }
}

impl BufferRing for ProvidedBufferPool {
    type Out = ProvidedBuffer;

    fn bgid(&self) -> u16 {
        self.shared.map.bgid
    }

    fn on_complete(&self, res: i32, flags: u32) -> ProvidedBuffer {
        let mut buffers = self.collect(res, flags);
        if buffers.is_empty() {
            return ProvidedBuffer::default();
        }
        debug_assert_eq!(buffers.len(), 1);
        buffers.swap_remove(0)
    }
}

/// View enabling io_uring's buffer bundling: completions may span several
/// pool buffers and come back as a vector.
pub struct Bundled<'a>(pub &'a ProvidedBufferPool);

/// Opt a pool into bundled completions.
pub fn bundled(pool: &ProvidedBufferPool) -> Bundled<'_> {
    Bundled(pool)
}

impl BufferRing for Bundled<'_> {
    type Out = Vec<ProvidedBuffer>;

    fn bgid(&self) -> u16 {
        self.0.bgid()
    }

    fn on_complete(&self, res: i32, flags: u32) -> Vec<ProvidedBuffer> {
        self.0.collect(res, flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_or_skip() -> Option<IoUring> {
        let ring = IoUring::new(8).unwrap();
        match crate::probe::Features::probe(&ring) {
            Ok(f) if f.buf_ring => Some(ring),
            _ => {
                eprintln!("skipping: provided buffer rings unsupported");
                None
            }
        }
    }

    #[test]
    fn test_pool_registers_and_unregisters() {
        let Some(ring) = ring_or_skip() else { return };
        let pool = ProvidedBufferPool::new(&ring, 4, 4096, 0).unwrap();
        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.buffer_size(), 4096);
        drop(pool);
        // Group id is free again.
        let again = ProvidedBufferPool::new(&ring, 4, 4096, 0).unwrap();
        drop(again);
    }

    #[test]
    fn test_pool_completion_accounting() {
        let Some(ring) = ring_or_skip() else { return };
        let pool = ProvidedBufferPool::new(&ring, 4, 16, 1).unwrap();
        // Simulate the kernel picking buffer 0 for a 10-byte recv.
        let flags = CQE_F_BUFFER | (0 << CQE_BUFFER_SHIFT);
        let buf = pool.on_complete(10, flags);
        assert_eq!(buf.len(), 10);
        assert!(buf.owns_buffer());
        let ptr = buf.as_slice().as_ptr();
        drop(buf); // recycled
        // Next completion re-uses the recycled region eventually; here we
        // only check the second consumption walks to buffer 1.
        let buf2 = pool.on_complete(16, CQE_F_BUFFER | (1 << CQE_BUFFER_SHIFT));
        assert_eq!(buf2.len(), 16);
        assert_ne!(buf2.as_slice().as_ptr(), ptr);
    }

    #[test]
    fn test_bundled_completion_spans_buffers() {
        let Some(ring) = ring_or_skip() else { return };
        let pool = ProvidedBufferPool::new(&ring, 4, 16, 2).unwrap();
        let bundle = bundled(&pool);
        let bufs = bundle.on_complete(40, CQE_F_BUFFER);
        assert_eq!(bufs.len(), 3);
        assert_eq!(bufs[0].len(), 16);
        assert_eq!(bufs[1].len(), 16);
        assert_eq!(bufs[2].len(), 8);
    }

    #[test]
    fn test_queue_push_and_account() {
        let Some(ring) = ring_or_skip() else { return };
        let queue = ProvidedBufferQueue::new(&ring, 4, 3).unwrap();
        let mut a = vec![0u8; 8];
        let mut b = vec![0u8; 8];
        let bid_a = unsafe { queue.push(a.as_mut_ptr(), 8) };
        let _bid_b = unsafe { queue.push(b.as_mut_ptr(), 8) };
        assert_eq!(queue.len(), 2);
        let info = queue.on_complete(12, CQE_F_BUFFER | ((bid_a as u32) << CQE_BUFFER_SHIFT));
        assert_eq!(info.bid, bid_a);
        assert_eq!(info.num_buffers, 2);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_error_result_yields_empty() {
        let Some(ring) = ring_or_skip() else { return };
        let pool = ProvidedBufferPool::new(&ring, 2, 16, 4).unwrap();
        let buf = pool.on_complete(-libc::ECONNRESET, 0);
        assert!(buf.is_empty());
        assert!(!buf.owns_buffer());
    }
}
