//! Work tags and the type-erased work unit.
//!
//! Every address the runtime hands to the kernel as ring user-data is 8-byte
//! aligned; the low three bits carry a [`WorkTag`] telling the event loop how
//! to treat the matching completion. A [`Work`] is the type-erased unit the
//! ready queues carry: an intrusive link plus a resume function. Containers
//! embed it as their first field (`#[repr(C)]`) so a `*mut Work` is also a
//! pointer to the container.

use std::cell::Cell;
use std::ptr;

/// Low three bits of a user-data pointer.
pub const TAG_MASK: u64 = 0b111;

/// Discriminator stored in the low bits of ring user-data.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkTag {
    /// Single-shot operation finish handle.
    Common = 0,
    /// Completion only signals; the payload is dropped.
    Ignore = 1,
    /// Cross-runtime notifier completion.
    Notify = 2,
    /// Registered-fd transfer from another ring.
    SendFd = 3,
    /// A `Work` scheduled from another runtime.
    Schedule = 4,
    /// Multi-shot operation finish handle.
    MultiShot = 5,
    /// Zero-copy operation finish handle.
    ZeroCopy = 6,
}

impl WorkTag {
    /// Decode a tag from its bit pattern. Panics on the unused pattern 7,
    /// which can only appear if user-data was corrupted.
    pub fn from_bits(bits: u8) -> Self {
        match bits {
            0 => WorkTag::Common,
            1 => WorkTag::Ignore,
            2 => WorkTag::Notify,
            3 => WorkTag::SendFd,
            4 => WorkTag::Schedule,
            5 => WorkTag::MultiShot,
            6 => WorkTag::ZeroCopy,
            _ => panic!("invalid work tag bits: {}", bits),
        }
    }
}

/// Pack a pointer and a tag into a ring user-data value.
///
/// The pointer must be 8-byte aligned; a null pointer with [`WorkTag::Ignore`]
/// is the canonical "this completion only signals" payload.
pub fn encode_work(ptr: *const (), tag: WorkTag) -> u64 {
    let addr = ptr as u64;
    debug_assert_eq!(addr & TAG_MASK, 0, "work pointers must be 8-byte aligned");
    addr | tag as u64
}

/// Split a ring user-data value back into its pointer and tag.
pub fn decode_work(data: u64) -> (*mut (), WorkTag) {
    let ptr = (data & !TAG_MASK) as *mut ();
    (ptr, WorkTag::from_bits((data & TAG_MASK) as u8))
}

/// Type-erased unit of execution.
///
/// Embedded as the first field of every schedulable object (task cells,
/// operation finish handles, channel waiters). The runtime only ever sees
/// `*mut Work`; `resume` knows the concrete container.
#[repr(C, align(8))]
pub struct Work {
    next: Cell<*mut Work>,
    resume: unsafe fn(*mut Work),
}

impl Work {
    pub const fn new(resume: unsafe fn(*mut Work)) -> Self {
        Self {
            next: Cell::new(ptr::null_mut()),
            resume,
        }
    }

    /// Run the work.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live `Work` that is not currently linked into
    /// any queue. The resume function may free the containing object.
    pub unsafe fn invoke(ptr: *mut Work) {
        let resume = (*ptr).resume;
        resume(ptr);
    }
}

/// Intrusive singly-linked FIFO of [`Work`] pointers.
///
/// Used for both the runtime's local ready queue and the mutex-protected
/// global queue; the latter is drained into the former with [`append`] in
/// O(1).
///
/// [`append`]: WorkList::append
pub struct WorkList {
    head: *mut Work,
    tail: *mut Work,
    len: usize,
}

// The list is only ever mutated under a mutex (global queue) or by the
// owning runtime thread (local queue); the raw pointers themselves are
// transferable.
unsafe impl Send for WorkList {}

impl WorkList {
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            len: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Append one work.
    ///
    /// # Safety
    ///
    /// `work` must be live and not already linked into any list.
    pub unsafe fn push_back(&mut self, work: *mut Work) {
        debug_assert!(!work.is_null());
        let entry = &(*work).next;
        debug_assert!(entry.get().is_null(), "work already linked");
        entry.set(ptr::null_mut());
        if self.head.is_null() {
            self.head = work;
        } else {
            (*self.tail).next.set(work);
        }
        self.tail = work;
        self.len += 1;
    }

    /// Splice every element of `other` onto the back of `self`, leaving
    /// `other` empty.
    pub fn append(&mut self, other: &mut WorkList) {
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            self.head = other.head;
        } else {
            unsafe { (*self.tail).next.set(other.head) };
        }
        self.tail = other.tail;
        self.len += other.len;
        other.head = ptr::null_mut();
        other.tail = ptr::null_mut();
        other.len = 0;
    }

    /// Pop the oldest work, or null when empty.
    pub fn pop_front(&mut self) -> *mut Work {
        if self.head.is_null() {
            return ptr::null_mut();
        }
        let work = self.head;
        unsafe {
            self.head = (*work).next.get();
            (*work).next.set(ptr::null_mut());
        }
        if self.head.is_null() {
            self.tail = ptr::null_mut();
        }
        self.len -= 1;
        work
    }
}

impl Default for WorkList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_roundtrip() {
        let tags = [
            WorkTag::Common,
            WorkTag::Ignore,
            WorkTag::Notify,
            WorkTag::SendFd,
            WorkTag::Schedule,
            WorkTag::MultiShot,
            WorkTag::ZeroCopy,
        ];
        let boxed: Box<u64> = Box::new(0);
        let ptr = &*boxed as *const u64 as *const ();
        for tag in tags {
            let data = encode_work(ptr, tag);
            let (decoded, t) = decode_work(data);
            assert_eq!(decoded as *const (), ptr);
            assert_eq!(t, tag);
        }
    }

    #[test]
    fn test_null_ignore_payload() {
        let data = encode_work(ptr::null(), WorkTag::Ignore);
        let (p, tag) = decode_work(data);
        assert!(p.is_null());
        assert_eq!(tag, WorkTag::Ignore);
    }

    #[test]
    #[should_panic(expected = "invalid work tag")]
    fn test_invalid_tag_panics() {
        WorkTag::from_bits(7);
    }

    #[repr(C)]
    struct Probe {
        work: Work,
        hits: Cell<u32>,
    }

    unsafe fn probe_resume(w: *mut Work) {
        let probe = w as *mut Probe;
        (*probe).hits.set((*probe).hits.get() + 1);
    }

    #[test]
    fn test_work_invoke_reaches_container() {
        let probe = Probe {
            work: Work::new(probe_resume),
            hits: Cell::new(0),
        };
        let w = &probe.work as *const Work as *mut Work;
        unsafe { Work::invoke(w) };
        unsafe { Work::invoke(w) };
        assert_eq!(probe.hits.get(), 2);
    }

    #[test]
    fn test_list_fifo() {
        let items: Vec<Probe> = (0..4)
            .map(|_| Probe {
                work: Work::new(probe_resume),
                hits: Cell::new(0),
            })
            .collect();
        let mut list = WorkList::new();
        assert!(list.is_empty());
        assert!(list.pop_front().is_null());
        for item in &items {
            unsafe { list.push_back(&item.work as *const Work as *mut Work) };
        }
        assert_eq!(list.len(), 4);
        for item in &items {
            let w = list.pop_front();
            assert_eq!(w, &item.work as *const Work as *mut Work);
        }
        assert!(list.is_empty());
    }

    #[test]
    fn test_list_append_splices() {
        let items: Vec<Probe> = (0..6)
            .map(|_| Probe {
                work: Work::new(probe_resume),
                hits: Cell::new(0),
            })
            .collect();
        let mut a = WorkList::new();
        let mut b = WorkList::new();
        for item in &items[..2] {
            unsafe { a.push_back(&item.work as *const Work as *mut Work) };
        }
        for item in &items[2..] {
            unsafe { b.push_back(&item.work as *const Work as *mut Work) };
        }
        a.append(&mut b);
        assert!(b.is_empty());
        assert_eq!(a.len(), 6);
        for item in &items {
            assert_eq!(a.pop_front(), &item.work as *const Work as *mut Work);
        }

        // Appending into an empty list takes over the other list wholesale.
        let mut c = WorkList::new();
        unsafe { b.push_back(&items[0].work as *const Work as *mut Work) };
        c.append(&mut b);
        assert_eq!(c.len(), 1);
        assert!(!c.pop_front().is_null());
    }
}
