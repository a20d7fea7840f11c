//! Buffer-group constructors bound to the current runtime.
//!
//! Group ids are handed out by the thread context; the groups register with
//! the current runtime's ring and must be created (and dropped) on that
//! runtime's thread.

use crate::context;
use crate::error::Result;
use ouro_uring::provided::{ProvidedBufferPool, ProvidedBufferQueue};

/// Create a pool of `num_buffers` fixed-size buffers registered with the
/// current runtime's ring. Suited to recv/read paths.
pub fn provided_buffer_pool(num_buffers: u32, buf_size: usize) -> Result<ProvidedBufferPool> {
    let rt = context::current_runtime().expect("buffer groups are created inside a runtime");
    let bgid = context::next_bgid();
    let pool = rt.with_ring(|ring| ProvidedBufferPool::new(ring.io(), num_buffers, buf_size, bgid))?;
    Ok(pool)
}

/// Create a queue for caller-supplied buffers registered with the current
/// runtime's ring. Suited to send paths.
pub fn provided_buffer_queue(capacity: u32) -> Result<ProvidedBufferQueue> {
    let rt = context::current_runtime().expect("buffer groups are created inside a runtime");
    let bgid = context::next_bgid();
    let queue = rt.with_ring(|ring| ProvidedBufferQueue::new(ring.io(), capacity, bgid))?;
    Ok(queue)
}
