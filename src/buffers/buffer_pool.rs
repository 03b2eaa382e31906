use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use anyhow::bail;
use tracing::{debug, trace};
use crate::buffers::fixed_buffer::FixedBuf;

/// What to do when a lease is requested while the configured maximum number of buffers is
///  already outstanding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolExhaustionPolicy {
    /// allocate a fresh buffer, letting the pool grow beyond its configured bound
    Allocate,
    /// fail the lease, surfacing the exhaustion to the caller
    Reject,
}

/// A pool of fixed-size buffers for datagram I/O, so that steady-state operation does not
///  allocate per packet.
///
/// Buffers are handed out with single-owner semantics: a leased buffer is exclusively owned
///  by its holder until it is released, and the pool never hands the same buffer to two
///  holders concurrently.
///
/// NB: The outstanding count is a soft bound. A lease whose holding task is cancelled while
///  parked on socket I/O forfeits its buffer without releasing it; the pool replaces such
///  buffers on subsequent leases.
pub struct BufferPool {
    buf_size: usize,
    buffers: Mutex<Vec<FixedBuf>>,
    outstanding: AtomicUsize,
    max_outstanding: usize,
    exhaustion_policy: PoolExhaustionPolicy,
}

impl BufferPool {
    pub fn new(buf_size: usize, max_outstanding: usize, exhaustion_policy: PoolExhaustionPolicy) -> BufferPool {
        BufferPool {
            buf_size,
            buffers: Mutex::new(Vec::with_capacity(max_outstanding)),
            outstanding: AtomicUsize::new(0),
            max_outstanding,
            exhaustion_policy,
        }
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn lease(&self) -> anyhow::Result<FixedBuf> {
        {
            let mut buffers = self.buffers.lock().unwrap();
            if let Some(buffer) = buffers.pop() {
                trace!("returning buffer from pool");
                self.outstanding.fetch_add(1, Ordering::AcqRel);
                return Ok(buffer);
            }
        }

        if self.outstanding.load(Ordering::Acquire) >= self.max_outstanding {
            match self.exhaustion_policy {
                PoolExhaustionPolicy::Allocate => {
                    debug!("buffer pool exhausted: allocating beyond the configured maximum of {}", self.max_outstanding);
                }
                PoolExhaustionPolicy::Reject => {
                    bail!("buffer pool exhausted: {} buffers outstanding", self.max_outstanding);
                }
            }
        }
        else {
            debug!("no buffer in pool: creating new buffer");
        }

        self.outstanding.fetch_add(1, Ordering::AcqRel);
        Ok(FixedBuf::new(self.buf_size))
    }

    pub fn release(&self, mut buffer: FixedBuf) {
        assert_eq!(buffer.capacity(), self.buf_size,
                   "released buffer does not have the regular capacity of {} bytes, maybe a datagram exceeding the configured datagram size was sent"
                   , self.buf_size);

        buffer.clear();
        self.outstanding.fetch_sub(1, Ordering::AcqRel);

        let mut buffers = self.buffers.lock().unwrap();
        if buffers.capacity() > buffers.len() {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("pool is full: discarding released buffer");
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;
    use super::*;

    #[test]
    fn test_clear_on_release() {
        let pool = BufferPool::new(10, 10, PoolExhaustionPolicy::Allocate);

        let mut buf = pool.lease().unwrap();
        buf.put_u8(1);
        buf.put_u8(2);

        pool.release(buf);

        assert_eq!(pool.lease().unwrap().as_ref(), b"");
    }

    #[test]
    fn test_reuse() {
        let pool = BufferPool::new(10, 10, PoolExhaustionPolicy::Allocate);

        let mut buf = pool.lease().unwrap();
        buf.put_u8(1);
        pool.release(buf);

        let buf = pool.lease().unwrap();
        assert_eq!(buf.capacity(), 10);
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_exhaustion_allocate() {
        let pool = BufferPool::new(10, 1, PoolExhaustionPolicy::Allocate);

        let buf1 = pool.lease().unwrap();
        let buf2 = pool.lease().unwrap();

        pool.release(buf1);
        pool.release(buf2);
    }

    #[test]
    fn test_exhaustion_reject() {
        let pool = BufferPool::new(10, 1, PoolExhaustionPolicy::Reject);

        let buf1 = pool.lease().unwrap();
        assert!(pool.lease().is_err());

        pool.release(buf1);
        assert!(pool.lease().is_ok());
    }

    #[test]
    fn test_retention_bound() {
        let pool = BufferPool::new(10, 2, PoolExhaustionPolicy::Allocate);

        let buf1 = pool.lease().unwrap();
        let buf2 = pool.lease().unwrap();
        let buf3 = pool.lease().unwrap();

        // the third buffer exceeds the pool's retained capacity and is discarded on release
        pool.release(buf1);
        pool.release(buf2);
        pool.release(buf3);

        assert_eq!(pool.buffers.lock().unwrap().len(), 2);
    }
}
