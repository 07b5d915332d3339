//! Byte ring buffer between chunk ingress and the sink feeder
//!
//! Bounded contiguous buffer with wrap-around indices. Writes never drop:
//! an overflowing write grows the buffer (doubling, preserving order) up to
//! a hard ceiling, beyond which it fails. A sticky `finished` flag lets the
//! feeder distinguish "empty for now" from "drained". Single producer
//! (chunk ingress), single consumer (sink feeder).

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::DaemonError;

struct Inner {
    buf: Vec<u8>,
    read: usize,
    size: usize,
    finished: bool,
}

impl Inner {
    fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn free(&self) -> usize {
        self.capacity() - self.size
    }

    fn write_pos(&self) -> usize {
        (self.read + self.size) % self.capacity()
    }

    /// Double capacity until `needed` more bytes fit, preserving order
    fn grow_for(&mut self, needed: usize, ceiling: usize) -> Result<(), DaemonError> {
        let mut target = self.capacity().max(1);
        while target - self.size < needed {
            target *= 2;
        }
        if target > ceiling {
            return Err(DaemonError::RingCapacityExceeded(target));
        }

        let mut fresh = vec![0u8; target];
        let old_cap = self.capacity();
        for i in 0..self.size {
            fresh[i] = self.buf[(self.read + i) % old_cap];
        }
        self.buf = fresh;
        self.read = 0;
        Ok(())
    }
}

/// The ring buffer
pub struct RingBuffer {
    inner: Mutex<Inner>,
    /// Wakes the feeder on new data or finish
    notify: Notify,
    hard_ceiling: usize,
}

impl RingBuffer {
    /// `capacity` is the initial size; growth stops at
    /// `capacity * growth_ceiling`
    pub fn new(capacity: usize, growth_ceiling: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                buf: vec![0u8; capacity],
                read: 0,
                size: 0,
                finished: false,
            }),
            notify: Notify::new(),
            hard_ceiling: capacity * growth_ceiling.max(1),
        }
    }

    /// Append all of `bytes`; grows instead of dropping
    pub fn write(&self, bytes: &[u8]) -> Result<usize, DaemonError> {
        if bytes.is_empty() {
            return Ok(0);
        }
        let mut inner = self.inner.lock();
        if inner.free() < bytes.len() {
            let needed = bytes.len();
            inner.grow_for(needed, self.hard_ceiling)?;
            tracing::debug!(capacity = inner.capacity(), "Ring buffer grew");
        }

        let cap = inner.capacity();
        let mut pos = inner.write_pos();
        for &b in bytes {
            inner.buf[pos] = b;
            pos = (pos + 1) % cap;
        }
        inner.size += bytes.len();
        drop(inner);

        self.notify.notify_one();
        Ok(bytes.len())
    }

    /// Take up to `n` bytes from the front
    pub fn read(&self, n: usize) -> Vec<u8> {
        let mut inner = self.inner.lock();
        let take = n.min(inner.size);
        let cap = inner.capacity();
        let mut out = Vec::with_capacity(take);
        for i in 0..take {
            out.push(inner.buf[(inner.read + i) % cap]);
        }
        inner.read = (inner.read + take) % cap;
        inner.size -= take;
        out
    }

    /// Wait for up to `n` bytes; returns `None` once finished and drained
    ///
    /// Returns as soon as any data is available rather than blocking for a
    /// full `n`, so the feeder keeps the sink fed during slow production.
    pub async fn read_wait(&self, n: usize) -> Option<Vec<u8>> {
        loop {
            {
                let inner = self.inner.lock();
                if inner.size == 0 && inner.finished {
                    return None;
                }
            }
            let bytes = self.read(n);
            if !bytes.is_empty() {
                return Some(bytes);
            }
            self.notify.notified().await;
        }
    }

    /// Sticky end-of-stream marker
    pub fn mark_finished(&self) {
        self.inner.lock().finished = true;
        self.notify.notify_one();
    }

    pub fn is_finished(&self) -> bool {
        self.inner.lock().finished
    }

    pub fn available(&self) -> usize {
        self.inner.lock().size
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity()
    }

    /// Drop buffered data; `finished` stays as set
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.read = 0;
        inner.size = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_write_then_read_round_trip() {
        let ring = RingBuffer::new(16, 8);
        assert_eq!(ring.write(b"hello").unwrap(), 5);
        assert_eq!(ring.read(5), b"hello");
        assert_eq!(ring.available(), 0);
    }

    #[test]
    fn test_read_returns_up_to_available() {
        let ring = RingBuffer::new(16, 8);
        ring.write(b"abc").unwrap();
        assert_eq!(ring.read(100), b"abc");
        assert!(ring.read(10).is_empty());
    }

    #[test]
    fn test_wraparound_preserves_order() {
        let ring = RingBuffer::new(8, 8);
        ring.write(b"abcdef").unwrap();
        assert_eq!(ring.read(4), b"abcd");
        // Write wraps past the end
        ring.write(b"ghijkl").unwrap();
        assert_eq!(ring.read(8), b"efghijkl");
    }

    #[test]
    fn test_overflow_grows_never_drops() {
        let ring = RingBuffer::new(4, 8);
        ring.write(b"abcd").unwrap();
        ring.write(b"efgh").unwrap();
        assert!(ring.capacity() >= 8);
        assert_eq!(ring.read(8), b"abcdefgh");
    }

    #[test]
    fn test_growth_preserves_wrapped_content() {
        let ring = RingBuffer::new(8, 8);
        ring.write(b"abcdef").unwrap();
        ring.read(4);
        ring.write(b"ghi").unwrap(); // wrapped
        ring.write(b"0123456789").unwrap(); // forces growth while wrapped
        assert_eq!(ring.read(64), b"efghi0123456789");
    }

    #[test]
    fn test_hard_ceiling() {
        let ring = RingBuffer::new(4, 2); // ceiling 8
        ring.write(b"abcdefgh").unwrap();
        let err = ring.write(b"x").unwrap_err();
        assert!(matches!(err, DaemonError::RingCapacityExceeded(_)));
        // Prior content intact
        assert_eq!(ring.read(8), b"abcdefgh");
    }

    #[test]
    fn test_finished_is_sticky() {
        let ring = RingBuffer::new(8, 8);
        assert!(!ring.is_finished());
        ring.mark_finished();
        ring.clear();
        assert!(ring.is_finished());
    }

    #[test]
    fn test_size_plus_free_is_capacity() {
        let ring = RingBuffer::new(16, 8);
        ring.write(b"abcdefg").unwrap();
        ring.read(3);
        assert_eq!(ring.available(), 4);
        assert_eq!(ring.capacity(), 16);
    }

    #[tokio::test]
    async fn test_read_wait_returns_none_after_drain() {
        let ring = RingBuffer::new(8, 8);
        ring.write(b"ab").unwrap();
        ring.mark_finished();

        assert_eq!(ring.read_wait(8).await.unwrap(), b"ab");
        assert!(ring.read_wait(8).await.is_none());
    }

    #[tokio::test]
    async fn test_read_wait_wakes_on_write() {
        let ring = Arc::new(RingBuffer::new(8, 8));
        let reader = {
            let ring = Arc::clone(&ring);
            tokio::spawn(async move { ring.read_wait(4).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        ring.write(b"data").unwrap();
        let got = reader.await.unwrap().unwrap();
        assert_eq!(got, b"data");
    }

    #[tokio::test]
    async fn test_read_wait_wakes_on_finish() {
        let ring = Arc::new(RingBuffer::new(8, 8));
        let reader = {
            let ring = Arc::clone(&ring);
            tokio::spawn(async move { ring.read_wait(4).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        ring.mark_finished();
        assert!(reader.await.unwrap().is_none());
    }
}
