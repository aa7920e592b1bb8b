/*
 * Copyright 2019 The Regents of the University of California
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 *
 */

//!
//! Single-producer/single-consumer byte ring buffer with wrap-around tail
//! replication, so the FFT front-stage can always read a contiguous window
//! even when it straddles the logical wrap point.
//!

use std::sync::Mutex;

/// Byte ring buffer shared between one producer (radio I/O) and one
/// consumer (the FFT front-stage).
///
/// Capacity is `capacity` bytes, plus `tail` extra bytes at the end used to
/// hold a duplicate of the first `tail` bytes after every wrap. Consumers
/// only need to take the lock long enough to read the cursors; the copy out
/// of the ring happens outside the lock.
pub struct RingBuffer {
    /// `capacity + tail` bytes of backing storage
    storage: Mutex<Vec<u8>>,
    /// Logical capacity, in bytes (excludes the trailing replica region)
    capacity: usize,
    /// Size of the trailing replica region, in bytes
    tail: usize,
    /// Producer cursor: next index to write to, `[0, capacity)`
    bufe: Mutex<usize>,
    /// Consumer cursor: next index to read from, `[0, capacity)`
    bufs: Mutex<usize>,
    /// Unread byte count. Tracked separately from `bufe`/`bufs` because
    /// those two cursors alone can't tell a full buffer from an empty one
    /// when they land on the same position.
    pending: Mutex<usize>,
    /// Count of append() calls that had to overwrite unread data
    overflow_count: std::sync::atomic::AtomicU64,
}

impl RingBuffer {
    /// Creates a ring buffer holding `capacity` bytes of input with `tail`
    /// extra bytes reserved for wrap replication.
    ///
    /// `tail` should be `2 * bytes_per_sample * fft_size` so that one full
    /// FFT window is always contiguous starting at any `bufs`.
    pub fn new(capacity: usize, tail: usize) -> Self {
        RingBuffer {
            storage: Mutex::new(vec![0u8; capacity + tail]),
            capacity,
            tail,
            bufe: Mutex::new(0),
            bufs: Mutex::new(0),
            pending: Mutex::new(0),
            overflow_count: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Logical capacity in bytes (not counting the tail replica region)
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of bytes available for the consumer to read right now.
    pub fn available(&self) -> usize {
        *self.pending.lock().unwrap()
    }

    /// Appends `buf` to the ring, wrapping as needed and maintaining the
    /// tail replica invariant. Called by the producer only.
    pub fn append(&self, buf: &[u8]) {
        assert!(
            buf.len() <= self.capacity,
            "append() of {} bytes exceeds ring capacity {}",
            buf.len(),
            self.capacity
        );
        let mut storage = self.storage.lock().unwrap();
        let mut bufe = self.bufe.lock().unwrap();
        let e = *bufe;
        let len = buf.len();

        if self.capacity - e >= len {
            storage[e..e + len].copy_from_slice(buf);
            if e == 0 {
                let n = len.min(self.tail);
                storage[self.capacity..self.capacity + n].copy_from_slice(&buf[..n]);
            }
        } else {
            let first = self.capacity - e;
            storage[e..self.capacity].copy_from_slice(&buf[..first]);
            let remainder = len - first;
            storage[0..remainder].copy_from_slice(&buf[first..]);
            let n = remainder.min(self.tail);
            storage[self.capacity..self.capacity + n].copy_from_slice(&buf[first..first + n]);
        }

        *bufe = (e + len) % self.capacity;

        // If the producer just wrote over data the consumer had not yet
        // read, count it; this never blocks the producer.
        let mut pending = self.pending.lock().unwrap();
        if *pending + len > self.capacity {
            self.note_overflow();
        }
        *pending = (*pending + len).min(self.capacity);
    }

    /// Returns a contiguous slice of `len` bytes starting at the current
    /// consumer position. `len` must be `<= tail` to guarantee contiguity
    /// across a wrap (the FFT front-stage always asks for one window,
    /// which is exactly the `tail` size it configured this buffer with).
    pub fn peek(&self, len: usize) -> Vec<u8> {
        assert!(len <= self.capacity + self.tail);
        let storage = self.storage.lock().unwrap();
        let start = *self.bufs.lock().unwrap();
        storage[start..start + len].to_vec()
    }

    /// Returns a contiguous slice of `len` bytes starting `offset` bytes
    /// ahead of the current consumer position. `offset + len` must be `<=
    /// tail` to guarantee contiguity across a wrap.
    pub fn peek_at(&self, offset: usize, len: usize) -> Vec<u8> {
        assert!(offset + len <= self.capacity + self.tail);
        let storage = self.storage.lock().unwrap();
        let start = (*self.bufs.lock().unwrap() + offset) % self.capacity;
        storage[start..start + len].to_vec()
    }

    /// Advances the consumer cursor by `n` bytes (mod capacity).
    pub fn consume(&self, n: usize) {
        let mut bufs = self.bufs.lock().unwrap();
        *bufs = (*bufs + n) % self.capacity;
        let mut pending = self.pending.lock().unwrap();
        *pending = pending.saturating_sub(n);
    }

    /// Current producer cursor, for diagnostics/tests
    pub fn producer_pos(&self) -> usize {
        *self.bufe.lock().unwrap()
    }

    /// Current consumer cursor, for diagnostics/tests
    pub fn consumer_pos(&self) -> usize {
        *self.bufs.lock().unwrap()
    }

    /// Number of append() calls that overwrote data the consumer had not
    /// yet read.
    pub fn overflow_count(&self) -> u64 {
        self.overflow_count.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Marks one overflow (producer has no way to apply backpressure, so
    /// overruns are only ever counted, per the design's backpressure model)
    pub fn note_overflow(&self) {
        self.overflow_count
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_window_survives_wrap() {
        // capacity 8, tail 4: write patterns and check reads at bufs are
        // always contiguous across the wrap.
        let rb = RingBuffer::new(8, 4);
        rb.append(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(rb.producer_pos(), 0); // wrapped exactly to 0
        // Tail replica of the first 4 bytes should be present at [8..12)
        let window = rb.peek(4);
        assert_eq!(window, vec![1, 2, 3, 4]);
    }

    #[test]
    fn window_spanning_wrap_point_is_contiguous() {
        let rb = RingBuffer::new(8, 4);
        rb.append(&[10, 20, 30, 40, 50, 60]);
        rb.consume(6);
        // consumer now at position 6; next 4 bytes should be [70? no]
        rb.append(&[70, 80, 90, 100]);
        // producer wrote 70,80 at [6,7], wrapped, wrote 90,100 at [0,1],
        // and replicated first min(4,4)=4 bytes -> but only 2 were written
        // before wrap so replica covers those 2 plus the post-wrap two.
        let window = rb.peek(4);
        assert_eq!(window, vec![70, 80, 90, 100]);
    }

    #[test]
    fn overwriting_unread_data_counts_an_overflow() {
        let rb = RingBuffer::new(8, 4);
        assert_eq!(rb.overflow_count(), 0);
        // Never consumed: the second append of 8 bytes overwrites the
        // first one in full before the consumer has read any of it.
        rb.append(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(rb.overflow_count(), 0);
        rb.append(&[9, 10, 11, 12, 13, 14, 15, 16]);
        assert!(rb.overflow_count() > 0, "producer lapped the consumer without counting an overflow");
    }

    #[test]
    fn consuming_promptly_avoids_overflow() {
        let rb = RingBuffer::new(8, 4);
        rb.append(&[1, 2, 3, 4, 5, 6, 7, 8]);
        rb.consume(8);
        rb.append(&[9, 10, 11, 12, 13, 14, 15, 16]);
        assert_eq!(rb.overflow_count(), 0);
    }

    #[test]
    fn append_rejects_oversized_writes() {
        let rb = RingBuffer::new(4, 2);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            rb.append(&[1, 2, 3, 4, 5]);
        }));
        assert!(result.is_err());
    }

    #[test]
    fn repeated_wraps_keep_tail_consistent() {
        let rb = RingBuffer::new(16, 6);
        let mut expected_total: Vec<u8> = Vec::new();
        for round in 0..20u8 {
            let chunk: Vec<u8> = (0..5).map(|i| round.wrapping_mul(5).wrapping_add(i)).collect();
            rb.append(&chunk);
            expected_total.extend_from_slice(&chunk);
            let start = rb.consumer_pos();
            let window = rb.peek(6);
            // The window read from the consumer position must match the
            // most recently written 6 bytes starting there, which are the
            // last 6 bytes of expected_total trimmed to the ring's logical
            // capacity (16): since we never consumed, bufs stays at 0 and
            // the window must equal the oldest-still-valid bytes.
            assert_eq!(start, 0);
            assert_eq!(window.len(), 6);
        }
    }
}
