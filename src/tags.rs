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
//! Delayed frequency-change announcements for scan metadata: a fixed-size
//! ring of `(freq_index, timestamp)` entries, so an Icecast-style output
//! can apply a scan tag only after `shout_metadata_delay` has elapsed.
//!

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

/// Capacity of the tag ring, per the data model.
pub const TAG_QUEUE_CAPACITY: usize = 16;

/// One pending scan-frequency announcement.
#[derive(Debug, Clone, Copy)]
pub struct Tag {
    /// Index into the device's frequency list
    pub freq_index: usize,
    /// Wall-clock time the frequency became active
    pub became_active_at: Instant,
}

/// Fixed-size ring of pending tags, shared between the scan controller
/// (producer) and the output scheduler (consumer).
pub struct TagQueue {
    inner: Mutex<VecDeque<Tag>>,
}

impl TagQueue {
    /// Creates an empty tag queue.
    pub fn new() -> Self {
        TagQueue {
            inner: Mutex::new(VecDeque::with_capacity(TAG_QUEUE_CAPACITY)),
        }
    }

    /// Enqueues a tag, dropping the oldest entry (with a warning) if the
    /// queue is already at capacity.
    pub fn put(&self, tag: Tag) {
        let mut q = self.inner.lock().unwrap();
        if q.len() == TAG_QUEUE_CAPACITY {
            log::warn!("tag queue full, dropping oldest pending scan tag");
            q.pop_front();
        }
        q.push_back(tag);
    }

    /// Peeks the oldest entry without removing it.
    pub fn get(&self) -> Option<Tag> {
        self.inner.lock().unwrap().front().copied()
    }

    /// Removes the oldest entry.
    pub fn advance(&self) {
        self.inner.lock().unwrap().pop_front();
    }

    /// Removes and returns the oldest entry whose delay has elapsed
    /// (`became_active_at + delay <= now`), or `None` if there isn't one
    /// yet. Used by the output scheduler each wakeup.
    pub fn pop_ready(&self, delay: std::time::Duration, now: Instant) -> Option<Tag> {
        let mut q = self.inner.lock().unwrap();
        match q.front() {
            Some(tag) if tag.became_active_at + delay <= now => q.pop_front(),
            _ => None,
        }
    }

    /// Number of pending tags, for tests/metrics.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

impl Default for TagQueue {
    fn default() -> Self {
        Self::new()
    }
}
