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
//! Cross-thread handoff signal: a producer thread (demod, mixer) calls
//! `send` once its side of a round is ready; a consumer thread (output)
//! calls `wait` to block until that happens or a timeout elapses, so it
//! can still observe the stop flag between wakeups. Grounded on the
//! reference implementation's `Signal` class (a condition variable plus
//! its own mutex), with a pending flag added so a `send` that arrives
//! just before a `wait` is not lost -- a bare `pthread_cond_wait` with no
//! predicate can miss exactly that signal.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub struct Signal {
    pending: Mutex<bool>,
    condvar: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Signal { pending: Mutex::new(false), condvar: Condvar::new() }
    }

    /// Marks the signal pending and wakes one waiter.
    pub fn send(&self) {
        let mut pending = self.pending.lock().unwrap();
        *pending = true;
        self.condvar.notify_one();
    }

    /// Blocks until `send` has been called since the last `wait`, or
    /// `timeout` elapses. Returns whether it was actually signaled.
    pub fn wait(&self, timeout: Duration) -> bool {
        let pending = self.pending.lock().unwrap();
        let (mut pending, _) = self
            .condvar
            .wait_timeout_while(pending, timeout, |p| !*p)
            .unwrap();
        let was_pending = *pending;
        *pending = false;
        was_pending
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_returns_false_on_timeout_with_no_send() {
        let signal = Signal::new();
        assert!(!signal.wait(Duration::from_millis(20)));
    }

    #[test]
    fn wait_returns_true_once_sent() {
        let signal = Signal::new();
        signal.send();
        assert!(signal.wait(Duration::from_millis(20)));
    }

    #[test]
    fn send_before_wait_is_not_lost() {
        let signal = Arc::new(Signal::new());
        let other = Arc::clone(&signal);
        let handle = thread::spawn(move || {
            other.send();
        });
        handle.join().unwrap();
        // the send above happened-before this wait call; it must still
        // observe it rather than blocking for the full timeout.
        assert!(signal.wait(Duration::from_secs(1)));
    }

    #[test]
    fn consumes_pending_flag_so_a_second_wait_blocks_again() {
        let signal = Signal::new();
        signal.send();
        assert!(signal.wait(Duration::from_millis(20)));
        assert!(!signal.wait(Duration::from_millis(20)));
    }
}
