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
//! Scan-mode retune controller: one instance per SCAN-mode device, ticked
//! every [`DWELL`] on channel 0's squelch state. After [`DWELL_TICKS`]
//! consecutive no-signal ticks, advances to the next frequency in the
//! device's list and reports the new center for the caller to apply.

use std::time::{Duration, Instant};

use crate::channel::AxcIndicate;
use crate::tags::{Tag, TagQueue};

/// Sleep interval between scan ticks.
pub const DWELL: Duration = Duration::from_millis(200);

/// Consecutive no-signal ticks before advancing to the next frequency.
pub const DWELL_TICKS: u32 = 10;

/// Bin offset (in FFT bins) channel 0 is placed above DC in SCAN mode, to
/// keep it clear of the DC spike.
pub const SCAN_DC_OFFSET_BINS: i64 = 20;

/// Action the caller must apply: retune the input source and recompute
/// every channel's bin/derotation state for the new center frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retune {
    pub freq_idx: usize,
    pub center_hz: u32,
}

/// Per-device scan state.
pub struct ScanController {
    freq_idx: usize,
    consecutive_squelch_off: u32,
    last_frequency: i64,
    /// Set for the single tick following a retune, so a signal that shows
    /// up immediately afterward can be distinguished from one found deeper
    /// into a dwell.
    just_retuned: bool,
}

impl ScanController {
    /// Creates a controller starting at frequency list index 0.
    pub fn new() -> Self {
        ScanController {
            freq_idx: 0,
            consecutive_squelch_off: 0,
            last_frequency: i64::MIN,
            just_retuned: false,
        }
    }

    pub fn freq_idx(&self) -> usize {
        self.freq_idx
    }

    /// One 200 ms tick, given channel 0's current indicator. Returns a
    /// [`Retune`] exactly on the tick the dwell counter reaches
    /// [`DWELL_TICKS`] with no signal present, and resets the dwell
    /// counter so every frequency in the list gets a full dwell rather
    /// than the scan accelerating once nothing has been found. Enqueues a
    /// tag into `tags` when a signal appears on the tick right after a
    /// frequency change.
    pub fn tick(
        &mut self,
        channel0_indicate: AxcIndicate,
        freqlist: &[i64],
        sample_rate: u32,
        fft_size: usize,
        tags: &TagQueue,
    ) -> Option<Retune> {
        if freqlist.is_empty() {
            return None;
        }

        let was_just_retuned = self.just_retuned;
        self.just_retuned = false;

        if channel0_indicate == AxcIndicate::NoSignal {
            self.consecutive_squelch_off += 1;
            if self.consecutive_squelch_off == DWELL_TICKS {
                self.freq_idx = (self.freq_idx + 1) % freqlist.len();
                let bin_width = sample_rate as i64 / fft_size as i64;
                let center = freqlist[self.freq_idx] + SCAN_DC_OFFSET_BINS * bin_width;
                self.consecutive_squelch_off = 0;
                self.just_retuned = true;
                return Some(Retune {
                    freq_idx: self.freq_idx,
                    center_hz: center as u32,
                });
            }
        } else {
            if was_just_retuned && freqlist[self.freq_idx] != self.last_frequency {
                tags.put(Tag {
                    freq_index: self.freq_idx,
                    became_active_at: Instant::now(),
                });
                self.last_frequency = freqlist[self.freq_idx];
            }
            self.consecutive_squelch_off = 0;
        }

        None
    }
}

impl Default for ScanController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advances_through_freqlist_after_dwell_ticks() {
        let mut ctl = ScanController::new();
        let freqlist = [100_000i64, 200_000, 300_000];
        let tags = TagQueue::new();

        let mut retune = None;
        for _ in 0..DWELL_TICKS {
            retune = ctl.tick(AxcIndicate::NoSignal, &freqlist, 2_000_000, 512, &tags);
        }
        let r = retune.expect("expected a retune on the 10th no-signal tick");
        assert_eq!(r.freq_idx, 1);
        assert_eq!(ctl.freq_idx(), 1);
    }

    #[test]
    fn signal_resets_the_dwell_counter() {
        let mut ctl = ScanController::new();
        let freqlist = [100_000i64, 200_000];
        let tags = TagQueue::new();

        for _ in 0..DWELL_TICKS - 1 {
            assert!(ctl.tick(AxcIndicate::NoSignal, &freqlist, 2_000_000, 512, &tags).is_none());
        }
        assert!(ctl.tick(AxcIndicate::Signal, &freqlist, 2_000_000, 512, &tags).is_none());
        // Counter reset: nine more no-signal ticks should not yet retune.
        for _ in 0..DWELL_TICKS - 1 {
            assert!(ctl.tick(AxcIndicate::NoSignal, &freqlist, 2_000_000, 512, &tags).is_none());
        }
        assert!(ctl.tick(AxcIndicate::NoSignal, &freqlist, 2_000_000, 512, &tags).is_some());
    }

    #[test]
    fn signal_right_after_retune_enqueues_a_tag() {
        let mut ctl = ScanController::new();
        let freqlist = [100_000i64, 200_000];
        let tags = TagQueue::new();

        for _ in 0..DWELL_TICKS {
            ctl.tick(AxcIndicate::NoSignal, &freqlist, 2_000_000, 512, &tags);
        }
        assert_eq!(tags.len(), 0);
        ctl.tick(AxcIndicate::Signal, &freqlist, 2_000_000, 512, &tags);
        assert_eq!(tags.len(), 1);
        assert_eq!(tags.get().unwrap().freq_index, 1);
    }

    #[test]
    fn sweep_wraps_around_to_the_first_frequency() {
        let mut ctl = ScanController::new();
        let freqlist = [100_000i64, 200_000, 300_000];
        let tags = TagQueue::new();

        let mut last = None;
        for _ in 0..(freqlist.len() as u32 * DWELL_TICKS) {
            if let Some(r) = ctl.tick(AxcIndicate::NoSignal, &freqlist, 2_000_000, 512, &tags) {
                last = Some(r);
            }
        }
        assert_eq!(last.unwrap().freq_idx, 0);
    }
}
