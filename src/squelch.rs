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
//! Per-channel squelch state machine.
//!
//! Squelch has 5 states: `Open` (has audio), `Closed` (no audio),
//! `Opening` (transitioning closed -> open), `Closing` (transitioning open
//! -> closed), and `LowSignalAbort` (like `Closing` but `is_open()` is
//! false). Squelch is considered "open" when the state is `Open` or
//! `Closing`, and "closed" when the state is `Opening`, `LowSignalAbort`,
//! or `Closed`.
//!
//! The noise floor is tracked with a low-pass filter updated with the
//! current sample or the prior value, whichever is lower, every 16
//! samples (except while squelch is open). Signal level is tracked with
//! two more low-pass filters: one over the pre-filter sample (updated
//! every sample), one over an optional post-filter sample (compared
//! against a delayed pre-filter value, used to confirm the signal
//! actually passed through the channel filter rather than being broadband
//! noise that happened to cross the raw threshold).
//!
//! The squelch level is either set manually or computed as a multiple of
//! the noise floor. When the signal level crosses the squelch level the
//! state transitions to `Opening`/`Closing` and a delay counter starts;
//! once the counter elapses the state moves to `Open`/`Closed` depending
//! on whether signal is still present. While `Open`, a run of samples
//! below the squelch level triggers `LowSignalAbort`, closing squelch
//! promptly after a sharp signal drop rather than waiting out the normal
//! close delay.
//!
//! A count of recent opens is used to detect flapping (rapid open/close
//! cycling); when flapping is detected the squelch level is lowered to
//! try to hold it open longer.
//!
//! CTCSS, when enabled, keeps squelch `Closed` until a sub-audible tone is
//! confirmed: a "fast" detector with a short window arbitrates until the
//! "slow", more accurate detector has accumulated enough samples.

use crate::ctcss::Ctcss;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Opening,
    Closing,
    LowSignalAbort,
    Open,
}

#[derive(Debug, Clone, Copy)]
struct MovingAverage {
    full: f32,
    capped: f32,
}

/// Size of the pre-filter delay buffer. Specific to the channel filter's
/// group delay at this sample rate; `open_delay` must exceed it so the
/// buffer fully fills before a post-filter comparison is made.
const BUFFER_SIZE: usize = 102;

/// Decay factor for the noise floor low-pass filter.
const NOISE_DECAY: f32 = 0.97;
/// Decay factor for the pre/post-filter moving averages.
const AVG_DECAY: f32 = 0.99;

/// Number of samples counted as "recent" for flap detection.
const RECENT_SAMPLE_SIZE: usize = 1000;
/// Number of opens within the recent window that counts as flapping.
const FLAP_OPENS_THRESHOLD: usize = 3;

/// Per-channel squelch, driven by three sample streams per audio tick:
/// the raw (pre-filter) sample, the filtered sample, and (once open) the
/// demodulated audio sample for CTCSS arbitration.
pub struct Squelch {
    noise_floor: f32,
    using_manual_level: bool,
    manual_signal_level: f32,
    normal_signal_ratio: f32,
    flappy_signal_ratio: f32,

    moving_avg_cap: f32,
    pre_filter: MovingAverage,
    post_filter: MovingAverage,

    squelch_level: f32,

    using_post_filter: bool,
    pre_vs_post_factor: f32,

    open_delay: i32,
    close_delay: i32,
    low_signal_abort: i32,

    next_state: State,
    current_state: State,

    delay: i32,
    open_count: u64,
    sample_count: u64,
    flappy_count: u64,
    low_signal_count: i32,

    recent_open_count: usize,
    closed_sample_count: usize,

    buffer_head: usize,
    buffer_tail: usize,
    buffer: [f32; BUFFER_SIZE],

    ctcss_fast: Ctcss,
    ctcss_slow: Ctcss,
}

impl Default for Squelch {
    fn default() -> Self {
        Self::new()
    }
}

impl Squelch {
    /// Creates a squelch with the reference defaults: 9.54 dB SNR
    /// threshold, no manual level, no CTCSS.
    pub fn new() -> Self {
        let mut s = Squelch {
            noise_floor: 5.0,
            using_manual_level: false,
            manual_signal_level: -1.0,
            normal_signal_ratio: 0.0,
            flappy_signal_ratio: 0.0,

            moving_avg_cap: 0.0,
            pre_filter: MovingAverage { full: 0.001, capped: 0.001 },
            post_filter: MovingAverage { full: 0.001, capped: 0.001 },

            squelch_level: 0.0,

            using_post_filter: false,
            pre_vs_post_factor: 0.9,

            open_delay: 197,
            close_delay: 197,
            low_signal_abort: 88,

            next_state: State::Closed,
            current_state: State::Closed,

            delay: 0,
            open_count: 0,
            sample_count: 0,
            flappy_count: 0,
            low_signal_count: 0,

            recent_open_count: 0,
            closed_sample_count: 0,

            buffer_head: 0,
            buffer_tail: 1,
            buffer: [0.0; BUFFER_SIZE],

            ctcss_fast: Ctcss::disabled(),
            ctcss_slow: Ctcss::disabled(),
        };
        debug_assert!(s.open_delay as usize > BUFFER_SIZE);
        s.set_squelch_snr_threshold(9.54);
        s
    }

    /// Sets a manual squelch level; `level <= 0` switches back to
    /// automatic (noise-floor-relative) mode.
    pub fn set_squelch_level_threshold(&mut self, level: f32) {
        if level > 0.0 {
            self.using_manual_level = true;
            self.manual_signal_level = level;
        } else {
            self.using_manual_level = false;
        }
        self.calculate_moving_avg_cap();
    }

    /// Sets the automatic squelch threshold as a signal-to-noise ratio in
    /// dB, converting to a linear ratio.
    pub fn set_squelch_snr_threshold(&mut self, db: f32) {
        self.using_manual_level = false;
        self.normal_signal_ratio = 10f32.powf(db / 20.0);
        self.flappy_signal_ratio = self.normal_signal_ratio * 0.9;
        self.calculate_moving_avg_cap();
    }

    /// Enables CTCSS and creates the fast/slow detector pair: 0.05 s is
    /// enough to tell tones ~20 Hz apart; 0.4 s is needed to distinguish
    /// every standard tone.
    pub fn set_ctcss_freq(&mut self, ctcss_freq: f32, sample_rate: f32) {
        self.ctcss_fast = Ctcss::new(ctcss_freq, sample_rate, (sample_rate * 0.05) as usize);
        self.ctcss_slow = Ctcss::new(ctcss_freq, sample_rate, (sample_rate * 0.4) as usize);
    }

    /// Whether squelch currently passes audio: true while `Open` or
    /// `Closing`, further gated by CTCSS (if enabled) on whichever of the
    /// fast/slow detectors has enough samples.
    pub fn is_open(&self) -> bool {
        if self.current_state == State::Open || self.current_state == State::Closing {
            if self.ctcss_slow.is_enabled() {
                if self.ctcss_slow.enough_samples() {
                    return self.ctcss_slow.has_tone();
                }
                return self.ctcss_fast.has_tone();
            }
            return true;
        }
        false
    }

    /// Whether the channel filter should even bother running on the
    /// current sample.
    pub fn should_filter_sample(&mut self) -> bool {
        (self.has_pre_filter_signal() || self.current_state != State::Closed)
            && self.current_state != State::LowSignalAbort
    }

    /// Whether the demodulator should treat the current sample as real
    /// audio output.
    pub fn should_process_audio(&self) -> bool {
        self.current_state == State::Open || self.current_state == State::Closing
    }

    /// True on the single sample where the state becomes `Open`.
    pub fn first_open_sample(&self) -> bool {
        self.current_state != State::Open && self.next_state == State::Open
    }

    /// True on the single sample where open audio output ends.
    pub fn last_open_sample(&self) -> bool {
        (self.current_state == State::Closing && self.next_state == State::Closed)
            || (self.current_state != State::LowSignalAbort && self.next_state == State::LowSignalAbort)
    }

    /// True if the pre-filter sample shows signal but the post-filter
    /// sample does not, i.e. the apparent signal is outside the channel
    /// passband.
    pub fn signal_outside_filter(&mut self) -> bool {
        self.using_post_filter && self.has_pre_filter_signal() && !self.has_post_filter_signal()
    }

    pub fn noise_level(&self) -> f32 {
        self.noise_floor
    }

    pub fn signal_level(&self) -> f32 {
        self.pre_filter.full
    }

    /// The current squelch level, computed lazily: recomputed whenever
    /// the noise floor or flap state invalidates the cached value (signaled
    /// by setting it to exactly `0.0`).
    pub fn squelch_level(&mut self) -> f32 {
        if self.using_manual_level {
            return self.manual_signal_level;
        }
        if self.squelch_level == 0.0 {
            self.squelch_level = if self.currently_flapping() && self.flappy_signal_ratio < self.normal_signal_ratio {
                self.flappy_signal_ratio * self.noise_floor
            } else {
                self.normal_signal_ratio * self.noise_floor
            };
        }
        self.squelch_level
    }

    /// Read-only view of the squelch level last computed by
    /// [`Self::squelch_level`] (every `process_raw_sample` call
    /// recomputes it, so this is never more than one tick stale). Used by
    /// metrics, which must not take a `&mut` borrow of live channel state.
    pub fn squelch_level_value(&self) -> f32 {
        if self.using_manual_level {
            self.manual_signal_level
        } else {
            self.squelch_level
        }
    }

    pub fn open_count(&self) -> u64 {
        self.open_count
    }

    pub fn flappy_count(&self) -> u64 {
        self.flappy_count
    }

    pub fn ctcss_count(&self) -> u64 {
        self.ctcss_slow.found_count()
    }

    pub fn no_ctcss_count(&self) -> u64 {
        self.ctcss_slow.not_found_count()
    }

    /// Feeds one raw (pre-filter) sample. Must be called once per audio
    /// tick before [`Self::process_filtered_sample`] and
    /// [`Self::process_audio_sample`].
    pub fn process_raw_sample(&mut self, sample: f32) {
        self.update_current_state();

        self.sample_count += 1;

        // Every 16 samples instead of every sample lets a gradual signal
        // increase cross the (noise-floor-relative) squelch threshold
        // sooner. Still updating while squelch is open lets a long
        // transmission slowly raise the floor, which can cause flapping
        // but keeps a sustained noise rise from locking squelch open.
        if self.sample_count % 16 == 0 {
            self.calculate_noise_floor();
        }

        Self::update_moving_avg(&mut self.pre_filter, sample, self.moving_avg_cap);

        self.buffer[self.buffer_head] = self.pre_filter.capped * self.pre_vs_post_factor;

        if self.current_state == State::Open && !self.has_signal() {
            self.set_state(State::Closing);
        }

        if self.current_state == State::Closed && self.has_signal() {
            self.set_state(State::Opening);
        }

        // Overrides the delayed close: repeated samples under the
        // squelch level close squelch immediately, though it may
        // reopen right away if the signal level hasn't caught up.
        if self.current_state != State::Closed && self.current_state != State::LowSignalAbort {
            if sample >= self.squelch_level() {
                self.low_signal_count = 0;
            } else {
                self.low_signal_count += 1;
                if self.low_signal_count >= self.low_signal_abort {
                    self.set_state(State::LowSignalAbort);
                }
            }
        }
    }

    /// Feeds one channel-filtered sample, following the matching
    /// `process_raw_sample` call for the same audio tick.
    pub fn process_filtered_sample(&mut self, sample: f32) {
        if !self.should_filter_sample() {
            return;
        }

        if self.current_state == State::Opening {
            // Wait for the pre-filter value to propagate through the
            // delay buffer before seeding the post-filter average.
            if self.delay < BUFFER_SIZE as i32 {
                return;
            }
            if self.delay == BUFFER_SIZE as i32 {
                let seed = self.buffer[self.buffer_tail];
                self.post_filter = MovingAverage { full: seed, capped: seed };
            }
        }

        self.using_post_filter = true;
        Self::update_moving_avg(&mut self.post_filter, sample, self.moving_avg_cap);

        if self.post_filter.capped < self.buffer[self.buffer_tail] {
            self.set_state(State::Closed);
        }
    }

    /// Feeds one demodulated audio sample to the CTCSS detectors, when
    /// enabled and squelch is not `Closed`.
    pub fn process_audio_sample(&mut self, sample: f32) {
        if !self.ctcss_slow.is_enabled() {
            return;
        }

        if self.current_state != State::Closed {
            self.ctcss_slow.process_audio_sample(sample);
            if !self.ctcss_slow.enough_samples() {
                self.ctcss_fast.process_audio_sample(sample);
            }
        }
    }

    fn set_state(&mut self, mut update: State) {
        // Fix up transitions the state machine does not allow directly.
        if self.current_state == State::Closed && update == State::Closing {
            update = State::Closed;
        } else if self.current_state == State::Closed && update == State::LowSignalAbort {
            update = State::Closed;
        } else if self.current_state == State::Closed && update == State::Open {
            update = State::Opening;
        } else if self.current_state == State::Opening && update == State::LowSignalAbort {
            update = State::Closed;
        } else if self.current_state == State::LowSignalAbort
            && update != State::LowSignalAbort
            && update != State::Closed
        {
            update = State::Closed;
        } else if self.current_state == State::Open && update == State::Closed {
            update = State::Closing;
        } else if self.current_state == State::Open && update == State::Opening {
            update = State::Open;
        }

        self.next_state = update;
    }

    fn update_current_state(&mut self) {
        match self.next_state {
            State::Opening => {
                if self.current_state != State::Opening {
                    self.delay = 0;
                    self.low_signal_count = 0;
                    self.using_post_filter = false;
                    self.current_state = self.next_state;
                } else {
                    self.delay += 1;
                    if self.delay >= self.open_delay {
                        // Counts as an "open" for flap detection even if
                        // signal has since dropped -- process_filtered_sample
                        // would already have forced CLOSED if the
                        // post-filter level was too low, so that case
                        // does not reach here.
                        if self.closed_sample_count < RECENT_SAMPLE_SIZE {
                            self.recent_open_count += 1;
                            if self.currently_flapping() {
                                self.flappy_count += 1;
                            }
                            self.squelch_level = 0.0;
                        }

                        self.next_state = if self.has_signal() { State::Open } else { State::Closed };
                    }
                }
            }
            State::Closing => {
                if self.current_state != State::Closing {
                    self.delay = 0;
                    self.current_state = self.next_state;
                } else {
                    self.delay += 1;
                    if self.delay >= self.close_delay {
                        if !self.has_signal() {
                            self.next_state = State::Closed;
                        } else {
                            // Set current_state directly to avoid
                            // double-counting open_count.
                            self.current_state = State::Open;
                            self.next_state = State::Open;
                        }
                    }
                }
            }
            State::LowSignalAbort => {
                if self.current_state != State::LowSignalAbort {
                    if self.current_state != State::Closing {
                        self.delay = 0;
                    }
                    self.current_state = self.next_state;
                } else {
                    self.delay += 1;
                    if self.delay >= self.close_delay {
                        self.next_state = State::Closed;
                    }
                }
            }
            State::Open if self.current_state != State::Open => {
                self.open_count += 1;
                self.current_state = self.next_state;
            }
            State::Closed if self.current_state != State::Closed => {
                self.using_post_filter = false;
                self.closed_sample_count = 0;
                self.current_state = self.next_state;
                self.ctcss_fast.reset();
                self.ctcss_slow.reset();
            }
            State::Closed => {
                // current_state == Closed too: count towards flap
                // detection, capped at RECENT_SAMPLE_SIZE.
                if self.closed_sample_count < RECENT_SAMPLE_SIZE {
                    self.closed_sample_count += 1;
                } else if self.closed_sample_count == RECENT_SAMPLE_SIZE {
                    self.recent_open_count = 0;
                    self.squelch_level = 0.0;
                }
            }
            _ => {
                self.current_state = self.next_state;
            }
        }

        self.buffer_tail = (self.buffer_tail + 1) % BUFFER_SIZE;
        self.buffer_head = (self.buffer_head + 1) % BUFFER_SIZE;
    }

    fn has_pre_filter_signal(&mut self) -> bool {
        self.pre_filter.capped >= self.squelch_level()
    }

    fn has_post_filter_signal(&self) -> bool {
        self.using_post_filter && self.post_filter.capped >= self.buffer[self.buffer_tail]
    }

    fn has_signal(&mut self) -> bool {
        if self.using_post_filter {
            self.has_pre_filter_signal() && self.has_post_filter_signal()
        } else {
            self.has_pre_filter_signal()
        }
    }

    fn calculate_noise_floor(&mut self) {
        const NEW_FACTOR: f32 = 1.0 - NOISE_DECAY;
        self.noise_floor =
            self.noise_floor * NOISE_DECAY + self.pre_filter.capped.min(self.noise_floor) * NEW_FACTOR + 1e-6;
        self.calculate_moving_avg_cap();
        self.squelch_level = 0.0;
    }

    fn calculate_moving_avg_cap(&mut self) {
        self.moving_avg_cap = if self.using_manual_level {
            1.5 * self.manual_signal_level
        } else {
            1.5 * self.normal_signal_ratio * self.noise_floor
        };
    }

    fn update_moving_avg(avg: &mut MovingAverage, sample: f32, cap: f32) {
        const NEW_FACTOR: f32 = 1.0 - AVG_DECAY;
        avg.full = avg.full * AVG_DECAY + sample * NEW_FACTOR;
        if avg.capped >= cap && sample >= cap {
            avg.capped = cap;
        } else {
            avg.capped = cap.min(avg.capped * AVG_DECAY + sample * NEW_FACTOR);
        }
    }

    fn currently_flapping(&self) -> bool {
        self.recent_open_count >= FLAP_OPENS_THRESHOLD
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_closed() {
        let s = Squelch::new();
        assert!(!s.is_open());
    }

    #[test]
    fn opens_on_sustained_strong_signal() {
        let mut s = Squelch::new();
        // Drive the noise floor down first with quiet samples.
        for _ in 0..500 {
            s.process_raw_sample(0.01);
            s.process_filtered_sample(0.01);
        }
        assert!(!s.is_open());

        // Strong signal for long enough to clear the open delay.
        for _ in 0..400 {
            s.process_raw_sample(5.0);
            s.process_filtered_sample(5.0);
        }
        assert!(s.is_open());
        assert_eq!(s.open_count(), 1);
    }

    #[test]
    fn closes_after_signal_drops() {
        let mut s = Squelch::new();
        for _ in 0..500 {
            s.process_raw_sample(0.01);
            s.process_filtered_sample(0.01);
        }
        for _ in 0..400 {
            s.process_raw_sample(5.0);
            s.process_filtered_sample(5.0);
        }
        assert!(s.is_open());

        for _ in 0..500 {
            s.process_raw_sample(0.01);
            s.process_filtered_sample(0.01);
        }
        assert!(!s.is_open());
    }

    #[test]
    fn low_signal_abort_closes_promptly_from_open() {
        let mut s = Squelch::new();
        for _ in 0..500 {
            s.process_raw_sample(0.01);
            s.process_filtered_sample(0.01);
        }
        for _ in 0..400 {
            s.process_raw_sample(5.0);
            s.process_filtered_sample(5.0);
        }
        assert!(s.is_open());

        // A hard drop to below squelch for low_signal_abort samples in a
        // row should close without waiting out the full close_delay.
        for _ in 0..90 {
            s.process_raw_sample(0.0);
            s.process_filtered_sample(0.0);
        }
        assert!(!s.is_open());
    }

    #[test]
    fn manual_level_overrides_snr_threshold() {
        let mut s = Squelch::new();
        s.set_squelch_level_threshold(2.0);
        assert_eq!(s.squelch_level(), 2.0);
        s.set_squelch_level_threshold(-1.0);
        assert_ne!(s.squelch_level(), 2.0);
    }

    #[test]
    fn ctcss_disabled_never_blocks_open() {
        let mut s = Squelch::new();
        for _ in 0..500 {
            s.process_raw_sample(0.01);
            s.process_filtered_sample(0.01);
        }
        for _ in 0..400 {
            s.process_raw_sample(5.0);
            s.process_filtered_sample(5.0);
        }
        assert!(s.is_open());
    }
}
