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
//! CTCSS (sub-audible tone squelch) detection via a bank of Goertzel
//! filters, one per candidate tone. Every window's worth of audio samples
//! is scored against all standard tones; the target tone is considered
//! present only if it is both the strongest of the bank and above the
//! bank's average power, which rejects broadband noise that happens to
//! tickle the target bin.
//!
//! See <https://www.embedded.com/detecting-ctcss-tones-with-goertzels-algorithm/>.

/// The 51 standard CTCSS tones, Hz.
pub const STANDARD_TONES: [f32; 51] = [
    67.0, 69.3, 71.9, 74.4, 77.0, 79.7, 82.5, 85.4, 88.5, 91.5, 94.8, 97.4, 100.0, 103.5, 107.2,
    110.9, 114.8, 118.8, 123.0, 127.3, 131.8, 136.5, 141.3, 146.2, 150.0, 151.4, 156.7, 159.8,
    162.2, 165.5, 167.9, 171.3, 173.8, 177.3, 179.9, 183.5, 186.2, 189.9, 192.8, 196.6, 199.5,
    203.5, 206.5, 210.7, 218.1, 225.7, 229.1, 233.6, 241.8, 250.3, 254.1,
];

/// A single Goertzel tone detector, run over non-overlapping windows of
/// `window_size` samples. `relative_power()` is only meaningful the sample
/// after a window boundary; it otherwise holds the previous window's value.
#[derive(Debug, Clone)]
struct ToneDetector {
    tone_freq: f32,
    magnitude: f32,
    window_size: usize,
    coeff: f32,
    count: usize,
    q1: f32,
    q2: f32,
}

impl ToneDetector {
    fn new(tone_freq: f32, sample_rate: f32, window_size: usize) -> Self {
        let k = (0.5 + window_size as f32 * tone_freq / sample_rate) as i32;
        let omega = (2.0 * std::f32::consts::PI * k as f32) / window_size as f32;
        let mut d = ToneDetector {
            tone_freq,
            magnitude: 0.0,
            window_size,
            coeff: 2.0 * omega.cos(),
            count: 0,
            q1: 0.0,
            q2: 0.0,
        };
        d.reset();
        d
    }

    fn process_sample(&mut self, sample: f32) {
        let q0 = self.coeff * self.q1 - self.q2 + sample;
        self.q2 = self.q1;
        self.q1 = q0;

        self.count += 1;
        if self.count == self.window_size {
            self.magnitude = self.q1 * self.q1 + self.q2 * self.q2 - self.q1 * self.q2 * self.coeff;
            self.count = 0;
        }
    }

    fn reset(&mut self) {
        self.count = 0;
        self.q1 = 0.0;
        self.q2 = 0.0;
    }

    fn relative_power(&self) -> f32 {
        self.magnitude
    }

    fn freq(&self) -> f32 {
        self.tone_freq
    }

    fn coefficient(&self) -> f32 {
        self.coeff
    }
}

#[derive(Clone, Copy)]
struct PowerIndex {
    power: f32,
    freq: f32,
}

/// A bank of [`ToneDetector`]s sharing a sample stream.
#[derive(Default)]
struct ToneDetectorSet {
    tones: Vec<ToneDetector>,
}

impl ToneDetectorSet {
    /// Adds a detector for `tone_freq`, skipping it (and returning `false`)
    /// if its Goertzel coefficient collides with an existing detector's,
    /// which would make the two indistinguishable.
    fn add(&mut self, tone_freq: f32, sample_rate: f32, window_size: usize) -> bool {
        let candidate = ToneDetector::new(tone_freq, sample_rate, window_size);
        if self.tones.iter().any(|t| t.coefficient() == candidate.coefficient()) {
            log::debug!("skipping CTCSS tone {tone_freq} Hz, too close to another tone");
            return false;
        }
        self.tones.push(candidate);
        true
    }

    fn process_sample(&mut self, sample: f32) {
        for t in &mut self.tones {
            t.process_sample(sample);
        }
    }

    fn reset(&mut self) {
        for t in &mut self.tones {
            t.reset();
        }
    }

    /// Returns the bank's average power and fills `powers` with every
    /// detector's `(power, freq)`, sorted strongest-first.
    fn sorted_powers(&self, powers: &mut Vec<PowerIndex>) -> f32 {
        powers.clear();
        let mut total = 0.0f32;
        for t in &self.tones {
            powers.push(PowerIndex {
                power: t.relative_power(),
                freq: t.freq(),
            });
            total += t.relative_power();
        }
        powers.sort_by(|a, b| b.power.partial_cmp(&a.power).unwrap());
        total / self.tones.len() as f32
    }
}

/// Detects the presence of one target CTCSS tone in a stream of
/// demodulated audio samples, arbitrated against the full standard tone
/// set so that a different, louder sub-audible tone does not register as
/// a false positive.
pub struct Ctcss {
    enabled: bool,
    ctcss_freq: f32,
    window_size: usize,
    found_count: u64,
    not_found_count: u64,

    powers: ToneDetectorSet,

    enough_samples: bool,
    sample_count: usize,
    has_tone: bool,
}

impl Ctcss {
    /// Creates a disabled detector: `has_tone()` always reports `true`
    /// (i.e. "no tone requirement to satisfy"), matching the convention
    /// that channels without a configured CTCSS tone never squelch on it.
    pub fn disabled() -> Self {
        Ctcss {
            enabled: false,
            ctcss_freq: 0.0,
            window_size: 0,
            found_count: 0,
            not_found_count: 0,
            powers: ToneDetectorSet::default(),
            enough_samples: false,
            sample_count: 0,
            has_tone: false,
        }
    }

    /// Creates a detector for `ctcss_freq` Hz, running Goertzel windows of
    /// `window_size` samples at `sample_rate`. Also registers every
    /// standard tone more than 5 Hz away from the target as a competing
    /// detector, so arbitration has a realistic population to compare
    /// against.
    pub fn new(ctcss_freq: f32, sample_rate: f32, window_size: usize) -> Self {
        let mut powers = ToneDetectorSet::default();
        powers.add(ctcss_freq, sample_rate, window_size);
        for &tone in STANDARD_TONES.iter() {
            if (ctcss_freq - tone).abs() < 5.0 {
                continue;
            }
            powers.add(tone, sample_rate, window_size);
        }
        Ctcss {
            enabled: true,
            ctcss_freq,
            window_size,
            found_count: 0,
            not_found_count: 0,
            powers,
            enough_samples: false,
            sample_count: 0,
            has_tone: false,
        }
    }

    /// Feeds one demodulated audio sample through the bank. Every
    /// `window_size`th call re-arbitrates `has_tone()`.
    pub fn process_audio_sample(&mut self, sample: f32) {
        if !self.enabled {
            return;
        }

        self.powers.process_sample(sample);

        self.sample_count += 1;
        if self.sample_count < self.window_size {
            return;
        }

        self.enough_samples = true;

        let mut tone_powers = Vec::new();
        let avg_power = self.powers.sorted_powers(&mut tone_powers);
        if tone_powers[0].freq == self.ctcss_freq && tone_powers[0].power > avg_power {
            self.has_tone = true;
            self.found_count += 1;
        } else {
            self.has_tone = false;
            self.not_found_count += 1;
        }

        self.powers.reset();
        self.sample_count = 0;
    }

    /// Clears all window state. Leaves `found_count`/`not_found_count`
    /// untouched; those are lifetime counters.
    pub fn reset(&mut self) {
        if self.enabled {
            self.powers.reset();
            self.enough_samples = false;
            self.sample_count = 0;
            self.has_tone = false;
        }
    }

    pub fn found_count(&self) -> u64 {
        self.found_count
    }

    pub fn not_found_count(&self) -> u64 {
        self.not_found_count
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn enough_samples(&self) -> bool {
        self.enough_samples
    }

    /// `true` if this detector is disabled, or if it is enabled and its
    /// most recently completed window found the target tone.
    pub fn has_tone(&self) -> bool {
        !self.enabled || self.has_tone
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_wave(freq: f32, sample_rate: f32, n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate).sin())
            .collect()
    }

    #[test]
    fn disabled_detector_always_has_tone() {
        let d = Ctcss::disabled();
        assert!(d.has_tone());
        assert!(!d.is_enabled());
    }

    #[test]
    fn detects_matching_tone_over_noise() {
        let sample_rate = 8000.0;
        let window = 200;
        let mut d = Ctcss::new(100.0, sample_rate, window);
        let signal = sine_wave(100.0, sample_rate, window * 3);
        for s in signal {
            d.process_audio_sample(s);
        }
        assert!(d.enough_samples());
        assert!(d.has_tone());
        assert!(d.found_count() >= 1);
    }

    #[test]
    fn does_not_detect_a_different_tone() {
        let sample_rate = 8000.0;
        let window = 200;
        let mut d = Ctcss::new(100.0, sample_rate, window);
        let signal = sine_wave(150.0, sample_rate, window * 3);
        for s in signal {
            d.process_audio_sample(s);
        }
        assert!(d.enough_samples());
        assert!(!d.has_tone());
        assert!(d.not_found_count() >= 1);
    }

    #[test]
    fn skips_tones_too_close_to_target() {
        let mut set = ToneDetectorSet::default();
        assert!(set.add(100.0, 8000.0, 200));
        // 100.0 Hz again collides with itself (same coefficient)
        assert!(!set.add(100.0, 8000.0, 200));
    }
}
