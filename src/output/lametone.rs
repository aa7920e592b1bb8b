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
//! Marker tones written when appending to an existing audio file: a
//! three-tone "discontinuity" signature (2222, 1111, 555 Hz) bracketing
//! an optional gap of silence, so a listener hears that a chunk of time
//! was skipped rather than a seamless splice. The actual MP3 encoding
//! step is an external collaborator's concern (see the sink trait); this
//! produces little-endian mono `f32` PCM at the caller's audio rate,
//! which a real deployment's encoder consumes the same way it consumes
//! any other channel audio block.

/// One block of generated tone or silence, ready to be written (or
/// handed to an encoder) as raw little-endian `f32` PCM.
pub struct LameTone {
    samples: Vec<f32>,
}

impl LameTone {
    /// Generates `msec` milliseconds of a sine tone at `hz`, or silence
    /// if `hz == 0`, at 0.9 amplitude (matching the reference marker
    /// tone's headroom). `wave_rate` is the channel's output audio rate.
    pub fn new(msec: u32, hz: f32, wave_rate: u32) -> Self {
        let n = (msec as u64 * wave_rate as u64 / 1000) as usize;
        let mut samples = vec![0f32; n];
        if hz > 0.0 {
            let period = 1.0 / hz;
            let sample_time = 1.0 / wave_rate as f32;
            let mut t = 0f32;
            for s in &mut samples {
                *s = 0.9 * (t * 2.0 * std::f32::consts::PI / period).sin();
                t += sample_time;
            }
        }
        LameTone { samples }
    }

    /// Raw little-endian PCM bytes for this block.
    pub fn bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.samples.len() * 4);
        for s in &self.samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }
}

/// Builds the full marker sequence written when reopening a file for
/// append in audio mode: the descending triplet, up to `gap_secs`
/// (capped at 3600) of 1-second silence blocks when `continuous` is set,
/// then the triplet reversed.
pub fn marker_sequence(continuous: bool, gap_secs: u64, wave_rate: u32) -> Vec<u8> {
    let a = LameTone::new(120, 2222.0, wave_rate);
    let b = LameTone::new(120, 1111.0, wave_rate);
    let c = LameTone::new(120, 555.0, wave_rate);

    let mut out = Vec::new();
    out.extend(a.bytes());
    out.extend(b.bytes());
    out.extend(c.bytes());

    if continuous {
        let capped = gap_secs.min(3600);
        let silence = LameTone::new(1000, 0.0, wave_rate);
        for _ in 0..capped.saturating_sub(1) {
            out.extend(silence.bytes());
        }
    }

    out.extend(c.bytes());
    out.extend(b.bytes());
    out.extend(a.bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAVE_RATE: u32 = 8000;

    #[test]
    fn tone_length_matches_duration() {
        let t = LameTone::new(120, 2222.0, WAVE_RATE);
        assert_eq!(t.samples.len(), 120 * WAVE_RATE as usize / 1000);
    }

    #[test]
    fn silence_is_actually_zero() {
        let t = LameTone::new(50, 0.0, WAVE_RATE);
        assert!(t.samples.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn marker_sequence_caps_gap_at_one_hour() {
        let short = marker_sequence(true, 10, WAVE_RATE);
        let capped = marker_sequence(true, 999_999, WAVE_RATE);
        // Both are bounded by the 3600s cap, so the capped run is much
        // larger than the short one but not unbounded.
        assert!(capped.len() > short.len());
        let one_sec_bytes = (WAVE_RATE as usize) * 4;
        let triplet_bytes = (LameTone::new(120, 1.0, WAVE_RATE).bytes().len()) * 3 * 2;
        let max_silence_bytes = 3600 * one_sec_bytes;
        assert!(capped.len() <= triplet_bytes + max_silence_bytes);
    }
}
