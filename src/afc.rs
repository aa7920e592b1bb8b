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
//! Automatic frequency correction: when a channel's indicator transitions
//! from no-signal to signal, walk away from the configured base bin in
//! each direction while nearby bins keep growing, and snap to the
//! strongest one found. Reverts to the base bin once signal is gone.

use rustfft::num_complex::Complex;

use crate::channel::{AxcIndicate, Channel};

fn mag2(c: Complex<f32>) -> f32 {
    c.re * c.re + c.im * c.im
}

/// Walks from `base_bin` in one direction (`+1` or `-1`), returning the
/// furthest bin reached as long as each step's magnitude-squared keeps
/// growing past a threshold that itself grows by 10% per accepted step.
fn walk(spectrum: &[Complex<f32>], base_bin: usize, base_val: f32, direction: i64, aggressiveness: u8) -> usize {
    let n = spectrum.len() as i64;
    let mut current = base_bin as i64;
    let mut current_val = base_val;
    let mut threshold: Option<f32> = None;

    loop {
        let next = (current + direction).rem_euclid(n);
        if next == base_bin as i64 {
            break;
        }
        let val = mag2(spectrum[next as usize]);
        if val <= base_val || val <= current_val {
            break;
        }
        let thr = threshold.unwrap_or((val - base_val) / aggressiveness as f32);
        if val < thr {
            break;
        }
        current = next;
        current_val = val;
        threshold = Some(thr * 1.1);
    }

    current as usize
}

/// Re-evaluates AFC for one channel given the just-completed FFT
/// spectrum and the channel's indicator value from before this demod
/// batch. Mutates `channel.bin` and `channel.axcindicate` in place.
pub fn apply(channel: &mut Channel, prev_indicate: AxcIndicate, spectrum: &[Complex<f32>]) {
    if channel.afc_aggressiveness == 0 || spectrum.is_empty() {
        return;
    }

    let became_signal = prev_indicate == AxcIndicate::NoSignal && channel.axcindicate == AxcIndicate::Signal;
    let became_no_signal = prev_indicate != AxcIndicate::NoSignal && channel.axcindicate == AxcIndicate::NoSignal;

    if became_signal {
        let base_bin = channel.base_bin.min(spectrum.len() - 1);
        let base_val = mag2(spectrum[base_bin]);
        let up = walk(spectrum, base_bin, base_val, 1, channel.afc_aggressiveness);
        let down = walk(spectrum, base_bin, base_val, -1, channel.afc_aggressiveness);

        let up_val = mag2(spectrum[up]);
        let down_val = mag2(spectrum[down]);

        if up == base_bin && down == base_bin {
            return;
        }
        if up_val >= down_val {
            channel.bin = up;
            channel.axcindicate = AxcIndicate::AfcUp;
        } else {
            channel.bin = down;
            channel.axcindicate = AxcIndicate::AfcDown;
        }
    } else if became_no_signal {
        channel.bin = channel.base_bin;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{FrequencyEntry, Modulation};

    fn spectrum_with_peak(n: usize, peak_bin: usize, peak_mag: f32) -> Vec<Complex<f32>> {
        let mut v = vec![Complex::new(0.01f32, 0.0); n];
        v[peak_bin] = Complex::new(peak_mag, 0.0);
        v
    }

    #[test]
    fn disabled_afc_never_moves_bin() {
        let freq = FrequencyEntry::new(0, "f", Modulation::Am);
        let mut ch = Channel::new(8, false, freq);
        ch.base_bin = 10;
        ch.bin = 10;
        ch.afc_aggressiveness = 0;
        ch.axcindicate = AxcIndicate::Signal;
        let spectrum = spectrum_with_peak(64, 12, 5.0);
        apply(&mut ch, AxcIndicate::NoSignal, &spectrum);
        assert_eq!(ch.bin, 10);
    }

    #[test]
    fn afc_snaps_toward_a_nearby_stronger_bin() {
        let freq = FrequencyEntry::new(0, "f", Modulation::Am);
        let mut ch = Channel::new(8, false, freq);
        ch.base_bin = 10;
        ch.bin = 10;
        ch.afc_aggressiveness = 16;
        ch.axcindicate = AxcIndicate::Signal;
        let spectrum = spectrum_with_peak(64, 12, 5.0);
        apply(&mut ch, AxcIndicate::NoSignal, &spectrum);
        assert_eq!(ch.bin, 12);
        assert_eq!(ch.axcindicate, AxcIndicate::AfcUp);
    }

    #[test]
    fn afc_restores_base_bin_on_signal_loss() {
        let freq = FrequencyEntry::new(0, "f", Modulation::Am);
        let mut ch = Channel::new(8, false, freq);
        ch.base_bin = 10;
        ch.bin = 12;
        ch.afc_aggressiveness = 16;
        ch.axcindicate = AxcIndicate::NoSignal;
        let spectrum = spectrum_with_peak(64, 12, 5.0);
        apply(&mut ch, AxcIndicate::Signal, &spectrum);
        assert_eq!(ch.bin, 10);
    }
}
