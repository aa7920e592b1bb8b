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
//! Per-channel demodulation: derotation, AM envelope or NFM discriminator,
//! AGC, notch/lowpass filtering, and feeding the squelch and CTCSS
//! detectors. Runs once per channel per demod round, over the batch of
//! samples the FFT front-stage has just produced.

use crate::afc;
use crate::channel::{AxcIndicate, Channel, Modulation, AGC_EXTRA};
use crate::math::{polar_disc_fast, quadri_demod, SinCosLut};

/// NFM post-discriminator de-emphasis coefficient, `exp(-1/(tau*wave_rate))`
/// in the reference; precomputed once and passed in here.
#[derive(Debug, Clone, Copy)]
pub struct DemodParams {
    pub quadri: bool,
    pub deemphasis_alpha: f32,
}

/// Runs one full batch of demodulation for `channel`, given the shared
/// sin/cos lookup table and the just-computed FFT spectrum (used for AFC
/// once the batch completes). Returns nothing; all results land in
/// `channel.waveout`/`iq_out` and `channel.axcindicate`.
pub fn run_batch(channel: &mut Channel, sincos: &SinCosLut, params: &DemodParams, spectrum: &[rustfft::num_complex::Complex<f32>]) {
    let batch = channel.wave_batch();
    let start = AGC_EXTRA;
    let end = AGC_EXTRA + batch;

    let prev_indicate = channel.axcindicate;
    channel.axcindicate = AxcIndicate::NoSignal;

    let modulation = channel.current_frequency().modulation;

    for j in start..end {
        let wavein_j = channel.wavein[j];
        channel.current_frequency_mut().squelch.process_raw_sample(wavein_j);

        if channel.current_frequency_mut().squelch.should_filter_sample() && channel.needs_raw_iq {
            let (mut re, mut im) = channel.iq_in[j];
            // de-rotate by -dm_phi: multiply by conj(e^{i*phi}) = (cos(phi), -sin(phi))
            let (s, c) = sincos.get(channel.dm_phi);
            let nre = re * c + im * s;
            let nim = im * c - re * s;
            re = nre;
            im = nim;
            channel.dm_phi = channel.dm_phi.wrapping_add(channel.dm_dphi) & crate::math::PHASE_MASK;

            channel.current_frequency_mut().lowpass.apply(&mut re, &mut im);

            channel.iq_in[j] = (re, im);
            channel.wavein[j] = (re * re + im * im).sqrt();
            if channel.current_frequency().lowpass.enabled() {
                let filtered = channel.wavein[j];
                channel.current_frequency_mut().squelch.process_filtered_sample(filtered);
            }
        }

        if modulation == Modulation::Am {
            let freq = channel.current_frequency();
            let first_open = freq.squelch.first_open_sample();
            let last_open = freq.squelch.last_open_sample();
            if first_open {
                bootstrap_am_agc(channel, j);
            }
            if last_open {
                fade_out_am_tail(channel, j);
            }
        }

        if channel.current_frequency().squelch.should_process_audio() {
            let audio = match modulation {
                Modulation::Am => demod_am(channel, j),
                Modulation::Nfm => demod_nfm(channel, j, params),
            };
            channel.waveout[j] = audio;
            channel.current_frequency_mut().squelch.process_audio_sample(audio);
        }

        if channel.current_frequency().squelch.is_open() {
            let mut sample = channel.waveout[j];
            channel.current_frequency_mut().notch.apply(&mut sample);
            sample *= channel.current_frequency().ampfactor;
            if sample.is_nan() {
                sample = 0.0;
            }
            sample = sample.clamp(-1.0, 1.0);
            channel.waveout[j] = sample;
            channel.axcindicate = AxcIndicate::Signal;
            if channel.needs_raw_iq {
                channel.iq_out[j] = channel.iq_in[j];
            }
        } else {
            channel.waveout[j] = 0.0;
            if channel.needs_raw_iq {
                channel.iq_out[j] = (0.0, 0.0);
            }
        }
    }

    afc::apply(channel, prev_indicate, spectrum);
}

fn bootstrap_am_agc(channel: &mut Channel, j: usize) {
    let squelch_level = channel.current_frequency_mut().squelch.squelch_level();
    let window = &channel.wavein[j.saturating_sub(AGC_EXTRA)..j];
    let mut sum = 0f32;
    let mut count = 0u32;
    for &s in window {
        if s > squelch_level {
            sum += s;
            count += 1;
        }
    }
    if count > 0 {
        channel.agcavgfast = sum / count as f32;
    }
}

fn fade_out_am_tail(channel: &mut Channel, j: usize) {
    let lo = j.saturating_sub(AGC_EXTRA - 1);
    for k in (lo + 1..j).rev() {
        channel.waveout[k] = channel.waveout[k - 1] * 0.94;
    }
}

fn demod_am(channel: &mut Channel, j: usize) -> f32 {
    let wavein_j = channel.wavein[j];
    let squelch_level = channel.current_frequency_mut().squelch.squelch_level();
    if wavein_j > squelch_level {
        channel.agcavgfast = 0.995 * channel.agcavgfast + 0.005 * wavein_j;
    }
    if channel.agcavgfast <= 0.0 {
        return 0.0;
    }
    let mut out = (wavein_j - channel.agcavgfast) / (1.5 * channel.agcavgfast);
    if out.abs() > 0.8 {
        out *= 0.85;
        channel.agcavgfast *= 1.15;
    }
    out
}

fn demod_nfm(channel: &mut Channel, j: usize, params: &DemodParams) -> f32 {
    let (br, bj) = channel.iq_in[j];
    let (ar, aj) = (channel.nfm.prev_re, channel.nfm.prev_im);

    let mut out = if params.quadri {
        quadri_demod(ar, aj, br, bj)
    } else {
        polar_disc_fast(ar, aj, br, bj)
    };

    channel.nfm.prev_re = br;
    channel.nfm.prev_im = bj;

    channel.agcavgfast = 0.995 * channel.agcavgfast + 0.005 * out;
    out -= channel.agcavgfast;

    out = (1.0 - params.deemphasis_alpha) * out + params.deemphasis_alpha * channel.nfm.prev_waveout;
    channel.nfm.prev_waveout = out;
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::FrequencyEntry;
    use rustfft::num_complex::Complex;

    fn flat_spectrum(n: usize) -> Vec<Complex<f32>> {
        vec![Complex::new(0.01, 0.0); n]
    }

    #[test]
    fn am_batch_with_no_signal_outputs_silence() {
        let freq = FrequencyEntry::new(0, "f", Modulation::Am);
        let mut ch = Channel::new(16, false, freq);
        ch.waveend = ch.wavein.len();
        for v in ch.wavein.iter_mut() {
            *v = 0.001;
        }
        let sincos = SinCosLut::new();
        let params = DemodParams { quadri: false, deemphasis_alpha: 0.0 };
        let spectrum = flat_spectrum(64);
        run_batch(&mut ch, &sincos, &params, &spectrum);
        assert!(ch.waveout[AGC_EXTRA..AGC_EXTRA + 16].iter().all(|&s| s == 0.0));
        assert_eq!(ch.axcindicate, AxcIndicate::NoSignal);
    }

    #[test]
    fn am_batch_with_strong_signal_opens_and_produces_nonzero_audio() {
        let freq = FrequencyEntry::new(0, "f", Modulation::Am);
        let mut ch = Channel::new(250, false, freq);
        let sincos = SinCosLut::new();
        let params = DemodParams { quadri: false, deemphasis_alpha: 0.0 };
        let spectrum = flat_spectrum(64);

        // Two rounds (500 samples) to settle the noise floor, matching the
        // squelch unit tests' own ratio of quiet-to-loud samples needed to
        // clear the 197-sample open delay reliably.
        for _ in 0..2 {
            for v in ch.wavein[AGC_EXTRA..AGC_EXTRA + 250].iter_mut() {
                *v = 0.01;
            }
            run_batch(&mut ch, &sincos, &params, &spectrum);
        }
        for _ in 0..2 {
            for v in ch.wavein[AGC_EXTRA..AGC_EXTRA + 250].iter_mut() {
                *v = 5.0;
            }
            run_batch(&mut ch, &sincos, &params, &spectrum);
        }
        assert_eq!(ch.axcindicate, AxcIndicate::Signal);
    }
}
