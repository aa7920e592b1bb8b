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
//! Windowing, FFT, and per-channel bin extraction. Shared by every channel
//! on one device: a single `N`-point FFT is run per sliding step, and each
//! channel just reads the one bin its configured frequency maps to.

use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};

use crate::channel::Channel;
use crate::input::{InputFormat, SampleFormat};
use crate::ringbuffer::RingBuffer;

/// Builds the Blackman-7 window of length `n`, the exact seven-term
/// coefficients used to band-limit each FFT input block.
pub fn blackman7_window(n: usize) -> Vec<f32> {
    const A0: f64 = 0.27105140069342;
    const A1: f64 = 0.43329793923448;
    const A2: f64 = 0.21812299954311;
    const A3: f64 = 0.06592544638803;
    const A4: f64 = 0.01081174209837;
    const A5: f64 = 0.00077658482522;
    const A6: f64 = 0.00001388721735;

    let denom = (n - 1) as f64;
    (0..n)
        .map(|i| {
            let x = A0 - A1 * (2.0 * std::f64::consts::PI * i as f64 / denom).cos()
                + A2 * (4.0 * std::f64::consts::PI * i as f64 / denom).cos()
                - A3 * (6.0 * std::f64::consts::PI * i as f64 / denom).cos()
                + A4 * (8.0 * std::f64::consts::PI * i as f64 / denom).cos()
                - A5 * (10.0 * std::f64::consts::PI * i as f64 / denom).cos()
                + A6 * (12.0 * std::f64::consts::PI * i as f64 / denom).cos();
            x as f32
        })
        .collect()
}

/// Computes the FFT bin a channel frequency maps to, given the device's
/// current center frequency.
///
/// `bin = ceil((f_ch + sr - f_center) / (sr/N) - 1) mod N`
pub fn compute_bin(f_channel_hz: i64, f_center_hz: i64, sample_rate: u32, n: usize) -> usize {
    let sr = sample_rate as f64;
    let bin_width = sr / n as f64;
    let raw = ((f_channel_hz - f_center_hz) as f64 + sr) / bin_width - 1.0;
    let bin = raw.ceil() as i64;
    bin.rem_euclid(n as i64) as usize
}

/// Computes the 24-bit fixed-point derotation step for a channel, already
/// corrected for the rounding of `sample_rate / wave_rate` to an integer
/// (the decimation factor), per the design's derotation-phase note.
pub fn compute_dm_dphi(f_channel_hz: i64, f_center_hz: i64, sample_rate: u32, wave_rate: u32) -> u32 {
    let decimation = (sample_rate as f64 / wave_rate as f64).round();
    let actual_wave_rate = sample_rate as f64 / decimation;
    let correction = actual_wave_rate - wave_rate as f64;
    let delta_hz = (f_channel_hz - f_center_hz) as f64;
    let cycles_per_sample = (delta_hz - correction) / actual_wave_rate;
    crate::math::dphi_to_fixed(cycles_per_sample)
}

fn decode_complex(raw: &[u8], fmt: SampleFormat, fullscale: f32) -> Vec<(f32, f32)> {
    let comp = fmt.component_bytes();
    let n = raw.len() / (2 * comp);
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let base = i * 2 * comp;
        let (re, im) = match fmt {
            SampleFormat::U8 => (
                (raw[base] as f32 - 127.5) / fullscale,
                (raw[base + 1] as f32 - 127.5) / fullscale,
            ),
            SampleFormat::S8 => (
                (raw[base] as i8) as f32 / fullscale,
                (raw[base + 1] as i8) as f32 / fullscale,
            ),
            SampleFormat::S16 => (
                i16::from_le_bytes([raw[base], raw[base + 1]]) as f32 / fullscale,
                i16::from_le_bytes([raw[base + 2], raw[base + 3]]) as f32 / fullscale,
            ),
            SampleFormat::F32 => (
                f32::from_le_bytes([raw[base], raw[base + 1], raw[base + 2], raw[base + 3]]) / fullscale,
                f32::from_le_bytes([raw[base + 4], raw[base + 5], raw[base + 6], raw[base + 7]]) / fullscale,
            ),
        };
        out.push((re, im));
    }
    out
}

/// Shared windowing/FFT front-stage for one device. One instance is
/// created per device at startup and reused across every demod round.
pub struct FftFrontStage {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    n: usize,
    /// Number of FFT windows processed per round (1 on CPU backends).
    fft_batch: usize,
    /// Stride, in complex samples, between successive FFT windows --
    /// `round(sample_rate / WAVE_RATE)`.
    decimation: usize,
    scratch: Vec<Complex<f32>>,
    last_spectrum: Vec<Complex<f32>>,
}

impl FftFrontStage {
    pub fn new(n: usize, fft_batch: usize, decimation: usize) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(n);
        let scratch_len = fft.get_inplace_scratch_len();
        FftFrontStage {
            fft,
            window: blackman7_window(n),
            n,
            fft_batch,
            decimation: decimation.max(1),
            scratch: vec![Complex::new(0.0, 0.0); scratch_len],
            last_spectrum: vec![Complex::new(0.0, 0.0); n],
        }
    }

    pub fn n(&self) -> usize {
        self.n
    }

    /// The full FFT output from the most recently processed window, used
    /// by AFC to search neighboring bins.
    pub fn last_spectrum(&self) -> &[Complex<f32>] {
        &self.last_spectrum
    }

    /// Runs one demod-round's worth of FFT extraction for `channels`, all
    /// belonging to the same device. Returns `false` (a no-op) if the ring
    /// does not yet hold enough input.
    pub fn run_round(&mut self, ring: &RingBuffer, fmt: &InputFormat, channels: &mut [Channel]) -> bool {
        let bps = fmt.sample_format.bytes_per_sample();
        let window_bytes = bps * self.n;
        let stride_bytes = bps * self.decimation;
        let needed = window_bytes + stride_bytes * (self.fft_batch - 1);
        if ring.available() < needed {
            return false;
        }

        for w in 0..self.fft_batch {
            let offset = w * stride_bytes;
            let raw = ring.peek_at(offset, window_bytes);
            let complex = decode_complex(&raw, fmt.sample_format, fmt.fullscale);

            let mut buf: Vec<Complex<f32>> = complex
                .iter()
                .zip(self.window.iter())
                .map(|(&(re, im), &win)| Complex::new(re * win, im * win))
                .collect();
            self.fft.process_with_scratch(&mut buf, &mut self.scratch);
            self.last_spectrum.copy_from_slice(&buf);

            for ch in channels.iter_mut() {
                if ch.waveend >= ch.wavein.len() {
                    continue;
                }
                let bin = ch.bin.min(self.n - 1);
                let sample = buf[bin];
                let mag = (sample.re * sample.re + sample.im * sample.im).sqrt();
                let idx = ch.waveend;
                ch.wavein[idx] = mag;
                if ch.needs_raw_iq {
                    ch.iq_in[idx] = (sample.re, sample.im);
                }
                ch.waveend += 1;
            }
        }

        ring.consume(stride_bytes * self.fft_batch);
        true
    }
}
