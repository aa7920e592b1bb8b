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
//! Per-frequency notch and lowpass filters. The lowpass is a 2nd-order
//! Bessel design derived by placing the Bessel prototype's pole pair
//! (pre-warped for the target cutoff) through the bilinear transform,
//! the textbook recipe for turning an analog s-plane prototype into a
//! discrete-time biquad.

use num_complex::Complex64;

/// A 2nd-order notch (band-reject) filter, direct-form biquad.
#[derive(Debug, Clone)]
pub struct NotchFilter {
    enabled: bool,
    d: [f32; 3],
    x: [f32; 3],
    y: [f32; 3],
}

impl NotchFilter {
    /// Disabled placeholder.
    pub fn disabled() -> Self {
        NotchFilter { enabled: false, d: [0.0; 3], x: [0.0; 3], y: [0.0; 3] }
    }

    /// Designs a notch at `notch_freq` Hz, quality factor `q`. A
    /// non-positive frequency disables the filter.
    pub fn new(notch_freq: f32, sample_freq: f32, q: f32) -> Self {
        if notch_freq <= 0.0 {
            return Self::disabled();
        }
        let wo = 2.0 * std::f32::consts::PI * (notch_freq / sample_freq);
        let e = 1.0 / (1.0 + (wo / (q * 2.0)).tan());
        let p = wo.cos();
        NotchFilter {
            enabled: true,
            d: [e, 2.0 * e * p, 2.0 * e - 1.0],
            x: [0.0; 3],
            y: [0.0; 3],
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Applies the filter in place to one sample.
    pub fn apply(&mut self, value: &mut f32) {
        if !self.enabled {
            return;
        }
        self.x[0] = self.x[1];
        self.x[1] = self.x[2];
        self.x[2] = *value;

        self.y[0] = self.y[1];
        self.y[1] = self.y[2];
        self.y[2] = self.d[0] * self.x[2] - self.d[1] * self.x[1] + self.d[0] * self.x[0]
            + self.d[1] * self.y[1]
            - self.d[2] * self.y[0];

        *value = self.y[2];
    }
}

/// A 2nd-order complex (applied to I and Q jointly) lowpass, used
/// post-derotation to band-limit a channel before AM/NFM demodulation.
#[derive(Debug, Clone)]
pub struct LowpassFilter {
    enabled: bool,
    ycoeffs: [f32; 3],
    gain: f32,
    xv: [(f32, f32); 3],
    yv: [(f32, f32); 3],
}

impl LowpassFilter {
    /// Disabled placeholder.
    pub fn disabled() -> Self {
        LowpassFilter {
            enabled: false,
            ycoeffs: [0.0; 3],
            gain: 1.0,
            xv: [(0.0, 0.0); 3],
            yv: [(0.0, 0.0); 3],
        }
    }

    /// Designs a 2nd-order lowpass Bessel filter at `freq` Hz. A
    /// non-positive frequency disables the filter.
    pub fn new(freq: f32, sample_freq: f32) -> Self {
        if freq <= 0.0 {
            return Self::disabled();
        }

        let raw_alpha = freq as f64 / sample_freq as f64;
        let warped_alpha = (std::f64::consts::PI * raw_alpha).tan() / std::f64::consts::PI;

        let zeros = [Complex64::new(-1.0, 0.0), Complex64::new(-1.0, 0.0)];
        // Bessel 2-pole prototype, matched-pair conjugate poles.
        let proto = Complex64::new(-1.10160133059e+00, 6.36009824757e-01);
        let scale = Complex64::new(std::f64::consts::PI * 2.0 * warped_alpha, 0.0);
        let poles = [blt(scale * proto), blt(scale * proto.conj())];

        let topcoeffs = expand(&zeros);
        let botcoeffs = expand(&poles);
        let gain_complex = eval(&topcoeffs, Complex64::new(1.0, 0.0)) / eval(&botcoeffs, Complex64::new(1.0, 0.0));
        let gain = gain_complex.norm() as f32;

        let mut ycoeffs = [0f32; 3];
        for i in 0..3 {
            ycoeffs[i] = -(botcoeffs[i].re / botcoeffs[2].re) as f32;
        }

        LowpassFilter {
            enabled: true,
            ycoeffs,
            gain,
            xv: [(0.0, 0.0); 3],
            yv: [(0.0, 0.0); 3],
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Applies the filter in place to one complex sample `(r, j)`.
    pub fn apply(&mut self, r: &mut f32, j: &mut f32) {
        if !self.enabled {
            return;
        }
        let input = (*r / self.gain, *j / self.gain);

        self.xv[0] = self.xv[1];
        self.xv[1] = self.xv[2];
        self.xv[2] = input;

        self.yv[0] = self.yv[1];
        self.yv[1] = self.yv[2];
        let (x0r, x0i) = self.xv[0];
        let (x1r, x1i) = self.xv[1];
        let (x2r, x2i) = self.xv[2];
        let (y0r, y0i) = self.yv[0];
        let (y1r, y1i) = self.yv[1];
        let yr = (x0r + x2r) + 2.0 * x1r + self.ycoeffs[0] * y0r + self.ycoeffs[1] * y1r;
        let yi = (x0i + x2i) + 2.0 * x1i + self.ycoeffs[0] * y0i + self.ycoeffs[1] * y1i;
        self.yv[2] = (yr, yi);

        *r = yr;
        *j = yi;
    }
}

/// Bilinear transform of one analog pole/zero.
fn blt(pz: Complex64) -> Complex64 {
    (Complex64::new(2.0, 0.0) + pz) / (Complex64::new(2.0, 0.0) - pz)
}

/// Expands a 2-element pole/zero list into the 3 coefficients of the
/// corresponding monic-in-z^2 polynomial.
fn expand(pz: &[Complex64; 2]) -> [Complex64; 3] {
    let mut coeffs = [Complex64::new(1.0, 0.0), Complex64::new(0.0, 0.0), Complex64::new(0.0, 0.0)];
    for &w in pz {
        multin(w, &mut coeffs);
    }
    coeffs
}

fn multin(w: Complex64, coeffs: &mut [Complex64; 3]) {
    let nw = -w;
    coeffs[2] = nw * coeffs[2] + coeffs[1];
    coeffs[1] = nw * coeffs[1] + coeffs[0];
    coeffs[0] = nw * coeffs[0];
}

fn eval(coeffs: &[Complex64; 3], z: Complex64) -> Complex64 {
    let mut sum = Complex64::new(0.0, 0.0);
    for &c in coeffs.iter().rev() {
        sum = sum * z + c;
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_notch_passes_through() {
        let mut f = NotchFilter::disabled();
        let mut v = 0.5;
        f.apply(&mut v);
        assert_eq!(v, 0.5);
    }

    #[test]
    fn notch_attenuates_target_frequency() {
        let sample_rate = 8000.0;
        let target = 1000.0;
        let mut f = NotchFilter::new(target, sample_rate, 5.0);
        assert!(f.enabled());

        let n = 4000;
        let mut max_amplitude = 0f32;
        for i in 0..n {
            let t = i as f32 / sample_rate;
            let mut sample = (2.0 * std::f32::consts::PI * target * t).sin();
            f.apply(&mut sample);
            if i > n / 2 {
                max_amplitude = max_amplitude.max(sample.abs());
            }
        }
        assert!(max_amplitude < 0.3, "max_amplitude={max_amplitude}");
    }

    #[test]
    fn lowpass_attenuates_above_cutoff() {
        let sample_rate = 48000.0;
        let cutoff = 3000.0;
        let mut lp = LowpassFilter::new(cutoff, sample_rate);
        assert!(lp.enabled());

        let probe = 15000.0;
        let n = 2000;
        let mut max_amplitude = 0f32;
        for i in 0..n {
            let t = i as f32 / sample_rate;
            let mut r = (2.0 * std::f32::consts::PI * probe * t).cos();
            let mut j = (2.0 * std::f32::consts::PI * probe * t).sin();
            lp.apply(&mut r, &mut j);
            if i > n / 2 {
                max_amplitude = max_amplitude.max((r * r + j * j).sqrt());
            }
        }
        assert!(max_amplitude < 0.3, "max_amplitude={max_amplitude}");
    }

    #[test]
    fn lowpass_passes_below_cutoff() {
        let sample_rate = 48000.0;
        let cutoff = 3000.0;
        let mut lp = LowpassFilter::new(cutoff, sample_rate);

        let probe = 200.0;
        let n = 3000;
        let mut max_amplitude = 0f32;
        for i in 0..n {
            let t = i as f32 / sample_rate;
            let mut r = (2.0 * std::f32::consts::PI * probe * t).cos();
            let mut j = (2.0 * std::f32::consts::PI * probe * t).sin();
            lp.apply(&mut r, &mut j);
            if i > n / 2 {
                max_amplitude = max_amplitude.max((r * r + j * j).sqrt());
            }
        }
        assert!(max_amplitude > 0.7, "max_amplitude={max_amplitude}");
    }
}
