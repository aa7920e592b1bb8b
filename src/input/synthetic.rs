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
//! A signal generator used by tests in place of real hardware: produces a
//! u8-format IQ stream that is either pure DC (no signal, for noise-floor
//! tests) or a tone plus noise at a configurable offset from the device's
//! center frequency. Grounded on the reference implementation's signal
//! generator, which synthetic test vectors are built from the same way.
//!

use std::f64::consts::TAU;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{RfError, Result};
use crate::input::{InputFormat, InputShared, InputSource, InputState, SampleFormat};
use crate::ringbuffer::RingBuffer;

/// One tone to mix into the generated stream
#[derive(Debug, Clone, Copy)]
pub struct Tone {
    /// Offset from the device center frequency, Hz (may be negative)
    pub offset_hz: f64,
    /// Amplitude as a fraction of full scale, `(0, 1]`
    pub amplitude: f32,
}

/// Deterministic linear-congruential noise source (no external RNG crate
/// needed for a test-only generator; amplitude-scaled to a fraction of
/// full scale).
struct Lcg(u64);
impl Lcg {
    fn next_f32(&mut self) -> f32 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1);
        ((self.0 >> 33) as f32 / (u32::MAX as f32 / 2.0)) - 1.0
    }
}

/// A synthetic in-memory input source: produces u8-format IQ samples
/// composed of zero or more [`Tone`]s plus optional noise, at a fixed
/// sample rate, for as long as `start()` keeps a background thread running.
pub struct SyntheticSource {
    name: String,
    sample_rate: u32,
    fullscale: f32,
    tones: Vec<Tone>,
    noise_amplitude: f32,
    shared: Option<Arc<InputShared>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SyntheticSource {
    /// Creates a generator with no tones and no noise (pure DC at the
    /// format's zero point) -- useful for noise-floor convergence tests.
    pub fn silent(name: impl Into<String>, sample_rate: u32) -> Self {
        SyntheticSource {
            name: name.into(),
            sample_rate,
            fullscale: 127.5,
            tones: Vec::new(),
            noise_amplitude: 0.0,
            shared: None,
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Adds a tone to the generated stream.
    pub fn with_tone(mut self, tone: Tone) -> Self {
        self.tones.push(tone);
        self
    }

    /// Sets the noise amplitude (fraction of full scale).
    pub fn with_noise(mut self, amplitude: f32) -> Self {
        self.noise_amplitude = amplitude;
        self
    }
}

impl InputSource for SyntheticSource {
    fn init(&mut self) -> Result<()> {
        let fmt = self.format();
        crate::input::validate(&fmt, 0)?; // caller revalidates against real WAVE_RATE
        let ring = Arc::new(RingBuffer::new(1 << 20, 0));
        self.shared = Some(Arc::new(InputShared::new(ring, 0)));
        self.shared.as_ref().unwrap().set_state(InputState::Initialized);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        let shared = self.shared.clone().ok_or_else(|| RfError::InputInit {
            device: self.name.clone(),
            reason: "start() called before init()".into(),
        })?;
        shared.set_state(InputState::Running);

        let sample_rate = self.sample_rate;
        let fullscale = self.fullscale;
        let tones = self.tones.clone();
        let noise_amplitude = self.noise_amplitude;
        let stop = Arc::clone(&self.stop);
        let phase = Arc::new(Mutex::new(0u64));

        let handle = std::thread::Builder::new()
            .name(format!("synsrc-{}", self.name))
            .spawn(move || {
                let mut lcg = Lcg(0x2545F4914F6CDD1D);
                let block = 4096usize;
                let mut buf = vec![0u8; block * 2];
                while !stop.load(Ordering::Relaxed) {
                    let mut ph = phase.lock().unwrap();
                    for i in 0..block {
                        let t = (*ph + i as u64) as f64 / sample_rate as f64;
                        let mut re = 0f32;
                        let mut im = 0f32;
                        for tone in &tones {
                            let theta = TAU * tone.offset_hz * t;
                            re += tone.amplitude * theta.cos() as f32;
                            im += tone.amplitude * theta.sin() as f32;
                        }
                        if noise_amplitude > 0.0 {
                            re += noise_amplitude * lcg.next_f32();
                            im += noise_amplitude * lcg.next_f32();
                        }
                        let iu = ((re.clamp(-1.0, 1.0) * fullscale) + fullscale) as u8;
                        let qu = ((im.clamp(-1.0, 1.0) * fullscale) + fullscale) as u8;
                        buf[2 * i] = iu;
                        buf[2 * i + 1] = qu;
                    }
                    *ph += block as u64;
                    drop(ph);
                    shared.ring.append(&buf);
                    std::thread::sleep(Duration::from_micros(
                        (block as u64 * 1_000_000) / sample_rate as u64,
                    ));
                }
            })
            .expect("failed to spawn synthetic source producer");
        self.handle = Some(handle);
        Ok(())
    }

    fn set_center_freq(&mut self, hz: u32) -> Result<()> {
        match &self.shared {
            Some(shared) if shared.state() == InputState::Running => {
                shared.set_center_freq(hz);
                Ok(())
            }
            _ => Err(RfError::InputRuntime {
                device: self.name.clone(),
                reason: "set_center_freq() while not running".into(),
            }),
        }
    }

    fn stop(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.join().map_err(|_| RfError::InputRuntime {
                device: self.name.clone(),
                reason: "producer thread panicked".into(),
            })?;
        }
        if let Some(shared) = &self.shared {
            shared.set_state(InputState::Stopped);
        }
        Ok(())
    }

    fn format(&self) -> InputFormat {
        InputFormat {
            sample_format: SampleFormat::U8,
            fullscale: self.fullscale,
            sample_rate: self.sample_rate,
        }
    }

    fn shared(&self) -> Arc<InputShared> {
        self.shared.clone().expect("shared() called before init()")
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_source_produces_dc_near_midscale() {
        let mut src = SyntheticSource::silent("test", 200_000);
        src.init().unwrap();
        src.start().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        src.stop().unwrap();
        let shared = src.shared();
        let bytes = shared.ring.peek(8);
        for b in bytes {
            assert!((b as i32 - 127).abs() <= 2);
        }
    }
}
