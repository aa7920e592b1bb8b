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
//! The input source contract: sample format metadata and producer
//! lifecycle. Concrete drivers (RTL-SDR, SoapySDR, MiriSDR) are external
//! collaborators; this module provides the trait they implement plus a
//! file-replay source and a synthetic signal source used for testing.
//!

pub mod file;
pub mod synthetic;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::{RfError, Result};
use crate::ringbuffer::RingBuffer;

/// Raw sample encoding used by an input source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// Unsigned 8-bit (RTL-SDR native format)
    U8,
    /// Signed 8-bit
    S8,
    /// Signed 16-bit, native endian
    S16,
    /// 32-bit float
    F32,
}

impl SampleFormat {
    /// Size of one I or Q component, in bytes
    pub fn component_bytes(self) -> usize {
        match self {
            SampleFormat::U8 | SampleFormat::S8 => 1,
            SampleFormat::S16 => 2,
            SampleFormat::F32 => 4,
        }
    }

    /// Bytes per complex sample (I + Q)
    pub fn bytes_per_sample(self) -> usize {
        2 * self.component_bytes()
    }
}

/// Lifecycle state of an input source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputState {
    /// Constructed but not yet validated
    Unknown,
    /// `init()` succeeded
    Initialized,
    /// Producer thread is running and calling `append()`
    Running,
    /// Producer hit an unrecoverable error
    Failed,
    /// `stop()` completed cleanly
    Stopped,
    /// Administratively disabled, never started
    Disabled,
}

/// Format/geometry metadata an input source must report before it can be
/// started. Every field is mandatory; validity is checked in [`validate`].
#[derive(Debug, Clone)]
pub struct InputFormat {
    /// Raw sample encoding
    pub sample_format: SampleFormat,
    /// Magnitude of the most positive raw sample value (e.g. 127.0 for u8)
    pub fullscale: f32,
    /// Input sample rate, Hz
    pub sample_rate: u32,
}

/// Validates an [`InputFormat`] against the fixed audio rate, per the data
/// model invariant `sr > WAVE_RATE`.
pub fn validate(fmt: &InputFormat, wave_rate: u32) -> Result<()> {
    if fmt.fullscale <= 0.0 {
        return Err(RfError::Config {
            reason: "input fullscale must be > 0".into(),
        });
    }
    if fmt.sample_rate <= wave_rate {
        return Err(RfError::Config {
            reason: format!(
                "input sample_rate {} must exceed WAVE_RATE {}",
                fmt.sample_rate, wave_rate
            ),
        });
    }
    Ok(())
}

/// Shared, atomically-updated state every input source exposes to the rest
/// of the core regardless of its concrete implementation.
pub struct InputShared {
    state: std::sync::Mutex<InputState>,
    /// Current center frequency, Hz
    center_freq: AtomicU32,
    /// Ring buffer the producer writes into and the FFT front-stage reads;
    /// overflow counting lives on the ring itself (see `RingBuffer::append`),
    /// not duplicated here.
    pub ring: Arc<RingBuffer>,
}

impl InputShared {
    /// Creates the shared state around a freshly allocated ring buffer.
    pub fn new(ring: Arc<RingBuffer>, center_freq: u32) -> Self {
        InputShared {
            state: std::sync::Mutex::new(InputState::Unknown),
            center_freq: AtomicU32::new(center_freq),
            ring,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> InputState {
        *self.state.lock().unwrap()
    }

    /// Sets the lifecycle state
    pub fn set_state(&self, s: InputState) {
        *self.state.lock().unwrap() = s;
    }

    /// Current center frequency, Hz
    pub fn center_freq(&self) -> u32 {
        self.center_freq.load(Ordering::Relaxed)
    }

    /// Updates the center frequency (only meaningful while `Running`)
    pub fn set_center_freq(&self, hz: u32) {
        self.center_freq.store(hz, Ordering::Relaxed);
    }
}

/// The producer-side lifecycle contract every input source implements.
///
/// A source owns its hardware/file handle and a producer task that copies
/// raw bytes into the shared ring buffer via `append()`. `init`/`start`/
/// `set_center_freq`/`stop` are called from the device's owning thread;
/// the producer task itself runs independently once started.
pub trait InputSource: Send {
    /// Opens the device and validates its reported format. Must set state
    /// to `Initialized` on success.
    fn init(&mut self) -> Result<()>;

    /// Spawns (or otherwise starts) the producer. Must transition state to
    /// `Running` before the first `append()`.
    fn start(&mut self) -> Result<()>;

    /// Retunes the front-end. Only valid while `Running`; failure
    /// transitions state to `Failed`.
    fn set_center_freq(&mut self, hz: u32) -> Result<()>;

    /// Signals the producer to exit and joins it.
    fn stop(&mut self) -> Result<()>;

    /// Format/geometry metadata, valid once `init()` has succeeded.
    fn format(&self) -> InputFormat;

    /// Shared state handle (ring buffer, lifecycle state, overflow count)
    fn shared(&self) -> Arc<InputShared>;

    /// Human-readable name, used in logs and metrics
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_low_sample_rate() {
        let fmt = InputFormat {
            sample_format: SampleFormat::U8,
            fullscale: 127.5,
            sample_rate: 8000,
        };
        assert!(validate(&fmt, 8000).is_err());
        assert!(validate(&fmt, 16000).is_err());
    }

    #[test]
    fn accepts_valid_format() {
        let fmt = InputFormat {
            sample_format: SampleFormat::U8,
            fullscale: 127.5,
            sample_rate: 2_000_000,
        };
        assert!(validate(&fmt, 8000).is_ok());
    }

    #[test]
    fn bytes_per_sample_matches_format() {
        assert_eq!(SampleFormat::U8.bytes_per_sample(), 2);
        assert_eq!(SampleFormat::S8.bytes_per_sample(), 2);
        assert_eq!(SampleFormat::S16.bytes_per_sample(), 4);
        assert_eq!(SampleFormat::F32.bytes_per_sample(), 8);
    }
}
