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
//! Per-device assembly: one input source, one FFT front-stage, the
//! channels it feeds, and (in SCAN mode) the scan controller retuning it.
//! Exposes the per-round operations a demod/output/scan/reconnect worker
//! calls into; it does not own any threads itself, matching the rest of
//! the core's data-level components.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::channel::{Channel, AGC_EXTRA};
use crate::demod::{self, DemodParams};
use crate::error::Result;
use crate::fft_stage::{self, FftFrontStage};
use crate::input::{InputFormat, InputShared, InputSource, InputState};
use crate::math::SinCosLut;
use crate::output_scheduler;
use crate::ringbuffer::RingBuffer;
use crate::scan::{ScanController, SCAN_DC_OFFSET_BINS};
use crate::tags::TagQueue;

/// Which retuning discipline a device follows.
pub enum Mode {
    /// Fixed center frequency; every channel's bin is computed once at
    /// startup and never moves (AFC aside).
    Multichannel { center_hz: i64 },
    /// Channel 0 cycles through `freqlist` under `scan`'s dwell logic; the
    /// device center frequency itself moves with it.
    Scan { freqlist: Vec<i64>, scan: ScanController },
}

/// Recomputes a channel's base bin and derotation step for `freq_idx` in
/// its frequency list against the device's current center frequency, and
/// points the channel at that entry.
fn retune_channel(channel: &mut Channel, freq_idx: usize, center_hz: i64, sample_rate: u32, wave_rate: u32, fft_size: usize) {
    channel.current_freq_index = freq_idx;
    let freq_hz = channel.frequencies[freq_idx].freq_hz;
    let bin = fft_stage::compute_bin(freq_hz, center_hz, sample_rate, fft_size);
    channel.base_bin = bin;
    channel.bin = bin;
    channel.dm_phi = 0;
    channel.dm_dphi = fft_stage::compute_dm_dphi(freq_hz, center_hz, sample_rate, wave_rate);
}

/// Logs a soft warning when a multichannel frequency sits within 10% of
/// the device's Nyquist edge, per the bin-assignment testable property.
fn warn_if_near_bandwidth_edge(device_name: &str, freq_hz: i64, center_hz: i64, sample_rate: u32) {
    let half_sr = sample_rate as f64 / 2.0;
    let delta = (freq_hz - center_hz).unsigned_abs() as f64;
    if delta >= half_sr * 0.9 {
        log::warn!(
            "device '{device_name}': channel frequency {freq_hz} Hz is within 10% of the \
             device's bandwidth edge (center {center_hz} Hz, sample_rate {sample_rate} Hz)"
        );
    }
}

/// One device: an input source plus the channels it feeds through a
/// shared FFT front-stage.
pub struct Device {
    name: String,
    input: Box<dyn InputSource>,
    shared: Arc<InputShared>,
    fmt: InputFormat,
    wave_rate: u32,
    center_freq_hz: i64,
    fft: FftFrontStage,
    demod_params: DemodParams,
    channels: Vec<Channel>,
    mode: Mode,
    tags: TagQueue,
}

impl Device {
    /// Initializes `input`, validates its reported format against
    /// `wave_rate`, builds the shared FFT front-stage, and assigns every
    /// channel's starting bin/derotation state. `channels` must already
    /// carry whatever outputs and mixer targets they were configured with.
    pub fn new(
        name: impl Into<String>,
        mut input: Box<dyn InputSource>,
        wave_rate: u32,
        fft_size: usize,
        fft_batch: usize,
        demod_params: DemodParams,
        channels: Vec<Channel>,
        mode: Mode,
    ) -> Result<Self> {
        let name = name.into();
        input.init()?;
        let fmt = input.format();
        crate::input::validate(&fmt, wave_rate)?;
        let shared = input.shared();

        let decimation = (fmt.sample_rate as f64 / wave_rate as f64).round().max(1.0) as usize;
        let fft = FftFrontStage::new(fft_size, fft_batch, decimation);

        let center_freq_hz = match &mode {
            Mode::Multichannel { center_hz } => *center_hz,
            Mode::Scan { freqlist, .. } => {
                let bin_width = fmt.sample_rate as i64 / fft_size as i64;
                freqlist[0] + SCAN_DC_OFFSET_BINS * bin_width
            }
        };

        let mut device = Device {
            name,
            input,
            shared,
            fmt,
            wave_rate,
            center_freq_hz,
            fft,
            demod_params,
            channels,
            mode,
            tags: TagQueue::new(),
        };
        device.setup_bins();
        Ok(device)
    }

    fn setup_bins(&mut self) {
        let sample_rate = self.fmt.sample_rate;
        let wave_rate = self.wave_rate;
        let fft_size = self.fft.n();
        let center_hz = self.center_freq_hz;
        let name = self.name.clone();
        match &self.mode {
            Mode::Multichannel { .. } => {
                for ch in self.channels.iter_mut() {
                    let idx = ch.current_freq_index;
                    retune_channel(ch, idx, center_hz, sample_rate, wave_rate, fft_size);
                    warn_if_near_bandwidth_edge(&name, ch.current_frequency().freq_hz, center_hz, sample_rate);
                }
            }
            Mode::Scan { .. } => {
                retune_channel(&mut self.channels[0], 0, center_hz, sample_rate, wave_rate, fft_size);
            }
        }
    }

    /// Starts the input source's producer. Must be called before the first
    /// [`Self::run_round`].
    pub fn start(&mut self) -> Result<()> {
        self.input.start()?;
        if let Mode::Scan { .. } = &self.mode {
            self.input.set_center_freq(self.center_freq_hz as u32)?;
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> InputState {
        self.shared.state()
    }

    pub fn is_failed(&self) -> bool {
        self.shared.state() == InputState::Failed
    }

    /// Whether this device runs a scan controller and so needs its own
    /// dwell-tick thread.
    pub fn is_scan_mode(&self) -> bool {
        matches!(self.mode, Mode::Scan { .. })
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn channels_mut(&mut self) -> &mut [Channel] {
        &mut self.channels
    }

    pub fn ring(&self) -> &RingBuffer {
        &self.shared.ring
    }

    pub fn fft_size(&self) -> usize {
        self.fft.n()
    }

    /// Sum of every channel's output-consumer-overrun counter, for metrics.
    pub fn output_overrun_count(&self) -> u64 {
        self.channels.iter().map(|c| c.output_overrun_count).sum()
    }

    /// Whether any channel finished a demod round and is waiting for the
    /// output side to drain it. The demod thread checks this after
    /// `run_round` to decide whether to wake the output thread.
    pub fn any_waveavail(&self) -> bool {
        self.channels.iter().any(|c| c.waveavail)
    }

    /// Runs one FFT-extraction-plus-demod round. Returns `false` if the
    /// ring did not yet hold enough input (a no-op for this call).
    pub fn run_round(&mut self, sincos: &SinCosLut) -> bool {
        if !self.fft.run_round(&self.shared.ring, &self.fmt, &mut self.channels) {
            return false;
        }

        for ch in self.channels.iter_mut() {
            if ch.waveend >= ch.wave_batch() + AGC_EXTRA {
                demod::run_batch(ch, sincos, &self.demod_params, self.fft.last_spectrum());
                if ch.waveavail {
                    ch.output_overrun_count += 1;
                } else {
                    ch.waveavail = true;
                }
                ch.shift_wavein();
            }
        }
        true
    }

    /// One 200 ms scan-dwell tick; a no-op outside SCAN mode.
    pub fn tick_scan(&mut self) {
        let retune = match &mut self.mode {
            Mode::Scan { freqlist, scan } => {
                let indicate = self.channels[0].axcindicate;
                scan.tick(indicate, freqlist, self.fmt.sample_rate, self.fft.n(), &self.tags)
            }
            Mode::Multichannel { .. } => None,
        };

        if let Some(retune) = retune {
            if let Err(e) = self.input.set_center_freq(retune.center_hz) {
                log::warn!("device '{}' failed to retune to {} Hz: {e}", self.name, retune.center_hz);
            }
            self.center_freq_hz = retune.center_hz as i64;
            let sample_rate = self.fmt.sample_rate;
            let wave_rate = self.wave_rate;
            let fft_size = self.fft.n();
            retune_channel(&mut self.channels[0], retune.freq_idx, self.center_freq_hz, sample_rate, wave_rate, fft_size);
        }
    }

    /// Dispatches every channel with `waveavail` set to its outputs/mixer
    /// targets, applying at most one ready scan tag as metadata.
    pub fn run_output_round(&mut self, shout_metadata_delay: Duration, now: Instant) {
        output_scheduler::run_device_round(&mut self.channels, &self.tags, shout_metadata_delay, now);
    }

    /// One reconnect-watcher tick for every channel's outputs.
    pub fn run_reconnect_tick(&mut self) {
        let failed = self.is_failed();
        for ch in self.channels.iter_mut() {
            output_scheduler::run_reconnect_tick(failed, &mut ch.outputs);
        }
    }

    /// Stops the input source's producer and joins it.
    pub fn stop(&mut self) -> Result<()> {
        self.input.stop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{FrequencyEntry, Modulation};
    use crate::input::synthetic::{SyntheticSource, Tone};

    fn demod_params() -> DemodParams {
        DemodParams { quadri: false, deemphasis_alpha: 0.0 }
    }

    #[test]
    fn multichannel_device_computes_bin_for_its_channel() {
        let src = SyntheticSource::silent("t0", 200_000);
        let freq = FrequencyEntry::new(25_000, "f0", Modulation::Am);
        let ch = Channel::new(250, false, freq);
        let dev = Device::new(
            "dev0",
            Box::new(src),
            8000,
            256,
            1,
            demod_params(),
            vec![ch],
            Mode::Multichannel { center_hz: 0 },
        )
        .unwrap();
        let expected = fft_stage::compute_bin(25_000, 0, 200_000, 256);
        assert_eq!(dev.channels()[0].bin, expected);
    }

    #[test]
    fn run_round_eventually_sets_waveavail() {
        let mut src = SyntheticSource::silent("t1", 200_000);
        src = src.with_tone(Tone { offset_hz: 25_000.0, amplitude: 0.8 }).with_noise(0.01);
        let freq = FrequencyEntry::new(25_000, "f0", Modulation::Am);
        let ch = Channel::new(250, false, freq);
        let mut dev = Device::new(
            "dev1",
            Box::new(src),
            8000,
            256,
            1,
            demod_params(),
            vec![ch],
            Mode::Multichannel { center_hz: 0 },
        )
        .unwrap();
        dev.start().unwrap();
        let sincos = SinCosLut::new();

        let mut became_avail = false;
        for _ in 0..2000 {
            dev.run_round(&sincos);
            if dev.channels()[0].waveavail {
                became_avail = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        dev.stop().unwrap();
        assert!(became_avail, "waveavail never set after many rounds");
    }

    #[test]
    fn scan_mode_retunes_channel_zero_after_dwell() {
        let src = SyntheticSource::silent("t2", 200_000);
        let freq0 = FrequencyEntry::new(100_000, "a", Modulation::Am);
        let mut ch = Channel::new(250, false, freq0);
        ch.frequencies.push(FrequencyEntry::new(200_000, "b", Modulation::Am));
        let freqlist = vec![100_000i64, 200_000i64];
        let mut dev = Device::new(
            "dev2",
            Box::new(src),
            8000,
            256,
            1,
            demod_params(),
            vec![ch],
            Mode::Scan { freqlist, scan: ScanController::new() },
        )
        .unwrap();

        let first_bin = dev.channels()[0].bin;
        for _ in 0..crate::scan::DWELL_TICKS {
            dev.tick_scan();
        }
        assert_eq!(dev.channels()[0].current_freq_index, 1);
        assert_ne!(dev.channels()[0].bin, first_bin);
    }

    #[test]
    fn reconnect_tick_disables_outputs_for_a_failed_device() {
        use crate::output::udp_sink::UdpSink;
        use crate::output::Sink;

        let src = SyntheticSource::silent("t3", 200_000);
        let freq = FrequencyEntry::new(25_000, "f0", Modulation::Am);
        let mut ch = Channel::new(250, false, freq);
        let mut sink = UdpSink::new("u0", "127.0.0.1:9".parse().unwrap());
        sink.setup().unwrap();
        ch.outputs.push(Box::new(sink));

        let mut dev = Device::new(
            "dev3",
            Box::new(src),
            8000,
            256,
            1,
            demod_params(),
            vec![ch],
            Mode::Multichannel { center_hz: 0 },
        )
        .unwrap();
        dev.start().unwrap();
        dev.stop().unwrap(); // SyntheticSource transitions to Stopped, not Failed

        // Drive the shared state directly to exercise the failed path,
        // mirroring what a producer thread hitting a runtime error would do.
        dev.shared.set_state(InputState::Failed);
        assert!(dev.is_failed());
        dev.run_reconnect_tick();
        assert!(!dev.channels()[0].outputs[0].enabled());
    }
}
