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
//! Per-channel DSP state: the windowed envelope/IQ buffers the FFT
//! front-stage writes into, the frequency list a channel can be retuned
//! across, and the output descriptors the demodulator's results are
//! eventually handed to.

use std::sync::Arc;

use crate::ctcss::Ctcss;
use crate::filters::{LowpassFilter, NotchFilter};
use crate::mixer::MixerInput;
use crate::output::Sink;
use crate::squelch::Squelch;

/// Trailing samples kept between demod rounds for AGC bootstrap/fade-out.
pub const AGC_EXTRA: usize = 100;

/// Demodulation scheme for one frequency entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modulation {
    Am,
    Nfm,
}

/// Handshake value read by the mixer's output stage to decide whether a
/// channel's wave buffer is safe to drain this round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixerHandshake {
    Dirty,
    Working,
    Ready,
}

/// Observable summary of a channel's current activity, surfaced to
/// metrics/TUI and used by AFC to detect signal transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxcIndicate {
    NoSignal,
    Signal,
    AfcUp,
    AfcDown,
}

/// One retunable frequency a channel can be pointed at: its own squelch,
/// filters, CTCSS detector and bookkeeping, independent of any other
/// frequency entry on the same channel.
pub struct FrequencyEntry {
    pub freq_hz: i64,
    pub label: String,
    pub modulation: Modulation,
    pub ampfactor: f32,
    pub squelch: Squelch,
    pub notch: NotchFilter,
    pub lowpass: LowpassFilter,
    pub highpass_hz: Option<f32>,
    /// Number of output rounds this entry has produced active (squelch
    /// open) audio for; incremented by the output scheduler.
    pub active_counter: u64,
}

impl FrequencyEntry {
    pub fn new(freq_hz: i64, label: impl Into<String>, modulation: Modulation) -> Self {
        FrequencyEntry {
            freq_hz,
            label: label.into(),
            modulation,
            ampfactor: 1.0,
            squelch: Squelch::new(),
            notch: NotchFilter::disabled(),
            lowpass: LowpassFilter::disabled(),
            highpass_hz: None,
            active_counter: 0,
        }
    }

    pub fn with_ctcss(mut self, ctcss_freq: f32, wave_rate: f32) -> Self {
        self.squelch.set_ctcss_freq(ctcss_freq, wave_rate);
        self
    }
}

/// Per-channel NFM discriminator state: the previous complex sample and
/// previous de-emphasized output, both needed to compute the next sample.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct NfmState {
    pub prev_re: f32,
    pub prev_im: f32,
    pub prev_waveout: f32,
}

/// All per-channel DSP state: buffers the FFT front-stage writes
/// envelope/IQ samples into, the demodulator's working state, and the
/// list of frequencies this channel can be retuned across.
pub struct Channel {
    pub needs_raw_iq: bool,
    pub state: MixerHandshake,
    pub axcindicate: AxcIndicate,

    pub frequencies: Vec<FrequencyEntry>,
    pub current_freq_index: usize,

    /// Bin assigned at configuration time for the current center frequency.
    pub base_bin: usize,
    /// Bin currently in effect; may be walked away from `base_bin` by AFC.
    pub bin: usize,

    /// 24-bit fixed-point derotation phase accumulator.
    pub dm_phi: u32,
    /// 24-bit fixed-point derotation phase step.
    pub dm_dphi: u32,
    /// AFC aggressiveness, 0 (disabled) to 255.
    pub afc_aggressiveness: u8,

    /// Envelope magnitudes, length `2*wave_batch + AGC_EXTRA`.
    pub wavein: Vec<f32>,
    /// Demodulated audio output, length `wave_batch + AGC_EXTRA`.
    pub waveout: Vec<f32>,
    /// Second channel of output audio, for stereo-capable outputs.
    pub waveout_right: Option<Vec<f32>>,
    /// Raw complex samples matching `wavein`'s indices, present iff
    /// `needs_raw_iq`.
    pub iq_in: Vec<(f32, f32)>,
    /// Cleaned complex samples for raw-IQ sinks, present iff `needs_raw_iq`.
    pub iq_out: Vec<(f32, f32)>,

    /// Current write position within `wavein`/`iq_in`.
    pub waveend: usize,
    /// `true` once the output stage has a round of `waveout` ready and has
    /// not yet consumed it.
    pub waveavail: bool,
    /// Count of rounds where `waveavail` was still set when a new one
    /// became ready.
    pub output_overrun_count: u64,

    pub outputs: Vec<Box<dyn Sink>>,
    /// Mixer inputs this channel's finished PCM is pushed into, separate
    /// from `outputs` because a `MixerInput` handle is not a `Sink`.
    pub mixer_targets: Vec<Arc<MixerInput>>,

    pub(crate) agcavgfast: f32,
    pub(crate) nfm: NfmState,

    wave_batch: usize,
}

impl Channel {
    /// Creates a channel with `wave_batch` audio samples per round and one
    /// frequency entry to start. `needs_raw_iq` is true when any output
    /// requires IQ or when derotation (NFM, or any post-derotation filter)
    /// is configured.
    pub fn new(wave_batch: usize, needs_raw_iq: bool, freq: FrequencyEntry) -> Self {
        let wavein_len = 2 * wave_batch + AGC_EXTRA;
        let waveout_len = wave_batch + AGC_EXTRA;
        Channel {
            needs_raw_iq,
            state: MixerHandshake::Dirty,
            axcindicate: AxcIndicate::NoSignal,
            frequencies: vec![freq],
            current_freq_index: 0,
            base_bin: 0,
            bin: 0,
            dm_phi: 0,
            dm_dphi: 0,
            afc_aggressiveness: 0,
            wavein: vec![0.0; wavein_len],
            waveout: vec![0.0; waveout_len],
            waveout_right: None,
            iq_in: if needs_raw_iq { vec![(0.0, 0.0); wavein_len] } else { Vec::new() },
            iq_out: if needs_raw_iq { vec![(0.0, 0.0); waveout_len] } else { Vec::new() },
            waveend: 0,
            waveavail: false,
            output_overrun_count: 0,
            outputs: Vec::new(),
            mixer_targets: Vec::new(),
            agcavgfast: 0.0,
            nfm: NfmState::default(),
            wave_batch,
        }
    }

    pub fn wave_batch(&self) -> usize {
        self.wave_batch
    }

    pub fn current_frequency(&self) -> &FrequencyEntry {
        &self.frequencies[self.current_freq_index]
    }

    pub fn current_frequency_mut(&mut self) -> &mut FrequencyEntry {
        &mut self.frequencies[self.current_freq_index]
    }

    /// CTCSS present on the currently selected frequency, or a disabled
    /// stand-in if none is configured -- used by code that wants a `&Ctcss`
    /// without matching on an `Option`.
    pub fn ctcss_placeholder() -> Ctcss {
        Ctcss::disabled()
    }

    /// Shifts `wavein` (and `iq_in`, if present) left by `wave_batch`
    /// samples, preserving the trailing `AGC_EXTRA` samples for the next
    /// round's AGC bootstrap/fade.
    pub fn shift_wavein(&mut self) {
        let batch = self.wave_batch;
        self.wavein.copy_within(batch.., 0);
        if self.needs_raw_iq {
            self.iq_in.copy_within(batch.., 0);
        }
        self.waveend = self.waveend.saturating_sub(batch);
    }

    /// Shifts `waveout` (and `iq_out`) left by `wave_batch` samples after
    /// the output stage has consumed the current round, preserving the
    /// trailing `AGC_EXTRA` continuation.
    pub fn shift_waveout(&mut self) {
        let batch = self.wave_batch;
        self.waveout.copy_within(batch.., 0);
        if let Some(right) = &mut self.waveout_right {
            right.copy_within(batch.., 0);
        }
        if self.needs_raw_iq {
            self.iq_out.copy_within(batch.., 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_channel_has_expected_buffer_lengths() {
        let freq = FrequencyEntry::new(100_000, "f0", Modulation::Am);
        let ch = Channel::new(1000, true, freq);
        assert_eq!(ch.wavein.len(), 2 * 1000 + AGC_EXTRA);
        assert_eq!(ch.waveout.len(), 1000 + AGC_EXTRA);
        assert_eq!(ch.iq_in.len(), ch.wavein.len());
        assert_eq!(ch.iq_out.len(), ch.waveout.len());
    }

    #[test]
    fn channel_without_raw_iq_allocates_no_iq_buffers() {
        let freq = FrequencyEntry::new(100_000, "f0", Modulation::Am);
        let ch = Channel::new(1000, false, freq);
        assert!(ch.iq_in.is_empty());
        assert!(ch.iq_out.is_empty());
    }

    #[test]
    fn shift_wavein_preserves_tail() {
        let freq = FrequencyEntry::new(100_000, "f0", Modulation::Am);
        let mut ch = Channel::new(4, false, freq);
        for (i, v) in ch.wavein.iter_mut().enumerate() {
            *v = i as f32;
        }
        ch.waveend = ch.wavein.len();
        ch.shift_wavein();
        // First AGC_EXTRA+4 entries now hold what used to start at index 4.
        assert_eq!(ch.wavein[0], 4.0);
    }
}
