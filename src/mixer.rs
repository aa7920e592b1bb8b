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
//! Weighted stereo sum across N channel-producer inputs. A mixer input is
//! a non-owning handle a channel's demod side holds onto and pushes a
//! finished audio batch into; the mixer thread drains whichever inputs are
//! ready each sub-tick and assembles one output round every `MIX_DIVISOR`
//! sub-ticks.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::channel::{AxcIndicate, MixerHandshake};

/// Sub-ticks per mixer output round.
pub const MIX_DIVISOR: u8 = 2;

struct InputSlot {
    samples: Vec<f32>,
    samples_right: Option<Vec<f32>>,
    ready: bool,
    has_signal: bool,
}

/// Non-owning handle to one mixer input, shared between the channel's
/// demod side (producer, via [`MixerInput::provide`]) and the mixer
/// thread (consumer). Disabling never drops the handle; it just stops the
/// mixer from waiting on it.
pub struct MixerInput {
    ampfactor: f32,
    ampl_left: f32,
    ampr_right: f32,
    enabled: AtomicBool,
    overrun_count: AtomicU64,
    slot: Mutex<InputSlot>,
}

impl MixerInput {
    fn new(ampfactor: f32, ampl_left: f32, ampr_right: f32, wave_batch: usize, stereo: bool) -> Self {
        MixerInput {
            ampfactor,
            ampl_left,
            ampr_right,
            enabled: AtomicBool::new(true),
            overrun_count: AtomicU64::new(0),
            slot: Mutex::new(InputSlot {
                samples: vec![0.0; wave_batch],
                samples_right: if stereo { Some(vec![0.0; wave_batch]) } else { None },
                ready: false,
                has_signal: false,
            }),
        }
    }

    /// Publishes one finished audio batch. If the mixer has not yet
    /// drained the previous batch, it is overwritten and counted as an
    /// input overrun.
    pub fn provide(&self, mono: &[f32], right: Option<&[f32]>, has_signal: bool) {
        let mut slot = self.slot.lock().unwrap();
        if slot.ready {
            self.overrun_count.fetch_add(1, Ordering::Relaxed);
        }
        slot.samples.copy_from_slice(mono);
        if let (Some(dst), Some(src)) = (slot.samples_right.as_mut(), right) {
            dst.copy_from_slice(src);
        }
        slot.has_signal = has_signal;
        slot.ready = true;
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn overrun_count(&self) -> u64 {
        self.overrun_count.load(Ordering::Relaxed)
    }
}

/// A named summing junction. Runs at `2 * WAVE_BATCH` cadence; each
/// [`Mixer::sub_tick`] call is one such cadence step.
pub struct Mixer {
    name: String,
    stereo: bool,
    wave_batch: usize,

    inputs: Vec<Arc<MixerInput>>,
    todo: Vec<bool>,
    interval: u8,
    disabled: bool,

    pub state: MixerHandshake,
    pub axcindicate: AxcIndicate,
    pub waveout: Vec<f32>,
    pub waveout_right: Option<Vec<f32>>,
    pub output_overrun_count: u64,
}

impl Mixer {
    pub fn new(name: impl Into<String>, stereo: bool, wave_batch: usize) -> Self {
        Mixer {
            name: name.into(),
            stereo,
            wave_batch,
            inputs: Vec::new(),
            todo: Vec::new(),
            interval: MIX_DIVISOR,
            disabled: false,
            state: MixerHandshake::Dirty,
            axcindicate: AxcIndicate::NoSignal,
            waveout: vec![0.0; wave_batch],
            waveout_right: if stereo { Some(vec![0.0; wave_batch]) } else { None },
            output_overrun_count: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Allocates an input index once and returns the producer-side
    /// handle to connect a channel to.
    pub fn connect_input(&mut self, ampfactor: f32, ampl_left: f32, ampr_right: f32) -> Arc<MixerInput> {
        let input = Arc::new(MixerInput::new(ampfactor, ampl_left, ampr_right, self.wave_batch, self.stereo));
        self.inputs.push(input.clone());
        self.todo.push(false);
        input
    }

    /// Clears an input's mask bit; if every input is now masked out, the
    /// whole mixer is disabled.
    pub fn disable_input(&mut self, index: usize) {
        self.inputs[index].disable();
        if self.inputs.iter().all(|i| !i.enabled()) {
            self.disabled = true;
        }
    }

    /// One sub-tick. Returns `true` exactly on the sub-tick where a mix
    /// round completes (state flips to `Ready`), which is the caller's
    /// cue to signal the output stage.
    pub fn sub_tick(&mut self) -> bool {
        if self.disabled || self.inputs.is_empty() {
            return false;
        }

        if self.interval == MIX_DIVISOR {
            if self.state == MixerHandshake::Ready {
                self.output_overrun_count += 1;
            }
            self.waveout.iter_mut().for_each(|s| *s = 0.0);
            if let Some(right) = &mut self.waveout_right {
                right.iter_mut().for_each(|s| *s = 0.0);
            }
            self.axcindicate = AxcIndicate::NoSignal;
            self.state = MixerHandshake::Working;
            for (idx, input) in self.inputs.iter().enumerate() {
                self.todo[idx] = input.enabled();
            }
        }

        let mut any_pending = false;
        for (idx, input) in self.inputs.iter().enumerate() {
            if !self.todo[idx] {
                continue;
            }
            if !input.enabled() {
                self.todo[idx] = false;
                continue;
            }
            let mut slot = input.slot.lock().unwrap();
            if !slot.ready {
                any_pending = true;
                continue;
            }
            if slot.has_signal {
                for k in 0..self.wave_batch {
                    self.waveout[k] += slot.samples[k] * input.ampfactor * input.ampl_left;
                }
                if let Some(out_right) = self.waveout_right.as_mut() {
                    if let Some(in_right) = slot.samples_right.as_ref() {
                        for k in 0..self.wave_batch {
                            out_right[k] += in_right[k] * input.ampfactor * input.ampr_right;
                        }
                    }
                }
                self.axcindicate = AxcIndicate::Signal;
            }
            slot.ready = false;
            self.todo[idx] = false;
        }

        self.interval = self.interval.saturating_sub(1);

        let all_done = !any_pending && self.todo.iter().all(|&t| !t);
        if all_done || self.interval == 0 {
            for s in self.waveout.iter_mut() {
                *s = s.clamp(-1.0, 1.0);
            }
            if let Some(right) = &mut self.waveout_right {
                for s in right.iter_mut() {
                    *s = s.clamp(-1.0, 1.0);
                }
            }
            self.state = MixerHandshake::Ready;
            self.interval = MIX_DIVISOR;
            for t in self.todo.iter_mut() {
                *t = false;
            }
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mono_sum_of_two_equal_inputs_clamps_to_range() {
        let mut mixer = Mixer::new("m0", false, 4);
        let a = mixer.connect_input(1.0, 1.0, 0.0);
        let b = mixer.connect_input(1.0, 1.0, 0.0);

        let samples = [0.6f32, 0.6, 0.6, 0.6];
        a.provide(&samples, None, true);
        b.provide(&samples, None, true);

        let completed = mixer.sub_tick();
        assert!(completed);
        assert_eq!(mixer.state, MixerHandshake::Ready);
        assert_eq!(mixer.axcindicate, AxcIndicate::Signal);
        for &s in &mixer.waveout {
            assert!((s - 1.0).abs() < 1e-6, "s={s}"); // 0.6+0.6 clamped to 1.0
        }
    }

    #[test]
    fn round_completes_without_signal_when_no_input_has_signal() {
        let mut mixer = Mixer::new("m0", false, 2);
        let a = mixer.connect_input(1.0, 1.0, 0.0);
        a.provide(&[0.0, 0.0], None, false);

        assert!(mixer.sub_tick());
        assert_eq!(mixer.axcindicate, AxcIndicate::NoSignal);
    }

    #[test]
    fn round_completes_after_interval_expires_even_if_an_input_never_arrives() {
        let mut mixer = Mixer::new("m0", false, 2);
        let a = mixer.connect_input(1.0, 1.0, 0.0);
        let _b = mixer.connect_input(1.0, 1.0, 0.0);
        a.provide(&[0.5, 0.5], None, true);

        // b never provides; the round must still close once interval hits 0.
        assert!(!mixer.sub_tick());
        assert!(mixer.sub_tick());
        assert_eq!(mixer.state, MixerHandshake::Ready);
    }

    #[test]
    fn disabling_every_input_disables_the_mixer() {
        let mut mixer = Mixer::new("m0", false, 2);
        let a = mixer.connect_input(1.0, 1.0, 0.0);
        let _ = a;
        mixer.disable_input(0);
        assert!(mixer.is_disabled());
        assert!(!mixer.sub_tick());
    }

    #[test]
    fn overrun_is_counted_when_previous_batch_was_not_drained() {
        let mixer = Mixer::new("m0", false, 2);
        let _ = &mixer;
        let input = MixerInput::new(1.0, 1.0, 0.0, 2, false);
        input.provide(&[0.1, 0.1], None, true);
        input.provide(&[0.2, 0.2], None, true);
        assert_eq!(input.overrun_count(), 1);
    }
}
