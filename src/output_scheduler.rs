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
//! Dispatches a channel's or mixer's finished round of audio to its sinks
//! and mixer inputs, and the periodic reconnect/metrics-flush bookkeeping
//! that rides along with it. The actual condition-variable wait loop and
//! thread wiring belong to the device-assembly layer; this module is the
//! per-wakeup work it calls into.

use std::time::{Duration, Instant};

use crate::channel::{AxcIndicate, Channel, MixerHandshake};
use crate::error::RfError;
use crate::mixer::Mixer;
use crate::output::{Payload, Sink};
use crate::tags::TagQueue;

/// Cadence of the metrics text-file flush, owned by the "first" output
/// thread (the one covering device index 0).
pub const METRICS_FLUSH_INTERVAL: Duration = Duration::from_secs(15);

/// Cadence of the reconnect watcher.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(10);

/// Delivers one channel's just-finished round of PCM (and, if configured,
/// raw IQ) to every enabled output and connected mixer input. `scan_freq`
/// is the frequency-list index to attach as metadata for SCAN-mode
/// devices, or `None` outside scan mode (and always `None` for a mixer's
/// own virtual channel).
pub fn process_outputs(channel: &mut Channel, scan_freq: Option<usize>) {
    let batch = channel.wave_batch();
    let has_signal = channel.axcindicate == AxcIndicate::Signal;

    if let Some(freq_idx) = scan_freq {
        log::trace!("channel scan metadata: freq_index={freq_idx}");
    }

    {
        let mono = &channel.waveout[..batch];
        let right = channel.waveout_right.as_ref().map(|v| &v[..batch]);
        let pcm = Payload::Pcm { mono, right };
        for sink in channel.outputs.iter_mut() {
            if !sink.enabled() {
                continue;
            }
            if let Err(e) = sink.write(&pcm) {
                handle_sink_error(sink.as_mut(), e);
            }
        }
        for target in channel.mixer_targets.iter() {
            target.provide(mono, right, has_signal);
        }
    }

    if channel.needs_raw_iq {
        let iq = Payload::RawIq(&channel.iq_out[..batch]);
        for sink in channel.outputs.iter_mut() {
            if !sink.enabled() {
                continue;
            }
            if let Err(e) = sink.write(&iq) {
                handle_sink_error(sink.as_mut(), e);
            }
        }
    }

    if has_signal {
        channel.current_frequency_mut().active_counter += 1;
    }
}

/// Fatal errors disable the sink for good (the scheduler never calls
/// `write` on a disabled sink again); transient errors are only logged,
/// since recovery is each concrete sink's own responsibility (dropping its
/// handle so `is_connected` goes false, which the reconnect watcher acts
/// on) rather than the scheduler's.
fn handle_sink_error(sink: &mut dyn Sink, err: RfError) {
    match err {
        RfError::SinkFatal { output, reason } => {
            log::error!("output '{output}' disabled permanently: {reason}");
            sink.set_enabled(false);
        }
        RfError::SinkTransient { output, reason } => {
            log::warn!("output '{output}' transient failure: {reason}");
        }
        other => log::warn!("output '{}' unexpected error: {other}", sink.name()),
    }
}

/// One device's output round, covering every channel with `waveavail`
/// set. Dequeues at most one ready scan tag up front (a no-op outside
/// SCAN mode, where `tags` is simply never populated), dispatches each
/// channel, then shifts its `waveout` left to preserve the trailing
/// `AGC_EXTRA` continuation and clears `waveavail`.
pub fn run_device_round(channels: &mut [Channel], tags: &TagQueue, shout_metadata_delay: Duration, now: Instant) {
    let scan_freq = tags.pop_ready(shout_metadata_delay, now).map(|t| t.freq_index);
    for channel in channels.iter_mut() {
        if !channel.waveavail {
            continue;
        }
        process_outputs(channel, scan_freq);
        channel.shift_waveout();
        channel.waveavail = false;
    }
}

/// A mixer paired with the virtual channel its mixed PCM is delivered
/// through -- the mixer has no sinks of its own, only whatever is attached
/// to this channel's `outputs`.
pub struct MixerOutput {
    pub mixer: Mixer,
    pub channel: Channel,
}

impl MixerOutput {
    pub fn new(mixer: Mixer, channel: Channel) -> Self {
        MixerOutput { mixer, channel }
    }
}

/// Drains every mixer whose state is READY into its paired channel and
/// dispatches it, resetting the mixer's state to DIRTY afterward.
pub fn run_mixer_round(outputs: &mut [MixerOutput]) {
    for mo in outputs.iter_mut() {
        if mo.mixer.state != MixerHandshake::Ready {
            continue;
        }
        let batch = mo.mixer.waveout.len();
        mo.channel.waveout[..batch].copy_from_slice(&mo.mixer.waveout);
        if let (Some(dst), Some(src)) = (mo.channel.waveout_right.as_mut(), mo.mixer.waveout_right.as_ref()) {
            dst[..batch].copy_from_slice(src);
        }
        mo.channel.axcindicate = mo.mixer.axcindicate;
        process_outputs(&mut mo.channel, None);
        mo.mixer.state = MixerHandshake::Dirty;
    }
}

/// Edge-triggered 15 s gate deciding whether the metrics text file is due
/// for another flush. Only the output thread covering device index 0
/// holds one of these, per the single-writer rule in the design.
pub struct MetricsFlushGate {
    last_flush: Option<Instant>,
}

impl MetricsFlushGate {
    pub fn new() -> Self {
        MetricsFlushGate { last_flush: None }
    }

    /// Returns `true` at most once per [`METRICS_FLUSH_INTERVAL`].
    pub fn due(&mut self, now: Instant) -> bool {
        match self.last_flush {
            Some(last) if now.duration_since(last) < METRICS_FLUSH_INTERVAL => false,
            _ => {
                self.last_flush = Some(now);
                true
            }
        }
    }
}

impl Default for MetricsFlushGate {
    fn default() -> Self {
        Self::new()
    }
}

/// One reconnect-watcher tick for a single device's sinks. A failed
/// device tears every sink down and disables it permanently (there is no
/// longer any input to feed them); otherwise, every enabled sink that has
/// lost its handle (`is_connected() == false`) -- because a transient
/// write failure dropped it, or because it has never successfully
/// connected -- gets another `setup()` attempt.
pub fn run_reconnect_tick(device_failed: bool, sinks: &mut [Box<dyn Sink>]) {
    for sink in sinks.iter_mut() {
        if !sink.enabled() {
            continue;
        }
        if device_failed {
            let _ = sink.shutdown();
            sink.set_enabled(false);
            continue;
        }
        if !sink.is_connected() {
            if let Err(e) = sink.setup() {
                handle_sink_error(sink.as_mut(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{FrequencyEntry, Modulation};
    use crate::output::rawfile_sink::RawFileSink;
    use crate::output::udp_sink::UdpSink;
    use std::net::UdpSocket;

    fn make_channel(wave_batch: usize, needs_raw_iq: bool) -> Channel {
        let freq = FrequencyEntry::new(100_000, "f0", Modulation::Am);
        Channel::new(wave_batch, needs_raw_iq, freq)
    }

    #[test]
    fn process_outputs_delivers_pcm_to_a_udp_sink() {
        let recv = UdpSocket::bind("127.0.0.1:0").unwrap();
        recv.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
        let addr = recv.local_addr().unwrap();

        let mut ch = make_channel(4, false);
        ch.axcindicate = AxcIndicate::Signal;
        for (i, s) in ch.waveout.iter_mut().enumerate().take(4) {
            *s = i as f32 * 0.1;
        }
        let mut sink = UdpSink::new("u0", addr);
        sink.setup().unwrap();
        ch.outputs.push(Box::new(sink));

        process_outputs(&mut ch, None);

        let mut buf = [0u8; 64];
        let (n, _) = recv.recv_from(&mut buf).unwrap();
        assert_eq!(n, 16);
        assert_eq!(ch.current_frequency().active_counter, 1);
    }

    #[test]
    fn process_outputs_delivers_raw_iq_when_needed() {
        let dir = tempfile::tempdir().unwrap();
        let mut ch = make_channel(4, true);
        ch.axcindicate = AxcIndicate::Signal;
        for (i, iq) in ch.iq_out.iter_mut().enumerate().take(4) {
            *iq = (i as f32, -(i as f32));
        }
        let mut sink = RawFileSink::new("r0", dir.path(), "chan");
        sink.setup().unwrap();
        ch.outputs.push(Box::new(sink));

        process_outputs(&mut ch, None);

        // Shut down (the test harness never calls the reconnect watcher)
        // to force the rename out of .tmp before inspecting the directory.
        ch.outputs[0].shutdown().unwrap();
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let data = std::fs::read(entries[0].as_ref().unwrap().path()).unwrap();
        assert_eq!(data.len(), 4 * 8);
    }

    #[test]
    fn run_device_round_clears_waveavail_and_shifts() {
        let mut ch = make_channel(4, false);
        ch.waveend = ch.wavein.len();
        ch.waveavail = true;
        for (i, v) in ch.waveout.iter_mut().enumerate() {
            *v = i as f32;
        }
        let tags = TagQueue::new();
        run_device_round(std::slice::from_mut(&mut ch), &tags, Duration::from_secs(0), Instant::now());
        assert!(!ch.waveavail);
        // after the shift, index 0 holds what used to be at index wave_batch=4
        assert_eq!(ch.waveout[0], 4.0);
    }

    #[test]
    fn run_mixer_round_copies_ready_mixer_output_into_its_channel() {
        let mut mixer = Mixer::new("m0", false, 4);
        let input = mixer.connect_input(1.0, 1.0, 0.0);
        input.provide(&[0.2, 0.2, 0.2, 0.2], None, true);
        assert!(mixer.sub_tick());
        assert_eq!(mixer.state, MixerHandshake::Ready);

        let channel = make_channel(4, false);
        let mut outputs = vec![MixerOutput::new(mixer, channel)];
        run_mixer_round(&mut outputs);

        assert_eq!(outputs[0].mixer.state, MixerHandshake::Dirty);
        assert!((outputs[0].channel.waveout[0] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn metrics_flush_gate_fires_once_then_waits_out_the_interval() {
        let mut gate = MetricsFlushGate::new();
        let t0 = Instant::now();
        assert!(gate.due(t0));
        assert!(!gate.due(t0 + Duration::from_secs(5)));
        assert!(gate.due(t0 + METRICS_FLUSH_INTERVAL));
    }

    #[test]
    fn reconnect_tick_disables_every_sink_for_a_failed_device() {
        let addr = "127.0.0.1:9".parse().unwrap();
        let mut sink = UdpSink::new("u0", addr);
        sink.setup().unwrap();
        let mut sinks: Vec<Box<dyn Sink>> = vec![Box::new(sink)];
        run_reconnect_tick(true, &mut sinks);
        assert!(!sinks[0].enabled());
    }

    #[test]
    fn reconnect_tick_reopens_a_disconnected_sink() {
        let dir = tempfile::tempdir().unwrap();
        let sink = RawFileSink::new("r0", dir.path(), "chan");
        // Never setup(): is_connected() is false, so a tick should connect it.
        let mut sinks: Vec<Box<dyn Sink>> = vec![Box::new(sink)];
        run_reconnect_tick(false, &mut sinks);
        assert!(sinks[0].is_connected());
    }
}
