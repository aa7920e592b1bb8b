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

//! End-to-end checks driving a whole device (synthetic input, FFT
//! front-stage, AM demod, output scheduler) through its public API the
//! way the binary's core loop does, without any of the app-layer wiring.

use std::net::UdpSocket;
use std::time::{Duration, Instant};

use rfdemux::channel::{Channel, FrequencyEntry, Modulation};
use rfdemux::demod::DemodParams;
use rfdemux::device::{Device, Mode};
use rfdemux::input::synthetic::{SyntheticSource, Tone};
use rfdemux::math::SinCosLut;
use rfdemux::output::udp_sink::UdpSink;
use rfdemux::output::Sink;

fn demod_params() -> DemodParams {
    DemodParams { quadri: false, deemphasis_alpha: 0.0 }
}

/// A steady tone well above a low squelch threshold should open the
/// squelch, mark the channel `Signal`, and land non-silent PCM bytes on
/// its UDP sink within a bounded number of rounds.
#[test]
fn single_tone_am_capture_reaches_a_udp_sink() {
    let recv = UdpSocket::bind("127.0.0.1:0").unwrap();
    recv.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
    let addr = recv.local_addr().unwrap();

    let src = SyntheticSource::silent("t0", 200_000)
        .with_tone(Tone { offset_hz: 25_000.0, amplitude: 0.8 })
        .with_noise(0.005);
    let mut freq = FrequencyEntry::new(25_000, "f0", Modulation::Am);
    freq.squelch.set_squelch_level_threshold(0.001);
    let mut ch = Channel::new(250, false, freq);
    let mut sink = UdpSink::new("u0", addr);
    sink.setup().unwrap();
    ch.outputs.push(Box::new(sink));

    let mut dev = Device::new("dev0", Box::new(src), 8000, 256, 1, demod_params(), vec![ch], Mode::Multichannel { center_hz: 0 }).unwrap();
    dev.start().unwrap();
    let sincos = SinCosLut::new();

    let mut saw_signal_packet = false;
    for _ in 0..4000 {
        dev.run_round(&sincos);
        dev.run_output_round(Duration::from_secs(0), Instant::now());

        let mut buf = [0u8; 4096];
        if let Ok((n, _)) = recv.recv_from(&mut buf) {
            if n > 0 && buf[..n].iter().any(|&b| b != 0) {
                saw_signal_packet = true;
                break;
            }
        }
    }
    dev.stop().unwrap();
    assert!(saw_signal_packet, "never received a non-silent PCM packet");
}

/// With no tone and a squelch threshold high enough that noise alone
/// never opens it, the channel should settle into a steady no-signal
/// state and never mark `waveavail` with `Signal` audible content.
#[test]
fn no_signal_keeps_squelch_closed() {
    let src = SyntheticSource::silent("t1", 200_000).with_noise(0.01);
    let mut freq = FrequencyEntry::new(25_000, "f0", Modulation::Am);
    freq.squelch.set_squelch_level_threshold(0.9);
    let ch = Channel::new(250, false, freq);

    let mut dev = Device::new("dev1", Box::new(src), 8000, 256, 1, demod_params(), vec![ch], Mode::Multichannel { center_hz: 0 }).unwrap();
    dev.start().unwrap();
    let sincos = SinCosLut::new();

    for _ in 0..2000 {
        dev.run_round(&sincos);
        dev.run_output_round(Duration::from_secs(0), Instant::now());
    }
    dev.stop().unwrap();
    assert_eq!(dev.channels()[0].current_frequency().active_counter, 0);
}
