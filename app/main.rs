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
//! Channelizes a wideband SDR stream into many narrowband voice channels,
//! demodulates each one, and fans the results out to streaming/file/mixer
//! sinks. Parses the command line and configuration file, sets up logging,
//! builds the devices and mixers, then assembles the real thread set that
//! drives them until a signal sets the stop flag: one or more demod
//! threads, one or more output threads, one mixer thread, one reconnect
//! watcher, and one scan-controller thread per SCAN device.
//!
//! Every device lives behind its own `Arc<Mutex<Device>>` and every mixer
//! output behind one shared `Arc<Mutex<Vec<MixerOutput>>>`, so the threads
//! below are genuinely concurrent OS threads rather than turns of a single
//! loop. Demod and mixer threads hand off to output threads through
//! [`rfdemux::sync::Signal`], matching the condition-variable handoff the
//! reference implementation's own thread set uses.

mod setup;

use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use clap::Parser;
use log::LevelFilter;
use signal_hook::consts::{SIGHUP, SIGINT};
use simplelog::{Config as LogConfig, SimpleLogger, TermLogger, TerminalMode, WriteLogger};

use rfdemux::config::{Cli, ProcessConfig};
use rfdemux::device::Device;
use rfdemux::math::SinCosLut;
use rfdemux::metrics::{self, DeviceMetrics, MixerMetrics};
use rfdemux::output_scheduler::{self, MetricsFlushGate, MixerOutput};
use rfdemux::sync::Signal;

use self::setup::Setup;

const SCAN_DWELL: Duration = Duration::from_millis(200);
const DEMOD_IDLE_SLEEP: Duration = Duration::from_millis(1);
/// How long an output thread blocks waiting for a demod/mixer handoff
/// before re-checking the stop flag on its own.
const OUTPUT_WAIT_TIMEOUT: Duration = Duration::from_millis(50);
/// How long the reconnect-watcher thread sleeps between passes.
const RECONNECT_POLL: Duration = Duration::from_millis(200);

fn init_logging(cli: &Cli) {
    let level = LevelFilter::Info;
    if let Some(path) = &cli.debug_log {
        match std::fs::File::create(path) {
            Ok(file) => {
                if WriteLogger::init(LevelFilter::Debug, LogConfig::default(), file).is_ok() {
                    return;
                }
            }
            Err(e) => eprintln!("failed to open debug log {}: {e}", path.display()),
        }
    }

    let foreground = cli.foreground || cli.foreground_tui || cli.stderr_log;
    let mode = if foreground { TerminalMode::Mixed } else { TerminalMode::Stderr };
    let status = TermLogger::init(level, LogConfig::default(), mode, simplelog::ColorChoice::Auto)
        .or_else(|_| SimpleLogger::init(level, LogConfig::default()));
    if let Err(e) = status {
        eprintln!("failed to set up logging: {e}");
    }
}

fn mixer_interval(wave_rate: u32) -> Duration {
    let wave_batch = rfdemux::wave_batch(wave_rate) as u64;
    let us = 1_000_000 * wave_batch / (wave_rate as u64 * rfdemux::mixer::MIX_DIVISOR as u64);
    Duration::from_micros(us.max(1))
}

/// Splits `count` items across worker threads: one range per item when
/// `one_per_item` is set (the `multiple_demod_threads`/
/// `multiple_output_threads` config case), otherwise a single range
/// covering everything.
fn thread_ranges(count: usize, one_per_item: bool) -> Vec<Range<usize>> {
    if count == 0 {
        return Vec::new();
    }
    if one_per_item {
        (0..count).map(|i| i..i + 1).collect()
    } else {
        vec![0..count]
    }
}

fn flush_metrics(devices: &[Arc<Mutex<Device>>], mixer_outputs: &Mutex<Vec<MixerOutput>>, path: &std::path::Path) {
    // Hold every device's lock for the duration of the snapshot: `DeviceMetrics`
    // borrows straight out of each `Device`, so the guards must outlive it.
    let guards: Vec<_> = devices.iter().map(|d| d.lock().unwrap()).collect();
    let devices: Vec<DeviceMetrics> = guards
        .iter()
        .enumerate()
        .map(|(index, dev)| DeviceMetrics {
            index,
            ring: dev.ring(),
            fft_size: dev.fft_size(),
            channels: dev.channels(),
            output_overrun_count: dev.output_overrun_count(),
        })
        .collect();
    let mixer_outputs = mixer_outputs.lock().unwrap();
    let mixers: Vec<MixerMetrics> = mixer_outputs
        .iter()
        .enumerate()
        .map(|(index, mo)| MixerMetrics {
            index,
            mixer: &mo.mixer,
            input_overrun_counts: &[],
        })
        .collect();
    if let Err(e) = metrics::write_snapshot(path, &devices, &mixers) {
        log::warn!("failed to write metrics snapshot: {e}");
    }
}

/// Demod thread body for one device range: runs each device's FFT/demod
/// round back to back, waking the output thread responsible for a device
/// as soon as that device has something ready to drain.
fn demod_thread_body(
    devices: Vec<Arc<Mutex<Device>>>,
    output_signals: Vec<Arc<Signal>>,
    sincos: SinCosLut,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::Relaxed) {
        let mut any_progressed = false;
        for (device, signal) in devices.iter().zip(output_signals.iter()) {
            let mut device = device.lock().unwrap();
            if device.run_round(&sincos) {
                any_progressed = true;
            }
            if device.any_waveavail() {
                signal.send();
            }
        }
        if !any_progressed {
            std::thread::sleep(DEMOD_IDLE_SLEEP);
        }
    }
}

/// Carried only by the output thread covering device index 0, which owns
/// the metrics-flush gate under the single-writer rule; needs the full
/// device/mixer set rather than just its own range since a snapshot
/// covers every device.
struct MetricsOwner {
    devices: Vec<Arc<Mutex<Device>>>,
    mixer_outputs: Arc<Mutex<Vec<MixerOutput>>>,
    stats_path: Option<std::path::PathBuf>,
}

/// Output thread body for one device range. Waits on its signal for a
/// demod or mixer handoff, then drains whatever is ready; the thread
/// covering the highest-indexed device range also owns the shared mixer
/// outputs and the metrics-flush gate, matching the reference
/// implementation's choice of its last output thread for both.
fn output_thread_body(
    devices: Vec<Arc<Mutex<Device>>>,
    signal: Arc<Signal>,
    shout_metadata_delay: Duration,
    mixer_outputs: Option<Arc<Mutex<Vec<MixerOutput>>>>,
    metrics_owner: Option<MetricsOwner>,
    stop: Arc<AtomicBool>,
) {
    let mut metrics_gate = MetricsFlushGate::new();
    while !stop.load(Ordering::Relaxed) {
        signal.wait(OUTPUT_WAIT_TIMEOUT);
        let now = Instant::now();
        for device in devices.iter() {
            let mut device = device.lock().unwrap();
            device.run_output_round(shout_metadata_delay, now);
        }
        if let Some(mixer_outputs) = &mixer_outputs {
            let mut outputs = mixer_outputs.lock().unwrap();
            output_scheduler::run_mixer_round(&mut outputs);
        }
        if let Some(owner) = &metrics_owner {
            if let Some(path) = &owner.stats_path {
                if metrics_gate.due(now) {
                    flush_metrics(&owner.devices, &owner.mixer_outputs, path);
                }
            }
        }
    }
}

fn mixer_thread_body(mixer_outputs: Arc<Mutex<Vec<MixerOutput>>>, output_signal: Arc<Signal>, wave_rate: u32, stop: Arc<AtomicBool>) {
    let interval = mixer_interval(wave_rate);
    while !stop.load(Ordering::Relaxed) {
        std::thread::sleep(interval);
        if stop.load(Ordering::Relaxed) {
            return;
        }
        {
            let mut outputs = mixer_outputs.lock().unwrap();
            for mo in outputs.iter_mut() {
                mo.mixer.sub_tick();
            }
        }
        output_signal.send();
    }
}

fn scan_thread_body(device: Arc<Mutex<Device>>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Relaxed) {
        std::thread::sleep(SCAN_DWELL);
        if stop.load(Ordering::Relaxed) {
            return;
        }
        device.lock().unwrap().tick_scan();
    }
}

fn reconnect_thread_body(devices: Vec<Arc<Mutex<Device>>>, stop: Arc<AtomicBool>) {
    let mut last_tick = Instant::now();
    while !stop.load(Ordering::Relaxed) {
        std::thread::sleep(RECONNECT_POLL);
        let now = Instant::now();
        if now.duration_since(last_tick) < output_scheduler::RECONNECT_INTERVAL {
            continue;
        }
        last_tick = now;
        for device in devices.iter() {
            device.lock().unwrap().run_reconnect_tick();
        }
    }
}

/// Spawns the demod/output/mixer/reconnect/scan thread set and blocks
/// until `stop` is observed, then joins everything. Device and mixer
/// ranges respect `multiple_demod_threads`/`multiple_output_threads`
/// independently, same as the reference implementation's own
/// `init_demod`/`init_output` range splitting.
fn run_threaded(setup: Setup, sincos: SinCosLut, stop: Arc<AtomicBool>) {
    let shout_metadata_delay = setup.params.shout_metadata_delay;
    let wave_rate = setup.params.wave_rate;
    let stats_path = setup.params.stats_filepath.clone();
    let device_count = setup.devices.len();

    let devices: Vec<Arc<Mutex<Device>>> = setup.devices.into_iter().map(|d| Arc::new(Mutex::new(d))).collect();
    let mixer_outputs = Arc::new(Mutex::new(setup.mixer_outputs));
    let has_mixers = !mixer_outputs.lock().unwrap().is_empty();

    let mut output_ranges = thread_ranges(device_count, setup.params.multiple_output_threads);
    if output_ranges.is_empty() && has_mixers {
        output_ranges.push(0..0);
    }
    let output_signals: Vec<Arc<Signal>> = output_ranges.iter().map(|_| Arc::new(Signal::new())).collect();

    // Maps a device index to the output thread (by index into
    // `output_ranges`/`output_signals`) that drains it.
    let mut device_output_thread = vec![0usize; device_count];
    for (thread_idx, range) in output_ranges.iter().enumerate() {
        for idx in range.clone() {
            device_output_thread[idx] = thread_idx;
        }
    }

    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    for range in thread_ranges(device_count, setup.params.multiple_demod_threads) {
        let devices_slice: Vec<Arc<Mutex<Device>>> = devices[range.clone()].to_vec();
        let signals_slice: Vec<Arc<Signal>> = range.clone().map(|idx| Arc::clone(&output_signals[device_output_thread[idx]])).collect();
        let sincos = sincos.clone();
        let stop = Arc::clone(&stop);
        handles.push(std::thread::spawn(move || demod_thread_body(devices_slice, signals_slice, sincos, stop)));
    }

    let last_output_thread = output_ranges.len().saturating_sub(1);
    for (thread_idx, range) in output_ranges.iter().enumerate() {
        let devices_slice: Vec<Arc<Mutex<Device>>> = devices[range.clone()].to_vec();
        let signal = Arc::clone(&output_signals[thread_idx]);
        let mixer_handle = if thread_idx == last_output_thread && has_mixers { Some(Arc::clone(&mixer_outputs)) } else { None };
        let metrics_owner = if thread_idx == 0 {
            Some(MetricsOwner { devices: devices.clone(), mixer_outputs: Arc::clone(&mixer_outputs), stats_path: stats_path.clone() })
        } else {
            None
        };
        let stop = Arc::clone(&stop);
        handles.push(std::thread::spawn(move || {
            output_thread_body(devices_slice, signal, shout_metadata_delay, mixer_handle, metrics_owner, stop)
        }));
    }

    if has_mixers {
        let signal = Arc::clone(&output_signals[last_output_thread]);
        let mixer_outputs = Arc::clone(&mixer_outputs);
        let stop = Arc::clone(&stop);
        handles.push(std::thread::spawn(move || mixer_thread_body(mixer_outputs, signal, wave_rate, stop)));
    }

    {
        let stop = Arc::clone(&stop);
        let devices = devices.clone();
        handles.push(std::thread::spawn(move || reconnect_thread_body(devices, stop)));
    }

    for (idx, device) in devices.iter().enumerate() {
        if device.lock().unwrap().is_scan_mode() {
            let device = Arc::clone(device);
            let stop = Arc::clone(&stop);
            handles.push(std::thread::spawn(move || scan_thread_body(device, stop)));
            log::debug!("started scan-controller thread for device {idx}");
        }
    }

    while !stop.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }

    for handle in handles {
        let _ = handle.join();
    }

    if let Some(path) = &stats_path {
        flush_metrics(&devices, &mixer_outputs, path);
    }

    for device in devices.iter() {
        let _ = device.lock().unwrap().stop();
    }
}

fn run() -> rfdemux::error::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let config = ProcessConfig::from_path(&cli.config)?;
    let setup = Setup::from_config(&config, cli.quadri)?;

    if let Some(pidfile) = &setup.params.pidfile {
        if let Err(e) = std::fs::write(pidfile, format!("{}\n", std::process::id())) {
            log::warn!("failed to write pidfile {}: {e}", pidfile.display());
        }
    }

    let stop = Arc::new(AtomicBool::new(false));
    if let Err(e) = signal_hook::flag::register(SIGINT, Arc::clone(&stop)) {
        log::warn!("failed to register SIGINT handler: {e}");
    }
    if let Err(e) = signal_hook::flag::register(SIGHUP, Arc::clone(&stop)) {
        log::warn!("failed to register SIGHUP handler: {e}");
    }

    let sincos = SinCosLut::new();
    run_threaded(setup, sincos, stop);

    Ok(())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("{e}");
        std::process::exit(if e.is_fatal_at_startup() { 1 } else { -1 });
    }
}
