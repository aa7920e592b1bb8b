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
//! Builds devices, channels and mixers from a validated [`ProcessConfig`].
//! Mixers are constructed before channels so that a channel's `mixer`
//! output can connect to the target mixer by name; devices are
//! constructed last since `Device::new` needs its channels fully wired.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use rfdemux::channel::{Channel, FrequencyEntry, Modulation};
use rfdemux::config::{ChannelConfig, DeviceConfig, ModulationConfig, OutputConfig, ProcessConfig};
use rfdemux::demod::DemodParams;
use rfdemux::device::{Device, Mode};
use rfdemux::error::{RfError, Result};
use rfdemux::filters::{LowpassFilter, NotchFilter};
use rfdemux::input::file::FileSource;
use rfdemux::input::synthetic::SyntheticSource;
use rfdemux::input::{InputSource, SampleFormat};
use rfdemux::mixer::Mixer;
use rfdemux::output::file_sink::{FileSink, Rotation};
use rfdemux::output::rawfile_sink::RawFileSink;
use rfdemux::output::stub::{ExternalKind, ExternalStub};
use rfdemux::output::udp_sink::UdpSink;
use rfdemux::output::Sink;
use rfdemux::output_scheduler::MixerOutput;
use rfdemux::scan::ScanController;

/// Process-wide singletons resolved once before any device is built, per
/// the design's note that `fft_size`, `alpha`, and `shout_metadata_delay`
/// are read-only for the life of the process.
pub struct ProcessParams {
    pub fft_size: usize,
    pub wave_rate: u32,
    pub shout_metadata_delay: Duration,
    pub log_scan_activity: bool,
    pub stats_filepath: Option<std::path::PathBuf>,
    pub pidfile: Option<std::path::PathBuf>,
    /// One demod thread per device instead of one thread covering all of
    /// them.
    pub multiple_demod_threads: bool,
    /// One output thread per device instead of one thread covering all
    /// of them.
    pub multiple_output_threads: bool,
}

/// Everything the binary needs to run the process: the assembled devices,
/// any mixers (each paired with the virtual channel its output lands on),
/// and the process-wide parameters.
pub struct Setup {
    pub devices: Vec<Device>,
    pub mixer_outputs: Vec<MixerOutput>,
    pub params: ProcessParams,
}

impl Setup {
    pub fn from_config(config: &ProcessConfig, quadri: bool) -> Result<Self> {
        let any_nfm = config.devices.iter().any(|d| {
            d.channels.iter().any(|c| {
                c.frequencies().iter().any(|f| matches!(f.modulation, ModulationConfig::Nfm))
            })
        });
        let wave_rate = rfdemux::resolve_wave_rate(any_nfm);
        let wave_batch = rfdemux::wave_batch(wave_rate);

        let alpha = if config.tau <= 0.0 {
            0.0
        } else {
            (-1.0f32 / (wave_rate as f32 * 1e-6 * config.tau)).exp()
        };
        let demod_params = DemodParams { quadri, deemphasis_alpha: alpha };

        let mut mixers: HashMap<String, Mixer> = HashMap::new();
        for mx in &config.mixers {
            if !mx.enabled {
                continue;
            }
            mixers.insert(mx.name.clone(), Mixer::new(mx.name.clone(), mx.stereo, wave_batch));
        }

        let mut devices = Vec::new();
        for dev_cfg in &config.devices {
            let mut channels = Vec::new();
            for ch_cfg in &dev_cfg.channels {
                channels.push(build_channel(ch_cfg, wave_batch, wave_rate, config.fft_size, &mut mixers)?);
            }

            let mode = match dev_cfg.mode {
                rfdemux::config::DeviceMode::Multichannel => Mode::Multichannel {
                    center_hz: dev_cfg.centerfreq.ok_or_else(|| RfError::Config {
                        reason: format!("device '{}': centerfreq is required", dev_cfg.name),
                    })?,
                },
                rfdemux::config::DeviceMode::Scan => {
                    let freqlist: Vec<i64> = channels[0].frequencies.iter().map(|f| f.freq_hz).collect();
                    Mode::Scan { freqlist, scan: ScanController::new() }
                }
            };

            let input = build_input(dev_cfg)?;
            let mut device = Device::new(
                dev_cfg.name.clone(),
                input,
                wave_rate,
                config.fft_size,
                rfdemux::FFT_BATCH,
                demod_params,
                channels,
                mode,
            )?;
            device.start()?;
            devices.push(device);
        }

        let mixer_outputs = mixers
            .into_iter()
            .map(|(_, mixer)| {
                let stereo = mixer.waveout_right.is_some();
                let freq = FrequencyEntry::new(0, mixer.name().to_string(), Modulation::Am);
                let mut channel = Channel::new(wave_batch, false, freq);
                if stereo {
                    channel.waveout_right = Some(vec![0.0; wave_batch + rfdemux::channel::AGC_EXTRA]);
                }
                MixerOutput::new(mixer, channel)
            })
            .collect();

        Ok(Setup {
            devices,
            mixer_outputs,
            params: ProcessParams {
                fft_size: config.fft_size,
                wave_rate,
                shout_metadata_delay: Duration::from_secs(config.shout_metadata_delay as u64),
                log_scan_activity: config.log_scan_activity,
                stats_filepath: config.stats_filepath.clone(),
                pidfile: config.pidfile.clone(),
                multiple_demod_threads: config.multiple_demod_threads,
                multiple_output_threads: config.multiple_output_threads,
            },
        })
    }
}

fn channel_needs_raw_iq(cfg: &ChannelConfig) -> bool {
    let freqs = cfg.frequencies();
    let any_nfm = freqs.iter().any(|f| matches!(f.modulation, ModulationConfig::Nfm));
    let any_rawfile = cfg.outputs.iter().any(|o| matches!(o, OutputConfig::Rawfile { .. }));
    any_nfm || cfg.bandwidth.is_some() || any_rawfile
}

fn build_frequency_entry(cfg: &ChannelConfig, freq_hz: i64, label: String, modulation: ModulationConfig, wave_rate: u32, fft_size: usize) -> FrequencyEntry {
    let modulation = match modulation {
        ModulationConfig::Am => Modulation::Am,
        ModulationConfig::Nfm => Modulation::Nfm,
    };
    let mut entry = FrequencyEntry::new(freq_hz, label, modulation);
    entry.ampfactor = cfg.ampfactor;
    entry.highpass_hz = cfg.highpass;

    if let Some(db) = cfg.squelch_threshold {
        let level = rfdemux::math::dbfs_to_level(db, fft_size);
        entry.squelch.set_squelch_level_threshold(level);
    }
    if let Some(db) = cfg.squelch_snr_threshold {
        entry.squelch.set_squelch_snr_threshold(db);
    }
    if let Some(ctcss_freq) = cfg.ctcss {
        entry.squelch.set_ctcss_freq(ctcss_freq, wave_rate as f32);
    }
    if let Some(notch_freq) = cfg.notch {
        entry.notch = NotchFilter::new(notch_freq, wave_rate as f32, cfg.notch_q);
    }
    if let Some(bw) = cfg.bandwidth {
        entry.lowpass = LowpassFilter::new(bw / 2.0, wave_rate as f32);
    }
    entry
}

fn build_channel(
    cfg: &ChannelConfig,
    wave_batch: usize,
    wave_rate: u32,
    fft_size: usize,
    mixers: &mut HashMap<String, Mixer>,
) -> Result<Channel> {
    let freqs = cfg.frequencies();
    if freqs.is_empty() {
        return Err(RfError::Config {
            reason: "channel has no resolved frequencies".into(),
        });
    }
    let needs_raw_iq = channel_needs_raw_iq(cfg);

    let first_entry = build_frequency_entry(cfg, freqs[0].freq_hz, freqs[0].label.clone(), freqs[0].modulation.clone(), wave_rate, fft_size);
    let mut channel = Channel::new(wave_batch, needs_raw_iq, first_entry);
    for freq in &freqs[1..] {
        channel.frequencies.push(build_frequency_entry(cfg, freq.freq_hz, freq.label.clone(), freq.modulation.clone(), wave_rate, fft_size));
    }

    for out_cfg in &cfg.outputs {
        if out_cfg.is_disabled() {
            continue;
        }
        if let OutputConfig::Mixer { name, ampfactor, balance, .. } = out_cfg {
            let mixer = mixers.get_mut(name).ok_or_else(|| RfError::Config {
                reason: format!("channel output references unknown mixer '{name}'"),
            })?;
            let (ampl_left, ampr_right) = balance_to_gains(*balance);
            let input = mixer.connect_input(*ampfactor, ampl_left, ampr_right);
            channel.mixer_targets.push(input);
        } else {
            channel.outputs.push(build_output(out_cfg, wave_rate));
        }
    }

    Ok(channel)
}

/// Constant-power stereo pan: `balance` in `[-1, 1]`, 0 centered.
fn balance_to_gains(balance: f32) -> (f32, f32) {
    let b = balance.clamp(-1.0, 1.0);
    let angle = (b + 1.0) * std::f32::consts::FRAC_PI_4;
    (angle.cos(), angle.sin())
}

fn build_input(dev_cfg: &DeviceConfig) -> Result<Box<dyn InputSource>> {
    match dev_cfg.kind.as_str() {
        "file" => {
            let path = dev_cfg
                .driver
                .get("path")
                .and_then(|v| v.as_str())
                .ok_or_else(|| RfError::Config {
                    reason: format!("device '{}': file input requires driver.path", dev_cfg.name),
                })?;
            let sample_format = parse_sample_format(dev_cfg)?;
            let fullscale = dev_cfg
                .driver
                .get("fullscale")
                .and_then(|v| v.as_float())
                .map(|f| f as f32)
                .unwrap_or(match sample_format {
                    SampleFormat::U8 => 127.5,
                    SampleFormat::S8 => 127.0,
                    SampleFormat::S16 => 32767.0,
                    SampleFormat::F32 => 1.0,
                });
            let speedup = dev_cfg.driver.get("speedup_factor").and_then(|v| v.as_float()).unwrap_or(1.0);
            Ok(Box::new(FileSource::new(dev_cfg.name.clone(), path, sample_format, fullscale, dev_cfg.sample_rate, speedup)))
        }
        "synthetic" => Ok(Box::new(SyntheticSource::silent(dev_cfg.name.clone(), dev_cfg.sample_rate))),
        other => Err(RfError::Config {
            reason: format!("device '{}': input type '{other}' is not linked into this build", dev_cfg.name),
        }),
    }
}

fn parse_sample_format(dev_cfg: &DeviceConfig) -> Result<SampleFormat> {
    match dev_cfg.driver.get("format").and_then(|v| v.as_str()).unwrap_or("u8") {
        "u8" => Ok(SampleFormat::U8),
        "s8" => Ok(SampleFormat::S8),
        "s16" => Ok(SampleFormat::S16),
        "f32" => Ok(SampleFormat::F32),
        other => Err(RfError::Config {
            reason: format!("device '{}': unknown sample format '{other}'", dev_cfg.name),
        }),
    }
}

fn build_output(out: &OutputConfig, wave_rate: u32) -> Box<dyn Sink> {
    match out {
        OutputConfig::Icecast { .. } => Box::new(ExternalStub::new("icecast", ExternalKind::Icecast)),
        OutputConfig::File { directory, filename_template, continuous, split_on_transmission, .. } => {
            // `append` (default true) only matters once neither of these
            // rotation schemes applies, and there is no plain-overwrite
            // scheme implemented, so it's read at config-parse time only.
            let rotation = if *split_on_transmission {
                Rotation::SplitOnTransmission
            } else if *continuous {
                Rotation::Continuous
            } else {
                Rotation::Append { continuous: false }
            };
            Box::new(FileSink::new(filename_template.clone(), directory.clone(), filename_template.clone(), rotation, wave_rate))
        }
        OutputConfig::Rawfile { directory, filename_template, .. } => {
            Box::new(RawFileSink::new(filename_template.clone(), directory.clone(), filename_template.clone()))
        }
        OutputConfig::UdpStream { dest_address, dest_port, .. } => {
            let addr: SocketAddr = format!("{dest_address}:{dest_port}").parse().unwrap_or_else(|_| {
                "0.0.0.0:0".parse().unwrap()
            });
            Box::new(UdpSink::new("udp", addr))
        }
        OutputConfig::Pulse { .. } => Box::new(ExternalStub::new("pulse", ExternalKind::Pulse)),
        OutputConfig::Mixer { .. } => unreachable!("mixer outputs are connected, not built as sinks"),
    }
}
