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
//! Prometheus-style text-format metrics snapshot, written every 15 s and
//! once at shutdown. One gauge/counter family per metric name, each
//! family's samples labeled by `freq` (and `label`, when the frequency
//! entry has one) for per-channel metrics, or by `device`/`mixer`/`input`
//! indices for the aggregate ones.

use std::io::Write as _;
use std::path::Path;

use crate::channel::Channel;
use crate::error::{RfError, Result};
use crate::mixer::Mixer;
use crate::ringbuffer::RingBuffer;

/// One device's channels plus the ring buffer feeding them, as seen by
/// the metrics writer.
pub struct DeviceMetrics<'a> {
    pub index: usize,
    pub ring: &'a RingBuffer,
    /// FFT size this device's front-stage runs, needed to convert a raw
    /// bin-magnitude level into dBFS.
    pub fft_size: usize,
    pub channels: &'a [Channel],
    pub output_overrun_count: u64,
}

/// One mixer plus its per-input overrun counters, as seen by the metrics
/// writer.
pub struct MixerMetrics<'a> {
    pub index: usize,
    pub mixer: &'a Mixer,
    pub input_overrun_counts: &'a [u64],
}

fn channel_metric_label(out: &mut String, name: &str, freq_hz: i64, label: &str) {
    let mhz = freq_hz as f64 / 1_000_000.0;
    out.push_str(name);
    out.push_str(&format!("{{freq=\"{mhz:.3}\""));
    if !label.is_empty() {
        out.push_str(&format!(",label=\"{label}\""));
    }
    out.push('}');
}

fn write_help(out: &mut String, name: &str, help: &str, kind: &str) {
    out.push_str(&format!("# HELP {name} {help}\n# TYPE {name} {kind}\n"));
}

/// Renders the full text snapshot for the given devices and mixers.
pub fn format_snapshot(devices: &[DeviceMetrics], mixers: &[MixerMetrics]) -> String {
    let mut out = String::new();

    write_help(&mut out, "channel_noise_level", "Raw squelch noise_level.", "gauge");
    for dev in devices {
        for channel in dev.channels {
            for freq in channel.frequencies.iter() {
                channel_metric_label(&mut out, "channel_noise_level", freq.freq_hz, &freq.label);
                out.push_str(&format!("\t{:.3}\n", freq.squelch.noise_level()));
            }
        }
    }
    out.push('\n');

    write_help(&mut out, "channel_dbfs_noise_level", "Squelch noise_level as dBFS.", "gauge");
    for dev in devices {
        for channel in dev.channels {
            for freq in channel.frequencies.iter() {
                channel_metric_label(&mut out, "channel_dbfs_noise_level", freq.freq_hz, &freq.label);
                let n = freq.squelch.noise_level();
                out.push_str(&format!("\t{:.3}\n", crate::math::level_to_dbfs(n, dev.fft_size)));
            }
        }
    }
    out.push('\n');

    write_help(&mut out, "channel_signal_level", "Raw squelch signal_level.", "gauge");
    for dev in devices {
        for channel in dev.channels {
            for freq in channel.frequencies.iter() {
                channel_metric_label(&mut out, "channel_signal_level", freq.freq_hz, &freq.label);
                out.push_str(&format!("\t{:.3}\n", freq.squelch.signal_level()));
            }
        }
    }
    out.push('\n');

    write_help(&mut out, "channel_squelch_level", "Squelch squelch_level.", "gauge");
    for dev in devices {
        for channel in dev.channels {
            for freq in channel.frequencies.iter() {
                channel_metric_label(&mut out, "channel_squelch_level", freq.freq_hz, &freq.label);
                out.push_str(&format!("\t{:.3}\n", freq.squelch.squelch_level_value()));
            }
        }
    }
    out.push('\n');

    write_help(&mut out, "channel_dbfs_squelch_level", "Squelch squelch_level as dBFS.", "gauge");
    for dev in devices {
        for channel in dev.channels {
            for freq in channel.frequencies.iter() {
                channel_metric_label(&mut out, "channel_dbfs_squelch_level", freq.freq_hz, &freq.label);
                let s = freq.squelch.squelch_level_value();
                out.push_str(&format!("\t{:.3}\n", crate::math::level_to_dbfs(s, dev.fft_size)));
            }
        }
    }
    out.push('\n');

    write_help(&mut out, "channel_squelch_counter", "Squelch open_count.", "counter");
    for dev in devices {
        for channel in dev.channels {
            for freq in channel.frequencies.iter() {
                channel_metric_label(&mut out, "channel_squelch_counter", freq.freq_hz, &freq.label);
                out.push_str(&format!("\t{}\n", freq.squelch.open_count()));
            }
        }
    }
    out.push('\n');

    write_help(&mut out, "channel_flappy_counter", "Squelch flappy_count.", "counter");
    for dev in devices {
        for channel in dev.channels {
            for freq in channel.frequencies.iter() {
                channel_metric_label(&mut out, "channel_flappy_counter", freq.freq_hz, &freq.label);
                out.push_str(&format!("\t{}\n", freq.squelch.flappy_count()));
            }
        }
    }
    out.push('\n');

    write_help(&mut out, "channel_ctcss_counter", "Count of windows with CTCSS detected.", "counter");
    for dev in devices {
        for channel in dev.channels {
            for freq in channel.frequencies.iter() {
                channel_metric_label(&mut out, "channel_ctcss_counter", freq.freq_hz, &freq.label);
                out.push_str(&format!("\t{}\n", freq.squelch.ctcss_count()));
            }
        }
    }
    out.push('\n');

    write_help(&mut out, "channel_no_ctcss_counter", "Count of windows without CTCSS detected.", "counter");
    for dev in devices {
        for channel in dev.channels {
            for freq in channel.frequencies.iter() {
                channel_metric_label(&mut out, "channel_no_ctcss_counter", freq.freq_hz, &freq.label);
                out.push_str(&format!("\t{}\n", freq.squelch.no_ctcss_count()));
            }
        }
    }
    out.push('\n');

    write_help(&mut out, "channel_activity_counter", "Output rounds with the frequency active.", "counter");
    for dev in devices {
        for channel in dev.channels {
            for freq in channel.frequencies.iter() {
                channel_metric_label(&mut out, "channel_activity_counter", freq.freq_hz, &freq.label);
                out.push_str(&format!("\t{}\n", freq.active_counter));
            }
        }
    }
    out.push('\n');

    write_help(&mut out, "buffer_overflow_count", "Number of times a device's buffer has overflowed.", "counter");
    for dev in devices {
        out.push_str(&format!("buffer_overflow_count{{device=\"{}\"}}\t{}\n", dev.index, dev.ring.overflow_count()));
    }
    out.push('\n');

    write_help(&mut out, "output_overrun_count", "Number of times a device or mixer output has overrun.", "counter");
    for dev in devices {
        out.push_str(&format!("output_overrun_count{{device=\"{}\"}}\t{}\n", dev.index, dev.output_overrun_count));
    }
    for mx in mixers {
        out.push_str(&format!("output_overrun_count{{mixer=\"{}\"}}\t{}\n", mx.index, mx.mixer.output_overrun_count));
    }
    out.push('\n');

    if !mixers.is_empty() {
        write_help(&mut out, "input_overrun_count", "Number of times a mixer input has overrun.", "counter");
        for mx in mixers {
            for (j, count) in mx.input_overrun_counts.iter().enumerate() {
                out.push_str(&format!("input_overrun_count{{mixer=\"{}\",input=\"{}\"}}\t{}\n", mx.index, j, count));
            }
        }
        out.push('\n');
    }

    out
}

/// Writes `format_snapshot`'s output to `path` via a `.tmp` sibling and an
/// atomic rename, so a concurrent reader (e.g. a Prometheus textfile
/// collector) never observes a half-written file.
pub fn write_snapshot(path: &Path, devices: &[DeviceMetrics], mixers: &[MixerMetrics]) -> Result<()> {
    let text = format_snapshot(devices, mixers);
    let tmp = path.with_extension("tmp");
    let mut file = std::fs::File::create(&tmp).map_err(|e| RfError::Config {
        reason: format!("cannot create metrics tmp file {}: {e}", tmp.display()),
    })?;
    file.write_all(text.as_bytes()).map_err(|e| RfError::Config {
        reason: format!("cannot write metrics file {}: {e}", tmp.display()),
    })?;
    std::fs::rename(&tmp, path).map_err(|e| RfError::Config {
        reason: format!("cannot rename metrics file into place: {e}"),
    })?;
    Ok(())
}
