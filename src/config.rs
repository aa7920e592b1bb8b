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
//! Configuration data shapes and loader. Parsing lives at the boundary:
//! everything here is `serde`-deserialized from TOML and range-checked by
//! [`ProcessConfig::validate`] before the core ever sees it. Device/channel
//! construction from a validated `ProcessConfig` is the caller's job (the
//! `rfdemuxd` binary), not this module's.

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{RfError, Result};

fn default_true() -> bool {
    true
}

fn default_fft_size() -> usize {
    2048
}

fn default_shout_metadata_delay() -> u32 {
    0
}

/// Top-level configuration: process options plus the devices and mixers
/// they feed.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessConfig {
    pub pidfile: Option<PathBuf>,
    #[serde(default = "default_fft_size")]
    pub fft_size: usize,
    #[serde(default = "default_shout_metadata_delay")]
    pub shout_metadata_delay: u32,
    #[serde(default)]
    pub localtime: bool,
    #[serde(default)]
    pub multiple_demod_threads: bool,
    #[serde(default)]
    pub multiple_output_threads: bool,
    #[serde(default)]
    pub log_scan_activity: bool,
    pub stats_filepath: Option<PathBuf>,
    /// NFM de-emphasis time constant, microseconds.
    #[serde(default = "default_tau")]
    pub tau: f32,
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub mixers: Vec<MixerConfig>,
}

fn default_tau() -> f32 {
    0.0
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMode {
    Multichannel,
    Scan,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub sample_rate: u32,
    pub mode: DeviceMode,
    /// Required when `mode = multichannel`; ignored for `scan`.
    pub centerfreq: Option<i64>,
    pub tau: Option<f32>,
    pub channels: Vec<ChannelConfig>,
    /// Driver-specific keys handed to the Input Source unexamined (e.g.
    /// `path` for a file source, `gain`/`antenna` for a radio).
    #[serde(default)]
    pub driver: toml::Table,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModulationConfig {
    Am,
    Nfm,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    /// Single frequency. Mutually exclusive with `freqs`.
    pub freq: Option<i64>,
    /// Frequency list (scan mode, or a multichannel slot that can be
    /// retuned). Mutually exclusive with `freq`.
    pub freqs: Option<Vec<i64>>,
    #[serde(default)]
    pub labels: Vec<String>,
    pub modulation: Option<ModulationConfig>,
    #[serde(default)]
    pub modulations: Vec<ModulationConfig>,
    /// dBFS, must be <= 0.
    pub squelch_threshold: Option<f32>,
    /// dB, must be >= 0.
    pub squelch_snr_threshold: Option<f32>,
    pub ctcss: Option<f32>,
    pub notch: Option<f32>,
    #[serde(default = "default_notch_q")]
    pub notch_q: f32,
    /// Enables derotation + lowpass when set.
    pub bandwidth: Option<f32>,
    pub highpass: Option<f32>,
    pub lowpass: Option<f32>,
    #[serde(default)]
    pub afc: bool,
    pub tau: Option<f32>,
    #[serde(default = "default_ampfactor")]
    pub ampfactor: f32,
    #[serde(default)]
    pub outputs: Vec<OutputConfig>,
}

fn default_notch_q() -> f32 {
    10.0
}

fn default_ampfactor() -> f32 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputConfig {
    Icecast {
        server: String,
        port: u16,
        mountpoint: String,
        username: String,
        password: String,
        #[serde(default)]
        send_scan_freq_tags: bool,
        #[serde(default)]
        disable: bool,
    },
    File {
        directory: PathBuf,
        filename_template: String,
        #[serde(default)]
        continuous: bool,
        #[serde(default = "default_true")]
        append: bool,
        #[serde(default)]
        split_on_transmission: bool,
        #[serde(default)]
        disable: bool,
    },
    Rawfile {
        directory: PathBuf,
        filename_template: String,
        #[serde(default)]
        continuous: bool,
        #[serde(default = "default_true")]
        append: bool,
        #[serde(default)]
        disable: bool,
    },
    Mixer {
        name: String,
        #[serde(default = "default_ampfactor")]
        ampfactor: f32,
        #[serde(default)]
        balance: f32,
        #[serde(default)]
        disable: bool,
    },
    UdpStream {
        dest_address: String,
        dest_port: u16,
        #[serde(default)]
        disable: bool,
    },
    Pulse {
        server: Option<String>,
        #[serde(default)]
        disable: bool,
    },
}

impl OutputConfig {
    pub fn is_disabled(&self) -> bool {
        match self {
            OutputConfig::Icecast { disable, .. } => *disable,
            OutputConfig::File { disable, .. } => *disable,
            OutputConfig::Rawfile { disable, .. } => *disable,
            OutputConfig::Mixer { disable, .. } => *disable,
            OutputConfig::UdpStream { disable, .. } => *disable,
            OutputConfig::Pulse { disable, .. } => *disable,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MixerConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub stereo: bool,
    #[serde(default)]
    pub outputs: Vec<OutputConfig>,
}

/// A single resolved frequency entry, after `freq`/`freqs` and
/// `modulation`/`modulations` have been reconciled against each other.
#[derive(Debug, Clone)]
pub struct FrequencyConfig {
    pub freq_hz: i64,
    pub label: String,
    pub modulation: ModulationConfig,
}

impl ProcessConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: ProcessConfig = toml::from_str(text).map_err(|e| RfError::Config {
            reason: format!("cannot parse configuration: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| RfError::Config {
            reason: format!("cannot read configuration file {}: {e}", path.display()),
        })?;
        Self::from_toml_str(&text)
    }

    /// Range/enum checks named in the bin-assignment and input-format
    /// invariants. Once this returns `Ok`, the core assumes every value is
    /// already within range and never re-validates on the hot path.
    pub fn validate(&self) -> Result<()> {
        if !self.fft_size.is_power_of_two() || !(256..=8192).contains(&self.fft_size) {
            return Err(RfError::Config {
                reason: format!("fft_size must be a power of two in 256..=8192, got {}", self.fft_size),
            });
        }
        if self.shout_metadata_delay > 32 {
            return Err(RfError::Config {
                reason: format!("shout_metadata_delay must be 0..=32, got {}", self.shout_metadata_delay),
            });
        }
        if self.devices.is_empty() {
            return Err(RfError::Config {
                reason: "at least one device is required".into(),
            });
        }
        for dev in &self.devices {
            dev.validate()?;
        }
        Ok(())
    }
}

impl DeviceConfig {
    fn validate(&self) -> Result<()> {
        match self.mode {
            DeviceMode::Multichannel if self.centerfreq.is_none() => {
                return Err(RfError::Config {
                    reason: format!("device '{}': centerfreq is required in multichannel mode", self.name),
                });
            }
            _ => {}
        }
        if self.channels.is_empty() {
            return Err(RfError::Config {
                reason: format!("device '{}': at least one channel is required", self.name),
            });
        }
        for (i, ch) in self.channels.iter().enumerate() {
            ch.validate(&self.name, i)?;
        }
        Ok(())
    }
}

impl ChannelConfig {
    fn validate(&self, device_name: &str, index: usize) -> Result<()> {
        if self.freq.is_some() == self.freqs.is_some() {
            return Err(RfError::Config {
                reason: format!(
                    "device '{device_name}' channel {index}: exactly one of freq/freqs is required"
                ),
            });
        }
        if self.squelch_threshold.is_some() && self.squelch_threshold.unwrap() > 0.0 {
            return Err(RfError::Config {
                reason: format!("device '{device_name}' channel {index}: squelch_threshold must be <= 0 dBFS"),
            });
        }
        if self.squelch_snr_threshold.is_some() && self.squelch_snr_threshold.unwrap() < 0.0 {
            return Err(RfError::Config {
                reason: format!("device '{device_name}' channel {index}: squelch_snr_threshold must be >= 0 dB"),
            });
        }
        Ok(())
    }

    /// Resolves `freq`/`freqs` and `modulation`/`modulations` (plus
    /// `labels`) into one list of [`FrequencyConfig`] entries, repeating a
    /// single `modulation` across every frequency when `modulations` is
    /// absent.
    pub fn frequencies(&self) -> Vec<FrequencyConfig> {
        let freqs: Vec<i64> = match (&self.freq, &self.freqs) {
            (Some(f), None) => vec![*f],
            (None, Some(fs)) => fs.clone(),
            _ => Vec::new(),
        };
        freqs
            .into_iter()
            .enumerate()
            .map(|(i, freq_hz)| {
                let label = self.labels.get(i).cloned().unwrap_or_default();
                let modulation = self
                    .modulations
                    .get(i)
                    .cloned()
                    .or_else(|| self.modulation.clone())
                    .unwrap_or(ModulationConfig::Am);
                FrequencyConfig { freq_hz, label, modulation }
            })
            .collect()
    }
}

/// Command-line flags, per the CLI contract: `-c` config file, `-f`
/// foreground+TUI, `-F` foreground no-TUI, `-e` stderr logging, `-v`
/// version, `-Q` quadri NFM demod, `-d <path>` debug log.
#[derive(Debug, clap::Parser)]
#[command(name = "rfdemuxd", version, about = "Channelizes a wideband SDR stream into narrowband voice channels")]
pub struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short = 'c', long = "config", value_name = "path")]
    pub config: PathBuf,

    /// Run in the foreground with a TUI.
    #[arg(short = 'f')]
    pub foreground_tui: bool,

    /// Run in the foreground without a TUI.
    #[arg(short = 'F')]
    pub foreground: bool,

    /// Force logging to stderr regardless of foreground mode.
    #[arg(short = 'e')]
    pub stderr_log: bool,

    /// Use quadri-correlator NFM demodulation instead of the default
    /// discriminator.
    #[arg(short = 'Q')]
    pub quadri: bool,

    /// Write a debug log to this path.
    #[arg(short = 'd', long = "debug-log", value_name = "path")]
    pub debug_log: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
        [[devices]]
        name = "dev0"
        type = "file"
        sample_rate = 200000
        mode = "multichannel"
        centerfreq = 100000000

        [[devices.channels]]
        freq = 100025000
        modulation = "am"
        "#
    }

    #[test]
    fn parses_minimal_config() {
        let config = ProcessConfig::from_toml_str(minimal_toml()).unwrap();
        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.fft_size, 2048);
        assert_eq!(config.devices[0].channels.len(), 1);
    }

    #[test]
    fn rejects_non_power_of_two_fft_size() {
        let text = format!("fft_size = 2000\n{}", minimal_toml());
        let err = ProcessConfig::from_toml_str(&text).unwrap_err();
        assert!(matches!(err, RfError::Config { .. }));
    }

    #[test]
    fn rejects_multichannel_device_without_centerfreq() {
        let text = minimal_toml().replace("centerfreq = 100000000", "");
        let err = ProcessConfig::from_toml_str(&text).unwrap_err();
        assert!(matches!(err, RfError::Config { .. }));
    }

    #[test]
    fn channel_frequencies_repeats_single_modulation_across_freqs_list() {
        let ch = ChannelConfig {
            freq: None,
            freqs: Some(vec![100_000, 200_000]),
            labels: vec!["a".into()],
            modulation: Some(ModulationConfig::Nfm),
            modulations: Vec::new(),
            squelch_threshold: None,
            squelch_snr_threshold: None,
            ctcss: None,
            notch: None,
            notch_q: default_notch_q(),
            bandwidth: None,
            highpass: None,
            lowpass: None,
            afc: false,
            tau: None,
            ampfactor: default_ampfactor(),
            outputs: Vec::new(),
        };
        let freqs = ch.frequencies();
        assert_eq!(freqs.len(), 2);
        assert!(matches!(freqs[0].modulation, ModulationConfig::Nfm));
        assert!(matches!(freqs[1].modulation, ModulationConfig::Nfm));
        assert_eq!(freqs[0].label, "a");
        assert_eq!(freqs[1].label, "");
    }

    #[test]
    fn rejects_channel_with_both_freq_and_freqs() {
        let text = minimal_toml().replace("freq = 100025000", "freq = 100025000\nfreqs = [1, 2]");
        let err = ProcessConfig::from_toml_str(&text).unwrap_err();
        assert!(matches!(err, RfError::Config { .. }));
    }
}
