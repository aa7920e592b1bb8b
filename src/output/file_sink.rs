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
//! Audio-capture file sink with three rotation policies. A write always
//! lands in a `.tmp` sibling of the final path; closing atomically
//! renames it into place so a reader never observes a partial file.

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::error::{RfError, Result};
use crate::output::lametone::marker_sequence;
use crate::output::{Payload, Sink};

/// How a file sink decides when to close the current file and open a new
/// one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    /// One file per hour boundary, no gaps.
    Continuous,
    /// One file per transmission: opens on first audio, closes after
    /// `idle_close` of silence, bounded to `[min_len, max_len]`.
    SplitOnTransmission,
    /// Always appends to the same path, inserting marker tones (and, in
    /// continuous mode, silence) to cover any gap since the last write.
    Append { continuous: bool },
}

const SPLIT_MIN: Duration = Duration::from_secs(1);
const SPLIT_MAX: Duration = Duration::from_secs(60 * 60);
const SPLIT_IDLE_CLOSE: Duration = Duration::from_millis(500);

/// A file sink writing mono (or joint float-stereo) PCM audio.
pub struct FileSink {
    name: String,
    dir: PathBuf,
    stem: String,
    rotation: Rotation,
    enabled: bool,
    file: Option<File>,
    tmp_path: Option<PathBuf>,
    final_path: Option<PathBuf>,
    opened_at: Option<Instant>,
    last_write_at: Option<Instant>,
    last_mtime: Option<SystemTime>,
    wave_rate: u32,
}

impl FileSink {
    pub fn new(
        name: impl Into<String>,
        dir: impl Into<PathBuf>,
        stem: impl Into<String>,
        rotation: Rotation,
        wave_rate: u32,
    ) -> Self {
        FileSink {
            name: name.into(),
            dir: dir.into(),
            stem: stem.into(),
            rotation,
            enabled: true,
            file: None,
            tmp_path: None,
            final_path: None,
            opened_at: None,
            last_write_at: None,
            last_mtime: None,
            wave_rate,
        }
    }

    fn timestamped_path(&self) -> PathBuf {
        let secs = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        self.dir.join(format!("{}_{}.mp3", self.stem, secs))
    }

    fn open_new(&mut self) -> Result<()> {
        let final_path = self.timestamped_path();
        let tmp_path = final_path.with_extension("mp3.tmp");

        let append = matches!(self.rotation, Rotation::Append { .. });
        let existing_len = std::fs::metadata(&final_path).map(|m| m.len()).unwrap_or(0);

        // Atomically rename any prior same-named file out of the way
        // before (re)opening, same as the reference open_file().
        let _ = std::fs::rename(&final_path, &tmp_path);

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .open(&tmp_path)
            .map_err(|e| RfError::SinkTransient {
                output: self.name.clone(),
                reason: format!("cannot open {}: {}", tmp_path.display(), e),
            })?;

        if append && existing_len > 0 {
            let gap_secs = self
                .last_mtime
                .and_then(|m| SystemTime::now().duration_since(m).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let continuous = matches!(self.rotation, Rotation::Append { continuous: true });
            let marker = marker_sequence(continuous, gap_secs, self.wave_rate);
            let mut f = &file;
            f.write_all(&marker).map_err(|e| RfError::SinkTransient {
                output: self.name.clone(),
                reason: format!("writing marker tones: {e}"),
            })?;
        }

        self.file = Some(file);
        self.tmp_path = Some(tmp_path);
        self.final_path = Some(final_path);
        self.opened_at = Some(Instant::now());
        Ok(())
    }

    fn close_current(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().ok();
        }
        if let (Some(tmp), Some(fin)) = (self.tmp_path.take(), self.final_path.take()) {
            std::fs::rename(&tmp, &fin).or_else(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Ok(())
                } else {
                    Err(RfError::SinkTransient {
                        output: self.name.clone(),
                        reason: format!("renaming {} to {}: {}", tmp.display(), fin.display(), e),
                    })
                }
            })?;
        }
        self.opened_at = None;
        Ok(())
    }

    fn maybe_rotate_for_idle(&mut self) -> Result<()> {
        if let Rotation::SplitOnTransmission = self.rotation {
            if let (Some(last), Some(opened)) = (self.last_write_at, self.opened_at) {
                let held_long_enough = opened.elapsed() >= SPLIT_MIN;
                if held_long_enough && last.elapsed() >= SPLIT_IDLE_CLOSE {
                    self.close_current()?;
                }
            }
            if let Some(opened) = self.opened_at {
                if opened.elapsed() >= SPLIT_MAX {
                    self.close_current()?;
                }
            }
        }
        Ok(())
    }
}

impl Sink for FileSink {
    fn setup(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| RfError::SinkFatal {
            output: self.name.clone(),
            reason: format!("cannot create directory {}: {}", self.dir.display(), e),
        })?;
        if !matches!(self.rotation, Rotation::SplitOnTransmission) {
            self.open_new()?;
        }
        Ok(())
    }

    fn write(&mut self, payload: &Payload) -> Result<()> {
        self.maybe_rotate_for_idle()?;
        if self.file.is_none() {
            self.open_new()?;
        }
        let Payload::Pcm { mono, right } = payload else {
            return Ok(());
        };
        let result = (|| -> Result<()> {
            let file = self.file.as_mut().expect("opened above");
            for &s in mono.iter() {
                file.write_all(&s.to_le_bytes()).map_err(|e| RfError::SinkTransient {
                    output: self.name.clone(),
                    reason: e.to_string(),
                })?;
            }
            if let Some(right) = right {
                for &s in right.iter() {
                    file.write_all(&s.to_le_bytes()).map_err(|e| RfError::SinkTransient {
                        output: self.name.clone(),
                        reason: e.to_string(),
                    })?;
                }
            }
            Ok(())
        })();
        if result.is_err() {
            self.file = None;
            return result;
        }
        self.last_write_at = Some(Instant::now());
        self.last_mtime = Some(SystemTime::now());
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        self.close_current()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, value: bool) {
        self.enabled = value;
    }

    fn is_connected(&self) -> bool {
        self.file.is_some() || matches!(self.rotation, Rotation::SplitOnTransmission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn continuous_sink_opens_on_setup() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::new("t", dir.path(), "chan", Rotation::Continuous, 8000);
        sink.setup().unwrap();
        assert!(sink.file.is_some());
        sink.shutdown().unwrap();
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn split_on_transmission_opens_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::new("t", dir.path(), "chan", Rotation::SplitOnTransmission, 8000);
        sink.setup().unwrap();
        assert!(sink.file.is_none());
        let samples = vec![0.1f32; 8];
        sink.write(&Payload::Pcm { mono: &samples, right: None }).unwrap();
        assert!(sink.file.is_some());
        sink.shutdown().unwrap();
    }

    #[test]
    fn write_renames_tmp_to_final_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::new("t", dir.path(), "chan", Rotation::Continuous, 8000);
        sink.setup().unwrap();
        let samples = vec![0.1f32; 4];
        sink.write(&Payload::Pcm { mono: &samples, right: None }).unwrap();
        sink.shutdown().unwrap();
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let name = entries[0].as_ref().unwrap().file_name();
        assert!(!name.to_string_lossy().ends_with(".tmp"));
    }
}
