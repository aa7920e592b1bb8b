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
//! Raw IQ capture sink: writes interleaved little-endian `f32` I/Q pairs
//! (`.cf32`) to a timestamped file, atomically renamed into place.

use std::fs::File;
use std::io::Write as _;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{RfError, Result};
use crate::output::{Payload, Sink};

pub struct RawFileSink {
    name: String,
    dir: PathBuf,
    stem: String,
    enabled: bool,
    file: Option<File>,
    tmp_path: Option<PathBuf>,
    final_path: Option<PathBuf>,
}

impl RawFileSink {
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>, stem: impl Into<String>) -> Self {
        RawFileSink {
            name: name.into(),
            dir: dir.into(),
            stem: stem.into(),
            enabled: true,
            file: None,
            tmp_path: None,
            final_path: None,
        }
    }
}

impl Sink for RawFileSink {
    fn setup(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| RfError::SinkFatal {
            output: self.name.clone(),
            reason: format!("cannot create directory {}: {}", self.dir.display(), e),
        })?;
        let secs = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        let final_path = self.dir.join(format!("{}_{}.cf32", self.stem, secs));
        let tmp_path = final_path.with_extension("cf32.tmp");
        let file = File::create(&tmp_path).map_err(|e| RfError::SinkTransient {
            output: self.name.clone(),
            reason: format!("cannot open {}: {}", tmp_path.display(), e),
        })?;
        self.file = Some(file);
        self.tmp_path = Some(tmp_path);
        self.final_path = Some(final_path);
        Ok(())
    }

    fn write(&mut self, payload: &Payload) -> Result<()> {
        let Payload::RawIq(samples) = payload else {
            return Ok(());
        };
        let result = (|| -> Result<()> {
            let file = self.file.as_mut().ok_or_else(|| RfError::SinkTransient {
                output: self.name.clone(),
                reason: "write before setup".into(),
            })?;
            for &(re, im) in samples.iter() {
                file.write_all(&re.to_le_bytes()).map_err(|e| RfError::SinkTransient {
                    output: self.name.clone(),
                    reason: e.to_string(),
                })?;
                file.write_all(&im.to_le_bytes()).map_err(|e| RfError::SinkTransient {
                    output: self.name.clone(),
                    reason: e.to_string(),
                })?;
            }
            Ok(())
        })();
        if result.is_err() {
            self.file = None;
        }
        result
    }

    fn shutdown(&mut self) -> Result<()> {
        if let Some(mut f) = self.file.take() {
            f.flush().ok();
        }
        if let (Some(tmp), Some(fin)) = (self.tmp_path.take(), self.final_path.take()) {
            std::fs::rename(&tmp, &fin).map_err(|e| RfError::SinkTransient {
                output: self.name.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
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
        self.file.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_interleaved_iq_and_renames_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = RawFileSink::new("t", dir.path(), "chan");
        sink.setup().unwrap();
        let samples = [(1.0f32, -1.0f32), (0.5, 0.25)];
        sink.write(&Payload::RawIq(&samples)).unwrap();
        sink.shutdown().unwrap();
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let data = std::fs::read(entries[0].as_ref().unwrap().path()).unwrap();
        assert_eq!(data.len(), samples.len() * 8);
    }
}
