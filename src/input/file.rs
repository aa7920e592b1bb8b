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
//! Replays raw IQ samples from a file (or named pipe) at (approximately)
//! the rate they would arrive from real hardware, paced by
//! `speedup_factor`. Reaching end-of-file transitions the source to
//! `Failed`, which the rest of the core treats as a terminal, not fatal,
//! condition (see the design's error-handling section).
//!

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{RfError, Result};
use crate::input::{InputFormat, InputShared, InputSource, InputState, SampleFormat};
use crate::ringbuffer::RingBuffer;

/// A file-replay input source.
pub struct FileSource {
    name: String,
    path: PathBuf,
    sample_format: SampleFormat,
    fullscale: f32,
    sample_rate: u32,
    /// Pacing multiplier: 1.0 replays at the file's nominal sample rate,
    /// larger values replay faster, `f64::INFINITY` replays as fast as
    /// the reader can go.
    speedup_factor: f64,
    file: Option<File>,
    shared: Option<Arc<InputShared>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FileSource {
    /// Creates a file source. `speedup_factor` must be `> 0`.
    pub fn new(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        sample_format: SampleFormat,
        fullscale: f32,
        sample_rate: u32,
        speedup_factor: f64,
    ) -> Self {
        FileSource {
            name: name.into(),
            path: path.into(),
            sample_format,
            fullscale,
            sample_rate,
            speedup_factor,
            file: None,
            shared: None,
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }
}

impl InputSource for FileSource {
    fn init(&mut self) -> Result<()> {
        if self.speedup_factor <= 0.0 {
            return Err(RfError::Config {
                reason: "speedup_factor must be > 0".into(),
            });
        }
        let file = File::open(&self.path).map_err(|e| RfError::InputInit {
            device: self.name.clone(),
            reason: format!("cannot open {}: {}", self.path.display(), e),
        })?;
        self.file = Some(file);
        let ring = Arc::new(RingBuffer::new(1 << 20, 0));
        self.shared = Some(Arc::new(InputShared::new(ring, 0)));
        self.shared.as_ref().unwrap().set_state(InputState::Initialized);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        let shared = self.shared.clone().ok_or_else(|| RfError::InputInit {
            device: self.name.clone(),
            reason: "start() called before init()".into(),
        })?;
        let mut file = self.file.take().ok_or_else(|| RfError::InputInit {
            device: self.name.clone(),
            reason: "start() called before init()".into(),
        })?;
        shared.set_state(InputState::Running);

        let bps = self.sample_format.bytes_per_sample();
        let sample_rate = self.sample_rate as f64;
        let speedup = self.speedup_factor;
        let stop = Arc::clone(&self.stop);
        let name = self.name.clone();
        let last_err: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let last_err2 = Arc::clone(&last_err);

        let handle = std::thread::Builder::new()
            .name(format!("filesrc-{name}"))
            .spawn(move || {
                let block_samples = 4096usize;
                let mut buf = vec![0u8; block_samples * bps];
                while !stop.load(Ordering::Relaxed) {
                    match file.read_exact(&mut buf) {
                        Ok(()) => {
                            shared.ring.append(&buf);
                            if speedup.is_finite() {
                                let secs = block_samples as f64 / sample_rate / speedup;
                                std::thread::sleep(Duration::from_secs_f64(secs.max(0.0)));
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                            *last_err2.lock().unwrap() = Some("end of file".into());
                            shared.set_state(InputState::Failed);
                            break;
                        }
                        Err(e) => {
                            *last_err2.lock().unwrap() = Some(e.to_string());
                            shared.set_state(InputState::Failed);
                            break;
                        }
                    }
                }
            })
            .expect("failed to spawn file source reader");
        self.handle = Some(handle);
        Ok(())
    }

    fn set_center_freq(&mut self, hz: u32) -> Result<()> {
        // File replay has no real front-end; this is still meaningful for
        // SCAN-mode tests, which only observe that this was called.
        match &self.shared {
            Some(shared) if shared.state() == InputState::Running => {
                shared.set_center_freq(hz);
                Ok(())
            }
            _ => Err(RfError::InputRuntime {
                device: self.name.clone(),
                reason: "set_center_freq() while not running".into(),
            }),
        }
    }

    fn stop(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.join().map_err(|_| RfError::InputRuntime {
                device: self.name.clone(),
                reason: "reader thread panicked".into(),
            })?;
        }
        if let Some(shared) = &self.shared {
            if shared.state() != InputState::Failed {
                shared.set_state(InputState::Stopped);
            }
        }
        Ok(())
    }

    fn format(&self) -> InputFormat {
        InputFormat {
            sample_format: self.sample_format,
            fullscale: self.fullscale,
            sample_rate: self.sample_rate,
        }
    }

    fn shared(&self) -> Arc<InputShared> {
        self.shared.clone().expect("shared() called before init()")
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_is_init_error() {
        let mut src = FileSource::new(
            "t",
            "/nonexistent/path/for/test",
            SampleFormat::U8,
            127.5,
            200_000,
            1.0,
        );
        assert!(src.init().is_err());
    }

    #[test]
    fn eof_transitions_to_failed_not_fatal() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[1u8; 16]).unwrap();
        let path = tmp.path().to_path_buf();
        let mut src = FileSource::new("t", path, SampleFormat::U8, 127.5, 200_000, f64::INFINITY);
        src.init().unwrap();
        src.start().unwrap();
        // Wait for the reader to hit EOF after one short block read fails.
        for _ in 0..100 {
            if src.shared().state() == InputState::Failed {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(src.shared().state(), InputState::Failed);
        src.stop().unwrap();
    }
}
