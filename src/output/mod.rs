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
//! Sink contract and concrete sinks. Icecast/MP3 encoding and PulseAudio
//! are external collaborators; this module implements the ones with no
//! dependency surface beyond the standard library (file and UDP sinks)
//! plus trait-conformant stubs for the rest.

pub mod file_sink;
pub mod lametone;
pub mod rawfile_sink;
pub mod stub;
pub mod udp_sink;

use crate::error::Result;

/// One unit of data handed from the demod/mixer stage to a sink.
pub enum Payload<'a> {
    /// Pre-encoded MP3 frame bytes (mono or joint-stereo)
    Mp3(&'a [u8]),
    /// Float PCM, mono with an optional right channel for stereo mixers
    Pcm { mono: &'a [f32], right: Option<&'a [f32]> },
    /// Raw complex-baseband samples, `(re, im)` pairs
    RawIq(&'a [(f32, f32)]),
}

/// Common contract every output sink implements, regardless of transport.
///
/// `write` must be non-blocking or bounded in duration; a transient
/// failure is reported as an error and the caller tears down and retries
/// the sink at the next reconnect tick, while a sink that can never
/// succeed again should disable itself and keep reporting ok from then on
/// (so the scheduler does not retry indefinitely).
pub trait Sink: Send {
    /// Opens the underlying transport/file.
    fn setup(&mut self) -> Result<()>;

    /// Accepts and delivers one payload.
    fn write(&mut self, payload: &Payload) -> Result<()>;

    /// Closes the underlying transport/file.
    fn shutdown(&mut self) -> Result<()>;

    /// Name used in logs and metrics.
    fn name(&self) -> &str;

    /// Whether this sink should still be scheduled. A sink that hit a
    /// fatal error reports `false` here and is skipped thereafter.
    fn enabled(&self) -> bool;

    fn set_enabled(&mut self, value: bool);

    /// Whether the underlying transport/file handle is currently open.
    /// `false` after a transient write failure tears it down, or before
    /// the first successful `setup`; the reconnect watcher calls `setup`
    /// again for every enabled sink reporting `false` here. A sink that is
    /// simply dormant by design (e.g. a split-on-transmission file sink
    /// between transmissions) reports `true`.
    fn is_connected(&self) -> bool;
}

/// Watermark above which an Icecast sink's outbound queue forces a
/// reconnect (kept here even though the Icecast sink itself is a stub, so
/// the reconnect watcher's logic has a concrete constant to reference).
pub const MAX_SHOUT_QUEUELEN: usize = 32768;
