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

//! Typed error kinds, matching the taxonomy in the design's error-handling
//! section: configuration errors and input-init failures are fatal at
//! startup; everything else is handled by the owning component and never
//! escalates past it.

use std::fmt;

/// A typed error kind produced anywhere in the core.
#[derive(Debug, thiserror::Error)]
pub enum RfError {
    /// Invalid numeric range, unknown key, or type mismatch in configuration.
    /// Fatal at startup.
    #[error("configuration error: {reason}")]
    Config {
        /// Human-readable description of what was wrong
        reason: String,
    },

    /// An input source failed to reach the `RUNNING` state. Fatal at startup.
    #[error("input '{device}' failed to initialize: {reason}")]
    InputInit {
        /// Name of the device that failed
        device: String,
        /// Human-readable description
        reason: String,
    },

    /// An input source that was running failed. Non-fatal to the process;
    /// the device transitions to `FAILED` and its outputs are disabled.
    #[error("input '{device}' failed at runtime: {reason}")]
    InputRuntime {
        /// Name of the device that failed
        device: String,
        /// Human-readable description
        reason: String,
    },

    /// A sink lost a connection or had a short write. Logged, the sink
    /// handle is torn down, and the reconnect watcher retries later.
    #[error("output '{output}' had a transient failure: {reason}")]
    SinkTransient {
        /// Name of the output that failed
        output: String,
        /// Human-readable description
        reason: String,
    },

    /// A sink failed to set up in a way that will never succeed. The
    /// owning output is disabled permanently.
    #[error("output '{output}' failed permanently: {reason}")]
    SinkFatal {
        /// Name of the output that failed
        output: String,
        /// Human-readable description
        reason: String,
    },

    /// An encoder (e.g. MP3) reported a negative byte count for a batch.
    /// The batch is dropped with a warning; encoder state is kept.
    #[error("encoder error: {reason}")]
    Decoder {
        /// Human-readable description
        reason: String,
    },
}

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, RfError>;

impl RfError {
    /// True for error kinds that must abort the whole process (startup
    /// configuration and input-initialization failures).
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(self, RfError::Config { .. } | RfError::InputInit { .. })
    }
}

/// A lightweight severity classification, used by log call sites that want
/// to pick a log level from an [`RfError`] without a big match statement.
impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Fatal => "fatal",
            Severity::Recoverable => "recoverable",
        };
        f.write_str(s)
    }
}

/// Severity of an [`RfError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Process must exit
    Fatal,
    /// A single component recovers or disables itself
    Recoverable,
}

impl RfError {
    /// Classifies this error's severity
    pub fn severity(&self) -> Severity {
        if self.is_fatal_at_startup() {
            Severity::Fatal
        } else {
            Severity::Recoverable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_and_input_init_are_fatal() {
        let e = RfError::Config {
            reason: "bad".into(),
        };
        assert!(e.is_fatal_at_startup());
        assert_eq!(e.severity(), Severity::Fatal);

        let e = RfError::InputInit {
            device: "rtl0".into(),
            reason: "bad".into(),
        };
        assert!(e.is_fatal_at_startup());
    }

    #[test]
    fn runtime_and_sink_errors_are_recoverable() {
        for e in [
            RfError::InputRuntime {
                device: "d".into(),
                reason: "r".into(),
            },
            RfError::SinkTransient {
                output: "o".into(),
                reason: "r".into(),
            },
            RfError::SinkFatal {
                output: "o".into(),
                reason: "r".into(),
            },
            RfError::Decoder { reason: "r".into() },
        ] {
            assert!(!e.is_fatal_at_startup());
            assert_eq!(e.severity(), Severity::Recoverable);
        }
    }
}
