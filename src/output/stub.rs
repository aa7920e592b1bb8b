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
//! Trait-conformant placeholders for sinks whose transport is an
//! external collaborator (Icecast/Shout streaming, PulseAudio). A real
//! deployment links a concrete implementation in their place; these
//! exist so the scheduler can address every configured output kind
//! uniformly and so the core can be exercised end-to-end in tests.

use crate::error::{RfError, Result};
use crate::output::{Payload, Sink};

/// Which external transport this stub represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalKind {
    Icecast,
    Pulse,
}

pub struct ExternalStub {
    name: String,
    kind: ExternalKind,
    enabled: bool,
}

impl ExternalStub {
    pub fn new(name: impl Into<String>, kind: ExternalKind) -> Self {
        ExternalStub { name: name.into(), kind, enabled: true }
    }
}

impl Sink for ExternalStub {
    fn setup(&mut self) -> Result<()> {
        Err(RfError::SinkFatal {
            output: self.name.clone(),
            reason: format!("{:?} transport is not linked into this build", self.kind),
        })
    }

    fn write(&mut self, _payload: &Payload) -> Result<()> {
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
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
        false
    }
}
