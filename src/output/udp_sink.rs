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
//! Streams float PCM as UDP datagrams, one per write. Connectionless, so
//! there is no persistent handle to reconnect: a send failure is always
//! transient and simply logged.

use std::net::{SocketAddr, UdpSocket};

use crate::error::{RfError, Result};
use crate::output::{Payload, Sink};

pub struct UdpSink {
    name: String,
    target: SocketAddr,
    socket: Option<UdpSocket>,
    enabled: bool,
}

impl UdpSink {
    pub fn new(name: impl Into<String>, target: SocketAddr) -> Self {
        UdpSink { name: name.into(), target, socket: None, enabled: true }
    }
}

impl Sink for UdpSink {
    fn setup(&mut self) -> Result<()> {
        let socket = UdpSocket::bind("0.0.0.0:0").map_err(|e| RfError::SinkFatal {
            output: self.name.clone(),
            reason: format!("cannot bind udp socket: {e}"),
        })?;
        self.socket = Some(socket);
        Ok(())
    }

    fn write(&mut self, payload: &Payload) -> Result<()> {
        let Payload::Pcm { mono, .. } = payload else {
            return Ok(());
        };
        let socket = self.socket.as_ref().ok_or_else(|| RfError::SinkTransient {
            output: self.name.clone(),
            reason: "write before setup".into(),
        })?;
        let mut buf = Vec::with_capacity(mono.len() * 4);
        for &s in mono.iter() {
            buf.extend_from_slice(&s.to_le_bytes());
        }
        socket.send_to(&buf, self.target).map_err(|e| RfError::SinkTransient {
            output: self.name.clone(),
            reason: e.to_string(),
        })?;
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        self.socket = None;
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
        self.socket.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sends_pcm_to_loopback() {
        let recv = UdpSocket::bind("127.0.0.1:0").unwrap();
        recv.set_read_timeout(Some(std::time::Duration::from_millis(500))).unwrap();
        let addr = recv.local_addr().unwrap();

        let mut sink = UdpSink::new("t", addr);
        sink.setup().unwrap();
        let samples = vec![1.0f32, -1.0, 0.5];
        sink.write(&Payload::Pcm { mono: &samples, right: None }).unwrap();

        let mut buf = [0u8; 64];
        let (n, _) = recv.recv_from(&mut buf).unwrap();
        assert_eq!(n, samples.len() * 4);
    }
}
