// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Blocking TCP client for the channel broker.

use super::protocol::{BrokerReply, BrokerRequest};
use crate::hash::ContentHash;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

/// Largest reply body we will read; brokers never send more than a few
/// hundred bytes.
const MAX_REPLY_LEN: u32 = 64 * 1024;

/// Client error types.
#[derive(Debug)]
pub enum BrokerError {
    /// Connection failed.
    ConnectionFailed(String),

    /// Connection closed unexpectedly.
    ConnectionClosed,

    /// I/O error.
    Io(io::Error),

    /// Malformed or unexpected reply.
    Protocol(String),

    /// Broker returned an error.
    Server { code: u32, message: String },

    /// Not connected.
    NotConnected,
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionFailed(s) => write!(f, "Connection failed: {}", s),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Protocol(s) => write!(f, "Protocol error: {}", s),
            Self::Server { code, message } => write!(f, "Broker error {}: {}", code, message),
            Self::NotConnected => write!(f, "Not connected to broker"),
        }
    }
}

impl std::error::Error for BrokerError {}

impl From<io::Error> for BrokerError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// What a successful registration hands back.
#[derive(Debug, Clone)]
pub struct ChannelRegistration {
    /// Segment name the broker expects the producer to use
    pub shm_name: String,
    /// Secret to store in the header
    pub secret: u64,
}

/// What discovery hands back.
#[derive(Debug, Clone)]
pub struct ChannelLocation {
    /// Segment name to open
    pub shm_name: String,
    /// Total segment size
    pub size: u64,
    /// Secret to present at attach
    pub secret: u64,
}

/// Request/reply client for the local broker.
///
/// One request in flight at a time; replies are matched by the echoed
/// request id, and an id mismatch is treated as a protocol error rather
/// than skipped.
pub struct BrokerClient {
    server_addr: SocketAddr,
    timeout: Duration,
    stream: Option<TcpStream>,
    next_request_id: u64,
}

impl BrokerClient {
    /// New client for the broker at `server_addr`.
    #[must_use]
    pub fn new(server_addr: SocketAddr, timeout: Duration) -> Self {
        Self {
            server_addr,
            timeout,
            stream: None,
            next_request_id: 1,
        }
    }

    /// Connect to the broker.
    pub fn connect(&mut self) -> Result<(), BrokerError> {
        let stream = TcpStream::connect_timeout(&self.server_addr, self.timeout)
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;

        stream.set_nodelay(true).ok();
        stream.set_read_timeout(Some(self.timeout)).ok();
        stream.set_write_timeout(Some(self.timeout)).ok();

        self.stream = Some(stream);
        log::debug!("[BROKER] connected to {}", self.server_addr);
        Ok(())
    }

    /// Check whether the client holds a connection.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Register a channel: name -> (segment, secret).
    pub fn register_channel(
        &mut self,
        name: &str,
        size: u64,
        flex_size: u64,
        datablock_schema_hash: &ContentHash,
        flexzone_schema_hash: &ContentHash,
    ) -> Result<ChannelRegistration, BrokerError> {
        let request = BrokerRequest::Register {
            name: name.to_string(),
            size,
            flex_size,
            policy: "ring_buffer".to_string(),
            datablock_schema_hash: *datablock_schema_hash.as_bytes(),
            flexzone_schema_hash: *flexzone_schema_hash.as_bytes(),
        };

        match self.roundtrip(&request)? {
            BrokerReply::Registered {
                shm_name, secret, ..
            } => Ok(ChannelRegistration { shm_name, secret }),
            other => Err(unexpected(&other)),
        }
    }

    /// Look up a channel by name.
    pub fn discover_channel(&mut self, name: &str) -> Result<ChannelLocation, BrokerError> {
        let request = BrokerRequest::Discover {
            name: name.to_string(),
        };

        match self.roundtrip(&request)? {
            BrokerReply::Discovered {
                shm_name,
                size,
                secret,
                ..
            } => Ok(ChannelLocation {
                shm_name,
                size,
                secret,
            }),
            other => Err(unexpected(&other)),
        }
    }

    /// Drop a registration.
    pub fn unregister_channel(&mut self, name: &str) -> Result<(), BrokerError> {
        let request = BrokerRequest::Unregister {
            name: name.to_string(),
        };

        match self.roundtrip(&request)? {
            BrokerReply::Unregistered { .. } => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Send one request and read its reply.
    fn roundtrip(&mut self, request: &BrokerRequest) -> Result<BrokerReply, BrokerError> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let stream = self.stream.as_mut().ok_or(BrokerError::NotConnected)?;

        let encoded = request.encode(request_id);
        stream.write_all(&encoded)?;

        let mut len_buf = [0u8; 4];
        if let Err(e) = stream.read_exact(&mut len_buf) {
            self.stream = None;
            if e.kind() == io::ErrorKind::UnexpectedEof {
                return Err(BrokerError::ConnectionClosed);
            }
            return Err(e.into());
        }
        let len = u32::from_be_bytes(len_buf);
        if len == 0 || len > MAX_REPLY_LEN {
            self.stream = None;
            return Err(BrokerError::Protocol(format!("Implausible reply length {len}")));
        }

        let mut body = vec![0u8; len as usize];
        let stream = self.stream.as_mut().ok_or(BrokerError::NotConnected)?;
        if let Err(e) = stream.read_exact(&mut body) {
            self.stream = None;
            return Err(e.into());
        }

        let reply = BrokerReply::decode(&body)
            .map_err(|e| BrokerError::Protocol(e.to_string()))?;

        if reply.request_id() != request_id {
            return Err(BrokerError::Protocol(format!(
                "Reply id {} does not match request id {request_id}",
                reply.request_id()
            )));
        }

        if let BrokerReply::Error { code, message, .. } = reply {
            return Err(BrokerError::Server { code, message });
        }

        Ok(reply)
    }
}

fn unexpected(reply: &BrokerReply) -> BrokerError {
    BrokerError::Protocol(format!("Unexpected reply kind: {reply:?}"))
}
