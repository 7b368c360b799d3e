use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::error::UnknownProtocol;

// ---------------------------------------------------------------------------
// Network primitives
// ---------------------------------------------------------------------------

/// One direction of a TCP connection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl FlowKey {
    pub fn new(src_ip: IpAddr, src_port: u16, dst_ip: IpAddr, dst_port: u16) -> Self {
        Self {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
        }
    }

    pub fn reversed(&self) -> Self {
        Self {
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            src_port: self.dst_port,
            dst_port: self.src_port,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}",
            std::net::SocketAddr::new(self.src_ip, self.src_port),
            std::net::SocketAddr::new(self.dst_ip, self.dst_port),
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentFlags {
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
}

/// A single TCP segment as delivered by a capture source.
#[derive(Debug, Clone)]
pub struct Segment {
    pub key: FlowKey,
    pub seq: u32,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub flags: SegmentFlags,
}

// ---------------------------------------------------------------------------
// Streams: reassembled byte sequences handed to the parsers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    /// FIN reached or RST seen.
    Closed,
    /// No activity before the flush deadline.
    Idle,
    /// Forced at shutdown.
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct CompletedStream {
    pub key: FlowKey,
    pub payload: Vec<u8>,
    pub packets: u64,
    pub bytes: u64,
    pub out_of_order: u64,
    pub skipped: u64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub saw_start: bool,
    pub saw_end: bool,
    pub reason: CompletionReason,
}

// ---------------------------------------------------------------------------
// Destinations: the extracted server identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Protocol {
    #[serde(rename = "HTTP")]
    Http,
    #[serde(rename = "TLS/SSL")]
    TlsSsl,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "HTTP",
            Protocol::TlsSsl => "TLS/SSL",
        }
    }
}

impl FromStr for Protocol {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HTTP" => Ok(Protocol::Http),
            "TLS/SSL" => Ok(Protocol::TlsSsl),
            other => Err(UnknownProtocol(other.to_string())),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Destination {
    pub protocol: Protocol,
    pub source_ip: IpAddr,
    pub destination_ip: Option<IpAddr>,
    pub server_name: String,
    pub timestamp: DateTime<Utc>,
}

impl Destination {
    pub fn new(
        protocol: Protocol,
        server_name: impl Into<String>,
        source_ip: IpAddr,
        destination_ip: Option<IpAddr>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            protocol,
            source_ip,
            destination_ip,
            server_name: server_name.into(),
            timestamp,
        }
    }

    /// Hex MD5 over source, destination, server name and protocol. Never
    /// includes the timestamp.
    pub fn fingerprint(&self) -> String {
        let source_ip = self.source_ip.to_string();
        let destination_ip = self
            .destination_ip
            .map(|ip| ip.to_string())
            .unwrap_or_default();

        let mut hasher = Md5::new();
        for field in [
            source_ip.as_str(),
            destination_ip.as_str(),
            self.server_name.as_str(),
            self.protocol.as_str(),
        ] {
            hasher.update(field.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }
}
