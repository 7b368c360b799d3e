pub mod http;
pub mod tls;

use crate::error::ParseError;
use crate::models::{CompletedStream, Destination, Protocol};

/// Turns one reassembled stream into at most one destination.
///
/// Addresses are taken from the stream's flow as-is; orienting them towards
/// the client is the dispatcher's job.
pub trait Sniffer: Send + Sync {
    fn protocol(&self) -> Protocol;

    fn sniff(&self, stream: &CompletedStream) -> Result<Option<Destination>, ParseError>;
}

/// Plaintext HTTP: the `Host` of the first request.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpSniffer;

impl Sniffer for HttpSniffer {
    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    fn sniff(&self, stream: &CompletedStream) -> Result<Option<Destination>, ParseError> {
        Ok(http::server_name(&stream.payload)?.map(|host| {
            Destination::new(Protocol::Http, host, stream.key.src_ip, None, stream.end)
        }))
    }
}

/// TLS and SSL handshakes: SNI, or the leaf certificate CN.
#[derive(Debug, Default, Clone, Copy)]
pub struct TlsSniffer;

impl Sniffer for TlsSniffer {
    fn protocol(&self) -> Protocol {
        Protocol::TlsSsl
    }

    fn sniff(&self, stream: &CompletedStream) -> Result<Option<Destination>, ParseError> {
        Ok(tls::server_name(&stream.payload)?.map(|name| {
            Destination::new(
                Protocol::TlsSsl,
                name,
                stream.key.src_ip,
                Some(stream.key.dst_ip),
                stream.end,
            )
        }))
    }
}
