use x509_parser::prelude::*;

use crate::error::ParseError;
use crate::reader::ByteReader;

const CONTENT_HANDSHAKE: u8 = 22;

const HANDSHAKE_CLIENT_HELLO: u8 = 1;
const HANDSHAKE_SERVER_HELLO: u8 = 2;
const HANDSHAKE_CERTIFICATE: u8 = 11;

const EXTENSION_SERVER_NAME: u16 = 0;

/// First record version that is TLS rather than SSL.
const TLS_1_0: u16 = 0x0301;

/// Hello length (3) + version (2) + gmt_unix_time (4) + random (28).
const HELLO_FIXED_HEADER: usize = 3 + 2 + 4 + 28;

struct HandshakeRecord<'a> {
    version: u16,
    handshake: u8,
    body: ByteReader<'a>,
}

/// Extract the server identity from the start of a TLS or SSL stream: the SNI
/// of a Client Hello, or the leaf certificate's subject common name when the
/// stream is the server half of the handshake.
pub fn server_name(buf: &[u8]) -> Result<Option<String>, ParseError> {
    let mut stream = ByteReader::new(buf);
    let Some(mut record) = read_record(&mut stream)? else {
        return Ok(None);
    };

    let name = match record.handshake {
        HANDSHAKE_CLIENT_HELLO => client_hello(record.version, &mut record.body)?,
        HANDSHAKE_SERVER_HELLO => server_hello(record.version, &mut record.body, &mut stream)?,
        HANDSHAKE_CERTIFICATE => certificate(&mut record.body, &mut stream)?,
        other => {
            tracing::trace!(handshake = other, "handshake type carries no server name");
            None
        }
    };
    Ok(name.filter(|n| !n.is_empty()))
}

/// Read a record header and the handshake type that opens its body. Records
/// that are not handshakes yield `None`.
fn read_record<'a>(stream: &mut ByteReader<'a>) -> Result<Option<HandshakeRecord<'a>>, ParseError> {
    let Some((version, mut body)) = read_fragment(stream)? else {
        return Ok(None);
    };
    let handshake = body.read_u8()?;
    Ok(Some(HandshakeRecord {
        version,
        handshake,
        body,
    }))
}

/// Raw body of the next handshake record.
fn read_fragment<'a>(stream: &mut ByteReader<'a>) -> Result<Option<(u16, ByteReader<'a>)>, ParseError> {
    let content_type = stream.read_u8()?;
    let version = stream.read_u16()?;
    let length = stream.read_u16()? as usize;
    if content_type != CONTENT_HANDSHAKE {
        return Ok(None);
    }
    Ok(Some((version, stream.sub_reader(length)?)))
}

fn client_hello(version: u16, body: &mut ByteReader<'_>) -> Result<Option<String>, ParseError> {
    body.skip(HELLO_FIXED_HEADER)?;
    let session_id = body.read_u8()? as usize;
    body.skip(session_id)?;
    let cipher_suites = body.read_u16()? as usize;
    body.skip(cipher_suites)?;
    let compression_methods = body.read_u8()? as usize;
    body.skip(compression_methods)?;

    // SSL has no extensions.
    if version < TLS_1_0 || body.is_empty() {
        return Ok(None);
    }

    let extensions_len = body.read_u16()? as usize;
    let mut consumed = 0;
    while consumed < extensions_len {
        let ext_type = body.read_u16()?;
        let ext_len = body.read_u16()? as usize;
        consumed += 4 + ext_len;

        if ext_type == EXTENSION_SERVER_NAME {
            // list length (2) + name type (1)
            body.skip(3)?;
            let name_len = body.read_u16()? as usize;
            let name = body.read_bytes(name_len)?;
            return Ok(Some(std::str::from_utf8(name)?.to_owned()));
        }
        body.skip(ext_len)?;
    }
    Ok(None)
}

fn server_hello<'a>(
    version: u16,
    record: &mut ByteReader<'a>,
    stream: &mut ByteReader<'a>,
) -> Result<Option<String>, ParseError> {
    let hello_len = record.read_u24()? as usize;
    let mut hello = record.sub_reader(hello_len)?;
    hello.skip(HELLO_FIXED_HEADER - 3)?;
    let session_id = hello.read_u8()? as usize;
    hello.skip(session_id)?;

    if version < TLS_1_0 {
        // SSL 3.0 sends the certificate inline, right behind the hello.
        hello.skip(2)?;
        let compression = hello.read_u8()?;
        if compression != 0 {
            tracing::warn!(compression, "unsupported ssl compression method, not reading certificate");
            return Ok(None);
        }
        if record.read_u8()? != HANDSHAKE_CERTIFICATE {
            return Ok(None);
        }
        return certificate(record, stream);
    }

    // TLS 1.2 servers usually coalesce the Certificate into the same record.
    if !record.is_empty() {
        if record.read_u8()? != HANDSHAKE_CERTIFICATE {
            return Ok(None);
        }
        return certificate(record, stream);
    }

    match read_record(stream)? {
        Some(mut next) if next.handshake == HANDSHAKE_CERTIFICATE => certificate(&mut next.body, stream),
        _ => Ok(None),
    }
}

/// Read a Certificate message positioned right after its handshake type. A
/// message longer than its record continues in the following handshake
/// records of `stream`.
fn certificate<'a>(body: &mut ByteReader<'a>, stream: &mut ByteReader<'a>) -> Result<Option<String>, ParseError> {
    let message_len = body.read_u24()? as usize;
    if body.remaining() >= message_len {
        return certificate_chain(&mut body.sub_reader(message_len)?);
    }

    let mut message = body.read_bytes(body.remaining())?.to_vec();
    while message.len() < message_len {
        match read_fragment(stream) {
            Ok(Some((_, mut fragment))) => message.extend_from_slice(fragment.read_bytes(fragment.remaining())?),
            // Work with what arrived; the chain walk reports the shortfall.
            Ok(None) | Err(_) => break,
        }
    }
    message.truncate(message_len);
    certificate_chain(&mut ByteReader::new(&message))
}

/// Return the subject CN of the first certificate that decodes. A chain cut
/// short still yields a leaf that arrived whole.
fn certificate_chain(message: &mut ByteReader<'_>) -> Result<Option<String>, ParseError> {
    let chain_len = message.read_u24()? as usize;
    let available = chain_len.min(message.remaining());
    let mut chain = message.sub_reader(available)?;

    while !chain.is_empty() {
        let cert_len = chain.read_u24()? as usize;
        let der = chain.read_bytes(cert_len)?;
        match X509Certificate::from_der(der) {
            Ok((_, cert)) => return Ok(common_name(&cert)),
            Err(e) => {
                tracing::debug!(error = %e, len = cert_len, "skipping undecodable certificate");
            }
        }
    }
    // Fails with Truncated when part of the chain never arrived.
    message.skip(chain_len - available)?;
    Ok(None)
}

fn common_name(cert: &X509Certificate<'_>) -> Option<String> {
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(|s| s.to_string())
}
