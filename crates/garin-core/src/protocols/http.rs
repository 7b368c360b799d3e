use http::uri::Authority;

use crate::error::ParseError;

const MAX_HEADERS: usize = 64;
/// Room for the retry after a header block overflowed `MAX_HEADERS`.
const MAX_HEADERS_RETRY: usize = 1024;

/// Host of the first request on a plaintext stream, without its port.
///
/// Only a complete request head counts. A response, a partial head or a
/// request without `Host` is a miss, not an error; bytes that cannot be an
/// HTTP/1.x request at all come back as `ParseError::Http`.
pub fn server_name(buf: &[u8]) -> Result<Option<String>, ParseError> {
    if buf.starts_with(b"HTTP/") {
        return Ok(None);
    }

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let host = match request_host(buf, &mut headers) {
        Err(httparse::Error::TooManyHeaders) => {
            let mut headers = vec![httparse::EMPTY_HEADER; MAX_HEADERS_RETRY];
            match request_host(buf, &mut headers) {
                Err(httparse::Error::TooManyHeaders) => return Ok(None),
                other => other?,
            }
        }
        other => other?,
    };

    Ok(host.filter(|h| !h.is_empty()).map(|h| strip_port(&h)))
}

fn request_host<'b>(buf: &'b [u8], headers: &mut [httparse::Header<'b>]) -> Result<Option<String>, httparse::Error> {
    let mut req = httparse::Request::new(headers);
    if req.parse(buf)?.is_partial() {
        return Ok(None);
    }

    Ok(req
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("host"))
        .map(|h| String::from_utf8_lossy(h.value).trim().to_string()))
}

fn strip_port(host: &str) -> String {
    // Authority::host keeps IPv6 brackets and drops any userinfo.
    match host.parse::<Authority>() {
        Ok(authority) => authority.host().to_string(),
        Err(_) => host.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_header() {
        let buf = b"GET / HTTP/1.1\r\nHost: example.org\r\n\r\n";
        assert_eq!(server_name(buf).unwrap().as_deref(), Some("example.org"));
    }

    #[test]
    fn test_port_is_stripped() {
        let buf = b"POST /api HTTP/1.1\r\nUser-Agent: t\r\nhost: example.org:8080\r\n\r\nbody";
        assert_eq!(server_name(buf).unwrap().as_deref(), Some("example.org"));
    }

    #[test]
    fn test_ipv6_literal_keeps_brackets() {
        let buf = b"GET / HTTP/1.1\r\nHost: [::1]:8080\r\n\r\n";
        assert_eq!(server_name(buf).unwrap().as_deref(), Some("[::1]"));
        let buf = b"GET / HTTP/1.1\r\nHost: [::1]\r\n\r\n";
        assert_eq!(server_name(buf).unwrap().as_deref(), Some("[::1]"));
    }

    #[test]
    fn test_first_request_wins_on_keepalive() {
        let buf = b"GET /a HTTP/1.1\r\nHost: one.example\r\n\r\nGET /b HTTP/1.1\r\nHost: two.example\r\n\r\n";
        assert_eq!(server_name(buf).unwrap().as_deref(), Some("one.example"));
    }

    #[test]
    fn test_missing_or_empty_host_is_miss() {
        assert_eq!(server_name(b"GET / HTTP/1.0\r\n\r\n").unwrap(), None);
        assert_eq!(server_name(b"GET / HTTP/1.1\r\nHost: \r\n\r\n").unwrap(), None);
    }

    #[test]
    fn test_partial_head_is_miss() {
        assert_eq!(server_name(b"GET / HTTP/1.1\r\nHost: exam").unwrap(), None);
        assert_eq!(server_name(b"").unwrap(), None);
    }

    fn request_with_headers(extra: usize) -> Vec<u8> {
        let mut buf = b"GET / HTTP/1.1\r\n".to_vec();
        for i in 0..extra {
            buf.extend_from_slice(format!("X-Trace-{i}: {i}\r\n").as_bytes());
        }
        buf.extend_from_slice(b"Host: crowded.example\r\n\r\n");
        buf
    }

    #[test]
    fn test_large_header_block_still_finds_host() {
        let buf = request_with_headers(MAX_HEADERS + 36);
        assert_eq!(server_name(&buf).unwrap().as_deref(), Some("crowded.example"));

        let buf = request_with_headers(MAX_HEADERS_RETRY);
        assert_eq!(server_name(&buf).unwrap(), None);
    }

    #[test]
    fn test_response_is_miss() {
        assert_eq!(server_name(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").unwrap(), None);
    }

    #[test]
    fn test_binary_is_error() {
        assert!(server_name(&[0x16, 0x03, 0x01, 0x00, 0x05, 0x01]).is_err());
    }
}
