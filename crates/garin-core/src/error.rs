use thiserror::Error;

/// A stream whose bytes violate the framing a parser expects.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("buffer exhausted at offset {offset}: needed {needed} bytes, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("server name is not valid UTF-8")]
    InvalidServerName(#[from] std::str::Utf8Error),

    #[error("malformed http request: {0}")]
    Http(#[from] httparse::Error),
}

impl ParseError {
    /// Truncation is what a short capture or a stream cut by gap-skip looks
    /// like. Everything else points at bytes that were never the protocol we
    /// guessed from the port.
    pub fn is_benign(&self) -> bool {
        matches!(self, ParseError::Truncated { .. })
    }
}

#[derive(Debug, Error)]
#[error("unknown protocol tag {0:?}")]
pub struct UnknownProtocol(pub String);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sql backend: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("document backend i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("document encoding: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("store is closed")]
    Closed,
}

/// A captured frame that could not be decoded down to its transport layer.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unsupported link type {0}")]
    UnsupportedLinktype(i32),

    #[error("frame of {len} bytes is shorter than its {needed}-byte link header")]
    ShortFrame { len: usize, needed: usize },

    #[error("malformed packet: {0}")]
    Malformed(String),
}
