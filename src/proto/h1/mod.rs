//! HTTP/1.x types and the per-connection protocol machine.

pub(crate) mod conn;
pub(crate) mod date;
pub(crate) mod parse;
pub(crate) mod response;

pub(crate) use conn::serve;

use http::HeaderMap;

use crate::error::Parse;
use crate::uri::Uri;

pub(crate) const CRLF: &[u8] = b"\r\n";
pub(crate) const CRLF_CRLF: &[u8] = b"\r\n\r\n";

/// Request methods. Anything ASCII but unrecognized parses as `Unknown`
/// and is answered with `501 Not Implemented` once the rest of the
/// request has been validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Method {
    Get,
    Head,
    Brew,
    Unknown,
}

impl Method {
    pub(crate) fn parse(token: &[u8]) -> Result<Method, Parse> {
        if token.is_empty() || !token.is_ascii() {
            return Err(Parse::Method);
        }
        if token.eq_ignore_ascii_case(b"GET") {
            Ok(Method::Get)
        } else if token.eq_ignore_ascii_case(b"HEAD") {
            Ok(Method::Head)
        } else if token.eq_ignore_ascii_case(b"BREW") {
            Ok(Method::Brew)
        } else {
            Ok(Method::Unknown)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Version {
    H09,
    H10,
    H11,
    Htcpcp10,
}

impl Version {
    /// An empty token is an HTTP/0.9 simple request. ASCII tokens that
    /// look like nothing we speak are unsupported (505); non-ASCII ones
    /// are malformed (400).
    pub(crate) fn parse(token: &[u8]) -> Result<Version, Parse> {
        if token.is_empty() {
            return Ok(Version::H09);
        }
        if !token.is_ascii() {
            return Err(Parse::Version);
        }
        if token.eq_ignore_ascii_case(b"HTTP/1.0") {
            Ok(Version::H10)
        } else if token.eq_ignore_ascii_case(b"HTTP/1.1") {
            Ok(Version::H11)
        } else if token.eq_ignore_ascii_case(b"HTCPCP/1.0") {
            Ok(Version::Htcpcp10)
        } else {
            Err(Parse::VersionUnsupported)
        }
    }

    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Version::H09 => "HTTP/0.9",
            Version::H10 => "HTTP/1.0",
            Version::H11 => "HTTP/1.1",
            Version::Htcpcp10 => "HTCPCP/1.0",
        }
    }

    /// Only HTTP/1.1 defaults to keep-alive when the client is silent.
    pub(crate) fn keep_alive_by_default(&self) -> bool {
        *self == Version::H11
    }

    pub(crate) fn requires_host(&self) -> bool {
        *self == Version::H11
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionType {
    KeepAlive,
    Close,
}

/// Transfer codings seen in the request, as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TransferEncoding(u8);

impl TransferEncoding {
    pub(crate) const IDENTITY: TransferEncoding = TransferEncoding(1);
    pub(crate) const CHUNKED: TransferEncoding = TransferEncoding(1 << 1);

    pub(crate) fn insert(&mut self, other: TransferEncoding) {
        self.0 |= other.0;
    }

    pub(crate) fn contains(&self, other: TransferEncoding) -> bool {
        self.0 & other.0 == other.0
    }

    pub(crate) fn is_identity_only(&self) -> bool {
        *self == TransferEncoding::IDENTITY
    }
}

/// A fully parsed request.
#[derive(Debug)]
pub(crate) struct Request {
    pub(crate) method: Method,
    pub(crate) target: Uri,
    pub(crate) host: Option<String>,
    pub(crate) headers: HeaderMap,
    pub(crate) content_length: u64,
    pub(crate) transfer_encoding: TransferEncoding,
}

/// Per-request connection state. Only ever advances along the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum State {
    Init,
    ParsedFirstLine,
    ParsedHeaders,
    OpeningFile,
    Responding,
    Closing,
}

impl State {
    pub(crate) fn advance(&mut self, next: State) {
        debug_assert!(*self <= next, "HTTP state may not regress: {:?} -> {:?}", self, next);
        *self = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_tokens() {
        assert_eq!(Method::parse(b"GET"), Ok(Method::Get));
        assert_eq!(Method::parse(b"get"), Ok(Method::Get));
        assert_eq!(Method::parse(b"HEAD"), Ok(Method::Head));
        assert_eq!(Method::parse(b"BREW"), Ok(Method::Brew));
        assert_eq!(Method::parse(b"POST"), Ok(Method::Unknown));
        assert_eq!(Method::parse(b""), Err(Parse::Method));
        assert_eq!(Method::parse("GÉT".as_bytes()), Err(Parse::Method));
    }

    #[test]
    fn version_tokens() {
        assert_eq!(Version::parse(b""), Ok(Version::H09));
        assert_eq!(Version::parse(b"HTTP/1.0"), Ok(Version::H10));
        assert_eq!(Version::parse(b"HTTP/1.1"), Ok(Version::H11));
        assert_eq!(Version::parse(b"HTCPCP/1.0"), Ok(Version::Htcpcp10));
        assert_eq!(Version::parse(b"HTTP/1.2"), Err(Parse::VersionUnsupported));
        assert_eq!(Version::parse(b"HTTP/2.0"), Err(Parse::VersionUnsupported));
    }

    #[test]
    fn state_advances_monotonically() {
        let mut state = State::Init;
        state.advance(State::ParsedFirstLine);
        state.advance(State::ParsedHeaders);
        state.advance(State::OpeningFile);
        state.advance(State::Responding);
        state.advance(State::Closing);
        assert_eq!(state, State::Closing);
    }

    #[test]
    #[should_panic]
    #[cfg(debug_assertions)]
    fn state_cannot_regress() {
        let mut state = State::Responding;
        state.advance(State::ParsedHeaders);
    }
}
