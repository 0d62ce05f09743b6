//! Incremental request parsing against the connection's receive buffer.
//!
//! The connection layer receives until the relevant delimiter (or bound)
//! is present; these functions then tokenize in place. Zero-copy except
//! for the values a request outlives the buffer with (target, host,
//! header map entries). Failures are `Kind::Parse` errors carrying the
//! response status and close disposition.

use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;

use crate::buffer::Buffer;
use crate::error::Parse;
use crate::headers;
use crate::proto::h1::{Method, Request, TransferEncoding, Version, CRLF, CRLF_CRLF};
use crate::uri::{Uri, UriError};
use crate::Error;

#[derive(Debug)]
pub(crate) struct RequestLine {
    pub(crate) method: Method,
    pub(crate) target: Uri,
    pub(crate) version: Version,
}

fn parse_err<T>(parse: Parse) -> crate::Result<T> {
    Err(Error::new_parse(parse))
}

/// Parses `METHOD target HTTP-VERSION CRLF`. The line must fit in
/// `line_max` bytes, terminator included.
pub(crate) fn request_line(buf: &mut Buffer, line_max: usize) -> crate::Result<RequestLine> {
    match buf.memmem(CRLF) {
        Some(at) if at + CRLF.len() <= line_max => {}
        _ => return parse_err(Parse::UriTooLong),
    }

    let method = {
        let token = buf.token_next(b" \r", true);
        Method::parse(token).map_err(Error::new_parse)?
    };

    if !buf.consume_prefix(b" ") {
        return parse_err(Parse::Uri);
    }

    let target = {
        let token = buf.token_next(b" \r", true);
        if token.is_empty() {
            return parse_err(Parse::Uri);
        }
        Uri::parse(token).map_err(|e| {
            Error::new_parse(match e {
                UriError::BadUri => Parse::Uri,
                UriError::TooLong => Parse::UriTooLong,
            })
        })?
    };

    // Only eat one terminator here; whether headers follow depends on it.
    let version = if buf.consume_prefix(CRLF) {
        Version::H09
    } else {
        if !buf.consume_prefix(b" ") {
            return parse_err(Parse::Version);
        }
        let version = {
            let token = buf.token_next(b"\r", true);
            Version::parse(token).map_err(Error::new_parse)?
        };
        if !buf.consume_prefix(CRLF) {
            return parse_err(Parse::Version);
        }
        version
    };

    // HTCPCP is only spoken over a coffee request.
    if version == Version::Htcpcp10 && method != Method::Brew {
        return parse_err(Parse::Version);
    }

    Ok(RequestLine {
        method,
        target,
        version,
    })
}

/// Parses `name: value CRLF` pairs up to the block terminator. The block
/// must fit in `bound` bytes. Duplicate names accumulate in the map.
pub(crate) fn header_block(buf: &mut Buffer, bound: usize) -> crate::Result<HeaderMap> {
    match buf.memmem(CRLF_CRLF) {
        Some(at) if at + CRLF_CRLF.len() <= bound => {}
        _ => return parse_err(Parse::HeaderTooLarge),
    }

    let mut headers = HeaderMap::new();
    while !buf.readable().is_empty() && buf.readable()[0] != b'\r' {
        let name = {
            let token = buf.token_next(b":\r", true);
            HeaderName::from_bytes(token).map_err(|_| Error::new_parse(Parse::Header))?
        };
        if !buf.consume_prefix(b":") {
            return parse_err(Parse::Header);
        }
        let value = {
            let token = buf.token_next(b"\r", true);
            HeaderValue::from_bytes(trim_ows(token))
                .map_err(|_| Error::new_parse(Parse::Header))?
        };
        if !buf.consume_prefix(CRLF) {
            return parse_err(Parse::Header);
        }
        headers.append(name, value);
    }

    if !buf.consume_prefix(CRLF) {
        return parse_err(Parse::Header);
    }
    Ok(headers)
}

fn trim_ows(value: &[u8]) -> &[u8] {
    let start = value
        .iter()
        .position(|b| *b != b' ' && *b != b'\t')
        .unwrap_or(value.len());
    let end = value
        .iter()
        .rposition(|b| *b != b' ' && *b != b'\t')
        .map(|i| i + 1)
        .unwrap_or(start);
    &value[start..end]
}

pub(crate) struct Interpreted {
    pub(crate) connection: Option<crate::proto::h1::ConnectionType>,
    pub(crate) host: Option<String>,
    pub(crate) transfer_encoding: TransferEncoding,
    pub(crate) content_length: u64,
}

/// Applies the header rules: connection token, single host (required for
/// HTTP/1.1), supported transfer codings, consistent bounded content
/// length (RFC 7230 §3.3.3).
pub(crate) fn interpret(
    headers: &HeaderMap,
    version: Version,
    max_content: u64,
) -> crate::Result<Interpreted> {
    let connection =
        headers::connection_type(headers).map_err(|()| Error::new_parse(Parse::Header))?;

    let host = headers::host(headers).map_err(|()| Error::new_parse(Parse::Header))?;
    if version.requires_host() && host.is_none() {
        return parse_err(Parse::Header);
    }

    let transfer_encoding = headers::transfer_encoding(headers)
        .map_err(|()| Error::new_parse(Parse::TransferEncodingInvalid))?;
    // A non-chunked coding list is invalid in a request; a chunked one is
    // merely unimplemented here.
    if !transfer_encoding.is_identity_only()
        && !transfer_encoding.contains(TransferEncoding::CHUNKED)
    {
        return parse_err(Parse::TransferEncodingInvalid);
    }
    if !transfer_encoding.is_identity_only() {
        return parse_err(Parse::TransferEncodingUnsupported);
    }

    let content_length = match headers::content_length(headers)
        .map_err(|()| Error::new_parse(Parse::ContentLength))?
    {
        Some(n) if n > max_content => return parse_err(Parse::PayloadTooLarge),
        Some(n) => n,
        None => 0,
    };

    Ok(Interpreted {
        connection,
        host,
        transfer_encoding,
        content_length,
    })
}

/// Convenience for assembling the request once every phase has passed.
pub(crate) fn into_request(line: RequestLine, headers: HeaderMap, interp: &Interpreted) -> Request {
    Request {
        method: line.method,
        target: line.target,
        host: interp.host.clone(),
        headers,
        content_length: interp.content_length,
        transfer_encoding: interp.transfer_encoding,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::h1::ConnectionType;

    fn buffer(bytes: &[u8]) -> Buffer {
        let mut buf = Buffer::new(2048, 10240);
        assert!(buf.extend_from_slice(bytes));
        buf
    }

    fn parse_full(raw: &[u8]) -> crate::Result<(RequestLine, HeaderMap, Interpreted)> {
        let mut buf = buffer(raw);
        let line = request_line(&mut buf, 2048)?;
        let headers = if line.version == Version::H09 {
            HeaderMap::new()
        } else if buf.consume_prefix(CRLF) {
            HeaderMap::new()
        } else {
            header_block(&mut buf, 4096)?
        };
        let interp = interpret(&headers, line.version, 10240)?;
        Ok((line, headers, interp))
    }

    fn parse_failure<T>(result: crate::Result<T>) -> Parse {
        match result {
            Ok(_) => panic!("expected a parse error"),
            Err(e) => e.parse().expect("expected a parse error"),
        }
    }

    #[test]
    fn simple_get_is_deterministic() {
        let (line, _, interp) =
            parse_full(b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert_eq!(line.method, Method::Get);
        assert_eq!(line.target.path, "/index.html");
        assert_eq!(line.version, Version::H11);
        assert_eq!(interp.host.as_deref(), Some("x"));
        assert_eq!(interp.connection, None);
        assert_eq!(interp.content_length, 0);
        assert!(interp.transfer_encoding.is_identity_only());
    }

    #[test]
    fn brew_request_parses() {
        let mut buf = buffer(b"BREW / HTCPCP/1.0\r\n\r\n");
        let line = request_line(&mut buf, 2048).unwrap();
        assert_eq!(line.method, Method::Brew);
        assert_eq!(line.version, Version::Htcpcp10);
    }

    #[test]
    fn htcpcp_requires_brew() {
        let mut buf = buffer(b"GET / HTCPCP/1.0\r\n\r\n");
        assert_eq!(parse_failure(request_line(&mut buf, 2048)), Parse::Version);
    }

    #[test]
    fn nul_escape_rejected() {
        let mut buf = buffer(b"GET /%00 HTTP/1.1\r\n");
        assert_eq!(parse_failure(request_line(&mut buf, 2048)), Parse::Uri);
    }

    #[test]
    fn overlong_line_is_uri_too_long() {
        let mut raw = b"GET /".to_vec();
        raw.extend(std::iter::repeat(b'a').take(4096));
        raw.extend_from_slice(b" HTTP/1.1\r\n");
        let mut buf = Buffer::new(2048, 10240);
        assert!(buf.extend_from_slice(&raw));
        assert_eq!(
            parse_failure(request_line(&mut buf, 2048)),
            Parse::UriTooLong
        );
    }

    #[test]
    fn unknown_version_is_unsupported() {
        let mut buf = buffer(b"GET / HTTP/1.2\r\n\r\n");
        assert_eq!(
            parse_failure(request_line(&mut buf, 2048)),
            Parse::VersionUnsupported
        );
    }

    #[test]
    fn version_09_is_bare() {
        let mut buf = buffer(b"GET /\r\n");
        let line = request_line(&mut buf, 2048).unwrap();
        assert_eq!(line.version, Version::H09);
        assert!(buf.is_empty());
    }

    #[test]
    fn missing_host_is_rejected_for_11() {
        assert_eq!(
            parse_failure(parse_full(b"GET / HTTP/1.1\r\n\r\n")),
            Parse::Header
        );
        // ...but not for 1.0.
        assert!(parse_full(b"GET / HTTP/1.0\r\n\r\n").is_ok());
    }

    #[test]
    fn gzip_transfer_encoding_is_invalid() {
        assert_eq!(
            parse_failure(parse_full(
                b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: gzip\r\n\r\n"
            )),
            Parse::TransferEncodingInvalid
        );
    }

    #[test]
    fn chunked_transfer_encoding_is_unsupported() {
        assert_eq!(
            parse_failure(parse_full(
                b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n"
            )),
            Parse::TransferEncodingUnsupported
        );
    }

    #[test]
    fn oversized_content_length_is_too_large() {
        assert_eq!(
            parse_failure(parse_full(
                b"GET / HTTP/1.1\r\nHost: x\r\nContent-Length: 99999\r\n\r\n"
            )),
            Parse::PayloadTooLarge
        );
    }

    #[test]
    fn connection_header_interpreted() {
        let (_, _, interp) =
            parse_full(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n").unwrap();
        assert_eq!(interp.connection, Some(ConnectionType::KeepAlive));
    }

    #[test]
    fn duplicate_headers_accumulate() {
        let (_, headers, _) =
            parse_full(b"GET / HTTP/1.1\r\nHost: x\r\nAccept: a\r\nAccept: b\r\n\r\n").unwrap();
        let values: Vec<_> = headers
            .get_all("accept")
            .into_iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(values, vec!["a", "b"]);
    }

    #[test]
    fn header_without_colon_is_invalid() {
        let mut buf = buffer(b"Garbage\r\n\r\n");
        assert_eq!(parse_failure(header_block(&mut buf, 4096)), Parse::Header);
    }

    #[test]
    fn header_value_ows_is_trimmed() {
        let mut buf = buffer(b"Host:   spaced.example \t\r\n\r\n");
        let headers = header_block(&mut buf, 4096).unwrap();
        assert_eq!(headers.get("host").unwrap(), "spaced.example");
    }
}
