//! Header interpretation helpers.
//!
//! Raw headers live in a case-insensitive multi-map; duplicates are kept
//! as separate values and merged (comma semantics per RFC 7230) at
//! interpretation time. Each helper returns `Err(())` for values the
//! request must be rejected over.

use http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::HeaderMap;

use crate::proto::h1::{ConnectionType, TransferEncoding};

/// `Connection` accepts exactly one of `keep-alive` or `close`. Absence is
/// `Ok(None)`; anything else, including merged duplicates, is invalid.
pub(crate) fn connection_type(headers: &HeaderMap) -> Result<Option<ConnectionType>, ()> {
    let mut values = headers.get_all(CONNECTION).into_iter();
    let first = match values.next() {
        Some(v) => v,
        None => return Ok(None),
    };
    if values.next().is_some() {
        return Err(());
    }

    let value = first.to_str().map_err(|_| ())?.trim();
    if value.eq_ignore_ascii_case("keep-alive") {
        Ok(Some(ConnectionType::KeepAlive))
    } else if value.eq_ignore_ascii_case("close") {
        Ok(Some(ConnectionType::Close))
    } else {
        Err(())
    }
}

/// `Host` must be a single value; RFC 7230 §5.4 rejects lists.
pub(crate) fn host(headers: &HeaderMap) -> Result<Option<String>, ()> {
    let mut values = headers.get_all(HOST).into_iter();
    let first = match values.next() {
        Some(v) => v,
        None => return Ok(None),
    };
    if values.next().is_some() {
        return Err(());
    }

    let value = first.to_str().map_err(|_| ())?;
    if value.contains(',') {
        return Err(());
    }
    Ok(Some(value.to_owned()))
}

/// Folds every `Content-Length` value; repeats must agree (RFC 7230
/// §3.3.3). Absence is `Ok(None)`.
pub(crate) fn content_length(headers: &HeaderMap) -> Result<Option<u64>, ()> {
    let mut folded: Option<u64> = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let n: u64 = value
            .to_str()
            .map_err(|_| ())?
            .trim()
            .parse()
            .map_err(|_| ())?;
        match folded {
            Some(prev) if prev != n => return Err(()),
            _ => folded = Some(n),
        }
    }
    Ok(folded)
}

/// Collects the transfer-coding bitmask. Unknown codings are invalid.
pub(crate) fn transfer_encoding(headers: &HeaderMap) -> Result<TransferEncoding, ()> {
    let mut encodings = TransferEncoding::IDENTITY;
    for value in headers.get_all(TRANSFER_ENCODING) {
        for coding in value.to_str().map_err(|_| ())?.split(',') {
            let coding = coding.trim();
            if coding.eq_ignore_ascii_case("identity") {
                encodings.insert(TransferEncoding::IDENTITY);
            } else if coding.eq_ignore_ascii_case("chunked") {
                encodings.insert(TransferEncoding::CHUNKED);
            } else {
                return Err(());
            }
        }
    }
    Ok(encodings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::HeaderValue;

    fn map(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.append(
                http::header::HeaderName::from_static(name),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        headers
    }

    #[test]
    fn connection_tokens() {
        assert_eq!(
            connection_type(&map(&[("connection", "keep-alive")])),
            Ok(Some(ConnectionType::KeepAlive))
        );
        assert_eq!(
            connection_type(&map(&[("connection", "Close")])),
            Ok(Some(ConnectionType::Close))
        );
        assert_eq!(connection_type(&map(&[])), Ok(None));
        assert_eq!(connection_type(&map(&[("connection", "upgrade")])), Err(()));
        assert_eq!(
            connection_type(&map(&[("connection", "close"), ("connection", "close")])),
            Err(())
        );
    }

    #[test]
    fn host_must_be_single() {
        assert_eq!(
            host(&map(&[("host", "example.com")])),
            Ok(Some("example.com".to_owned()))
        );
        assert_eq!(host(&map(&[("host", "a,b")])), Err(()));
        assert_eq!(host(&map(&[("host", "a"), ("host", "b")])), Err(()));
        assert_eq!(host(&map(&[])), Ok(None));
    }

    #[test]
    fn content_length_folding() {
        assert_eq!(content_length(&map(&[("content-length", "42")])), Ok(Some(42)));
        assert_eq!(
            content_length(&map(&[("content-length", "42"), ("content-length", "42")])),
            Ok(Some(42))
        );
        assert_eq!(
            content_length(&map(&[("content-length", "42"), ("content-length", "43")])),
            Err(())
        );
        assert_eq!(content_length(&map(&[("content-length", "-1")])), Err(()));
        assert_eq!(content_length(&map(&[("content-length", "x")])), Err(()));
        assert_eq!(content_length(&map(&[])), Ok(None));
    }

    #[test]
    fn transfer_encodings() {
        assert!(transfer_encoding(&map(&[])).unwrap().is_identity_only());
        assert!(transfer_encoding(&map(&[("transfer-encoding", "identity")]))
            .unwrap()
            .is_identity_only());
        let te = transfer_encoding(&map(&[("transfer-encoding", "identity, chunked")])).unwrap();
        assert!(te.contains(TransferEncoding::CHUNKED));
        assert!(!te.is_identity_only());
        assert_eq!(transfer_encoding(&map(&[("transfer-encoding", "gzip")])), Err(()));
    }
}
