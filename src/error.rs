//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

use http::StatusCode;

/// Result type returned from methods that can have `short_circuit::Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur while driving I/O or handling HTTP
/// streams.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    /// The submission queue stayed full after the bounded retry loop.
    SubmitFailed,
    /// `openat` under the web root failed with `EACCES`/`ENOENT`/`ELOOP`.
    NotFound,
    /// The peer closed the stream (`recv`/`read` returned 0, or the
    /// connection was reset).
    Eof,
    /// The connection's idle timeout fired.
    TimedOut,
    /// The kernel or back-end lacks a required capability.
    Unsupported(&'static str),
    /// An unexpected `errno` from a syscall or completion.
    Io,
    /// Error binding or configuring the listening socket.
    Listen,
    /// An HTTP request failed to parse.
    Parse(Parse),
}

/// HTTP request parse failures, each mapped to a response status and a
/// close disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Parse {
    Method,
    Uri,
    UriTooLong,
    Version,
    VersionUnsupported,
    Header,
    HeaderTooLarge,
    TransferEncodingInvalid,
    TransferEncodingUnsupported,
    ContentLength,
    PayloadTooLarge,
}

impl Parse {
    pub(crate) fn status(&self) -> StatusCode {
        match *self {
            Parse::Method
            | Parse::Uri
            | Parse::Version
            | Parse::Header
            | Parse::TransferEncodingInvalid
            | Parse::ContentLength => StatusCode::BAD_REQUEST,
            Parse::UriTooLong => StatusCode::URI_TOO_LONG,
            Parse::VersionUnsupported => StatusCode::HTTP_VERSION_NOT_SUPPORTED,
            Parse::HeaderTooLarge => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            Parse::TransferEncodingUnsupported => StatusCode::NOT_IMPLEMENTED,
            Parse::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    /// Whether the error forces close-after-send regardless of the
    /// connection's prior keep-alive state.
    pub(crate) fn must_close(&self) -> bool {
        // An unsupported version leaves the connection in a parseable
        // state; everything else may have desynchronized framing.
        !matches!(*self, Parse::VersionUnsupported)
    }
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn new_submit_failed() -> Error {
        Error::new(Kind::SubmitFailed)
    }

    pub(crate) fn new_not_found() -> Error {
        Error::new(Kind::NotFound)
    }

    pub(crate) fn new_eof() -> Error {
        Error::new(Kind::Eof)
    }

    pub(crate) fn new_timed_out() -> Error {
        Error::new(Kind::TimedOut)
    }

    pub(crate) fn new_unsupported(what: &'static str) -> Error {
        Error::new(Kind::Unsupported(what))
    }

    pub(crate) fn new_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_errno(errno: i32) -> Error {
        Error::new_io(std::io::Error::from_raw_os_error(errno))
    }

    pub(crate) fn new_listen(cause: std::io::Error) -> Error {
        Error::new(Kind::Listen).with(cause)
    }

    pub(crate) fn new_parse(parse: Parse) -> Error {
        Error::new(Kind::Parse(parse))
    }

    /// Returns true if the stream reached EOF.
    pub fn is_eof(&self) -> bool {
        matches!(self.inner.kind, Kind::Eof)
    }

    /// Returns true if the idle timeout fired.
    pub fn is_timed_out(&self) -> bool {
        matches!(self.inner.kind, Kind::TimedOut)
    }

    /// Returns true if a file was not found under the web root.
    pub fn is_not_found(&self) -> bool {
        matches!(self.inner.kind, Kind::NotFound)
    }

    /// Returns true if the submission queue could not accept the operation.
    pub fn is_submit_failed(&self) -> bool {
        matches!(self.inner.kind, Kind::SubmitFailed)
    }

    /// Returns true if this was an HTTP parse error.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    pub(crate) fn parse(&self) -> Option<Parse> {
        match self.inner.kind {
            Kind::Parse(p) => Some(p),
            _ => None,
        }
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::SubmitFailed => "submission queue full",
            Kind::NotFound => "file not found",
            Kind::Eof => "end of stream",
            Kind::TimedOut => "connection idle timeout",
            Kind::Unsupported(what) => what,
            Kind::Io => "I/O error",
            Kind::Listen => "error binding listener",
            Kind::Parse(Parse::Method) => "invalid HTTP method",
            Kind::Parse(Parse::Uri) => "invalid request target",
            Kind::Parse(Parse::UriTooLong) => "request line too long",
            Kind::Parse(Parse::Version) => "invalid HTTP version",
            Kind::Parse(Parse::VersionUnsupported) => "unsupported HTTP version",
            Kind::Parse(Parse::Header) => "invalid header",
            Kind::Parse(Parse::HeaderTooLarge) => "header block too large",
            Kind::Parse(Parse::TransferEncodingInvalid) => "invalid transfer encoding",
            Kind::Parse(Parse::TransferEncodingUnsupported) => "unsupported transfer encoding",
            Kind::Parse(Parse::ContentLength) => "invalid content length",
            Kind::Parse(Parse::PayloadTooLarge) => "request body too large",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("short_circuit::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref cause) = self.inner.cause {
            write!(f, "{}: {}", self.description(), cause)
        } else {
            f.write_str(self.description())
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::new_io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_size_of() {
        assert_eq!(
            std::mem::size_of::<Error>(),
            std::mem::size_of::<usize>()
        );
    }

    #[test]
    fn parse_status_mapping() {
        assert_eq!(Parse::Method.status(), StatusCode::BAD_REQUEST);
        assert_eq!(Parse::UriTooLong.status(), StatusCode::URI_TOO_LONG);
        assert_eq!(
            Parse::HeaderTooLarge.status(),
            StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
        );
        assert_eq!(Parse::PayloadTooLarge.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(
            Parse::VersionUnsupported.status(),
            StatusCode::HTTP_VERSION_NOT_SUPPORTED
        );
        assert!(!Parse::VersionUnsupported.must_close());
        assert!(Parse::Header.must_close());
    }
}
