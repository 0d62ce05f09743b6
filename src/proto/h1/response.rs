//! Response assembly.
//!
//! The status line and headers accumulate in a pre-body buffer; the body
//! is tagged as absent, an inline slice, or a file descriptor. The
//! connection layer combines `{pre-body, CRLF, body}` into one vectored
//! send. A response is frozen once those bytes hit the socket; nothing
//! here mutates it afterwards.

use std::mem;
use std::os::unix::io::RawFd;

use bytes::Bytes;
use http::StatusCode;

use crate::buffer::Buffer;
use crate::config::{PRE_BUF_INIT_CAP, PRE_BUF_MAX_CAP};
use crate::io::Metadata;
use crate::mime;
use crate::proto::h1::{date, ConnectionType, Version, CRLF};
use crate::rt::Handle;

pub(crate) enum BodyTarget {
    None,
    Inline(Bytes),
    File { fd: RawFd, len: u64 },
}

pub(crate) struct Response {
    pub(crate) status: StatusCode,
    pub(crate) content_type: Option<&'static str>,
    pub(crate) content_length: Option<u64>,
    pub(crate) pre_buf: Buffer,
    pub(crate) body: BodyTarget,
}

impl Response {
    pub(crate) fn new() -> Response {
        Response {
            status: StatusCode::OK,
            content_type: None,
            content_length: None,
            pre_buf: Buffer::new(PRE_BUF_INIT_CAP, PRE_BUF_MAX_CAP),
            body: BodyTarget::None,
        }
    }

    /// Returns the response to its initial state, closing a file target.
    pub(crate) async fn reset(&mut self, handle: &Handle) {
        self.status = StatusCode::OK;
        self.content_type = None;
        self.content_length = None;
        self.pre_buf.clear();
        if let BodyTarget::File { fd, .. } = mem::replace(&mut self.body, BodyTarget::None) {
            let _ = handle.close_fd(fd).await;
        }
    }

    /// Writes the status line and the mandatory default headers. Returns
    /// false if the pre-body buffer overflows.
    pub(crate) fn prep_start(&mut self, version: Version, connection: ConnectionType) -> bool {
        let buf = &mut self.pre_buf;

        let mut ok = buf.extend_from_slice(version.as_str().as_bytes())
            && buf.extend_from_slice(b" ")
            && buf.extend_from_slice(self.status.as_str().as_bytes())
            && buf.extend_from_slice(b" ")
            && buf.extend_from_slice(self.status.canonical_reason().unwrap_or("Unknown").as_bytes())
            && buf.extend_from_slice(CRLF);

        ok = ok
            && buf.extend_from_slice(b"Date: ")
            && date::extend(buf)
            && buf.extend_from_slice(CRLF);

        ok = ok
            && buf.extend_from_slice(b"Connection: ")
            && buf.extend_from_slice(match connection {
                ConnectionType::KeepAlive => b"Keep-Alive".as_slice(),
                ConnectionType::Close => b"Close".as_slice(),
            })
            && buf.extend_from_slice(CRLF);

        if let Some(len) = self.content_length {
            let mut digits = itoa::Buffer::new();
            ok = ok
                && buf.extend_from_slice(b"Content-Length: ")
                && buf.extend_from_slice(digits.format(len).as_bytes())
                && buf.extend_from_slice(CRLF);
        }
        if let Some(content_type) = self.content_type {
            ok = ok
                && buf.extend_from_slice(b"Content-Type: ")
                && buf.extend_from_slice(content_type.as_bytes())
                && buf.extend_from_slice(CRLF);
        }

        ok
    }

    /// Validators for file responses: `ETag` from `(inode, mtime, size)`
    /// and a cached `Last-Modified`.
    pub(crate) fn prep_file_headers(&mut self, meta: &Metadata) -> bool {
        let etag = format!(
            "ETag: \"{:x}X{:x}X{:x}\"\r\n",
            meta.ino, meta.mtime, meta.size
        );
        let buf = &mut self.pre_buf;
        buf.extend_from_slice(etag.as_bytes())
            && buf.extend_from_slice(b"Last-Modified: ")
            && date::extend_last_modified(meta.mtime, buf)
            && buf.extend_from_slice(CRLF)
    }

    /// Installs the generated error page as the body and sets the derived
    /// headers. The page is capped at `max_len`.
    pub(crate) fn set_error_page(&mut self, status: StatusCode, version: Version, max_len: usize) {
        self.status = status;
        let body = error_body(status, version, max_len);
        self.content_length = Some(body.len() as u64);
        self.content_type = Some(mime::TEXT_HTML);
        self.body = BodyTarget::Inline(body);
    }
}

fn error_body(status: StatusCode, version: Version, max_len: usize) -> Bytes {
    let reason = status.canonical_reason().unwrap_or("Unknown");
    let mut page = format!(
        "<!DOCTYPE html>\n\
         <html>\n\
         <head>\n\
         <title>Error: {code}</title>\n\
         </head>\n\
         <body>\n\
         <h1>{version} Error {code}</h1>\n\
         <p>{reason}.</p>\n\
         </body>\n\
         </html>\n",
        code = status.as_str(),
        version = version.as_str(),
        reason = reason,
    );
    page.truncate(max_len);
    Bytes::from(page)
}
