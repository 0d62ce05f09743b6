//! The per-connection HTTP driver: request/response round-trips, the
//! keep-alive loop, error responses, and static-file serving.

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use http::StatusCode;
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::error::Parse;
use crate::mime;
use crate::proto::h1::response::{BodyTarget, Response};
use crate::proto::h1::{parse, ConnectionType, Method, Request, State, Version, CRLF, CRLF_CRLF};
use crate::router::{RouteData, Router};
use crate::rt::Handle;
use crate::server::conn::Connection;

pub(crate) struct HttpConnection {
    pub(crate) conn: Connection,
    router: Rc<Router>,
    config: Rc<Config>,
    version: Version,
    connection_type: ConnectionType,
    state: State,
    pub(crate) request: Option<Request>,
    pub(crate) response: Response,
}

/// Task entry for one accepted connection.
pub(crate) async fn serve(conn: Connection, router: Rc<Router>, config: Rc<Config>) {
    let peer = conn.peer;
    trace!(%peer, "handling connection");
    // Runs after every other teardown on task exit.
    let _done = crate::rt::task::defer(move || trace!(%peer, "connection done"));

    let mut http = HttpConnection {
        conn,
        router,
        config,
        version: Version::H11,
        connection_type: ConnectionType::KeepAlive,
        state: State::Init,
        request: None,
        response: Response::new(),
    };

    loop {
        match http.handle_request().await {
            Ok(()) => {
                if http.keep_alive() && http.conn.is_open() {
                    http.reset().await;
                    continue;
                }
                break;
            }
            Err(e) if e.is_eof() => {
                trace!(%peer, "peer closed");
                break;
            }
            Err(e) if e.is_timed_out() => {
                debug!(%peer, "idle timeout");
                let _ = http
                    .error_send(StatusCode::REQUEST_TIMEOUT, true)
                    .await;
                break;
            }
            Err(e) => {
                warn!(%peer, "dropping connection: {}", e);
                break;
            }
        }
    }

    http.state.advance(State::Closing);
    let handle = http.io();
    http.response.reset(&handle).await;
    http.conn.close().await;
}

impl HttpConnection {
    fn keep_alive(&self) -> bool {
        self.connection_type == ConnectionType::KeepAlive
    }

    pub(crate) fn io(&self) -> Handle {
        self.conn.handle.clone()
    }

    /// Returns all per-request state to `Init` for the next round-trip.
    /// Pipelined bytes already received stay in the receive buffer.
    async fn reset(&mut self) {
        let handle = self.io();
        self.response.reset(&handle).await;
        self.conn.send_buf.clear();
        self.request = None;
        self.version = Version::H11;
        self.connection_type = ConnectionType::KeepAlive;
        self.state = State::Init;
        self.conn.timeout.reset();
    }

    /// Drives one request/response round-trip. `Ok(())` means a response
    /// was sent (or deliberately suppressed); the connection disposition
    /// is in `connection_type`.
    async fn handle_request(&mut self) -> crate::Result<()> {
        let line_max = self.config.request_line_max;
        let header_bound = line_max + self.config.header_max;

        self.conn.recv_until(CRLF, line_max).await?;
        let line = match parse::request_line(&mut self.conn.recv_buf, line_max) {
            Ok(line) => line,
            Err(e) => return self.request_error(e).await,
        };
        trace!(
            method = ?line.method,
            path = %line.target.path,
            version = line.version.as_str(),
            "parsed request line"
        );

        self.version = line.version;
        self.connection_type = if line.version.keep_alive_by_default() {
            ConnectionType::KeepAlive
        } else {
            ConnectionType::Close
        };
        self.state.advance(State::ParsedFirstLine);

        let headers = if line.version == Version::H09 {
            // Simple requests carry no headers; trailing bytes are junk.
            if !self.conn.recv_buf.is_empty() {
                return self.parse_error(Parse::Header).await;
            }
            http::HeaderMap::new()
        } else {
            self.conn.recv_until(CRLF, header_bound).await?;
            if self.conn.recv_buf.consume_prefix(CRLF) {
                http::HeaderMap::new()
            } else {
                self.conn.recv_until(CRLF_CRLF, header_bound).await?;
                match parse::header_block(&mut self.conn.recv_buf, header_bound) {
                    Ok(headers) => headers,
                    Err(e) => return self.request_error(e).await,
                }
            }
        };

        let interp =
            match parse::interpret(&headers, line.version, self.config.request_content_max) {
                Ok(interp) => interp,
                Err(e) => return self.request_error(e).await,
            };
        // An explicit, valid Connection header wins even on HTTP/1.0.
        if let Some(connection) = interp.connection {
            self.connection_type = connection;
        }
        self.state.advance(State::ParsedHeaders);

        let method = line.method;
        let content_length = interp.content_length;
        self.request = Some(parse::into_request(line, headers, &interp));

        self.drain_body(content_length).await?;

        match method {
            Method::Brew => self.error_send(StatusCode::IM_A_TEAPOT, false).await,
            Method::Unknown => self.error_send(StatusCode::NOT_IMPLEMENTED, false).await,
            Method::Get | Method::Head => {
                let router = Rc::clone(&self.router);
                router.dispatch(self).await
            }
        }
    }

    /// Consumes the request body from the receive buffer. Bodies are
    /// bounded by `request_content_max` and never interpreted.
    async fn drain_body(&mut self, content_length: u64) -> crate::Result<()> {
        let mut remaining = content_length;
        while remaining > 0 {
            let buffered = self.conn.recv_buf.len() as u64;
            if buffered == 0 {
                self.conn.recv().await?;
                continue;
            }
            let take = buffered.min(remaining) as usize;
            self.conn.recv_buf.consume(take);
            remaining -= take as u64;
        }
        Ok(())
    }

    /// Routes an error from the parse phases: parse failures turn into
    /// error responses, I/O failures propagate to the connection loop.
    async fn request_error(&mut self, e: crate::Error) -> crate::Result<()> {
        match e.parse() {
            Some(parse) => self.parse_error(parse).await,
            None => Err(e),
        }
    }

    async fn parse_error(&mut self, parse: Parse) -> crate::Result<()> {
        debug!(error = ?parse, status = %parse.status(), "request rejected");
        self.error_send(parse.status(), parse.must_close()).await
    }

    /// Sends a generated error response. Any partial response output is
    /// discarded first, along with whatever request bytes provoked the
    /// error.
    pub(crate) async fn error_send(
        &mut self,
        status: StatusCode,
        force_close: bool,
    ) -> crate::Result<()> {
        if force_close {
            self.connection_type = ConnectionType::Close;
        }

        let handle = self.io();
        self.response.reset(&handle).await;
        self.conn.send_buf.clear();
        self.conn.recv_buf.clear();

        self.response
            .set_error_page(status, self.version, self.config.error_body_max);
        if !self.response.prep_start(self.version, self.connection_type) {
            warn!("pre-body buffer overflow while building error response");
            self.connection_type = ConnectionType::Close;
            return Ok(());
        }

        self.state.advance(State::Responding);
        self.send_prepared().await
    }

    /// One vectored send of `{pre-body, CRLF, inline body}`. A HEAD
    /// request suppresses the body; Content-Length already reflects it.
    async fn send_prepared(&mut self) -> crate::Result<()> {
        let fd = self.conn.socket();
        let head = self
            .request
            .as_ref()
            .map_or(false, |r| r.method == Method::Head);

        let mut iov = vec![iovec(self.response.pre_buf.readable()), iovec(CRLF)];
        if let BodyTarget::Inline(ref bytes) = self.response.body {
            if !head {
                iov.push(iovec(bytes));
            }
        }

        let handle = self.io();
        handle.writev_all(fd, &mut iov).await?;
        Ok(())
    }

    /// Serves an opened file (or its directory index): validators,
    /// content metadata, then the streamed body.
    async fn respond_file(&mut self, file: RawFd) -> crate::Result<()> {
        let handle = self.io();
        let mut file = file;

        let mut meta = match handle.stat(file).await {
            Ok(meta) => meta,
            Err(e) => {
                let _ = handle.close_fd(file).await;
                return self.stat_failed(e).await;
            }
        };

        let mut index = false;
        if meta.is_dir() {
            // Directory listings are a non-goal; look for the index file.
            let index_name = CString::new(self.config.index_filename.as_str())
                .expect("index filename contains NUL");
            let idx = match handle
                .open_under(file, &index_name, libc::O_RDONLY | libc::O_CLOEXEC)
                .await
            {
                Ok(fd) => fd,
                Err(e) => {
                    let _ = handle.close_fd(file).await;
                    return if e.is_not_found() {
                        trace!("directory without index");
                        self.error_send(StatusCode::NOT_FOUND, false).await
                    } else {
                        self.stat_failed(e).await
                    };
                }
            };
            let _ = handle.close_fd(file).await;
            file = idx;
            index = true;

            meta = match handle.stat(file).await {
                Ok(meta) => meta,
                Err(e) => {
                    let _ = handle.close_fd(file).await;
                    return self.stat_failed(e).await;
                }
            };
        }

        if !meta.is_regular() {
            trace!("request for a non-regular file");
            let _ = handle.close_fd(file).await;
            return self.error_send(StatusCode::NOT_FOUND, false).await;
        }

        // Park the fd in the response so every error path closes it.
        self.response.body = BodyTarget::File {
            fd: file,
            len: meta.size,
        };
        self.response.status = StatusCode::OK;
        self.response.content_length = Some(meta.size);
        self.response.content_type = Some(if index {
            mime::TEXT_HTML
        } else {
            let req = self.request.as_ref().expect("file dispatch without request");
            mime::from_path(&req.target.path)
        });

        if !self.response.prep_start(self.version, self.connection_type)
            || !self.response.prep_file_headers(&meta)
        {
            warn!("pre-body buffer overflow while building file response");
            return self.error_send(StatusCode::INTERNAL_SERVER_ERROR, true).await;
        }

        self.state.advance(State::Responding);
        self.stream_file(file, meta.size).await
    }

    async fn stat_failed(&mut self, e: crate::Error) -> crate::Result<()> {
        if e.is_not_found() {
            self.error_send(StatusCode::NOT_FOUND, false).await
        } else if e.is_submit_failed() {
            Err(e)
        } else {
            warn!("file metadata unavailable: {}", e);
            self.error_send(StatusCode::INTERNAL_SERVER_ERROR, true).await
        }
    }

    /// Streams the file body: the first chunk rides the vectored send
    /// with the headers, the rest goes out in send-buffer-sized pieces.
    async fn stream_file(&mut self, file: RawFd, size: u64) -> crate::Result<()> {
        let handle = self.io();
        let fd = self.conn.socket();
        let head = self
            .request
            .as_ref()
            .map_or(false, |r| r.method == Method::Head);

        if head || size == 0 {
            let mut iov = vec![iovec(self.response.pre_buf.readable()), iovec(CRLF)];
            handle.writev_all(fd, &mut iov).await?;
            return Ok(());
        }

        let chunk_max = self.conn.send_buf.max_cap();
        let first = size.min(chunk_max as u64) as usize;
        if !self.conn.send_buf.reserve(first) {
            warn!("send buffer exhausted");
            return self.error_send(StatusCode::INTERNAL_SERVER_ERROR, true).await;
        }
        let n = handle
            .read_full(file, &mut self.conn.send_buf.writable()[..first], 0)
            .await?;
        self.conn.send_buf.wrote(n);

        let mut iov = vec![
            iovec(self.response.pre_buf.readable()),
            iovec(CRLF),
            iovec(self.conn.send_buf.readable()),
        ];
        handle.writev_all(fd, &mut iov).await?;

        let mut offset = n as u64;
        while offset < size {
            self.conn.send_buf.clear();
            let want = (size - offset).min(chunk_max as u64) as usize;
            if !self.conn.send_buf.reserve(want) {
                break;
            }
            let n = handle
                .read_full(file, &mut self.conn.send_buf.writable()[..want], offset)
                .await?;
            if n == 0 {
                // Truncated underneath us; the peer sees a short body.
                break;
            }
            self.conn.send_buf.wrote(n);
            handle.send_all(fd, self.conn.send_buf.readable()).await?;
            offset += n as u64;
        }

        Ok(())
    }
}

/// The file-serving route handler. `data` carries the web-root fd.
pub(crate) fn file_handle(
    http: &mut HttpConnection,
    data: RouteData,
) -> crate::router::LocalBoxFuture<'_, crate::Result<()>> {
    Box::pin(async move {
        let path = {
            let req = http.request.as_ref().expect("file dispatch without request");
            let rel = req.target.path_relative();
            if rel.is_empty() {
                ".".to_owned()
            } else {
                rel.to_owned()
            }
        };
        trace!(%path, "opening file under web root");

        let cpath = match CString::new(path) {
            Ok(p) => p,
            Err(_) => return http.error_send(StatusCode::BAD_REQUEST, true).await,
        };

        let handle = http.io();
        http.state.advance(State::OpeningFile);
        let file = match handle
            .open_under(data.fd, &cpath, libc::O_RDONLY | libc::O_CLOEXEC)
            .await
        {
            Ok(fd) => fd,
            Err(e) if e.is_not_found() => {
                trace!("file not found");
                return http.error_send(StatusCode::NOT_FOUND, false).await;
            }
            Err(e) if e.is_submit_failed() => return Err(e),
            Err(e) => {
                warn!("open failed: {}", e);
                return http
                    .error_send(StatusCode::INTERNAL_SERVER_ERROR, true)
                    .await;
            }
        };

        http.respond_file(file).await
    })
}

fn iovec(slice: &[u8]) -> libc::iovec {
    libc::iovec {
        iov_base: slice.as_ptr() as *mut libc::c_void,
        iov_len: slice.len(),
    }
}
