//! Configurable settings.
//!
//! Every tunable the server exposes, with its default. The values mirror
//! what the `sc` binary accepts on the command line; tests construct their
//! own `Config` directly (notably with a much shorter idle timeout).

use std::path::PathBuf;
use std::time::Duration;

/// Minimum kernel version for the ring back-end.
pub(crate) const MIN_KERNEL_VERSION: (u32, u32) = (5, 6);

/// How many times to retry a submission-queue push after an eager submit.
pub(crate) const SQE_RETRY_MAX: usize = 128;

/// Smallest ring size worth opening; entry counts are halved down to this.
pub(crate) const URING_ENTRIES_MIN: u32 = 512;

/// Minimum free space ensured in the receive buffer before each `recv`.
pub(crate) const RECV_BUF_MIN_SPACE: usize = 512;

/// Pre-body (status line + headers) buffer bounds.
pub(crate) const PRE_BUF_INIT_CAP: usize = 1024;
pub(crate) const PRE_BUF_MAX_CAP: usize = 4096;

/// Which I/O back-end to drive the event loop with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Use the completion ring if the kernel supports it, else poll.
    Auto,
    /// Require io_uring.
    Uring,
    /// Require the readiness-poll fallback.
    Poll,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP port to listen on.
    pub port: u16,
    /// `listen()` backlog.
    pub backlog: u32,
    /// Idle time before a connection receives a synthetic 408 and closes.
    pub connection_timeout: Duration,
    /// Upper bound on concurrent connections, used to sanity-check
    /// `RLIMIT_NOFILE` at startup.
    pub connection_pool_size: u64,
    /// Receive buffer bounds, per connection.
    pub recv_buf_init: usize,
    pub recv_buf_max: usize,
    /// Send buffer bounds, per connection.
    pub send_buf_init: usize,
    pub send_buf_max: usize,
    /// Submission ring size. Halved on open failure down to a floor of 512.
    pub uring_entries: u32,
    /// Maximum length of the request line, in bytes.
    pub request_line_max: usize,
    /// Maximum length of the header block, in bytes (beyond the line max).
    pub header_max: usize,
    /// Largest accepted `Content-Length`.
    pub request_content_max: u64,
    /// Cap on generated error-page bodies.
    pub error_body_max: usize,
    /// File implicitly served for directory requests.
    pub index_filename: String,
    /// Directory all request paths resolve under.
    pub web_root: PathBuf,
    /// Back-end selection.
    pub backend: BackendKind,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            port: 8000,
            backlog: 1024,
            connection_timeout: Duration::from_secs(60),
            connection_pool_size: 1280,
            recv_buf_init: 2048,
            recv_buf_max: 10240,
            send_buf_init: 2048,
            send_buf_max: 20480,
            uring_entries: 2048,
            request_line_max: 2048,
            header_max: 2048,
            request_content_max: 10240,
            error_body_max: 512,
            index_filename: "index.html".to_owned(),
            web_root: PathBuf::from("."),
            backend: BackendKind::Auto,
        }
    }
}
