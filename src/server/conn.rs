//! One accepted TCP connection: socket, buffers, and idle timeout.

use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use tracing::{trace, warn};

use crate::buffer::Buffer;
use crate::config::{Config, RECV_BUF_MIN_SPACE};
use crate::rt::timer::Timeout;
use crate::rt::Handle;
use crate::Error;

/// A server-side endpoint of one accepted TCP flow. Alive for exactly the
/// duration of the task driving it; dropping it closes the socket (if
/// still open) and cancels the timeout.
pub(crate) struct Connection {
    pub(crate) handle: Handle,
    socket: Option<RawFd>,
    pub(crate) recv_buf: Buffer,
    pub(crate) send_buf: Buffer,
    pub(crate) peer: SocketAddr,
    pub(crate) timeout: Timeout,
}

impl Connection {
    pub(crate) fn new(
        handle: &Handle,
        socket: RawFd,
        peer: SocketAddr,
        config: &Config,
    ) -> Connection {
        Connection {
            handle: handle.clone(),
            socket: Some(socket),
            recv_buf: Buffer::new(config.recv_buf_init, config.recv_buf_max),
            send_buf: Buffer::new(config.send_buf_init, config.send_buf_max),
            peer,
            timeout: Timeout::new(handle, config.connection_timeout),
        }
    }

    pub(crate) fn socket(&self) -> RawFd {
        self.socket.expect("connection already closed")
    }

    pub(crate) fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    /// Receives once into the receive buffer, guaranteeing a minimum of
    /// free tail space first. Resolves to the count received, `Eof`, or
    /// `TimedOut` when the idle timeout fires mid-wait.
    pub(crate) async fn recv(&mut self) -> crate::Result<usize> {
        if !self.recv_buf.reserve(RECV_BUF_MIN_SPACE) {
            // The buffer is pinned at max capacity; parsing bounds will
            // reject the request before this matters.
            return Err(Error::new_eof());
        }

        let fd = self.socket();
        let handle = self.handle.clone();
        let n = self
            .timeout
            .guard(handle.recv(fd, self.recv_buf.writable()))
            .await?;
        self.recv_buf.wrote(n);
        Ok(n)
    }

    /// Receives until `delim` is present in the buffer or more than `max`
    /// bytes have accumulated. Returns the number of additional bytes
    /// received.
    pub(crate) async fn recv_until(&mut self, delim: &[u8], max: usize) -> crate::Result<usize> {
        let start = self.recv_buf.len();
        while self.recv_buf.memmem(delim).is_none() && self.recv_buf.len() <= max {
            self.recv().await?;
        }
        Ok(self.recv_buf.len() - start)
    }

    /// Idempotent close: cancels the timeout and submits a close op.
    pub(crate) async fn close(&mut self) {
        let Some(fd) = self.socket.take() else {
            return;
        };
        trace!(peer = %self.peer, "closing connection");
        self.timeout.cancel();
        if let Err(e) = self.handle.close_fd(fd).await {
            // Fall back to a synchronous close; the fd must not leak.
            if e.is_submit_failed() {
                unsafe { libc::close(fd) };
            } else {
                warn!(peer = %self.peer, "close failed: {}", e);
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(fd) = self.socket.take() {
            // The task is gone; close synchronously rather than submit.
            unsafe { libc::close(fd) };
        }
    }
}
