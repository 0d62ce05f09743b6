//! Kernel-facing I/O: two back-ends behind one awaitable operation set.
//!
//! The completion ring back-end submits every operation to io_uring and
//! resumes the waiting task from the completion queue. The readiness poll
//! back-end registers interest, retries the syscall on readiness, and
//! emulates streams by re-issuing. Both speak the same error taxonomy:
//! `Eof` for peer shutdown, `NotFound` for failed opens under the web
//! root, `SubmitFailed` for an exhausted submission queue, `TimedOut` from
//! the timer wheel, and `Io` for anything unexpected.

pub(crate) mod poll;
pub(crate) mod uring;

use std::ffi::CStr;
use std::future::poll_fn;
use std::os::unix::io::RawFd;
use std::time::Instant;

use tracing::{debug, warn};

use crate::config::{BackendKind, Config};
use crate::rt::Handle;

/// `RESOLVE_BENEATH`: reject path resolution escaping the directory fd.
pub(crate) const RESOLVE_BENEATH: u64 = 0x08;

/// The metadata subset the HTTP layer cares about.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Metadata {
    pub(crate) mode: u32,
    pub(crate) size: u64,
    pub(crate) mtime: i64,
    pub(crate) ino: u64,
}

impl Metadata {
    pub(crate) fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    pub(crate) fn is_regular(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFREG
    }
}

/// The kernel-facing implementation selected at startup.
pub(crate) enum Driver {
    Uring(uring::Driver),
    Poll(poll::Driver),
}

impl Driver {
    pub(crate) fn new(config: &Config) -> crate::Result<Driver> {
        match config.backend {
            BackendKind::Uring => Ok(Driver::Uring(uring::Driver::new(config)?)),
            BackendKind::Poll => Ok(Driver::new_poll()),
            BackendKind::Auto => match uring::Driver::new(config) {
                Ok(driver) => {
                    debug!("using the completion ring back-end");
                    Ok(Driver::Uring(driver))
                }
                Err(e) => {
                    warn!("ring unavailable ({}), falling back to poll", e);
                    Ok(Driver::new_poll())
                }
            },
        }
    }

    pub(crate) fn new_poll() -> Driver {
        Driver::Poll(poll::Driver::new())
    }

    /// Blocks until at least one completion, readiness event, or the
    /// given deadline. Called once per scheduler iteration.
    pub(crate) fn pump(&mut self, deadline: Option<Instant>) -> crate::Result<()> {
        match self {
            Driver::Uring(d) => d.pump(deadline),
            Driver::Poll(d) => d.pump(deadline),
        }
    }
}

/// A stream of accepted sockets: multishot on the ring (one submission,
/// many completions), re-issued single-shot accepts under poll.
pub(crate) enum Acceptor {
    Uring(uring::AcceptStream),
    Poll { fd: RawFd },
}

impl Acceptor {
    pub(crate) fn new(handle: &Handle, fd: RawFd) -> Acceptor {
        if handle.is_uring() {
            Acceptor::Uring(uring::AcceptStream::new(handle, fd))
        } else {
            Acceptor::Poll { fd }
        }
    }

    pub(crate) async fn next(&mut self, handle: &Handle) -> crate::Result<RawFd> {
        match self {
            Acceptor::Uring(stream) => loop {
                match poll_fn(|cx| futures_core::Stream::poll_next(std::pin::Pin::new(&mut *stream), cx)).await {
                    Some(res) => return res,
                    // The kernel signaled no-more; re-arm the submission.
                    None => continue,
                }
            },
            Acceptor::Poll { fd } => poll::accept(handle, *fd).await,
        }
    }
}

impl Handle {
    pub(crate) fn is_uring(&self) -> bool {
        matches!(&*self.inner.driver.borrow(), Driver::Uring(_))
    }

    /// Receives into `buf`. Resolves to `Eof` on peer shutdown or reset.
    pub(crate) async fn recv(&self, fd: RawFd, buf: &mut [u8]) -> crate::Result<usize> {
        if self.is_uring() {
            uring::recv(self, fd, buf).await
        } else {
            poll::recv(self, fd, buf).await
        }
    }

    /// Sends from `buf`, returning the (possibly short) count written.
    pub(crate) async fn send(&self, fd: RawFd, buf: &[u8]) -> crate::Result<usize> {
        if self.is_uring() {
            uring::send(self, fd, buf).await
        } else {
            poll::send(self, fd, buf).await
        }
    }

    /// Sends all of `buf`, re-issuing on short writes.
    pub(crate) async fn send_all(&self, fd: RawFd, mut buf: &[u8]) -> crate::Result<usize> {
        let total = buf.len();
        while !buf.is_empty() {
            let n = self.send(fd, buf).await?;
            if n == 0 {
                return Err(crate::Error::new_eof());
            }
            buf = &buf[n..];
        }
        Ok(total)
    }

    /// Reads from `fd` at `offset`. Resolves to `Eof` at end of file.
    pub(crate) async fn read_at(
        &self,
        fd: RawFd,
        buf: &mut [u8],
        offset: u64,
    ) -> crate::Result<usize> {
        if self.is_uring() {
            uring::read_at(self, fd, buf, offset).await
        } else {
            poll::read_at(self, fd, buf, offset).await
        }
    }

    /// Reads until `buf` is full or EOF; returns the count read.
    pub(crate) async fn read_full(
        &self,
        fd: RawFd,
        buf: &mut [u8],
        mut offset: u64,
    ) -> crate::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read_at(fd, &mut buf[filled..], offset).await {
                Ok(n) => {
                    filled += n;
                    offset += n as u64;
                }
                Err(e) if e.is_eof() => break,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    /// A single vectored write. The caller advances the iovec head on a
    /// short write (see [`Handle::writev_all`]).
    pub(crate) async fn writev(&self, fd: RawFd, iov: &[libc::iovec]) -> crate::Result<usize> {
        if self.is_uring() {
            uring::writev(self, fd, iov).await
        } else {
            poll::writev(self, fd, iov).await
        }
    }

    /// Writes every byte described by `iov`, advancing past completed
    /// entries and into partially-written ones as needed.
    pub(crate) async fn writev_all(
        &self,
        fd: RawFd,
        iov: &mut Vec<libc::iovec>,
    ) -> crate::Result<usize> {
        let total: usize = iov.iter().map(|v| v.iov_len).sum();
        let mut left = total;

        while left > 0 {
            let mut n = self.writev(fd, iov).await?;
            if n == 0 {
                return Err(crate::Error::new_eof());
            }
            left -= n;
            if left == 0 {
                break;
            }

            let mut done = 0;
            for v in iov.iter_mut() {
                if n < v.iov_len {
                    v.iov_base = unsafe { (v.iov_base as *mut u8).add(n) } as *mut libc::c_void;
                    v.iov_len -= n;
                    break;
                }
                n -= v.iov_len;
                done += 1;
            }
            iov.drain(..done);
        }

        Ok(total)
    }

    /// Opens `path` relative to `dir` with escape-resistant resolution.
    /// Resolves to `NotFound` for missing or inaccessible entries and for
    /// any attempt to resolve above `dir`.
    pub(crate) async fn open_under(
        &self,
        dir: RawFd,
        path: &CStr,
        flags: i32,
    ) -> crate::Result<RawFd> {
        if self.is_uring() {
            uring::open_under(self, dir, path, flags).await
        } else {
            poll::open_under(self, dir, path, flags).await
        }
    }

    pub(crate) async fn close_fd(&self, fd: RawFd) -> crate::Result<()> {
        if self.is_uring() {
            uring::close(self, fd).await
        } else {
            poll::close(self, fd).await
        }
    }

    pub(crate) async fn stat(&self, fd: RawFd) -> crate::Result<Metadata> {
        if self.is_uring() {
            uring::stat(self, fd).await
        } else {
            poll::stat(self, fd).await
        }
    }
}
