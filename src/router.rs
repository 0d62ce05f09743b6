//! Request routing: one handler bound to one opaque payload.
//!
//! Deliberately minimal. The only registered handler serves files, and
//! the payload is the pre-opened web-root directory fd it resolves
//! against. Pattern routing is a non-goal.

use std::ffi::CString;
use std::future::Future;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::pin::Pin;

use tracing::debug;

use crate::proto::h1::conn::{file_handle, HttpConnection};
use crate::Error;

pub(crate) type LocalBoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

pub(crate) type RouteHandler =
    for<'a> fn(&'a mut HttpConnection, RouteData) -> LocalBoxFuture<'a, crate::Result<()>>;

/// The handler's payload: a borrowed-by-value file descriptor (never
/// mutated, shared by every dispatch).
#[derive(Debug, Clone, Copy)]
pub(crate) struct RouteData {
    pub(crate) fd: RawFd,
}

pub(crate) struct Router {
    handler: RouteHandler,
    data: RouteData,
}

impl Router {
    pub(crate) fn new(handler: RouteHandler, data: RouteData) -> Router {
        Router { handler, data }
    }

    /// A router serving files under `web_root`, which is opened once,
    /// read-only, for the life of the process.
    pub(crate) fn file_serve(web_root: &Path) -> crate::Result<Router> {
        let path = CString::new(web_root.as_os_str().as_bytes())
            .map_err(|_| Error::new_unsupported("web root path contains NUL"))?;
        let fd = unsafe {
            libc::open(
                path.as_ptr(),
                libc::O_PATH | libc::O_DIRECTORY | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(Error::new_io(io::Error::last_os_error()));
        }
        debug!(web_root = %web_root.display(), "opened web root");

        Ok(Router::new(file_handle, RouteData { fd }))
    }

    pub(crate) async fn dispatch(&self, http: &mut HttpConnection) -> crate::Result<()> {
        (self.handler)(http, self.data).await
    }
}
