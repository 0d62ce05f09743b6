//! Server assembly: runtime + listener + router.

pub(crate) mod conn;
pub(crate) mod listener;

use std::net::SocketAddr;
use std::rc::Rc;

use tracing::info;

use crate::config::Config;
use crate::io::Driver;
use crate::router::Router;
use crate::rt::Runtime;
use crate::server::listener::Listener;

/// A bound, ready-to-run server. Single-threaded: `run` drives every
/// connection on the calling thread until SIGINT.
pub struct Server {
    runtime: Runtime,
    listener: Listener,
}

impl Server {
    /// Selects a back-end, opens the web root, and binds the listening
    /// socket. Fails on startup misconfiguration: a missing or
    /// non-directory web root, an unsupported kernel, or a back-end
    /// without a required operation.
    pub fn bind(config: Config) -> crate::Result<Server> {
        let driver = Driver::new(&config)?;
        let runtime = Runtime::new(driver);

        let router = Rc::new(Router::file_serve(&config.web_root)?);
        let config = Rc::new(config);

        // The readiness back-end needs a non-blocking listener; the ring
        // back-end needs a blocking one.
        let nonblocking = !runtime.handle().is_uring();
        let listener = Listener::bind(Rc::clone(&config), router, nonblocking)?;

        Ok(Server { runtime, listener })
    }

    /// The bound address, useful when the configured port was 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Runs the accept loop and every connection task to completion.
    pub fn run(self) -> crate::Result<()> {
        let handle = self.runtime.handle();
        info!(addr = %self.listener.local_addr(), "server starting");
        handle.spawn(self.listener.run(handle.clone()));
        self.runtime.run()
    }
}
