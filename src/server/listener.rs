//! Socket listener: keeps an accept operation outstanding and spawns one
//! connection task per completion.

use std::io;
use std::mem;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::os::unix::io::{IntoRawFd, RawFd};
use std::rc::Rc;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::io::Acceptor;
use crate::proto::h1;
use crate::router::Router;
use crate::rt::Handle;
use crate::server::conn::Connection;
use crate::Error;

pub(crate) struct Listener {
    socket: RawFd,
    addr: SocketAddr,
    config: Rc<Config>,
    router: Rc<Router>,
}

impl Listener {
    /// Binds a dual-stack listening socket on the configured port.
    pub(crate) fn bind(
        config: Rc<Config>,
        router: Rc<Router>,
        nonblocking: bool,
    ) -> crate::Result<Listener> {
        let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))
            .map_err(Error::new_listen)?;
        socket.set_only_v6(false).map_err(Error::new_listen)?;
        socket.set_reuse_address(true).map_err(Error::new_listen)?;
        if nonblocking {
            socket.set_nonblocking(true).map_err(Error::new_listen)?;
        }

        let addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, config.port, 0, 0);
        socket
            .bind(&SocketAddr::V6(addr).into())
            .map_err(Error::new_listen)?;
        socket
            .listen(config.backlog as i32)
            .map_err(Error::new_listen)?;

        let addr = socket
            .local_addr()
            .map_err(Error::new_listen)?
            .as_socket()
            .expect("listener has an inet address");
        debug!(%addr, "listening");

        Ok(Listener {
            socket: socket.into_raw_fd(),
            addr,
            config,
            router,
        })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// The accept loop. Runs as a task for the lifetime of the server.
    pub(crate) async fn run(self, handle: Handle) {
        let mut acceptor = Acceptor::new(&handle, self.socket);

        loop {
            let fd = match acceptor.next(&handle).await {
                Ok(fd) => fd,
                Err(e) => {
                    // Transient failures (EMFILE under load, a reset in the
                    // backlog): let other tasks release resources first.
                    warn!("accept failed: {}", e);
                    crate::rt::yield_now().await;
                    continue;
                }
            };

            let peer = peer_addr(fd).unwrap_or_else(|_| {
                SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0))
            });
            trace!(%peer, "accepted connection");

            let conn = Connection::new(&handle, fd, peer, &self.config);
            conn.timeout.reset();

            let router = Rc::clone(&self.router);
            let config = Rc::clone(&self.config);
            handle.spawn(h1::serve(conn, router, config));
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        unsafe { libc::close(self.socket) };
    }
}

fn peer_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe {
        libc::getpeername(
            fd,
            &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let addr = unsafe { *(&storage as *const _ as *const libc::sockaddr_in) };
            let ip = u32::from_be(addr.sin_addr.s_addr);
            Ok(SocketAddr::from((
                std::net::Ipv4Addr::from(ip),
                u16::from_be(addr.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let addr = unsafe { *(&storage as *const _ as *const libc::sockaddr_in6) };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(addr.sin6_addr.s6_addr),
                u16::from_be(addr.sin6_port),
                addr.sin6_flowinfo,
                addr.sin6_scope_id,
            )))
        }
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unexpected address family",
        )),
    }
}
