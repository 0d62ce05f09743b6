//! # short-circuit
//!
//! A single-threaded, event-driven HTTP/1.0 and HTTP/1.1 static file
//! server for Linux. Every I/O operation is issued asynchronously to the
//! kernel (through io_uring where available, falling back to `poll(2)`)
//! and composed into per-connection cooperative tasks driven by a
//! hand-rolled executor on one thread.
//!
//! The interesting parts live below the HTTP layer:
//!
//! - `io`: the completion-ring and readiness-poll back-ends behind a
//!   uniform awaitable operation set.
//! - `rt`: the cooperative scheduler, spawn queue, and timer wheel.
//! - `server`: the accept loop and per-connection buffers and timeouts.
//! - `proto::h1`: the incremental request parser, response builder, and
//!   file-serving state machine on top.
//!
//! ```no_run
//! use short_circuit::{Config, Server};
//!
//! let config = Config {
//!     port: 8000,
//!     web_root: "/srv/www".into(),
//!     ..Config::default()
//! };
//! Server::bind(config)?.run()?;
//! # Ok::<(), short_circuit::Error>(())
//! ```

#[cfg(not(target_os = "linux"))]
compile_error!("short-circuit drives the Linux kernel directly and only builds for Linux");

mod buffer;
mod config;
mod error;
mod headers;
mod io;
pub mod mime;
mod proto;
mod router;
pub mod rt;
mod server;
pub mod uri;

pub use crate::config::{BackendKind, Config};
pub use crate::error::{Error, Result};
pub use crate::server::Server;
pub use crate::uri::Uri;
