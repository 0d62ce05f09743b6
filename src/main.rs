//! The `sc` binary: option parsing, logging setup, and server startup.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use short_circuit::{BackendKind, Config, Server};

#[derive(Parser, Debug)]
#[command(
    name = "sc",
    version,
    about = "A single-threaded, event-driven HTTP/1.x file server built on io_uring."
)]
struct Args {
    /// The port to listen on.
    #[arg(short, long, default_value_t = 8000)]
    port: u16,

    /// Be quieter (repeat for more silence).
    #[arg(short, long, action = clap::ArgAction::Count, conflicts_with = "verbose")]
    quiet: u8,

    /// Print verbose output (repeat for even more).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// The I/O back-end driving the event loop.
    #[arg(long, value_enum, default_value_t = Backend::Auto)]
    backend: Backend,

    /// The directory to serve files from.
    #[arg(default_value = ".")]
    web_root: PathBuf,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum Backend {
    Auto,
    Uring,
    Poll,
}

impl From<Backend> for BackendKind {
    fn from(backend: Backend) -> BackendKind {
        match backend {
            Backend::Auto => BackendKind::Auto,
            Backend::Uring => BackendKind::Uring,
            Backend::Poll => BackendKind::Poll,
        }
    }
}

fn init_logging(quiet: u8, verbose: u8) {
    static LEVELS: [&str; 6] = ["off", "error", "warn", "info", "debug", "trace"];
    let level = (2 + verbose as i16 - quiet as i16).clamp(0, 5) as usize;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(LEVELS[level]));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.quiet, args.verbose);

    let web_root = match args.web_root.canonicalize() {
        Ok(path) => path,
        Err(e) => {
            eprintln!("sc: web root {}: {}", args.web_root.display(), e);
            return ExitCode::FAILURE;
        }
    };
    if !web_root.is_dir() {
        eprintln!("sc: web root {} is not a directory", web_root.display());
        return ExitCode::FAILURE;
    }

    let config = Config {
        port: args.port,
        web_root,
        backend: args.backend.into(),
        ..Config::default()
    };

    let server = match Server::bind(config) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("sc: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match server.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("sc: {}", e);
            ExitCode::FAILURE
        }
    }
}
