//! End-to-end tests over real sockets.
//!
//! Each case binds its own server on an ephemeral port (on its own
//! thread, since the runtime is single-threaded by design) and speaks raw
//! HTTP/1.x over `std::net::TcpStream`, asserting exact wire behavior.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use short_circuit::{Config, Server};

static NEXT_ROOT: AtomicUsize = AtomicUsize::new(0);

fn temp_web_root() -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "short-circuit-test-{}-{}",
        std::process::id(),
        NEXT_ROOT.fetch_add(1, Ordering::Relaxed)
    ));
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn start_server(mut config: Config) -> SocketAddr {
    config.port = 0;
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let server = Server::bind(config).expect("failed to bind test server");
        tx.send(server.local_addr()).unwrap();
        server.run().expect("server run failed");
    });
    rx.recv().unwrap()
}

fn start_file_server(web_root: PathBuf) -> SocketAddr {
    start_server(Config {
        web_root,
        ..Config::default()
    })
}

#[derive(Debug)]
struct Response {
    status: u16,
    reason: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl Response {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }
}

/// Reads one response: the header section, then exactly Content-Length
/// bytes of body (headers only when `skip_body`, as after HEAD).
fn read_response(stream: &mut TcpStream, skip_body: bool) -> Response {
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    while !raw.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).unwrap() {
            0 => panic!("connection closed mid-header: {:?}", String::from_utf8_lossy(&raw)),
            _ => raw.push(byte[0]),
        }
    }

    let text = String::from_utf8(raw).unwrap();
    let mut lines = text.split("\r\n");
    let status_line = lines.next().unwrap();
    let mut parts = status_line.splitn(3, ' ');
    let _version = parts.next().unwrap();
    let status: u16 = parts.next().unwrap().parse().unwrap();
    let reason = parts.next().unwrap_or("").to_owned();

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':').unwrap();
        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_owned());
    }

    let mut body = Vec::new();
    if !skip_body {
        if let Some(len) = headers.get("content-length") {
            let len: usize = len.parse().unwrap();
            body.resize(len, 0);
            stream.read_exact(&mut body).unwrap();
        }
    }

    Response {
        status,
        reason,
        headers,
        body,
    }
}

fn roundtrip(addr: SocketAddr, request: &[u8]) -> Response {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(request).unwrap();
    read_response(&mut stream, false)
}

fn assert_closed(stream: &mut TcpStream) {
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut buf = [0u8; 32];
    assert_eq!(stream.read(&mut buf).unwrap(), 0, "expected connection close");
}

#[test]
fn serves_a_static_file() {
    let root = temp_web_root();
    let content = b"<p>hello from disk</p>\n";
    fs::write(root.join("page.html"), content).unwrap();
    let addr = start_file_server(root);

    let resp = roundtrip(addr, b"GET /page.html HTTP/1.1\r\nHost: test\r\n\r\n");
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("content-type"), Some("text/html"));
    assert_eq!(
        resp.header("content-length").unwrap().parse::<usize>().unwrap(),
        content.len()
    );
    assert_eq!(resp.body, content);

    let etag = resp.header("etag").expect("file responses carry an ETag");
    assert!(etag.starts_with('"') && etag.ends_with('"'));
    assert_eq!(etag.matches('X').count(), 2, "ETag is inode X mtime X size");
    assert!(resp.header("last-modified").unwrap().ends_with("GMT"));
    assert!(resp.header("date").unwrap().ends_with("GMT"));
}

#[test]
fn serves_directory_index() {
    let root = temp_web_root();
    fs::write(root.join("index.html"), b"<h1>index</h1>").unwrap();
    let addr = start_file_server(root);

    let resp = roundtrip(addr, b"GET / HTTP/1.1\r\nHost: test\r\n\r\n");
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("content-type"), Some("text/html"));
    assert_eq!(resp.body, b"<h1>index</h1>");
}

#[test]
fn missing_file_is_404_with_error_page() {
    let root = temp_web_root();
    let addr = start_file_server(root);

    let resp = roundtrip(addr, b"GET /nope.txt HTTP/1.1\r\nHost: test\r\n\r\n");
    assert_eq!(resp.status, 404);
    assert_eq!(resp.reason, "Not Found");
    assert_eq!(resp.header("content-type"), Some("text/html"));
    let body = String::from_utf8(resp.body).unwrap();
    assert!(body.contains("Error: 404"));
}

#[test]
fn directory_without_index_is_404() {
    let root = temp_web_root();
    fs::create_dir(root.join("bare")).unwrap();
    let addr = start_file_server(root);

    let resp = roundtrip(addr, b"GET /bare HTTP/1.1\r\nHost: test\r\n\r\n");
    assert_eq!(resp.status, 404);
}

#[test]
fn head_suppresses_body_but_keeps_length() {
    let root = temp_web_root();
    fs::write(root.join("data.txt"), b"0123456789").unwrap();
    let addr = start_file_server(root);

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .write_all(b"HEAD /data.txt HTTP/1.1\r\nHost: test\r\n\r\n")
        .unwrap();
    let resp = read_response(&mut stream, true);
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("content-length"), Some("10"));

    // No body bytes follow the header section.
    stream
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    let mut buf = [0u8; 16];
    match stream.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("unexpected body bytes after HEAD: {:?}", &buf[..n]),
        Err(e) => assert!(
            matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut),
            "unexpected error: {}",
            e
        ),
    }
}

#[test]
fn streams_files_larger_than_the_send_buffer() {
    let root = temp_web_root();
    let content: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    fs::write(root.join("big.bin"), &content).unwrap();
    let addr = start_file_server(root);

    let resp = roundtrip(addr, b"GET /big.bin HTTP/1.1\r\nHost: test\r\n\r\n");
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("content-type"), Some("application/octet-stream"));
    assert_eq!(resp.body.len(), content.len());
    assert_eq!(resp.body, content, "streamed body must be byte-exact");
}

#[test]
fn keep_alive_serves_consecutive_requests_in_order() {
    let root = temp_web_root();
    fs::write(root.join("a.txt"), b"first").unwrap();
    fs::write(root.join("b.txt"), b"second").unwrap();
    let addr = start_file_server(root);

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .write_all(b"GET /a.txt HTTP/1.1\r\nHost: test\r\n\r\n")
        .unwrap();
    let first = read_response(&mut stream, false);
    assert_eq!(first.status, 200);
    assert_eq!(first.body, b"first");
    assert_eq!(first.header("connection"), Some("Keep-Alive"));

    stream
        .write_all(b"GET /b.txt HTTP/1.1\r\nHost: test\r\n\r\n")
        .unwrap();
    let second = read_response(&mut stream, false);
    assert_eq!(second.status, 200);
    assert_eq!(second.body, b"second");

    let first_date = httpdate::parse_http_date(first.header("date").unwrap()).unwrap();
    let second_date = httpdate::parse_http_date(second.header("date").unwrap()).unwrap();
    assert!(second_date >= first_date);
}

#[test]
fn http10_defaults_to_close() {
    let root = temp_web_root();
    fs::write(root.join("x.txt"), b"x").unwrap();
    let addr = start_file_server(root);

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .write_all(b"GET /x.txt HTTP/1.0\r\n\r\n")
        .unwrap();
    let resp = read_response(&mut stream, false);
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("connection"), Some("Close"));
    assert_closed(&mut stream);
}

#[test]
fn http10_keep_alive_is_honored_when_requested() {
    let root = temp_web_root();
    fs::write(root.join("x.txt"), b"x").unwrap();
    let addr = start_file_server(root);

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .write_all(b"GET /x.txt HTTP/1.0\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let resp = read_response(&mut stream, false);
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("connection"), Some("Keep-Alive"));

    stream
        .write_all(b"GET /x.txt HTTP/1.0\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let again = read_response(&mut stream, false);
    assert_eq!(again.status, 200);
}

#[test]
fn brew_is_a_teapot() {
    let addr = start_file_server(temp_web_root());
    let resp = roundtrip(addr, b"BREW / HTCPCP/1.0\r\n\r\n");
    assert_eq!(resp.status, 418);
    assert_eq!(resp.reason, "I'm a teapot");
}

#[test]
fn nul_escape_is_bad_request() {
    let addr = start_file_server(temp_web_root());
    let resp = roundtrip(addr, b"GET /%00 HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(resp.status, 400);
}

#[test]
fn overlong_request_line_is_414_and_closes() {
    let addr = start_file_server(temp_web_root());

    let mut request = b"GET /".to_vec();
    request.extend(std::iter::repeat(b'a').take(4096));
    request.extend_from_slice(b" HTTP/1.1\r\nHost: x\r\n\r\n");

    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(&request).unwrap();
    let resp = read_response(&mut stream, false);
    assert_eq!(resp.status, 414);
    assert_closed(&mut stream);
}

#[test]
fn unsupported_transfer_encoding_is_bad_request() {
    let addr = start_file_server(temp_web_root());
    let resp = roundtrip(
        addr,
        b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: gzip\r\n\r\n",
    );
    assert_eq!(resp.status, 400);
}

#[test]
fn chunked_requests_are_not_implemented() {
    let addr = start_file_server(temp_web_root());
    let resp = roundtrip(
        addr,
        b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n",
    );
    assert_eq!(resp.status, 501);
}

#[test]
fn unknown_version_is_505() {
    let addr = start_file_server(temp_web_root());
    let resp = roundtrip(addr, b"GET / HTTP/1.2\r\nHost: x\r\n\r\n");
    assert_eq!(resp.status, 505);
}

#[test]
fn missing_host_is_bad_request() {
    let addr = start_file_server(temp_web_root());
    let resp = roundtrip(addr, b"GET / HTTP/1.1\r\n\r\n");
    assert_eq!(resp.status, 400);
}

#[test]
fn unknown_method_is_not_implemented() {
    let addr = start_file_server(temp_web_root());
    let resp = roundtrip(addr, b"DELETE / HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(resp.status, 501);
}

#[test]
fn escape_above_web_root_is_refused() {
    let root = temp_web_root();
    fs::write(root.join("safe.txt"), b"safe").unwrap();
    let addr = start_file_server(root);

    let resp = roundtrip(addr, b"GET /../../etc/passwd HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(
        resp.status == 400 || resp.status == 404,
        "escape must be refused, got {}",
        resp.status
    );
    assert!(!resp.body.windows(5).any(|w| w == b"root:"));
}

#[test]
fn request_body_is_drained_for_keep_alive() {
    let root = temp_web_root();
    fs::write(root.join("x.txt"), b"x").unwrap();
    let addr = start_file_server(root);

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .write_all(b"BREW /pot HTCPCP/1.0\r\nConnection: keep-alive\r\nContent-Length: 5\r\n\r\nmilk!")
        .unwrap();
    let resp = read_response(&mut stream, false);
    assert_eq!(resp.status, 418);

    // The body did not poison the framing of the next request.
    stream
        .write_all(b"GET /x.txt HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let next = read_response(&mut stream, false);
    assert_eq!(next.status, 200);
}

#[test]
fn idle_connection_receives_exactly_one_408() {
    let root = temp_web_root();
    let addr = start_server(Config {
        web_root: root,
        connection_timeout: Duration::from_secs(1),
        ..Config::default()
    });

    let started = Instant::now();
    let mut stream = TcpStream::connect(addr).unwrap();
    let resp = read_response(&mut stream, false);
    assert_eq!(resp.status, 408);
    assert!(started.elapsed() >= Duration::from_millis(900));
    assert_closed(&mut stream);
}

#[test]
fn oversized_content_length_is_413() {
    let addr = start_file_server(temp_web_root());
    let resp = roundtrip(
        addr,
        b"GET / HTTP/1.1\r\nHost: x\r\nContent-Length: 1000000\r\n\r\n",
    );
    assert_eq!(resp.status, 413);
}
