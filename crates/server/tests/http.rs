//! Full-stack scenarios: the engine driving real HTTP sessions over TCP.

mod common;

use proto::HttpSession;
use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn temp_root() -> Arc<PathBuf> {
    static SEQ: AtomicUsize = AtomicUsize::new(0);
    let dir = std::env::temp_dir().join(format!(
        "http-test-{}-{}",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::SeqCst),
    ));
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("index.html"), b"<html>front page</html>").unwrap();
    fs::write(dir.join("a.html"), b"alpha document").unwrap();
    fs::write(dir.join("b.html"), b"beta document").unwrap();
    Arc::new(dir)
}

fn http_factory(
    et: bool,
    root: Arc<PathBuf>,
) -> impl Fn(TcpStream, SocketAddr) -> HttpSession + Clone + Send + 'static {
    move |stream, addr| HttpSession::new(stream, addr, et, Arc::clone(&root))
}

fn get(stream: &mut TcpStream, path: &str, connection: &str) {
    let request = format!("GET {path} HTTP/1.1\r\nHost: x\r\nConnection: {connection}\r\n\r\n");
    stream.write_all(request.as_bytes()).unwrap();
}

fn read_to_eof(stream: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    stream.read_to_end(&mut out).unwrap();
    out
}

#[test]
fn serves_a_single_request_and_closes() {
    let root = temp_root();
    let server = common::launch(common::config(3, 0), http_factory(true, Arc::clone(&root)));

    let mut stream = server.connect();
    get(&mut stream, "/", "close");
    let response = read_to_eof(&mut stream);

    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {text}");
    assert!(text.contains("Content-Type: text/html\r\n"));
    assert!(text.ends_with("<html>front page</html>"));

    server.stop();
}

#[test]
fn keep_alive_pipeline_answers_in_order() {
    let root = temp_root();
    let server = common::launch(common::config(3, 0), http_factory(true, Arc::clone(&root)));

    let mut stream = server.connect();
    let pipeline = "GET /a.html HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n\
                    GET /b.html HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n";
    stream.write_all(pipeline.as_bytes()).unwrap();

    let text = String::from_utf8_lossy(&read_to_eof(&mut stream)).into_owned();
    assert_eq!(text.matches("HTTP/1.1 200 OK").count(), 2, "got: {text}");
    let alpha = text.find("alpha document").expect("first body missing");
    let beta = text.find("beta document").expect("second body missing");
    assert!(alpha < beta, "responses out of order: {text}");

    server.stop();
}

#[test]
fn a_reused_connection_serves_sequential_requests() {
    let root = temp_root();
    let server = common::launch(common::config(3, 0), http_factory(true, Arc::clone(&root)));

    let mut stream = server.connect();

    get(&mut stream, "/a.html", "keep-alive");
    let first = read_until_ends_with(&mut stream, b"alpha document");
    assert!(first.starts_with(b"HTTP/1.1 200 OK\r\n"));

    get(&mut stream, "/b.html", "close");
    let rest = read_to_eof(&mut stream);
    assert!(rest.starts_with(b"HTTP/1.1 200 OK\r\n"));
    assert!(rest.ends_with(b"beta document"));

    server.stop();
}

// the body is the final bytes of a response, so this reads exactly one reply
fn read_until_ends_with(stream: &mut TcpStream, needle: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut chunk = [0u8; 4096];
    while !out.ends_with(needle) {
        match stream.read(&mut chunk) {
            Ok(0) => panic!("eof before the expected body arrived"),
            Ok(n) => out.extend_from_slice(&chunk[..n]),
            Err(err) => panic!("read failed: {err}"),
        }
    }
    out
}

#[test]
fn missing_documents_get_a_404_page() {
    let root = temp_root();
    let server = common::launch(common::config(3, 0), http_factory(true, Arc::clone(&root)));

    let mut stream = server.connect();
    get(&mut stream, "/nope.html", "close");
    let text = String::from_utf8_lossy(&read_to_eof(&mut stream)).into_owned();
    assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"), "got: {text}");

    server.stop();
}

#[test]
fn malformed_requests_get_a_400_and_a_close() {
    let root = temp_root();
    let server = common::launch(common::config(3, 0), http_factory(true, Arc::clone(&root)));

    let mut stream = server.connect();
    stream.write_all(b"not a request\r\n\r\n").unwrap();
    let text = String::from_utf8_lossy(&read_to_eof(&mut stream)).into_owned();
    assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"), "got: {text}");

    server.stop();
}

#[test]
fn a_slow_reader_is_paced_without_starving_others() {
    let root = temp_root();
    let payload: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
    fs::write(root.join("big.bin"), &payload).unwrap();
    let server = common::launch(common::config(3, 0), http_factory(true, Arc::clone(&root)));

    let mut slow = server.connect();
    // a tiny receive window forces the worker into repeated partial writes
    socket2::SockRef::from(&slow)
        .set_recv_buffer_size(16 * 1024)
        .unwrap();
    get(&mut slow, "/big.bin", "close");

    // let the worker fill the socket buffers and park on would-block
    std::thread::sleep(Duration::from_millis(50));

    let mut received = Vec::new();
    let mut chunk = [0u8; 32 * 1024];
    loop {
        let n = slow.read(&mut chunk).unwrap();
        if n == 0 {
            break;
        }
        received.extend_from_slice(&chunk[..n]);

        // the parked transfer must not starve other connections
        let mut other = server.connect();
        get(&mut other, "/a.html", "close");
        assert!(read_to_eof(&mut other).starts_with(b"HTTP/1.1 200 OK\r\n"));
        std::thread::sleep(Duration::from_millis(5));
    }

    assert!(received.starts_with(b"HTTP/1.1 200 OK\r\n"));
    let header_end = received
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response head never completed")
        + 4;
    assert_eq!(&received[header_end..], &payload[..]);

    server.stop();
}

#[test]
fn edge_and_level_triggering_serve_identical_bytes() {
    let root = temp_root();
    let responses: Vec<Vec<u8>> = [0u8, 3]
        .into_iter()
        .map(|trig_mode| {
            let et = trig_mode == 3;
            let server = common::launch(
                common::config(trig_mode, 0),
                http_factory(et, Arc::clone(&root)),
            );
            let mut stream = server.connect();
            get(&mut stream, "/a.html", "close");
            let response = read_to_eof(&mut stream);
            server.stop();
            response
        })
        .collect();

    assert_eq!(responses[0], responses[1]);
}
