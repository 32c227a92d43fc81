//! Minimal blocking HTTP server for download tests.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

pub(crate) struct TestServer {
    /// Base URL, e.g. `http://127.0.0.1:PORT`.
    pub addr: String,
    /// Number of requests served so far.
    pub hits: Arc<AtomicUsize>,
}

/// Spawn a server thread that handles one connection at a time, calling
/// `handler` with the request path and the raw stream. The server lives for
/// the rest of the process; tests are short-lived enough not to care.
pub(crate) fn serve(
    handler: impl Fn(&str, &mut TcpStream) + Send + Sync + 'static,
) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = format!("http://{}", listener.local_addr().unwrap());
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_handle = Arc::clone(&hits);

    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            hits_handle.fetch_add(1, Ordering::SeqCst);

            let mut buf = [0u8; 4096];
            let read = stream.read(&mut buf).unwrap_or(0);
            let request = String::from_utf8_lossy(&buf[..read]).to_string();
            let path = request
                .split_whitespace()
                .nth(1)
                .unwrap_or("/")
                .to_string();

            handler(&path, &mut stream);
            let _ = stream.flush();
        }
    });

    TestServer { addr, hits }
}

/// Write a response head declaring `content_length` body bytes to follow.
pub(crate) fn write_head(stream: &mut TcpStream, status: u16, content_length: usize) {
    let head = format!(
        "HTTP/1.1 {status} X\r\nContent-Length: {content_length}\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(head.as_bytes()).unwrap();
}

/// Write a complete 200 response.
pub(crate) fn write_ok(stream: &mut TcpStream, body: &[u8]) {
    write_head(stream, 200, body.len());
    stream.write_all(body).unwrap();
}

/// Write a bodyless response with the given status.
pub(crate) fn write_status(stream: &mut TcpStream, status: u16) {
    write_head(stream, status, 0);
}

/// Write a 301 redirect to `location`.
pub(crate) fn write_redirect(stream: &mut TcpStream, location: &str) {
    let head = format!(
        "HTTP/1.1 301 Moved Permanently\r\nLocation: {location}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(head.as_bytes()).unwrap();
}
