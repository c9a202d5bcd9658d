use std::{
    fs,
    io::{Read, Write},
    net::{SocketAddr, TcpStream},
    path::Path,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use sluice_http::{
    HandlerOptions, HandlerRegistry, HttpHandler, HttpHandlerFactory, HttpRequest, HttpResponse,
    HttpStatus, ServerConfig, StaticFileHandlerFactory,
};
use sluiced::WebServer;

fn boot_with(registry: HandlerRegistry, yaml: &str) -> (SocketAddr, Arc<WebServer>) {
    let config = ServerConfig::parse(yaml).expect("test config parses");
    let server = Arc::new(WebServer::build(&config, &registry).expect("server builds"));
    server.start_threads().expect("stage threads start");
    assert!(server.wait_ready(Duration::from_secs(5)), "pollers never came up");
    let addr = server.local_addr().expect("local addr");
    {
        let server = Arc::clone(&server);
        thread::spawn(move || server.run());
    }
    (addr, server)
}

fn boot_static(doc_root: &Path, idle_timeout: u32) -> (SocketAddr, Arc<WebServer>) {
    let registry = HandlerRegistry::new();
    registry.register_factory(Box::new(StaticFileHandlerFactory));
    let yaml = format!(
        r#"
address: 127.0.0.1
port: 0
read_stage_pool_size: 1
write_stage_pool_size: 1
recycle_threshold: 1
handler_stage_pool_size: 2
idle_timeout: {idle_timeout}
handlers:
  - name: static
    module: static
    doc_root: {}
host:
  - domain: default
    url-rules:
      - type: prefix
        prefix: /
        chain: [static]
"#,
        doc_root.display()
    );
    boot_with(registry, &yaml)
}

struct Client {
    stream: TcpStream,
    buf: Vec<u8>,
}

struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Response {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

impl Client {
    fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("connect");
        stream.set_read_timeout(Some(Duration::from_secs(20))).expect("read timeout");
        Self { stream, buf: Vec::new() }
    }

    fn send(&mut self, data: &[u8]) {
        self.stream.write_all(data).expect("client write");
    }

    fn fill(&mut self) -> usize {
        let mut chunk = [0u8; 16 * 1024];
        let n = self.stream.read(&mut chunk).expect("client read");
        self.buf.extend_from_slice(&chunk[..n]);
        n
    }

    fn read_response(&mut self) -> Response {
        let head_end = loop {
            if let Some(pos) = self.buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos;
            }
            assert_ne!(self.fill(), 0, "server closed mid-response");
        };
        let head = String::from_utf8_lossy(&self.buf[..head_end]).into_owned();
        self.buf.drain(..head_end + 4);

        let mut lines = head.split("\r\n");
        let status_line = lines.next().expect("status line");
        assert!(status_line.starts_with("HTTP/1.1 "), "bad status line: {status_line}");
        let status: u16 = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .expect("status code");
        let headers: Vec<(String, String)> = lines
            .filter_map(|line| {
                line.split_once(':').map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            })
            .collect();

        let content_length: usize = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.parse().ok())
            .unwrap_or(0);
        while self.buf.len() < content_length {
            assert_ne!(self.fill(), 0, "server closed mid-body");
        }
        let body = self.buf.drain(..content_length).collect();
        Response { status, headers, body }
    }
}

#[test]
fn static_get_serves_the_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join("index.html"), "hello world").expect("fixture");
    let (addr, _server) = boot_static(dir.path(), 0);

    let mut client = Client::connect(addr);
    client.send(b"GET /index.html HTTP/1.1\r\nHost: d\r\n\r\n");
    let resp = client.read_response();
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("Content-Length"), Some("11"));
    assert_eq!(resp.body, b"hello world");

    // HTTP/1.1 keeps the connection open for the next request
    client.send(b"GET /index.html HTTP/1.1\r\nHost: d\r\n\r\n");
    let again = client.read_response();
    assert_eq!(again.status, 200);
    assert_eq!(again.body, b"hello world");
}

#[test]
fn range_get_returns_partial_content() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join("f"), "0123456789").expect("fixture");
    let (addr, _server) = boot_static(dir.path(), 0);

    let mut client = Client::connect(addr);
    client.send(b"GET /f HTTP/1.1\r\nHost: d\r\nRange: bytes=2-6\r\n\r\n");
    let resp = client.read_response();
    assert_eq!(resp.status, 206);
    assert_eq!(resp.header("Content-Range"), Some("bytes 2-6/10"));
    assert_eq!(resp.header("Content-Length"), Some("5"));
    assert_eq!(resp.body, b"23456");
}

#[test]
fn http10_keep_alive_is_honored() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join("index.html"), "hi").expect("fixture");
    let (addr, _server) = boot_static(dir.path(), 0);

    let mut client = Client::connect(addr);
    client.send(b"GET / HTTP/1.0\r\nHost: d\r\nConnection: Keep-Alive\r\n\r\n");
    let resp = client.read_response();
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("Connection"), Some("Keep-Alive"));

    // the socket must accept a second request
    client.send(b"GET / HTTP/1.0\r\nHost: d\r\nConnection: Keep-Alive\r\n\r\n");
    let again = client.read_response();
    assert_eq!(again.status, 200);
    assert_eq!(again.body, b"hi");
}

#[test]
fn idle_connections_are_evicted_and_the_server_keeps_accepting() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join("index.html"), "still here").expect("fixture");
    let (addr, _server) = boot_static(dir.path(), 1);

    let idle = TcpStream::connect(addr).expect("connect");
    idle.set_read_timeout(Some(Duration::from_secs(10))).expect("read timeout");

    // send nothing; the server must close within a few scan periods
    let start = Instant::now();
    let mut probe = idle;
    let mut scratch = [0u8; 16];
    let n = probe.read(&mut scratch).expect("idle read");
    assert_eq!(n, 0, "expected server-side close of the idle connection");
    assert!(
        start.elapsed() >= Duration::from_secs(1),
        "evicted before the idle timeout could have elapsed"
    );

    let mut fresh = Client::connect(addr);
    fresh.send(b"GET /index.html HTTP/1.1\r\nHost: d\r\n\r\n");
    assert_eq!(fresh.read_response().status, 200, "server stopped accepting after eviction");
}

#[test]
fn pipelined_requests_get_ordered_responses() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join("a.txt"), "alpha").expect("fixture");
    fs::write(dir.path().join("b.txt"), "bravo!").expect("fixture");
    fs::write(dir.path().join("c.txt"), "charlie").expect("fixture");
    let (addr, _server) = boot_static(dir.path(), 0);

    let mut client = Client::connect(addr);
    client.send(
        b"GET /a.txt HTTP/1.1\r\nHost: d\r\n\r\n\
          GET /b.txt HTTP/1.1\r\nHost: d\r\n\r\n\
          GET /c.txt HTTP/1.1\r\nHost: d\r\n\r\n",
    );

    let bodies: Vec<Vec<u8>> = (0..3).map(|_| client.read_response().body).collect();
    assert_eq!(bodies[0], b"alpha");
    assert_eq!(bodies[1], b"bravo!");
    assert_eq!(bodies[2], b"charlie");

    // still open: a fourth request round-trips
    client.send(b"GET /a.txt HTTP/1.1\r\nHost: d\r\n\r\n");
    assert_eq!(client.read_response().body, b"alpha");
}

const BIG_BODY_SIZE: usize = 10 * 1024 * 1024;

struct BigHandler;

impl HttpHandler for BigHandler {
    fn handle_request(&self, _request: &mut HttpRequest<'_>, response: &mut HttpResponse<'_>) {
        let chunk = vec![b'x'; 64 * 1024];
        for _ in 0..BIG_BODY_SIZE / chunk.len() {
            response.write_data(&chunk);
        }
        response.respond(HttpStatus::OK);
    }
}

struct BigHandlerFactory;

impl HttpHandlerFactory for BigHandlerFactory {
    fn create(&self, _options: &HandlerOptions) -> Arc<dyn HttpHandler> {
        Arc::new(BigHandler)
    }

    fn module_name(&self) -> &'static str {
        "big"
    }

    fn vendor_name(&self) -> &'static str {
        "test"
    }
}

struct SmallHandler;

impl HttpHandler for SmallHandler {
    fn handle_request(&self, _request: &mut HttpRequest<'_>, response: &mut HttpResponse<'_>) {
        response.write_string("ok");
        response.respond(HttpStatus::OK);
    }
}

struct SmallHandlerFactory;

impl HttpHandlerFactory for SmallHandlerFactory {
    fn create(&self, _options: &HandlerOptions) -> Arc<dyn HttpHandler> {
        Arc::new(SmallHandler)
    }

    fn module_name(&self) -> &'static str {
        "small"
    }

    fn vendor_name(&self) -> &'static str {
        "test"
    }
}

#[test]
fn backpressured_response_does_not_pin_a_worker() {
    let registry = HandlerRegistry::new();
    registry.register_factory(Box::new(BigHandlerFactory));
    registry.register_factory(Box::new(SmallHandlerFactory));
    let yaml = r#"
address: 127.0.0.1
port: 0
read_stage_pool_size: 1
write_stage_pool_size: 1
recycle_threshold: 1
handler_stage_pool_size: 1
handlers:
  - name: big
    module: big
  - name: small
    module: small
host:
  - domain: default
    url-rules:
      - type: prefix
        prefix: /big
        chain: [big]
      - type: prefix
        prefix: /small
        chain: [small]
"#;
    let (addr, _server) = boot_with(registry, yaml);

    // ask for 10 MB and refuse to read it
    let mut stalled = TcpStream::connect(addr).expect("connect");
    stalled.write_all(b"GET /big HTTP/1.1\r\nHost: d\r\n\r\n").expect("request");

    // with a single handler worker, a second connection only gets served if
    // the first one's worker came back to the pool
    let start = Instant::now();
    let mut other = Client::connect(addr);
    other.send(b"GET /small HTTP/1.1\r\nHost: d\r\n\r\n");
    let resp = other.read_response();
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, b"ok");
    assert!(
        start.elapsed() < Duration::from_secs(15),
        "handler worker stayed pinned behind an unread response"
    );
    drop(other);

    // now drain the stalled response; the write-back stage must deliver all
    // of it
    stalled.set_read_timeout(Some(Duration::from_secs(30))).expect("read timeout");
    let mut client = Client { stream: stalled, buf: Vec::new() };
    let resp = client.read_response();
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body.len(), BIG_BODY_SIZE);
}
