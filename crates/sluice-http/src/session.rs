use std::{collections::VecDeque, sync::Arc};

use sluice::{Buffer, Protocol};

use crate::{config::{UrlRule, VHostConfig}, method::Method, parser::RequestParser};

/// Bodies below this size are buffered in full before the handler runs;
/// larger ones are streamed to the handler as they arrive.
pub const MAX_BODY_SIZE: u64 = 16 << 10;

/// One parsed request as carried on the connection's pending list.
pub struct HttpRequestData {
    /// Ordered as received; lookups are case-sensitive unless a caller says
    /// otherwise.
    pub headers: Vec<(String, String)>,
    pub path: String,
    pub uri: String,
    pub query_string: String,
    pub fragment: String,
    /// Decoded chunked body, when the request used chunked framing.
    pub chunk_buffer: Buffer,
    pub method: Method,
    pub content_length: u64,
    pub chunked: bool,
    pub version_major: u8,
    pub version_minor: u8,
    pub keep_alive: bool,
    pub url_rule: Option<Arc<UrlRule>>,
}

impl HttpRequestData {
    pub fn find_header_value(&self, key: &str) -> Option<&str> {
        self.headers.iter().find(|(name, _)| name == key).map(|(_, value)| value.as_str())
    }

    pub fn find_header_values<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> {
        self.headers
            .iter()
            .filter(move |(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }
}

/// Per-connection HTTP state: the incremental parser plus the FIFO of
/// requests waiting for the handler stage.
pub struct HttpSession {
    parser: RequestParser,
    requests: VecDeque<HttpRequestData>,
    vhosts: Arc<VHostConfig>,
}

impl HttpSession {
    pub fn new(vhosts: Arc<VHostConfig>) -> Self {
        Self { parser: RequestParser::new(), requests: VecDeque::new(), vhosts }
    }

    /// Advances the parser over the input buffer. False means the peer sent
    /// something that is not HTTP and the connection should be closed.
    pub fn do_parse(&mut self, buf: &mut Buffer) -> bool {
        self.parser.drive(buf, &self.vhosts, &mut self.requests)
    }

    pub fn has_error(&self) -> bool {
        self.parser.has_error()
    }

    /// Handler-dispatch gate: there is a pending request, and its body is
    /// either absent, fully buffered, or big enough that the handler should
    /// stream it instead of waiting.
    pub fn is_ready(&self, buffered_bytes: usize) -> bool {
        let Some(last) = self.requests.back() else {
            return false;
        };
        if last.content_length < MAX_BODY_SIZE && (buffered_bytes as u64) < last.content_length {
            return false;
        }
        true
    }

    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    pub fn pop_request(&mut self) -> Option<HttpRequestData> {
        self.requests.pop_front()
    }
}

/// Protocol plug for the engine: one `HttpSession` per accepted socket.
pub struct HttpProtocol {
    vhosts: Arc<VHostConfig>,
    idle_timeout: u32,
}

impl HttpProtocol {
    pub fn new(vhosts: Arc<VHostConfig>, idle_timeout: u32) -> Self {
        Self { vhosts, idle_timeout }
    }

    pub fn vhosts(&self) -> &Arc<VHostConfig> {
        &self.vhosts
    }
}

impl Protocol for HttpProtocol {
    type Session = HttpSession;

    fn new_session(&self) -> HttpSession {
        HttpSession::new(Arc::clone(&self.vhosts))
    }

    fn idle_timeout(&self) -> u32 {
        self.idle_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> HttpSession {
        HttpSession::new(Arc::new(VHostConfig::empty()))
    }

    #[test]
    fn byte_at_a_time_request_completes_on_final_crlf() {
        let raw = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let mut sess = session();
        let mut buf = Buffer::new();

        for (i, byte) in raw.iter().enumerate() {
            buf.append(std::slice::from_ref(byte));
            assert!(sess.do_parse(&mut buf), "parse error at byte {i}");
            if i + 1 < raw.len() {
                assert_eq!(sess.pending_requests(), 0, "request completed early at byte {i}");
            }
        }

        assert_eq!(sess.pending_requests(), 1);
        let req = sess.pop_request().expect("request");
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.path, "/");
        assert_eq!(req.version_major, 1);
        assert_eq!(req.version_minor, 1);
        assert_eq!(req.find_header_value("Host"), Some("example.com"));
        assert_eq!(req.content_length, 0);
        assert!(req.keep_alive, "HTTP/1.1 defaults to keep-alive");
        assert!(buf.is_empty(), "header bytes must be consumed");
    }

    #[test]
    fn content_length_body_stays_in_the_buffer() {
        let mut sess = session();
        let mut buf = Buffer::new();
        buf.append(b"GET / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello");

        assert!(sess.do_parse(&mut buf));
        assert_eq!(sess.pending_requests(), 1);
        assert!(sess.is_ready(buf.size()));

        let req = sess.pop_request().expect("request");
        assert_eq!(req.content_length, 5);
        let mut body = [0u8; 5];
        assert!(buf.copy_front(&mut body), "body must remain buffered for the handler");
        assert_eq!(&body, b"hello");
    }

    #[test]
    fn small_body_not_yet_buffered_is_not_ready() {
        let mut sess = session();
        let mut buf = Buffer::new();
        buf.append(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nhel");

        assert!(sess.do_parse(&mut buf));
        assert_eq!(sess.pending_requests(), 1);
        assert!(!sess.is_ready(buf.size()), "3 of 10 body bytes buffered");

        buf.append(b"lo world!!");
        assert!(sess.is_ready(buf.size()));
    }

    #[test]
    fn pipelined_requests_come_out_in_order() {
        let mut sess = session();
        let mut buf = Buffer::new();
        buf.append(
            b"GET /first HTTP/1.1\r\nHost: a\r\n\r\n\
              GET /second HTTP/1.1\r\nHost: b\r\n\r\n\
              GET /third HTTP/1.1\r\nHost: c\r\n\r\n",
        );

        assert!(sess.do_parse(&mut buf));
        assert_eq!(sess.pending_requests(), 3);
        let paths: Vec<String> = (0..3).map(|_| sess.pop_request().expect("req").path).collect();
        assert_eq!(paths, vec!["/first", "/second", "/third"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn pipelining_pauses_behind_an_unconsumed_body() {
        let mut sess = session();
        let mut buf = Buffer::new();
        buf.append(
            b"POST /upload HTTP/1.1\r\nContent-Length: 4\r\n\r\nbodyGET /next HTTP/1.1\r\n\r\n",
        );

        assert!(sess.do_parse(&mut buf));
        assert_eq!(sess.pending_requests(), 1, "second request must wait for the body");

        // the handler consumes the body, then parsing resumes
        let _first = sess.pop_request().expect("first request");
        assert!(buf.pop(4));
        assert!(sess.do_parse(&mut buf));
        assert_eq!(sess.pending_requests(), 1);
        assert_eq!(sess.pop_request().expect("second request").path, "/next");
    }

    #[test]
    fn chunked_body_is_decoded_into_the_chunk_buffer() {
        let mut sess = session();
        let mut buf = Buffer::new();
        buf.append(
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
              5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
        );

        assert!(sess.do_parse(&mut buf));
        assert_eq!(sess.pending_requests(), 1);
        let req = sess.pop_request().expect("request");
        assert!(req.chunked);
        let mut body = vec![0u8; req.chunk_buffer.size()];
        assert!(req.chunk_buffer.copy_front(&mut body));
        assert_eq!(body, b"hello world");
        assert!(buf.is_empty());
    }

    #[test]
    fn chunked_body_split_across_ticks() {
        let mut sess = session();
        let mut buf = Buffer::new();
        buf.append(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhel");
        assert!(sess.do_parse(&mut buf));
        assert_eq!(sess.pending_requests(), 0);

        buf.append(b"lo\r\n0\r\n\r\n");
        assert!(sess.do_parse(&mut buf));
        assert_eq!(sess.pending_requests(), 1);
        let req = sess.pop_request().expect("request");
        let mut body = vec![0u8; req.chunk_buffer.size()];
        assert!(req.chunk_buffer.copy_front(&mut body));
        assert_eq!(body, b"hello");
    }

    #[test]
    fn keep_alive_follows_version_and_connection_header() {
        let cases: &[(&[u8], bool)] = &[
            (b"GET / HTTP/1.1\r\nHost: a\r\n\r\n", true),
            (b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n", false),
            (b"GET / HTTP/1.0\r\nHost: a\r\n\r\n", false),
            (b"GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n", true),
        ];
        for (raw, expected) in cases {
            let mut sess = session();
            let mut buf = Buffer::new();
            buf.append(raw);
            assert!(sess.do_parse(&mut buf));
            let req = sess.pop_request().expect("request");
            assert_eq!(
                req.keep_alive,
                *expected,
                "wrong keep-alive for {}",
                String::from_utf8_lossy(raw)
            );
        }
    }

    #[test]
    fn garbage_input_reports_a_protocol_error() {
        let mut sess = session();
        let mut buf = Buffer::new();
        buf.append(b"\x00\x01\x02 this is not http\r\n\r\n");
        assert!(!sess.do_parse(&mut buf));
        assert!(sess.has_error());
    }

    #[test]
    fn query_and_fragment_split_off_the_path() {
        let mut sess = session();
        let mut buf = Buffer::new();
        buf.append(b"GET /search?q=rust&x=1#results HTTP/1.1\r\nHost: a\r\n\r\n");
        assert!(sess.do_parse(&mut buf));
        let req = sess.pop_request().expect("request");
        assert_eq!(req.path, "/search");
        assert_eq!(req.query_string, "q=rust&x=1");
        assert_eq!(req.fragment, "results");
        assert_eq!(req.uri, "/search?q=rust&x=1#results");
    }
}
