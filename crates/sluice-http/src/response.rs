use std::{fmt::Write as _, io, os::fd::OwnedFd, sync::Arc};

use sluice::{Buffer, Stage};
use tracing::debug;

use crate::{session::HttpProtocol, status::HttpStatus, HttpConnection, HttpPipeline};

/// Once committed output exceeds this, `respond` drains inline instead of
/// letting memory grow with the response.
pub const MAX_RESPONSE_MEMORY: usize = 4 << 20;

/// Builds one response into the connection's output stream.
///
/// Body bytes written before `respond` land in a prepare buffer; `respond`
/// emits the status line and headers, then commits the prepare buffer as a
/// sink. If the stream has not finished draining when the builder is
/// dropped, the connection is queued into the write-back stage and the
/// remaining bytes leave asynchronously.
pub struct HttpResponse<'a> {
    conn: &'a Arc<HttpConnection>,
    pipeline: &'a Arc<HttpPipeline>,
    write_back: Option<Arc<dyn Stage<HttpProtocol>>>,
    headers: Vec<(String, String)>,
    content_length: Option<i64>,
    use_content_length: bool,
    prepare: Buffer,
    responded: bool,
    closed: bool,
}

impl<'a> HttpResponse<'a> {
    pub fn new(conn: &'a Arc<HttpConnection>, pipeline: &'a Arc<HttpPipeline>) -> Self {
        Self {
            conn,
            pipeline,
            write_back: pipeline.find_stage("write_back"),
            headers: Vec::new(),
            content_length: None,
            use_content_length: true,
            prepare: Buffer::new(),
            responded: false,
            closed: false,
        }
    }

    /// Adds a header line. `Content-Length` (any case) is captured into the
    /// typed field instead of being emitted twice.
    pub fn add_header(&mut self, key: &str, value: &str) {
        if key.eq_ignore_ascii_case("content-length") {
            self.content_length = value.trim().parse().ok();
        } else {
            self.headers.push((key.to_string(), value.to_string()));
        }
    }

    pub fn set_content_length(&mut self, length: i64) {
        self.content_length = Some(length);
    }

    pub fn content_length(&self) -> Option<i64> {
        self.content_length
    }

    pub fn enable_content_length(&mut self, enabled: bool) {
        self.use_content_length = enabled;
    }

    pub fn has_content_length(&self) -> bool {
        self.use_content_length
    }

    /// Stages body bytes; nothing reaches the socket until `respond`.
    pub fn write_data(&mut self, data: &[u8]) -> usize {
        self.prepare.append(data);
        data.len()
    }

    pub fn write_string(&mut self, text: &str) -> usize {
        self.write_data(text.as_bytes())
    }

    /// Queues a file range directly onto the output stream; call after
    /// `respond` so the bytes follow the header section.
    pub fn write_file(&mut self, file: OwnedFd, offset: i64, length: i64) -> io::Result<i64> {
        self.conn.streams().output.append_file(file, offset, length)
    }

    /// Emits `HTTP/1.1 <code> <reason>`, the headers, the automatic
    /// `Content-Length` (unless disabled), the blank separator, and then
    /// commits the prepare buffer.
    pub fn respond(&mut self, status: HttpStatus) {
        let content_length =
            self.content_length.unwrap_or_else(|| self.prepare.size() as i64);

        let mut head = format!("HTTP/1.1 {} {}\r\n", status.code, status.reason);
        for (key, value) in &self.headers {
            let _ = write!(head, "{key}: {value}\r\n");
        }
        if self.use_content_length {
            let _ = write!(head, "Content-Length: {content_length}\r\n");
        }
        head.push_str("\r\n");

        let memory_usage = {
            let mut streams = self.conn.streams();
            streams.output.append_data(head.as_bytes());
            if !self.prepare.is_empty() {
                streams.output.append_buffer(&self.prepare);
            }
            streams.output.memory_usage()
        };
        self.responded = true;
        self.clear_head();

        if memory_usage > MAX_RESPONSE_MEMORY {
            if let Err(err) = self.flush_data() {
                debug!(fd = self.conn.fd(), %err, "inline flush stalled");
            }
        }
    }

    fn clear_head(&mut self) {
        self.headers.clear();
        self.prepare = Buffer::new();
        self.content_length = None;
        self.use_content_length = true;
    }

    /// Makes the builder reusable for the next request on the same
    /// connection.
    pub fn reset(&mut self) {
        self.clear_head();
        self.responded = false;
    }

    pub fn is_responded(&self) -> bool {
        self.responded
    }

    /// Negative while committed output is still draining; the stage runner
    /// treats that as "keep the connection lock".
    pub fn response_code(&self) -> i32 {
        if !self.closed && !self.conn.streams().output.is_done() {
            -1
        } else {
            0
        }
    }

    /// Synchronous drain: the connection leaves the readiness set and the
    /// socket blocks (bounded by its send timeout) until the stream is empty
    /// or the kernel pushes back.
    pub fn flush_data(&mut self) -> io::Result<usize> {
        self.pipeline.disable_poll(self.conn);
        let mut total = 0;
        let result = loop {
            let progress = self.conn.streams().output.write_into_output();
            match progress {
                Ok(0) => break Ok(total),
                Ok(n) => total += n,
                Err(err) => break Err(err),
            }
        };
        self.pipeline.enable_poll(self.conn);
        result
    }

    /// Drops the connection from the server side.
    pub fn close(&mut self) {
        self.closed = true;
        self.pipeline.active_close(self.conn);
    }
}

impl Drop for HttpResponse<'_> {
    fn drop(&mut self) {
        if self.response_code() < 0 {
            if let Some(write_back) = &self.write_back {
                write_back.sched_add(self.conn);
            }
        }
    }
}
