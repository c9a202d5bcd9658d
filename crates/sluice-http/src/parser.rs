use std::collections::VecDeque;

use sluice::Buffer;
use tracing::debug;

use crate::{config::VHostConfig, method::Method, session::HttpRequestData};

/// Header section cap; a request line plus headers that never completes
/// within this window is a protocol error.
pub const MAX_HEADER_SIZE: usize = 16 * 1024;
const MAX_HEADERS: usize = 64;
const CHUNK_SIZE_LINE_LIMIT: usize = 32;
const TRAILER_LINE_LIMIT: usize = 1024;

#[derive(Clone, Copy)]
enum State {
    /// Accumulating a request line + header section.
    Headers,
    /// Expecting a chunk-size line.
    ChunkSize,
    /// Streaming chunk payload bytes into the pending request.
    ChunkData { remaining: usize },
    /// Expecting the CRLF that terminates a chunk payload.
    ChunkDataEnd,
    /// Skipping trailer lines until the blank terminator.
    Trailer,
    Failed,
}

enum HeaderOutcome {
    Done(HttpRequestData),
    NeedMore,
    Bad,
}

/// Incremental request parser. State persists across scheduler ticks; each
/// call consumes whatever prefix of the input buffer it can make sense of.
pub struct RequestParser {
    state: State,
    /// Request whose chunked body is still being decoded.
    pending: Option<HttpRequestData>,
}

impl RequestParser {
    pub fn new() -> Self {
        Self { state: State::Headers, pending: None }
    }

    pub fn has_error(&self) -> bool {
        matches!(self.state, State::Failed)
    }

    /// Feeds the buffer through the state machine, appending completed
    /// requests to `out`. Content-length bodies are intentionally left in
    /// the buffer: the handler streams them. Returns false once the input
    /// stops being valid HTTP.
    pub fn drive(
        &mut self,
        buf: &mut Buffer,
        vhosts: &VHostConfig,
        out: &mut VecDeque<HttpRequestData>,
    ) -> bool {
        loop {
            match self.state {
                State::Failed => return false,
                State::Headers => {
                    if let Some(last) = out.back() {
                        if last.content_length > 0 && !last.chunked {
                            // the body is a stream for the handler to drain;
                            // parsing resumes once it has been consumed
                            return true;
                        }
                    }
                    if buf.is_empty() {
                        return true;
                    }
                    match self.parse_headers(buf) {
                        HeaderOutcome::NeedMore => return true,
                        HeaderOutcome::Bad => {
                            self.state = State::Failed;
                            return false;
                        }
                        HeaderOutcome::Done(mut request) => {
                            if request.chunked {
                                self.pending = Some(request);
                                self.state = State::ChunkSize;
                            } else {
                                finish_request(&mut request, vhosts);
                                out.push_back(request);
                            }
                        }
                    }
                }
                State::ChunkSize => match read_line(buf, CHUNK_SIZE_LINE_LIMIT) {
                    Err(()) => {
                        self.state = State::Failed;
                        return false;
                    }
                    Ok(None) => return true,
                    Ok(Some(line)) => match parse_chunk_size(&line) {
                        Some(0) => self.state = State::Trailer,
                        Some(size) => self.state = State::ChunkData { remaining: size },
                        None => {
                            self.state = State::Failed;
                            return false;
                        }
                    },
                },
                State::ChunkData { remaining } => {
                    if buf.is_empty() {
                        return true;
                    }
                    let take = remaining.min(buf.size());
                    let mut piece = vec![0; take];
                    buf.copy_front(&mut piece);
                    buf.pop(take);
                    if let Some(pending) = self.pending.as_mut() {
                        pending.chunk_buffer.append(&piece);
                    }
                    if take == remaining {
                        self.state = State::ChunkDataEnd;
                    } else {
                        self.state = State::ChunkData { remaining: remaining - take };
                    }
                }
                State::ChunkDataEnd => {
                    if buf.size() < 2 {
                        return true;
                    }
                    let mut crlf = [0u8; 2];
                    buf.copy_front(&mut crlf);
                    buf.pop(2);
                    if &crlf != b"\r\n" {
                        self.state = State::Failed;
                        return false;
                    }
                    self.state = State::ChunkSize;
                }
                State::Trailer => match read_line(buf, TRAILER_LINE_LIMIT) {
                    Err(()) => {
                        self.state = State::Failed;
                        return false;
                    }
                    Ok(None) => return true,
                    Ok(Some(line)) => {
                        if line.is_empty() {
                            if let Some(mut request) = self.pending.take() {
                                finish_request(&mut request, vhosts);
                                out.push_back(request);
                            }
                            self.state = State::Headers;
                        }
                        // non-empty trailer lines are skipped
                    }
                },
            }
        }
    }

    fn parse_headers(&mut self, buf: &mut Buffer) -> HeaderOutcome {
        let window = buf.size().min(MAX_HEADER_SIZE);
        let mut scratch = vec![0; window];
        if !buf.copy_front(&mut scratch) {
            return HeaderOutcome::NeedMore;
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut headers);
        match parsed.parse(&scratch) {
            Ok(httparse::Status::Complete(consumed)) => {
                let Some(request) = build_request(&parsed) else {
                    return HeaderOutcome::Bad;
                };
                buf.pop(consumed);
                HeaderOutcome::Done(request)
            }
            Ok(httparse::Status::Partial) => {
                if window >= MAX_HEADER_SIZE {
                    debug!("header section exceeded {MAX_HEADER_SIZE} bytes");
                    HeaderOutcome::Bad
                } else {
                    HeaderOutcome::NeedMore
                }
            }
            Err(err) => {
                debug!(%err, "malformed request head");
                HeaderOutcome::Bad
            }
        }
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

fn build_request(parsed: &httparse::Request<'_, '_>) -> Option<HttpRequestData> {
    let method = Method::parse(parsed.method?)?;
    let target = parsed.path?.to_string();
    let version_minor = parsed.version?;

    let headers: Vec<(String, String)> = parsed
        .headers
        .iter()
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
        .collect();

    let mut content_length = 0u64;
    let mut chunked = false;
    let mut connection_token = None;
    for (name, value) in &headers {
        if name.eq_ignore_ascii_case("content-length") {
            content_length = value.trim().parse().ok()?;
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            chunked = value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("chunked"));
        } else if name.eq_ignore_ascii_case("connection") {
            connection_token = Some(value.trim().to_string());
        }
    }

    let keep_alive = match version_minor {
        0 => connection_token
            .as_deref()
            .is_some_and(|token| token.eq_ignore_ascii_case("keep-alive")),
        _ => !connection_token
            .as_deref()
            .is_some_and(|token| token.eq_ignore_ascii_case("close")),
    };

    let (without_fragment, fragment) = match target.split_once('#') {
        Some((head, frag)) => (head.to_string(), frag.to_string()),
        None => (target.clone(), String::new()),
    };
    let (path, query_string) = match without_fragment.split_once('?') {
        Some((path, query)) => (path.to_string(), query.to_string()),
        None => (without_fragment, String::new()),
    };

    Some(HttpRequestData {
        headers,
        path,
        uri: target,
        query_string,
        fragment,
        chunk_buffer: Buffer::new(),
        method,
        content_length,
        chunked,
        version_major: 1,
        version_minor: version_minor as u8,
        keep_alive,
        url_rule: None,
    })
}

fn finish_request(request: &mut HttpRequestData, vhosts: &VHostConfig) {
    let host = request
        .headers
        .iter()
        .find(|(name, _)| name == "Host")
        .map_or_else(|| "default".to_string(), |(_, value)| value.clone());
    debug!(
        method = %request.method,
        uri = %request.uri,
        content_length = request.content_length,
        "parsed request"
    );
    request.url_rule = vhosts.match_uri(&host, request);
}

/// Pulls one CRLF-terminated line off the buffer. `Ok(None)` means the line
/// is still incomplete; exceeding `limit` without a terminator is an error.
fn read_line(buf: &mut Buffer, limit: usize) -> Result<Option<Vec<u8>>, ()> {
    let window = buf.size().min(limit);
    let mut scratch = vec![0; window];
    if !buf.copy_front(&mut scratch) {
        return Ok(None);
    }
    if let Some(pos) = scratch.windows(2).position(|pair| pair == b"\r\n") {
        buf.pop(pos + 2);
        scratch.truncate(pos);
        return Ok(Some(scratch));
    }
    if buf.size() >= limit {
        return Err(());
    }
    Ok(None)
}

fn parse_chunk_size(line: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(line).ok()?;
    // chunk extensions after ';' are ignored
    let size_part = text.split(';').next()?.trim();
    usize::from_str_radix(size_part, 16).ok()
}
