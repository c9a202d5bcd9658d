use std::{io, sync::Arc};

use crate::{
    config::UrlRule, method::Method, session::HttpRequestData, HttpConnection, HttpPipeline,
};

/// Handler-facing view of one parsed request.
///
/// While a request wrapper is alive the connection is out of the readiness
/// set and its socket is blocking, so a handler can consume the body with
/// plain reads; dropping the wrapper re-arms polling.
pub struct HttpRequest<'a> {
    conn: &'a Arc<HttpConnection>,
    pipeline: &'a Arc<HttpPipeline>,
    data: HttpRequestData,
}

impl<'a> HttpRequest<'a> {
    pub fn new(
        conn: &'a Arc<HttpConnection>,
        pipeline: &'a Arc<HttpPipeline>,
        data: HttpRequestData,
    ) -> Self {
        pipeline.disable_poll(conn);
        Self { conn, pipeline, data }
    }

    pub fn path(&self) -> &str {
        &self.data.path
    }

    pub fn uri(&self) -> &str {
        &self.data.uri
    }

    pub fn query_string(&self) -> &str {
        &self.data.query_string
    }

    pub fn fragment(&self) -> &str {
        &self.data.fragment
    }

    pub fn method(&self) -> Method {
        self.data.method
    }

    pub fn content_length(&self) -> u64 {
        self.data.content_length
    }

    pub fn is_chunked(&self) -> bool {
        self.data.chunked
    }

    pub fn version(&self) -> (u8, u8) {
        (self.data.version_major, self.data.version_minor)
    }

    pub fn keep_alive(&self) -> bool {
        self.data.keep_alive
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.data.headers
    }

    /// Exact-case header lookup, first match.
    pub fn find_header_value(&self, key: &str) -> Option<&str> {
        self.data.find_header_value(key)
    }

    pub fn find_header_values<'b>(&'b self, key: &'b str) -> Vec<&'b str> {
        self.data.find_header_values(key).collect()
    }

    pub fn url_rule(&self) -> Option<&Arc<UrlRule>> {
        self.data.url_rule.as_ref()
    }

    /// Pulls body bytes: buffered input first, then straight off the
    /// (blocking) socket. Chunked bodies come from the decoded chunk
    /// buffer instead.
    pub fn read_data(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        if dst.is_empty() {
            return Ok(0);
        }
        if self.data.chunked {
            let take = dst.len().min(self.data.chunk_buffer.size());
            if take > 0 {
                self.data.chunk_buffer.copy_front(&mut dst[..take]);
                self.data.chunk_buffer.pop(take);
            }
            return Ok(take);
        }

        {
            let mut streams = self.conn.streams();
            let buf = streams.input.buffer_mut();
            if !buf.is_empty() {
                let take = dst.len().min(buf.size());
                buf.copy_front(&mut dst[..take]);
                buf.pop(take);
                return Ok(take);
            }
        }

        let n = unsafe {
            libc::read(self.conn.fd(), dst.as_mut_ptr().cast::<libc::c_void>(), dst.len())
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Percent-decodes a request path. Malformed escapes pass through
    /// unchanged.
    pub fn url_decode(path: &str) -> String {
        let bytes = path.as_bytes();
        let mut out = Vec::with_capacity(bytes.len());
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'%' {
                let hex = bytes.get(i + 1..i + 3).and_then(|h| {
                    std::str::from_utf8(h).ok().and_then(|h| u8::from_str_radix(h, 16).ok())
                });
                if let Some(byte) = hex {
                    out.push(byte);
                    i += 3;
                    continue;
                }
            }
            out.push(bytes[i]);
            i += 1;
        }
        String::from_utf8_lossy(&out).into_owned()
    }
}

impl Drop for HttpRequest<'_> {
    fn drop(&mut self) {
        self.pipeline.enable_poll(self.conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_decode_handles_escapes_and_garbage() {
        assert_eq!(HttpRequest::url_decode("/a%20b"), "/a b");
        assert_eq!(HttpRequest::url_decode("/plain"), "/plain");
        assert_eq!(HttpRequest::url_decode("/bad%2"), "/bad%2");
        assert_eq!(HttpRequest::url_decode("/%2Fup"), "//up");
    }
}
