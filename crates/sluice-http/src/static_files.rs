use std::{
    ffi::CString,
    fmt::Write as _,
    fs, mem,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::{debug, warn};

use crate::{
    handler::{HandlerOptions, HttpHandler, HttpHandlerFactory},
    method::Method,
    request::HttpRequest,
    response::HttpResponse,
    status::HttpStatus,
};

/// Serves files under a document root: ranges, conditional requests, and
/// optional directory listings. Bodies go out as file-range sinks, so the
/// kernel moves the bytes.
pub struct StaticFileHandler {
    doc_root: PathBuf,
    error_root: Option<PathBuf>,
    allow_index: bool,
}

pub struct StaticFileHandlerFactory;

impl HttpHandlerFactory for StaticFileHandlerFactory {
    fn create(&self, options: &HandlerOptions) -> Arc<dyn HttpHandler> {
        Arc::new(StaticFileHandler {
            doc_root: PathBuf::from(options.get_or("doc_root", "/var/www")),
            error_root: options.get("error_root").map(PathBuf::from),
            allow_index: options.get_bool("allow_index", true),
        })
    }

    fn module_name(&self) -> &'static str {
        "static"
    }

    fn vendor_name(&self) -> &'static str {
        "sluice"
    }
}

/// Drops `.` and `..` segments outright; the document root is the ceiling.
fn remove_path_dots(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for segment in path.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            continue;
        }
        out.push('/');
        out.push_str(segment);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "txt" => "text/plain",
        "xml" => "application/xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

fn format_http_date(secs: i64) -> String {
    let time = secs as libc::time_t;
    let mut tm: libc::tm = unsafe { mem::zeroed() };
    unsafe {
        libc::gmtime_r(&time, &mut tm);
    }
    let mut buf = [0u8; 64];
    let fmt = b"%a, %d %b %Y %H:%M:%S GMT\0";
    let n = unsafe {
        libc::strftime(buf.as_mut_ptr().cast::<libc::c_char>(), buf.len(), fmt.as_ptr().cast(), &tm)
    };
    String::from_utf8_lossy(&buf[..n]).into_owned()
}

fn parse_http_date(text: &str) -> Option<i64> {
    let text = CString::new(text).ok()?;
    let fmt = CString::new("%a, %d %b %Y %H:%M:%S GMT").ok()?;
    let mut tm: libc::tm = unsafe { mem::zeroed() };
    let end = unsafe { libc::strptime(text.as_ptr(), fmt.as_ptr(), &mut tm) };
    if end.is_null() {
        return None;
    }
    Some(unsafe { libc::timegm(&mut tm) })
}

fn build_etag(path: &Path, mtime: i64, size: u64) -> String {
    let seed = format!("{}:{mtime}:{size}", path.display());
    let mut hash: u32 = 0x4F7E_0912;
    for (i, byte) in seed.bytes().enumerate() {
        hash = hash.wrapping_add(u32::from(byte) << (i & 0x0F));
    }
    format!("{hash:x}")
}

/// Single-range `bytes=a-b` form. Returns (offset, length), length −1 for
/// an open end. Anything else is treated as no range at all.
fn parse_range(desc: &str) -> Option<(i64, i64)> {
    let spec = desc.trim().strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let offset: i64 = start.trim().parse().ok()?;
    let length = if end.trim().is_empty() {
        -1
    } else {
        let end: i64 = end.trim().parse().ok()?;
        end - offset + 1
    };
    Some((offset, length))
}

impl StaticFileHandler {
    fn validate_client_cache(&self, request: &HttpRequest<'_>, mtime: i64, etag: &str) -> bool {
        if let Some(since) = request.find_header_value("If-Modified-Since") {
            if let Some(since_secs) = parse_http_date(since) {
                if mtime > since_secs {
                    return false;
                }
                if let Some(inm) = request.find_header_value("If-None-Match") {
                    if inm != etag {
                        return false;
                    }
                }
                return true;
            }
        }
        request.find_header_value("If-None-Match").is_some_and(|inm| inm == etag)
    }

    fn respond_error(
        &self,
        error: HttpStatus,
        request: &HttpRequest<'_>,
        response: &mut HttpResponse<'_>,
    ) {
        warn!(code = error.code, uri = %request.uri(), "static handler error");
        response.add_header("Content-Type", "text/html");

        if let Some(error_root) = &self.error_root {
            let page = error_root.join(format!("{}.html", error.code));
            if let (Ok(meta), Ok(file)) = (fs::metadata(&page), fs::File::open(&page)) {
                response.set_content_length(meta.len() as i64);
                response.respond(error);
                if let Err(err) = response.write_file(file.into(), 0, -1) {
                    warn!(%err, "cannot stream error page");
                }
                return;
            }
        }

        let body = format!(
            "<html><head><title>{reason}</title></head><body>\
             <h1>{code} - {reason}</h1></body></html>\n",
            code = error.code,
            reason = error.reason,
        );
        response.write_string(&body);
        response.respond(error);
    }

    fn respond_file_content(
        &self,
        path: &Path,
        meta: &fs::Metadata,
        request: &HttpRequest<'_>,
        response: &mut HttpResponse<'_>,
    ) {
        let file_size = meta.len() as i64;
        let mtime = meta.mtime();
        let etag = build_etag(path, mtime, meta.len());

        if self.validate_client_cache(request, mtime, &etag) {
            response.respond(HttpStatus::NOT_MODIFIED);
            return;
        }

        let mut status = HttpStatus::OK;
        let mut offset = 0i64;
        let mut length = file_size;
        if let Some(range) = request.find_header_value("Range").and_then(parse_range) {
            offset = range.0;
            length = if range.1 < 0 { file_size - offset } else { range.1 };
            if offset < 0 || length <= 0 || offset + length > file_size {
                response.add_header("Content-Range", &format!("bytes */{file_size}"));
                self.respond_error(
                    HttpStatus::REQUESTED_RANGE_NOT_SATISFIABLE,
                    request,
                    response,
                );
                return;
            }
            response.add_header(
                "Content-Range",
                &format!("bytes {}-{}/{}", offset, offset + length - 1, file_size),
            );
            status = HttpStatus::PARTIAL_CONTENT;
        }

        response.set_content_length(length);
        response.add_header("Last-Modified", &format_http_date(mtime));
        response.add_header("ETag", &etag);
        response.add_header("Content-Type", content_type_for(path));

        if request.method() == Method::Head {
            response.respond(status);
            return;
        }
        let file = match fs::File::open(path) {
            Ok(file) => file,
            Err(err) => {
                debug!(path = %path.display(), %err, "cannot open file");
                self.respond_error(HttpStatus::FORBIDDEN, request, response);
                return;
            }
        };
        response.respond(status);
        if let Err(err) = response.write_file(file.into(), offset, length) {
            warn!(path = %path.display(), %err, "cannot queue file range");
        }
    }

    fn respond_directory_list(
        &self,
        path: &Path,
        href_path: &str,
        request: &HttpRequest<'_>,
        response: &mut HttpResponse<'_>,
    ) {
        let Ok(entries) = fs::read_dir(path) else {
            self.respond_error(HttpStatus::FORBIDDEN, request, response);
            return;
        };

        let mut page = format!(
            "<html><head><title>Directory List {href_path}</title></head><body>\n\
             <h1>Index of {href_path}</h1>\n<table>\n",
        );
        if href_path != "/" {
            page.push_str("<tr class=\"parent\"><td><a href=\"..\">Parent Directory</a></td></tr>\n");
        }
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Ok(meta) = entry.metadata() else { continue };
            if meta.is_dir() {
                let _ = write!(
                    page,
                    "<tr class=\"directory\"><td><a href=\"{name}/\">{name}/</a></td><td>-</td></tr>\n"
                );
            } else if meta.is_file() {
                let _ = write!(
                    page,
                    "<tr class=\"regular\"><td><a href=\"{name}\">{name}</a></td><td>{}</td></tr>\n",
                    meta.len()
                );
            }
        }
        page.push_str("</table></body></html>\n");

        response.add_header("Content-Type", "text/html");
        if request.method() == Method::Head {
            response.set_content_length(page.len() as i64);
        } else {
            response.write_string(&page);
        }
        response.respond(HttpStatus::OK);
    }
}

impl HttpHandler for StaticFileHandler {
    fn handle_request(&self, request: &mut HttpRequest<'_>, response: &mut HttpResponse<'_>) {
        if !matches!(request.method(), Method::Get | Method::Post | Method::Head) {
            self.respond_error(HttpStatus::BAD_REQUEST, request, response);
            return;
        }

        let filename = remove_path_dots(&HttpRequest::url_decode(request.path()));
        let filepath = self.doc_root.join(filename.trim_start_matches('/'));
        let meta = match fs::metadata(&filepath) {
            Ok(meta) => meta,
            Err(err) => {
                debug!(path = %filepath.display(), %err, "cannot stat file");
                self.respond_error(HttpStatus::NOT_FOUND, request, response);
                return;
            }
        };

        if meta.is_file() {
            self.respond_file_content(&filepath, &meta, request, response);
        } else if meta.is_dir() {
            let index = filepath.join("index.html");
            if let Ok(index_meta) = fs::metadata(&index) {
                if index_meta.is_file() {
                    self.respond_file_content(&index, &index_meta, request, response);
                    return;
                }
            }
            if self.allow_index {
                self.respond_directory_list(&filepath, &filename, request, response);
            } else {
                self.respond_error(HttpStatus::FORBIDDEN, request, response);
            }
        } else {
            self.respond_error(HttpStatus::FORBIDDEN, request, response);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dot_segments_are_dropped() {
        assert_eq!(remove_path_dots("/a/./b/../c"), "/a/b/c");
        assert_eq!(remove_path_dots("/../../etc/passwd"), "/etc/passwd");
        assert_eq!(remove_path_dots("/"), "/");
        assert_eq!(remove_path_dots("/plain/file.txt"), "/plain/file.txt");
    }

    #[test]
    fn range_header_parses_single_ranges() {
        assert_eq!(parse_range("bytes=2-6"), Some((2, 5)));
        assert_eq!(parse_range("bytes=10-"), Some((10, -1)));
        assert_eq!(parse_range("lines=1-2"), None);
        assert_eq!(parse_range("bytes=a-b"), None);
    }

    #[test]
    fn http_dates_roundtrip() {
        let formatted = format_http_date(0);
        assert_eq!(formatted, "Thu, 01 Jan 1970 00:00:00 GMT");
        assert_eq!(parse_http_date(&formatted), Some(0));
        assert_eq!(parse_http_date("not a date"), None);
    }

    #[test]
    fn etag_tracks_file_identity() {
        let a = build_etag(Path::new("/a"), 100, 10);
        let same = build_etag(Path::new("/a"), 100, 10);
        let newer = build_etag(Path::new("/a"), 200, 10);
        assert_eq!(a, same);
        assert_ne!(a, newer);
    }
}
