//! HTTP/1.1 request parsing, static-file resolution, and response assembly
//! (§4.8). One request per connection: every response this module builds
//! carries `Connection: close`, and the caller tears the socket down once
//! the write completes.

use std::fs;
use std::path::{Component, Path, PathBuf};

const MAX_REQUEST_LINE: usize = 8 * 1024;
const MAX_HEADER_BYTES: usize = 64 * 1024;
const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
}

impl Method {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Method::Get),
            "HEAD" => Some(Method::Head),
            "POST" => Some(Method::Post),
            _ => None,
        }
    }
}

/// The parser's state machine, mirroring the stages the source's
/// `http_conn::process_read` switches over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    RequestLine,
    Headers,
    Body,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    BadRequest,
    NotFound,
    NotImplemented,
}

impl Status {
    fn code_reason(self) -> (u16, &'static str) {
        match self {
            Status::Ok => (200, "OK"),
            Status::BadRequest => (400, "Bad Request"),
            Status::NotFound => (404, "Not Found"),
            Status::NotImplemented => (501, "Not Implemented"),
        }
    }
}

struct ParsedRequest {
    method: Option<Method>,
    target: String,
    content_length: usize,
}

/// Per-connection parser + response state. One instance lives in each
/// `Slot` and is reset (`HttpConn::new`) whenever a slot is reused.
pub struct HttpConn {
    state: ParseState,
    inbuf: Vec<u8>,
    /// `None` once parsed if the request used a method this core doesn't
    /// recognize (e.g. `TRACE`, `PUT`); such requests still parse fully,
    /// they just map to `501 Not Implemented` at response time.
    method: Option<Method>,
    target: String,
    content_length: usize,
    body_read: usize,
    response: Option<Vec<u8>>,
    written: usize,
}

impl HttpConn {
    pub fn new() -> Self {
        Self {
            state: ParseState::RequestLine,
            inbuf: Vec::new(),
            method: None,
            target: String::new(),
            content_length: 0,
            body_read: 0,
            response: None,
            written: 0,
        }
    }

    /// Feed newly read bytes into the parser. Returns `true` once a full
    /// request (request line + headers + any body) has been consumed.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<bool, Status> {
        self.inbuf.extend_from_slice(bytes);

        loop {
            match self.state {
                ParseState::RequestLine => {
                    let Some(pos) = find_crlf(&self.inbuf) else {
                        if self.inbuf.len() > MAX_REQUEST_LINE {
                            return Err(Status::BadRequest);
                        }
                        return Ok(false);
                    };
                    let line = take_line(&mut self.inbuf, pos);
                    let parsed = parse_request_line(&line).ok_or(Status::BadRequest)?;
                    self.method = parsed.method;
                    self.target = parsed.target;
                    self.content_length = parsed.content_length;
                    self.state = ParseState::Headers;
                }
                ParseState::Headers => {
                    let Some(pos) = find_crlf(&self.inbuf) else {
                        if self.inbuf.len() > MAX_HEADER_BYTES {
                            return Err(Status::BadRequest);
                        }
                        return Ok(false);
                    };
                    let line = take_line(&mut self.inbuf, pos);
                    if line.is_empty() {
                        self.state = if self.content_length > 0 {
                            ParseState::Body
                        } else {
                            ParseState::Done
                        };
                        continue;
                    }
                    if let Some(len) = parse_content_length(&line) {
                        if len > MAX_BODY_BYTES {
                            return Err(Status::BadRequest);
                        }
                        self.content_length = len;
                    }
                }
                ParseState::Body => {
                    let remaining = self.content_length - self.body_read;
                    let take = remaining.min(self.inbuf.len());
                    self.body_read += take;
                    self.inbuf.drain(..take);
                    if self.body_read >= self.content_length {
                        self.state = ParseState::Done;
                    } else {
                        return Ok(false);
                    }
                }
                ParseState::Done => return Ok(true),
            }
        }
    }

    /// Build the response for the request just parsed by `feed`. `doc_root`
    /// is the directory static targets resolve under.
    pub fn build_response(&mut self, doc_root: &Path) {
        let Some(method) = self.method else {
            self.response = Some(assemble(Status::NotImplemented, Vec::new(), mime_for(".txt")));
            return;
        };
        // CGI/login form submission is explicitly out of scope; the
        // request still parses fully, it just never reaches a backend.
        if method == Method::Post {
            self.response = Some(assemble(Status::NotImplemented, Vec::new(), mime_for(".txt")));
            return;
        }

        let body = match resolve_static(doc_root, &self.target) {
            Ok(bytes) => bytes,
            Err(status) => {
                self.response = Some(assemble(status, Vec::new(), mime_for(".txt")));
                return;
            }
        };

        let mime = mime_for(&self.target);
        let body = if method == Method::Head { Vec::new() } else { body };
        self.response = Some(assemble(Status::Ok, body, mime));
    }

    /// Bytes remaining to write. `None` once the response is fully sent.
    pub fn pending_write(&self) -> Option<&[u8]> {
        let response = self.response.as_ref()?;
        if self.written >= response.len() {
            return None;
        }
        Some(&response[self.written..])
    }

    pub fn advance_write(&mut self, n: usize) {
        self.written += n;
    }

    pub fn write_complete(&self) -> bool {
        matches!(self.response, Some(ref r) if self.written >= r.len())
    }
}

impl Default for HttpConn {
    fn default() -> Self {
        Self::new()
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn take_line(buf: &mut Vec<u8>, crlf_pos: usize) -> String {
    let line = String::from_utf8_lossy(&buf[..crlf_pos]).into_owned();
    buf.drain(..crlf_pos + 2);
    line
}

fn parse_request_line(line: &str) -> Option<ParsedRequest> {
    let mut parts = line.split(' ');
    let method_str = parts.next()?;
    let target = parts.next()?;
    let version = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    if !version.starts_with("HTTP/1.") {
        return None;
    }
    if !target.starts_with('/') {
        return None;
    }
    if method_str.is_empty() || !method_str.chars().all(|c| c.is_ascii_uppercase()) {
        return None;
    }
    Some(ParsedRequest {
        method: Method::parse(method_str),
        target: target.to_string(),
        content_length: 0,
    })
}

fn parse_content_length(header_line: &str) -> Option<usize> {
    let (name, value) = header_line.split_once(':')?;
    if !name.trim().eq_ignore_ascii_case("content-length") {
        return None;
    }
    value.trim().parse().ok()
}

/// Resolves `target` under `doc_root`, rejecting `..` traversal and falling
/// back to `index.html` for directories.
fn resolve_static(doc_root: &Path, target: &str) -> Result<Vec<u8>, Status> {
    let relative = target.trim_start_matches('/');
    let relative = relative.split('?').next().unwrap_or(relative);
    let candidate = PathBuf::from(relative);

    for component in candidate.components() {
        if matches!(component, Component::ParentDir) {
            return Err(Status::BadRequest);
        }
    }

    let mut path = doc_root.join(&candidate);
    if relative.is_empty() || path.is_dir() {
        path = path.join("index.html");
    }

    fs::read(&path).map_err(|_| Status::NotFound)
}

fn mime_for(target: &str) -> &'static str {
    let ext = Path::new(target)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");
    match ext {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "txt" => "text/plain",
        _ => mime_guess::from_path(target)
            .first_raw()
            .unwrap_or("application/octet-stream"),
    }
}

fn assemble(status: Status, body: Vec<u8>, content_type: &str) -> Vec<u8> {
    let (code, reason) = status.code_reason();
    let mut out = format!(
        "HTTP/1.1 {code} {reason}\r\n\
         Content-Length: {}\r\n\
         Content-Type: {content_type}\r\n\
         Connection: close\r\n\
         Server: tinyhttpd\r\n\r\n",
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(&body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn doc_root() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let mut f = fs::File::create(dir.path().join("index.html")).unwrap();
        f.write_all(b"<html>hi</html>").unwrap();
        dir
    }

    #[test]
    fn parses_simple_get_and_serves_index() {
        let root = doc_root();
        let mut conn = HttpConn::new();
        let done = conn.feed(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert!(done);
        conn.build_response(root.path());
        let resp = conn.response.as_ref().unwrap();
        let text = String::from_utf8_lossy(resp);
        assert!(text.starts_with("HTTP/1.1 200 OK"));
        assert!(text.contains("Connection: close"));
        assert!(text.ends_with("<html>hi</html>"));
    }

    #[test]
    fn head_omits_body() {
        let root = doc_root();
        let mut conn = HttpConn::new();
        conn.feed(b"HEAD / HTTP/1.1\r\n\r\n").unwrap();
        conn.build_response(root.path());
        let resp = conn.response.as_ref().unwrap();
        assert!(resp.ends_with(b"\r\n\r\n"));
    }

    #[test]
    fn missing_file_is_404() {
        let root = doc_root();
        let mut conn = HttpConn::new();
        conn.feed(b"GET /nope.html HTTP/1.1\r\n\r\n").unwrap();
        conn.build_response(root.path());
        let resp = conn.response.as_ref().unwrap();
        assert!(String::from_utf8_lossy(resp).starts_with("HTTP/1.1 404"));
    }

    #[test]
    fn path_traversal_is_rejected() {
        let root = doc_root();
        let mut conn = HttpConn::new();
        conn.feed(b"GET /../../etc/passwd HTTP/1.1\r\n\r\n").unwrap();
        conn.build_response(root.path());
        let resp = conn.response.as_ref().unwrap();
        assert!(String::from_utf8_lossy(resp).starts_with("HTTP/1.1 400"));
    }

    #[test]
    fn unsupported_method_is_501() {
        let root = doc_root();
        let mut conn = HttpConn::new();
        let done = conn.feed(b"TRACE / HTTP/1.1\r\n\r\n").unwrap();
        assert!(done);
        conn.build_response(root.path());
        let resp = conn.response.as_ref().unwrap();
        assert!(String::from_utf8_lossy(resp).starts_with("HTTP/1.1 501"));
    }

    #[test]
    fn post_is_501_not_implemented() {
        let root = doc_root();
        let mut conn = HttpConn::new();
        conn.feed(b"POST /login HTTP/1.1\r\nContent-Length: 0\r\n\r\n")
            .unwrap();
        conn.build_response(root.path());
        let resp = conn.response.as_ref().unwrap();
        assert!(String::from_utf8_lossy(resp).starts_with("HTTP/1.1 501"));
    }

    #[test]
    fn malformed_request_line_is_400() {
        let mut conn = HttpConn::new();
        let result = conn.feed(b"not a request\r\n\r\n");
        assert_eq!(result, Err(Status::BadRequest));
    }

    #[test]
    fn post_with_body_waits_for_full_body() {
        let mut conn = HttpConn::new();
        let done = conn
            .feed(b"POST /login HTTP/1.1\r\nContent-Length: 10\r\n\r\n12345")
            .unwrap();
        assert!(!done);
        let done = conn.feed(b"67890").unwrap();
        assert!(done);
    }
}
