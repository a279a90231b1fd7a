//! Incremental HTTP/1.1 request parser.
//!
//! [`RequestParser`] consumes the connection's input buffer line by line:
//! request line, then headers, then an optional `Content-Length` body. It
//! returns [`ParseStatus::NeedMore`] whenever the buffer does not yet hold
//! a complete element, leaving the already-parsed state in place for the
//! next read. A completed request is taken out with
//! [`take_request`](RequestParser::take_request), which also resets the
//! parser for the next request on a keep-alive connection.

use std::collections::HashMap;

use super::types::{Method, Version};
use super::HttpError;
use crate::buffer::Buffer;

/// Maximum allowed request line length.
const MAX_REQUEST_LINE: usize = 8192;

/// Maximum allowed header block size.
const MAX_HEADERS_SIZE: usize = 64 * 1024;

/// Maximum number of headers.
const MAX_HEADERS: usize = 128;

/// Maximum allowed body size.
const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// Pages addressable without the `.html` suffix.
const DEFAULT_PAGES: [&str; 6] = [
    "/index",
    "/register",
    "/login",
    "/welcome",
    "/video",
    "/picture",
];

/// Progress report from [`RequestParser::parse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// A complete request is framed and ready to take.
    Complete,
    /// The buffer does not hold a complete request yet.
    NeedMore,
}

/// A parsed HTTP/1.1 request.
#[derive(Debug, Clone)]
pub struct Request {
    /// HTTP method.
    pub method: Method,
    /// Normalized request path (query string stripped, default pages
    /// resolved to their `.html` files).
    pub path: String,
    /// HTTP version.
    pub version: Version,
    /// Headers as name-value pairs, in arrival order.
    pub headers: Vec<(String, String)>,
    /// Raw body bytes.
    pub body: Vec<u8>,
}

impl Request {
    /// Returns the value of the first header matching `name`
    /// (case-insensitive).
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether the connection should stay open after the response.
    ///
    /// An explicit `Connection` header wins; otherwise HTTP/1.1 defaults
    /// to keep-alive and HTTP/1.0 to close.
    #[must_use]
    pub fn is_keep_alive(&self) -> bool {
        if let Some(value) = self.header("connection") {
            if value.eq_ignore_ascii_case("close") {
                return false;
            }
            if value.eq_ignore_ascii_case("keep-alive") {
                return true;
            }
        }
        self.version == Version::Http11
    }

    /// Decodes the body as `application/x-www-form-urlencoded` pairs.
    #[must_use]
    pub fn form(&self) -> HashMap<String, String> {
        let body = String::from_utf8_lossy(&self.body);
        let mut fields = HashMap::new();
        for pair in body.split('&') {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            fields.insert(decode_component(key), decode_component(value));
        }
        fields
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    RequestLine,
    Headers,
    Body,
    Finished,
}

/// Incremental request parser over a [`Buffer`].
pub struct RequestParser {
    state: ParseState,
    method: Option<Method>,
    path: String,
    version: Option<Version>,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    content_length: usize,
    header_bytes: usize,
}

impl RequestParser {
    /// Creates a parser in its initial state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ParseState::RequestLine,
            method: None,
            path: String::new(),
            version: None,
            headers: Vec::new(),
            body: Vec::new(),
            content_length: 0,
            header_bytes: 0,
        }
    }

    /// Returns the parser to its initial state.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Consumes as much of `buf` as possible.
    ///
    /// Returns [`ParseStatus::Complete`] once a full request is framed; the
    /// buffer may still hold the beginning of a pipelined follow-up
    /// request, which stays untouched.
    pub fn parse(&mut self, buf: &mut Buffer) -> Result<ParseStatus, HttpError> {
        loop {
            match self.state {
                ParseState::RequestLine => {
                    let Some(line) = take_line(buf) else {
                        if buf.readable_bytes() > MAX_REQUEST_LINE {
                            return Err(HttpError::RequestLineTooLong);
                        }
                        return Ok(ParseStatus::NeedMore);
                    };
                    let line = line?;
                    if line.is_empty() {
                        // Tolerate stray CRLF between pipelined requests.
                        continue;
                    }
                    let (method, path, version) = parse_request_line(&line)?;
                    self.method = Some(method);
                    self.path = normalize_path(&path);
                    self.version = Some(version);
                    self.state = ParseState::Headers;
                }
                ParseState::Headers => {
                    let Some(line) = take_line(buf) else {
                        if buf.readable_bytes() > MAX_HEADERS_SIZE {
                            return Err(HttpError::HeadersTooLarge);
                        }
                        return Ok(ParseStatus::NeedMore);
                    };
                    let line = line?;
                    self.header_bytes += line.len() + 2;
                    if self.header_bytes > MAX_HEADERS_SIZE {
                        return Err(HttpError::HeadersTooLarge);
                    }
                    if line.is_empty() {
                        self.content_length = self.parse_content_length()?;
                        if self.content_length > MAX_BODY_SIZE {
                            return Err(HttpError::BodyTooLarge);
                        }
                        self.state = if self.content_length > 0 {
                            ParseState::Body
                        } else {
                            ParseState::Finished
                        };
                    } else {
                        if self.headers.len() >= MAX_HEADERS {
                            return Err(HttpError::HeadersTooLarge);
                        }
                        self.headers.push(parse_header_line(&line)?);
                    }
                }
                ParseState::Body => {
                    if buf.readable_bytes() < self.content_length {
                        return Ok(ParseStatus::NeedMore);
                    }
                    self.body = buf.peek()[..self.content_length].to_vec();
                    buf.retrieve(self.content_length);
                    self.state = ParseState::Finished;
                }
                ParseState::Finished => return Ok(ParseStatus::Complete),
            }
        }
    }

    /// Extracts the completed request and resets the parser.
    ///
    /// # Panics
    ///
    /// Panics if called before [`parse`](Self::parse) reported
    /// [`ParseStatus::Complete`].
    pub fn take_request(&mut self) -> Request {
        assert_eq!(
            self.state,
            ParseState::Finished,
            "take_request before a complete request was framed"
        );
        let request = Request {
            method: self.method.take().expect("method set in Finished state"),
            path: std::mem::take(&mut self.path),
            version: self.version.take().expect("version set in Finished state"),
            headers: std::mem::take(&mut self.headers),
            body: std::mem::take(&mut self.body),
        };
        self.reset();
        request
    }

    fn parse_content_length(&self) -> Result<usize, HttpError> {
        let mut found: Option<usize> = None;
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("content-length") {
                let parsed: usize = value
                    .parse()
                    .map_err(|_| HttpError::BadContentLength)?;
                if let Some(existing) = found {
                    if existing != parsed {
                        return Err(HttpError::DuplicateContentLength);
                    }
                }
                found = Some(parsed);
            }
        }
        Ok(found.unwrap_or(0))
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RequestParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestParser")
            .field("state", &self.state)
            .field("headers", &self.headers.len())
            .finish()
    }
}

/// Takes one CRLF-terminated line out of the buffer, without the CRLF.
///
/// Returns `None` when no full line is buffered yet, `Some(Err(_))` on
/// non-UTF-8 content.
fn take_line(buf: &mut Buffer) -> Option<Result<String, HttpError>> {
    let idx = buf.peek().windows(2).position(|w| w == b"\r\n")?;
    let line = std::str::from_utf8(&buf.peek()[..idx])
        .map(ToOwned::to_owned)
        .map_err(|_| HttpError::BadHeader);
    buf.retrieve(idx + 2);
    Some(line)
}

/// Parses `METHOD SP PATH SP VERSION`.
fn parse_request_line(line: &str) -> Result<(Method, String, Version), HttpError> {
    let mut parts = line.split_ascii_whitespace();
    let method_str = parts.next().ok_or(HttpError::BadRequestLine)?;
    let path = parts.next().ok_or(HttpError::BadRequestLine)?;
    let version_str = parts.next().ok_or(HttpError::BadRequestLine)?;
    if parts.next().is_some() {
        return Err(HttpError::BadRequestLine);
    }
    if !path.starts_with('/') {
        return Err(HttpError::BadRequestLine);
    }

    let method = Method::from_bytes(method_str.as_bytes()).ok_or(HttpError::BadMethod)?;
    let version =
        Version::from_bytes(version_str.as_bytes()).ok_or(HttpError::UnsupportedVersion)?;
    Ok((method, path.to_owned(), version))
}

/// Parses a single `Name: Value` header line.
fn parse_header_line(line: &str) -> Result<(String, String), HttpError> {
    let colon = line.find(':').ok_or(HttpError::BadHeader)?;
    let name = &line[..colon];
    let value = line[colon + 1..].trim();
    if !is_valid_header_name(name) {
        // Whitespace around the field name is a smuggling vector.
        return Err(HttpError::BadHeader);
    }
    Ok((name.to_owned(), value.to_owned()))
}

/// Validates an HTTP field-name (RFC 7230 token character set).
fn is_valid_header_name(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    name.as_bytes().iter().all(|&b| {
        matches!(
            b,
            b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^'
                | b'_' | b'`' | b'|' | b'~' | b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z'
        )
    })
}

/// Strips the query string and resolves the well-known page set.
fn normalize_path(raw: &str) -> String {
    let path = raw.split('?').next().unwrap_or(raw);
    if path == "/" {
        return "/index.html".to_owned();
    }
    for page in DEFAULT_PAGES {
        if path == page {
            return format!("{page}.html");
        }
    }
    path.to_owned()
}

/// Decodes one form-urlencoded component (`+` and `%XX`).
fn decode_component(src: &str) -> String {
    let bytes = src.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                if let (Some(hi), Some(lo)) = (
                    bytes.get(i + 1).copied().and_then(hex_value),
                    bytes.get(i + 2).copied().and_then(hex_value),
                ) {
                    out.push(hi * 16 + lo);
                    i += 3;
                } else {
                    out.push(b'%');
                    i += 1;
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(parser: &mut RequestParser, bytes: &[u8]) -> Result<ParseStatus, HttpError> {
        let mut buf = Buffer::new();
        buf.append(bytes);
        parser.parse(&mut buf)
    }

    #[test]
    fn parses_simple_get() {
        let mut parser = RequestParser::new();
        let status = feed(
            &mut parser,
            b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n",
        )
        .unwrap();
        assert_eq!(status, ParseStatus::Complete);

        let req = parser.take_request();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.path, "/index.html");
        assert_eq!(req.version, Version::Http11);
        assert_eq!(req.header("host"), Some("x"));
        assert!(req.body.is_empty());
    }

    #[test]
    fn needs_more_until_terminator_arrives() {
        let mut parser = RequestParser::new();
        let mut buf = Buffer::new();

        buf.append(b"GET / HTTP/1.1\r\nHos");
        assert_eq!(parser.parse(&mut buf).unwrap(), ParseStatus::NeedMore);

        buf.append(b"t: example\r\n");
        assert_eq!(parser.parse(&mut buf).unwrap(), ParseStatus::NeedMore);

        buf.append(b"\r\n");
        assert_eq!(parser.parse(&mut buf).unwrap(), ParseStatus::Complete);

        let req = parser.take_request();
        assert_eq!(req.path, "/index.html");
        assert_eq!(req.header("Host"), Some("example"));
    }

    #[test]
    fn parses_post_body_split_across_reads() {
        let mut parser = RequestParser::new();
        let mut buf = Buffer::new();

        buf.append(b"POST /login HTTP/1.1\r\nContent-Length: 29\r\n\r\nusername=al");
        assert_eq!(parser.parse(&mut buf).unwrap(), ParseStatus::NeedMore);

        buf.append(b"ice&password=secret");
        assert_eq!(parser.parse(&mut buf).unwrap(), ParseStatus::Complete);

        let req = parser.take_request();
        assert_eq!(req.path, "/login.html");
        let form = req.form();
        assert_eq!(form.get("username").map(String::as_str), Some("alice"));
        assert_eq!(form.get("password").map(String::as_str), Some("secret"));
    }

    #[test]
    fn pipelined_request_left_in_buffer() {
        let mut parser = RequestParser::new();
        let mut buf = Buffer::new();
        buf.append(b"GET /a.html HTTP/1.1\r\n\r\nGET /b.html HTTP/1.1\r\n\r\n");

        assert_eq!(parser.parse(&mut buf).unwrap(), ParseStatus::Complete);
        assert_eq!(parser.take_request().path, "/a.html");

        assert_eq!(parser.parse(&mut buf).unwrap(), ParseStatus::Complete);
        assert_eq!(parser.take_request().path, "/b.html");
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn malformed_request_line_is_rejected() {
        for bad in [
            &b"ONLYONE\r\n\r\n"[..],
            b"GET /extra HTTP/1.1 junk\r\n\r\n",
            b"GET noslash HTTP/1.1\r\n\r\n",
        ] {
            let mut parser = RequestParser::new();
            assert!(feed(&mut parser, bad).is_err(), "accepted: {bad:?}");
        }
    }

    #[test]
    fn unknown_method_and_version_are_rejected() {
        let mut parser = RequestParser::new();
        assert_eq!(
            feed(&mut parser, b"BREW /pot HTTP/1.1\r\n\r\n"),
            Err(HttpError::BadMethod)
        );

        let mut parser = RequestParser::new();
        assert_eq!(
            feed(&mut parser, b"GET /pot HTTP/2\r\n\r\n"),
            Err(HttpError::UnsupportedVersion)
        );
    }

    #[test]
    fn header_with_space_before_colon_is_rejected() {
        let mut parser = RequestParser::new();
        assert_eq!(
            feed(&mut parser, b"GET / HTTP/1.1\r\nHost : x\r\n\r\n"),
            Err(HttpError::BadHeader)
        );
    }

    #[test]
    fn conflicting_content_lengths_are_rejected() {
        let mut parser = RequestParser::new();
        assert_eq!(
            feed(
                &mut parser,
                b"POST / HTTP/1.1\r\nContent-Length: 3\r\nContent-Length: 5\r\n\r\n",
            ),
            Err(HttpError::DuplicateContentLength)
        );
    }

    #[test]
    fn bad_content_length_is_rejected() {
        let mut parser = RequestParser::new();
        assert_eq!(
            feed(&mut parser, b"POST / HTTP/1.1\r\nContent-Length: many\r\n\r\n"),
            Err(HttpError::BadContentLength)
        );
    }

    #[test]
    fn keep_alive_follows_version_default_and_explicit_header() {
        let request = |extra: &str, version: &str| {
            let mut parser = RequestParser::new();
            let text = format!("GET / {version}\r\n{extra}\r\n");
            feed(&mut parser, text.as_bytes()).unwrap();
            parser.take_request()
        };

        assert!(request("", "HTTP/1.1").is_keep_alive());
        assert!(!request("", "HTTP/1.0").is_keep_alive());
        assert!(!request("Connection: close\r\n", "HTTP/1.1").is_keep_alive());
        assert!(request("Connection: keep-alive\r\n", "HTTP/1.0").is_keep_alive());
    }

    #[test]
    fn default_pages_resolve_to_html_files() {
        assert_eq!(normalize_path("/"), "/index.html");
        assert_eq!(normalize_path("/login"), "/login.html");
        assert_eq!(normalize_path("/video"), "/video.html");
        assert_eq!(normalize_path("/other.css"), "/other.css");
        assert_eq!(normalize_path("/login?next=1"), "/login.html");
    }

    #[test]
    fn form_decoding_handles_escapes() {
        assert_eq!(decode_component("a+b"), "a b");
        assert_eq!(decode_component("a%40b.com"), "a@b.com");
        assert_eq!(decode_component("100%"), "100%");
        assert_eq!(decode_component("%zz"), "%zz");
    }

    #[test]
    fn oversized_request_line_is_rejected() {
        let mut parser = RequestParser::new();
        let long = vec![b'a'; MAX_REQUEST_LINE + 10];
        let mut buf = Buffer::new();
        buf.append(b"GET /");
        buf.append(&long);
        assert_eq!(
            parser.parse(&mut buf),
            Err(HttpError::RequestLineTooLong)
        );
    }
}
