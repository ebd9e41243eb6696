use crate::library::error::{GatewayError, GatewayResult};
use memchr::memmem::Finder;

pub const MAX_HTTP_HEADERS: usize = 32;

thread_local! {
    // End of the header block.
    static FINDER: Finder<'static> = Finder::new(b"\r\n\r\n");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    Other,
}

impl Method {
    pub fn from_bytes(raw: &[u8]) -> Method {
        match raw {
            b"GET" => Method::Get,
            b"POST" => Method::Post,
            b"PUT" => Method::Put,
            b"DELETE" => Method::Delete,
            b"PATCH" => Method::Patch,
            b"HEAD" => Method::Head,
            b"OPTIONS" => Method::Options,
            _ => Method::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Other => "OTHER",
        }
    }
}

/// Header fields the gateway itself looks at. Everything else is `Unknown`
/// and is passed through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderField {
    ContentLength,
    Cookie,
    Accept,
    AcceptEncoding,
    ContentEncoding,
    Upgrade,
    Connection,
    WsKey,
    WsVersion,
    WsProtocol,
    Host,
    Unknown,
}

/// Lowercased first eight bytes packed into a word.
#[inline(always)]
const fn prefix_word(name: &[u8]) -> u64 {
    let mut word = 0u64;
    let mut i = 0;
    while i < 8 && i < name.len() {
        word |= (name[i].to_ascii_lowercase() as u64) << (i * 8);
        i += 1;
    }
    word
}

const fn known(name: &'static [u8], field: HeaderField) -> (u64, &'static [u8], HeaderField) {
    (prefix_word(name), name, field)
}

const KNOWN_FIELDS: [(u64, &[u8], HeaderField); 11] = [
    known(b"content-length", HeaderField::ContentLength),
    known(b"cookie", HeaderField::Cookie),
    known(b"accept", HeaderField::Accept),
    known(b"accept-encoding", HeaderField::AcceptEncoding),
    known(b"content-encoding", HeaderField::ContentEncoding),
    known(b"upgrade", HeaderField::Upgrade),
    known(b"connection", HeaderField::Connection),
    known(b"sec-websocket-key", HeaderField::WsKey),
    known(b"sec-websocket-version", HeaderField::WsVersion),
    known(b"sec-websocket-protocol", HeaderField::WsProtocol),
    known(b"host", HeaderField::Host),
];

/// Compares the packed prefix first, then the remaining bytes.
pub fn classify_header(name: &[u8]) -> HeaderField {
    let word = prefix_word(name);
    for (prefix, full, field) in KNOWN_FIELDS.iter() {
        if *prefix == word
            && full.len() == name.len()
            && (name.len() <= 8 || name[8..].eq_ignore_ascii_case(&full[8..]))
        {
            return *field;
        }
    }
    HeaderField::Unknown
}

/// Offset and length into the buffer the message was parsed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: u32,
    pub len: u32,
}

impl Span {
    #[inline(always)]
    fn new(start: usize, len: usize) -> Span {
        Span {
            start: start as u32,
            len: len as u32,
        }
    }

    #[inline(always)]
    pub fn end(&self) -> usize {
        (self.start + self.len) as usize
    }

    /// Bounds-checked view.
    pub fn slice<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        buf.get(self.start as usize..self.end()).unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpHeader {
    pub field: HeaderField,
    pub name: Span,
    pub value: Span,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub method_span: Span,
    pub uri: Span,
    /// 0 for HTTP/1.0, 1 for HTTP/1.1.
    pub version_minor: u8,
    pub headers: Vec<HttpHeader>,
    /// Bytes up to and including the blank line.
    pub header_len: usize,
    pub content_length: usize,
    pub keep_alive: bool,
    pub ws_upgrade: bool,
}

impl HttpRequest {
    #[inline(always)]
    pub fn total_len(&self) -> usize {
        self.header_len.saturating_add(self.content_length)
    }

    pub fn header(&self, field: HeaderField) -> Option<&HttpHeader> {
        self.headers.iter().find(|h| h.field == field)
    }

    pub fn header_value<'a>(&self, buf: &'a [u8], field: HeaderField) -> Option<&'a [u8]> {
        self.header(field).map(|h| h.value.slice(buf))
    }

    pub fn body<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        buf.get(self.header_len..self.total_len()).unwrap_or(&[])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponseHead {
    pub status: u16,
    pub header_len: usize,
    pub content_length: Option<usize>,
    pub keep_alive: bool,
}

fn parse_decimal(raw: &[u8]) -> GatewayResult<usize> {
    let raw = trim(raw);
    if raw.is_empty() {
        return Err(GatewayError::MalformedHttp("empty Content-Length"));
    }
    raw.iter().try_fold(0usize, |acc, b| {
        if !b.is_ascii_digit() {
            return Err(GatewayError::MalformedHttp("non-numeric Content-Length"));
        }
        acc.checked_mul(10)
            .and_then(|v| v.checked_add((b - b'0') as usize))
            .ok_or(GatewayError::MalformedHttp("Content-Length overflow"))
    })
}

#[inline(always)]
fn trim(mut raw: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = raw {
        raw = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = raw {
        raw = rest;
    }
    raw
}

fn contains_token(value: &[u8], token: &[u8]) -> bool {
    value
        .split(|b| *b == b',')
        .any(|part| trim(part).eq_ignore_ascii_case(token))
}

/// Splits `name: value` lines of a header block. `offset` is where `block`
/// starts inside the original buffer.
fn parse_header_lines(block: &[u8], offset: usize, headers: &mut Vec<HttpHeader>) -> GatewayResult<()> {
    let mut at = 0;
    while at < block.len() {
        let line_end = memchr::memmem::find(&block[at..], b"\r\n").map_or(block.len(), |i| at + i);
        let line = &block[at..line_end];
        if !line.is_empty() {
            if headers.len() == MAX_HTTP_HEADERS {
                return Err(GatewayError::TooManyHeaders(MAX_HTTP_HEADERS));
            }
            let colon = memchr::memchr(b':', line).ok_or(GatewayError::MalformedHttp("header without colon"))?;
            let name = &line[..colon];
            if name.is_empty() || name.contains(&b' ') {
                return Err(GatewayError::MalformedHttp("bad header name"));
            }
            let mut value_start = colon + 1;
            while value_start < line.len() && (line[value_start] == b' ' || line[value_start] == b'\t') {
                value_start += 1;
            }
            let mut value_end = line.len();
            while value_end > value_start && (line[value_end - 1] == b' ' || line[value_end - 1] == b'\t') {
                value_end -= 1;
            }
            headers.push(HttpHeader {
                field: classify_header(name),
                name: Span::new(offset + at, colon),
                value: Span::new(offset + at + value_start, value_end - value_start),
            });
        }
        at = line_end + 2;
    }
    Ok(())
}

fn parse_version(raw: &[u8]) -> GatewayResult<u8> {
    match raw {
        b"HTTP/1.1" => Ok(1),
        b"HTTP/1.0" => Ok(0),
        _ => Err(GatewayError::MalformedHttp("unsupported HTTP version")),
    }
}

/// Parses a complete header block `buf[..header_len]`.
pub fn parse_request_head(buf: &[u8], header_len: usize) -> GatewayResult<HttpRequest> {
    let head = &buf[..header_len - 4];
    let line_end = memchr::memmem::find(head, b"\r\n").unwrap_or(head.len());
    let line = &head[..line_end];

    let space1 = memchr::memchr(b' ', line).ok_or(GatewayError::MalformedHttp("no method"))?;
    let rest = &line[space1 + 1..];
    let space2 = memchr::memchr(b' ', rest).ok_or(GatewayError::MalformedHttp("no URI"))?;
    if space1 == 0 || space2 == 0 {
        return Err(GatewayError::MalformedHttp("empty method or URI"));
    }
    let version_minor = parse_version(&rest[space2 + 1..])?;

    let mut headers = Vec::with_capacity(8);
    if line_end < head.len() {
        parse_header_lines(&head[line_end + 2..], line_end + 2, &mut headers)?;
    }

    let mut request = HttpRequest {
        method: Method::from_bytes(&line[..space1]),
        method_span: Span::new(0, space1),
        uri: Span::new(space1 + 1, space2),
        version_minor,
        headers,
        header_len,
        content_length: 0,
        keep_alive: version_minor == 1,
        ws_upgrade: false,
    };
    for header in &request.headers {
        let value = header.value.slice(buf);
        match header.field {
            HeaderField::ContentLength => request.content_length = parse_decimal(value)?,
            HeaderField::Connection => {
                if contains_token(value, b"close") {
                    request.keep_alive = false;
                } else if contains_token(value, b"keep-alive") {
                    request.keep_alive = true;
                }
            }
            HeaderField::Upgrade => request.ws_upgrade = contains_token(value, b"websocket"),
            _ => {}
        }
    }
    if header_len.checked_add(request.content_length).is_none() {
        return Err(GatewayError::PayloadTooLarge(request.content_length));
    }
    Ok(request)
}

/// Incremental request parser. Remembers how far it already looked for the
/// end of the header block so more bytes never trigger a rescan.
#[derive(Debug, Default)]
pub struct HttpParser {
    scanned: usize,
    request: Option<HttpRequest>,
}

impl HttpParser {
    pub fn reset(&mut self) {
        self.scanned = 0;
        self.request = None;
    }

    #[inline(always)]
    pub fn request(&self) -> Option<&HttpRequest> {
        self.request.as_ref()
    }

    pub fn take(&mut self) -> Option<HttpRequest> {
        self.scanned = 0;
        self.request.take()
    }

    /// Feeds the bytes received so far (always from the message start).
    /// Returns the parsed head once the blank line has been seen. Header
    /// blocks longer than `header_limit` fail as too large.
    pub fn feed(&mut self, buf: &[u8], header_limit: usize) -> GatewayResult<Option<&HttpRequest>> {
        if self.request.is_some() {
            return Ok(self.request.as_ref());
        }
        let end = buf.len().min(header_limit);
        let from = self.scanned.saturating_sub(3).min(end);
        let window = &buf[from..end];
        match FINDER.with(|f| f.find(window)) {
            Some(i) => {
                let header_len = from + i + 4;
                self.request = Some(parse_request_head(buf, header_len)?);
                Ok(self.request.as_ref())
            }
            None => {
                self.scanned = buf.len();
                if buf.len() >= header_limit {
                    return Err(GatewayError::PayloadTooLarge(buf.len()));
                }
                Ok(None)
            }
        }
    }
}

/// Status line and the few headers the gateway needs from a backend reply.
pub fn parse_response_head(buf: &[u8]) -> GatewayResult<Option<HttpResponseHead>> {
    let Some(end) = FINDER.with(|f| f.find(buf)) else {
        return Ok(None);
    };
    let head = &buf[..end];
    let line_end = memchr::memmem::find(head, b"\r\n").unwrap_or(head.len());
    let line = &head[..line_end];
    if line.len() < 12 || !line.starts_with(b"HTTP/1.") {
        return Err(GatewayError::MalformedHttp("bad status line"));
    }
    let version_minor = parse_version(&line[..8])?;
    let status = parse_decimal(&line[9..12])? as u16;
    let mut headers = Vec::new();
    if line_end < head.len() {
        parse_header_lines(&head[line_end + 2..], line_end + 2, &mut headers)?;
    }
    let mut response = HttpResponseHead {
        status,
        header_len: end + 4,
        content_length: None,
        keep_alive: version_minor == 1,
    };
    for header in &headers {
        let value = header.value.slice(buf);
        match header.field {
            HeaderField::ContentLength => response.content_length = Some(parse_decimal(value)?),
            HeaderField::Connection if contains_token(value, b"close") => response.keep_alive = false,
            _ => {}
        }
    }
    Ok(Some(response))
}
