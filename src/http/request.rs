use crate::{
    ah::{
        pool::{AhGuard, AhPoolSet, PeerId},
        token::Token,
        AllocatedHeader,
    },
    ah::parser::{ParseError, ParseEvent},
    errors::*,
    http::types::{self, Url},
    limits::ReqLimits,
    server::connection::HttpConnection,
    ConnectionData, Handler, Method, Version,
};
use memchr::memchr;
use std::{mem, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{io, io::AsyncReadExt, net::TcpStream, time::sleep};

/// An HTTP request whose method, URL and headers are backed by a pooled
/// [`AllocatedHeader`] (AH) rather than owned storage.
///
/// Header/URL accessors read straight through the AH guard held for the
/// lifetime of the current request; the body, if any, is a zero-copy view
/// into the connection's own read buffer.
pub struct Request {
    pub(crate) pool: Arc<AhPoolSet>,
    pub(crate) shard: usize,
    pub(crate) peer: PeerId,
    pub(crate) guard: Option<AhGuard>,

    method: Method,
    url: Url,
    version: Version,
    content_length: Option<usize>,
    body: Option<&'static [u8]>,

    client_addr: SocketAddr,
    server_addr: SocketAddr,
}

impl Request {
    #[inline]
    pub(crate) fn new(limits: &ReqLimits, pool: Arc<AhPoolSet>) -> Self {
        Request {
            pool,
            shard: 0,
            peer: 0,
            guard: None,

            method: Method::Get,
            url: Url::new(limits),
            version: Version::Http11,
            content_length: None,
            body: None,

            client_addr: unspecified_addr(),
            server_addr: unspecified_addr(),
        }
    }

    /// Builds a `Request` with its own single-shard, throwaway pool -
    /// for tests and the doc-hidden [`crate::run_test`] helper, where no
    /// real connection/server wiring exists to share one.
    pub(crate) fn new_standalone(limits: &ReqLimits) -> Self {
        use crate::limits::{AhLimits, PeerLimits};

        let pool = Arc::new(AhPoolSet::new(
            AhLimits::default(),
            PeerLimits::default(),
            1,
        ));
        Request::new(limits, pool)
    }

    #[inline]
    pub(crate) fn reset(&mut self) {
        if let Some(guard) = self.guard.take() {
            self.pool.detach(guard, self.peer);
        }

        self.method = Method::Get;
        self.url.clear();
        self.version = Version::Http11;
        self.content_length = None;
        self.body = None;
    }
}

// Public API
impl Request {
    #[inline(always)]
    pub const fn method(&self) -> Method {
        self.method
    }

    #[inline(always)]
    pub const fn url(&self) -> &Url {
        &self.url
    }

    #[inline(always)]
    pub const fn version(&self) -> Version {
        self.version
    }

    /// Returns the first value of a known or custom header, case-insensitive
    /// name matching (per [RFC 7230](https://tools.ietf.org/html/rfc7230#section-3.2)).
    ///
    /// Known headers (`Host`, `Content-Type`, ...) are read off the AH's
    /// fixed token slots; anything else falls back to the AH's custom-header
    /// side list.
    #[inline]
    pub fn header(&self, name: &[u8]) -> Option<&[u8]> {
        let guard = self.guard?;
        self.pool.with(guard, |ah| {
            let raw = match Token::from_header_name(name) {
                Some(tok) => ah.simple_ptr(tok),
                None => ah.custom_copy(name),
            }?;
            // SAFETY: the guard stays held for the lifetime of this request;
            // the AH's arena is exclusively ours until `reset` detaches it.
            Some(unsafe { AllocatedHeader::into_static(raw) })
        })
    }

    /// Returns the value of the `Content-Length` header if present.
    #[inline(always)]
    pub const fn content_length(&self) -> Option<usize> {
        self.content_length
    }

    /// Returns the request body if present.
    #[inline(always)]
    pub const fn body(&self) -> Option<&[u8]> {
        self.body
    }

    /// Returns the remote peer's address.
    #[inline(always)]
    pub const fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// Returns the local socket address the connection was accepted on.
    #[inline(always)]
    pub const fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }
}

#[inline]
fn unspecified_addr() -> SocketAddr {
    SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0)
}

struct ParsedHead {
    method: Method,
    version: Version,
    keep_alive: bool,
    content_length: Option<usize>,
}

fn build_parsed_head(ah: &AllocatedHeader, req_limits: &ReqLimits) -> Result<ParsedHead, ErrorKind> {
    let token = ah.matched_uri_token().ok_or(ErrorKind::InvalidMethod)?;
    let method = token.as_method().ok_or(ErrorKind::InvalidMethod)?;

    let version_bytes = ah.simple_ptr(Token::HttpVersion).ok_or(ErrorKind::InvalidVersion)?;
    let (version, mut keep_alive) = Version::from_bytes(version_bytes)?;

    let content_length = match ah.simple_ptr(Token::ContentLength) {
        Some(bytes) => {
            let len = types::slice_to_usize(bytes).ok_or(ErrorKind::InvalidContentLength)?;
            if len > req_limits.body_size {
                return Err(ErrorKind::BodyTooLarge);
            }
            Some(len)
        }
        None => None,
    };

    if let Some(conn) = ah.simple_ptr(Token::Connection) {
        let mut normalized = [0u8; 10];
        let n = types::into_lower_case(conn, &mut normalized);
        match &normalized[..n] {
            b"keep-alive" => keep_alive = true,
            b"close" => keep_alive = false,
            _ => return Err(ErrorKind::InvalidConnection),
        }
    }

    Ok(ParsedHead {
        method,
        version,
        keep_alive,
        content_length,
    })
}

fn map_parse_error(e: ParseError) -> ErrorKind {
    match e {
        ParseError::BufferOverflow => ErrorKind::BufferOverflow,
        ParseError::TooManyFragments => ErrorKind::TooManyFragments,
        ParseError::UnrecognizedMethod => ErrorKind::UnrecognizedMethod,
        ParseError::UriForbidden => ErrorKind::UriForbidden,
        ParseError::DuplicateMethod => ErrorKind::DuplicateMethod,
        ParseError::MalformedLineEnding | ParseError::InvalidHeader => ErrorKind::InvalidHeader,
    }
}

// Main entry point + HTTP/1 byte-at-a-time wiring through the AH pool
impl<H: Handler<S>, S: ConnectionData> HttpConnection<H, S> {
    #[inline]
    pub(crate) fn parse(&mut self) -> Result<Version, ErrorKind> {
        if self.looks_like_http09() {
            self.parse_http09()?;
        } else {
            self.parse_http1()?;
        }
        self.check_body()?;
        Ok(self.request.version)
    }

    fn looks_like_http09(&self) -> bool {
        self.http_09_limits.is_some()
            && self.parser.len > 0
            && self.parser.buffer[..self.parser.len].ends_with(b"\n")
            && memchr::memmem::find(&self.parser.buffer[..self.parser.len], b" HTTP/").is_none()
    }

    fn parse_http1(&mut self) -> Result<(), ErrorKind> {
        let pool = Arc::clone(&self.request.pool);
        let guard = self.request.guard.ok_or(ErrorKind::PoolBusy)?;
        let token_limits = self.token_limits;

        let mut consumed = 0usize;
        let mut head: Option<ParsedHead> = None;

        {
            let buffer_len = self.parser.len;
            let buffer = &self.parser.buffer[..buffer_len];
            let req_limits = &self.req_limits;

            pool.with_mut(guard, |ah| -> Result<(), ErrorKind> {
                for &byte in buffer {
                    consumed += 1;
                    match ah.feed_byte(byte, &token_limits).map_err(map_parse_error)? {
                        ParseEvent::Continue => {}
                        ParseEvent::HeadersComplete => {
                            head = Some(build_parsed_head(ah, req_limits)?);
                            return Ok(());
                        }
                    }
                }
                Err(ErrorKind::InvalidHeader)
            })?;
        }

        let head = head.ok_or(ErrorKind::InvalidHeader)?;
        self.request.method = head.method;
        self.request.version = head.version;
        self.request.content_length = head.content_length;
        self.response.version = head.version;
        self.response.keep_alive = head.keep_alive;
        self.parser.position = consumed;

        pool.with(guard, |ah| unsafe {
            self.request.url.populate_from_ah(ah, &self.req_limits)
        })?;

        Ok(())
    }

    /// Minimal `HTTP/0.9+` path - bypasses the AH entirely (no headers to
    /// parse), supporting all [`Method`] variants since `ah_web@0.1.2`.
    ///
    /// An optional `/keep_alive` request-target prefix opts the connection
    /// into persistent handling, matching the original `lws` extension
    /// verbatim (the 11-byte literal carries no trailing slash).
    fn parse_http09(&mut self) -> Result<(), ErrorKind> {
        let len = self.parser.len;
        if len < 2 {
            return Err(ErrorKind::InvalidUrl);
        }
        let end = len - usize::from(self.parser.buffer[..len].ends_with(b"\r\n")) - 1;

        if memchr(b'\n', &self.parser.buffer[..end]).is_some() {
            return Err(ErrorKind::InvalidUrl);
        }

        let (method, _) =
            Method::from_bytes(&self.parser.buffer[..len]).map_err(|_| ErrorKind::InvalidUrl)?;
        let space = memchr(b' ', &self.parser.buffer[..end]).ok_or(ErrorKind::InvalidUrl)?;

        let mut start = space + 1;
        if start >= end || self.parser.buffer[start] != b'/' {
            return Err(ErrorKind::InvalidUrl);
        }

        const PREFIX: &[u8] = b"/keep_alive";
        let mut keep_alive = false;
        if end - start >= PREFIX.len() && &self.parser.buffer[start..start + PREFIX.len()] == PREFIX
        {
            keep_alive = true;
            start += PREFIX.len();
            if start >= end {
                return Err(ErrorKind::InvalidUrl);
            }
        }

        self.request.method = method;
        self.request.version = Version::Http09;
        self.response.version = Version::Http09;
        self.response.keep_alive = keep_alive;
        self.request.content_length = None;

        let target = self
            .parser
            .get_slice_static(start, end - start)
            .ok_or(ErrorKind::InvalidUrl)?;

        let (path, query) = match memchr(b'?', target) {
            Some(q) => (&target[..q], Some(&target[q..])),
            None => (target, None),
        };

        let url = &mut self.request.url;
        url.clear();

        for part in path.split(|&b| b == b'/') {
            if part.is_empty() {
                continue;
            }
            if url.parts.len() >= self.req_limits.url_parts {
                return Err(ErrorKind::InvalidUrl);
            }
            url.parts.push(part);
        }

        if let Some(q) = query {
            let limit = url.query_parts.capacity();
            crate::query::Query::parse_into(&mut url.query_parts, q, limit)?;
            url.query = Some(q);
        }

        url.path = path;
        url.target = target;

        self.parser.position = len;
        Ok(())
    }

    #[inline]
    fn check_body(&mut self) -> Result<(), ErrorKind> {
        let parser = &self.parser;
        let body = parser.len - parser.position;

        match self.request.content_length {
            Some(len) if len == body => {
                let slice = parser.get_slice_static(parser.position, len).ok_or(
                    ErrorKind::BodyMismatch {
                        expected: len,
                        available: body,
                    },
                )?;

                self.request.body = Some(slice);
                Ok(())
            }
            Some(len) => Err(ErrorKind::BodyMismatch {
                expected: len,
                available: body,
            }),
            None => match body == 0 {
                true => Ok(()),
                false => Err(ErrorKind::UnexpectedBody(body)),
            },
        }
    }
}

//

#[derive(Debug, Clone, PartialEq)]
#[repr(align(64))]
pub(crate) struct Parser {
    pub(crate) position: usize,
    pub(crate) len: usize,
    pub(crate) buffer: Box<[u8]>,
}

impl Parser {
    #[inline(always)]
    pub(crate) fn new(limits: &ReqLimits) -> Self {
        let buffer = vec![0; limits.precalc.buffer].into_boxed_slice();

        Parser {
            position: 0,
            len: 0,
            buffer,
        }
    }

    #[cfg(test)]
    pub(crate) fn from<V: AsRef<[u8]>>(limits: &ReqLimits, value: V) -> Self {
        let mut buffer = vec![0; limits.precalc.buffer];

        let value = value.as_ref();
        buffer[0..value.len()].copy_from_slice(value);

        Parser {
            position: 0,
            len: value.len(),
            buffer: buffer.into_boxed_slice(),
        }
    }

    #[inline]
    pub(crate) fn reset(&mut self) {
        self.position = 0;
        self.len = 0;
        self.buffer.fill(0);
    }
}

// Work with Buffer
impl Parser {
    // Reading level
    #[inline]
    pub(crate) async fn fill_buffer(
        &mut self,
        stream: &mut TcpStream,
        time: Duration,
    ) -> Result<usize, io::Error> {
        tokio::select! {
            biased;

            read_result = stream.read(&mut self.buffer) => {
                let n = read_result?;
                self.len = n;
                Ok(n)
            }
            _ = sleep(time) => {
                Err(io::Error::new(io::ErrorKind::TimedOut, "read timeout"))
            },
        }
    }

    // Low level
    #[inline(always)]
    fn get_slice(&self, start: usize, step: usize) -> Option<&[u8]> {
        self.buffer.get(start..start + step)
    }

    // Unsafe level
    #[inline(always)]
    pub(crate) fn get_slice_static(&self, start: usize, step: usize) -> Option<&'static [u8]> {
        let value = self.get_slice(start, step)?;
        unsafe { Some(Self::into_static(value)) }
    }

    #[inline(always)]
    // SAFETY: into_static creates "temporary" references for tokio integration,
    // which become invalid after Request cleanup.
    // Parser: 'static (lives for entire program lifetime), buffer cleared via .fill(0).
    // Memory remains valid even if user holds references.
    // DO NOT SUGGEST FIXES without full server architecture context.
    const unsafe fn into_static(src: &[u8]) -> &'static [u8] {
        // Second `unsafe` for integration with the 2024 edition
        unsafe { mem::transmute(src) }
    }
}

#[cfg(test)]
mod request_self {
    use super::*;
    use crate::tools::*;

    #[test]
    fn reset() {
        let limits = ReqLimits::default().precalculate();
        let mut t =
            HttpConnection::from_req("OPTIONS /qwe&q=1 HTTP/1.0\r\nHost: 127.0.0.1\r\n\r\n");

        assert_eq!(t.parse(), Ok(Version::Http10));
        t.request.reset();

        assert_eq!(t.request.method(), Method::Get);
        assert_eq!(t.request.url().target(), b"");
        assert_eq!(t.request.version(), Version::Http11);
        assert_eq!(t.request.content_length(), None);
        assert_eq!(t.request.body(), None);
        let _ = limits;
    }

    macro_rules! parse_request {
        ($cases:expr) => {
            for (req, result) in $cases {
                let mut t = HttpConnection::from_req(req);

                if let Ok(result) = result {
                    assert_eq!(t.parse(), Ok(result.2));

                    assert_eq!(t.request.method(), result.0);
                    assert_eq!(str_op(t.request.url().target()), result.1);
                    assert_eq!(t.response.version, result.2);

                    for (name, value) in result.3 {
                        assert_eq!(
                            str(t.request.header(name.as_bytes())),
                            Some(value.to_string()).as_deref()
                        );
                    }
                    assert_eq!(t.request.body(), result.4);
                    assert_eq!(t.response.keep_alive, result.5);
                } else if let Err(e) = result {
                    assert_eq!(t.parse(), Err(e));
                }
            }
        };
    }

    #[test]
    fn parse_valid_request() {
        #[rustfmt::skip]
        let cases = vec![
            (
                "GET / HTTP/1.1\r\n\r\n",
                Ok((
                    Method::Get, "/", Version::Http11,
                    vec![],
                    None, true
                )),
            ),
            (
                "GET /api/qwe/name/len/qwe HTTP/1.1\r\n\r\n",
                Ok((
                    Method::Get, "/api/qwe/name/len/qwe", Version::Http11,
                    vec![],
                    None, true
                )),
            ),
            (
                "GET / HTTP/1.1\n\n",
                Ok((
                    Method::Get, "/", Version::Http11,
                    vec![],
                    None, true
                )),
            ),
            (
                "POST /test HTTP/1.1\r\nHOST: 127.0.0.1\r\n\r\n",
                Ok((
                    Method::Post, "/test", Version::Http11,
                    vec![("host", "127.0.0.1")],
                    None, true,
                )),
            ),
            (
                "PUT /qwe HTTP/1.1\r\nHoSt: 127.0.0.1\r\nUser-Agent: curl\r\n\r\n",
                Ok((
                    Method::Put, "/qwe", Version::Http11,
                    vec![("host", "127.0.0.1"), ("user-agent", "curl")],
                    None, true,
                )),
            ),
            (
                "GET /file HTTP/1.1\ncontent-length: 12\n\nHello world!",
                Ok((
                    Method::Get, "/file", Version::Http11,
                    vec![],
                    Some(b"Hello world!" as &[u8]), true,
                )),
            ),
            (
                "HEAD / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n",
                Ok((
                    Method::Head, "/", Version::Http11,
                    vec![],
                    None, true
                )),
            ),
            (
                "OPTIONS / HTTP/1.1\r\nCoNNEctIon: close\r\n\r\n",
                Ok((
                    Method::Options, "/", Version::Http11,
                    vec![],
                    None, false
                )),
            ),
            (
                "PATCH / HTTP/1.0\r\nconnection: keep-alive\r\n\r\n",
                Ok((
                    Method::Patch, "/", Version::Http10,
                    vec![],
                    None, true
                )),
            ),
            (
                "DELETE / HTTP/1.0\r\nConnection: close\r\n\r\n",
                Ok((
                    Method::Delete, "/", Version::Http10,
                    vec![],
                    None, false
                )),
            ),
            (
                "GET / HTTP/1.0\r\n\r\n",
                Ok((
                    Method::Get, "/", Version::Http10,
                    vec![],
                    None, false
                )),
            ),
            (
"POST /upload HTTP/1.1\r\nContent-Type: application/json\r
Content-Length: 17\r\n\r\n{\"data\": \"value\"}",
                Ok((
                    Method::Post, "/upload", Version::Http11,
                    vec![("content-type", "application/json")],
                    Some(b"{\"data\": \"value\"}" as &[u8]), true,
                )),
            ),
            (
                "GET /empty HTTP/1.1\r\nX-Empty: \r\nX-Space: \r\n\r\n",
                Ok((
                    Method::Get, "/empty", Version::Http11,
                    vec![("x-empty", ""), ("x-space", "")],
                    None, true,
                )),
            ),
            (
                "GET /api/find?user=qwe&id=223 HTTP/1.1\r\n\r\n",
                Ok((
                    Method::Get, "/api/find?user=qwe&id=223", Version::Http11,
                    vec![],
                    None, true
                )),
            ),
        ];

        parse_request! { cases }
    }

    #[test]
    fn parse_invalid_request() {
        #[rustfmt::skip]
        let cases = vec![
            (
                "GET / HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n",
                Ok((
                    Method::Get, "/", Version::Http11,
                    vec![("Host", "127.0.0.1")],
                    None::<&[u8]>, true
                )),
            ),
            (
                "GET/ HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n",
                Err(ErrorKind::UnrecognizedMethod)
            ),
            (
                "FOO / HTTP/1.1\r\n\r\n",
                Err(ErrorKind::UnrecognizedMethod)
            ),
            (
                "GET / HTTP/1.1\r\nHost: 127.0.0.1\nq: w\r\n\r\n",
                Err(ErrorKind::InvalidHeader)
            ),
            (
                "GET /empty HTTP/1.1\r\nX-Empty:\r\nX-Space: \r\n\r\n",
                Err(ErrorKind::InvalidHeader)
            ),
            (
                "POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nshort",
                Err(ErrorKind::BodyMismatch { expected: 10, available: 5 }),
            ),
            (
                "POST / HTTP/1.1\r\nContent-Length: 999999999\r\n\r\nbody",
                Err(ErrorKind::BodyTooLarge),
            ),
            (
                "POST / HTTP/1.1\r\nContent-Length: invalid\r\n\r\nbody",
                Err(ErrorKind::InvalidContentLength),
            ),
            (
                "GET / HTTP/1.1\r\nConnection: keep_alive\r\n\r\n",
                Err(ErrorKind::InvalidConnection),
            ),
        ];

        parse_request! { cases }
    }

    #[test]
    fn parse_http09() {
        use crate::limits::Http09Limits;

        #[rustfmt::skip]
        let cases = vec![
            (
                "GET / HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n",
                Ok((Version::Http11, "/", true)),
            ),
            (
                "GET /qwe HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n",
                Ok((Version::Http11, "/qwe", true)),
            ),

            (
                "GET /qwe\r\n", Ok((Version::Http09, "/qwe", false))
            ),
            (
                "GET /q/w/r\r\n", Ok((Version::Http09, "/q/w/r", false))
            ),
            (
                "GET /q/w/r/\r\n", Ok((Version::Http09, "/q/w/r/", false))
            ),
            (
                "GET /\r\n", Ok((Version::Http09, "/", false))
            ),
            (
                "GET /keep_alive/\r\n", Ok((Version::Http09, "/", true))
            ),
            (
                "GET /keep_alive/url\r\n", Ok((Version::Http09, "/url", true))
            ),
            (
                "GET /keep_alive//double/slash\r\n",
                Ok((Version::Http09, "//double/slash", true))
            ),
            (
                "GET /keep_alive/%20encoded\r\n",
                Ok((Version::Http09, "/%20encoded", true))
            ),
            (
                "GET /path?query=1\r\n",
                Ok((Version::Http09, "/path?query=1", false))
            ),
            (
                "GET /keep_alive/path?query=1&q=2\r\n",
                Ok((Version::Http09, "/path?query=1&q=2", true))
            ),
            (
                "GET /?query\r\n",
                Ok((Version::Http09, "/?query", false))
            ),
            (
                "POST /path\r\n", Ok((Version::Http09, "/path", false))
            ),

            (
                "GET \r\n",  Err(ErrorKind::InvalidUrl)
            ),
            (
                "GET /keep_alive\r\n",  Err(ErrorKind::InvalidUrl)
            ),
            (
                "GET /keep_alive\r\npath\r\n", Err(ErrorKind::InvalidUrl)
            ),
        ];

        for (req, result) in cases {
            let mut t = HttpConnection::from_req(req);
            t.http_09_limits = Some(Http09Limits::default());

            if let Ok(result) = result {
                assert_eq!(t.parse(), Ok(result.0));

                assert_eq!(str_op(t.request.url().target()), result.1);
                assert_eq!(t.response.version, result.0);
                assert_eq!(t.response.keep_alive, result.2);
            } else if let Err(e) = result {
                assert_eq!(t.parse(), Err(e));
            }
        }
    }

    #[test]
    fn check_limits() {
        let limits = ReqLimits::default().precalculate();

        let def_url = "/".to_string();
        let url_parts = "/q".repeat(limits.url_parts + 1);

        let h_name = "N".repeat(limits.header_name_size);
        let h_value = "v".repeat(limits.header_value_size);

        let body = "b".repeat(limits.body_size);

        #[rustfmt::skip]
        let cases = vec![
            (
                format!("GET {} HTTP/1.1\n\n", url_parts),
                Ok((
                    Method::Get, &url_parts, Version::Http11,
                    vec![],
                    None, true
                )),
            ),
            (
                format!("GET {url_parts}/e HTTP/1.1\r\n\r\n"),
                Err(ErrorKind::InvalidUrl),
            ),
            (
                format!("GET / HTTP/1.1\r\n{h_name}: {h_value}\r\n\r\n"),
                Ok((
                    Method::Get, &def_url, Version::Http11,
                    vec![(&h_name, &h_value)],
                    None, true
                )),
            ),
            (
                format!(
                    "GET / HTTP/1.1\nContent-Length: {}\n\n{body}",
                    limits.body_size
                ),
                Ok((
                    Method::Get, &def_url, Version::Http11,
                    vec![],
                    Some(body.as_bytes()), true
                )),
            ),
            (
                format!(
                    "GET / HTTP/1.1\nContent-Length: {}\n\n{body}e",
                    limits.body_size + 1,
                ),
                Err(ErrorKind::BodyTooLarge),
            ),
        ];

        parse_request! { cases }
    }
}
