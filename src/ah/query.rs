//! C6 - read-side query API over a completed [`AllocatedHeader`].
//!
//! Grounded on `lws_hdr_total_length`/`lws_hdr_copy_fragment`/`lws_hdr_copy`/
//! `lws_hdr_simple_ptr`/`lws_hdr_custom_length`/`lws_hdr_custom_copy`/
//! `lws_hdr_custom_name_foreach`/`lws_http_cookie_get`. Every accessor
//! returns a zero-copy `&[u8]` view into the AH's own `data` arena - no
//! allocation, no interpretation of the bytes beyond what's asked for.

use super::{token::Token, uho, AllocatedHeader};

impl AllocatedHeader {
    /// Total byte length of a known token's value (all chained fragments
    /// summed, as `lws_hdr_total_length` does for repeated headers).
    pub(crate) fn total_length(&self, token: Token) -> usize {
        let mut idx = self.frag_index[token.as_index()];
        let mut total = 0usize;
        while idx >= 0 {
            total += self.frags[idx as usize].len as usize;
            idx = self.frags[idx as usize].next;
        }
        total
    }

    /// Length of a single fragment in a token's chain (`nth` = 0 for the
    /// first occurrence), or `None` if it doesn't exist.
    pub(crate) fn fragment_length(&self, token: Token, nth: usize) -> Option<usize> {
        self.nth_fragment(token, nth).map(|f| f.len as usize)
    }

    /// Zero-copy view of a single fragment (`nth` occurrence) of a known
    /// token's value.
    pub(crate) fn copy_fragment(&self, token: Token, nth: usize) -> Option<&[u8]> {
        self.nth_fragment(token, nth)
            .map(|f| &self.data[f.offset as usize..(f.offset + f.len) as usize])
    }

    /// Simple pointer to a token's value, valid only for tokens with
    /// exactly one fragment (the common case). Grounded on
    /// `lws_hdr_simple_ptr`.
    pub(crate) fn simple_ptr(&self, token: Token) -> Option<&[u8]> {
        self.copy_fragment(token, 0)
    }

    /// Count of fragments chained under `token` (how many times a repeated
    /// header like `Set-Cookie` occurred).
    pub(crate) fn fragment_count(&self, token: Token) -> usize {
        let mut idx = self.frag_index[token.as_index()];
        let mut count = 0usize;
        while idx >= 0 {
            count += 1;
            idx = self.frags[idx as usize].next;
        }
        count
    }

    fn nth_fragment(&self, token: Token, nth: usize) -> Option<super::Fragment> {
        let mut idx = self.frag_index[token.as_index()];
        let mut remaining = nth;
        while idx >= 0 {
            if remaining == 0 {
                return Some(self.frags[idx as usize]);
            }
            remaining -= 1;
            idx = self.frags[idx as usize].next;
        }
        None
    }

    /// Length of a custom (unrecognized) header's value by exact name,
    /// case-insensitive. Grounded on `lws_hdr_custom_length`.
    pub(crate) fn custom_length(&self, name: &[u8]) -> Option<usize> {
        self.custom_copy(name).map(|v| v.len())
    }

    /// Zero-copy view of a custom header's value by exact name,
    /// case-insensitive. Grounded on `lws_hdr_custom_copy`.
    pub(crate) fn custom_copy(&self, name: &[u8]) -> Option<&[u8]> {
        self.custom_name_foreach(|entry_name, value| {
            if entry_name.eq_ignore_ascii_case(name) {
                Some(value)
            } else {
                None
            }
        })
    }

    /// Walks the custom-header side list, calling `f(name, value)` for each
    /// entry until it returns `Some`. Grounded on `lws_hdr_custom_name_foreach`.
    pub(crate) fn custom_name_foreach<'a, R>(
        &'a self,
        mut f: impl FnMut(&'a [u8], &'a [u8]) -> Option<R>,
    ) -> Option<R> {
        let mut cursor = self.unk_ll_head;
        while let Some(at) = cursor {
            let at = at as usize;
            let name_len = self.read_u16(at + uho::NLEN) as usize;
            let value_len = self.read_u16(at + uho::VLEN) as usize;
            let next = self.read_u32(at + uho::LL);

            let name = &self.data[at + uho::NAME..at + uho::NAME + name_len];
            let value = &self.data[at + uho::NAME + name_len..at + uho::NAME + name_len + value_len];
            if let Some(r) = f(name, value) {
                return Some(r);
            }
            cursor = if next == 0 { None } else { Some(next) };
        }
        None
    }

    /// Recovers which method/URI token matched the request line. Needed
    /// because `complete_line`'s `EndRequestLine` arm clears `current_token`
    /// to `None` once the request line is done, so the matched method can't
    /// be read back from parser state directly - this scans
    /// [`Token::METHOD_TOKENS`] for the one slot `frag_index` populated.
    pub(crate) fn matched_uri_token(&self) -> Option<Token> {
        Token::METHOD_TOKENS
            .into_iter()
            .find(|&t| self.frag_index[t.as_index()] >= 0)
    }

    /// Zero-copy view of the matched request-line URI (path, already
    /// percent-decoded and normalized by the sanitizer), if a method/URI
    /// token matched.
    pub(crate) fn uri_path(&self) -> Option<&[u8]> {
        self.simple_ptr(self.matched_uri_token()?)
    }

    /// Zero-copy view of the raw `"?key=value&key2=value2"` query text,
    /// leading `?` included, or `None` if the request target carried no
    /// query string. See [`AllocatedHeader::query_span`].
    pub(crate) fn query_full_span(&self) -> Option<&[u8]> {
        let (offset, len) = self.query_span?;
        Some(&self.data[offset as usize..(offset + len) as usize])
    }

    /// Zero-copy view of the full request target (path plus query string,
    /// if any) as matched on the request line. `path` and `query_full_span`
    /// are physically contiguous, so this is a single slice rather than a
    /// concatenation.
    pub(crate) fn target_span(&self) -> Option<&[u8]> {
        let token = self.matched_uri_token()?;
        let path = self.simple_ptr(token)?;
        match self.query_span {
            Some((_, qlen)) => {
                let start = path.as_ptr() as usize - self.data.as_ptr() as usize;
                Some(&self.data[start..start + path.len() + qlen as usize])
            }
            None => Some(path),
        }
    }

    /// `nth` query-argument fragment split into `(key, value)` on the first
    /// `=`, mirroring [`crate::query::Query::parse_into`]'s per-piece
    /// splitting rule (no `=` means an empty value).
    pub(crate) fn nth_query_arg(&self, nth: usize) -> Option<(&[u8], &[u8])> {
        let piece = self.copy_fragment(Token::UriArgs, nth)?;
        let mut parts = piece.splitn(2, |&b| b == b'=');
        let key = parts.next()?;
        let value = parts.next().unwrap_or(b"");
        Some((key, value))
    }

    /// Number of query-argument fragments (`0` if the target had no query
    /// string at all).
    pub(crate) fn query_arg_count(&self) -> usize {
        self.fragment_count(Token::UriArgs)
    }

    /// Concatenates every fragment of `token`'s chain into `dst`, joining
    /// them with the separator appropriate to the token's category - `;`
    /// for cookies, `&` for query args, `,` for everything else (repeated
    /// ordinary headers fold the same way `,`-joining combines them per
    /// RFC 7230). Returns the number of bytes written, or `None` if `dst`
    /// is too small to hold the result. Grounded on `lws_hdr_copy`.
    pub(crate) fn copy(&self, token: Token, dst: &mut [u8]) -> Option<usize> {
        let sep = match token {
            Token::Cookie | Token::SetCookie => b';',
            Token::UriArgs => b'&',
            _ => b',',
        };
        let mut idx = self.frag_index[token.as_index()];
        let mut written = 0usize;
        let mut first = true;
        while idx >= 0 {
            let frag = self.frags[idx as usize];
            if !first {
                if written >= dst.len() {
                    return None;
                }
                dst[written] = sep;
                written += 1;
            }
            first = false;
            let value = &self.data[frag.offset as usize..(frag.offset + frag.len) as usize];
            if written + value.len() > dst.len() {
                return None;
            }
            dst[written..written + value.len()].copy_from_slice(value);
            written += value.len();
            idx = frag.next;
        }
        Some(written)
    }

    /// Looks up a cookie by name in the `Cookie` header's value, splitting
    /// on `;` and trimming a single leading space per pair - the HTTP/1
    /// half of `lws_http_cookie_get` (HTTP/2 pseudo-header cookie
    /// concatenation is out of scope here, see spec Non-goals).
    pub(crate) fn cookie_get(&self, name: &[u8]) -> Option<&[u8]> {
        let cookie = self.simple_ptr(Token::Cookie)?;
        for pair in cookie.split(|&b| b == b';') {
            let pair = trim_leading_space(pair);
            let mut parts = pair.splitn(2, |&b| b == b'=');
            let key = parts.next()?;
            let value = parts.next().unwrap_or(b"");
            if key.eq_ignore_ascii_case(name) {
                return Some(value);
            }
        }
        None
    }
}

fn trim_leading_space(bytes: &[u8]) -> &[u8] {
    match bytes.first() {
        Some(b' ') => &bytes[1..],
        _ => bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::AhLimits;

    fn parsed(input: &[u8]) -> AllocatedHeader {
        let mut ah = AllocatedHeader::new(&AhLimits::default());
        let limits = crate::limits::TokenLimits::default();
        for &b in input {
            if ah.feed_byte(b, &limits).unwrap() == super::super::parser::ParseEvent::HeadersComplete {
                break;
            }
        }
        ah
    }

    #[test]
    fn simple_ptr_returns_single_fragment() {
        let ah = parsed(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");
        assert_eq!(ah.simple_ptr(Token::Host), Some(&b"example.com"[..]));
    }

    #[test]
    fn total_length_sums_repeated_headers() {
        let ah = parsed(b"GET / HTTP/1.1\r\nSet-Cookie: a\r\nSet-Cookie: bb\r\n\r\n");
        assert_eq!(ah.fragment_count(Token::SetCookie), 2);
        assert_eq!(ah.total_length(Token::SetCookie), 3);
        assert_eq!(ah.copy_fragment(Token::SetCookie, 1), Some(&b"bb"[..]));
    }

    #[test]
    fn custom_header_lookup_is_case_insensitive() {
        let ah = parsed(b"GET / HTTP/1.1\r\nX-Request-Id: abc\r\n\r\n");
        assert_eq!(ah.custom_copy(b"x-request-id"), Some(&b"abc"[..]));
        assert_eq!(ah.custom_length(b"X-REQUEST-ID"), Some(3));
        assert_eq!(ah.custom_copy(b"missing"), None);
    }

    #[test]
    fn cookie_get_finds_named_pair() {
        let ah = parsed(b"GET / HTTP/1.1\r\nCookie: a=1; b=2\r\n\r\n");
        assert_eq!(ah.cookie_get(b"b"), Some(&b"2"[..]));
        assert_eq!(ah.cookie_get(b"missing"), None);
    }

    #[test]
    fn matched_uri_token_recovers_method_after_request_line_ends() {
        let ah = parsed(b"POST /widgets HTTP/1.1\r\nHost: example.com\r\n\r\n");
        assert_eq!(ah.matched_uri_token(), Some(Token::PostUri));
        assert_eq!(ah.uri_path(), Some(&b"/widgets"[..]));
    }

    #[test]
    fn target_and_query_span_reconstruct_request_line_uri() {
        let ah = parsed(b"GET /api/users?sort=name&debug HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(ah.uri_path(), Some(&b"/api/users"[..]));
        assert_eq!(
            ah.query_full_span(),
            Some(&b"?sort=name&debug"[..])
        );
        assert_eq!(
            ah.target_span(),
            Some(&b"/api/users?sort=name&debug"[..])
        );
        assert_eq!(ah.query_arg_count(), 2);
        assert_eq!(ah.nth_query_arg(0), Some((&b"sort"[..], &b"name"[..])));
        assert_eq!(ah.nth_query_arg(1), Some((&b"debug"[..], &b""[..])));
    }

    #[test]
    fn target_with_no_query_is_just_the_path() {
        let ah = parsed(b"GET /api/users HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(ah.query_full_span(), None);
        assert_eq!(ah.target_span(), Some(&b"/api/users"[..]));
    }

    #[test]
    fn copy_joins_repeated_cookie_fragments_with_semicolon() {
        let ah = parsed(b"GET / HTTP/1.1\r\nSet-Cookie: a=1\r\nSet-Cookie: b=2\r\n\r\n");
        let mut dst = [0u8; 16];
        let n = ah.copy(Token::SetCookie, &mut dst).unwrap();
        assert_eq!(&dst[..n], b"a=1;b=2");
    }

    #[test]
    fn copy_joins_query_args_with_ampersand() {
        let ah = parsed(b"GET /a?x=1&y=2 HTTP/1.1\r\nHost: h\r\n\r\n");
        let mut dst = [0u8; 16];
        let n = ah.copy(Token::UriArgs, &mut dst).unwrap();
        assert_eq!(&dst[..n], b"x=1&y=2");
    }

    #[test]
    fn copy_reports_overflow_when_dst_too_small() {
        let ah = parsed(b"GET / HTTP/1.1\r\nSet-Cookie: a=1\r\nSet-Cookie: b=2\r\n\r\n");
        let mut dst = [0u8; 4];
        assert_eq!(ah.copy(Token::SetCookie, &mut dst), None);
    }
}
