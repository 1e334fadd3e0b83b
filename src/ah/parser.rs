//! C4 - incremental, byte-at-a-time HTTP/1 request parser.
//!
//! Grounded on `lws_parse`'s main switch: one state machine consuming one
//! byte at a time with no internal suspension point, reshaped into a sum
//! type ([`ParserState`]) in place of the original's token-id-plus-pointer
//! arithmetic. The request line and header lines share the same name
//! recognizer ([`super::lextable`]) since the method/URI tokens and header
//! tokens live in one candidate table with no overlapping prefixes.

use super::{
    lextable::{self, LexOutcome},
    token::Token,
    uri::{UriOutcome, UriPathState, UriPercentState},
    AhError, AllocatedHeader,
};
use crate::limits::TokenLimits;
use crate::http::types::to_lower_case;

/// Parser states.
///
/// `Challenge` is carried over from the original's legacy hixie-76 websocket
/// handshake token; nothing in this table transitions into it, it exists
/// purely so the state set matches the one this was modeled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParserState {
    /// Lexing a name: either the request-line method, or a header name.
    NamePart,
    /// Accumulating + sanitizing a URI for the method token in progress.
    Uri(Token),
    /// Accumulating the `HTTP/x.y` literal.
    Version,
    /// Accumulating an unrecognized header's name.
    UnknownName,
    /// Accumulating a known header's value.
    Value(Token),
    /// Accumulating an unrecognized header's value.
    UnknownValuePart,
    /// Saw CR, waiting for the LF that must follow it.
    ExpectLf(LineEnd),
    #[allow(dead_code)]
    Challenge,
    /// All headers consumed; parsing of this request is done.
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LineEnd {
    EndRequestLine,
    EndKnownValue,
    EndUnknownValue,
    EndOfHeaders,
}

/// What happened as a result of feeding one byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParseEvent {
    Continue,
    HeadersComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParseError {
    BufferOverflow,
    TooManyFragments,
    UnrecognizedMethod,
    UriForbidden,
    DuplicateMethod,
    /// A bare CR not followed by LF - tolerated the other way around (bare
    /// LF is accepted as a newline) but not this one.
    MalformedLineEnding,
    /// Line ended before a header name reached its terminating `:`.
    InvalidHeader,
}

impl From<AhError> for ParseError {
    fn from(e: AhError) -> Self {
        match e {
            AhError::BufferOverflow => ParseError::BufferOverflow,
            AhError::TooManyFragments => ParseError::TooManyFragments,
        }
    }
}

impl AllocatedHeader {
    /// Feeds one input byte to the parser, advancing `parser_state`.
    pub(crate) fn feed_byte(
        &mut self,
        byte: u8,
        limits: &TokenLimits,
    ) -> Result<ParseEvent, ParseError> {
        match self.parser_state {
            ParserState::NamePart => self.feed_name_part(byte, limits),
            ParserState::Uri(token) => self.feed_uri(token, byte, limits),
            ParserState::Version => self.feed_version(byte),
            ParserState::UnknownName => self.feed_unknown_name(byte),
            ParserState::Value(token) => self.feed_value(token, byte),
            ParserState::UnknownValuePart => self.feed_unknown_value(byte),
            ParserState::ExpectLf(kind) => self.feed_expect_lf(kind, byte, limits),
            ParserState::Challenge => unreachable!("no transition ever enters Challenge"),
            ParserState::Complete => Ok(ParseEvent::Continue),
        }
    }

    fn feed_name_part(
        &mut self,
        byte: u8,
        limits: &TokenLimits,
    ) -> Result<ParseEvent, ParseError> {
        if byte == b'\r' || byte == b'\n' {
            if self.lex_cursor.depth() == 0 {
                // blank line: end of headers
                return self.on_bare_newline(byte, LineEnd::EndOfHeaders, limits);
            }
            return Err(ParseError::InvalidHeader);
        }

        if self.lex_cursor.depth() == 0 {
            self.begin_unknown_name()?;
        }
        self.append_unknown_name_byte(byte)?;

        let mut lowered = [byte];
        to_lower_case(&mut lowered);
        match lextable::step(self.lex_cursor, lowered[0]) {
            LexOutcome::Dead => {
                if !self.request_line_done {
                    return Err(ParseError::UnrecognizedMethod);
                }
                self.parser_state = ParserState::UnknownName;
                Ok(ParseEvent::Continue)
            }
            LexOutcome::Continue(cursor) => {
                self.lex_cursor = cursor;
                Ok(ParseEvent::Continue)
            }
            LexOutcome::Matched(token) => {
                // retract the speculative unknown-name staging bytes
                self.pos = self.unk_pos;
                self.lex_cursor = lextable::LexCursor::start();

                if token.is_uri() {
                    if self.request_line_done {
                        return Err(ParseError::DuplicateMethod);
                    }
                    self.begin_uri(token, limits)?;
                    self.parser_state = ParserState::Uri(token);
                } else {
                    self.begin_known_value(token, limits)?;
                    self.parser_state = ParserState::Value(token);
                }
                Ok(ParseEvent::Continue)
            }
        }
    }

    fn feed_uri(
        &mut self,
        token: Token,
        byte: u8,
        limits: &TokenLimits,
    ) -> Result<ParseEvent, ParseError> {
        if byte == b' ' {
            self.finish_uri(limits)?;
            self.parser_state = ParserState::Version;
            return Ok(ParseEvent::Continue);
        }
        match self.sanitize_uri_byte(byte, limits)? {
            UriOutcome::Forbid | UriOutcome::Excessive => Err(ParseError::UriForbidden),
            UriOutcome::Continue | UriOutcome::Swallow => Ok(ParseEvent::Continue),
        }
    }

    fn feed_version(&mut self, byte: u8) -> Result<ParseEvent, ParseError> {
        if byte == b'\r' || byte == b'\n' {
            return self.on_bare_newline(byte, LineEnd::EndRequestLine, &TokenLimits::default());
        }
        if self.current_token != Some(Token::HttpVersion) {
            self.begin_known_value(Token::HttpVersion, &TokenLimits::default())?;
        }
        self.append_known_value_byte(byte)?;
        Ok(ParseEvent::Continue)
    }

    fn feed_unknown_name(&mut self, byte: u8) -> Result<ParseEvent, ParseError> {
        if byte == b':' {
            self.mark_unknown_name_complete();
            self.parser_state = ParserState::UnknownValuePart;
            return Ok(ParseEvent::Continue);
        }
        if byte == b'\r' || byte == b'\n' {
            return Err(ParseError::InvalidHeader);
        }
        self.append_unknown_name_byte(byte)?;
        Ok(ParseEvent::Continue)
    }

    fn feed_value(&mut self, _token: Token, byte: u8) -> Result<ParseEvent, ParseError> {
        if byte == b'\r' || byte == b'\n' {
            return self.on_bare_newline(byte, LineEnd::EndKnownValue, &TokenLimits::default());
        }
        // fold a single leading space after the colon
        let frag_idx = self.nfrag as usize - 1;
        if self.frags[frag_idx].len == 0 && byte == b' ' {
            return Ok(ParseEvent::Continue);
        }
        self.append_known_value_byte(byte)?;
        Ok(ParseEvent::Continue)
    }

    fn feed_unknown_value(&mut self, byte: u8) -> Result<ParseEvent, ParseError> {
        if byte == b'\r' || byte == b'\n' {
            return self.on_bare_newline(byte, LineEnd::EndUnknownValue, &TokenLimits::default());
        }
        if self.pos == self.unk_value_pos && byte == b' ' {
            return Ok(ParseEvent::Continue);
        }
        self.append_unknown_value_byte(byte)?;
        Ok(ParseEvent::Continue)
    }

    fn feed_expect_lf(
        &mut self,
        kind: LineEnd,
        byte: u8,
        limits: &TokenLimits,
    ) -> Result<ParseEvent, ParseError> {
        if byte != b'\n' {
            return Err(ParseError::MalformedLineEnding);
        }
        self.complete_line(kind, limits)
    }

    /// Handles a line-ending byte seen outside `ExpectLf`: `\r` arms the
    /// expect-LF sub-state, a bare `\n` is tolerated and ends the line
    /// immediately (broken-peer leniency, matches spec.md section 6).
    fn on_bare_newline(
        &mut self,
        byte: u8,
        kind: LineEnd,
        limits: &TokenLimits,
    ) -> Result<ParseEvent, ParseError> {
        if byte == b'\r' {
            self.parser_state = ParserState::ExpectLf(kind);
            Ok(ParseEvent::Continue)
        } else {
            self.complete_line(kind, limits)
        }
    }

    fn complete_line(&mut self, kind: LineEnd, limits: &TokenLimits) -> Result<ParseEvent, ParseError> {
        match kind {
            LineEnd::EndRequestLine => {
                self.request_line_done = true;
                self.current_token = None;
                self.lex_cursor = lextable::LexCursor::start();
                self.parser_state = ParserState::NamePart;
                Ok(ParseEvent::Continue)
            }
            LineEnd::EndKnownValue => {
                self.current_token = None;
                self.lex_cursor = lextable::LexCursor::start();
                self.parser_state = ParserState::NamePart;
                Ok(ParseEvent::Continue)
            }
            LineEnd::EndUnknownValue => {
                self.finish_unknown();
                self.lex_cursor = lextable::LexCursor::start();
                self.parser_state = ParserState::NamePart;
                Ok(ParseEvent::Continue)
            }
            LineEnd::EndOfHeaders => {
                let _ = limits;
                // a URI that ended mid-escape (dangling '%' or '%X') or
                // mid-'/..' never gets to resolve its sanitizer sub-state,
                // since the request line's trailing space short-circuits
                // straight to finish_uri without feeding it through
                // sanitize_uri_byte - catch that here.
                if self.ups != UriPercentState::Idle || self.ues != UriPathState::Idle {
                    return Err(ParseError::UriForbidden);
                }
                // Sec-WebSocket-Version is stored as an ordinary fragment;
                // derive its numeric value now that headers are complete.
                if let Some(raw) = self.simple_ptr(Token::SecWebSocketVersion) {
                    self.ws_version = std::str::from_utf8(raw).ok().and_then(|s| s.parse().ok());
                }
                self.parser_state = ParserState::Complete;
                Ok(ParseEvent::HeadersComplete)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::AhLimits;

    fn parse(input: &[u8]) -> Result<AllocatedHeader, ParseError> {
        let mut ah = AllocatedHeader::new(&AhLimits::default());
        let limits = TokenLimits::default();
        for &b in input {
            match ah.feed_byte(b, &limits)? {
                ParseEvent::HeadersComplete => return Ok(ah),
                ParseEvent::Continue => {}
            }
        }
        Ok(ah)
    }

    fn fragment(ah: &AllocatedHeader, token: Token) -> Option<Vec<u8>> {
        let idx = ah.frag_index[token.as_index()];
        if idx < 0 {
            return None;
        }
        let f = ah.frags[idx as usize];
        Some(ah.data[f.offset as usize..(f.offset + f.len) as usize].to_vec())
    }

    fn args(ah: &AllocatedHeader) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut idx = ah.frag_index[Token::UriArgs.as_index()];
        while idx >= 0 {
            let f = ah.frags[idx as usize];
            out.push(ah.data[f.offset as usize..(f.offset + f.len) as usize].to_vec());
            idx = ah.frags[idx as usize].next;
        }
        out
    }

    #[test]
    fn full_request_line_and_header() {
        let ah = parse(b"GET /a/b/../c?x=1&y=2 HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
        assert_eq!(fragment(&ah, Token::GetUri).unwrap(), b"/a/c");
        assert_eq!(args(&ah), vec![b"x=1".to_vec(), b"y=2".to_vec()]);
        assert_eq!(fragment(&ah, Token::HttpVersion).unwrap(), b"HTTP/1.1");
        assert_eq!(fragment(&ah, Token::Host).unwrap(), b"h");
        assert_eq!(ah.parser_state, ParserState::Complete);
    }

    #[test]
    fn bare_lf_tolerated_as_newline() {
        let ah = parse(b"GET / HTTP/1.1\nHost: h\n\n").unwrap();
        assert_eq!(fragment(&ah, Token::Host).unwrap(), b"h");
    }

    #[test]
    fn bare_cr_without_lf_rejected() {
        let mut ah = AllocatedHeader::new(&AhLimits::default());
        let limits = TokenLimits::default();
        for &b in b"GET / HTTP/1.1\r" {
            ah.feed_byte(b, &limits).unwrap();
        }
        assert_eq!(
            ah.feed_byte(b'X', &limits),
            Err(ParseError::MalformedLineEnding)
        );
    }

    #[test]
    fn unrecognized_method_rejected() {
        let err = parse(b"FOO / HTTP/1.1\r\n\r\n").unwrap_err();
        assert_eq!(err, ParseError::UnrecognizedMethod);
    }

    #[test]
    fn custom_header_recorded_on_side_list() {
        let ah = parse(b"GET / HTTP/1.1\r\nX-Request-Id: abc123\r\n\r\n").unwrap();
        let head = ah.unk_ll_head.expect("expected one custom header");
        let name_len = ah.read_u16(head as usize + super::super::uho::NLEN);
        let _ = name_len;
        let name_start = head as usize + super::super::uho::NAME;
        assert_eq!(&ah.data[name_start..name_start + 12], b"X-Request-Id");
    }

    #[test]
    fn duplicate_method_rejected() {
        let err = parse(b"GET / HTTP/1.1\r\nGET /again HTTP/1.1\r\n\r\n").unwrap_err();
        assert_eq!(err, ParseError::DuplicateMethod);
    }

    #[test]
    fn uri_ending_mid_escape_forbidden() {
        let err = parse(b"GET /a%2 HTTP/1.1\r\n\r\n").unwrap_err();
        assert_eq!(err, ParseError::UriForbidden);
    }

    #[test]
    fn sec_websocket_version_extracted_as_number() {
        let ah = parse(b"GET / HTTP/1.1\r\nSec-WebSocket-Version: 13\r\n\r\n").unwrap();
        assert_eq!(ah.ws_version, Some(13));
    }

    #[test]
    fn missing_sec_websocket_version_leaves_none() {
        let ah = parse(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
        assert_eq!(ah.ws_version, None);
    }
}
