//! C3 - URI sanitizer: percent-decoding and path normalization, applied to
//! URI bytes as they're written into the AH, one byte at a time.
//!
//! Grounded on `lws_parse_urldecode` in the original: two small interacting
//! state machines (percent-decoder, path normalizer) plus a `&`/`;`/`?`
//! query splitter, `+` -> space, and a rejected-NUL check.

use super::{token::Token, AhError, AllocatedHeader};

/// Percent-decoder sub-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UriPercentState {
    Idle,
    SeenPercent,
    SeenPercentHighNibble,
}

/// Path-normalizer sub-state, tracking trailing `/`, `/.` and `/..` runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UriPathState {
    Idle,
    SeenSlash,
    SeenSlashDot,
    SeenSlashDotDot,
}

/// Outcome of sanitizing one input byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UriOutcome {
    /// Byte consumed normally (possibly emitted, possibly buffered state-only).
    Continue,
    /// Byte consumed but produces no output (part of a `%XX` escape, or a
    /// `/./`/`/../` collapse).
    Swallow,
    /// URI violates policy (embedded NUL, malformed escape): request must be
    /// rejected with 403.
    Forbid,
    /// Collapsing `/../` walked above the root.
    Excessive,
}

impl AllocatedHeader {
    /// Starts accumulating the URI fragment for `token` (one of the method
    /// tokens), resetting both sanitizer sub-state machines.
    pub(crate) fn begin_uri(
        &mut self,
        token: Token,
        limits: &crate::limits::TokenLimits,
    ) -> Result<(), AhError> {
        self.ups = UriPercentState::Idle;
        self.ues = UriPathState::Idle;
        self.in_query = false;
        self.uri_token = Some(token);
        self.begin_known_value(token, limits)
    }

    /// Feeds one raw URI byte through the percent-decoder and path
    /// normalizer, appending decoded output to the current fragment as
    /// appropriate.
    pub(crate) fn sanitize_uri_byte(
        &mut self,
        byte: u8,
        limits: &crate::limits::TokenLimits,
    ) -> Result<UriOutcome, AhError> {
        if byte == 0 {
            return Ok(UriOutcome::Forbid);
        }

        // the first unencoded '?' closes the path and opens the first
        // query-args fragment; later unencoded '&'/';' open the next one
        // (see query_byte) - an encoded '%3F' never reaches this check
        // since it arrives through the SeenPercentHighNibble arm below.
        if byte == b'?' && self.ups == UriPercentState::Idle && !self.in_query {
            self.in_query = true;
            self.append_known_value_byte(byte)?;
            self.begin_known_value(Token::UriArgs, limits)?;
            return Ok(UriOutcome::Continue);
        }

        match self.ups {
            UriPercentState::Idle => {
                if byte == b'%' {
                    self.ups = UriPercentState::SeenPercent;
                    return Ok(UriOutcome::Swallow);
                }
                if self.in_query {
                    return self.query_byte(byte, false, limits);
                }
                self.path_normalize_byte(byte)
            }
            UriPercentState::SeenPercent => {
                let Some(_) = hex_nibble(byte) else {
                    return Ok(UriOutcome::Forbid);
                };
                self.esc_stash = byte;
                self.ups = UriPercentState::SeenPercentHighNibble;
                Ok(UriOutcome::Swallow)
            }
            UriPercentState::SeenPercentHighNibble => {
                let (Some(hi), Some(lo)) = (hex_nibble(self.esc_stash), hex_nibble(byte)) else {
                    return Ok(UriOutcome::Forbid);
                };
                self.ups = UriPercentState::Idle;
                let decoded = (hi << 4) | lo;
                if decoded == 0 {
                    return Ok(UriOutcome::Forbid);
                }
                if self.in_query {
                    return self.query_byte(decoded, true, limits);
                }
                self.path_normalize_byte(decoded)
            }
        }
    }

    /// Handles one query-string byte once `in_query` is set. `enc` records
    /// whether it arrived through a `%XX` escape rather than literally, so
    /// an escaped `&`/`;`/`=` can never be mistaken for the structural
    /// byte it decodes to.
    ///
    /// Unencoded `&`/`;` end the current query-args fragment and open the
    /// next one; unencoded `+` becomes a space; an `=` that arrived via
    /// `%3D` is rewritten to `_` so it can't later be read as the
    /// key/value separator by a naive byte scan (a literal `=` is always
    /// kept verbatim, first occurrence or not).
    fn query_byte(
        &mut self,
        byte: u8,
        enc: bool,
        limits: &crate::limits::TokenLimits,
    ) -> Result<UriOutcome, AhError> {
        if !enc && (byte == b'&' || byte == b';') {
            self.begin_known_value(Token::UriArgs, limits)?;
            return Ok(UriOutcome::Continue);
        }
        if enc && byte == b'=' {
            self.append_known_value_byte(b'_')?;
            return Ok(UriOutcome::Continue);
        }
        if !enc && byte == b'+' {
            self.append_known_value_byte(b' ')?;
            return Ok(UriOutcome::Continue);
        }
        self.append_known_value_byte(byte)?;
        Ok(UriOutcome::Continue)
    }

    /// Path-normalizer proper: collapses `/./`, `/../` and repeated `/`.
    fn path_normalize_byte(&mut self, byte: u8) -> Result<UriOutcome, AhError> {
        match (self.ues, byte) {
            (UriPathState::Idle, b'/') => {
                self.ues = UriPathState::SeenSlash;
                self.append_known_value_byte(byte)?;
                Ok(UriOutcome::Continue)
            }
            (UriPathState::SeenSlash, b'/') => {
                // collapse "//" -> "/"
                Ok(UriOutcome::Swallow)
            }
            (UriPathState::SeenSlash, b'.') => {
                self.ues = UriPathState::SeenSlashDot;
                Ok(UriOutcome::Swallow)
            }
            (UriPathState::SeenSlash, _) => {
                self.ues = UriPathState::Idle;
                self.append_known_value_byte(byte)?;
                Ok(UriOutcome::Continue)
            }
            (UriPathState::SeenSlashDot, b'/') => {
                // "/./" -> "/", drop the "." and stay poised on the slash
                self.ues = UriPathState::SeenSlash;
                Ok(UriOutcome::Swallow)
            }
            (UriPathState::SeenSlashDot, b'.') => {
                self.ues = UriPathState::SeenSlashDotDot;
                Ok(UriOutcome::Swallow)
            }
            (UriPathState::SeenSlashDot, _) => {
                self.ues = UriPathState::Idle;
                self.append_known_value_byte(b'.')?;
                self.append_known_value_byte(byte)?;
                Ok(UriOutcome::Continue)
            }
            (UriPathState::SeenSlashDotDot, b'/') => {
                // "/../" -> pop one path segment already written
                self.ues = UriPathState::SeenSlash;
                if self.pop_path_segment() {
                    Ok(UriOutcome::Swallow)
                } else {
                    Ok(UriOutcome::Excessive)
                }
            }
            (UriPathState::SeenSlashDotDot, _) => {
                self.ues = UriPathState::Idle;
                self.append_known_value_byte(b'.')?;
                self.append_known_value_byte(b'.')?;
                self.append_known_value_byte(byte)?;
                Ok(UriOutcome::Continue)
            }
            (UriPathState::Idle, _) => {
                self.append_known_value_byte(byte)?;
                Ok(UriOutcome::Continue)
            }
        }
    }

    /// Rewinds the current fragment's length past the last `/segment`,
    /// leaving the trailing `/` in place. Returns `false` if there's no
    /// segment left to pop (the `..` walked above the root).
    fn pop_path_segment(&mut self) -> bool {
        let idx = self.nfrag as usize - 1;
        let frag = &mut self.frags[idx];
        let base = frag.offset as usize;
        let mut len = frag.len as usize;

        if len == 0 {
            return false;
        }
        // drop trailing '/' we're currently sitting on
        len -= 1;
        let mut cut = len;
        while cut > 0 && self.data[base + cut - 1] != b'/' {
            cut -= 1;
        }
        if cut == 0 {
            return false;
        }
        self.frags[idx].len = cut as u32;
        true
    }

    /// Finalizes the URI fragment once the request line's trailing space is
    /// reached. Query-args fragments were already split out byte-at-a-time
    /// by [`Self::query_byte`]; this just truncates the path fragment past
    /// its trailing `?` and records the raw `?query` span (the path and
    /// query-args bytes are physically contiguous in `data` since nothing
    /// else writes between them, so `path_frag ++ query_span` still
    /// reconstructs the full target with no copy).
    pub(crate) fn finish_uri(
        &mut self,
        _limits: &crate::limits::TokenLimits,
    ) -> Result<(), AhError> {
        let uri_token = self
            .uri_token
            .take()
            .expect("finish_uri called outside a URI fragment");
        self.current_token = None;
        if !self.in_query {
            return Ok(());
        }
        let head = self.frag_index[uri_token.as_index()];
        if head < 0 {
            return Ok(());
        }
        let frag = &mut self.frags[head as usize];
        // the trailing byte is the '?' itself (query_byte never appends
        // anything to this fragment once in_query flips on).
        let query_mark = frag.offset + frag.len - 1;
        frag.len -= 1;
        self.query_span = Some((query_mark, self.pos - query_mark));
        Ok(())
    }
}

#[inline]
fn hex_nibble(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::{AhLimits, TokenLimits};

    fn run_uri(input: &[u8]) -> (AllocatedHeader, Result<(), AhError>) {
        let mut a = AllocatedHeader::new(&AhLimits::default());
        let limits = TokenLimits::default();
        a.begin_uri(Token::GetUri, &limits).unwrap();
        let mut result = Ok(());
        for &b in input {
            match a.sanitize_uri_byte(b, &limits) {
                Ok(UriOutcome::Forbid) => {
                    result = Err(AhError::BufferOverflow);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        if result.is_ok() {
            a.finish_uri(&limits).unwrap();
        }
        (a, result)
    }

    fn fragment_str(a: &AllocatedHeader, token: Token) -> String {
        let idx = a.frag_index[token.as_index()];
        let frag = a.frags[idx as usize];
        String::from_utf8(a.data[frag.offset as usize..(frag.offset + frag.len) as usize].to_vec())
            .unwrap()
    }

    #[test]
    fn dot_dot_collapses_path() {
        let (a, res) = run_uri(b"/a/b/../c");
        assert!(res.is_ok());
        assert_eq!(fragment_str(&a, Token::GetUri), "/a/c");
    }

    #[test]
    fn double_slash_collapses() {
        let (a, res) = run_uri(b"/a//b");
        assert!(res.is_ok());
        assert_eq!(fragment_str(&a, Token::GetUri), "/a/b");
    }

    #[test]
    fn percent_decodes() {
        let (a, res) = run_uri(b"/a%20b");
        assert!(res.is_ok());
        assert_eq!(fragment_str(&a, Token::GetUri), "/a b");
    }

    #[test]
    fn excessive_dot_dot_above_root_forbidden() {
        let mut a = AllocatedHeader::new(&AhLimits::default());
        let limits = TokenLimits::default();
        a.begin_uri(Token::GetUri, &limits).unwrap();
        for &b in b"/../" {
            let outcome = a.sanitize_uri_byte(b, &limits).unwrap();
            if outcome == UriOutcome::Excessive {
                return;
            }
        }
        panic!("expected Excessive outcome");
    }

    #[test]
    fn embedded_nul_forbidden() {
        let mut a = AllocatedHeader::new(&AhLimits::default());
        let limits = TokenLimits::default();
        a.begin_uri(Token::GetUri, &limits).unwrap();
        a.sanitize_uri_byte(b'/', &limits).unwrap();
        assert_eq!(a.sanitize_uri_byte(0, &limits).unwrap(), UriOutcome::Forbid);
    }

    #[test]
    fn query_splits_into_args() {
        let (a, res) = run_uri(b"/a/b?x=1&y=2");
        assert!(res.is_ok());
        assert_eq!(fragment_str(&a, Token::GetUri), "/a/b");
        let head = a.frag_index[Token::UriArgs.as_index()];
        assert!(head >= 0);
        let first = a.frags[head as usize];
        assert_eq!(
            &a.data[first.offset as usize..(first.offset + first.len) as usize],
            b"x=1"
        );
        let second = a.frags[a.frags[head as usize].next as usize];
        assert_eq!(
            &a.data[second.offset as usize..(second.offset + second.len) as usize],
            b"y=2"
        );
    }

    #[test]
    fn encoded_ampersand_does_not_split_args() {
        let (a, res) = run_uri(b"/a?k=1%262&j=3");
        assert!(res.is_ok());
        let head = a.frag_index[Token::UriArgs.as_index()];
        let first = a.frags[head as usize];
        assert_eq!(
            &a.data[first.offset as usize..(first.offset + first.len) as usize],
            b"k=1&2"
        );
        let second = a.frags[first.next as usize];
        assert_eq!(
            &a.data[second.offset as usize..(second.offset + second.len) as usize],
            b"j=3"
        );
    }

    #[test]
    fn encoded_equals_rewritten_to_underscore() {
        // the named end-to-end scenario: "GET /a%2Fb?k=%3D HTTP/1.1"
        let (a, res) = run_uri(b"/a%2Fb?k=%3D");
        assert!(res.is_ok());
        assert_eq!(fragment_str(&a, Token::GetUri), "/a/b");
        let head = a.frag_index[Token::UriArgs.as_index()];
        let first = a.frags[head as usize];
        assert_eq!(
            &a.data[first.offset as usize..(first.offset + first.len) as usize],
            b"k=_"
        );
    }

    #[test]
    fn literal_equals_kept_verbatim() {
        let (a, res) = run_uri(b"/a?k=v=2");
        assert!(res.is_ok());
        let head = a.frag_index[Token::UriArgs.as_index()];
        let first = a.frags[head as usize];
        assert_eq!(
            &a.data[first.offset as usize..(first.offset + first.len) as usize],
            b"k=v=2"
        );
    }

    #[test]
    fn query_span_reconstructs_full_target() {
        let (a, res) = run_uri(b"/a/b?x=1&y=2");
        assert!(res.is_ok());
        let (offset, len) = a.query_span.unwrap();
        assert_eq!(&a.data[offset as usize..(offset + len) as usize], b"?x=1&y=2");

        let path = fragment_str(&a, Token::GetUri);
        let path_idx = a.frag_index[Token::GetUri.as_index()];
        let path_frag = a.frags[path_idx as usize];
        assert_eq!(path_frag.offset, offset - path.len() as u32);
    }

    #[test]
    fn no_query_leaves_span_empty() {
        let (a, res) = run_uri(b"/a/b");
        assert!(res.is_ok());
        assert!(a.query_span.is_none());
    }
}
