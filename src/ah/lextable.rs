//! C1 - incremental name recognizer.
//!
//! The original lexes header/method names against a generated byte-code
//! table (`lextable_h1[]`) that advances one byte at a time and exits early
//! on a dead path. That exact bytecode format isn't reproduced here: the
//! contract it exposes (single-byte advance, early dead-end detection,
//! terminal match yields a token id) is substituted by a plain
//! candidate-bitmask scan over a static table, which spec.md section 9
//! explicitly allows.
//!
//! Every table entry carries its terminating delimiter as the last literal
//! byte (`:` for header names, a space for methods). That means retracting
//! speculative name bytes back to `unk_pos` also discards the delimiter,
//! matching what the original's `default:` branch does implicitly by never
//! special-casing the colon.

use super::token::Token;

macro_rules! names {
    ($($bytes:expr => $tok:ident),+ $(,)?) => {
        &[$(($bytes as &[u8], Token::$tok)),+]
    };
}

#[rustfmt::skip]
static NAMES: &[(&[u8], Token)] = names! {
    b"get " => GetUri,
    b"post " => PostUri,
    b"put " => PutUri,
    b"patch " => PatchUri,
    b"delete " => DeleteUri,
    b"options " => OptionsUri,
    b"head " => HeadUri,
    b"connect " => ConnectUri,

    b"host:" => Host,
    b"upgrade:" => Upgrade,
    b"connection:" => Connection,
    b"origin:" => Origin,
    b"cookie:" => Cookie,
    b"set-cookie:" => SetCookie,
    b"content-length:" => ContentLength,
    b"content-type:" => ContentType,
    b"transfer-encoding:" => TransferEncoding,
    b"accept:" => Accept,
    b"accept-encoding:" => AcceptEncoding,
    b"accept-language:" => AcceptLanguage,
    b"user-agent:" => UserAgent,
    b"referer:" => Referer,
    b"cache-control:" => CacheControl,
    b"authorization:" => Authorization,
    b"range:" => Range,
    b"if-modified-since:" => IfModifiedSince,
    b"if-none-match:" => IfNoneMatch,
    b"sec-websocket-key:" => SecWebSocketKey,
    b"sec-websocket-version:" => SecWebSocketVersion,
    b"sec-websocket-protocol:" => SecWebSocketProtocol,
    b"sec-websocket-extensions:" => SecWebSocketExtensions,
};

const _: () = assert!(NAMES.len() <= 64, "candidate bitmask needs one bit per row");

/// Cursor state for an in-progress name match.
#[derive(Debug, Copy, Clone)]
pub(crate) struct LexCursor {
    candidates: u64,
    depth: u8,
}

impl LexCursor {
    #[inline]
    pub(crate) fn start() -> Self {
        Self {
            candidates: (1u64 << NAMES.len()) - 1,
            depth: 0,
        }
    }

    #[inline]
    pub(crate) fn depth(&self) -> u8 {
        self.depth
    }
}

/// Result of feeding one byte into the recognizer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum LexOutcome {
    /// No remaining candidate name matches; caller retracts to `unk_pos`.
    Dead,
    /// Still matching one or more candidate names.
    Continue(LexCursor),
    /// Exactly one candidate matched through its trailing delimiter.
    Matched(Token),
}

/// Advance a cursor by one input byte.
///
/// Method bytes are fed verbatim (methods are case-sensitive uppercase by
/// grammar); header-name bytes must already be lowercased by the caller
/// before being passed in here.
#[inline]
pub(crate) fn step(cursor: LexCursor, byte: u8) -> LexOutcome {
    let depth = cursor.depth as usize;
    let mut next = 0u64;

    for i in 0..NAMES.len() {
        if cursor.candidates & (1 << i) == 0 {
            continue;
        }
        let name = NAMES[i].0;
        if depth < name.len() && name[depth] == byte {
            next |= 1 << i;
        }
    }

    if next == 0 {
        return LexOutcome::Dead;
    }

    let next_depth = depth + 1;
    if next.count_ones() == 1 {
        let i = next.trailing_zeros() as usize;
        if NAMES[i].0.len() == next_depth {
            return LexOutcome::Matched(NAMES[i].1);
        }
    }

    LexOutcome::Continue(LexCursor {
        candidates: next,
        depth: next_depth as u8,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(input: &[u8]) -> LexOutcome {
        let mut cursor = LexCursor::start();
        let mut last = LexOutcome::Continue(cursor);
        for &b in input {
            last = step(cursor, b);
            match last {
                LexOutcome::Continue(c) => cursor = c,
                LexOutcome::Dead | LexOutcome::Matched(_) => return last,
            }
        }
        last
    }

    #[test]
    fn matches_get_uri() {
        assert_eq!(run(b"get "), LexOutcome::Matched(Token::GetUri));
    }

    #[test]
    fn matches_host_header() {
        assert_eq!(run(b"host:"), LexOutcome::Matched(Token::Host));
    }

    #[test]
    fn disambiguates_shared_prefix() {
        assert_eq!(run(b"accept:"), LexOutcome::Matched(Token::Accept));
        assert_eq!(
            run(b"accept-encoding:"),
            LexOutcome::Matched(Token::AcceptEncoding)
        );
        assert_eq!(
            run(b"accept-language:"),
            LexOutcome::Matched(Token::AcceptLanguage)
        );
    }

    #[test]
    fn unknown_name_dies() {
        assert_eq!(run(b"x-custom:"), LexOutcome::Dead);
    }

    #[test]
    fn partial_match_continues() {
        match run(b"acc") {
            LexOutcome::Continue(c) => assert_eq!(c.depth(), 3),
            other => panic!("expected Continue, got {other:?}"),
        }
    }
}
