//! Closed token space for recognized request-line and header names.
//!
//! Mirrors the `WSI_TOKEN_*` id space: every name the header parser can
//! terminal-match to gets a fixed slot, used both as a lex table outcome and
//! as the index into [`super::AllocatedHeader`]'s per-token fragment index.

/// A recognized request-line or header token.
///
/// Closed by design: anything not in this table falls through to the
/// unknown-header side list (see [`super::AllocatedHeader`]) instead of
/// growing this enum.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub(crate) enum Token {
    GetUri = 0,
    PostUri,
    PutUri,
    PatchUri,
    DeleteUri,
    OptionsUri,
    HeadUri,
    ConnectUri,

    Host,
    Upgrade,
    Connection,
    Origin,
    Cookie,
    SetCookie,
    ContentLength,
    ContentType,
    TransferEncoding,
    Accept,
    AcceptEncoding,
    AcceptLanguage,
    UserAgent,
    Referer,
    CacheControl,
    Authorization,
    Range,
    IfModifiedSince,
    IfNoneMatch,
    SecWebSocketKey,
    SecWebSocketVersion,
    SecWebSocketProtocol,
    SecWebSocketExtensions,

    UriArgs,
    HttpVersion,
}

impl Token {
    /// Number of distinct tokens, i.e. the width of `frag_index`.
    pub(crate) const COUNT: usize = 33;

    #[inline(always)]
    pub(crate) const fn as_index(self) -> usize {
        self as usize
    }

    /// True for the method/URI tokens carried on the request line.
    #[inline(always)]
    pub(crate) const fn is_uri(self) -> bool {
        matches!(
            self,
            Token::GetUri
                | Token::PostUri
                | Token::PutUri
                | Token::PatchUri
                | Token::DeleteUri
                | Token::OptionsUri
                | Token::HeadUri
                | Token::ConnectUri
        )
    }

    /// The 8 method/URI tokens, in request-line matching order. Used to scan
    /// `frag_index` for the one populated slot once `current_token` has been
    /// cleared at end-of-request-line.
    pub(crate) const METHOD_TOKENS: [Token; 8] = [
        Token::GetUri,
        Token::PostUri,
        Token::PutUri,
        Token::PatchUri,
        Token::DeleteUri,
        Token::OptionsUri,
        Token::HeadUri,
        Token::ConnectUri,
    ];

    /// Maps a method/URI token to the public [`crate::http::types::Method`]
    /// it corresponds to. `ConnectUri` has no public `Method` counterpart -
    /// CONNECT is recognized at the lexer level for fidelity but rejected at
    /// the server/handler level, since proxying is out of scope.
    pub(crate) const fn as_method(self) -> Option<crate::http::types::Method> {
        use crate::http::types::Method;
        match self {
            Token::GetUri => Some(Method::Get),
            Token::PostUri => Some(Method::Post),
            Token::PutUri => Some(Method::Put),
            Token::PatchUri => Some(Method::Patch),
            Token::DeleteUri => Some(Method::Delete),
            Token::OptionsUri => Some(Method::Options),
            Token::HeadUri => Some(Method::Head),
            Token::ConnectUri => None,
            _ => None,
        }
    }

    /// Case-insensitive lookup from a raw header-name byte string to its
    /// closed token, if recognized. Falls through to `None` (caller treats
    /// it as a custom header) for anything not in the 23-header-token table.
    pub(crate) fn from_header_name(name: &[u8]) -> Option<Token> {
        const TABLE: &[(&[u8], Token)] = &[
            (b"host", Token::Host),
            (b"upgrade", Token::Upgrade),
            (b"connection", Token::Connection),
            (b"origin", Token::Origin),
            (b"cookie", Token::Cookie),
            (b"set-cookie", Token::SetCookie),
            (b"content-length", Token::ContentLength),
            (b"content-type", Token::ContentType),
            (b"transfer-encoding", Token::TransferEncoding),
            (b"accept", Token::Accept),
            (b"accept-encoding", Token::AcceptEncoding),
            (b"accept-language", Token::AcceptLanguage),
            (b"user-agent", Token::UserAgent),
            (b"referer", Token::Referer),
            (b"cache-control", Token::CacheControl),
            (b"authorization", Token::Authorization),
            (b"range", Token::Range),
            (b"if-modified-since", Token::IfModifiedSince),
            (b"if-none-match", Token::IfNoneMatch),
            (b"sec-websocket-key", Token::SecWebSocketKey),
            (b"sec-websocket-version", Token::SecWebSocketVersion),
            (b"sec-websocket-protocol", Token::SecWebSocketProtocol),
            (b"sec-websocket-extensions", Token::SecWebSocketExtensions),
        ];
        TABLE
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, t)| *t)
    }
}
