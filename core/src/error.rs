//! Error types for the RTSP relay engine.
//!
//! Variants map to the failure kinds distinguished across the stack:
//!
//! - **Protocol**: [`Parse`](Self::Parse), [`WrongState`](Self::WrongState),
//!   [`MissingCSeq`](Self::MissingCSeq), [`InvalidTransport`](Self::InvalidTransport) — all 400.
//! - **Auth**: [`Unauthorized`](Self::Unauthorized) — 401, fatal only past the retry threshold.
//! - **Transport**: [`UnsupportedTransport`](Self::UnsupportedTransport) — 461.
//! - **NotFound**: [`PathNotFound`](Self::PathNotFound) — 404.
//! - **Timeout**: [`StreamDead`](Self::StreamDead).
//! - **Io**: [`Io`](Self::Io) — socket/network failures.
//! - **Source**: [`Source`](Self::Source) — upstream dial/negotiate/read failure.

use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum RtspError {
    /// Malformed RTSP request line or header (RFC 2326 §6).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// Request is well-formed but illegal in the session's current state.
    #[error("method {method} invalid in state {state:?}")]
    WrongState { method: String, state: String },

    /// Every RTSP request must carry a CSeq (RFC 2326 §12.17).
    #[error("missing CSeq")]
    MissingCSeq,

    /// Transport header missing, unparsable, or internally inconsistent
    /// (e.g. heterogeneous transport across SETUPs of one session).
    #[error("invalid transport: {0}")]
    InvalidTransport(String),

    /// Client's Transport header requested unicast in an unsupported way,
    /// or declared a protocol the server config doesn't enable.
    #[error("unsupported transport: {0}")]
    UnsupportedTransport(String),

    /// Authentication failed (bad credentials or ACL rejection). `fatal`
    /// is set past the 4th consecutive failure, when the session must be
    /// torn down after the 401 is written.
    #[error("unauthorized: {challenge}")]
    Unauthorized { challenge: String, fatal: bool },

    /// No path configuration or no registered mount for the requested name.
    #[error("path not found: {0}")]
    PathNotFound(String),

    /// No RTP frame arrived from the publisher within `readTimeout`.
    #[error("stream dead on path: {0}")]
    StreamDead(String),

    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Upstream source dial, negotiate, or read failure. Never propagates
    /// beyond flipping the path's readiness off; logged and retried.
    #[error("source error: {0}")]
    Source(String),

    /// Session not found in the session registry.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Server-side UDP port allocation exhausted its range.
    #[error("port range exhausted")]
    PortRangeExhausted,

    /// An internal channel closed when it must not have — a bug, not a
    /// recoverable input error.
    #[error("internal channel closed: {0}")]
    ChannelClosed(&'static str),
}

impl RtspError {
    /// RTSP status code this error should be reported as on the wire.
    /// Errors with no natural response (Io, Source, ChannelClosed) return
    /// 500 — callers producing no response at all (dropped connections)
    /// don't consult this.
    pub fn status_code(&self) -> u16 {
        match self {
            RtspError::Parse { .. }
            | RtspError::WrongState { .. }
            | RtspError::MissingCSeq
            | RtspError::InvalidTransport(_) => 400,
            RtspError::Unauthorized { .. } => 401,
            RtspError::PathNotFound(_) | RtspError::SessionNotFound(_) => 404,
            RtspError::UnsupportedTransport(_) => 461,
            RtspError::StreamDead(_) => 504,
            RtspError::Io(_) | RtspError::Source(_) | RtspError::ChannelClosed(_) => 500,
            RtspError::PortRangeExhausted => 500,
        }
    }

    /// Whether this error should terminate the session after the response
    /// (or immediately, if there's no response to send).
    pub fn is_fatal(&self) -> bool {
        match self {
            RtspError::Unauthorized { fatal, .. } => *fatal,
            RtspError::PathNotFound(_) => false,
            _ => true,
        }
    }
}

#[derive(Debug)]
pub enum ParseErrorKind {
    EmptyRequest,
    InvalidRequestLine,
    InvalidHeader,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidHeader => write!(f, "invalid header"),
        }
    }
}

pub type Result<T> = std::result::Result<T, RtspError>;
