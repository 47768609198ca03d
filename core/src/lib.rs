//! # rtsp_relay — multi-client RTSP relay server library
//!
//! A Rust library implementing a multi-client RTSP (RFC 2326) relay:
//! publishers push RTP media into named paths, readers subscribe to a
//! path and receive the same packets, and paths can instead pull their
//! media from an upstream RTSP origin or be activated on demand.
//!
//! ## Protocol references
//!
//! | RFC | Topic | How this crate uses it |
//! |-----|-------|----------------------|
//! | [RFC 2326](https://tools.ietf.org/html/rfc2326) | RTSP 1.0 | Request/response parsing, session lifecycle, transport negotiation |
//! | [RFC 3550](https://tools.ietf.org/html/rfc3550) | RTP/RTCP | Sequence-number cycling, Sender/Receiver Reports |
//! | [RFC 4566](https://tools.ietf.org/html/rfc4566) | SDP | DESCRIBE response generation, upstream SDP parsing |
//! | [RFC 2617](https://tools.ietf.org/html/rfc2617) | Digest auth | `WWW-Authenticate`/`Authorization` challenge-response |
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  cli crate — config loading, socket wiring    │
//! ├──────────────────────────────────────────────┤
//! │  Dispatcher — single-threaded event serializer│
//! │  Path / PublisherMap / ReadersMap / Session   │
//! ├──────────────────────────────────────────────┤
//! │  Protocol   — RTSP parsing, SDP, URIs         │
//! │  Source     — upstream RTSP pull client       │
//! ├──────────────────────────────────────────────┤
//! │  Transport  — TCP signaling, UDP RTP/RTCP I/O │
//! │  Rtp/Rtcp   — wire-format helpers             │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Every long-running component — TCP connections, UDP endpoints, source
//! clients — talks to the [`dispatcher`] over one channel; the dispatcher
//! is the only place path/publisher/reader/session state is mutated.
//!
//! ## Crate layout
//!
//! - [`dispatcher`] — [`dispatcher::Dispatcher`], the event serializer, and [`dispatcher::DispatchHandle`].
//! - [`path`] — [`path::Path`] state machine and [`path::PathManager`].
//! - [`config`] — [`config::Config`], [`config::ServerConfig`], [`config::PathConfig`], timeouts.
//! - [`protocol`] — RTSP request/response parsing, SDP transformation, URI helpers.
//! - [`session`] — [`session::Session`] state machine, transport negotiation, [`session::auth`].
//! - [`source`] — upstream RTSP pull client.
//! - [`transport`] — TCP listener for RTSP signaling, fixed-port UDP RTP/RTCP endpoints.
//! - [`publishers`] / [`readers`] — per-path publisher and reader bookkeeping.
//! - [`rtp`] / [`rtcp`] — wire-format helpers shared by the server and source client.
//! - [`error`] — [`error::RtspError`] and [`error::Result`].

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod path;
pub mod protocol;
pub mod publishers;
pub mod readers;
pub mod rtcp;
pub mod rtp;
pub mod session;
pub mod source;
pub mod transport;

pub use config::Config;
pub use dispatcher::{DispatchHandle, Dispatcher};
pub use error::{Result, RtspError};
pub use path::PathManager;
pub use session::SessionManager;
