//! RTP packet framing helpers (RFC 3550 §5.1).
//!
//! The relay never originates or rewrites media — it forwards publisher
//! bytes verbatim. This module only extracts the fields the RTCP receiver
//! and dead-stream detector need, and builds the two minimal hole-punch
//! packets sent on the RECORD transition.

pub mod header;

pub use header::{parse_sequence_number, HOLE_PUNCH_RTCP, HOLE_PUNCH_RTP};
