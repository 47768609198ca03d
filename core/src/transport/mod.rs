//! Network transport layer: [`tcp`] for RTSP signaling, [`udp`] for
//! fixed-port RTP/RTCP.
//!
//! The UDP side both sends and *receives* (publishers push RTP/RTCP
//! inbound), and the TCP side multiplexes RTSP text requests with
//! `$`-framed interleaved RTP/RTCP on the same socket.
//!
//! Both modules are pure I/O: they own sockets and threads but hold no
//! domain state, talking to the dispatcher only through [`crate::dispatcher::DispatchEvent`].

pub mod tcp;
pub mod udp;
