//! Transport negotiation (RFC 2326 §12.39).
//!
//! Parses both `RTP/AVP;unicast;client_port=N-N+1` and
//! `RTP/AVP/TCP;unicast;interleaved=N-N+1`, and rejects multicast.

use crate::error::RtspError;

/// Stream transport chosen for a session. Homogeneous across all of a
/// session's SETUP'd tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamProtocol {
    Udp,
    Tcp,
}

/// Per-track negotiated transport parameters.
#[derive(Debug, Clone)]
pub enum TrackTransport {
    Udp {
        client_rtp_port: u16,
        client_rtcp_port: u16,
        server_rtp_port: u16,
        server_rtcp_port: u16,
    },
    /// Interleaved RTP/RTCP channel numbers on the RTSP TCP connection
    /// (`2n`, `2n+1`).
    Tcp { rtp_channel: u8, rtcp_channel: u8 },
}

/// Parsed fields of a client's `Transport` header for one SETUP request.
#[derive(Debug, Clone)]
pub struct TransportHeader {
    pub protocol: StreamProtocol,
    pub client_rtp_port: Option<u16>,
    pub client_rtcp_port: Option<u16>,
    pub interleaved: Option<(u8, u8)>,
}

impl TransportHeader {
    /// Parse the `Transport` header value. Rejects multicast explicitly;
    /// only unicast delivery is supported.
    pub fn parse(header: &str) -> Result<Self, RtspError> {
        let mut protocol = None;
        let mut client_rtp_port = None;
        let mut client_rtcp_port = None;
        let mut interleaved = None;
        let mut multicast = false;

        for part in header.split(';') {
            let part = part.trim();
            if part.eq_ignore_ascii_case("multicast") {
                multicast = true;
            } else if part.contains("RTP/AVP/TCP") {
                protocol = Some(StreamProtocol::Tcp);
            } else if part.contains("RTP/AVP") || part.contains("RTP/AVP/UDP") {
                protocol.get_or_insert(StreamProtocol::Udp);
            } else if let Some(ports) = part.strip_prefix("client_port=") {
                let (rtp, rtcp) = parse_port_pair(ports)
                    .ok_or_else(|| RtspError::InvalidTransport(header.to_string()))?;
                client_rtp_port = Some(rtp);
                client_rtcp_port = Some(rtcp);
            } else if let Some(chans) = part.strip_prefix("interleaved=") {
                let (a, b) = parse_u8_pair(chans)
                    .ok_or_else(|| RtspError::InvalidTransport(header.to_string()))?;
                interleaved = Some((a, b));
                protocol = Some(StreamProtocol::Tcp);
            }
        }

        if multicast {
            return Err(RtspError::InvalidTransport(
                "multicast is not supported".to_string(),
            ));
        }

        let protocol = protocol.ok_or_else(|| RtspError::InvalidTransport(header.to_string()))?;

        match protocol {
            StreamProtocol::Udp => {
                if client_rtp_port.is_none() || client_rtcp_port.is_none() {
                    return Err(RtspError::InvalidTransport(header.to_string()));
                }
            }
            StreamProtocol::Tcp => {
                if interleaved.is_none() {
                    return Err(RtspError::InvalidTransport(header.to_string()));
                }
            }
        }

        Ok(TransportHeader {
            protocol,
            client_rtp_port,
            client_rtcp_port,
            interleaved,
        })
    }
}

fn parse_port_pair(s: &str) -> Option<(u16, u16)> {
    let mut it = s.split('-');
    let a: u16 = it.next()?.parse().ok()?;
    let b: u16 = it.next()?.parse().ok()?;
    Some((a, b))
}

fn parse_u8_pair(s: &str) -> Option<(u8, u8)> {
    let mut it = s.split('-');
    let a: u8 = it.next()?.parse().ok()?;
    let b: u8 = it.next()?.parse().ok()?;
    Some((a, b))
}

/// Validate that a client's even/odd UDP port pair is well-formed.
pub fn valid_udp_pair(rtp: u16, rtcp: u16) -> bool {
    rtp % 2 == 0 && rtcp == rtp + 1
}

/// Validate `interleaved=2n-2n+1` for the nth track (0-based), as required
/// in both the play and record directions.
pub fn valid_interleaved_pair(a: u8, b: u8, n: u8) -> bool {
    a == 2 * n && b == 2 * n + 1
}
