//! SDP handling (RFC 4566), in both directions a relay needs: rewriting
//! an upstream/publisher SDP for DESCRIBE responses, and counting tracks
//! out of an ANNOUNCE body.

/// One media section's relay-relevant attributes.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    pub media_line: String,
    pub rtpmap: Vec<String>,
    pub fmtp: Vec<String>,
    pub control: Option<String>,
}

/// Parse an SDP body into its per-track attributes. Both `a=control:trackID=N`
/// and `a=control:streamid=N` are accepted (the latter is what some upstream
/// encoders emit instead of the RTSP-conventional spelling).
pub fn parse_tracks(sdp: &str) -> Vec<MediaTrack> {
    let mut tracks = Vec::new();
    let mut current: Option<MediaTrack> = None;

    for line in sdp.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(media_line) = line.strip_prefix("m=") {
            if let Some(track) = current.take() {
                tracks.push(track);
            }
            current = Some(MediaTrack {
                media_line: media_line.to_string(),
                rtpmap: Vec::new(),
                fmtp: Vec::new(),
                control: None,
            });
        } else if let Some(track) = current.as_mut() {
            if let Some(value) = line.strip_prefix("a=rtpmap:") {
                track.rtpmap.push(value.to_string());
            } else if let Some(value) = line.strip_prefix("a=fmtp:") {
                track.fmtp.push(value.to_string());
            } else if let Some(value) = line.strip_prefix("a=control:") {
                track.control = Some(value.to_string());
            }
        }
    }
    if let Some(track) = current.take() {
        tracks.push(track);
    }
    tracks
}

pub fn track_count(sdp: &str) -> u32 {
    parse_tracks(sdp).len() as u32
}

/// Rewrite an upstream SDP into the form the relay serves on DESCRIBE:
/// session origin `- 0 0 IN IP4 127.0.0.1` (or the configured
/// `public_host`), session name `Stream`,
/// time `0 0`; keep only `rtpmap`/`fmtp`, force `RTP/AVP` transport in the
/// media line, and append a relay-assigned `a=control:trackID=<i>` per
/// track.
pub fn transform_for_describe(
    upstream_sdp: &str,
    session_name: &str,
    username: &str,
    session_id: &str,
    session_version: u64,
    host: &str,
) -> String {
    let tracks = parse_tracks(upstream_sdp);

    let mut out = String::new();
    out.push_str("v=0\r\n");
    out.push_str(&format!(
        "o={username} {session_id} {session_version} IN IP4 {host}\r\n"
    ));
    out.push_str(&format!("s={session_name}\r\n"));
    out.push_str("t=0 0\r\n");

    for (i, track) in tracks.iter().enumerate() {
        let media_line = force_avp(&track.media_line);
        out.push_str(&format!("m={media_line}\r\n"));
        for rtpmap in &track.rtpmap {
            out.push_str(&format!("a=rtpmap:{rtpmap}\r\n"));
        }
        for fmtp in &track.fmtp {
            out.push_str(&format!("a=fmtp:{fmtp}\r\n"));
        }
        out.push_str(&format!("a=control:trackID={i}\r\n"));
    }

    out
}

/// Replace the transport token (3rd field) of an `m=` line with `RTP/AVP`,
/// leaving payload type(s) and the rest of the line untouched.
fn force_avp(media_line: &str) -> String {
    let mut fields: Vec<&str> = media_line.split(' ').collect();
    if fields.len() > 2 {
        fields[2] = "RTP/AVP";
    }
    fields.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const ANNOUNCE_SDP: &str = "v=0\r\n\
        o=- 0 0 IN IP4 127.0.0.1\r\n\
        s=Stream\r\n\
        t=0 0\r\n\
        m=video 0 RTP/AVP/TCP 96\r\n\
        a=rtpmap:96 H264/90000\r\n\
        a=fmtp:96 packetization-mode=1\r\n\
        a=control:streamid=0\r\n\
        m=audio 0 RTP/AVP/TCP 97\r\n\
        a=rtpmap:97 MPEG4-GENERIC/48000/2\r\n\
        a=control:trackID=1\r\n";

    #[test]
    fn parses_two_tracks_with_mixed_control_spellings() {
        let tracks = parse_tracks(ANNOUNCE_SDP);
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].control.as_deref(), Some("streamid=0"));
        assert_eq!(tracks[1].control.as_deref(), Some("trackID=1"));
    }

    #[test]
    fn track_count_matches_media_sections() {
        assert_eq!(track_count(ANNOUNCE_SDP), 2);
    }

    #[test]
    fn transform_forces_avp_and_renumbers_control() {
        let out = transform_for_describe(ANNOUNCE_SDP, "relay", "-", "12345", 1, "127.0.0.1");
        assert!(out.contains("m=video 0 RTP/AVP 96\r\n"));
        assert!(out.contains("a=control:trackID=0\r\n"));
        assert!(out.contains("a=control:trackID=1\r\n"));
        assert!(!out.contains("RTP/AVP/TCP"));
    }

    #[test]
    fn empty_sdp_has_no_tracks() {
        assert_eq!(track_count(""), 0);
    }
}
