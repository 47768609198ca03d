//! RTSP URI parsing: split a request URI into its path name and an
//! optional trailing `trackID=N`/`streamid=N` control segment.

/// Strip the `rtsp://host[:port]` prefix, returning the `/`-rooted path
/// (or the input unchanged if it carries no recognized scheme).
pub fn strip_scheme_and_host(uri: &str) -> &str {
    if let Some(rest) = uri
        .strip_prefix("rtsp://")
        .or_else(|| uri.strip_prefix("rtsps://"))
    {
        match rest.find('/') {
            Some(slash) => &rest[slash..],
            None => "",
        }
    } else {
        uri
    }
}

/// Split a `/`-rooted path into (path name, track id), recognizing a
/// trailing `trackID=N` or `streamid=N` segment.
pub fn split_track_suffix(path: &str) -> (&str, Option<u32>) {
    let trimmed = path.trim_end_matches('/');
    if let Some(idx) = trimmed.rfind('/') {
        let (head, tail) = trimmed.split_at(idx);
        let tail = &tail[1..];
        let track = tail
            .strip_prefix("trackID=")
            .or_else(|| tail.strip_prefix("streamid="))
            .and_then(|n| n.parse::<u32>().ok());
        if let Some(track) = track {
            return (head.trim_start_matches('/'), Some(track));
        }
    }
    (trimmed.trim_start_matches('/'), None)
}

/// Convenience: run both steps on a full request URI.
pub fn path_and_track(uri: &str) -> (&str, Option<u32>) {
    split_track_suffix(strip_scheme_and_host(uri))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_scheme_and_host() {
        assert_eq!(strip_scheme_and_host("rtsp://host:8554/cam1"), "/cam1");
    }

    #[test]
    fn splits_track_id_suffix() {
        assert_eq!(split_track_suffix("/teststream/trackID=0"), ("teststream", Some(0)));
    }

    #[test]
    fn splits_streamid_suffix() {
        assert_eq!(split_track_suffix("/cam1/streamid=1"), ("cam1", Some(1)));
    }

    #[test]
    fn no_track_suffix_returns_none() {
        assert_eq!(split_track_suffix("/cam1"), ("cam1", None));
    }

    #[test]
    fn path_and_track_combines_both_steps() {
        assert_eq!(
            path_and_track("rtsp://host/teststream/trackID=0"),
            ("teststream", Some(0))
        );
    }
}
