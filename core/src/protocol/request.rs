//! RTSP request parsing (RFC 2326 §6), including a `Content-Length` body
//! read — needed for ANNOUNCE, whose request carries an SDP body.

use crate::error::{ParseErrorKind, RtspError};

#[derive(Debug)]
pub struct RtspRequest {
    pub method: String,
    pub uri: String,
    pub version: String,
    /// Headers as ordered (name, value) pairs; case-insensitive lookup via
    /// [`get_header`](Self::get_header).
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl RtspRequest {
    /// Parse the request line and headers from `raw` (already split off the
    /// blank line that terminates the header block). `body` is read
    /// separately by the caller, which knows how many bytes `Content-Length`
    /// demands and can block the socket read loop accordingly.
    pub fn parse(raw: &str) -> Result<Self, RtspError> {
        let mut lines = raw.lines();

        let request_line = lines.next().ok_or(RtspError::Parse {
            kind: ParseErrorKind::EmptyRequest,
        })?;

        let parts: Vec<&str> = request_line.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(RtspError::Parse {
                kind: ParseErrorKind::InvalidRequestLine,
            });
        }

        let method = parts[0].to_string();
        let uri = parts[1].to_string();
        let version = parts[2].to_string();

        if version != "RTSP/1.0" {
            tracing::warn!(version, "client sent non-RTSP/1.0 version");
        }

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let colon_pos = line.find(':').ok_or(RtspError::Parse {
                kind: ParseErrorKind::InvalidHeader,
            })?;
            let name = line[..colon_pos].trim().to_string();
            let value = line[colon_pos + 1..].trim().to_string();
            headers.push((name, value));
        }

        Ok(RtspRequest {
            method,
            uri,
            version,
            headers,
            body: None,
        })
    }

    pub fn with_body(mut self, body: String) -> Self {
        self.body = Some(body);
        self
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// CSeq is mandatory; callers turn `None` into a 400 +
    /// session termination.
    pub fn cseq(&self) -> Option<&str> {
        self.get_header("CSeq")
    }

    pub fn content_length(&self) -> usize {
        self.get_header("Content-Length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_options_request() {
        let raw = "OPTIONS rtsp://localhost:8554/test RTSP/1.0\r\nCSeq: 1\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.method, "OPTIONS");
        assert_eq!(req.cseq(), Some("1"));
    }

    #[test]
    fn parse_announce_with_content_length() {
        let raw = "ANNOUNCE rtsp://localhost:8554/cam1 RTSP/1.0\r\n\
                   CSeq: 2\r\n\
                   Content-Type: application/sdp\r\n\
                   Content-Length: 42\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.content_length(), 42);
    }

    #[test]
    fn parse_empty_request_errors() {
        assert!(RtspRequest::parse("").is_err());
    }

    #[test]
    fn header_lookup_case_insensitive() {
        let raw = "OPTIONS rtsp://localhost RTSP/1.0\r\ncseq: 42\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.get_header("CSeq"), Some("42"));
    }

    #[test]
    fn missing_cseq_is_none() {
        let raw = "OPTIONS rtsp://localhost RTSP/1.0\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.cseq(), None);
    }
}
