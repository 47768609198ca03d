//! RTSP response builder (RFC 2326 §7), with the extra status codes this
//! server needs to emit (401, 461) and a literal single-session `Session`
//! header value shared by every response on a connection.
//!
//! `parse` reads a response back rather than only writing one: the
//! upstream source client is itself an RTSP client and must parse what
//! the origin sends back.

use crate::error::{ParseErrorKind, RtspError};

/// Literal session token shared across all sessions on a connection. A
/// real server would mint a unique id per SETUP; this server instead
/// pins it, since every session lives on its own dispatcher-serialized
/// connection and nothing reuses it across connections.
pub const SESSION_ID: &str = "12345678";

pub const SERVER_AGENT: &str = "rtsp-relay/0.1";

#[must_use]
pub struct RtspResponse {
    pub status_code: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl RtspResponse {
    pub fn new(status_code: u16, status_text: &str) -> Self {
        RtspResponse {
            status_code,
            status_text: status_text.to_string(),
            headers: vec![("Server".to_string(), SERVER_AGENT.to_string())],
            body: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(200, "OK")
    }

    pub fn bad_request() -> Self {
        Self::new(400, "Bad Request")
    }

    pub fn unauthorized() -> Self {
        Self::new(401, "Unauthorized")
    }

    pub fn not_found() -> Self {
        Self::new(404, "Not Found")
    }

    pub fn unsupported_transport() -> Self {
        Self::new(461, "Unsupported Transport")
    }

    /// Build a response from the status code an
    /// [`RtspError`](crate::error::RtspError) maps to.
    pub fn from_status(code: u16) -> Self {
        let text = match code {
            400 => "Bad Request",
            401 => "Unauthorized",
            404 => "Not Found",
            461 => "Unsupported Transport",
            500 => "Internal Server Error",
            _ => "Error",
        };
        Self::new(code, text)
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: String) -> Self {
        self.body = Some(body);
        self
    }

    /// Every response echoes CSeq and carries the literal Session token.
    pub fn with_cseq(self, cseq: &str) -> Self {
        self.add_header("CSeq", cseq)
    }

    pub fn with_session(self) -> Self {
        self.add_header("Session", SESSION_ID)
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Parse a status line + header block (no body; the caller reads the
    /// body separately once it knows `Content-Length`, same split as
    /// [`super::request::RtspRequest::parse`]). Used by the source client
    /// to read an upstream server's OPTIONS/DESCRIBE/SETUP/PLAY replies.
    pub fn parse(raw: &str) -> Result<Self, RtspError> {
        let mut lines = raw.lines();
        let status_line = lines.next().ok_or(RtspError::Parse {
            kind: ParseErrorKind::EmptyRequest,
        })?;

        let mut parts = status_line.splitn(3, ' ');
        let _version = parts.next().ok_or(RtspError::Parse {
            kind: ParseErrorKind::InvalidRequestLine,
        })?;
        let status_code: u16 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or(RtspError::Parse {
                kind: ParseErrorKind::InvalidRequestLine,
            })?;
        let status_text = parts.next().unwrap_or("").to_string();

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

        Ok(RtspResponse {
            status_code,
            status_text,
            headers,
            body: None,
        })
    }

    pub fn content_length(&self) -> usize {
        self.get_header("Content-Length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub fn serialize(&self) -> String {
        let mut response = format!("RTSP/1.0 {} {}\r\n", self.status_code, self.status_text);
        for (name, value) in &self.headers {
            response.push_str(&format!("{}: {}\r\n", name, value));
        }
        if let Some(body) = &self.body {
            response.push_str(&format!("Content-Length: {}\r\n", body.len()));
            response.push_str("\r\n");
            response.push_str(body);
        } else {
            response.push_str("\r\n");
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_no_body() {
        let resp = RtspResponse::ok().with_cseq("1");
        let s = resp.serialize();
        assert!(s.starts_with("RTSP/1.0 200 OK\r\n"));
        assert!(s.contains("CSeq: 1\r\n"));
        assert!(s.ends_with("\r\n"));
    }

    #[test]
    fn serialize_with_body_sets_content_length() {
        let resp = RtspResponse::ok().with_body("v=0\r\n".to_string());
        let s = resp.serialize();
        assert!(s.contains("Content-Length: 5\r\n"));
        assert!(s.ends_with("v=0\r\n"));
    }

    #[test]
    fn session_header_is_the_shared_literal() {
        let resp = RtspResponse::ok().with_session();
        assert!(resp.serialize().contains("Session: 12345678\r\n"));
    }

    #[test]
    fn from_status_maps_known_codes() {
        assert_eq!(RtspResponse::from_status(461).status_code, 461);
        assert_eq!(RtspResponse::from_status(401).status_text, "Unauthorized");
    }

    #[test]
    fn parse_status_line_and_headers() {
        let raw = "RTSP/1.0 200 OK\r\nCSeq: 2\r\nContent-Length: 5\r\n\r\n";
        let resp = RtspResponse::parse(raw).unwrap();
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.get_header("CSeq"), Some("2"));
        assert_eq!(resp.content_length(), 5);
    }

    #[test]
    fn parse_rejects_empty() {
        assert!(RtspResponse::parse("").is_err());
    }
}
