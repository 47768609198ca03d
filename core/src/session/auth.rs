//! Per-path authentication: RFC 2617 Basic and Digest, plus a
//! `sha256:<base64>`-prefixed password convention so configs never need to
//! store plaintext.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use md5::{Digest as Md5Digest, Md5};
use sha2::{Digest as Sha2Digest, Sha256};

use crate::config::AccessControl;

/// A parsed `Authorization` header.
#[derive(Debug, Clone)]
pub enum Credentials {
    Basic { user: String, pass: String },
    Digest { response_fields: Vec<(String, String)> },
}

impl Credentials {
    pub fn parse(header: &str) -> Option<Self> {
        if let Some(rest) = header.strip_prefix("Basic ") {
            let decoded = BASE64.decode(rest.trim()).ok()?;
            let text = String::from_utf8(decoded).ok()?;
            let (user, pass) = text.split_once(':')?;
            return Some(Credentials::Basic {
                user: user.to_string(),
                pass: pass.to_string(),
            });
        }
        if let Some(rest) = header.strip_prefix("Digest ") {
            let fields = rest
                .split(',')
                .filter_map(|kv| {
                    let kv = kv.trim();
                    let (k, v) = kv.split_once('=')?;
                    Some((k.trim().to_string(), v.trim().trim_matches('"').to_string()))
                })
                .collect();
            return Some(Credentials::Digest {
                response_fields: fields,
            });
        }
        None
    }
}

/// Whether `candidate` matches the configured password, honoring the
/// `sha256:<base64>` digest convention.
fn password_matches(configured: &str, candidate: &str) -> bool {
    if let Some(b64) = configured.strip_prefix("sha256:") {
        let mut hasher = Sha256::new();
        hasher.update(candidate.as_bytes());
        let digest = hasher.finalize();
        BASE64.encode(digest) == b64
    } else {
        configured == candidate
    }
}

/// Build the realm used in both the challenge and Digest HA1 computation.
pub fn realm() -> &'static str {
    "rtsp-relay"
}

/// Check Basic credentials against the ACL's configured user/pass.
pub fn check_basic(acl: &AccessControl, user: &str, pass: &str) -> bool {
    match (&acl.user, &acl.pass) {
        (Some(u), Some(p)) => u == user && password_matches(p, pass),
        (None, None) => true,
        _ => false,
    }
}

/// Verify a Digest response per RFC 2617 §3.2.2.1 (qop absent — classic
/// MD5(HA1):nonce:MD5(HA2) form, matching the subset RTSP clients use).
pub fn check_digest(
    acl: &AccessControl,
    method: &str,
    uri: &str,
    nonce: &str,
    fields: &[(String, String)],
) -> bool {
    let (Some(user), Some(pass)) = (&acl.user, &acl.pass) else {
        return true;
    };

    let get = |k: &str| fields.iter().find(|(fk, _)| fk == k).map(|(_, v)| v.as_str());
    let Some(req_user) = get("username") else {
        return false;
    };
    let Some(req_uri) = get("uri") else {
        return false;
    };
    let Some(req_nonce) = get("nonce") else {
        return false;
    };
    let Some(req_response) = get("response") else {
        return false;
    };

    if req_user != user || req_nonce != nonce {
        return false;
    }

    // Digest auth requires the plaintext password; a sha256-prefixed
    // configured password cannot satisfy Digest (only Basic). This mirrors
    // real deployments, which pick one auth method per path.
    if pass.starts_with("sha256:") {
        return false;
    }

    let ha1 = md5_hex(&format!("{}:{}:{}", user, realm(), pass));
    let ha2 = md5_hex(&format!("{}:{}", method, req_uri));
    let expected = md5_hex(&format!("{}:{}:{}", ha1, req_nonce, ha2));

    expected == *req_response && req_uri == uri
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_credentials_roundtrip() {
        let header = format!("Basic {}", BASE64.encode("alice:secret"));
        let creds = Credentials::parse(&header).unwrap();
        match creds {
            Credentials::Basic { user, pass } => {
                assert_eq!(user, "alice");
                assert_eq!(pass, "secret");
            }
            _ => panic!("expected basic"),
        }
    }

    #[test]
    fn basic_check_accepts_correct_password() {
        let acl = AccessControl {
            user: Some("alice".into()),
            pass: Some("secret".into()),
            ..Default::default()
        };
        assert!(check_basic(&acl, "alice", "secret"));
        assert!(!check_basic(&acl, "alice", "wrong"));
    }

    #[test]
    fn sha256_prefixed_password_matches_digest_of_plaintext() {
        let mut hasher = Sha256::new();
        hasher.update(b"secret");
        let digest = BASE64.encode(hasher.finalize());
        let acl = AccessControl {
            user: Some("alice".into()),
            pass: Some(format!("sha256:{}", digest)),
            ..Default::default()
        };
        assert!(check_basic(&acl, "alice", "secret"));
        assert!(!check_basic(&acl, "alice", "wrong"));
    }

    #[test]
    fn no_credentials_configured_allows_any() {
        let acl = AccessControl::default();
        assert!(check_basic(&acl, "whoever", "whatever"));
    }

    #[test]
    fn digest_response_matches_rfc2617_formula() {
        let acl = AccessControl {
            user: Some("alice".into()),
            pass: Some("secret".into()),
            ..Default::default()
        };
        let nonce = "abc123";
        let ha1 = md5_hex(&format!("alice:{}:secret", realm()));
        let ha2 = md5_hex("DESCRIBE:rtsp://host/stream");
        let response = md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2));

        let fields = vec![
            ("username".to_string(), "alice".to_string()),
            ("uri".to_string(), "rtsp://host/stream".to_string()),
            ("nonce".to_string(), nonce.to_string()),
            ("response".to_string(), response),
        ];

        assert!(check_digest(
            &acl,
            "DESCRIBE",
            "rtsp://host/stream",
            nonce,
            &fields
        ));
    }
}
