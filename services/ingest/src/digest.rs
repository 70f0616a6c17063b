//! HTTP Digest authentication (RFC 2617, MD5, `qop=auth`).
//!
//! Cameras of this family refuse Basic credentials on their CGI endpoints
//! by default, so the listener answers the server's challenge itself.

use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DigestError {
    #[error("Not a Digest challenge: {0}")]
    NotDigest(String),

    #[error("Digest challenge missing {0}")]
    MissingParam(&'static str),

    #[error("Unsupported digest algorithm: {0}")]
    UnsupportedAlgorithm(String),
}

/// Parameters of a `WWW-Authenticate: Digest ...` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    /// True when the server offers `qop=auth`
    pub qop_auth: bool,
}

impl DigestChallenge {
    /// Parse a `WWW-Authenticate` header value.
    pub fn parse(header: &str) -> Result<Self, DigestError> {
        let header = header.trim();
        let (scheme, rest) = header.split_once(' ').unwrap_or((header, ""));
        if !scheme.eq_ignore_ascii_case("digest") {
            return Err(DigestError::NotDigest(header.to_string()));
        }

        let params = parse_params(rest);

        if let Some(algorithm) = params.get("algorithm") {
            if !algorithm.eq_ignore_ascii_case("md5") {
                return Err(DigestError::UnsupportedAlgorithm(algorithm.clone()));
            }
        }

        let realm = params
            .get("realm")
            .cloned()
            .ok_or(DigestError::MissingParam("realm"))?;
        let nonce = params
            .get("nonce")
            .cloned()
            .ok_or(DigestError::MissingParam("nonce"))?;
        let qop_auth = params
            .get("qop")
            .map(|q| q.split(',').any(|v| v.trim().eq_ignore_ascii_case("auth")))
            .unwrap_or(false);

        Ok(Self {
            realm,
            nonce,
            opaque: params.get("opaque").cloned(),
            qop_auth,
        })
    }

    /// Build the `Authorization` header value for one request.
    pub fn authorization(
        &self,
        username: &str,
        password: &str,
        method: &str,
        uri: &str,
        cnonce: &str,
        nonce_count: u32,
    ) -> String {
        let ha1 = hex_md5(&format!("{}:{}:{}", username, self.realm, password));
        let ha2 = hex_md5(&format!("{}:{}", method, uri));
        let nc = format!("{:08x}", nonce_count);

        let response = if self.qop_auth {
            hex_md5(&format!(
                "{}:{}:{}:{}:auth:{}",
                ha1, self.nonce, nc, cnonce, ha2
            ))
        } else {
            hex_md5(&format!("{}:{}:{}", ha1, self.nonce, ha2))
        };

        let mut header = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm=MD5",
            username, self.realm, self.nonce, uri, response
        );
        if self.qop_auth {
            header.push_str(&format!(", qop=auth, nc={}, cnonce=\"{}\"", nc, cnonce));
        }
        if let Some(opaque) = &self.opaque {
            header.push_str(&format!(", opaque=\"{}\"", opaque));
        }
        header
    }
}

/// Client nonce for one authorization attempt.
pub fn client_nonce(seed: u32) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    hex_md5(&format!("{}:{}", now, seed))[..16].to_string()
}

fn hex_md5(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

/// Split `key=value, key="quoted, value"` pairs. Keys are lowercased.
fn parse_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut chars = input.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if *c == ',' || c.is_whitespace()) {
            chars.next();
        }
        let key: String = chars
            .by_ref()
            .take_while(|c| *c != '=')
            .collect::<String>()
            .trim()
            .to_ascii_lowercase();
        if key.is_empty() {
            break;
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            let mut escaped = false;
            for c in chars.by_ref() {
                match c {
                    '\\' if !escaped => escaped = true,
                    '"' if !escaped => break,
                    _ => {
                        value.push(c);
                        escaped = false;
                    }
                }
            }
        } else {
            while let Some(c) = chars.peek() {
                if *c == ',' {
                    break;
                }
                value.push(*c);
                chars.next();
            }
            value = value.trim().to_string();
        }

        params.insert(key, value);
    }

    params
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHALLENGE: &str = r#"Digest realm="testrealm@host.com", qop="auth,auth-int", nonce="dcd98b7102dd2f0e8b11d0f600bfb0c093", opaque="5ccc069c403ebaf9f0171e9517f40e41""#;

    #[test]
    fn test_parse_challenge() {
        let challenge = DigestChallenge::parse(CHALLENGE).unwrap();
        assert_eq!(challenge.realm, "testrealm@host.com");
        assert_eq!(challenge.nonce, "dcd98b7102dd2f0e8b11d0f600bfb0c093");
        assert_eq!(
            challenge.opaque.as_deref(),
            Some("5ccc069c403ebaf9f0171e9517f40e41")
        );
        assert!(challenge.qop_auth);
    }

    #[test]
    fn test_rfc2617_response() {
        let challenge = DigestChallenge::parse(CHALLENGE).unwrap();
        let header = challenge.authorization(
            "Mufasa",
            "Circle Of Life",
            "GET",
            "/dir/index.html",
            "0a4f113b",
            1,
        );
        assert!(header.starts_with("Digest username=\"Mufasa\""));
        assert!(header.contains("response=\"6629fae49393a05397450978507c4ef1\""));
        assert!(header.contains("nc=00000001"));
        assert!(header.contains("cnonce=\"0a4f113b\""));
        assert!(header.contains("opaque=\"5ccc069c403ebaf9f0171e9517f40e41\""));
    }

    #[test]
    fn test_challenge_without_qop() {
        let challenge = DigestChallenge::parse(r#"Digest realm="cam", nonce="abc""#).unwrap();
        assert!(!challenge.qop_auth);
        let header = challenge.authorization("admin", "pw", "GET", "/x", "c", 1);
        assert!(!header.contains("qop="));
    }

    #[test]
    fn test_client_nonce_shape() {
        let a = client_nonce(1);
        let b = client_nonce(2);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_rejects_basic_challenge() {
        assert!(matches!(
            DigestChallenge::parse(r#"Basic realm="cam""#),
            Err(DigestError::NotDigest(_))
        ));
    }

    #[test]
    fn test_missing_nonce() {
        assert_eq!(
            DigestChallenge::parse(r#"Digest realm="cam""#),
            Err(DigestError::MissingParam("nonce"))
        );
    }

    #[test]
    fn test_unsupported_algorithm() {
        assert!(matches!(
            DigestChallenge::parse(r#"Digest realm="cam", nonce="n", algorithm=SHA-256"#),
            Err(DigestError::UnsupportedAlgorithm(_))
        ));
    }
}
