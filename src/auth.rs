use sha2::{Digest, Sha256};

/// Check an `Authorization: Bearer <token>` header against the configured
/// token. The comparison runs over fixed-size digests, not the raw strings.
pub fn check_token(auth_header: Option<&str>, expected: &str) -> bool {
    let presented = match auth_header.and_then(|h| h.strip_prefix("Bearer ")) {
        Some(t) => t.trim(),
        None => return false,
    };

    let a = Sha256::digest(presented.as_bytes());
    let b = Sha256::digest(expected.as_bytes());
    a == b
}

/// Short digest prefix for logging which token is active without leaking it.
pub fn token_fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    format!("sha256:{}", &hex::encode(digest)[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_token_valid() {
        assert!(check_token(Some("Bearer secret-token"), "secret-token"));
    }

    #[test]
    fn test_check_token_wrong_value() {
        assert!(!check_token(Some("Bearer other-token"), "secret-token"));
    }

    #[test]
    fn test_check_token_missing_header() {
        assert!(!check_token(None, "secret-token"));
    }

    #[test]
    fn test_check_token_missing_scheme() {
        assert!(!check_token(Some("secret-token"), "secret-token"));
    }

    #[test]
    fn test_check_token_trims_whitespace() {
        assert!(check_token(Some("Bearer secret-token "), "secret-token"));
    }

    #[test]
    fn test_token_fingerprint_stable() {
        let fp = token_fingerprint("secret-token");
        assert!(fp.starts_with("sha256:"));
        assert_eq!(fp, token_fingerprint("secret-token"));
        assert_ne!(fp, token_fingerprint("other-token"));
    }
}
