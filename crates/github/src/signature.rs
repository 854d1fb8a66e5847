//! `X-Hub-Signature-256` verification.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Check a `sha256=<hex>` signature header against the HMAC-SHA256 of `raw_body`.
///
/// Returns false for an empty secret, a header without the `sha256=` prefix, a digest
/// that is not hex, or a mismatch. The digest comparison is constant-time.
pub fn verify(raw_body: &[u8], signature_header: &str, secret: &[u8]) -> bool {
    if secret.is_empty() {
        return false;
    }
    let Some(digest) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(raw_body);
    mac.verify_slice(&expected).is_ok()
}

/// Produce the header value GitHub would send for `raw_body`.
pub fn sign(raw_body: &[u8], secret: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(raw_body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = br#"{"action":"completed","workflow_run":{"id":1}}"#;
    const SECRET: &[u8] = b"It's a Secret to Everybody";

    #[test]
    fn test_github_reference_vector() {
        // Example from GitHub's webhook validation docs.
        assert!(verify(
            b"Hello, World!",
            "sha256=757107ea0eb2509fc211221cce984b8a37570b6d7586c22c46f4379c8b043e17",
            SECRET,
        ));
    }

    #[test]
    fn test_sign_then_verify() {
        let header = sign(BODY, SECRET);
        assert!(header.starts_with("sha256="));
        assert_eq!(header.len(), "sha256=".len() + 64);
        assert!(verify(BODY, &header, SECRET));
        assert!(verify(BODY, &header.to_ascii_uppercase().replace("SHA256=", "sha256="), SECRET));
    }

    #[test]
    fn test_any_body_bit_flip_fails() {
        let header = sign(BODY, SECRET);
        for byte in 0..BODY.len() {
            for bit in 0..8 {
                let mut mutated = BODY.to_vec();
                mutated[byte] ^= 1 << bit;
                assert!(!verify(&mutated, &header, SECRET), "byte {byte} bit {bit}");
            }
        }
    }

    #[test]
    fn test_any_secret_bit_flip_fails() {
        let header = sign(BODY, SECRET);
        for byte in 0..SECRET.len() {
            for bit in 0..8 {
                let mut mutated = SECRET.to_vec();
                mutated[byte] ^= 1 << bit;
                assert!(!verify(BODY, &header, &mutated), "byte {byte} bit {bit}");
            }
        }
    }

    #[test]
    fn test_malformed_headers() {
        let header = sign(BODY, SECRET);
        let digest = header.strip_prefix("sha256=").unwrap();
        assert!(!verify(BODY, digest, SECRET));
        assert!(!verify(BODY, &format!("sha1={digest}"), SECRET));
        assert!(!verify(BODY, "sha256=not-hex", SECRET));
        assert!(!verify(BODY, "sha256=", SECRET));
        assert!(!verify(BODY, &header[..header.len() - 2], SECRET));
        assert!(!verify(BODY, "", SECRET));
    }

    #[test]
    fn test_empty_secret_never_verifies() {
        let header = sign(BODY, b"");
        assert!(!verify(BODY, &header, b""));
    }
}
