use rand::{distributions::Alphanumeric, Rng};
use sha2::{Digest, Sha256};

/// Generate a fresh pairing secret for devices that did not bring one.
pub fn generate_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect()
}

/// Fingerprint of a pairing secret using SHA-256. Only the fingerprint is
/// stored; the secret stays on the two endpoints.
pub fn fingerprint(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Verify a presented fingerprint against the stored one.
pub fn verify_fingerprint(presented: &str, stored: &str) -> bool {
    presented == stored
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_generation() {
        let s1 = generate_secret();
        let s2 = generate_secret();
        assert_ne!(s1, s2);
        assert_eq!(s1.len(), 12);
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let secret = "test_secret";
        let fp1 = fingerprint(secret);
        let fp2 = fingerprint(secret);

        assert_eq!(fp1, fp2);
        assert_ne!(fp1, secret);
    }

    #[test]
    fn test_fingerprint_verification() {
        let stored = fingerprint("correct_secret");

        assert!(verify_fingerprint(&fingerprint("correct_secret"), &stored));
        assert!(!verify_fingerprint(&fingerprint("wrong_secret"), &stored));
    }
}
