use parking_lot::Mutex;
use rand::RngExt;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;

use crate::store::Overrides;

/// Generate a 6-digit OTP code.
pub fn generate_otp() -> String {
    let code = rand::rng().random_range(100_000u32..1_000_000u32);
    code.to_string()
}

/// Generate a 16-byte random salt, hex-encoded.
pub fn generate_salt() -> String {
    let mut buf = [0u8; 16];
    rand::rng().fill(&mut buf);
    hex::encode(buf)
}

/// Hash an OTP: SHA-256(salt || otp), returned as hex string.
pub fn hash_otp(salt: &str, otp: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(otp.as_bytes());
    hex::encode(hasher.finalize())
}

/// Verify an OTP candidate against a stored hash using constant-time comparison.
pub fn verify_otp(salt: &str, candidate: &str, stored_hash: &str) -> bool {
    let candidate_hash = hash_otp(salt, candidate.trim());
    candidate_hash.as_bytes().ct_eq(stored_hash.as_bytes()).into()
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum OtpError {
    #[error("no pending config change for this number")]
    NotFound,
    #[error("OTP has expired")]
    Expired,
    #[error("invalid OTP")]
    Mismatch,
}

/// A pending config mutation gated by a one-time code. Only the salted hash
/// of the code is kept.
pub struct OtpChallenge {
    salt: String,
    hash: String,
    expires_at: Instant,
    pending: Overrides,
}

impl OtpChallenge {
    /// Returns the plaintext code (to be delivered) and the challenge to store.
    pub fn new(pending: Overrides, ttl: Duration) -> (String, Self) {
        let code = generate_otp();
        let salt = generate_salt();
        let hash = hash_otp(&salt, &code);
        let challenge = Self {
            salt,
            hash,
            expires_at: Instant::now() + ttl,
            pending,
        };
        (code, challenge)
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// In-memory OTP challenges keyed by account number.
#[derive(Default)]
pub struct OtpBook {
    challenges: Mutex<HashMap<String, OtpChallenge>>,
}

impl OtpBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a challenge, replacing any earlier one for the number.
    pub fn insert(&self, number: &str, challenge: OtpChallenge) {
        self.challenges.lock().insert(number.to_string(), challenge);
    }

    /// Validate `code`. On success the challenge is consumed and its pending
    /// payload returned. A mismatch leaves the challenge in place; expiry
    /// removes it.
    pub fn confirm(&self, number: &str, code: &str) -> Result<Overrides, OtpError> {
        let mut map = self.challenges.lock();
        let challenge = map.get(number).ok_or(OtpError::NotFound)?;

        if challenge.is_expired(Instant::now()) {
            map.remove(number);
            return Err(OtpError::Expired);
        }
        if !verify_otp(&challenge.salt, code, &challenge.hash) {
            return Err(OtpError::Mismatch);
        }

        map.remove(number)
            .map(|c| c.pending)
            .ok_or(OtpError::NotFound)
    }

    pub fn is_pending(&self, number: &str) -> bool {
        self.challenges.lock().contains_key(number)
    }

    /// Drop expired challenges. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut map = self.challenges.lock();
        let before = map.len();
        map.retain(|_, c| !c.is_expired(now));
        before - map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> Overrides {
        let mut map = Overrides::new();
        map.insert("prefix".into(), json!("!"));
        map
    }

    #[test]
    fn test_otp_is_6_digits() {
        for _ in 0..20 {
            let otp = generate_otp();
            assert_eq!(otp.len(), 6, "OTP must be 6 characters");
            assert!(otp.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_verify_wrong_code_fails() {
        let salt = generate_salt();
        let otp = generate_otp();
        let hash = hash_otp(&salt, &otp);
        assert!(verify_otp(&salt, &otp, &hash));
        let wrong = if otp == "123456" { "654321" } else { "123456" };
        assert!(!verify_otp(&salt, wrong, &hash));
    }

    #[test]
    fn confirm_with_correct_code_consumes_challenge() {
        let book = OtpBook::new();
        let (code, challenge) = OtpChallenge::new(payload(), Duration::from_secs(60));
        book.insert("111222333", challenge);

        let pending = book.confirm("111222333", &code).unwrap();
        assert_eq!(pending, payload());
        assert!(!book.is_pending("111222333"));
        assert_eq!(book.confirm("111222333", &code), Err(OtpError::NotFound));
    }

    #[test]
    fn mismatch_is_not_destructive() {
        let book = OtpBook::new();
        let (code, challenge) = OtpChallenge::new(payload(), Duration::from_secs(60));
        book.insert("111222333", challenge);

        let wrong = if code == "123456" { "654321" } else { "123456" };
        assert_eq!(book.confirm("111222333", wrong), Err(OtpError::Mismatch));
        assert!(book.is_pending("111222333"));
        assert!(book.confirm("111222333", &code).is_ok());
    }

    #[test]
    fn expired_challenge_fails_and_is_removed() {
        let book = OtpBook::new();
        let (code, challenge) = OtpChallenge::new(payload(), Duration::ZERO);
        book.insert("111222333", challenge);

        assert_eq!(book.confirm("111222333", &code), Err(OtpError::Expired));
        assert!(!book.is_pending("111222333"));
    }

    #[test]
    fn sweep_removes_only_expired() {
        let book = OtpBook::new();
        book.insert("111222333", OtpChallenge::new(payload(), Duration::ZERO).1);
        book.insert("444555666", OtpChallenge::new(payload(), Duration::from_secs(60)).1);

        assert_eq!(book.sweep(), 1);
        assert!(book.is_pending("444555666"));
    }
}
