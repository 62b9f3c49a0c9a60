//! Pluggable credential matchers.
//!
//! When the realm is configured to fetch a password attribute instead of
//! binding as the user, the presented credential is compared against the
//! stored attribute value through one of these matchers. Matchers are
//! resolved by name from a fixed registry at configuration time; an unknown
//! name is a configuration error, not a runtime lookup failure.

use std::sync::Arc;

use argon2::password_hash::PasswordHash;
use argon2::{Argon2, PasswordVerifier};

use crate::error::{RealmError, RealmResult};

/// Compare a presented credential against a stored attribute value.
pub trait CredentialMatcher: std::fmt::Debug + Send + Sync {
    /// Returns `true` when the presented credential matches the stored value.
    fn matches(&self, presented: &str, stored: &str) -> bool;
}

/// Literal comparison for directories that store clear-text passwords.
#[derive(Debug, Default)]
pub struct PlaintextMatcher;

impl CredentialMatcher for PlaintextMatcher {
    fn matches(&self, presented: &str, stored: &str) -> bool {
        presented == stored
    }
}

/// Argon2 PHC-string verification.
///
/// The stored attribute value must be a PHC-formatted hash. A value that
/// does not parse as one never matches.
#[derive(Debug, Default)]
pub struct Argon2Matcher;

impl CredentialMatcher for Argon2Matcher {
    fn matches(&self, presented: &str, stored: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(stored) else {
            return false;
        };
        Argon2::default()
            .verify_password(presented.as_bytes(), &parsed)
            .is_ok()
    }
}

/// Resolve a matcher implementation by its configured name.
pub fn matcher_for(name: &str) -> RealmResult<Arc<dyn CredentialMatcher>> {
    match name {
        "plaintext" => Ok(Arc::new(PlaintextMatcher)),
        "argon2" => Ok(Arc::new(Argon2Matcher)),
        other => Err(RealmError::configuration(format!(
            "unknown credential matcher: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argon2::password_hash::{rand_core::OsRng, SaltString};
    use argon2::PasswordHasher;

    #[test]
    fn test_plaintext_matcher() {
        let matcher = PlaintextMatcher;
        assert!(matcher.matches("secret", "secret"));
        assert!(!matcher.matches("secret", "other"));
    }

    #[test]
    fn test_argon2_matcher_round_trip() {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(b"correct horse", &salt)
            .unwrap()
            .to_string();

        let matcher = Argon2Matcher;
        assert!(matcher.matches("correct horse", &hash));
        assert!(!matcher.matches("battery staple", &hash));
    }

    #[test]
    fn test_argon2_matcher_rejects_malformed_hash() {
        let matcher = Argon2Matcher;
        assert!(!matcher.matches("anything", "not-a-phc-string"));
    }

    #[test]
    fn test_registry() {
        assert!(matcher_for("plaintext").is_ok());
        assert!(matcher_for("argon2").is_ok());

        let err = matcher_for("md5crypt").unwrap_err();
        assert_eq!(err.error_code(), "INVALID_CONFIG");
    }
}
