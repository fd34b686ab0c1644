//! Constant-time comparison of shared secrets.

use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;

/// True when `provided` equals the configured secret.
///
/// An unset secret never matches, so a deployment that forgot to configure
/// a password cannot be unlocked with an empty one.
pub fn secrets_match(provided: &str, expected: Option<&SecretString>) -> bool {
    let Some(expected) = expected else {
        return false;
    };
    let expected = expected.expose_secret().as_bytes();
    if expected.is_empty() {
        return false;
    }
    provided.as_bytes().ct_eq(expected).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(s: &str) -> SecretString {
        SecretString::from(s.to_string())
    }

    #[test]
    fn matching_secret() {
        assert!(secrets_match("hunter2", Some(&secret("hunter2"))));
    }

    #[test]
    fn mismatched_secret() {
        assert!(!secrets_match("hunter3", Some(&secret("hunter2"))));
        assert!(!secrets_match("hunter", Some(&secret("hunter2"))));
        assert!(!secrets_match("", Some(&secret("hunter2"))));
    }

    #[test]
    fn unset_secret_never_matches() {
        assert!(!secrets_match("", None));
        assert!(!secrets_match("anything", None));
        assert!(!secrets_match("", Some(&secret(""))));
    }
}
