//! Host values that must not be printed.

use serde::{Serialize, Serializer};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

const REDACTED: &str = "***";

/// An API key or token read from the host environment.
///
/// The value is wiped when dropped. `Debug` and `Serialize` print `***`;
/// the only way to the plain text is [`SecretString::expose_secret`], which
/// the env-file writer and the backends call when handing the value to a
/// sandbox.
#[derive(Clone, Default, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose_secret(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("\"\"")
        } else {
            f.write_str(REDACTED)
        }
    }
}

impl Serialize for SecretString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(if self.0.is_empty() { "" } else { REDACTED })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_never_printed() {
        let token = SecretString::new("sk-ant-123");
        assert_eq!(format!("{:?}", token), "***");
        assert_eq!(serde_json::to_string(&token).unwrap(), "\"***\"");
        assert_eq!(token.expose_secret(), "sk-ant-123");

        let host: std::collections::BTreeMap<_, _> =
            [("ANTHROPIC_API_KEY", token.clone())].into_iter().collect();
        assert!(!format!("{:?}", host).contains("sk-ant"));
    }

    #[test]
    fn test_empty_value_is_visible_as_empty() {
        let empty = SecretString::default();
        assert!(empty.is_empty());
        assert_eq!(format!("{:?}", empty), "\"\"");
        assert_ne!(empty, SecretString::new("x"));
    }
}
