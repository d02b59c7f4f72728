//! Common types used throughout Stowage.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A validated object key.
///
/// Keys are `/`-separated and backend independent. Parsing normalizes a
/// leading `/` away and rejects anything that could escape a backend root
/// or that object stores treat inconsistently.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectKey(String);

impl ObjectKey {
    /// Parse and validate a key.
    ///
    /// # Errors
    /// - Empty key (after stripping leading `/`)
    /// - Empty, `.` or `..` segments
    /// - Backslashes or NUL bytes
    pub fn parse(key: &str) -> crate::Result<Self> {
        let trimmed = key.trim_start_matches('/');
        if trimmed.is_empty() {
            return Err(crate::Error::InvalidKey("key cannot be empty".to_string()));
        }
        if trimmed.contains('\\') || trimmed.contains('\0') {
            return Err(crate::Error::InvalidKey(format!(
                "key contains forbidden characters: {:?}",
                key
            )));
        }
        for segment in trimmed.split('/') {
            match segment {
                "" => {
                    return Err(crate::Error::InvalidKey(format!(
                        "key has an empty segment: {:?}",
                        key
                    )))
                }
                "." | ".." => {
                    return Err(crate::Error::InvalidKey(format!(
                        "key has a relative segment: {:?}",
                        key
                    )))
                }
                _ => {}
            }
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// Last segment.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Everything before the last `/`, if any.
    pub fn parent(&self) -> Option<&str> {
        self.0.rsplit_once('/').map(|(parent, _)| parent)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ObjectKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ObjectKey {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::parse(&value)
    }
}

impl From<ObjectKey> for String {
    fn from(key: ObjectKey) -> Self {
        key.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_strips_leading_slash() {
        let key = ObjectKey::parse("/docs/readme.md").unwrap();
        assert_eq!(key.as_str(), "docs/readme.md");
        assert_eq!(key.file_name(), "readme.md");
        assert_eq!(key.parent(), Some("docs"));
    }

    #[test]
    fn test_parse_rejects_traversal() {
        assert!(ObjectKey::parse("../etc/passwd").is_err());
        assert!(ObjectKey::parse("a/../../b").is_err());
        assert!(ObjectKey::parse("a/./b").is_err());
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert!(ObjectKey::parse("").is_err());
        assert!(ObjectKey::parse("///").is_err());
        assert!(ObjectKey::parse("a//b").is_err());
        assert!(ObjectKey::parse("a/").is_err());
    }

    #[test]
    fn test_parse_rejects_backslash() {
        let err = ObjectKey::parse("a\\b").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidKey);
    }

    #[test]
    fn test_serde_validates() {
        let key: ObjectKey = serde_json::from_str("\"a/b.txt\"").unwrap();
        assert_eq!(key.as_str(), "a/b.txt");
        assert!(serde_json::from_str::<ObjectKey>("\"../x\"").is_err());
    }

    #[test]
    fn test_single_segment_has_no_parent() {
        let key = ObjectKey::parse("file.bin").unwrap();
        assert_eq!(key.parent(), None);
        assert_eq!(key.segments().count(), 1);
    }

    proptest! {
        #[test]
        fn prop_valid_segments_round_trip(segments in prop::collection::vec("[a-zA-Z0-9_-][a-zA-Z0-9_.-]{0,11}", 1..6)) {
            prop_assume!(segments.iter().all(|s| s != "." && s != ".."));
            let raw = segments.join("/");
            let key = ObjectKey::parse(&raw).unwrap();
            prop_assert_eq!(key.as_str(), raw.as_str());
            prop_assert_eq!(key.segments().count(), segments.len());
        }

        #[test]
        fn prop_parent_segment_always_rejected(prefix in "[a-z]{1,8}", suffix in "[a-z]{1,8}") {
            let raw = format!("{}/../{}", prefix, suffix);
            prop_assert!(ObjectKey::parse(&raw).is_err());
        }
    }
}
