//! # depot-schema
//!
//! Manifest types for application container images.
//!
//! An image carries a JSON manifest at a well-known path inside its archive.
//! The store only inspects two of its fields, the logical name and the
//! label set, but keeps the surrounding envelope intact so callers can
//! render it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Manifest kind tag carried on the wire.
pub const AC_KIND: &str = "ImageManifest";
/// Schema version written into freshly-built manifests.
pub const AC_VERSION: &str = "0.8.11";

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("invalid app name {0:?}: expected lowercase [a-z0-9] runs separated by '-', '.' or '/'")]
    InvalidAppName(String),
}

pub type Result<T> = std::result::Result<T, SchemaError>;

/// Logical image name, e.g. `example.com/reduce-worker`.
///
/// Validated on construction and on deserialization: lowercase alphanumeric
/// runs separated by single `-`, `.` or `/` characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AppName(String);

impl AppName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(s: &str) -> Result<()> {
        let invalid = || SchemaError::InvalidAppName(s.to_string());
        let is_word = |c: u8| c.is_ascii_lowercase() || c.is_ascii_digit();

        let bytes = s.as_bytes();
        if bytes.is_empty() || !is_word(bytes[0]) || !is_word(bytes[bytes.len() - 1]) {
            return Err(invalid());
        }
        let mut after_separator = false;
        for &c in bytes {
            if is_word(c) {
                after_separator = false;
            } else if matches!(c, b'-' | b'.' | b'/') {
                if after_separator {
                    return Err(invalid());
                }
                after_separator = true;
            } else {
                return Err(invalid());
            }
        }
        Ok(())
    }
}

impl FromStr for AppName {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self> {
        Self::validate(s)?;
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for AppName {
    type Error = SchemaError;

    fn try_from(s: String) -> Result<Self> {
        Self::validate(&s)?;
        Ok(Self(s))
    }
}

impl From<AppName> for String {
    fn from(name: AppName) -> String {
        name.0
    }
}

impl fmt::Display for AppName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One `name=value` pair attached to an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

/// Ordered label set. Order is preserved from the manifest; lookups scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Labels(Vec<Label>);

impl Labels {
    pub fn from_pairs<N, V>(pairs: impl IntoIterator<Item = (N, V)>) -> Self
    where
        N: Into<String>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(name, value)| Label {
                    name: name.into(),
                    value: value.into(),
                })
                .collect(),
        )
    }

    /// Value of the first label named `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.value.as_str())
    }

    /// Whether the exact `name=value` pair is present.
    pub fn has(&self, name: &str, value: &str) -> bool {
        self.0.iter().any(|l| l.name == name && l.value == value)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Label> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> IntoIterator for &'a Labels {
    type Item = &'a Label;
    type IntoIter = std::slice::Iter<'a, Label>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Parsed image manifest.
///
/// Field names follow the camelCase wire schema (`acKind`, `acVersion`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub ac_kind: String,
    pub ac_version: String,
    pub name: AppName,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub annotations: Labels,
}

impl ImageManifest {
    pub fn new(name: AppName, labels: Labels) -> Self {
        Self {
            ac_kind: AC_KIND.to_string(),
            ac_version: AC_VERSION.to_string(),
            name,
            labels,
            annotations: Labels::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_app_names() {
        for name in ["nginx", "example.com/reduce-worker", "a-b.c/d0", "0"] {
            assert!(name.parse::<AppName>().is_ok(), "{name:?} should parse");
        }
    }

    #[test]
    fn test_invalid_app_names() {
        for name in ["", "Nginx", "a..b", "-lead", "trail-", "a b", "a//b", "ü"] {
            assert!(name.parse::<AppName>().is_err(), "{name:?} should be rejected");
        }
    }

    #[test]
    fn test_labels_lookup() {
        let labels = Labels::from_pairs([("version", "1.0"), ("os", "linux")]);
        assert_eq!(labels.get("version"), Some("1.0"));
        assert_eq!(labels.get("arch"), None);
        assert!(labels.has("os", "linux"));
        assert!(!labels.has("os", "darwin"));
    }

    #[test]
    fn test_manifest_wire_format() {
        let manifest = ImageManifest::new(
            "example.com/app".parse().unwrap(),
            Labels::from_pairs([("version", "2.0")]),
        );

        let json = serde_json::to_string(&manifest).unwrap();
        assert!(json.contains(r#""acKind":"ImageManifest""#));
        assert!(json.contains(r#""acVersion""#));

        let parsed: ImageManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, manifest);
    }

    #[test]
    fn test_manifest_rejects_bad_name() {
        let json = r#"{"acKind":"ImageManifest","acVersion":"0.8.11","name":"Not Valid"}"#;
        assert!(serde_json::from_str::<ImageManifest>(json).is_err());
    }

    #[test]
    fn test_manifest_defaults_labels() {
        let json = r#"{"acKind":"ImageManifest","acVersion":"0.8.11","name":"example.com/app"}"#;
        let parsed: ImageManifest = serde_json::from_str(json).unwrap();
        assert!(parsed.labels.is_empty());
    }
}
