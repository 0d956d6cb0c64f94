//! Domain models for bag documents, formats, and fingerprints.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use serde_yaml::value::TaggedValue;
use serde_yaml::{Mapping, Value};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::domain::errors::{BagError, ReadFailure};

/// Persistence formats a bag file may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    #[default]
    Yaml,
}

impl Format {
    /// Return a stable identifier for logs and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Yaml => "yaml",
        }
    }

    /// File extension used for bag files in this format, without the leading dot.
    pub fn extension(&self) -> &'static str {
        match self {
            Format::Yaml => "yml",
        }
    }

    /// Resolve a format from a file extension. A leading dot is ignored.
    pub fn from_extension(extension: &str) -> Result<Self, BagError> {
        extension.parse()
    }
}

impl FromStr for Format {
    type Err = BagError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let normalized = trimmed.strip_prefix('.').unwrap_or(trimmed);
        match normalized.to_ascii_lowercase().as_str() {
            "yml" | "yaml" => Ok(Format::Yaml),
            _ => Err(BagError::FormatUnsupported {
                format: trimmed.to_string(),
            }),
        }
    }
}

/// Digest of a bag file's parsed content, used only to detect external changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint a parsed document.
    ///
    /// Mapping keys are ordered canonically before hashing, so two files that differ only in
    /// formatting, comments, or key order produce the same fingerprint.
    pub fn of(document: &Value) -> Result<Self, serde_yaml::Error> {
        let canonical = serde_yaml::to_string(&canonicalize(document)?)?;
        let digest = Sha256::digest(canonical.as_bytes());
        Ok(Self(hex::encode(digest)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn canonicalize(value: &Value) -> Result<Value, serde_yaml::Error> {
    let canonical = match value {
        Value::Mapping(map) => {
            let mut entries = map
                .iter()
                .map(|(key, value)| {
                    Ok((
                        serde_yaml::to_string(key)?,
                        canonicalize(key)?,
                        canonicalize(value)?,
                    ))
                })
                .collect::<Result<Vec<_>, serde_yaml::Error>>()?;
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Mapping(
                entries
                    .into_iter()
                    .map(|(_, key, value)| (key, value))
                    .collect(),
            )
        }
        Value::Sequence(items) => Value::Sequence(
            items
                .iter()
                .map(canonicalize)
                .collect::<Result<_, serde_yaml::Error>>()?,
        ),
        Value::Tagged(tagged) => Value::Tagged(Box::new(TaggedValue {
            tag: tagged.tag.clone(),
            value: canonicalize(&tagged.value)?,
        })),
        other => other.clone(),
    };
    Ok(canonical)
}

/// The two sections persisted in a bag file.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct BagDocument {
    /// Opaque metadata carried through load and save untouched.
    pub meta: Value,
    /// Bag entries.
    pub data: BTreeMap<String, Value>,
}

impl BagDocument {
    /// Document written for a newly created bag.
    pub fn empty() -> Self {
        Self {
            meta: Value::Mapping(Mapping::new()),
            data: BTreeMap::new(),
        }
    }

    /// Split a parsed YAML document into its `meta` and `data` sections.
    ///
    /// An empty document is treated as an empty bag and a missing or null `data` section as no
    /// entries.
    pub fn from_root(root: Value) -> Result<Self, ReadFailure> {
        let mut root = match root {
            Value::Null => return Ok(Self::default()),
            Value::Mapping(map) => map,
            other => {
                return Err(ReadFailure::Layout(format!(
                    "expected a mapping at the document root, found {}",
                    describe(&other)
                )));
            }
        };

        let meta = root.remove("meta").unwrap_or(Value::Null);
        let data = match root.remove("data") {
            None | Some(Value::Null) => BTreeMap::new(),
            Some(Value::Mapping(entries)) => entries
                .into_iter()
                .map(|(key, value)| match key {
                    Value::String(key) => Ok((key, value)),
                    other => Err(ReadFailure::Layout(format!(
                        "`data` keys must be strings, found {}",
                        describe(&other)
                    ))),
                })
                .collect::<Result<_, _>>()?,
            Some(other) => {
                return Err(ReadFailure::Layout(format!(
                    "`data` must be a mapping, found {}",
                    describe(&other)
                )));
            }
        };

        if !root.is_empty() {
            warn!(
                ignored = root.len(),
                "bag document has top-level sections other than meta and data; they will not be saved"
            );
        }

        Ok(Self { meta, data })
    }
}

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a sequence",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> Value {
        serde_yaml::from_str(source).unwrap()
    }

    #[test]
    fn format_accepts_yaml_extensions() {
        assert_eq!(Format::from_extension("yml").unwrap(), Format::Yaml);
        assert_eq!(Format::from_extension(".YAML").unwrap(), Format::Yaml);
    }

    #[test]
    fn format_rejects_other_extensions() {
        let err = Format::from_extension(".json").unwrap_err();
        match err {
            BagError::FormatUnsupported { format } => assert_eq!(format, ".json"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn fingerprint_ignores_key_order_and_formatting() {
        let a = parse("meta: {}\ndata:\n  alpha: 1\n  beta: two\n");
        let b = parse("data: {beta: two, alpha: 1}   # reordered\nmeta: {}\n");
        assert_eq!(Fingerprint::of(&a).unwrap(), Fingerprint::of(&b).unwrap());
    }

    #[test]
    fn fingerprint_covers_meta() {
        let a = parse("meta: {}\ndata: {alpha: 1}\n");
        let b = parse("meta: {owner: ops}\ndata: {alpha: 1}\n");
        assert_ne!(Fingerprint::of(&a).unwrap(), Fingerprint::of(&b).unwrap());
    }

    #[test]
    fn fingerprint_distinguishes_value_types() {
        let a = parse("data: {port: 8080}\n");
        let b = parse("data: {port: '8080'}\n");
        assert_ne!(Fingerprint::of(&a).unwrap(), Fingerprint::of(&b).unwrap());
    }

    #[test]
    fn from_root_defaults_missing_sections() {
        let document = BagDocument::from_root(parse("meta: {owner: ops}\n")).unwrap();
        assert!(document.data.is_empty());
        assert_eq!(document.meta["owner"], Value::from("ops"));

        let document = BagDocument::from_root(parse("data: ~\n")).unwrap();
        assert!(document.data.is_empty());
        assert!(document.meta.is_null());
    }

    #[test]
    fn from_root_drops_unknown_sections() {
        let document =
            BagDocument::from_root(parse("meta: {}\ndata: {a: 1}\nextra: [x]\n")).unwrap();
        assert_eq!(document.data.len(), 1);
        let rendered = serde_yaml::to_string(&document).unwrap();
        assert!(!rendered.contains("extra"));
    }

    #[test]
    fn from_root_rejects_bad_layouts() {
        assert!(matches!(
            BagDocument::from_root(parse("- one\n- two\n")),
            Err(ReadFailure::Layout(_))
        ));
        assert!(matches!(
            BagDocument::from_root(parse("data: [1, 2]\n")),
            Err(ReadFailure::Layout(_))
        ));
        assert!(matches!(
            BagDocument::from_root(parse("data: {1: one}\n")),
            Err(ReadFailure::Layout(_))
        ));
    }

    #[test]
    fn empty_document_serializes_both_sections() {
        let rendered = serde_yaml::to_string(&BagDocument::empty()).unwrap();
        assert_eq!(rendered, "meta: {}\ndata: {}\n");
    }
}
