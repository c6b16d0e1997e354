//! Run configuration with a canonical, fingerprintable codec.
//!
//! `Options` is an ordered map of a small closed set of value kinds. Two
//! `Options` values compare equal when their fingerprints agree, not when
//! their structures agree: volatile keys (commit message, push flag, debug
//! flag) are excluded from the digest, so two configurations that differ
//! only in those keys are the same run.

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde_json::{Number, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;

/// Keys that never contribute to the fingerprint.
pub const EXCLUDED_KEYS: [&str; 3] = ["commit_message", "push", "debug"];

/// Fingerprint alphabet: lowercase alphanumerics with visually ambiguous
/// characters (i, l, o, u) removed. 32 characters, so digits map to 5-bit
/// windows of the digest.
const FINGERPRINT_ALPHABET: &[u8; 32] = b"abcdefghjkmnpqrstvwxyz0123456789";

/// One value in an [`Options`] map.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    /// Numeric array; the only array shape the codec accepts.
    Array(Vec<Number>),
    Map(Options),
}

/// Ordered run configuration.
#[derive(Debug, Clone, Default)]
pub struct Options {
    entries: IndexMap<String, OptionValue>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: OptionValue) {
        self.entries.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.entries.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.entries.get(key) {
            Some(OptionValue::Bool(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.entries.get(key) {
            Some(OptionValue::String(value)) => Some(value),
            _ => None,
        }
    }

    /// Commit message for the results commit, if configured.
    pub fn commit_message(&self) -> Option<&str> {
        self.get_str("commit_message")
    }

    /// Whether the caller asked for results to be pushed.
    pub fn push(&self) -> bool {
        self.get_bool("push").unwrap_or(false)
    }

    /// Whether the caller asked for an untracked debug run.
    pub fn debug(&self) -> bool {
        self.get_bool("debug").unwrap_or(false)
    }

    /// Validates a JSON value into the closed `OptionValue` set.
    ///
    /// Fails with [`TrackError::Serialization`](crate::errors::TrackError)
    /// for any shape outside {null, bool, number, string, numeric array,
    /// map}.
    pub fn from_json_value(value: Value) -> Result<Self> {
        match convert_value("<root>", value)? {
            OptionValue::Map(options) => Ok(options),
            _ => Err(anyhow!(crate::errors::TrackError::Serialization {
                key: "<root>".to_string(),
                reason: "top-level options value must be a map".to_string(),
            })),
        }
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text).context("parse options JSON")?;
        Self::from_json_value(value)
    }

    pub fn load_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read options file {}", path.display()))?;
        Self::from_json_str(&text)
    }

    pub fn to_json_value(&self) -> Value {
        Value::Object(
            self.entries
                .iter()
                .map(|(key, value)| (key.clone(), value.to_json_value()))
                .collect(),
        )
    }

    pub fn to_json_string(&self) -> String {
        self.to_json_value().to_string()
    }

    pub fn dump_json_file(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(&self.to_json_value())
            .context("serialize options JSON")?;
        std::fs::write(path, text)
            .with_context(|| format!("write options file {}", path.display()))?;
        Ok(())
    }

    /// Canonical fingerprint of the configuration.
    ///
    /// Excluded keys are dropped, map keys are sorted recursively, the
    /// result is serialized compactly, hashed with SHA-256, and the digest
    /// is re-encoded in the 32-character fingerprint alphabet.
    pub fn fingerprint(&self) -> String {
        let mut canonical = String::new();
        write_canonical_map(&mut canonical, &self.entries, true);
        let digest = Sha256::digest(canonical.as_bytes());
        encode_fingerprint(&digest)
    }
}

/// Equality is fingerprint equality. Structural differences confined to
/// excluded keys do not make two configurations different runs.
impl PartialEq for Options {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint() == other.fingerprint()
    }
}

impl fmt::Display for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_json_string())
    }
}

impl OptionValue {
    pub fn to_json_value(&self) -> Value {
        match self {
            OptionValue::Null => Value::Null,
            OptionValue::Bool(value) => Value::Bool(*value),
            OptionValue::Number(value) => Value::Number(value.clone()),
            OptionValue::String(value) => Value::String(value.clone()),
            OptionValue::Array(values) => {
                Value::Array(values.iter().cloned().map(Value::Number).collect())
            }
            OptionValue::Map(options) => options.to_json_value(),
        }
    }

    pub fn from_f64(value: f64) -> Option<Self> {
        Number::from_f64(value).map(OptionValue::Number)
    }

    pub fn from_i64(value: i64) -> Self {
        OptionValue::Number(Number::from(value))
    }

    pub fn from_text(value: impl Into<String>) -> Self {
        OptionValue::String(value.into())
    }
}

fn convert_value(key: &str, value: Value) -> Result<OptionValue> {
    match value {
        Value::Null => Ok(OptionValue::Null),
        Value::Bool(inner) => Ok(OptionValue::Bool(inner)),
        Value::Number(inner) => Ok(OptionValue::Number(inner)),
        Value::String(inner) => Ok(OptionValue::String(inner)),
        Value::Array(items) => {
            let mut numbers = Vec::with_capacity(items.len());
            for (idx, item) in items.into_iter().enumerate() {
                match item {
                    Value::Number(number) => numbers.push(number),
                    other => {
                        return Err(anyhow!(crate::errors::TrackError::Serialization {
                            key: format!("{key}[{idx}]"),
                            reason: format!("arrays must be numeric, found {}", kind_name(&other)),
                        }))
                    }
                }
            }
            Ok(OptionValue::Array(numbers))
        }
        Value::Object(fields) => {
            let mut entries = IndexMap::with_capacity(fields.len());
            for (field_key, field_value) in fields {
                let converted = convert_value(&field_key, field_value)?;
                entries.insert(field_key, converted);
            }
            Ok(OptionValue::Map(Options { entries }))
        }
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "map",
    }
}

/// Writes a map in canonical form: sorted keys, compact separators.
fn write_canonical_map(out: &mut String, entries: &IndexMap<String, OptionValue>, top_level: bool) {
    let mut keys: Vec<&String> = entries
        .keys()
        .filter(|key| !top_level || !EXCLUDED_KEYS.contains(&key.as_str()))
        .collect();
    keys.sort();

    out.push('{');
    for (idx, key) in keys.iter().enumerate() {
        if idx > 0 {
            out.push(',');
        }
        out.push_str(&Value::String((*key).clone()).to_string());
        out.push(':');
        write_canonical_value(out, &entries[key.as_str()]);
    }
    out.push('}');
}

fn write_canonical_value(out: &mut String, value: &OptionValue) {
    match value {
        OptionValue::Map(options) => write_canonical_map(out, &options.entries, false),
        OptionValue::Array(numbers) => {
            out.push('[');
            for (idx, number) in numbers.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&number.to_string());
            }
            out.push(']');
        }
        other => out.push_str(&other.to_json_value().to_string()),
    }
}

/// Encodes a digest as base-32 digits over the fingerprint alphabet.
///
/// Digits are the 5-bit windows of the digest read from the least
/// significant bit, which is the positional base-32 representation of the
/// digest interpreted as a big-endian integer. Leading zero digits are
/// dropped.
fn encode_fingerprint(digest: &[u8]) -> String {
    let total_bits = digest.len() * 8;
    let mut digits = Vec::with_capacity(total_bits / 5 + 1);
    let mut pos = 0;
    while pos < total_bits {
        let mut digit = 0u8;
        for bit in 0..5 {
            let offset = pos + bit;
            if offset >= total_bits {
                break;
            }
            let byte = digest[digest.len() - 1 - offset / 8];
            if (byte >> (offset % 8)) & 1 == 1 {
                digit |= 1 << bit;
            }
        }
        digits.push(digit);
        pos += 5;
    }
    while digits.len() > 1 && digits.last() == Some(&0) {
        digits.pop();
    }
    digits
        .iter()
        .rev()
        .map(|digit| FINGERPRINT_ALPHABET[*digit as usize] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Options {
        let mut nested = Options::new();
        nested.insert("beta", OptionValue::from_f64(0.5).unwrap());
        nested.insert("alpha", OptionValue::from_i64(3));

        let mut options = Options::new();
        options.insert("solver", OptionValue::from_text("lbfgs"));
        options.insert("tolerances", OptionValue::Map(nested));
        options.insert(
            "grid",
            OptionValue::Array(vec![Number::from(1), Number::from(2), Number::from(3)]),
        );
        options.insert("seed", OptionValue::Null);
        options
    }

    #[test]
    fn fingerprint_survives_serialization_round_trip() {
        let options = sample();
        let round_tripped = Options::from_json_str(&options.to_json_string()).unwrap();
        assert_eq!(options.fingerprint(), round_tripped.fingerprint());
        assert_eq!(options, round_tripped);
    }

    #[test]
    fn excluded_keys_do_not_change_fingerprint() {
        let mut a = sample();
        let mut b = sample();
        a.insert("commit_message", OptionValue::from_text("first attempt"));
        a.insert("push", OptionValue::Bool(true));
        a.insert("debug", OptionValue::Bool(true));
        b.insert("commit_message", OptionValue::from_text("second attempt"));
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a, b);
    }

    #[test]
    fn key_order_does_not_change_fingerprint() {
        let mut forward = Options::new();
        forward.insert("a", OptionValue::from_i64(1));
        forward.insert("b", OptionValue::from_i64(2));
        let mut reversed = Options::new();
        reversed.insert("b", OptionValue::from_i64(2));
        reversed.insert("a", OptionValue::from_i64(1));
        assert_eq!(forward.fingerprint(), reversed.fingerprint());
    }

    #[test]
    fn changing_a_tracked_key_changes_fingerprint() {
        let mut a = sample();
        let b = sample();
        a.insert("solver", OptionValue::from_text("nelder-mead"));
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn non_numeric_array_is_rejected() {
        let err = Options::from_json_str(r#"{"grid": [1, "two"]}"#).unwrap_err();
        let track = crate::errors::as_track_error(&err).expect("typed error");
        assert!(matches!(
            track,
            crate::errors::TrackError::Serialization { .. }
        ));
    }

    #[test]
    fn fingerprint_uses_only_the_declared_alphabet() {
        let token = sample().fingerprint();
        assert!(!token.is_empty());
        assert!(token
            .bytes()
            .all(|byte| FINGERPRINT_ALPHABET.contains(&byte)));
        for ambiguous in ['i', 'l', 'o', 'u'] {
            assert!(!token.contains(ambiguous));
        }
    }

    #[test]
    fn empty_options_fingerprint_is_stable() {
        assert_eq!(Options::new().fingerprint(), Options::new().fingerprint());
    }
}
