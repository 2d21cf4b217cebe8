//! Parsing of ServerQuery response lines into records.
//!
//! A response line holds one or more records separated by `|`. Each record is
//! a list of space-separated tokens, each either `key=value` or a bare flag:
//!
//! ```text
//! cid=1 pid=0 channel_name=Lobby|cid=2 pid=0 channel_name=Talk
//! ```
//!
//! Keys and values are unescaped. A value becomes [`Value::Int`] only when
//! printing the parsed integer gives back exactly the decoded text, so `042`,
//! `+5` and out-of-range numbers stay strings.

use std::fmt;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use super::escape::{unescape_with, EscapePolicy};

/// Separator between records on one line.
pub const RECORD_SEPARATOR: char = '|';
/// Separator between tokens inside a record.
pub const TOKEN_SEPARATOR: char = ' ';

/// A single decoded field value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Str(String),
}

impl Value {
    /// Decode a raw (already unescaped) value, coercing canonical integers.
    pub fn coerce(decoded: String) -> Self {
        match decoded.parse::<i64>() {
            Ok(n) if n.to_string() == decoded => Value::Int(n),
            _ => Value::Str(decoded),
        }
    }

    /// The integer, if the value was coerced to one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Str(_) => None,
        }
    }

    /// The text, if the value stayed a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            Value::Int(_) => None,
        }
    }

    /// Convert to a JSON value for typed decoding.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Int(n) => serde_json::Value::from(*n),
            Value::Str(s) => serde_json::Value::from(s.as_str()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{}", n),
            Value::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

/// One flat key/value record, in wire order.
///
/// Inserting an existing key replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    fields: Vec<(String, Value)>,
}

impl Record {
    /// Empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a field.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((key, value)),
        }
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Integer value under `key`; `None` for missing or text values.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_int)
    }

    /// Field as text; integers are rendered back to their decimal form.
    pub fn get_string(&self, key: &str) -> Option<String> {
        self.get(key).map(Value::to_string)
    }

    /// Whether `key` is present, including bare flags.
    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the record has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Fields in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Convert to a JSON object for typed decoding.
    pub fn to_json(&self) -> serde_json::Value {
        let map = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(map)
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (k, v) in &self.fields {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut record = Record::new();
        for (k, v) in iter {
            record.insert(k, v);
        }
        record
    }
}

/// Parse a response line with the standard escape policy.
///
/// Returns `None` for empty input, which is distinct from a line that
/// parsed into records.
pub fn parse_response(line: &str) -> Option<Vec<Record>> {
    parse_response_with(line, EscapePolicy::Standard)
}

/// Parse a response line into its records.
///
/// Never fails: a token without `=` becomes a flag with an empty string
/// value, and consecutive separators are ignored.
pub fn parse_response_with(line: &str, policy: EscapePolicy) -> Option<Vec<Record>> {
    if line.is_empty() {
        return None;
    }

    let records = line
        .split(RECORD_SEPARATOR)
        .map(|segment| parse_record(segment, policy))
        .collect();

    Some(records)
}

fn parse_record(segment: &str, policy: EscapePolicy) -> Record {
    let mut record = Record::new();

    for token in segment.split(TOKEN_SEPARATOR).filter(|t| !t.is_empty()) {
        match token.split_once('=') {
            Some((key, value)) => {
                record.insert(
                    unescape_with(key, policy),
                    Value::coerce(unescape_with(value, policy)),
                );
            }
            None => record.insert(unescape_with(token, policy), String::new()),
        }
    }

    record
}
