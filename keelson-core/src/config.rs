//! Hierarchical typed configuration.
//!
//! A [`Config`] is a tree of typed [`Value`]s with three combinators:
//! [`Config::empty`], [`Config::skip`] and [`Config::combine`]. Combining
//! resolves each key from the first config that carries it; arrays
//! concatenate and subtrees merge recursively. A TOML loader covers the
//! common file format; durations parse from strings like `"150ms"` or
//! `"1h30m"`.

use std::time::{Duration, SystemTime};

use hashbrown::HashMap;

use crate::error::{Error, Result};

/// A typed configuration value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Signed(i64),
    Unsigned(u64),
    Float(f64),
    Str(String),
    Time(SystemTime),
    Span(Duration),
    Table(Table),
    Array(Vec<Value>),
}

/// One level of the configuration tree.
pub type Table = HashMap<String, Value>;

/// A hierarchical key/value tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    root: Table,
}

impl Config {
    /// The config with no keys.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_table(root: Table) -> Self {
        Self { root }
    }

    /// Parse a TOML document into a config tree.
    pub fn from_toml(text: &str) -> Result<Self> {
        let value: toml::Value = text
            .parse()
            .map_err(|e: toml::de::Error| Error::config(e.to_string()))?;
        match from_toml_value(value) {
            Value::Table(root) => Ok(Self { root }),
            _ => Err(Error::config("top-level TOML value must be a table")),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Top-level keys, sorted for stable iteration.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.root.keys().cloned().collect();
        keys.sort();
        keys
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.root.get(key)
    }

    /// Insert a value, replacing any previous one.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.root.insert(key.into(), value);
    }

    /// Builder-style [`Config::insert`].
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.insert(key, value);
        self
    }

    #[must_use]
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_signed(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            Value::Signed(v) => Some(*v),
            Value::Unsigned(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_unsigned(&self, key: &str) -> Option<u64> {
        match self.get(key)? {
            Value::Unsigned(v) => Some(*v),
            Value::Signed(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_float(&self, key: &str) -> Option<f64> {
        match self.get(key)? {
            Value::Float(v) => Some(*v),
            Value::Signed(v) => Some(*v as f64),
            Value::Unsigned(v) => Some(*v as f64),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.get(key)? {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_time(&self, key: &str) -> Option<SystemTime> {
        match self.get(key)? {
            Value::Time(v) => Some(*v),
            _ => None,
        }
    }

    /// A duration, either stored directly or parsed from a string value.
    #[must_use]
    pub fn get_duration(&self, key: &str) -> Option<Duration> {
        match self.get(key)? {
            Value::Span(v) => Some(*v),
            Value::Str(v) => parse_duration(v).ok(),
            _ => None,
        }
    }

    /// A subtree, cloned out as its own config.
    #[must_use]
    pub fn get_config(&self, key: &str) -> Option<Config> {
        match self.get(key)? {
            Value::Table(table) => Some(Config {
                root: table.clone(),
            }),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_array(&self, key: &str) -> Option<&[Value]> {
        match self.get(key)? {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// A copy of this config without the given top-level keys.
    #[must_use]
    pub fn skip(&self, keys: &[&str]) -> Config {
        let mut root = self.root.clone();
        for key in keys {
            root.remove(*key);
        }
        Config { root }
    }

    /// Layer configs: each key resolves from the first config carrying it,
    /// arrays concatenate in layer order, subtrees merge recursively.
    #[must_use]
    pub fn combine(first: Config, rest: impl IntoIterator<Item = Config>) -> Config {
        let mut root = first.root;
        for layer in rest {
            merge_table(&mut root, layer.root);
        }
        Config { root }
    }
}

fn merge_table(base: &mut Table, layer: Table) {
    for (key, value) in layer {
        match base.get_mut(&key) {
            None => {
                base.insert(key, value);
            }
            Some(existing) => match (existing, value) {
                (Value::Table(a), Value::Table(b)) => merge_table(a, b),
                (Value::Array(a), Value::Array(b)) => a.extend(b),
                // scalar conflicts: the earlier layer wins
                _ => {}
            },
        }
    }
}

fn from_toml_value(value: toml::Value) -> Value {
    match value {
        toml::Value::Boolean(v) => Value::Bool(v),
        toml::Value::Integer(v) => Value::Signed(v),
        toml::Value::Float(v) => Value::Float(v),
        toml::Value::String(v) => Value::Str(v),
        toml::Value::Datetime(v) => Value::Str(v.to_string()),
        toml::Value::Array(items) => {
            Value::Array(items.into_iter().map(from_toml_value).collect())
        }
        toml::Value::Table(table) => Value::Table(
            table
                .into_iter()
                .map(|(k, v)| (k, from_toml_value(v)))
                .collect(),
        ),
    }
}

/// Parse a duration string made of `<number><unit>` segments.
///
/// Units: `ns`, `us`, `ms`, `s`, `m`, `h`. Segments add up, so `"1h30m"`
/// and `"90m"` are equal. Numbers may carry a decimal part.
pub fn parse_duration(text: &str) -> Result<Duration> {
    let s = text.trim();
    if s.is_empty() {
        return Err(Error::config("empty duration"));
    }
    let bytes = s.as_bytes();
    let mut i = 0;
    let mut total = Duration::ZERO;
    while i < bytes.len() {
        let start = i;
        while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
            i += 1;
        }
        let number: f64 = s[start..i]
            .parse()
            .map_err(|_| Error::config(format!("bad duration number in {text:?}")))?;
        let unit_start = i;
        while i < bytes.len() && bytes[i].is_ascii_alphabetic() {
            i += 1;
        }
        let seconds = match &s[unit_start..i] {
            "ns" => number / 1e9,
            "us" => number / 1e6,
            "ms" => number / 1e3,
            "s" => number,
            "m" => number * 60.0,
            "h" => number * 3600.0,
            unit => {
                return Err(Error::config(format!(
                    "unknown duration unit {unit:?} in {text:?}"
                )))
            }
        };
        if !seconds.is_finite() {
            return Err(Error::config(format!("duration overflow in {text:?}")));
        }
        total += Duration::from_secs_f64(seconds);
    }
    Ok(total)
}
