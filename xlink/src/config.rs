//! Mergeable option sets consumed by every channel variant.
//!
//! A [`TransportConfig`] is an ordered map of option name to [`OptionValue`].
//! Channels merge each `configure()` call over the previous options and then
//! validate the merged map against the keys they recognise.
//!
//! # Example
//!
//! ```rust
//! use xlink::TransportConfig;
//!
//! let mut config = TransportConfig::new()
//!     .with("host", "127.0.0.1")
//!     .with("port", 5005);
//! config.merge(TransportConfig::new().with("port", 6000).with("timeout", 250));
//!
//! assert_eq!(config.int("port").unwrap(), Some(6000));
//! assert_eq!(config.text("host").unwrap(), Some("127.0.0.1"));
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// A single option value.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl OptionValue {
    fn type_name(&self) -> &'static str {
        match self {
            OptionValue::Bool(_) => "bool",
            OptionValue::Int(_) => "int",
            OptionValue::Float(_) => "float",
            OptionValue::Text(_) => "string",
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Bool(v) => write!(f, "{}", v),
            OptionValue::Int(v) => write!(f, "{}", v),
            OptionValue::Float(v) => write!(f, "{}", v),
            OptionValue::Text(v) => write!(f, "{:?}", v),
        }
    }
}

impl From<bool> for OptionValue {
    fn from(v: bool) -> Self {
        OptionValue::Bool(v)
    }
}

impl From<i64> for OptionValue {
    fn from(v: i64) -> Self {
        OptionValue::Int(v)
    }
}

impl From<i32> for OptionValue {
    fn from(v: i32) -> Self {
        OptionValue::Int(v as i64)
    }
}

impl From<u16> for OptionValue {
    fn from(v: u16) -> Self {
        OptionValue::Int(v as i64)
    }
}

impl From<u32> for OptionValue {
    fn from(v: u32) -> Self {
        OptionValue::Int(v as i64)
    }
}

impl From<usize> for OptionValue {
    fn from(v: usize) -> Self {
        OptionValue::Int(v as i64)
    }
}

impl From<f64> for OptionValue {
    fn from(v: f64) -> Self {
        OptionValue::Float(v)
    }
}

impl From<&str> for OptionValue {
    fn from(v: &str) -> Self {
        OptionValue::Text(v.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(v: String) -> Self {
        OptionValue::Text(v)
    }
}

/// Option name to value mapping.
///
/// Later writes win; [`merge`](Self::merge) never removes keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportConfig {
    options: BTreeMap<String, OptionValue>,
}

impl TransportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<OptionValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<OptionValue>) {
        self.options.insert(key.into(), value.into());
    }

    /// Merges `other` over `self`: overlapping keys take `other`'s value,
    /// keys only present in `self` persist.
    pub fn merge(&mut self, other: TransportConfig) {
        self.options.extend(other.options);
    }

    /// Returns a copy of `self` with `other` merged over it.
    pub fn merged(&self, other: &TransportConfig) -> TransportConfig {
        let mut out = self.clone();
        out.merge(other.clone());
        out
    }

    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.options.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.options.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &OptionValue)> {
        self.options.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Rejects any key not in `known`.
    pub fn ensure_known(&self, known: &[&str]) -> Result<()> {
        match self.options.keys().find(|k| !known.contains(&k.as_str())) {
            Some(key) => Err(Error::Configuration(format!(
                "unrecognized option '{}' (expected one of: {})",
                key,
                known.join(", ")
            ))),
            None => Ok(()),
        }
    }

    /// Looks up the first present key among aliases.
    ///
    /// If more than one alias is set the last one in `aliases` wins.
    fn lookup(&self, aliases: &[&str]) -> Option<(&str, &OptionValue)> {
        aliases
            .iter()
            .rev()
            .find_map(|k| self.options.get_key_value(*k).map(|(k, v)| (k.as_str(), v)))
    }

    fn mismatch(key: &str, expected: &str, found: &OptionValue) -> Error {
        Error::Configuration(format!(
            "option '{}' must be a {}, got {} {}",
            key,
            expected,
            found.type_name(),
            found
        ))
    }

    pub fn text(&self, key: &str) -> Result<Option<&str>> {
        self.text_any(&[key])
    }

    pub fn text_any(&self, aliases: &[&str]) -> Result<Option<&str>> {
        match self.lookup(aliases) {
            None => Ok(None),
            Some((_, OptionValue::Text(s))) => Ok(Some(s.as_str())),
            Some((key, other)) => Err(Self::mismatch(key, "string", other)),
        }
    }

    pub fn int(&self, key: &str) -> Result<Option<i64>> {
        match self.lookup(&[key]) {
            None => Ok(None),
            Some((_, OptionValue::Int(v))) => Ok(Some(*v)),
            Some((key, other)) => Err(Self::mismatch(key, "int", other)),
        }
    }

    pub fn float(&self, key: &str) -> Result<Option<f64>> {
        match self.lookup(&[key]) {
            None => Ok(None),
            Some((_, OptionValue::Float(v))) => Ok(Some(*v)),
            Some((_, OptionValue::Int(v))) => Ok(Some(*v as f64)),
            Some((key, other)) => Err(Self::mismatch(key, "float", other)),
        }
    }

    pub fn bool(&self, key: &str) -> Result<Option<bool>> {
        match self.lookup(&[key]) {
            None => Ok(None),
            Some((_, OptionValue::Bool(v))) => Ok(Some(*v)),
            Some((key, other)) => Err(Self::mismatch(key, "bool", other)),
        }
    }

    /// Integer option constrained to `[min, max]`.
    pub fn bounded(&self, key: &str, min: i64, max: i64) -> Result<Option<i64>> {
        match self.int(key)? {
            Some(v) if v < min || v > max => Err(Error::Configuration(format!(
                "option '{}' = {} is outside {}..={}",
                key, v, min, max
            ))),
            other => Ok(other),
        }
    }

    pub fn port(&self, key: &str) -> Result<Option<u16>> {
        Ok(self.bounded(key, 0, u16::MAX as i64)?.map(|v| v as u16))
    }

    /// Millisecond option as a [`Duration`]; must be positive.
    pub fn millis(&self, key: &str) -> Result<Option<Duration>> {
        Ok(self
            .bounded(key, 1, i64::MAX)?
            .map(|v| Duration::from_millis(v as u64)))
    }

    /// Builds a config from a flat TOML table.
    pub fn from_toml_table(table: &toml::Table) -> Result<Self> {
        let mut config = TransportConfig::new();
        for (key, value) in table {
            let value = match value {
                toml::Value::Boolean(v) => OptionValue::Bool(*v),
                toml::Value::Integer(v) => OptionValue::Int(*v),
                toml::Value::Float(v) => OptionValue::Float(*v),
                toml::Value::String(v) => OptionValue::Text(v.clone()),
                other => {
                    return Err(Error::Configuration(format!(
                        "option '{}' has unsupported type {}",
                        key,
                        other.type_str()
                    )));
                }
            };
            config.set(key.clone(), value);
        }
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let table: toml::Table = text.parse()?;
        Self::from_toml_table(&table)
    }
}

/// A configuration file made of named `TransportConfig` sections.
///
/// ```toml
/// [datagram]
/// host = "192.168.1.20"
/// port = 5005
/// bufferSize = 65535
///
/// [supervisor]
/// retryAttempts = 3
/// ```
#[derive(Debug, Clone, Default)]
pub struct ConfigFile {
    sections: BTreeMap<String, TransportConfig>,
}

impl ConfigFile {
    pub fn parse(text: &str) -> Result<Self> {
        let root: toml::Table = text.parse()?;
        let mut sections = BTreeMap::new();
        for (name, value) in &root {
            match value {
                toml::Value::Table(table) => {
                    sections.insert(name.clone(), TransportConfig::from_toml_table(table)?);
                }
                _ => {
                    return Err(Error::Configuration(format!(
                        "top-level key '{}' must be a section table",
                        name
                    )));
                }
            }
        }
        Ok(Self { sections })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&text)
    }

    /// Section by name, empty if absent.
    pub fn section(&self, name: &str) -> TransportConfig {
        self.sections.get(name).cloned().unwrap_or_default()
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.sections.contains_key(name)
    }
}
