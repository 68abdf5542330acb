//! Configuration values proposed by the search strategy and their canonical
//! key.
//!
//! A [`ParamSet`] is the exchange type between the search strategy, the
//! orchestrator and the result store. Two parameter sets describe the same
//! trial exactly when their canonical keys are equal.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            ParamValue::Float(v) if v.fract() == 0.0 && v.is_finite() => Some(*v as i64),
            ParamValue::Text(s) => s.trim().parse().ok(),
            ParamValue::Float(_) => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(*v),
            ParamValue::Text(s) => s.trim().parse().ok(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Fixed textual form used inside canonical keys.
    fn canonical(&self) -> String {
        match self {
            ParamValue::Int(v) => v.to_string(),
            ParamValue::Float(v) => serde_json::Number::from_f64(*v)
                .map(|n| n.to_string())
                .unwrap_or_else(|| "null".to_string()),
            ParamValue::Text(s) => quote(s),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Loose parsing for `k=v` command-line bindings: integers first, then
/// floats, then plain text.
impl FromStr for ParamValue {
    type Err = std::convert::Infallible;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if let Ok(v) = trimmed.parse::<i64>() {
            return Ok(ParamValue::Int(v));
        }
        if let Ok(v) = trimmed.parse::<f64>() {
            return Ok(ParamValue::Float(v));
        }
        Ok(ParamValue::Text(trimmed.to_string()))
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        ParamValue::Int(i64::from(v))
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Text(v)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamSet(BTreeMap<String, ParamValue>);

impl ParamSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<ParamValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: &str, value: impl Into<ParamValue>) {
        self.0.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Values from `other` win on key collisions.
    pub fn merged(&self, other: &ParamSet) -> ParamSet {
        let mut out = self.clone();
        for (k, v) in other.iter() {
            out.0.insert(k.clone(), v.clone());
        }
        out
    }

    pub fn require_u32(&self, name: &str) -> Result<u32, ConfigError> {
        let value = self
            .get(name)
            .ok_or_else(|| ConfigError::MissingParam(name.to_string()))?;
        value
            .as_i64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| ConfigError::InvalidParam {
                name: name.to_string(),
                value: value.to_string(),
            })
    }

    pub fn optional_u32(&self, name: &str) -> Result<Option<u32>, ConfigError> {
        match self.get(name) {
            None => Ok(None),
            Some(_) => self.require_u32(name).map(Some),
        }
    }

    pub fn require_text(&self, name: &str) -> Result<String, ConfigError> {
        self.get(name)
            .map(|v| v.to_string())
            .ok_or_else(|| ConfigError::MissingParam(name.to_string()))
    }

    pub fn optional_text(&self, name: &str) -> Option<String> {
        self.get(name).map(|v| v.to_string())
    }

    /// Text parameter restricted to a fixed set of choices.
    pub fn require_choice(&self, name: &str, choices: &[&str]) -> Result<String, ConfigError> {
        let value = self.require_text(name)?;
        if choices.contains(&value.as_str()) {
            Ok(value)
        } else {
            Err(ConfigError::InvalidParam {
                name: name.to_string(),
                value,
            })
        }
    }

    pub fn canonical_key(&self) -> String {
        canonicalize(self)
    }

    pub fn digest(&self) -> String {
        config_digest(&self.canonical_key())
    }
}

impl FromIterator<(String, ParamValue)> for ParamSet {
    fn from_iter<I: IntoIterator<Item = (String, ParamValue)>>(iter: I) -> Self {
        ParamSet(iter.into_iter().collect())
    }
}

/// Compact JSON object with keys in byte order and fixed value formatting.
pub fn canonicalize(params: &ParamSet) -> String {
    let body = params
        .iter()
        .map(|(k, v)| format!("{}:{}", quote(k), v.canonical()))
        .collect::<Vec<_>>()
        .join(",");
    format!("{{{}}}", body)
}

/// Same canonical form for string-valued maps (provisioning variables).
pub fn canonicalize_vars(vars: &BTreeMap<String, String>) -> String {
    let body = vars
        .iter()
        .map(|(k, v)| format!("{}:{}", quote(k), quote(v)))
        .collect::<Vec<_>>()
        .join(",");
    format!("{{{}}}", body)
}

pub fn config_digest(canonical_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_key.as_bytes());
    let full = hex::encode(hasher.finalize());
    full[..12].to_string()
}

fn quote(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| format!("\"{}\"", s))
}

/// Physical resource shape of a service-under-test deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceShape {
    pub nodes: u32,
    pub cpu_per_node: u32,
    pub ram_gb_per_node: u32,
    #[serde(default)]
    pub drives: Vec<DriveGroup>,
}

/// `count` drives of `size_gb` each, attached to every node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriveGroup {
    pub count: u32,
    pub size_gb: u32,
    pub kind: String,
}

impl ResourceShape {
    pub fn total_drives(&self) -> u32 {
        self.nodes * self.drives.iter().map(|d| d.count).sum::<u32>()
    }

    /// Drive groups with an empty kind use the provider's stock disk.
    pub fn with_default_drive_kind(mut self, kind: &str) -> Self {
        for drive in self.drives.iter_mut().filter(|d| d.kind.is_empty()) {
            drive.kind = kind.to_string();
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_key_ignores_insertion_order() {
        let a = ParamSet::new()
            .with("nodes", 4i64)
            .with("drive_type", "fast")
            .with("cpu_per_node", 8i64);
        let b = ParamSet::new()
            .with("cpu_per_node", 8i64)
            .with("nodes", 4i64)
            .with("drive_type", "fast");
        assert_eq!(canonicalize(&a), canonicalize(&b));
        assert_eq!(
            canonicalize(&a),
            r#"{"cpu_per_node":8,"drive_type":"fast","nodes":4}"#
        );
    }

    #[test]
    fn canonical_key_differs_when_values_differ() {
        let a = ParamSet::new().with("nodes", 4i64);
        let b = ParamSet::new().with("nodes", 2i64);
        let c = ParamSet::new().with("nodes", 4i64).with("cpu", 2i64);
        assert_ne!(canonicalize(&a), canonicalize(&b));
        assert_ne!(canonicalize(&a), canonicalize(&c));
    }

    #[test]
    fn canonical_key_survives_json_round_trip_in_any_field_order() {
        let first: ParamSet =
            serde_json::from_str(r#"{"ram": 16, "ratio": 0.25, "policy": "allkeys-lru"}"#)
                .expect("parse");
        let second: ParamSet =
            serde_json::from_str(r#"{"policy": "allkeys-lru", "ram": 16, "ratio": 0.25}"#)
                .expect("parse");
        assert_eq!(first.canonical_key(), second.canonical_key());
        assert_eq!(first.digest(), second.digest());
        assert_eq!(first.digest().len(), 12);
    }

    #[test]
    fn loose_values_parse_as_int_float_then_text() {
        assert_eq!("8".parse::<ParamValue>().unwrap(), ParamValue::Int(8));
        assert_eq!("1.5".parse::<ParamValue>().unwrap(), ParamValue::Float(1.5));
        assert_eq!(
            "fast".parse::<ParamValue>().unwrap(),
            ParamValue::Text("fast".to_string())
        );
    }

    #[test]
    fn require_choice_rejects_unknown_values() {
        let params = ParamSet::new().with("mode", "cluster");
        assert!(params.require_choice("mode", &["single", "sentinel"]).is_err());
        assert_eq!(
            params.require_u32("nodes"),
            Err(ConfigError::MissingParam("nodes".to_string()))
        );
    }
}
