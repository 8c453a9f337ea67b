//! Structured outcome values captured during a stage

use serde::{Deserialize, Serialize};
use std::fmt;

/// Value recorded for an outcome field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl FieldValue {
    /// Interpret the value as a yes/no answer
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            FieldValue::Number(n) => Some(*n != 0.0),
            FieldValue::Text(t) => match t.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "y" => Some(true),
                "false" | "no" | "n" => Some(false),
                _ => None,
            },
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(t) => Some(t),
            _ => None,
        }
    }

    /// Compare against a branch predicate value.
    ///
    /// Same-kind values compare directly (text ignoring case and surrounding
    /// whitespace). Text recorded by a backend is coerced when the predicate
    /// is a bool or number.
    pub fn matches(&self, expected: &FieldValue) -> bool {
        match (self, expected) {
            (FieldValue::Bool(a), FieldValue::Bool(b)) => a == b,
            (FieldValue::Number(a), FieldValue::Number(b)) => (a - b).abs() < f64::EPSILON,
            (FieldValue::Text(a), FieldValue::Text(b)) => a.trim().eq_ignore_ascii_case(b.trim()),
            (actual, FieldValue::Bool(b)) => actual.as_bool() == Some(*b),
            (FieldValue::Text(a), FieldValue::Number(b)) => a
                .trim()
                .parse::<f64>()
                .map(|n| (n - b).abs() < f64::EPSILON)
                .unwrap_or(false),
            _ => false,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Number(n) => write!(f, "{}", n),
            FieldValue::Text(t) => write!(f, "{}", t),
        }
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

fn default_required() -> bool {
    true
}

/// Outcome field a stage can record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeField {
    pub name: String,
    /// Shown to the reply backend so it knows what to capture
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_required")]
    pub required: bool,
}

impl OutcomeField {
    pub fn required(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required: false,
        }
    }
}
