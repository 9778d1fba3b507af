//! Redaction of credentials and card numbers before log data reaches a sink

use crate::{config::PrivacyConfig, Error, Fields, Result};
use regex::Regex;
use serde_json::Value;

const REDACTED: &str = "[REDACTED]";

/// Redacts sensitive values from messages and structured fields
#[derive(Debug, Clone)]
pub struct DataSanitizer {
    patterns: Vec<Regex>,
    redacted_fields: Vec<String>,
}

impl DataSanitizer {
    /// Create a new data sanitizer
    pub fn new(config: &PrivacyConfig) -> Result<Self> {
        let mut patterns = Vec::with_capacity(config.redaction_patterns.len());

        for pattern_str in &config.redaction_patterns {
            let regex = Regex::new(pattern_str).map_err(|e| Error::Config {
                message: format!("Invalid redaction pattern '{}': {}", pattern_str, e),
            })?;
            patterns.push(regex);
        }

        Ok(Self {
            patterns,
            redacted_fields: config
                .redacted_fields
                .iter()
                .map(|field| field.to_lowercase())
                .collect(),
        })
    }

    /// Sanitize a text string
    pub fn sanitize_text(&self, text: &str) -> String {
        let mut sanitized = text.to_string();

        for pattern in &self.patterns {
            sanitized = pattern
                .replace_all(&sanitized, |caps: &regex::Captures| {
                    // Keep the field name, when group 1 took part in the match
                    caps.get(1).map_or(REDACTED.to_string(), |name| {
                        format!("{}={}", name.as_str(), REDACTED)
                    })
                })
                .to_string();
        }

        sanitized
    }

    /// Sanitize every value of a field map in place
    pub fn sanitize_fields(&self, fields: &mut Fields) {
        for (key, value) in fields.iter_mut() {
            if self.should_redact_field(key) {
                *value = Value::String(REDACTED.to_string());
            } else {
                self.sanitize_value(value);
            }
        }
    }

    /// Sanitize a JSON value in place
    pub fn sanitize_value(&self, value: &mut Value) {
        match value {
            Value::Object(map) => {
                for (key, val) in map.iter_mut() {
                    if self.should_redact_field(key) {
                        *val = Value::String(REDACTED.to_string());
                    } else {
                        self.sanitize_value(val);
                    }
                }
            }
            Value::Array(arr) => {
                for item in arr.iter_mut() {
                    self.sanitize_value(item);
                }
            }
            Value::String(s) => {
                *s = self.sanitize_text(s);
            }
            _ => {}
        }
    }

    fn should_redact_field(&self, field_name: &str) -> bool {
        let field_lower = field_name.to_lowercase();
        self.redacted_fields
            .iter()
            .any(|redacted| field_lower.contains(redacted.as_str()))
    }
}
