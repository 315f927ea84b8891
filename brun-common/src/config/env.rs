//! Environment variable parsing with type safety.
//!
//! Parsing never fails outright: bad values fall back to the default and an
//! [`EnvError`] is recorded, so all problems can be reported at once.

use super::source::Sourced;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during environment variable parsing.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EnvError {
    /// Invalid value for a variable.
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    /// Value out of valid range.
    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },

    /// Invalid log level.
    #[error("Invalid log level for {var}: {value}")]
    InvalidLogLevel { var: String, value: String },
}

type Lookup = Box<dyn Fn(&str) -> Option<String> + Send>;

/// Type-safe environment variable parser for `BRUN_*` variables.
pub struct EnvParser {
    prefix: &'static str,
    lookup: Lookup,
    errors: Vec<EnvError>,
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvParser {
    /// Parser reading the process environment.
    pub fn new() -> Self {
        Self::with_lookup(|name| std::env::var(name).ok())
    }

    /// Parser reading from an arbitrary lookup function.
    pub fn with_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + 'static,
    {
        Self {
            prefix: "BRUN_",
            lookup: Box::new(lookup),
            errors: Vec::new(),
        }
    }

    /// Parser reading from a fixed map of (unprefixed-or-prefixed) names.
    pub fn from_map(vars: HashMap<String, String>) -> Self {
        Self::with_lookup(move |name| vars.get(name).cloned())
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    /// Record a problem found by a caller-side check.
    pub fn record(&mut self, error: EnvError) {
        self.errors.push(error);
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn raw(&self, name: &str) -> (String, Option<String>) {
        let var_name = self.var_name(name);
        let value = (self.lookup)(&var_name);
        (var_name, value)
    }

    /// Get a string value with default.
    pub fn get_string(&mut self, name: &str, default: &str) -> Sourced<String> {
        match self.raw(name) {
            (var, Some(value)) => Sourced::from_env(value, var),
            (_, None) => Sourced::default_value(default.to_string()),
        }
    }

    /// Get an optional string; empty values count as unset.
    pub fn get_optional_string(&mut self, name: &str) -> Sourced<Option<String>> {
        match self.raw(name) {
            (var, Some(value)) if !value.trim().is_empty() => Sourced::from_env(Some(value), var),
            _ => Sourced::default_value(None),
        }
    }

    /// Get a u64 value with default and range validation.
    pub fn get_u64_range(&mut self, name: &str, default: u64, min: u64, max: u64) -> Sourced<u64> {
        let (var, Some(value)) = self.raw(name) else {
            return Sourced::default_value(default);
        };
        match value.trim().parse::<u64>() {
            Ok(n) if (min..=max).contains(&n) => Sourced::from_env(n, var),
            Ok(n) => {
                self.errors.push(EnvError::OutOfRange {
                    var,
                    value: n.to_string(),
                    min: min.to_string(),
                    max: max.to_string(),
                });
                Sourced::default_value(default)
            }
            Err(_) => {
                self.errors.push(EnvError::InvalidValue {
                    var,
                    expected: "unsigned integer".to_string(),
                    value,
                });
                Sourced::default_value(default)
            }
        }
    }

    /// Get a duration given in milliseconds.
    pub fn get_duration_ms(
        &mut self,
        name: &str,
        default: Duration,
        min: Duration,
        max: Duration,
    ) -> Sourced<Duration> {
        let to_ms = |d: Duration| u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
        self.get_u64_range(name, to_ms(default), to_ms(min), to_ms(max))
            .map(Duration::from_millis)
    }

    /// Get a log level, validated against the tracing level names.
    pub fn get_log_level(&mut self, name: &str, default: &str) -> Sourced<String> {
        let (var, Some(value)) = self.raw(name) else {
            return Sourced::default_value(default.to_string());
        };
        let level = value.trim().to_lowercase();
        if crate::logging::is_valid_level(&level) {
            Sourced::from_env(level, var)
        } else {
            self.errors.push(EnvError::InvalidLogLevel { var, value });
            Sourced::default_value(default.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigSource;

    fn parser(vars: &[(&str, &str)]) -> EnvParser {
        EnvParser::from_map(
            vars.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_get_u64_range_out_of_range_uses_default() {
        let mut p = parser(&[("BRUN_BIG", "200")]);
        let result = p.get_u64_range("BIG", 10, 0, 100);
        assert_eq!(result.value, 10);
        assert_eq!(result.source, ConfigSource::Default);
        assert!(p.has_errors());
    }

    #[test]
    fn test_get_u64_range() {
        let mut p = parser(&[("BRUN_READ_CHUNK", "4096"), ("BRUN_BIG", "200")]);
        let chunk = p.get_u64_range("READ_CHUNK", 8192, 1, 1 << 20);
        assert_eq!(chunk.value, 4096);
        assert_eq!(chunk.env_var.as_deref(), Some("BRUN_READ_CHUNK"));

        let big = p.get_u64_range("BIG", 10, 0, 100);
        assert_eq!(big.value, 10);
        assert!(matches!(p.errors()[0], EnvError::OutOfRange { .. }));
    }

    #[test]
    fn test_get_u64_not_a_number() {
        let mut p = parser(&[("BRUN_READ_CHUNK", "lots")]);
        assert_eq!(p.get_u64_range("READ_CHUNK", 8192, 1, 1 << 20).value, 8192);
        assert_eq!(p.take_errors().len(), 1);
        assert!(!p.has_errors());
    }

    #[test]
    fn test_get_duration_ms() {
        let mut p = parser(&[("BRUN_POLL_INTERVAL_MS", "20")]);
        let d = p.get_duration_ms(
            "POLL_INTERVAL_MS",
            Duration::from_millis(50),
            Duration::from_millis(1),
            Duration::from_secs(10),
        );
        assert_eq!(d.value, Duration::from_millis(20));
    }

    #[test]
    fn test_get_optional_string_empty_is_unset() {
        let mut p = parser(&[("BRUN_SCHEDULER", "  ")]);
        assert!(p.get_optional_string("SCHEDULER").value.is_none());
    }

    #[test]
    fn test_get_log_level() {
        let mut p = parser(&[("BRUN_LOG_LEVEL", "DEBUG")]);
        assert_eq!(p.get_log_level("LOG_LEVEL", "info").value, "debug");

        let mut p = parser(&[("BRUN_LOG_LEVEL", "chatty")]);
        assert_eq!(p.get_log_level("LOG_LEVEL", "info").value, "info");
        assert!(matches!(p.errors()[0], EnvError::InvalidLogLevel { .. }));
    }
}
