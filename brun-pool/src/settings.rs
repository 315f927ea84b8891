//! Tunables shared by every pool.

use crate::error::{PoolError, Result};
use brun_common::EnvParser;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);
pub const DEFAULT_READ_CHUNK: usize = 8192;
pub const DEFAULT_SCHEDULER: &str = "prun";
/// Reservation length the scheduler hands out by default; not worth logging.
pub const DEFAULT_RESERVATION_SECS: u64 = 900;

#[derive(Debug, Clone, PartialEq)]
pub struct PoolSettings {
    /// Multiplexer poll timeout, also how often exited-but-unreaped jobs are
    /// rechecked.
    pub poll_interval: Duration,
    /// Bytes read from a job stream per read call.
    pub read_chunk: usize,
    /// Cluster scheduler binary.
    pub scheduler: String,
    pub default_reservation_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            read_chunk: DEFAULT_READ_CHUNK,
            scheduler: DEFAULT_SCHEDULER.to_string(),
            default_reservation_secs: DEFAULT_RESERVATION_SECS,
        }
    }
}

impl PoolSettings {
    /// Read `BRUN_POLL_INTERVAL_MS`, `BRUN_READ_CHUNK`, `BRUN_SCHEDULER` and
    /// `BRUN_DEFAULT_RESERVATION_SECS`.
    pub fn from_env() -> Result<Self> {
        Self::from_parser(&mut EnvParser::new())
    }

    pub fn from_parser(parser: &mut EnvParser) -> Result<Self> {
        let poll_interval = parser.get_duration_ms(
            "POLL_INTERVAL_MS",
            DEFAULT_POLL_INTERVAL,
            Duration::from_millis(1),
            Duration::from_secs(10),
        );
        let read_chunk = parser.get_u64_range("READ_CHUNK", DEFAULT_READ_CHUNK as u64, 64, 1 << 24);
        let scheduler = parser.get_string("SCHEDULER", DEFAULT_SCHEDULER);
        let reservation =
            parser.get_u64_range("DEFAULT_RESERVATION_SECS", DEFAULT_RESERVATION_SECS, 0, u64::MAX);

        if parser.has_errors() {
            return Err(PoolError::Settings(parser.take_errors()));
        }

        debug!(
            poll_interval_ms = poll_interval.value.as_millis() as u64,
            read_chunk = read_chunk.value,
            scheduler = %scheduler.value,
            scheduler_source = %scheduler.source,
            "Pool settings loaded"
        );

        Ok(Self {
            poll_interval: poll_interval.value,
            read_chunk: usize::try_from(read_chunk.value).unwrap_or(DEFAULT_READ_CHUNK),
            scheduler: scheduler.value,
            default_reservation_secs: reservation.value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn parser(vars: &[(&str, &str)]) -> EnvParser {
        EnvParser::from_map(
            vars.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
        )
    }

    #[test]
    fn test_defaults() {
        let settings = PoolSettings::from_parser(&mut parser(&[])).unwrap();
        assert_eq!(settings, PoolSettings::default());
    }

    #[test]
    fn test_overrides() {
        let settings = PoolSettings::from_parser(&mut parser(&[
            ("BRUN_POLL_INTERVAL_MS", "10"),
            ("BRUN_SCHEDULER", "/opt/das/bin/prun"),
            ("BRUN_DEFAULT_RESERVATION_SECS", "600"),
        ]))
        .unwrap();
        assert_eq!(settings.poll_interval, Duration::from_millis(10));
        assert_eq!(settings.scheduler, "/opt/das/bin/prun");
        assert_eq!(settings.default_reservation_secs, 600);
        assert_eq!(settings.read_chunk, DEFAULT_READ_CHUNK);
    }

    #[test]
    fn test_bad_values_are_reported() {
        let err = PoolSettings::from_parser(&mut parser(&[
            ("BRUN_READ_CHUNK", "1"),
            ("BRUN_POLL_INTERVAL_MS", "soon"),
        ]))
        .unwrap_err();
        match err {
            PoolError::Settings(errors) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
    }
}
