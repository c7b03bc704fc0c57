//! Error taxonomy for the whole crate, grounded on `original_source/gtid.hh`'s
//! `DEFINE_EXCEPTION` family (BinlogReadError, BinlogWriteError,
//! EncryptionError, DatabaseError, GtidNotFoundError).

use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum PinlokiError {
    #[error("binlog read error: {0}")]
    BinlogRead(String),

    #[error("binlog write error: {0}")]
    BinlogWrite(String),

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("database error ({code}): {message}")]
    Database { code: i32, message: String },

    #[error("gtid not found: {0}")]
    GtidNotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PinlokiError>;

impl PinlokiError {
    pub fn binlog_read(msg: impl Into<String>) -> Self {
        PinlokiError::BinlogRead(msg.into())
    }

    pub fn binlog_write(msg: impl Into<String>) -> Self {
        PinlokiError::BinlogWrite(msg.into())
    }

    pub fn encryption(msg: impl Into<String>) -> Self {
        PinlokiError::Encryption(msg.into())
    }

    pub fn database(code: i32, msg: impl Into<String>) -> Self {
        PinlokiError::Database { code, message: msg.into() }
    }

    pub fn gtid_not_found(msg: impl Into<String>) -> Self {
        PinlokiError::GtidNotFound(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        PinlokiError::Config(msg.into())
    }
}

/// Gate for "log this at most once per `period`", mirroring `writer.cc`'s
/// `maxbase::Timer` + `m_timer.alarm()` pattern used to rate-limit
/// reconnect-failure logging.
pub struct RateLimiter {
    period: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(period: Duration) -> Self {
        Self { period, last: Mutex::new(None) }
    }

    /// Returns true the first time it's called, and then at most once per
    /// `period` thereafter.
    pub fn alarm(&self) -> bool {
        let mut last = self.last.lock();
        let now = Instant::now();
        match *last {
            Some(t) if now.duration_since(t) < self.period => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn rate_limiter_fires_once_per_period() {
        let rl = RateLimiter::new(Duration::from_millis(50));
        assert!(rl.alarm());
        assert!(!rl.alarm());
        sleep(Duration::from_millis(60));
        assert!(rl.alarm());
    }

    #[test]
    fn error_display_contains_context() {
        let e = PinlokiError::gtid_not_found("1-1-1");
        assert!(e.to_string().contains("1-1-1"));
    }
}
