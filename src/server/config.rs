//! Server configuration.

use std::path::PathBuf;

use crate::error::{Result, ServerError};
use crate::logger::Level;

/// The full process control surface, filled by the CLI or by tests.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen port; must lie in `[1024, 65535]`.
    pub port: u16,
    /// Trigger mode: bit 0 = connections edge-triggered, bit 1 = listener
    /// edge-triggered. Values above 3 select both.
    pub trig_mode: u8,
    /// Inactivity timeout per connection in milliseconds; 0 disables the
    /// timers.
    pub timeout_ms: u64,
    /// Enable `SO_LINGER{on=1, linger=1}` on the listener.
    pub linger: bool,
    /// Document root for static files.
    pub doc_root: PathBuf,
    /// SQLite database file backing login and registration.
    pub db_path: PathBuf,
    /// Number of pooled database handles.
    pub db_pool_size: usize,
    /// Number of worker threads.
    pub workers: usize,
    /// Connection cap; accepts beyond it are rejected with a busy notice.
    pub max_connections: usize,
    /// Whether to initialize the process-wide logger at startup.
    pub log_enabled: bool,
    /// Minimum log level.
    pub log_level: Level,
    /// Log queue capacity; 0 selects synchronous logging.
    pub log_queue_size: usize,
    /// Directory receiving the dated log files.
    pub log_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 1316,
            trig_mode: 3,
            timeout_ms: 60_000,
            linger: false,
            doc_root: PathBuf::from("./resources"),
            db_path: PathBuf::from("hearth.db"),
            db_pool_size: 8,
            workers: 8,
            max_connections: 65_536,
            log_enabled: true,
            log_level: Level::Info,
            log_queue_size: 1024,
            log_dir: PathBuf::from("./log"),
        }
    }
}

impl ServerConfig {
    /// Set the listen port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the trigger mode (0-3).
    #[must_use]
    pub fn trig_mode(mut self, mode: u8) -> Self {
        self.trig_mode = mode;
        self
    }

    /// Set the inactivity timeout in milliseconds (0 disables).
    #[must_use]
    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = ms;
        self
    }

    /// Enable or disable lingering close on the listener.
    #[must_use]
    pub fn linger(mut self, linger: bool) -> Self {
        self.linger = linger;
        self
    }

    /// Set the document root.
    #[must_use]
    pub fn doc_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.doc_root = root.into();
        self
    }

    /// Set the database file path.
    #[must_use]
    pub fn db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = path.into();
        self
    }

    /// Set the database pool size.
    #[must_use]
    pub fn db_pool_size(mut self, size: usize) -> Self {
        self.db_pool_size = size;
        self
    }

    /// Set the worker thread count.
    #[must_use]
    pub fn workers(mut self, count: usize) -> Self {
        self.workers = count;
        self
    }

    /// Set the connection cap.
    #[must_use]
    pub fn max_connections(mut self, cap: usize) -> Self {
        self.max_connections = cap;
        self
    }

    /// Enable or disable the process-wide logger.
    #[must_use]
    pub fn log_enabled(mut self, enabled: bool) -> Self {
        self.log_enabled = enabled;
        self
    }

    /// Set the minimum log level.
    #[must_use]
    pub fn log_level(mut self, level: Level) -> Self {
        self.log_level = level;
        self
    }

    /// Set the log queue capacity (0 = synchronous writes).
    #[must_use]
    pub fn log_queue_size(mut self, size: usize) -> Self {
        self.log_queue_size = size;
        self
    }

    /// Set the log directory.
    #[must_use]
    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    /// Rejects configurations the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.port < 1024 {
            return Err(ServerError::Config(format!(
                "port {} outside [1024, 65535]",
                self.port
            )));
        }
        if self.workers == 0 {
            return Err(ServerError::Config("worker count must be positive".into()));
        }
        if self.db_pool_size == 0 {
            return Err(ServerError::Config(
                "database pool size must be positive".into(),
            ));
        }
        if self.max_connections == 0 {
            return Err(ServerError::Config(
                "connection cap must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.port, 1316);
        assert_eq!(config.trig_mode, 3);
        assert_eq!(config.timeout_ms, 60_000);
    }

    #[test]
    fn builder_chains() {
        let config = ServerConfig::default()
            .port(8080)
            .trig_mode(1)
            .timeout_ms(0)
            .workers(2)
            .max_connections(10);
        assert_eq!(config.port, 8080);
        assert_eq!(config.trig_mode, 1);
        assert_eq!(config.timeout_ms, 0);
        assert_eq!(config.workers, 2);
        assert_eq!(config.max_connections, 10);
    }

    #[test]
    fn privileged_ports_are_rejected() {
        assert!(ServerConfig::default().port(80).validate().is_err());
        assert!(ServerConfig::default().port(1023).validate().is_err());
        assert!(ServerConfig::default().port(1024).validate().is_ok());
    }

    #[test]
    fn zero_sized_pools_are_rejected() {
        assert!(ServerConfig::default().workers(0).validate().is_err());
        assert!(ServerConfig::default().db_pool_size(0).validate().is_err());
    }
}
