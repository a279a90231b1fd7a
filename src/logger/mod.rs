//! Process-wide leveled logger with an optional async writer thread.
//!
//! Foreground threads format a line (timestamp, level tag, message) into a
//! [`Buffer`] under the logger mutex, then either hand it to a dedicated
//! writer thread through a [`BlockQueue`] (async mode) or write it to the
//! log file directly (sync mode, or when the queue is full). Log files are
//! named `YYYY_MM_DD<suffix>` and rotate when the wall date advances or the
//! line count crosses [`LogConfig::max_lines`], with a `-k` suffix for the
//! k-th rollover within a day.
//!
//! Call sites use the [`log_debug!`](crate::log_debug),
//! [`log_info!`](crate::log_info), [`log_warn!`](crate::log_warn), and
//! [`log_error!`](crate::log_error) macros, which compile to a no-op when
//! the global logger has not been initialized.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate};

use crate::buffer::Buffer;
use crate::sync::BlockQueue;

static GLOBAL: OnceLock<Logger> = OnceLock::new();

/// Log severity, ordered from most to least verbose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    /// Detailed diagnostics.
    Debug = 0,
    /// General progress.
    Info = 1,
    /// Something degraded but the server continues.
    Warn = 2,
    /// An operation failed.
    Error = 3,
}

impl Level {
    /// The fixed-width tag prefixed to every line (9 bytes).
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Debug => "[debug]: ",
            Self::Info => "[info] : ",
            Self::Warn => "[warn] : ",
            Self::Error => "[error]: ",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Debug,
            1 => Self::Info,
            2 => Self::Warn,
            _ => Self::Error,
        }
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Logger configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum level that gets written.
    pub level: Level,
    /// Directory receiving the dated log files.
    pub dir: PathBuf,
    /// File name suffix, typically `.log`.
    pub suffix: String,
    /// Queue capacity for the writer thread; 0 selects sync mode.
    pub queue_size: usize,
    /// Lines per file before an in-day rollover.
    pub max_lines: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::Info,
            dir: PathBuf::from("./log"),
            suffix: ".log".to_string(),
            queue_size: 1024,
            max_lines: 50_000,
        }
    }
}

impl LogConfig {
    /// Set the minimum level.
    #[must_use]
    pub fn level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Set the log directory.
    #[must_use]
    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    /// Set the queue capacity (0 = synchronous writes).
    #[must_use]
    pub fn queue_size(mut self, size: usize) -> Self {
        self.queue_size = size;
        self
    }

    /// Set the in-day rollover threshold.
    #[must_use]
    pub fn max_lines(mut self, lines: usize) -> Self {
        self.max_lines = lines.max(1);
        self
    }
}

struct Sink {
    file: Option<File>,
    dir: PathBuf,
    suffix: String,
    today: NaiveDate,
    line_count: usize,
    buf: Buffer,
}

impl Sink {
    fn file_name(dir: &Path, date: NaiveDate, rollover: usize, suffix: &str) -> PathBuf {
        let stem = date.format("%Y_%m_%d");
        if rollover == 0 {
            dir.join(format!("{stem}{suffix}"))
        } else {
            dir.join(format!("{stem}-{rollover}{suffix}"))
        }
    }

    fn reopen(&mut self, now: DateTime<Local>, max_lines: usize) {
        let date = now.date_naive();
        let name = if date == self.today {
            Self::file_name(&self.dir, date, self.line_count / max_lines, &self.suffix)
        } else {
            self.today = date;
            self.line_count = 0;
            Self::file_name(&self.dir, date, 0, &self.suffix)
        };
        if let Some(f) = self.file.take() {
            drop(f);
        }
        let _ = fs::create_dir_all(&self.dir);
        self.file = OpenOptions::new().create(true).append(true).open(name).ok();
    }

    fn write_line(&mut self, line: &str) {
        if let Some(f) = &mut self.file {
            let _ = f.write_all(line.as_bytes());
        }
    }

    fn flush(&mut self) {
        if let Some(f) = &mut self.file {
            let _ = f.flush();
        }
    }
}

/// The logger. Usually accessed through [`Logger::global`] and the `log_*!`
/// macros; constructed directly in tests.
pub struct Logger {
    level: AtomicU8,
    sink: Arc<Mutex<Sink>>,
    queue: Option<Arc<BlockQueue<String>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    max_lines: usize,
}

impl Logger {
    /// Creates a logger and opens today's log file.
    pub fn new(config: LogConfig) -> io::Result<Self> {
        fs::create_dir_all(&config.dir)?;

        let now = Local::now();
        let mut sink = Sink {
            file: None,
            dir: config.dir,
            suffix: config.suffix,
            today: now.date_naive(),
            line_count: 0,
            buf: Buffer::new(),
        };
        let name = Sink::file_name(&sink.dir, sink.today, 0, &sink.suffix);
        sink.file = Some(OpenOptions::new().create(true).append(true).open(name)?);

        let sink = Arc::new(Mutex::new(sink));
        let mut logger = Self {
            level: AtomicU8::new(config.level as u8),
            sink: Arc::clone(&sink),
            queue: None,
            writer: Mutex::new(None),
            max_lines: config.max_lines.max(1),
        };

        if config.queue_size > 0 {
            let queue = Arc::new(BlockQueue::<String>::new(config.queue_size));
            let writer_queue = Arc::clone(&queue);
            let handle = thread::Builder::new()
                .name("hearth-log".to_string())
                .spawn(move || {
                    while let Some(line) = writer_queue.pop() {
                        let mut sink = sink.lock().expect("logger sink poisoned");
                        sink.write_line(&line);
                    }
                    sink.lock().expect("logger sink poisoned").flush();
                })
                .expect("failed to spawn log writer thread");
            logger.queue = Some(queue);
            *logger.writer.lock().expect("logger writer poisoned") = Some(handle);
        }

        Ok(logger)
    }

    /// Installs `config` as the process-wide logger.
    ///
    /// The first call wins; later calls are no-ops.
    pub fn init(config: LogConfig) -> io::Result<()> {
        if GLOBAL.get().is_some() {
            return Ok(());
        }
        let logger = Self::new(config)?;
        // A racing second init loses and its logger is shut down.
        if let Err(logger) = GLOBAL.set(logger) {
            logger.close();
        }
        Ok(())
    }

    /// The process-wide logger, if one has been installed.
    pub fn global() -> Option<&'static Logger> {
        GLOBAL.get()
    }

    /// Current minimum level.
    #[must_use]
    pub fn level(&self) -> Level {
        Level::from_u8(self.level.load(Ordering::Relaxed))
    }

    /// Changes the minimum level.
    pub fn set_level(&self, level: Level) {
        self.level.store(level as u8, Ordering::Relaxed);
    }

    /// Returns true if `level` passes the filter.
    #[must_use]
    pub fn enabled(&self, level: Level) -> bool {
        level >= self.level()
    }

    /// Formats and emits one line at `level`.
    pub fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        if !self.enabled(level) {
            return;
        }
        let now = Local::now();
        let line = {
            let mut sink = self.sink.lock().expect("logger sink poisoned");
            if sink.today != now.date_naive()
                || (sink.line_count > 0 && sink.line_count % self.max_lines == 0)
            {
                sink.reopen(now, self.max_lines);
            }
            sink.line_count += 1;

            sink.buf
                .append_str(&now.format("%Y-%m-%d %H:%M:%S%.6f ").to_string());
            sink.buf.append_str(level.tag());
            sink.buf.append_str(&args.to_string());
            sink.buf.append_str("\n");
            sink.buf.retrieve_all_to_string()
        };

        match &self.queue {
            Some(queue) if !queue.is_full() && !queue.is_closed() => {
                queue.push_back(line);
            }
            _ => {
                self.sink
                    .lock()
                    .expect("logger sink poisoned")
                    .write_line(&line);
            }
        }
    }

    /// Pokes the writer thread and flushes the file.
    pub fn flush(&self) {
        if let Some(queue) = &self.queue {
            queue.flush();
        }
        self.sink.lock().expect("logger sink poisoned").flush();
    }

    /// Drains the queue, stops the writer thread, and flushes the file.
    pub fn close(&self) {
        if let Some(queue) = &self.queue {
            while !queue.is_empty() && !queue.is_closed() {
                queue.flush();
                thread::sleep(Duration::from_millis(1));
            }
            queue.close();
        }
        if let Some(handle) = self.writer.lock().expect("logger writer poisoned").take() {
            let _ = handle.join();
        }
        self.sink.lock().expect("logger sink poisoned").flush();
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("level", &self.level())
            .field("async", &self.queue.is_some())
            .finish_non_exhaustive()
    }
}

/// Logs at debug level through the global logger.
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        if let Some(logger) = $crate::logger::Logger::global() {
            logger.log($crate::logger::Level::Debug, format_args!($($arg)*));
        }
    };
}

/// Logs at info level through the global logger.
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if let Some(logger) = $crate::logger::Logger::global() {
            logger.log($crate::logger::Level::Info, format_args!($($arg)*));
        }
    };
}

/// Logs at warn level through the global logger.
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if let Some(logger) = $crate::logger::Logger::global() {
            logger.log($crate::logger::Level::Warn, format_args!($($arg)*));
        }
    };
}

/// Logs at error level through the global logger.
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        if let Some(logger) = $crate::logger::Logger::global() {
            logger.log($crate::logger::Level::Error, format_args!($($arg)*));
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_dir_lines(dir: &Path) -> Vec<String> {
        let mut lines = Vec::new();
        for entry in fs::read_dir(dir).unwrap() {
            let content = fs::read_to_string(entry.unwrap().path()).unwrap();
            lines.extend(content.lines().map(ToString::to_string));
        }
        lines
    }

    #[test]
    fn level_ordering_and_tags() {
        assert!(Level::Debug < Level::Info);
        assert!(Level::Warn < Level::Error);
        for level in [Level::Debug, Level::Info, Level::Warn, Level::Error] {
            assert_eq!(level.tag().len(), 9);
        }
    }

    #[test]
    fn level_parses_from_str() {
        assert_eq!("debug".parse::<Level>().unwrap(), Level::Debug);
        assert_eq!("WARN".parse::<Level>().unwrap(), Level::Warn);
        assert!("loud".parse::<Level>().is_err());
    }

    #[test]
    fn sync_logger_writes_formatted_lines() {
        let dir = tempfile::tempdir().unwrap();
        let logger = Logger::new(
            LogConfig::default()
                .dir(dir.path())
                .queue_size(0)
                .level(Level::Debug),
        )
        .unwrap();

        logger.log(Level::Info, format_args!("hello {}", 42));
        logger.log(Level::Error, format_args!("boom"));
        logger.close();

        let lines = read_dir_lines(dir.path());
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("[info] : hello 42"));
        assert!(lines[1].contains("[error]: boom"));
        // Timestamp prefix: "YYYY-MM-DD HH:MM:SS.uuuuuu ".
        assert_eq!(lines[0].as_bytes()[4], b'-');
        assert_eq!(lines[0].as_bytes()[10], b' ');
        assert_eq!(lines[0].as_bytes()[19], b'.');
    }

    #[test]
    fn async_logger_drains_queue_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let logger = Logger::new(
            LogConfig::default()
                .dir(dir.path())
                .queue_size(64)
                .level(Level::Debug),
        )
        .unwrap();

        for i in 0..100 {
            logger.log(Level::Info, format_args!("line {i}"));
        }
        logger.close();

        let lines = read_dir_lines(dir.path());
        assert_eq!(lines.len(), 100);
    }

    #[test]
    fn level_filter_suppresses_lower_levels() {
        let dir = tempfile::tempdir().unwrap();
        let logger = Logger::new(
            LogConfig::default()
                .dir(dir.path())
                .queue_size(0)
                .level(Level::Warn),
        )
        .unwrap();

        logger.log(Level::Debug, format_args!("hidden"));
        logger.log(Level::Info, format_args!("hidden"));
        logger.log(Level::Warn, format_args!("visible"));
        logger.close();

        let lines = read_dir_lines(dir.path());
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("[warn] : visible"));
    }

    #[test]
    fn rollover_after_max_lines_opens_suffixed_file() {
        let dir = tempfile::tempdir().unwrap();
        let logger = Logger::new(
            LogConfig::default()
                .dir(dir.path())
                .queue_size(0)
                .max_lines(10)
                .level(Level::Debug),
        )
        .unwrap();

        for i in 0..25 {
            logger.log(Level::Info, format_args!("line {i}"));
        }
        logger.close();

        let mut names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names.len(), 3, "expected base file plus two rollovers");
        assert!(names.iter().any(|n| n.contains("-1")));
        assert!(names.iter().any(|n| n.contains("-2")));
        assert_eq!(read_dir_lines(dir.path()).len(), 25);
    }

    #[test]
    fn set_level_takes_effect() {
        let dir = tempfile::tempdir().unwrap();
        let logger = Logger::new(LogConfig::default().dir(dir.path()).queue_size(0)).unwrap();
        assert!(!logger.enabled(Level::Debug));
        logger.set_level(Level::Debug);
        assert!(logger.enabled(Level::Debug));
        logger.close();
    }
}
