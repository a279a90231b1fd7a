//! `hearthd` — the hearth server binary.
//!
//! Parses the process control surface from the command line, initializes
//! the process-wide logger, and runs the server until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;

use hearth::logger::{Level, Logger};
use hearth::server::{Server, ServerConfig};

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_signal: libc::c_int) {
    STOP.store(true, Ordering::SeqCst);
}

#[derive(Parser, Debug)]
#[command(name = "hearthd", version, about = "Event-driven HTTP/1.1 server")]
struct Args {
    /// Listen port (1024-65535).
    #[arg(short, long, default_value_t = 1316)]
    port: u16,

    /// Trigger mode: bit 0 = connections edge-triggered, bit 1 = listener.
    #[arg(short = 'm', long, default_value_t = 3)]
    trig_mode: u8,

    /// Inactivity timeout in milliseconds (0 disables).
    #[arg(short, long, default_value_t = 60_000)]
    timeout: u64,

    /// Enable lingering close on the listener.
    #[arg(long)]
    linger: bool,

    /// Document root for static files.
    #[arg(long, default_value = "./resources")]
    root: PathBuf,

    /// SQLite database file for login and registration.
    #[arg(long, default_value = "hearth.db")]
    db: PathBuf,

    /// Database connection pool size.
    #[arg(long, default_value_t = 8)]
    db_pool: usize,

    /// Worker thread count.
    #[arg(long, default_value_t = 8)]
    workers: usize,

    /// Maximum concurrent connections.
    #[arg(long, default_value_t = 65_536)]
    max_connections: usize,

    /// Disable logging entirely.
    #[arg(long)]
    no_log: bool,

    /// Minimum log level (debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: Level,

    /// Log queue capacity (0 = synchronous writes).
    #[arg(long, default_value_t = 1024)]
    log_queue: usize,

    /// Directory receiving the dated log files.
    #[arg(long, default_value = "./log")]
    log_dir: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = ServerConfig::default()
        .port(args.port)
        .trig_mode(args.trig_mode)
        .timeout_ms(args.timeout)
        .linger(args.linger)
        .doc_root(args.root)
        .db_path(args.db)
        .db_pool_size(args.db_pool)
        .workers(args.workers)
        .max_connections(args.max_connections)
        .log_enabled(!args.no_log)
        .log_level(args.log_level)
        .log_queue_size(args.log_queue)
        .log_dir(args.log_dir);

    let handle = match Server::spawn(config) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("hearthd: failed to start: {e}");
            if let Some(logger) = Logger::global() {
                logger.close();
            }
            return ExitCode::FAILURE;
        }
    };

    // SAFETY: the handler only stores to a static atomic, which is
    // async-signal-safe.
    unsafe {
        libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
    }

    while !STOP.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    handle.join();
    if let Some(logger) = Logger::global() {
        logger.close();
    }
    ExitCode::SUCCESS
}
