//! Backup - Command-line interface for the mirror backup engine.
//!
//! Runs one backup of a source directory into a destination mirror, showing
//! progress on stderr. When a file fails and auto-continue is off, the user
//! is asked whether to continue or stop. Ctrl+C or SIGTERM stops the run
//! after the current file and keeps its checkpoint for the next invocation.

use backup_engine::{
    ChecksumAlgorithm, Engine, EngineConfig, EngineHandle, ErrorKind, Event, FileError, Progress,
    Report, RunOptions, RunOutcome,
};
use clap::Parser;
use crossbeam_channel::{select, unbounded, Receiver};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Backup - keep a destination directory an exact mirror of a source
#[derive(Parser, Debug)]
#[command(name = "backup")]
#[command(version = "0.1.0")]
#[command(about = "Mirror a directory tree with resumable, verified copies")]
struct Args {
    /// Source directory
    #[arg(long, value_name = "PATH")]
    src: PathBuf,

    /// Destination directory (created if missing)
    #[arg(long, value_name = "PATH")]
    dst: PathBuf,

    /// Extra exclusion pattern; may be repeated
    #[arg(long, value_name = "GLOB")]
    exclude: Vec<String>,

    /// JSON configuration file; its "backup" section is used when present
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Skip verification of copied files
    #[arg(long)]
    no_verify: bool,

    /// Checksum algorithm for verification: crc32, md5, sha256, blake3, or none
    /// to compare sizes only
    #[arg(long, value_name = "ALGORITHM")]
    hash: Option<String>,

    /// Bytes per read/write
    #[arg(long, value_name = "BYTES")]
    chunk_size: Option<usize>,

    /// Record failed files and keep going instead of asking
    #[arg(long)]
    auto_continue: bool,

    /// Directory for checkpoints instead of the destination root
    #[arg(long, value_name = "PATH")]
    state_dir: Option<PathBuf>,

    /// Directory to write the JSON run report to
    #[arg(long, value_name = "PATH")]
    report_dir: Option<PathBuf>,

    /// Skip the free space check before copying
    #[arg(long)]
    no_space_check: bool,

    /// Print every file as it is processed
    #[arg(long)]
    verbose: bool,

    /// Log level when RUST_LOG is not set
    #[arg(long, value_name = "LEVEL", default_value = "warn")]
    log_level: String,
}

/// Renders engine events on stderr
struct CliProgress {
    verbose: bool,
    start_time: Instant,
    last_progress_update: Option<Instant>,
    last_path: Option<String>,
}

impl CliProgress {
    fn new(verbose: bool) -> Self {
        CliProgress {
            verbose,
            start_time: Instant::now(),
            last_progress_update: None,
            last_path: None,
        }
    }

    fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_idx = 0;

        while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
            size /= 1024.0;
            unit_idx += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_idx])
    }

    fn format_duration(elapsed: Duration) -> String {
        let secs = elapsed.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, mins, secs)
        } else if mins > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}s", secs)
        }
    }

    fn progress_bar(percent: u32) -> String {
        let percent = percent.min(100);
        let filled = (percent / 5) as usize;
        format!("[{}{}] {}%", "=".repeat(filled), " ".repeat(20 - filled), percent)
    }

    fn on_progress(&mut self, progress: &Progress) {
        if self.verbose && progress.current_path != self.last_path {
            if let Some(path) = &progress.current_path {
                self.clear_line();
                eprintln!("[{}/{}] {}", progress.files_done + 1, progress.total_files, path);
            }
            self.last_path = progress.current_path.clone();
        }

        // At most one redraw per 200ms
        if let Some(last) = self.last_progress_update {
            if last.elapsed() < Duration::from_millis(200) {
                return;
            }
        }
        self.last_progress_update = Some(Instant::now());

        let eta = match progress.eta_secs {
            Some(secs) => Self::format_duration(Duration::from_secs_f64(secs.max(0.0))),
            None => "-".to_string(),
        };
        eprint!(
            "\rProgress: {} | {}/{} | {}/s | ETA {}   ",
            Self::progress_bar(progress.percent() as u32),
            Self::format_bytes(progress.bytes_done),
            Self::format_bytes(progress.total_bytes),
            Self::format_bytes(progress.bytes_per_sec as u64),
            eta
        );
        let _ = io::stderr().flush();
    }

    fn on_throttled(&mut self, reason: &str) {
        self.clear_line();
        eprintln!("Throttling: {}", reason);
    }

    fn on_file_error(&mut self, error: &FileError) {
        self.clear_line();
        eprintln!("Error: {}", error);
    }

    fn clear_line(&mut self) {
        if self.last_progress_update.is_some() {
            eprintln!();
            self.last_progress_update = None;
        }
    }

    fn on_finished(&mut self, report: &Report) {
        self.clear_line();
        match &report.outcome {
            RunOutcome::Completed => eprintln!("Backup complete!"),
            RunOutcome::Stopped => eprintln!("Backup stopped; run again to resume."),
            RunOutcome::Aborted { reason } => eprintln!("Backup aborted: {}", reason),
        }

        let (warnings, failures): (Vec<&FileError>, Vec<&FileError>) = report
            .errors
            .iter()
            .partition(|error| error.kind == ErrorKind::Recovery);
        eprintln!(
            "Summary: {} copied, {} updated, {} deleted, {} failed",
            report.copied.len(),
            report.updated.len(),
            report.deleted.len(),
            failures.len()
        );
        if report.resumed {
            eprintln!("Resumed: {} files already done", report.skipped_resumed);
        }
        if report.throttle_events > 0 {
            eprintln!("Throttled: {} times", report.throttle_events);
        }
        eprintln!("Bytes copied: {}", Self::format_bytes(report.bytes_transferred));
        eprintln!("Elapsed: {}", Self::format_duration(self.start_time.elapsed()));

        if !failures.is_empty() {
            eprintln!();
            eprintln!("Failed files:");
            for error in &failures {
                eprintln!("  {}: {}", error.path, error.message);
            }
        }

        for warning in &warnings {
            eprintln!("Warning: {}: {}", warning.path, warning.message);
        }

        if !report.verification_flagged.is_empty() {
            eprintln!();
            eprintln!("Verification mismatches:");
            for path in &report.verification_flagged {
                eprintln!("  {}: source and destination checksums differ", path);
            }
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

/// Deliver SIGINT and SIGTERM as messages so the run can stop gracefully.
///
/// The receiver never yields when the listener cannot be started.
fn listen_for_signals() -> Receiver<&'static str> {
    let (signal_tx, signal_rx) = unbounded();
    let spawned = thread::Builder::new()
        .name("signal-listener".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    warn!(error = %e, "Could not start signal listener");
                    return;
                }
            };
            loop {
                let name = runtime.block_on(wait_for_signal());
                if signal_tx.send(name).is_err() {
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        warn!(error = %e, "Could not start signal listener thread");
    }
    signal_rx
}

async fn wait_for_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}

/// Parse and validate command-line arguments, then run the backup
fn main() {
    let args = Args::parse();
    init_logging(&args.log_level);

    // Exit code tracking
    let exit_code = match run_cli(&args) {
        Ok(()) => 0,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            2
        }
    };

    std::process::exit(exit_code);
}

/// Main CLI logic - separated for testability
fn run_cli(args: &Args) -> Result<(), String> {
    let config = build_config(args)?;
    let signals = listen_for_signals();
    let stdin = io::stdin();
    let mut input = stdin.lock();
    run_with_input(args, config, &mut input, &signals)
}

/// Build the engine configuration from the config file and flags.
fn build_config(args: &Args) -> Result<EngineConfig, String> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)
            .map_err(|e| format!("Invalid configuration {}: {}", path.display(), e))?,
        None => EngineConfig::default(),
    };

    if let Some(hash) = &args.hash {
        config.checksum_algorithm = if hash.eq_ignore_ascii_case("none") {
            None
        } else {
            Some(ChecksumAlgorithm::from_str(hash).map_err(|e| {
                format!("Invalid hash algorithm '{}': {}", hash, e)
            })?)
        };
    }
    config.exclude_patterns.extend(args.exclude.iter().cloned());
    if args.state_dir.is_some() {
        config.state_dir = args.state_dir.clone();
    }
    if args.report_dir.is_some() {
        config.report_dir = args.report_dir.clone();
    }
    if args.no_space_check {
        config.check_free_space = false;
    }
    Ok(config)
}

fn run_options(args: &Args) -> RunOptions {
    RunOptions {
        verify_after_copy: if args.no_verify { Some(false) } else { None },
        auto_continue_on_error: if args.auto_continue { Some(true) } else { None },
        chunk_size: args.chunk_size,
    }
}

fn run_with_input(
    args: &Args,
    config: EngineConfig,
    input: &mut dyn BufRead,
    signals: &Receiver<&'static str>,
) -> Result<(), String> {
    let engine = Engine::spawn(config).map_err(|e| format!("Engine start failed: {}", e))?;

    eprintln!("Preparing backup...");
    eprintln!("  Source: {}", args.src.display());
    eprintln!("  Destination: {}", args.dst.display());
    eprintln!();

    engine
        .start(&args.src, &args.dst, None, run_options(args))
        .map_err(|e| format!("Backup start failed: {}", e))?;

    let (report, interrupted) = drive(&engine, args.verbose, input, signals)?;
    engine
        .shutdown()
        .map_err(|e| format!("Engine shutdown failed: {}", e))?;

    // An unusable checkpoint is only a warning
    let failed = report
        .errors
        .iter()
        .filter(|error| error.kind != ErrorKind::Recovery)
        .count();
    match &report.outcome {
        RunOutcome::Completed if failed > 0 => {
            Err(format!("{} file(s) failed to back up", failed))
        }
        RunOutcome::Completed => Ok(()),
        RunOutcome::Stopped if interrupted => {
            Err("Backup interrupted; run again to resume".to_string())
        }
        RunOutcome::Stopped => Err("Backup stopped before completion".to_string()),
        RunOutcome::Aborted { reason } => Err(format!("Backup aborted: {}", reason)),
    }
}

/// What woke up the event loop.
enum Wake {
    Event(Event),
    Signal(&'static str),
    EngineGone,
    ListenerGone,
}

/// Show events until the run ends and return its report, and whether a
/// signal stopped it.
///
/// The first signal asks the engine to stop after the current file; a
/// second one gives up waiting.
fn drive(
    engine: &EngineHandle,
    verbose: bool,
    input: &mut dyn BufRead,
    signals: &Receiver<&'static str>,
) -> Result<(Report, bool), String> {
    let mut progress = CliProgress::new(verbose);
    let never = crossbeam_channel::never();
    let mut signals: &Receiver<&'static str> = signals;
    let mut interrupted = false;

    loop {
        let wake = match signals.try_recv() {
            Ok(name) => Wake::Signal(name),
            Err(_) => select! {
                recv(engine.events()) -> event => match event {
                    Ok(event) => Wake::Event(event),
                    Err(_) => Wake::EngineGone,
                },
                recv(signals) -> name => match name {
                    Ok(name) => Wake::Signal(name),
                    Err(_) => Wake::ListenerGone,
                },
            },
        };

        let event = match wake {
            Wake::Event(event) => event,
            Wake::Signal(name) if interrupted => {
                warn!(signal = name, "Second signal, not waiting for the engine");
                return Err("Backup interrupted".to_string());
            }
            Wake::Signal(name) => {
                info!(signal = name, "Stopping backup");
                progress.clear_line();
                eprintln!("Stopping after the current file...");
                interrupted = true;
                engine
                    .stop()
                    .map_err(|e| format!("Engine stopped responding: {}", e))?;
                continue;
            }
            Wake::ListenerGone => {
                signals = &never;
                continue;
            }
            Wake::EngineGone => return Err("Engine stopped without a report".to_string()),
        };

        match event {
            Event::Progress(p) => progress.on_progress(&p),
            Event::Throttled(reason) => progress.on_throttled(&reason),
            Event::FileError(error) => progress.on_file_error(&error),
            Event::AwaitingDecision { path } => {
                let result = if !interrupted && ask_continue(&path, input) {
                    engine.continue_run()
                } else {
                    engine.stop()
                };
                result.map_err(|e| format!("Engine stopped responding: {}", e))?;
            }
            Event::RunCompleted(report) | Event::RunStopped(report) => {
                progress.on_finished(&report);
                return Ok((report, interrupted));
            }
        }
    }
}

/// Ask whether to carry on after a failed file. End of input means stop.
fn ask_continue(path: &str, input: &mut dyn BufRead) -> bool {
    eprint!("'{}' failed. [c]ontinue or [s]top? ", path);
    let _ = io::stderr().flush();

    let mut line = String::new();
    match input.read_line(&mut line) {
        Ok(0) | Err(_) => false,
        Ok(_) => matches!(line.trim().to_lowercase().as_str(), "c" | "continue" | "y" | "yes"),
    }
}
