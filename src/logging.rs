//! Logger initialization (terminal + file).

use std::fs::OpenOptions;
use std::path::Path;

use anyhow::Result;
use simplelog::{
    ColorChoice, CombinedLogger, Config, ConfigBuilder, LevelFilter, SharedLogger, TermLogger,
    TerminalMode, WriteLogger,
};

/// Log file name, kept in the install directory.
pub const LOG_FILE_NAME: &str = "ytdlp-desk.log";

fn file_config() -> Config {
    ConfigBuilder::new()
        .set_time_format_rfc3339()
        .set_target_level(LevelFilter::Error)
        .build()
}

/// Terminal logger at `term_level` on stderr (stdout carries command
/// output), plus a debug-level file logger when `log_file` can be opened.
fn build_loggers(term_level: LevelFilter, log_file: &Path) -> Vec<Box<dyn SharedLogger>> {
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        term_level,
        Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )];

    match OpenOptions::new().create(true).append(true).open(log_file) {
        Ok(file) => loggers.push(WriteLogger::new(LevelFilter::Debug, file_config(), file)),
        Err(e) => eprintln!(
            "warning: cannot open log file {}: {}; logging to the terminal only",
            log_file.display(),
            e
        ),
    }

    loggers
}

/// Initialize logging for the process.
pub fn init_logger(term_level: LevelFilter, log_file: &Path) -> Result<()> {
    CombinedLogger::init(build_loggers(term_level, log_file))
        .map_err(|e| anyhow::anyhow!("Failed to initialize logger: {}", e))?;
    Ok(())
}

/// Terminal level for the `-v` / `-q` flags.
pub fn level_for(verbose: u8, quiet: bool) -> LevelFilter {
    match (quiet, verbose) {
        (true, _) => LevelFilter::Warn,
        (false, 0) => LevelFilter::Info,
        (false, 1) => LevelFilter::Debug,
        (false, _) => LevelFilter::Trace,
    }
}
