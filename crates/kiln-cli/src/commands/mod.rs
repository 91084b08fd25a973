pub mod build;
pub mod coverage;
pub mod doctor;
pub mod prune;
pub mod state;

use indicatif::{ProgressBar, ProgressStyle};
use kiln_core::{CoreError, Kiln, StoreLock};
use kiln_engine::HttpEngine;
use kiln_schema::{load_config, KilnConfig};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;

/// A failed command: the message printed on stderr and the exit code.
#[derive(Debug)]
pub struct CliError {
    pub code: u8,
    pub message: String,
}

impl CliError {
    pub fn new(code: u8, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<CoreError> for CliError {
    fn from(e: CoreError) -> Self {
        let code = match e.root() {
            CoreError::Store(_) => EXIT_STORE_ERROR,
            root if root.is_usage_error() => EXIT_CONFIG_ERROR,
            _ => EXIT_FAILURE,
        };
        Self::new(code, e.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(EXIT_FAILURE, format!("JSON serialization failed: {e}"))
    }
}

pub type CmdResult = Result<u8, CliError>;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, CliError> {
    Ok(serde_json::to_string_pretty(value)?)
}

pub fn read_config(path: &Path) -> Result<KilnConfig, CliError> {
    load_config(path).map_err(|e| CliError::from(CoreError::from(e)))
}

/// Hold the advisory lock guarding the configured state file.
pub fn lock_state(config: &KilnConfig) -> Result<StoreLock, CliError> {
    StoreLock::acquire(&StoreLock::path_for(&config.paths.state_file))
        .map_err(|e| CliError::new(EXIT_STORE_ERROR, format!("store lock: {e}")))
}

/// Connect to the configured daemon and open the state store.
pub fn open_kiln(config: KilnConfig, verbose: bool) -> Result<Kiln, CliError> {
    let engine = HttpEngine::connect(&config.engine).map_err(CoreError::from)?;
    Ok(Kiln::new(config, Arc::new(engine))?.verbose(verbose))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
    pb.set_style(style);
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn finish(pb: &ProgressBar, msg: String) {
    if let Ok(style) = ProgressStyle::with_template("{msg}") {
        pb.set_style(style);
    }
    pb.finish_with_message(msg);
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    finish(pb, format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    finish(pb, format!("✗ {msg}"));
}

/// Run `f` under a spinner unless output is JSON or streamed verbosely.
pub fn with_spinner<T>(
    quiet: bool,
    running: &str,
    done: &str,
    failed: &str,
    f: impl FnOnce() -> Result<T, CoreError>,
) -> Result<T, CliError> {
    let pb = (!quiet).then(|| spinner(running));
    let result = f();
    if let Some(pb) = &pb {
        match &result {
            Ok(_) => spin_ok(pb, done),
            Err(_) => spin_fail(pb, failed),
        }
    }
    Ok(result?)
}

pub fn colorize_status(status: &str) -> String {
    use console::Style;
    match status {
        "pass" | "removed" => Style::new().green().apply_to(status).to_string(),
        "fail" | "failed" => Style::new().red().bold().apply_to(status).to_string(),
        "warn" => Style::new().yellow().apply_to(status).to_string(),
        "info" => Style::new().dim().apply_to(status).to_string(),
        other => other.to_owned(),
    }
}
