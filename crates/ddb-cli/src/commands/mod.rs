pub mod build;
pub mod clean;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_USAGE: u8 = 2;

/// Prefix of every message describing rejected user input.
pub const INVALID_INPUT: &str = "invalid input:";

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn invalid(msg: impl std::fmt::Display) -> String {
    format!("{INVALID_INPUT} {msg}")
}

/// Progress note, printed on stderr so stdout carries only build output.
pub fn note(msg: &str) {
    eprintln!("{}", Style::new().cyan().apply_to(msg));
}

pub fn print_error(msg: &str) {
    eprintln!("{}", Style::new().red().apply_to(format!("error: {msg}")));
}

pub fn spinner(msg: &str) -> Result<ProgressBar, String> {
    let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
        .map_err(|e| format!("progress template: {e}"))?
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
    let pb = ProgressBar::new_spinner();
    pb.set_style(style);
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    Ok(pb)
}

pub fn spin_finish(pb: &ProgressBar, ok: bool, msg: &str) {
    let mark = if ok { "✓" } else { "✗" };
    if let Ok(style) = ProgressStyle::with_template("{msg}") {
        pb.set_style(style);
    }
    pb.finish_with_message(format!("{mark} {msg}"));
}
