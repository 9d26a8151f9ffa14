//! HandBrakeCLI invocation and output parsing
//!
//! Builds the worker command line for a job and interprets the text the worker
//! prints: JSON progress lines, the preset listing and the version banner.

use crate::options::{EncoderOptions, OptionValue};
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;
use tokio::process::Command;

/// Presets reported when the worker's listing cannot be parsed.
pub const FALLBACK_PRESETS: &[&str] = &["Fast 1080p30", "HQ 1080p30 Surround", "Web Optimized"];

/// Flag asking the worker to list its built-in presets
pub const PRESET_LIST_FLAG: &str = "--preset-list";

/// Flag asking the worker to print its version banner
pub const VERSION_FLAG: &str = "--version";

/// Build the worker command for one job
///
/// The argument vector is, in order:
/// - `--input <input>` and `--output <output>`
/// - `--preset-import-gui --preset <preset>`
/// - `--json` so progress is reported as JSON objects on stdout
/// - one `--<key> <value>` per option; `true` emits a bare `--<key>` and
///   `false` omits the option entirely
///
/// stdout and stderr are piped and stdin is closed. The child is killed if its
/// `Child` handle is dropped.
///
/// # Arguments
/// * `binary` - Resolved worker executable
/// * `options` - Options that already went through the sanitizer
pub fn build_worker_command(
    binary: &Path,
    input: &Path,
    output: &Path,
    preset: &str,
    options: &EncoderOptions,
) -> Command {
    let mut cmd = Command::new(binary);

    cmd.arg("--input").arg(input);
    cmd.arg("--output").arg(output);
    cmd.arg("--preset-import-gui");
    cmd.arg("--preset").arg(preset);
    cmd.arg("--json");

    for (key, value) in options {
        match value {
            OptionValue::Bool(true) => {
                cmd.arg(format!("--{}", key));
            }
            OptionValue::Bool(false) => {}
            other => {
                if let Some(arg) = other.as_arg() {
                    cmd.arg(format!("--{}", key)).arg(arg);
                }
            }
        }
    }

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    cmd
}

/// Extract the `Progress` value from one line of worker stdout
///
/// Returns `None` for anything that is not a JSON object with a numeric
/// `Progress` field; such lines are log noise.
pub fn parse_progress_line(line: &str) -> Option<f32> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }

    let value: Value = serde_json::from_str(trimmed).ok()?;
    let progress = value.as_object()?.get("Progress")?.as_f64()?;

    if progress.is_finite() {
        Some(progress as f32)
    } else {
        None
    }
}

/// Heuristically extract preset names from the preset listing
///
/// Accepts lines at the shallowest indentation, bullet lines (`-`, `*`, `+`)
/// and numbered lines (`1.` / `1)`). Category headers ending in `/` are
/// skipped. The result is deduplicated and sorted; an empty result means the caller should fall back
/// to [`FALLBACK_PRESETS`].
pub fn parse_preset_list(text: &str) -> Vec<String> {
    // Preset names sit at the shallowest indent; descriptions are nested deeper.
    let name_indent = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(indent_of)
        .filter(|&n| n > 0)
        .min();

    let mut presets = BTreeSet::new();

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let name = if let Some(rest) = strip_bullet(trimmed) {
            rest
        } else if let Some(rest) = strip_number(trimmed) {
            rest
        } else if Some(indent_of(line)) == name_indent {
            trimmed
        } else {
            continue;
        };

        let name = name.trim();
        if name.is_empty() || name.ends_with('/') {
            continue;
        }

        presets.insert(name.to_string());
    }

    presets.into_iter().collect()
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start_matches([' ', '\t']).len()
}

fn strip_bullet(line: &str) -> Option<&str> {
    ["- ", "* ", "+ "]
        .iter()
        .find_map(|prefix| line.strip_prefix(prefix))
}

fn strip_number(line: &str) -> Option<&str> {
    let digits = line.len() - line.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 {
        return None;
    }
    let rest = &line[digits..];
    rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") "))
}

fn version_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\S+)\s+v?(\d+\.\d+\.\d+)").expect("valid version regex"))
}

/// Parse `Name major.minor.patch` out of the first line of `--version` output
///
/// Returns `"<Name> <version>"`, e.g. `HandBrake 1.8.2`.
pub fn parse_worker_version(output: &str) -> Option<String> {
    let first = output.lines().find(|l| !l.trim().is_empty())?.trim();
    let caps = version_regex().captures(first)?;
    Some(format!("{} {}", &caps[1], &caps[2]))
}
