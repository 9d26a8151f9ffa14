//! Encoder option values and the table of option names forwarded to the worker.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Option names that may be forwarded to the worker as `--<name>`.
///
/// Everything else in a request's option map is dropped by the sanitizer.
pub const ALLOWED_OPTIONS: &[&str] = &[
    "quality",
    "vb",
    "encoder",
    "encoder-preset",
    "encoder-tune",
    "encoder-profile",
    "encoder-level",
    "two-pass",
    "turbo",
    "rate",
    "vfr",
    "cfr",
    "pfr",
    "width",
    "height",
    "maxWidth",
    "maxHeight",
    "crop",
    "auto-anamorphic",
    "keep-display-aspect",
    "deinterlace",
    "decomb",
    "detelecine",
    "denoise",
    "nlmeans",
    "deblock",
    "grayscale",
    "format",
    "optimize",
    "markers",
    "audio",
    "aencoder",
    "ab",
    "mixdown",
    "arate",
    "drc",
    "all-audio",
    "first-audio",
    "subtitle",
    "all-subtitles",
    "subtitle-burned",
    "native-language",
    "start-at",
    "stop-at",
    "title",
    "chapters",
];

/// Whether `key` is in [`ALLOWED_OPTIONS`].
pub fn is_allowed_option(key: &str) -> bool {
    ALLOWED_OPTIONS.contains(&key)
}

/// A single encoder option value.
///
/// Deserializes from a plain JSON/TOML scalar; variant order matters so that
/// `1` is an `Int` and `1.5` a `Float`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl OptionValue {
    /// Command-line rendering of the value, `None` for booleans (flag-only).
    pub fn as_arg(&self) -> Option<String> {
        match self {
            OptionValue::Bool(_) => None,
            OptionValue::Int(v) => Some(v.to_string()),
            OptionValue::Float(v) => Some(v.to_string()),
            OptionValue::String(v) => Some(v.clone()),
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Bool(v) => write!(f, "{}", v),
            OptionValue::Int(v) => write!(f, "{}", v),
            OptionValue::Float(v) => write!(f, "{}", v),
            OptionValue::String(v) => write!(f, "{}", v),
        }
    }
}

/// Ordered option map; ordering keeps the built command line deterministic.
pub type EncoderOptions = BTreeMap<String, OptionValue>;
