//! Path and option sanitizing for untrusted transcode requests.
//!
//! The worker is spawned with an argument vector, never through a shell, so the
//! checks here target directory traversal, oversized values and arguments that
//! would confuse the worker binary rather than shell injection as such.

use crate::options::{is_allowed_option, EncoderOptions, OptionValue};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Longest accepted path, in characters.
pub const MAX_PATH_LEN: usize = 1000;

/// Longest accepted string option value, in characters.
pub const MAX_OPTION_STRING_LEN: usize = 1000;

/// Numeric option values must lie within `±MAX_OPTION_NUMBER`.
pub const MAX_OPTION_NUMBER: i64 = 1_000_000;

/// Characters never accepted inside a path component.
pub const FORBIDDEN_PATH_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*'];

/// Characters stripped from string option values.
pub const SHELL_METACHARS: &[char] = &[';', '&', '|', '`', '$', '(', ')', '<', '>', '"', '\''];

/// Container extensions accepted for existing files (case-insensitive).
pub const VIDEO_EXTENSIONS: &[&str] = &[
    ".mkv", ".mp4", ".m4v", ".mov", ".avi", ".wmv", ".flv", ".webm", ".mpg", ".mpeg", ".ts",
    ".m2ts", ".mts", ".vob", ".3gp",
];

#[derive(Debug, Error)]
pub enum SanitizeError {
    #[error("Path is empty")]
    Empty,

    #[error("Path is too long ({len} characters, maximum {max})")]
    TooLong { len: usize, max: usize },

    #[error("Path contains forbidden character '{0}'")]
    ForbiddenCharacter(char),

    #[error("Path traversal ('..') is not allowed")]
    Traversal,

    #[error("File extension '{0}' is not an allowed video format")]
    DisallowedExtension(String),

    #[error("Failed to resolve path: {0}")]
    Io(#[from] io::Error),
}

/// Checks if a file has a video extension (case-insensitive).
pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = format!(".{}", ext.to_lowercase());
            VIDEO_EXTENSIONS.contains(&ext_lower.as_str())
        })
        .unwrap_or(false)
}

/// Validate an untrusted path and return its canonical absolute form.
///
/// Rejects forbidden characters, `..` components and over-long paths. When the
/// path names an existing file its extension must be a known video container.
pub fn secure_path(raw: &str) -> Result<PathBuf, SanitizeError> {
    if raw.trim().is_empty() {
        return Err(SanitizeError::Empty);
    }

    let len = raw.chars().count();
    if len > MAX_PATH_LEN {
        return Err(SanitizeError::TooLong {
            len,
            max: MAX_PATH_LEN,
        });
    }

    let path = Path::new(raw);
    for component in path.components() {
        match component {
            Component::ParentDir => return Err(SanitizeError::Traversal),
            Component::Normal(part) => {
                let part = part.to_string_lossy();
                if let Some(c) = part.chars().find(|c| FORBIDDEN_PATH_CHARS.contains(c)) {
                    return Err(SanitizeError::ForbiddenCharacter(c));
                }
            }
            // Root, CurDir and (on Windows) drive prefixes are fine
            _ => {}
        }
    }

    let resolved = resolve(path)?;

    if resolved.is_file() && !is_video_file(&resolved) {
        let ext = resolved
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default();
        return Err(SanitizeError::DisallowedExtension(ext));
    }

    Ok(resolved)
}

/// Canonicalize `path`; for paths that do not exist yet, canonicalize the
/// parent directory when it exists and re-attach the file name.
fn resolve(path: &Path) -> io::Result<PathBuf> {
    if path.exists() {
        return fs::canonicalize(path);
    }

    let absolute = std::path::absolute(path)?;
    match (absolute.parent(), absolute.file_name()) {
        (Some(parent), Some(name)) if parent.exists() => Ok(fs::canonicalize(parent)?.join(name)),
        _ => Ok(absolute),
    }
}

/// Filter a raw option map down to what may reach the worker command line.
///
/// Unknown keys, over-long strings and out-of-range numbers are dropped with a
/// warning; shell metacharacters are stripped from string values. Never fails.
pub fn sanitize_options(raw: &EncoderOptions) -> EncoderOptions {
    let mut clean = EncoderOptions::new();

    for (key, value) in raw {
        if !is_allowed_option(key) {
            warn!(option = %key, "Dropping option not in the allow-list");
            continue;
        }

        let value = match value {
            OptionValue::Bool(b) => OptionValue::Bool(*b),
            OptionValue::Int(i) => {
                if i.unsigned_abs() > MAX_OPTION_NUMBER as u64 {
                    warn!(option = %key, value = i, "Dropping out-of-range numeric option");
                    continue;
                }
                OptionValue::Int(*i)
            }
            OptionValue::Float(f) => {
                if !f.is_finite() || f.abs() > MAX_OPTION_NUMBER as f64 {
                    warn!(option = %key, value = f, "Dropping out-of-range numeric option");
                    continue;
                }
                OptionValue::Float(*f)
            }
            OptionValue::String(s) => {
                let len = s.chars().count();
                if len > MAX_OPTION_STRING_LEN {
                    warn!(option = %key, len, "Dropping over-long string option");
                    continue;
                }
                let stripped: String = s.chars().filter(|c| !SHELL_METACHARS.contains(c)).collect();
                let stripped = stripped.trim();
                if stripped.is_empty() {
                    warn!(option = %key, "Dropping option that is empty after sanitizing");
                    continue;
                }
                OptionValue::String(stripped.to_string())
            }
        };

        clean.insert(key.clone(), value);
    }

    clean
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ALLOWED_OPTIONS;
    use proptest::prelude::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::TempDir;

    fn opts(pairs: &[(&str, OptionValue)]) -> EncoderOptions {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_secure_path_rejects_traversal() {
        assert!(matches!(
            secure_path("/media/../etc/passwd.mkv"),
            Err(SanitizeError::Traversal)
        ));
        assert!(matches!(
            secure_path("../movie.mkv"),
            Err(SanitizeError::Traversal)
        ));
    }

    #[test]
    fn test_secure_path_allows_dots_inside_names() {
        let dir = TempDir::new().unwrap();
        let raw = dir.path().join("film..2024.mkv");
        assert!(secure_path(raw.to_str().unwrap()).is_ok());
    }

    #[test]
    fn test_secure_path_rejects_forbidden_chars() {
        for c in FORBIDDEN_PATH_CHARS {
            let raw = format!("/media/bad{}name.mkv", c);
            match secure_path(&raw) {
                Err(SanitizeError::ForbiddenCharacter(found)) => assert_eq!(found, *c),
                other => panic!("expected ForbiddenCharacter for {:?}, got {:?}", raw, other),
            }
        }
    }

    #[test]
    fn test_secure_path_rejects_long_paths() {
        let raw = format!("/{}", "a".repeat(MAX_PATH_LEN));
        assert!(matches!(
            secure_path(&raw),
            Err(SanitizeError::TooLong { .. })
        ));
    }

    #[test]
    fn test_secure_path_rejects_empty() {
        assert!(matches!(secure_path("   "), Err(SanitizeError::Empty)));
    }

    #[test]
    fn test_secure_path_existing_file_extension_checked() {
        let dir = TempDir::new().unwrap();
        let text = dir.path().join("notes.txt");
        File::create(&text).unwrap().write_all(b"hello").unwrap();
        let video = dir.path().join("clip.MP4");
        File::create(&video).unwrap();

        assert!(matches!(
            secure_path(text.to_str().unwrap()),
            Err(SanitizeError::DisallowedExtension(ext)) if ext == "txt"
        ));
        let resolved = secure_path(video.to_str().unwrap()).unwrap();
        assert!(resolved.is_absolute());
        assert_eq!(resolved, fs::canonicalize(&video).unwrap());
    }

    #[test]
    fn test_secure_path_missing_file_extension_not_checked() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("report.txt");
        let resolved = secure_path(out.to_str().unwrap()).unwrap();
        assert_eq!(
            resolved,
            fs::canonicalize(dir.path()).unwrap().join("report.txt")
        );
    }

    #[test]
    fn test_secure_path_makes_relative_absolute() {
        let resolved = secure_path("some-new-dir/output.mkv").unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("some-new-dir/output.mkv"));
    }

    #[test]
    fn test_is_video_file() {
        assert!(is_video_file(Path::new("/media/movie.mkv")));
        assert!(is_video_file(Path::new("/media/movie.MKV")));
        assert!(is_video_file(Path::new("/media/movie.m2ts")));
        assert!(!is_video_file(Path::new("/media/movie.txt")));
        assert!(!is_video_file(Path::new("/media/movie")));
    }

    #[test]
    fn test_sanitize_drops_unknown_keys() {
        let raw = opts(&[
            ("quality", OptionValue::Int(20)),
            ("output", OptionValue::String("/etc/passwd".into())),
            ("exec", OptionValue::Bool(true)),
        ]);
        let clean = sanitize_options(&raw);
        assert_eq!(clean.len(), 1);
        assert_eq!(clean["quality"], OptionValue::Int(20));
    }

    #[test]
    fn test_sanitize_strips_metacharacters() {
        let raw = opts(&[("encoder", OptionValue::String("x264; rm -rf $(pwd)".into()))]);
        let clean = sanitize_options(&raw);
        assert_eq!(clean["encoder"], OptionValue::String("x264 rm -rf pwd".into()));
    }

    #[test]
    fn test_sanitize_numeric_bounds() {
        let raw = opts(&[
            ("quality", OptionValue::Int(1_000_000)),
            ("vb", OptionValue::Int(1_000_001)),
            ("width", OptionValue::Int(-2_000_000)),
            ("rate", OptionValue::Float(f64::NAN)),
            ("height", OptionValue::Float(-999_999.5)),
        ]);
        let clean = sanitize_options(&raw);
        assert_eq!(clean.len(), 2);
        assert!(clean.contains_key("quality"));
        assert!(clean.contains_key("height"));
    }

    #[test]
    fn test_sanitize_drops_long_strings() {
        let raw = opts(&[
            ("title", OptionValue::String("1".repeat(MAX_OPTION_STRING_LEN + 1))),
            ("chapters", OptionValue::String("1".repeat(MAX_OPTION_STRING_LEN))),
        ]);
        let clean = sanitize_options(&raw);
        assert!(!clean.contains_key("title"));
        assert!(clean.contains_key("chapters"));
    }

    #[test]
    fn test_sanitize_keeps_booleans() {
        let raw = opts(&[
            ("optimize", OptionValue::Bool(true)),
            ("markers", OptionValue::Bool(false)),
        ]);
        let clean = sanitize_options(&raw);
        assert_eq!(clean.len(), 2);
    }

    fn option_value_strategy() -> impl Strategy<Value = OptionValue> {
        prop_oneof![
            any::<bool>().prop_map(OptionValue::Bool),
            any::<i64>().prop_map(OptionValue::Int),
            any::<f64>().prop_map(OptionValue::Float),
            ".{0,40}".prop_map(OptionValue::String),
        ]
    }

    fn key_strategy() -> impl Strategy<Value = String> {
        prop_oneof![
            (0..ALLOWED_OPTIONS.len()).prop_map(|i| ALLOWED_OPTIONS[i].to_string()),
            "[a-zA-Z-]{1,16}",
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_sanitized_options_are_safe(
            raw in prop::collection::btree_map(key_strategy(), option_value_strategy(), 0..12)
        ) {
            let clean = sanitize_options(&raw);

            for (key, value) in &clean {
                prop_assert!(is_allowed_option(key), "key {} escaped the allow-list", key);
                match value {
                    OptionValue::String(s) => {
                        prop_assert!(
                            !s.chars().any(|c| SHELL_METACHARS.contains(&c)),
                            "metacharacter survived in {:?}", s
                        );
                        prop_assert!(s.chars().count() <= MAX_OPTION_STRING_LEN);
                    }
                    OptionValue::Int(i) => prop_assert!(i.unsigned_abs() <= MAX_OPTION_NUMBER as u64),
                    OptionValue::Float(f) => prop_assert!(f.is_finite() && f.abs() <= MAX_OPTION_NUMBER as f64),
                    OptionValue::Bool(_) => {}
                }
            }
        }

        #[test]
        fn prop_parent_segment_always_rejected(
            prefix in "[a-z]{1,8}",
            suffix in "[a-z]{1,8}",
        ) {
            let raw = format!("/{}/../{}.mkv", prefix, suffix);
            prop_assert!(matches!(secure_path(&raw), Err(SanitizeError::Traversal)));
        }
    }
}
