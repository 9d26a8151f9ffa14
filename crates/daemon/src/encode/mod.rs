//! Worker invocation for the transcode daemon

pub mod handbrake;

pub use handbrake::{
    build_worker_command, parse_preset_list, parse_progress_line, parse_worker_version,
    FALLBACK_PRESETS, PRESET_LIST_FLAG, VERSION_FLAG,
};
