//! Configuration: operational options, target-offsets document, and the
//! victim-addresses file.

pub mod options;
pub mod targets;
pub mod victims;

pub use options::{DblMode, DblOptions, OptionsError, DEFAULT_PAGE_SIZE};
pub use targets::{load_targets, parse_targets, Sign, TargetKind, TargetSpec, TargetTables};
pub use victims::{load_victims, parse_victims, VictimInfo, VictimInfos};

use std::path::PathBuf;

/// Configuration errors. All of these abort the compile.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse target offsets: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("range target at offset {offset:#x} has unsupported size {range} (only 4-byte relative operands are supported)")]
    UnsupportedRange { offset: u64, range: u32 },

    #[error("bad sign '{0}' (expected '+' or '-')")]
    BadSign(String),

    #[error("target at offset {offset:#x} has bit index {bit} out of range")]
    BadBit { offset: u64, bit: u8 },

    #[error("victim addresses line {line}: {reason}")]
    VictimLine { line: usize, reason: String },
}
