//! Operational options for the layout core.
//!
//! These mirror the command-line surface of the host compiler: a mode
//! switch plus the config/output paths and a compilation id used to tag
//! the emitted mapping files. Options are read once at startup and stay
//! immutable for the whole compile.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default page size (4 KiB pages).
pub const DEFAULT_PAGE_SIZE: u64 = 4096;

/// Operating mode of the layout core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DblMode {
    /// The core is inert; the assembler behaves like a stock assembler.
    #[default]
    Baseline,
    /// Round 1 only: relaxation is forced wide, no re-layout happens.
    /// Used to harvest target offsets from an unmodified emission.
    Offsets,
    /// Full two-round flow: solve, rewrite the section, emit mapping files.
    Dbl,
}

impl DblMode {
    /// Parse a mode name as it appears on the command line.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "baseline" => Some(Self::Baseline),
            "offsets" => Some(Self::Offsets),
            "dbl" => Some(Self::Dbl),
            _ => None,
        }
    }
}

impl std::fmt::Display for DblMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Baseline => "baseline",
            Self::Offsets => "offsets",
            Self::Dbl => "dbl",
        };
        f.write_str(s)
    }
}

/// Process-wide options consumed by the layout core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DblOptions {
    /// Operating mode.
    pub mode: DblMode,
    /// Path to the target-offsets TOML document.
    pub target_offsets_path: Option<PathBuf>,
    /// Path to the victim-addresses text file.
    pub victim_addresses_path: Option<PathBuf>,
    /// Directory the mapping files are written into.
    pub compiler_output_path: Option<PathBuf>,
    /// Id used to tag the emitted files.
    pub compilation_id: String,
    /// Name of the section the core operates on.
    pub dbl_section: String,
    /// Page size in bytes. Must be a power of two.
    pub page_size: u64,
}

impl Default for DblOptions {
    fn default() -> Self {
        Self {
            mode: DblMode::Baseline,
            target_offsets_path: None,
            victim_addresses_path: None,
            compiler_output_path: None,
            compilation_id: String::new(),
            dbl_section: ".dbl_text".to_string(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl DblOptions {
    /// Options for a full DBL run.
    pub fn dbl(
        target_offsets: impl Into<PathBuf>,
        victim_addresses: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            mode: DblMode::Dbl,
            target_offsets_path: Some(target_offsets.into()),
            victim_addresses_path: Some(victim_addresses.into()),
            compiler_output_path: Some(output_dir.into()),
            compilation_id: id.into(),
            ..Self::default()
        }
    }

    /// Bitmask selecting the offset within a page.
    #[inline]
    pub fn page_offset_mask(&self) -> u64 {
        self.page_size - 1
    }

    /// Bitmask selecting the page frame of an address.
    #[inline]
    pub fn page_addr_mask(&self) -> u64 {
        !self.page_offset_mask()
    }

    /// Validate the option set for the selected mode.
    pub fn validate(&self) -> Result<(), OptionsError> {
        if !self.page_size.is_power_of_two() {
            return Err(OptionsError::BadPageSize(self.page_size));
        }
        if self.mode == DblMode::Dbl {
            if self.target_offsets_path.is_none() {
                return Err(OptionsError::MissingPath("target offsets"));
            }
            if self.victim_addresses_path.is_none() {
                return Err(OptionsError::MissingPath("victim addresses"));
            }
            if self.compiler_output_path.is_none() {
                return Err(OptionsError::MissingPath("compiler output"));
            }
            if self.compilation_id.is_empty() {
                return Err(OptionsError::MissingId);
            }
        }
        Ok(())
    }
}

/// Option validation errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OptionsError {
    #[error("page size must be a power of two, got {0}")]
    BadPageSize(u64),

    #[error("the {0} path was not provided")]
    MissingPath(&'static str),

    #[error("a compilation id is required in dbl mode")]
    MissingId,
}
