//! Target-offsets configuration.
//!
//! The target-offsets document lists, per section, the output offsets whose
//! bit values a later physical bit flip is supposed to change. Three value
//! kinds exist:
//!
//! - `none`: a fragment that must be located but carries no placement
//!   constraint;
//! - `fixed`: a single-bit flip at an exact offset, with bit index and sign;
//! - `range`: a 4-byte relative jump whose operand is flipped; it names the
//!   output offsets of its two landing pads, which become `Destination`
//!   targets of their own.
//!
//! ```toml
//! [[sections]]
//! name = ".dbl_text"
//!
//! [[sections.values]]
//! type = "fixed"
//! offset = 0x120
//! bit = 3
//! sign = "+"
//!
//! [[sections.values]]
//! type = "range"
//! start_offset = 0x200
//! range = 4
//! normal_dest = 0x240
//! flipped_dest = 0x260
//! ```

use super::ConfigError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Flip direction of a bit: `+` is 0→1, `-` is 1→0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sign {
    #[serde(rename = "+")]
    Plus,
    #[serde(rename = "-")]
    Minus,
}

impl Sign {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "+" => Some(Self::Plus),
            "-" => Some(Self::Minus),
            _ => None,
        }
    }
}

impl std::fmt::Display for Sign {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Plus => "+",
            Self::Minus => "-",
        })
    }
}

/// The constraint a target places on layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// Locate the fragment, no constraint.
    Ignored,
    /// Landing pad of a range target.
    Destination,
    /// Single-bit flip at an exact page offset.
    Fixed { bit: u8, sign: Sign },
    /// 32-bit relative jump operand flip. The destination fields hold
    /// output offsets until the bundle former translates them to bundle
    /// indices.
    Range {
        dest_size: u32,
        normal_dest: u64,
        flip_dest: u64,
    },
}

/// A configured target position in the emitted section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetSpec {
    /// Offset of the target in the round-1 output.
    pub offset_in_output: u64,
    pub kind: TargetKind,
    /// Offset of the target within its owning fragment. Filled when the
    /// target is matched during the round-1 write.
    pub target_offset_in_fragment: u64,
}

impl TargetSpec {
    pub fn new(offset_in_output: u64, kind: TargetKind) -> Self {
        Self {
            offset_in_output,
            kind,
            target_offset_in_fragment: 0,
        }
    }

    /// Whether this spec constrains placement (fixed and range targets do,
    /// destinations and ignored fragments do not).
    pub fn is_target(&self) -> bool {
        matches!(self.kind, TargetKind::Fixed { .. } | TargetKind::Range { .. })
    }
}

/// Per-section target tables, each sorted ascending by output offset.
pub type TargetTables = IndexMap<String, Vec<TargetSpec>>;

#[derive(Debug, Deserialize)]
struct TargetDocument {
    sections: Vec<SectionEntry>,
}

#[derive(Debug, Deserialize)]
struct SectionEntry {
    name: String,
    values: Vec<ValueEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ValueEntry {
    None {
        offset: u64,
    },
    Fixed {
        offset: u64,
        bit: u8,
        sign: String,
    },
    Range {
        start_offset: u64,
        range: u32,
        normal_dest: u64,
        flipped_dest: u64,
    },
}

/// Load and normalize the target-offsets document.
///
/// Range entries expand into three specs (the range itself plus its two
/// destinations). Each section's list is sorted ascending by output offset,
/// which the bundle matcher relies on.
pub fn load_targets(path: &Path) -> Result<TargetTables, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_targets(&text)
}

/// Parse the target-offsets document from a string.
pub fn parse_targets(text: &str) -> Result<TargetTables, ConfigError> {
    let doc: TargetDocument = toml::from_str(text)?;

    let mut tables = TargetTables::new();
    for section in doc.sections {
        let specs = tables.entry(section.name).or_default();
        for value in section.values {
            match value {
                ValueEntry::None { offset } => {
                    specs.push(TargetSpec::new(offset, TargetKind::Ignored));
                }
                ValueEntry::Fixed { offset, bit, sign } => {
                    let sign = Sign::from_str(&sign)
                        .ok_or_else(|| ConfigError::BadSign(sign.clone()))?;
                    if bit > 7 {
                        return Err(ConfigError::BadBit { offset, bit });
                    }
                    specs.push(TargetSpec::new(offset, TargetKind::Fixed { bit, sign }));
                }
                ValueEntry::Range {
                    start_offset,
                    range,
                    normal_dest,
                    flipped_dest,
                } => {
                    // Only instructions with 32-bit relative operands are
                    // supported; shorter forms are widened by the fixup
                    // policy before they reach layout.
                    if range != 4 {
                        return Err(ConfigError::UnsupportedRange {
                            offset: start_offset,
                            range,
                        });
                    }
                    specs.push(TargetSpec::new(
                        start_offset,
                        TargetKind::Range {
                            dest_size: range,
                            normal_dest,
                            flip_dest: flipped_dest,
                        },
                    ));
                    specs.push(TargetSpec::new(normal_dest, TargetKind::Destination));
                    specs.push(TargetSpec::new(flipped_dest, TargetKind::Destination));
                }
            }
        }
    }

    for specs in tables.values_mut() {
        specs.sort_by_key(|s| s.offset_in_output);
    }

    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
[[sections]]
name = ".dbl_text"

[[sections.values]]
type = "range"
start_offset = 0x200
range = 4
normal_dest = 0x240
flipped_dest = 0x260

[[sections.values]]
type = "fixed"
offset = 0x120
bit = 3
sign = "+"

[[sections.values]]
type = "none"
offset = 0x80
"#;

    #[test]
    fn test_parse_and_sort() {
        let tables = parse_targets(DOC).unwrap();
        let specs = &tables[".dbl_text"];
        // range expands to 3 specs, plus fixed and none
        assert_eq!(specs.len(), 5);
        let offsets: Vec<u64> = specs.iter().map(|s| s.offset_in_output).collect();
        assert_eq!(offsets, vec![0x80, 0x120, 0x200, 0x240, 0x260]);
        assert_eq!(specs[0].kind, TargetKind::Ignored);
        assert_eq!(
            specs[1].kind,
            TargetKind::Fixed { bit: 3, sign: Sign::Plus }
        );
        assert!(matches!(
            specs[2].kind,
            TargetKind::Range { dest_size: 4, normal_dest: 0x240, flip_dest: 0x260 }
        ));
        assert_eq!(specs[3].kind, TargetKind::Destination);
        assert_eq!(specs[4].kind, TargetKind::Destination);
    }

    #[test]
    fn test_is_target() {
        assert!(TargetSpec::new(0, TargetKind::Fixed { bit: 0, sign: Sign::Minus }).is_target());
        assert!(!TargetSpec::new(0, TargetKind::Destination).is_target());
        assert!(!TargetSpec::new(0, TargetKind::Ignored).is_target());
    }

    #[test]
    fn test_unsupported_range_size() {
        let doc = r#"
[[sections]]
name = ".dbl_text"

[[sections.values]]
type = "range"
start_offset = 0x10
range = 2
normal_dest = 0x20
flipped_dest = 0x30
"#;
        assert!(matches!(
            parse_targets(doc),
            Err(ConfigError::UnsupportedRange { offset: 0x10, range: 2 })
        ));
    }

    #[test]
    fn test_bad_sign_rejected() {
        let doc = r#"
[[sections]]
name = ".dbl_text"

[[sections.values]]
type = "fixed"
offset = 0x10
bit = 1
sign = "up"
"#;
        assert!(matches!(parse_targets(doc), Err(ConfigError::BadSign(_))));
    }

    #[test]
    fn test_bad_bit_rejected() {
        let doc = r#"
[[sections]]
name = ".dbl_text"

[[sections.values]]
type = "fixed"
offset = 0x10
bit = 9
sign = "-"
"#;
        assert!(matches!(
            parse_targets(doc),
            Err(ConfigError::BadBit { offset: 0x10, bit: 9 })
        ));
    }

    #[test]
    fn test_multiple_sections_keep_order() {
        let doc = r#"
[[sections]]
name = ".dbl_text"
values = []

[[sections]]
name = ".other"

[[sections.values]]
type = "none"
offset = 0
"#;
        let tables = parse_targets(doc).unwrap();
        let names: Vec<&String> = tables.keys().collect();
        assert_eq!(names, vec![".dbl_text", ".other"]);
    }
}
