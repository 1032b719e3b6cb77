//! Victim-addresses file.
//!
//! One record per line:
//!
//! ```text
//! <virt_hex> <bit_dec> <sign> <aggr_hex[,aggr_hex]*> <aggr_init_hex>
//! # this is a comment
//! ```
//!
//! A victim is a physical DRAM bit known to flip when its aggressor rows
//! are hammered. Victims are grouped by page frame; the solver consumes at
//! most one victim per frame.

use super::ConfigError;
use crate::config::targets::Sign;
use std::collections::BTreeMap;
use std::path::Path;

/// One flippable bit and the aggressor pattern that flips it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VictimInfo {
    /// Virtual address of the victim byte during templating.
    pub virt_addr: u64,
    /// Bit index within the byte.
    pub bit: u8,
    /// Flip direction.
    pub sign: Sign,
    /// Aggressor row addresses.
    pub aggressors: Vec<u64>,
    /// Initialization pattern for the aggressor rows.
    pub aggr_init: u64,
}

/// Victims grouped by page frame.
///
/// The outer index is the frame (frames in ascending address order), the
/// inner index the victims within that frame. Solver results reference
/// victims by `(frame, index)` pairs.
#[derive(Debug, Clone, Default)]
pub struct VictimInfos {
    frames: Vec<Vec<VictimInfo>>,
}

impl VictimInfos {
    /// Group victims by `virt_addr & page_mask`.
    pub fn from_victims(victims: Vec<VictimInfo>, page_mask: u64) -> Self {
        let mut grouped: BTreeMap<u64, Vec<VictimInfo>> = BTreeMap::new();
        for v in victims {
            grouped.entry(v.virt_addr & page_mask).or_default().push(v);
        }
        Self {
            frames: grouped.into_values().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn get(&self, frame: usize, index: usize) -> &VictimInfo {
        &self.frames[frame][index]
    }

    /// Iterate `(frame, index, victim)` in scan order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, &VictimInfo)> {
        self.frames
            .iter()
            .enumerate()
            .flat_map(|(f, vs)| vs.iter().enumerate().map(move |(i, v)| (f, i, v)))
    }
}

/// Load the victim-addresses file and group by frame.
pub fn load_victims(path: &Path, page_mask: u64) -> Result<VictimInfos, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_victims(&text, page_mask)
}

/// Parse victim records from a string.
pub fn parse_victims(text: &str, page_mask: u64) -> Result<VictimInfos, ConfigError> {
    let mut victims = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        victims.push(parse_line(line).map_err(|reason| ConfigError::VictimLine {
            line: idx + 1,
            reason,
        })?);
    }
    Ok(VictimInfos::from_victims(victims, page_mask))
}

fn parse_line(line: &str) -> Result<VictimInfo, String> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() != 5 {
        return Err(format!("expected 5 fields, got {}", parts.len()));
    }

    let virt_addr = parse_hex(parts[0])?;
    let bit: u8 = parts[1]
        .parse()
        .map_err(|_| format!("bad bit index '{}'", parts[1]))?;
    if bit > 7 {
        return Err(format!("bit index {} out of range", bit));
    }
    let sign = Sign::from_str(parts[2]).ok_or_else(|| format!("bad sign '{}'", parts[2]))?;
    let aggressors = parts[3]
        .split(',')
        .map(parse_hex)
        .collect::<Result<Vec<u64>, String>>()?;
    if aggressors.is_empty() {
        return Err("no aggressor rows".to_string());
    }
    let aggr_init = parse_hex(parts[4])?;

    Ok(VictimInfo {
        virt_addr,
        bit,
        sign,
        aggressors,
        aggr_init,
    })
}

fn parse_hex(s: &str) -> Result<u64, String> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(digits, 16).map_err(|_| format!("bad hex value '{}'", s))
}
