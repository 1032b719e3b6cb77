//! Object writer: the byte sink both rounds emit into.
//!
//! Round 1 writes the section once so every fragment's output offset is
//! known; while doing so it matches the configured target offsets to the
//! fragments that contain them. Round 2 resets the writer and emits the
//! rewritten section over the old bytes.

use crate::asm::fragment::Fragment;
use crate::config::targets::{TargetKind, TargetSpec};
use std::collections::VecDeque;

/// An in-memory object sink with the `tell`/`reset` contract the two-round
/// driver needs.
#[derive(Debug, Default)]
pub struct ObjectWriter {
    buf: Vec<u8>,
}

impl ObjectWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current write position.
    pub fn tell(&self) -> u64 {
        self.buf.len() as u64
    }

    /// Discard everything written so far.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn push_repeat(&mut self, value: u8, count: u64) {
        self.buf.resize(self.buf.len() + count as usize, value);
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

/// Try to match the front-most pending target against a fragment being
/// written at `frag_offset`.
///
/// Fixed and range targets match when their output offset falls inside the
/// fragment; the offset within the fragment is recorded for the solver.
/// Destinations must coincide with a fragment start (they become jump
/// landing pads). Ignored entries match by containment like fixed ones.
/// The pending list is sorted ascending, so only the front can match.
pub fn match_pending_target(
    pending: &mut VecDeque<TargetSpec>,
    frag: &mut Fragment,
    frag_offset: u64,
    frag_size: u64,
) -> bool {
    debug_assert!(frag.is_encoded());
    let Some(&front) = pending.front() else {
        return false;
    };

    let contains = front.offset_in_output >= frag_offset
        && front.offset_in_output < frag_offset + frag_size;

    let matched = match front.kind {
        TargetKind::Fixed { .. } | TargetKind::Range { .. } => {
            if contains {
                let mut spec = front;
                spec.target_offset_in_fragment = front.offset_in_output - frag_offset;
                log::debug!(
                    "matched flip target {:#x} at fragment offset {:#x}",
                    front.offset_in_output,
                    spec.target_offset_in_fragment
                );
                frag.spec = Some(spec);
                true
            } else {
                false
            }
        }
        TargetKind::Destination => {
            if frag_offset == front.offset_in_output {
                log::debug!("matched destination at {:#x}", front.offset_in_output);
                frag.spec = Some(front);
                true
            } else {
                false
            }
        }
        TargetKind::Ignored => {
            if contains {
                log::debug!("matched ignored fragment at {:#x}", front.offset_in_output);
                frag.spec = Some(front);
                true
            } else {
                false
            }
        }
    };

    if matched {
        pending.pop_front();
    }
    matched
}
