//! Victim frame selection.
//!
//! A target block needs a physical frame containing a victim bit with the
//! right bit index and flip direction. Selection is best fit: among all
//! victims in unused frames whose page offset lies strictly behind the
//! block's target offset, pick the one needing the least head padding.

use super::SolveError;
use crate::config::targets::Sign;
use crate::config::victims::VictimInfos;
use std::collections::HashSet;

/// Pick a victim for a target at `target_offset` within its page.
///
/// `E = (victim page offset) - target_offset` must be positive; the block
/// is later shifted by `E` bytes so the target byte lands exactly on the
/// victim byte. The smallest `E` wins, ties go to the earliest `(frame,
/// index)` in scan order. The chosen frame is marked used; the loader
/// cannot place two victims in one frame.
pub fn find_victim(
    victims: &VictimInfos,
    used_frames: &mut HashSet<u64>,
    page_size: u64,
    target_offset: u64,
    bit: u8,
    sign: Sign,
) -> Result<(usize, usize), SolveError> {
    debug_assert!(target_offset < page_size);

    let mut best: Option<(i64, usize, usize)> = None;
    for (frame, index, victim) in victims.iter() {
        if victim.bit != bit || victim.sign != sign {
            continue;
        }
        if used_frames.contains(&(victim.virt_addr / page_size)) {
            continue;
        }
        let frame_offset = (victim.virt_addr % page_size) as i64;
        let e = frame_offset - target_offset as i64;
        if e > 0 && best.map_or(true, |(b, _, _)| e < b) {
            best = Some((e, frame, index));
        }
    }

    // running out of candidates usually means the victim addresses file
    // holds too few victims for this target set
    let (_, frame, index) = best.ok_or(SolveError::VictimExhausted {
        target_offset,
        bit,
        sign,
    })?;
    used_frames.insert(victims.get(frame, index).virt_addr / page_size);
    Ok((frame, index))
}
