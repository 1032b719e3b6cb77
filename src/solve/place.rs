//! Placement strategies over the free list.
//!
//! Three variants, all first fit: unconstrained, paired at a fixed
//! distance (for a range target's two destinations), and victim
//! constrained (the block's target byte must land on a given page offset).

use super::free_list::{FreeList, RollBack};
use super::{Block, SolveError};
use std::collections::HashMap;

/// Place `block` at the head of the first span from `cursor` that fits.
///
/// The sentinel span guarantees a fit; an exhausted scan means the list
/// lost its sentinel.
pub fn assign_spot(
    free: &mut FreeList,
    cursor: &mut usize,
    block: &mut Block,
) -> Result<RollBack, SolveError> {
    while *cursor < free.len() && free.get(*cursor).1 < block.size {
        *cursor += 1;
    }
    if *cursor >= free.len() {
        return Err(SolveError::FreeListCorrupt(
            "sentinel span missing during unconstrained placement",
        ));
    }
    block.section_offset = free.get(*cursor).0;
    Ok(free.remove(*cursor, 0, block.size))
}

/// Place `normal` and `flip` so that `flip.offset = normal.offset + dist`.
///
/// `normal` goes first fit; if no span covers the flip slot at distance
/// `dist`, the attempt is rolled back and the search resumes one span
/// further. The whole span is skipped on failure; an offset inside it
/// might still work, but the sentinel guarantees termination either way.
pub fn assign_spot_at_dist(
    free: &mut FreeList,
    normal: &mut Block,
    flip: &mut Block,
    dist: u64,
) -> Result<(), SolveError> {
    let mut start = 0usize;
    loop {
        let mut cursor = start;
        let rb = assign_spot(free, &mut cursor, normal)?;

        let flip_offset = normal.section_offset + dist;

        // last span starting at or before the flip slot; the list is
        // ordered
        let mut t = rb.start;
        while t < free.len() && free.get(t).0 <= flip_offset {
            t += 1;
        }
        if t > rb.start {
            let t = t - 1;
            let (first, size) = free.get(t);
            if first + size >= flip_offset + flip.size {
                flip.section_offset = flip_offset;
                free.remove(t, flip_offset - first, flip.size);
                return Ok(());
            }
        }

        free.rollback(rb);
        start = rb.start + 1;
    }
}

/// Place `block` so its target offset is congruent to the victim's page
/// offset, without crossing span bounds or re-binding a page to a second
/// frame.
///
/// If no span qualifies, the tail span is split forward to the next page
/// boundary and used; the tail always succeeds because a fresh page has no
/// binding and offers the full page residue.
pub fn assign_spot_victim(
    free: &mut FreeList,
    block: &mut Block,
    page_size: u64,
    victim_addr: u64,
    page_to_frame: &mut HashMap<u64, u64>,
) -> Result<(), SolveError> {
    let target_offset = block
        .target
        .as_ref()
        .map(|t| t.target_offset)
        .ok_or(SolveError::FreeListCorrupt(
            "victim placement of a block without a target",
        ))? as i64;
    let victim_page_offset = (victim_addr % page_size) as i64;
    let frame = victim_addr / page_size;

    let mut s = 0usize;
    while s < free.len() {
        let (first, size) = free.get(s);
        let span_page_offset = (first % page_size) as i64;
        // the target must sit at or after the span start...
        let head_fits = target_offset + span_page_offset <= victim_page_offset;
        // ...and the bundle tail must stay inside the span
        let tail_fits = (block.size - target_offset as u64) + victim_page_offset as u64
            <= first % page_size + size;
        let page_ok = page_to_frame
            .get(&(first / page_size))
            .map_or(true, |&bound| bound == frame);
        if head_fits && tail_fits && page_ok {
            break;
        }
        s += 1;
    }

    // no usable gap between earlier placements: advance the tail span to
    // the next page boundary and place there
    if s == free.len() {
        s = free.len() - 1;
        let (first, _) = free.get(s);
        free.split_at(s, page_size - first % page_size);
        s += 1;
    }

    let (first, _) = free.get(s);
    let p = page_size as i64;
    let block_off =
        (((victim_page_offset - target_offset - first as i64) % p + p) % p) as u64;
    block.section_offset = first + block_off;

    let page_nr = first / page_size;
    if let Some(&bound) = page_to_frame.get(&page_nr) {
        return Err(SolveError::FrameConflict {
            page: page_nr,
            bound,
            requested: frame,
        });
    }
    page_to_frame.insert(page_nr, frame);
    free.remove(s, block_off, block.size);

    // keep the tail span clear of any frame binding
    let last = free.len() - 1;
    let (last_first, _) = free.get(last);
    if last_first / page_size == page_nr {
        free.split_at(last, page_size - last_first % page_size);
    }

    log::trace!(
        "victim placement: block {} at {:#x} (page {:#x} -> frame {:#x})",
        block.bundle_idx,
        block.section_offset,
        page_nr,
        frame
    );
    Ok(())
}
