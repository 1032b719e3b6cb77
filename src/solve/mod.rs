//! The layout puzzle solver.
//!
//! Given the bundles of the DBL code section and the victim pool, decide a
//! section offset for every bundle such that each target bit lands on
//! exactly one victim bit. The solver is heuristic: victims are chosen
//! best fit (least head padding), address space first fit. It only decides
//! offsets; the assembler's rewrite applies them.
//!
//! Constraints honored:
//! - blocks never overlap;
//! - a victim frame is consumed at most once;
//! - a section page is bound to at most one frame;
//! - a range target's two destinations sit exactly `dist` bytes apart,
//!   `dist = 2^ceil(log2(max bundle size))`, so the flipped operand bit
//!   selects between them.

pub mod free_list;
pub mod place;
pub mod victim;

pub use free_list::{FreeList, RollBack};

use crate::asm::bundle::{bundle_size, Bundle};
use crate::asm::section::Section;
use crate::config::targets::{Sign, TargetKind};
use crate::config::victims::VictimInfos;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Solver errors. All fatal; the compile aborts.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SolveError {
    #[error("no unused victim frame matches target at page offset {target_offset:#x} (bit {bit}, sign {sign}); are there enough victims in the victim addresses file?")]
    VictimExhausted {
        target_offset: u64,
        bit: u8,
        sign: Sign,
    },

    #[error("destination distance overflows a 32-bit operand (max bundle size {max_bundle_size:#x})")]
    DistOverflow { max_bundle_size: u64 },

    #[error("two placements landed on section offset {offset:#x}")]
    DuplicateOffset { offset: u64 },

    #[error("page {page:#x} is bound to frame {bound:#x}, refusing rebind to {requested:#x}")]
    FrameConflict {
        page: u64,
        bound: u64,
        requested: u64,
    },

    #[error("free list corrupted: {0}")]
    FreeListCorrupt(&'static str),
}

/// Offset of the target byte within its block.
#[derive(Debug, Clone, Copy)]
pub struct TargetInBlock {
    pub target_offset: u64,
}

/// The solver's view of a bundle.
#[derive(Debug, Clone)]
pub struct Block {
    pub bundle_idx: usize,
    pub size: u64,
    /// Filled by placement; unique across blocks.
    pub section_offset: u64,
    /// Present iff the bundle carries a fixed or range target.
    pub target: Option<TargetInBlock>,
}

/// Victim chosen for a placed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VictimAssignment {
    /// Outer index into the victim pool.
    pub frame: usize,
    /// Inner index within the frame.
    pub index: usize,
    /// Section offset of the target byte (the victim spot), not the
    /// bundle start.
    pub page_offset: u64,
}

/// One solved bundle placement.
#[derive(Debug, Clone)]
pub struct Placement {
    pub bundle_idx: usize,
    pub victim: Option<VictimAssignment>,
}

/// Placements keyed by bundle section offset, iterated ascending.
pub type ResultMap = BTreeMap<u64, Placement>;

/// The fixed distance between a range target's two destinations, plus the
/// operand bit that distance corresponds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestDistance {
    pub dist: u64,
    /// Byte of the 32-bit operand the flip lives in.
    pub byte_offset: u64,
    /// Bit within that byte.
    pub bit: u8,
    pub sign: Sign,
}

impl DestDistance {
    /// Derive the distance from the largest bundle: the smallest power of
    /// two covering every bundle, so one flipped operand bit switches
    /// between the two destinations.
    pub fn from_max_bundle_size(max_bundle_size: u64) -> Result<Self, SolveError> {
        let dist = max_bundle_size.max(1).next_power_of_two();
        let exp = dist.trailing_zeros();
        if exp >= 32 {
            return Err(SolveError::DistOverflow { max_bundle_size });
        }
        Ok(Self {
            dist,
            byte_offset: (exp / 8) as u64,
            bit: (exp % 8) as u8,
            sign: Sign::Plus,
        })
    }
}

/// Per-pass solver state.
///
/// Created fresh for each section layout pass; the used-frames set and the
/// page binding map never outlive it.
pub struct Solver<'a> {
    victims: &'a VictimInfos,
    page_size: u64,
    used_frames: HashSet<u64>,
    page_to_frame: HashMap<u64, u64>,
    free: FreeList,
}

impl<'a> Solver<'a> {
    pub fn new(victims: &'a VictimInfos, page_size: u64) -> Self {
        Self {
            victims,
            page_size,
            used_frames: HashSet::new(),
            page_to_frame: HashMap::new(),
            free: FreeList::new(),
        }
    }

    /// Decide a placement for every bundle.
    ///
    /// Destination pairs go first (their mutual distance is the tightest
    /// constraint), then fixed/range targets victim-constrained, then
    /// everything else first fit.
    pub fn solve(
        &mut self,
        section: &Section,
        bundles: &[Bundle],
    ) -> Result<ResultMap, SolveError> {
        let mut max_size = 0u64;
        let mut targets: Vec<Block> = Vec::new();
        let mut dest_pairs: Vec<(Block, Block)> = Vec::new();

        for (idx, bundle) in bundles.iter().enumerate() {
            max_size = max_size.max(bundle_size(section, bundle));
            if matches!(bundle.spec.kind, TargetKind::Destination) {
                continue;
            }
            targets.push(make_block(section, bundles, idx));
            if let Some((normal, flip)) = bundle.dests {
                dest_pairs.push((
                    make_block(section, bundles, normal),
                    make_block(section, bundles, flip),
                ));
            }
        }

        let dd = DestDistance::from_max_bundle_size(max_size)?;
        log::debug!(
            "solving {} bundles: {} destination pairs, dist {:#x} (operand byte {}, bit {})",
            bundles.len(),
            dest_pairs.len(),
            dd.dist,
            dd.byte_offset,
            dd.bit
        );

        let mut results = ResultMap::new();

        // 1. destination pairs, dist apart, gaps stay in the free list
        for (mut normal, mut flip) in dest_pairs {
            place::assign_spot_at_dist(&mut self.free, &mut normal, &mut flip, dd.dist)?;
            insert_placement(
                &mut results,
                normal.section_offset,
                Placement {
                    bundle_idx: normal.bundle_idx,
                    victim: None,
                },
            )?;
            insert_placement(
                &mut results,
                flip.section_offset,
                Placement {
                    bundle_idx: flip.bundle_idx,
                    victim: None,
                },
            )?;
        }

        // 2. fixed flip blocks, range blocks, and unconstrained leftovers
        for mut block in targets {
            let placement = match block.target {
                Some(tvi) => {
                    let (bit, sign, shift) = match bundles[block.bundle_idx].spec.kind {
                        TargetKind::Fixed { bit, sign } => (bit, sign, 0),
                        // the flipped bit lives in the jump operand; which
                        // byte depends on the chosen distance
                        TargetKind::Range { .. } => (dd.bit, dd.sign, dd.byte_offset),
                        _ => unreachable!("only fixed/range blocks carry targets"),
                    };
                    let target_offset = tvi.target_offset + shift;
                    block.target = Some(TargetInBlock { target_offset });

                    let (frame, index) = victim::find_victim(
                        self.victims,
                        &mut self.used_frames,
                        self.page_size,
                        target_offset,
                        bit,
                        sign,
                    )?;
                    let victim_addr = self.victims.get(frame, index).virt_addr;
                    place::assign_spot_victim(
                        &mut self.free,
                        &mut block,
                        self.page_size,
                        victim_addr,
                        &mut self.page_to_frame,
                    )?;
                    Placement {
                        bundle_idx: block.bundle_idx,
                        victim: Some(VictimAssignment {
                            frame,
                            index,
                            page_offset: target_offset + block.section_offset,
                        }),
                    }
                }
                None => {
                    let mut cursor = 0usize;
                    place::assign_spot(&mut self.free, &mut cursor, &mut block)?;
                    Placement {
                        bundle_idx: block.bundle_idx,
                        victim: None,
                    }
                }
            };
            insert_placement(&mut results, block.section_offset, placement)?;
        }

        Ok(results)
    }
}

fn make_block(section: &Section, bundles: &[Bundle], idx: usize) -> Block {
    let bundle = &bundles[idx];
    let target = bundle.spec.is_target().then(|| TargetInBlock {
        target_offset: bundle.spec.target_offset_in_fragment,
    });
    Block {
        bundle_idx: idx,
        size: bundle_size(section, bundle),
        section_offset: 0,
        target,
    }
}

fn insert_placement(
    results: &mut ResultMap,
    offset: u64,
    placement: Placement,
) -> Result<(), SolveError> {
    if results.contains_key(&offset) {
        return Err(SolveError::DuplicateOffset { offset });
    }
    results.insert(offset, placement);
    Ok(())
}
