//! The assembler core: relaxation, the two-round driver, and the round-2
//! section rewrite.
//!
//! Round 1 performs a normal layout and emission; while writing, each
//! configured target offset is matched to the fragment containing it.
//! Round 2 invalidates the DBL section's offsets, cuts the section into
//! bundles, inserts bridge jumps, asks the solver for a placement of every
//! bundle, and rewrites the section by inserting padding and moving
//! bundles before emitting again.
//!
//! Offsets into code survive the reordering because they are expressed as
//! symbol references and resolved only after the final layout stands.

pub mod bundle;
pub mod encode;
pub mod fragment;
pub mod layout;
pub mod section;

pub use fragment::{FragId, Fragment, FragmentKind, SymId};
pub use layout::Layout;
pub use section::Section;

use crate::config::{self, DblMode, DblOptions, TargetSpec, VictimInfos};
use crate::debug;
use crate::emit::report;
use crate::emit::writer::{match_pending_target, ObjectWriter};
use crate::solve::Solver;
use crate::stats::{CompileStats, Timer};
use anyhow::{Context, Result};
use indexmap::IndexMap;
use std::collections::VecDeque;

/// Layout and rewrite errors. All fatal.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LayoutError {
    #[error("section {section}: target offset {offset:#x} was not matched by any fragment")]
    UnmatchedTarget { section: String, offset: u64 },

    #[error("section {section}: fragments before the first annotated fragment belong to no bundle")]
    UnbundledPrefix { section: String },

    #[error("target offset {offset:#x} appears in two bundles")]
    DuplicateTarget { offset: u64 },

    #[error("destination offset {offset:#x} has no bundle; target offsets probably overlap")]
    DestinationNotFound { offset: u64 },

    #[error("bundle {bundle} has no fragment that can carry a bridge jump")]
    NoJumpAnchor { bundle: usize },

    #[error("placement at {offset:#x} overlaps the previous bundle ending at {last_end:#x}")]
    Overlap { offset: u64, last_end: u64 },

    #[error("section '{0}' does not exist")]
    MissingSection(String),

    #[error("fixup against unbound symbol '{0}'")]
    UnboundSymbol(String),

    #[error("fixup displacement {value} does not fit its field")]
    FixupOverflow { value: i64 },

    #[error("fragment offsets were invalid during emission")]
    InvalidLayout,
}

/// The assembler: sections, target tables, victim pool, and the writer.
///
/// Single threaded; the solver state is confined to one section-layout
/// pass and both rounds run sequentially on the same sections.
pub struct Assembler {
    pub options: DblOptions,
    sections: Vec<Section>,
    /// Pending targets per section, sorted ascending, drained as they are
    /// matched during the round-1 write.
    targets_to_find: IndexMap<String, VecDeque<TargetSpec>>,
    victims: VictimInfos,
    writer: ObjectWriter,
    pub stats: CompileStats,
}

impl Assembler {
    pub fn new(options: DblOptions) -> Self {
        Self {
            options,
            sections: Vec::new(),
            targets_to_find: IndexMap::new(),
            victims: VictimInfos::default(),
            writer: ObjectWriter::new(),
            stats: CompileStats::new(),
        }
    }

    pub fn add_section(&mut self, section: Section) -> usize {
        self.sections.push(section);
        self.sections.len() - 1
    }

    pub fn section(&self, idx: usize) -> &Section {
        &self.sections[idx]
    }

    pub fn section_mut(&mut self, idx: usize) -> &mut Section {
        &mut self.sections[idx]
    }

    pub fn section_by_name(&self, name: &str) -> Option<usize> {
        self.sections.iter().position(|s| s.name == name)
    }

    /// Bytes emitted by the most recent round.
    pub fn object_bytes(&self) -> &[u8] {
        self.writer.bytes()
    }

    /// Inject config tables directly. Tests use this to skip the files.
    pub fn set_config(&mut self, targets: config::TargetTables, victims: VictimInfos) {
        self.targets_to_find = targets
            .into_iter()
            .map(|(name, specs)| (name, VecDeque::from(specs)))
            .collect();
        self.victims = victims;
    }

    /// Run the full pipeline for the configured mode.
    ///
    /// Round 1 always runs. In dbl mode the config is loaded first, every
    /// target must be matched by the round-1 write, and round 2 re-lays
    /// the DBL section before emitting again.
    pub fn finish(&mut self) -> Result<()> {
        self.options
            .validate()
            .context("invalid layout core options")?;

        if self.options.mode == DblMode::Dbl && self.targets_to_find.is_empty() {
            self.load_config()?;
        }
        let target_counts: IndexMap<String, usize> = self
            .targets_to_find
            .iter()
            .map(|(name, specs)| (name.clone(), specs.len()))
            .collect();

        // ROUND 1: normal emission; identifies the fragment and fragment
        // offset of every configured target.
        let layouts = self.layout(false)?;
        let seek = self.writer.tell();
        self.write_object(&layouts)?;
        self.stats.round1_bytes = self.writer.tell() - seek;

        if self.options.mode == DblMode::Dbl {
            self.check_all_targets_found(&target_counts)?;

            // ROUND 2: emit again with the solved layout over the old
            // bytes.
            self.writer.reset();
            let layouts = self.layout(true)?;
            self.write_object(&layouts)?;
            self.stats.round2_bytes = self.writer.tell();
            log::info!(
                "replaced {} bytes of code with {} bytes, fraction {:.3}",
                self.stats.round1_bytes,
                self.stats.round2_bytes,
                self.stats.round2_bytes as f64 / self.stats.round1_bytes.max(1) as f64
            );
        }
        Ok(())
    }

    fn load_config(&mut self) -> Result<()> {
        // validate() already checked the paths exist in dbl mode
        let to_path = self
            .options
            .target_offsets_path
            .clone()
            .context("target offsets path missing")?;
        let va_path = self
            .options
            .victim_addresses_path
            .clone()
            .context("victim addresses path missing")?;

        let targets = config::load_targets(&to_path)
            .with_context(|| format!("loading {}", to_path.display()))?;
        let victims = config::load_victims(&va_path, self.options.page_addr_mask())
            .with_context(|| format!("loading {}", va_path.display()))?;
        self.set_config(targets, victims);
        Ok(())
    }

    fn check_all_targets_found(
        &self,
        target_counts: &IndexMap<String, usize>,
    ) -> Result<(), LayoutError> {
        for (name, pending) in &self.targets_to_find {
            let total = target_counts.get(name).copied().unwrap_or(0);
            log::info!(
                "section {}: matched {} of {} target offsets",
                name,
                total - pending.len(),
                total
            );
            if let Some(missed) = pending.front() {
                return Err(LayoutError::UnmatchedTarget {
                    section: name.clone(),
                    offset: missed.offset_in_output,
                });
            }
        }
        Ok(())
    }

    /// Lay out all sections; in round 2, additionally solve and rewrite
    /// the DBL section. Fixups are applied under the final layout.
    fn layout(&mut self, round2: bool) -> Result<Vec<Layout>> {
        let timer = Timer::start();

        // alignment padding would shift bundles under the solver's feet,
        // so the DBL section's align fragments lose their effect
        if self.options.mode != DblMode::Baseline {
            if let Some(idx) = self.section_by_name(&self.options.dbl_section.clone()) {
                self.neuter_aligns(idx);
            }
        }

        let mut layouts = Vec::with_capacity(self.sections.len());
        for idx in 0..self.sections.len() {
            layouts.push(self.layout_section(idx)?);
        }

        if round2 {
            let dbl_name = self.options.dbl_section.clone();
            let idx = self
                .section_by_name(&dbl_name)
                .ok_or(LayoutError::MissingSection(dbl_name))?;
            layouts[idx].invalidate();

            let bundles = bundle::form_bundles(&self.sections[idx])?;
            self.stats.bundles_formed = bundles.len();
            debug::dump_section(&self.sections[idx], None, &bundles);

            log::info!(
                "adding a bridge jump ({} bytes) to every bundle",
                encode::NEAR_JMP_SIZE
            );
            bundle::insert_bridge_jumps(&mut self.sections[idx], &bundles)?;

            let solve_timer = Timer::start();
            let mut solver = Solver::new(&self.victims, self.options.page_size);
            let results = solver.solve(&self.sections[idx], &bundles)?;
            self.stats.solve_time = solve_timer.stop();

            self.rewrite_section(idx, &bundles, &results)?;
            layouts[idx] = Layout::compute(&self.sections[idx]);
            debug::dump_section(&self.sections[idx], Some(&layouts[idx]), &bundles);

            report::write_report(
                &self.options,
                &self.sections[idx].name,
                &results,
                &self.victims,
            )?;
        }

        for idx in 0..self.sections.len() {
            self.apply_fixups(idx, &layouts[idx])?;
        }

        self.stats.layout_time += timer.stop();
        Ok(layouts)
    }

    fn neuter_aligns(&mut self, idx: usize) {
        let section = &mut self.sections[idx];
        for id in section.order().to_vec() {
            if let FragmentKind::Align { alignment, .. } = &mut section.frag_mut(id).kind {
                *alignment = 1;
            }
        }
    }

    /// Relax the section to a fixed point and return its layout.
    fn layout_section(&mut self, idx: usize) -> Result<Layout, LayoutError> {
        let force_wide = self.options.mode != DblMode::Baseline;
        loop {
            let layout = Layout::compute(&self.sections[idx]);
            let mut relaxed = false;
            for id in self.sections[idx].order().to_vec() {
                if self.fragment_needs_relaxation(idx, id, &layout, force_wide)? {
                    self.sections[idx].frag_mut(id).relax();
                    self.stats.relaxed_instructions += 1;
                    relaxed = true;
                }
            }
            if !relaxed {
                return Ok(layout);
            }
        }
    }

    /// The DBL fixup policy.
    ///
    /// Outside baseline mode every relaxable jump is widened: bundle
    /// movement can push any branch arbitrarily far, so the 32-bit operand
    /// form trades bytes for a fixed encoding length. Baseline keeps the
    /// stock behavior of widening only jumps whose displacement does not
    /// fit 8 bits.
    fn fragment_needs_relaxation(
        &self,
        idx: usize,
        id: FragId,
        layout: &Layout,
        force_wide: bool,
    ) -> Result<bool, LayoutError> {
        let section = &self.sections[idx];
        let frag = section.frag(id);
        let FragmentKind::Relaxable {
            contents, fixups, ..
        } = &frag.kind
        else {
            return Ok(false);
        };
        if encode::is_near(contents) {
            return Ok(false);
        }
        if force_wide {
            return Ok(true);
        }

        let frag_offset = layout.fragment_offset(id).ok_or(LayoutError::InvalidLayout)?;
        for fixup in fixups {
            // an unresolved symbol cannot be proven near; widen
            let Some(sym_offset) = layout.symbol_offset(section, fixup.target) else {
                return Ok(true);
            };
            let value = sym_offset as i64
                - (frag_offset + fixup.offset + fixup.kind.width()) as i64;
            if i8::try_from(value).is_err() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Resolve every fixup against the final layout and patch the
    /// displacement bytes.
    fn apply_fixups(&mut self, idx: usize, layout: &Layout) -> Result<(), LayoutError> {
        for id in self.sections[idx].order().to_vec() {
            let fixups = self.sections[idx].frag(id).fixups().to_vec();
            if fixups.is_empty() {
                continue;
            }
            let frag_offset =
                layout.fragment_offset(id).ok_or(LayoutError::InvalidLayout)?;
            for fixup in fixups {
                let section = &self.sections[idx];
                let sym_offset = layout
                    .symbol_offset(section, fixup.target)
                    .ok_or_else(|| {
                        LayoutError::UnboundSymbol(section.symbol(fixup.target).name.clone())
                    })?;
                let value = sym_offset as i64
                    - (frag_offset + fixup.offset + fixup.kind.width()) as i64;

                let frag = self.sections[idx].frag_mut(id);
                let contents = match &mut frag.kind {
                    FragmentKind::Data { contents, .. } => contents,
                    FragmentKind::Relaxable { contents, .. } => contents,
                    _ => continue,
                };
                if !encode::patch_fixup(contents, &fixup, value) {
                    return Err(LayoutError::FixupOverflow { value });
                }
            }
        }
        Ok(())
    }

    /// Apply the solver's placements: rebuild the emission order with a
    /// fill fragment before every bundle and re-point the begin symbol.
    fn rewrite_section(
        &mut self,
        idx: usize,
        bundles: &[bundle::Bundle],
        results: &crate::solve::ResultMap,
    ) -> Result<(), LayoutError> {
        log::debug!("reordering, padding and moving bundles");
        if results.is_empty() {
            return Ok(());
        }
        let mut new_order: Vec<FragId> = Vec::new();
        let mut last_end = 0u64;

        for (&offset, placement) in results {
            let b = &bundles[placement.bundle_idx];
            if offset < last_end {
                return Err(LayoutError::Overlap {
                    offset,
                    last_end,
                });
            }
            let fill = offset - last_end;

            // whole pages of padding are possible; the linked destination
            // pairs can leave large holes
            let section = &mut self.sections[idx];
            let fill_id = section.alloc(Fragment::fill(0xcc, fill));
            let label =
                section.define_symbol(format!("padding_before_bundle{}", placement.bundle_idx));
            section.bind_symbol(label, fill_id, 0);
            new_order.push(fill_id);
            new_order.extend_from_slice(&b.frags);

            let size = bundle::bundle_size(section, b);
            last_end = offset + size;
            self.stats.fill_bytes += fill;
            log::debug!(
                "  bundle {} at {:#x} ({} bytes, {:#x} fill before it)",
                placement.bundle_idx,
                offset,
                size,
                fill
            );
        }

        let section = &mut self.sections[idx];
        section.set_order(new_order);
        // the linker derives inter-section offsets from the begin symbol
        let head = section.order()[0];
        let begin = section.begin;
        section.bind_symbol(begin, head, 0);
        Ok(())
    }

    /// Emit all sections into the writer, matching pending targets along
    /// the way (round 1, dbl mode only; the pending lists are empty by
    /// round 2).
    fn write_object(&mut self, layouts: &[Layout]) -> Result<(), LayoutError> {
        for idx in 0..self.sections.len() {
            let sec_start = self.writer.tell();
            let matching = self.options.mode == DblMode::Dbl
                && self.sections[idx].name == self.options.dbl_section;

            for id in self.sections[idx].order().to_vec() {
                let current = self.writer.tell() - sec_start;
                let size = self.sections[idx].frag(id).size(current);

                // the stream must advance in lockstep with the layout
                if layouts[idx].fragment_offset(id) != Some(current) {
                    return Err(LayoutError::InvalidLayout);
                }

                if matching && self.sections[idx].frag(id).is_encoded() {
                    let name = self.sections[idx].name.clone();
                    if let Some(pending) = self.targets_to_find.get_mut(&name) {
                        if !pending.is_empty() {
                            match_pending_target(
                                pending,
                                self.sections[idx].frag_mut(id),
                                current,
                                size,
                            );
                        }
                    }
                }

                match &self.sections[idx].frag(id).kind {
                    FragmentKind::Data { contents, .. }
                    | FragmentKind::Relaxable { contents, .. } => {
                        self.writer.push_bytes(contents);
                    }
                    FragmentKind::Fill { value, .. } => {
                        self.writer.push_repeat(*value, size);
                    }
                    FragmentKind::Align { value, .. } => {
                        self.writer.push_repeat(*value, size);
                    }
                }
                self.stats.fragments_emitted += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::encode::{Cond, JumpInst};
    use crate::config::targets::{parse_targets, Sign, TargetKind};
    use crate::config::victims::parse_victims;

    fn baseline_asm() -> Assembler {
        Assembler::new(DblOptions::default())
    }

    #[test]
    fn test_baseline_short_jump_stays_short() {
        let mut asm = baseline_asm();
        let mut sec = Section::new(".dbl_text");
        let target = sec.define_symbol("next");
        sec.push(Fragment::relaxable(JumpInst::jmp(target)));
        let landing = sec.push(Fragment::data(vec![0x90]));
        sec.bind_symbol(target, landing, 0);
        asm.add_section(sec);

        asm.finish().unwrap();
        // jmp +0: EB 00, then the NOP
        assert_eq!(asm.object_bytes(), &[0xeb, 0x00, 0x90]);
    }

    #[test]
    fn test_baseline_far_jump_widens() {
        let mut asm = baseline_asm();
        let mut sec = Section::new(".dbl_text");
        let target = sec.define_symbol("far");
        sec.push(Fragment::relaxable(JumpInst::jmp(target)));
        sec.push(Fragment::fill(0x90, 0x200));
        let landing = sec.push(Fragment::data(vec![0xc3]));
        sec.bind_symbol(target, landing, 0);
        asm.add_section(sec);

        asm.finish().unwrap();
        let bytes = asm.object_bytes();
        assert_eq!(bytes[0], 0xe9);
        // displacement from end of jmp (5) to 0x205
        assert_eq!(&bytes[1..5], &0x200i32.to_le_bytes());
        assert_eq!(asm.stats.relaxed_instructions, 1);
    }

    #[test]
    fn test_offsets_mode_forces_wide() {
        let mut asm = Assembler::new(DblOptions {
            mode: DblMode::Offsets,
            ..DblOptions::default()
        });
        let mut sec = Section::new(".dbl_text");
        let target = sec.define_symbol("next");
        sec.push(Fragment::relaxable(JumpInst::jcc(Cond::E, target)));
        let landing = sec.push(Fragment::data(vec![0x90]));
        sec.bind_symbol(target, landing, 0);
        asm.add_section(sec);

        asm.finish().unwrap();
        // 0F 84 <rel32=0> then the NOP
        assert_eq!(asm.object_bytes(), &[0x0f, 0x84, 0, 0, 0, 0, 0x90]);
    }

    #[test]
    fn test_offsets_mode_neuters_aligns() {
        let mut asm = Assembler::new(DblOptions {
            mode: DblMode::Offsets,
            ..DblOptions::default()
        });
        let mut sec = Section::new(".dbl_text");
        sec.push(Fragment::data(vec![1, 2, 3]));
        sec.push(Fragment::align(16, 0x90));
        sec.push(Fragment::data(vec![4]));
        asm.add_section(sec);

        asm.finish().unwrap();
        assert_eq!(asm.object_bytes(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_baseline_keeps_aligns() {
        let mut asm = baseline_asm();
        let mut sec = Section::new(".dbl_text");
        sec.push(Fragment::data(vec![1, 2, 3]));
        sec.push(Fragment::align(8, 0x90));
        sec.push(Fragment::data(vec![4]));
        asm.add_section(sec);

        asm.finish().unwrap();
        assert_eq!(
            asm.object_bytes(),
            &[1, 2, 3, 0x90, 0x90, 0x90, 0x90, 0x90, 4]
        );
    }

    #[test]
    fn test_unmatched_target_is_fatal() {
        let targets = parse_targets(
            r#"
[[sections]]
name = ".dbl_text"

[[sections.values]]
type = "fixed"
offset = 0x1000
bit = 0
sign = "+"
"#,
        )
        .unwrap();
        let victims = parse_victims("4130 0 + 3000 ff\n", !(0xfffu64)).unwrap();

        let mut asm = Assembler::new(DblOptions {
            mode: DblMode::Dbl,
            compilation_id: "t".into(),
            target_offsets_path: Some("unused".into()),
            victim_addresses_path: Some("unused".into()),
            compiler_output_path: Some(std::env::temp_dir()),
            ..DblOptions::default()
        });
        asm.set_config(targets, victims);

        let mut sec = Section::new(".dbl_text");
        sec.push(Fragment::data(vec![0; 16])); // much smaller than 0x1000
        asm.add_section(sec);

        let err = asm.finish().unwrap_err();
        let layout_err = err.downcast_ref::<LayoutError>().unwrap();
        assert!(matches!(
            layout_err,
            LayoutError::UnmatchedTarget { offset: 0x1000, .. }
        ));
    }

    #[test]
    fn test_rewrite_overlap_detected() {
        use crate::solve::{Placement, ResultMap};

        let mut asm = baseline_asm();
        let mut sec = Section::new(".dbl_text");
        let a = sec.push(Fragment::data(vec![0; 32]));
        let b = sec.push(Fragment::data(vec![0; 32]));
        let idx = asm.add_section(sec);

        let mut spec_a = TargetSpec::new(0, TargetKind::Ignored);
        spec_a.target_offset_in_fragment = 0;
        let bundles = vec![
            bundle::Bundle { spec: spec_a, frags: vec![a], dests: None },
            bundle::Bundle {
                spec: TargetSpec::new(
                    32,
                    TargetKind::Fixed { bit: 0, sign: Sign::Plus },
                ),
                frags: vec![b],
                dests: None,
            },
        ];
        // placements 16 bytes apart although the first bundle is 32 long
        let mut results = ResultMap::new();
        results.insert(0, Placement { bundle_idx: 0, victim: None });
        results.insert(16, Placement { bundle_idx: 1, victim: None });

        assert!(matches!(
            asm.rewrite_section(idx, &bundles, &results),
            Err(LayoutError::Overlap { offset: 16, last_end: 32 })
        ));
    }
}
