//! DBL layout core
//!
//! A binary layout solver driving a bit-flip targeted build: given an
//! assembled code section, a set of target offsets (places where flipping
//! one bit changes program semantics in a wanted way), and a pool of
//! victim addresses (physical DRAM bits known to flip), it re-lays the
//! section so every target bit lands on exactly one victim bit, then
//! emits the mapping a runtime loader consumes.
//!
//! # Architecture
//!
//! ```text
//! fragment listing / host fragments
//!        │
//!        ▼ (parser)
//! ┌──────────────┐
//! │   Section    │  fragments + symbols
//! └──────┬───────┘
//!        │ ROUND 1 (asm): relax wide, lay out, emit,
//!        │                match target offsets to fragments
//!        ▼
//! ┌──────────────┐
//! │   Bundles    │  ← bridge jumps preserve control flow
//! └──────┬───────┘
//!        │ (solve): victims best fit, address space first fit
//!        ▼
//! ┌──────────────┐
//! │  Placements  │  section offset per bundle + victim binding
//! └──────┬───────┘
//!        │ ROUND 2 (asm): pad, move bundles, re-emit
//!        ▼
//! object bytes + compiler_output_<id>.txt + page_allocation_<id>.txt
//! ```
//!
//! # Example
//!
//! ```no_run
//! use dbl_layout::{Assembler, DblOptions};
//!
//! let listing = std::fs::read_to_string("program.frags")?;
//! let options = DblOptions::dbl("target_offsets.toml", "victim_addresses.txt", "out", "run1");
//! let mut asm = Assembler::new(options);
//! for section in dbl_layout::parser::parse(&listing)? {
//!     asm.add_section(section);
//! }
//! asm.finish()?;
//! std::fs::write("program.bin", asm.object_bytes())?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod asm;
pub mod config;
pub mod debug;
pub mod emit;
pub mod parser;
pub mod solve;
pub mod stats;

pub use asm::{Assembler, LayoutError, Section};
pub use config::{DblMode, DblOptions};
pub use solve::SolveError;
pub use stats::CompileStats;

use anyhow::Result;

/// Assemble a fragment listing under the given options and return the
/// object bytes.
pub fn assemble_listing(listing: &str, options: DblOptions) -> Result<Vec<u8>> {
    let (bytes, _stats) = assemble_listing_with_stats(listing, options)?;
    Ok(bytes)
}

/// Like [`assemble_listing`], but also returns compilation statistics.
pub fn assemble_listing_with_stats(
    listing: &str,
    options: DblOptions,
) -> Result<(Vec<u8>, CompileStats)> {
    let sections = parser::parse(listing)?;
    let mut asm = Assembler::new(options);
    for section in sections {
        asm.add_section(section);
    }
    asm.finish()?;
    let stats = asm.stats.clone();
    Ok((asm.object_bytes().to_vec(), stats))
}
