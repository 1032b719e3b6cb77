//! Mapping file emission.
//!
//! After round 2 the physical mapping is written out for the runtime
//! loader: one row per victim-assigned bundle, keyed by the compilation
//! id. A second, comma-separated file feeds the flip validator.

use crate::config::DblOptions;
use crate::config::victims::VictimInfos;
use crate::solve::ResultMap;
use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::path::PathBuf;

/// Paths of the two emitted files.
#[derive(Debug, Clone)]
pub struct ReportPaths {
    pub output: PathBuf,
    pub validator: PathBuf,
}

impl ReportPaths {
    pub fn new(options: &DblOptions) -> Option<Self> {
        let dir = options.compiler_output_path.as_ref()?;
        let id = &options.compilation_id;
        Some(Self {
            output: dir.join(format!("compiler_output_{}.txt", id)),
            validator: dir.join(format!("page_allocation_{}.txt", id)),
        })
    }
}

/// Write the compiler output table and the validator file.
///
/// The `[Layout]` row format is
/// `<section> <page_off> <victim_addr> <bit><sign> <aggr,...> <aggr_init>`,
/// all integers hex. The validator rows are `0,<aggr>,...,<victim_addr>`.
pub fn write_report(
    options: &DblOptions,
    section_name: &str,
    results: &ResultMap,
    victims: &VictimInfos,
) -> Result<ReportPaths> {
    let paths = ReportPaths::new(options)
        .context("compiler output path not configured")?;

    let (output, validator) = render(section_name, results, victims);

    std::fs::write(&paths.output, output)
        .with_context(|| format!("failed to write {}", paths.output.display()))?;
    std::fs::write(&paths.validator, validator)
        .with_context(|| format!("failed to write {}", paths.validator.display()))?;

    log::info!(
        "wrote physical mapping to {} and {}",
        paths.output.display(),
        paths.validator.display()
    );
    Ok(paths)
}

fn render(
    section_name: &str,
    results: &ResultMap,
    victims: &VictimInfos,
) -> (String, String) {
    let mut output = String::from("[General]\n\n[Layout]\n");
    let mut validator = String::new();

    for placement in results.values() {
        // placements without a victim carry no physical constraint
        let Some(assignment) = &placement.victim else {
            continue;
        };
        let victim = victims.get(assignment.frame, assignment.index);

        let _ = write!(
            output,
            "{} 0x{:x} 0x{:x} {}{}",
            section_name, assignment.page_offset, victim.virt_addr, victim.bit, victim.sign
        );
        validator.push_str("0,");
        let mut sep = " ";
        for aggr in &victim.aggressors {
            let _ = write!(output, "{}0x{:x}", sep, aggr);
            sep = ",";
            let _ = write!(validator, "0x{:x},", aggr);
        }
        let _ = writeln!(output, " 0x{:x}", victim.aggr_init);
        let _ = writeln!(validator, "{:x}", victim.virt_addr);
    }

    (output, validator)
}
