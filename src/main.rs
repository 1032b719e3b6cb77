//! DBL layout CLI
//!
//! Assembles a fragment listing, optionally re-laying the code section so
//! configured target bits land on flippable DRAM bits.
//!
//! # Usage
//!
//! ```bash
//! # stock assembly
//! dbl-layout program.frags -o program.bin
//!
//! # harvest target offsets (all jumps widened, no re-layout)
//! dbl-layout program.frags -o program.bin --mode offsets
//!
//! # full two-round flow
//! dbl-layout program.frags -o program.bin --mode dbl \
//!     --target-offsets target_offsets.toml \
//!     --victim-addresses victim_addresses.txt \
//!     --output-dir out --id run1
//! ```

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use dbl_layout::{DblMode, DblOptions};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Layout core disabled; behave like a stock assembler
    Baseline,
    /// Force wide jumps but skip the re-layout round
    Offsets,
    /// Full two-round flow with mapping file output
    Dbl,
}

impl From<Mode> for DblMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Baseline => DblMode::Baseline,
            Mode::Offsets => DblMode::Offsets,
            Mode::Dbl => DblMode::Dbl,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "dbl-layout",
    version,
    about = "Binary layout solver for bit-flip targeted builds",
    long_about = r#"
DBL layout core

Assembles a fragment listing and, in dbl mode, re-lays the code section so
that every configured target bit lands on a physical DRAM bit known to
flip. The physical mapping is written next to the object for the runtime
loader.

MODES:
  baseline  The core is inert; output matches a stock assembly.
  offsets   Jumps are widened to their 32-bit forms so offsets are stable,
            but no re-layout happens. Use this to harvest target offsets.
  dbl       The full two-round flow: match targets, solve the placement
            puzzle, rewrite the section, emit the mapping files.

CONFIG FILES (dbl mode):
  --target-offsets   TOML document listing target offsets per section
  --victim-addresses text file with one victim record per line
"#
)]
struct Args {
    /// Input fragment listing
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Output object path
    #[arg(short, long, value_name = "OUTPUT")]
    output: Option<PathBuf>,

    /// Operating mode
    #[arg(long, value_enum, default_value = "baseline")]
    mode: Mode,

    /// Target offsets file path (dbl mode)
    #[arg(long, value_name = "FILE")]
    target_offsets: Option<PathBuf>,

    /// Victim addresses file path (dbl mode)
    #[arg(long, value_name = "FILE")]
    victim_addresses: Option<PathBuf>,

    /// Directory for the emitted mapping files (dbl mode)
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Id to tag the mapping files with (dbl mode)
    #[arg(long, value_name = "ID", default_value = "")]
    id: String,

    /// Name of the section the core operates on
    #[arg(long, default_value = ".dbl_text")]
    section: String,

    /// Page size in bytes
    #[arg(long, default_value_t = dbl_layout::config::DEFAULT_PAGE_SIZE)]
    page_size: u64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    if args.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    let options = DblOptions {
        mode: args.mode.into(),
        target_offsets_path: args.target_offsets,
        victim_addresses_path: args.victim_addresses,
        compiler_output_path: args.output_dir,
        compilation_id: args.id,
        dbl_section: args.section,
        page_size: args.page_size,
    };
    options
        .validate()
        .context("invalid option combination for the selected mode")?;

    let listing = std::fs::read_to_string(&args.input)
        .with_context(|| format!("failed to read {}", args.input.display()))?;

    let (bytes, stats) = dbl_layout::assemble_listing_with_stats(&listing, options)
        .with_context(|| format!("failed to assemble {}", args.input.display()))?;

    let output = args
        .output
        .unwrap_or_else(|| args.input.with_extension("bin"));
    std::fs::write(&output, &bytes)
        .with_context(|| format!("failed to write {}", output.display()))?;

    if args.verbose {
        stats.display();
        eprintln!("\nWrote {} bytes to {}", bytes.len(), output.display());
    } else {
        println!("{}", output.display());
    }

    Ok(())
}
