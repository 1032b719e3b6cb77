//! End-to-end tests for the layout core.
//!
//! These exercise the two-round pipeline without a host compiler by
//! building sections directly or parsing small fragment listings.

use dbl_layout::asm::fragment::Fragment;
use dbl_layout::asm::Section;
use dbl_layout::config::targets::parse_targets;
use dbl_layout::config::victims::parse_victims;
use dbl_layout::emit::ReportPaths;
use dbl_layout::{Assembler, DblMode, DblOptions, LayoutError, SolveError};
use std::path::PathBuf;

const PAGE: u64 = 4096;
const PAGE_MASK: u64 = !(PAGE - 1);

fn create_temp_dir(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "dbl-layout-test-{}-{}",
        label,
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).expect("temp dir");
    dir
}

fn dbl_options(label: &str) -> DblOptions {
    DblOptions {
        mode: DblMode::Dbl,
        target_offsets_path: Some("preloaded".into()),
        victim_addresses_path: Some("preloaded".into()),
        compiler_output_path: Some(create_temp_dir(label)),
        compilation_id: label.to_string(),
        ..DblOptions::default()
    }
}

/// Single fixed target with one matching victim: the bundle must shift by
/// `E = victim_page_offset - target_offset` bytes and the mapping row must
/// name the victim spot.
#[test]
fn test_single_fixed_target_places_on_victim() {
    let targets = parse_targets(
        r#"
[[sections]]
name = ".dbl_text"

[[sections.values]]
type = "fixed"
offset = 0x120
bit = 3
sign = "+"
"#,
    )
    .unwrap();
    let victims = parse_victims("4130 3 + 3000,5000 ff\n", PAGE_MASK).unwrap();

    let options = dbl_options("single-fixed");
    let paths = ReportPaths::new(&options).unwrap();

    let mut asm = Assembler::new(options);
    asm.set_config(targets, victims);

    let mut sec = Section::new(".dbl_text");
    sec.push(Fragment::data(vec![0xab; 0x200]));
    asm.add_section(sec);

    asm.finish().unwrap();

    // 0x130 - 0x120 = 0x10 bytes of head padding
    let bytes = asm.object_bytes();
    assert_eq!(bytes.len(), 0x210);
    assert!(bytes[..0x10].iter().all(|&b| b == 0xcc));
    assert!(bytes[0x10..].iter().all(|&b| b == 0xab));

    let output = std::fs::read_to_string(&paths.output).unwrap();
    assert_eq!(
        output,
        "[General]\n\n[Layout]\n.dbl_text 0x130 0x4130 3+ 0x3000,0x5000 0xff\n"
    );
    let validator = std::fs::read_to_string(&paths.validator).unwrap();
    assert_eq!(validator, "0,0x3000,0x5000,4130\n");
}

/// A range target and its two destinations: the destinations must end up
/// exactly `dist` apart, `dist` a power of two below 2^32.
#[test]
fn test_range_target_destinations_at_fixed_distance() {
    let targets = parse_targets(
        r#"
[[sections]]
name = ".dbl_text"

[[sections.values]]
type = "range"
start_offset = 9
range = 4
normal_dest = 32
flipped_dest = 48
"#,
    )
    .unwrap();
    // the range's flip bit depends on dist; sizes 37/21/16 give dist 64,
    // so bit 6 of operand byte 0
    let victims = parse_victims("4840 6 + 3000 ff\n", PAGE_MASK).unwrap();

    let mut asm = Assembler::new(dbl_options("range-pair"));
    asm.set_config(targets, victims);

    let mut sec = Section::new(".dbl_text");
    sec.push(Fragment::data(vec![0x11; 32])); // range bundle
    sec.push(Fragment::data(vec![0x22; 16])); // normal destination
    sec.push(Fragment::data(vec![0x33; 16])); // flipped destination
    asm.add_section(sec);

    asm.finish().unwrap();
    let bytes = asm.object_bytes();

    // bridge jumps grow the first two bundles by 5 bytes each; max bundle
    // is 37 so dist is 64
    let normal_off = 0usize;
    let flip_off = 64usize;
    assert_eq!(&bytes[normal_off..normal_off + 16], &[0x22; 16]);
    assert_eq!(&bytes[flip_off..flip_off + 16], &[0x33; 16]);

    // the normal destination's bridge jump lands on the flipped one
    assert_eq!(bytes[16], 0xe9);
    let disp = i32::from_le_bytes(bytes[17..21].try_into().unwrap());
    assert_eq!(disp, 64 - 21);

    // the range bundle itself sits victim-aligned: (offset +
    // target_offset) mod page equals the victim's page offset
    let range_off = bytes.len() - 37;
    assert_eq!((range_off as u64 + 9) % PAGE, 0x840);
    assert_eq!(&bytes[range_off..range_off + 32], &[0x11; 32]);

    // its bridge jump flows back to the normal destination chain
    assert_eq!(bytes[range_off + 32], 0xe9);
    let disp = i32::from_le_bytes(
        bytes[range_off + 33..range_off + 37].try_into().unwrap(),
    );
    assert_eq!(range_off as i64 + 37 + disp as i64, normal_off as i64);
}

/// Two targets competing for one victim frame: the second placement must
/// abort with victim exhaustion.
#[test]
fn test_victim_exhausted_is_fatal() {
    let targets = parse_targets(
        r#"
[[sections]]
name = ".dbl_text"

[[sections.values]]
type = "fixed"
offset = 8
bit = 0
sign = "+"

[[sections.values]]
type = "fixed"
offset = 24
bit = 0
sign = "+"
"#,
    )
    .unwrap();
    let victims = parse_victims("4030 0 + 3000 ff\n", PAGE_MASK).unwrap();

    let mut asm = Assembler::new(dbl_options("exhausted"));
    asm.set_config(targets, victims);

    let mut sec = Section::new(".dbl_text");
    sec.push(Fragment::data(vec![0x90; 16]));
    sec.push(Fragment::data(vec![0x90; 16]));
    asm.add_section(sec);

    let err = asm.finish().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SolveError>(),
        Some(SolveError::VictimExhausted { bit: 0, .. })
    ));
}

/// A target offset past the end of the section is never matched in round 1
/// and must abort the compile.
#[test]
fn test_unmatched_target_aborts() {
    let targets = parse_targets(
        r#"
[[sections]]
name = ".dbl_text"

[[sections.values]]
type = "fixed"
offset = 0x4000
bit = 2
sign = "-"
"#,
    )
    .unwrap();
    let victims = parse_victims("4130 2 - 3000 ff\n", PAGE_MASK).unwrap();

    let mut asm = Assembler::new(dbl_options("unmatched"));
    asm.set_config(targets, victims);

    let mut sec = Section::new(".dbl_text");
    sec.push(Fragment::data(vec![0; 64]));
    asm.add_section(sec);

    let err = asm.finish().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<LayoutError>(),
        Some(LayoutError::UnmatchedTarget { offset: 0x4000, .. })
    ));
}

/// Baseline mode: the core is inert, the output matches a stock assembly,
/// and no mapping files appear.
#[test]
fn test_baseline_mode_is_inert() {
    let out_dir = create_temp_dir("baseline");
    let listing = "\
section .dbl_text
data 55 48 89 e5
label top
data 48 ff c0
jcc ne top
data c3
";
    let options = DblOptions {
        mode: DblMode::Baseline,
        compiler_output_path: Some(out_dir.clone()),
        compilation_id: "baseline".into(),
        ..DblOptions::default()
    };
    let bytes = dbl_layout::assemble_listing(listing, options).unwrap();

    // jcc ne top: short form, displacement -5 back to offset 4
    assert_eq!(
        bytes,
        vec![0x55, 0x48, 0x89, 0xe5, 0x48, 0xff, 0xc0, 0x75, 0xfb, 0xc3]
    );

    // round-2 artifacts are absent
    assert!(std::fs::read_dir(&out_dir).unwrap().next().is_none());

    // a second compile of the same listing is byte-identical
    let again = dbl_layout::assemble_listing(
        listing,
        DblOptions {
            compiler_output_path: Some(out_dir),
            ..DblOptions::default()
        },
    )
    .unwrap();
    assert_eq!(bytes, again);
}

/// Offsets mode widens every jump but skips round 2.
#[test]
fn test_offsets_mode_widens_without_relayout() {
    let out_dir = create_temp_dir("offsets");
    let listing = "\
section .dbl_text
label top
data 90
jcc e top
";
    let options = DblOptions {
        mode: DblMode::Offsets,
        compiler_output_path: Some(out_dir.clone()),
        compilation_id: "offsets".into(),
        ..DblOptions::default()
    };
    let bytes = dbl_layout::assemble_listing(listing, options).unwrap();

    // 0F 84 rel32: back to offset 0 from fixup end at 7
    assert_eq!(bytes, vec![0x90, 0x0f, 0x84, 0xf9, 0xff, 0xff, 0xff]);
    assert!(std::fs::read_dir(&out_dir).unwrap().next().is_none());
}

/// Full file-based flow: config files on disk, listing parsed, mapping
/// emitted.
#[test]
fn test_dbl_mode_from_files() {
    let dir = create_temp_dir("from-files");
    let to_path = dir.join("target_offsets.toml");
    let va_path = dir.join("victim_addresses.txt");
    std::fs::write(
        &to_path,
        r#"
[[sections]]
name = ".dbl_text"

[[sections.values]]
type = "fixed"
offset = 0x4
bit = 1
sign = "-"
"#,
    )
    .unwrap();
    std::fs::write(&va_path, "# one victim\n4030 1 - 7000 00\n").unwrap();

    let listing = "\
section .dbl_text
data 01 02 03 04 05 06 07 08
";
    let options = DblOptions::dbl(&to_path, &va_path, &dir, "files");
    let paths = ReportPaths::new(&options).unwrap();
    let bytes = dbl_layout::assemble_listing(listing, options).unwrap();

    // victim page offset 0x30, target offset 4: bundle lands at 0x2c
    assert_eq!(bytes.len(), 0x2c + 8);
    assert!(bytes[..0x2c].iter().all(|&b| b == 0xcc));
    assert_eq!(&bytes[0x2c..], &[1, 2, 3, 4, 5, 6, 7, 8]);

    let output = std::fs::read_to_string(&paths.output).unwrap();
    assert_eq!(
        output,
        "[General]\n\n[Layout]\n.dbl_text 0x30 0x4030 1- 0x7000 0x0\n"
    );
}

/// The emitted section length equals the last placement plus its bundle.
#[test]
fn test_emitted_length_matches_final_placement() {
    let targets = parse_targets(
        r#"
[[sections]]
name = ".dbl_text"

[[sections.values]]
type = "fixed"
offset = 0
bit = 5
sign = "+"

[[sections.values]]
type = "none"
offset = 32
"#,
    )
    .unwrap();
    let victims = parse_victims("4200 5 + 3000 ff\n", PAGE_MASK).unwrap();

    let mut asm = Assembler::new(dbl_options("length"));
    asm.set_config(targets, victims);

    let mut sec = Section::new(".dbl_text");
    sec.push(Fragment::data(vec![0xaa; 32]));
    sec.push(Fragment::data(vec![0xbb; 32]));
    asm.add_section(sec);
    asm.finish().unwrap();

    // the ignored bundle goes first fit to offset 0; the fixed bundle
    // (37 bytes with its bridge jump) is shifted to page offset 0x200
    let bytes = asm.object_bytes();
    assert_eq!(bytes.len() as u64, 0x200 + 37);
    assert_eq!(&bytes[0x200..0x220], &[0xaa; 32]);
}
