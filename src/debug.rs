//! Layout dumps for troubleshooting.
//!
//! Mirrors the section state before and after the rewrite: bundle extents
//! and sizes at `debug!` level, raw fragment bytes at `trace!` level.
//! During reordering fragment offsets are invalid, so pass a layout only
//! once it has been recomputed.

use crate::asm::bundle::{bundle_size, Bundle};
use crate::asm::fragment::FragmentKind;
use crate::asm::layout::Layout;
use crate::asm::section::Section;

/// Log the section's bundle structure.
pub fn dump_section(section: &Section, layout: Option<&Layout>, bundles: &[Bundle]) {
    if !log::log_enabled!(log::Level::Debug) {
        return;
    }

    log::debug!(
        "section {}: {} fragments, {} bundles of interest",
        section.name,
        section.order().len(),
        bundles.len()
    );

    for (idx, bundle) in bundles.iter().enumerate() {
        let size = bundle_size(section, bundle);
        let offset = layout.and_then(|l| l.fragment_offset(bundle.frags[0]));
        match offset {
            Some(off) => log::debug!(
                "  bundle {} at {:#x}: {} fragment(s), {} bytes",
                idx,
                off,
                bundle.frags.len(),
                size
            ),
            None => log::debug!(
                "  bundle {}: {} fragment(s), {} bytes",
                idx,
                bundle.frags.len(),
                size
            ),
        }

        if log::log_enabled!(log::Level::Trace) {
            for &id in &bundle.frags {
                let frag = section.frag(id);
                if let Some(contents) = frag.contents() {
                    let bytes: Vec<String> =
                        contents.iter().map(|b| format!("{:02x}", b)).collect();
                    log::trace!("    fragment {:?}: {}", id, bytes.join(" "));
                }
            }
        }
    }

    // fills inserted by the rewrite live outside every bundle
    for &id in section.order() {
        if let FragmentKind::Fill { value, size } = section.frag(id).kind {
            let offset = layout.and_then(|l| l.fragment_offset(id));
            match offset {
                Some(off) => log::debug!(
                    "  fill at {:#x}: {} bytes of {:#04x}",
                    off,
                    size,
                    value
                ),
                None => log::debug!("  fill: {} bytes of {:#04x}", size, value),
            }
        }
    }
}
