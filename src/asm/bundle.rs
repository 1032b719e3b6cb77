//! Bundle formation and bridge jump insertion.
//!
//! After round 1 every fragment of interest carries its matched target
//! spec. Bundles are cut tail to head so that the annotated fragment is
//! always the first of its bundle and everything up to the next annotated
//! fragment is tail filler. Bundles are the atomic units the solver moves;
//! bridge jumps keep control flow sequential under arbitrary reordering.

use super::fragment::FragId;
use super::section::Section;
use super::LayoutError;
use crate::config::targets::{TargetKind, TargetSpec};
use std::collections::HashMap;

/// A contiguous fragment range moved as one unit.
#[derive(Debug, Clone)]
pub struct Bundle {
    /// The annotation of the bundle's first fragment.
    pub spec: TargetSpec,
    /// Fragments in emission order; the fragment of interest is first.
    pub frags: Vec<FragId>,
    /// For range bundles: indices of the (normal, flip) destination
    /// bundles, translated from output offsets once all bundles exist.
    pub dests: Option<(usize, usize)>,
}

/// Total byte size of a bundle.
///
/// Valid only once align fragments in the section have been neutered,
/// which the driver does before any bundling.
pub fn bundle_size(section: &Section, bundle: &Bundle) -> u64 {
    bundle
        .frags
        .iter()
        .map(|&id| {
            let frag = section.frag(id);
            debug_assert!(frag.size(0) == frag.size(1) || frag.is_encoded());
            frag.size(0)
        })
        .sum()
}

/// Cut the section into bundles and translate range destinations to
/// bundle indices.
pub fn form_bundles(section: &Section) -> Result<Vec<Bundle>, LayoutError> {
    let order = section.order();
    let mut bundles = Vec::new();
    let mut bundle_end = order.len();

    // Tail to head; a fragment with an annotation starts a new bundle.
    // Align fragments never cut.
    for i in (0..order.len()).rev() {
        let frag = section.frag(order[i]);
        if !frag.is_encoded() {
            continue;
        }
        if let Some(spec) = frag.spec {
            bundles.push(Bundle {
                spec,
                frags: order[i..bundle_end].to_vec(),
                dests: None,
            });
            bundle_end = i;
        }
    }
    bundles.reverse();

    if bundle_end != 0 {
        return Err(LayoutError::UnbundledPrefix {
            section: section.name.clone(),
        });
    }

    // No target offset may appear in two bundles.
    let mut by_offset: HashMap<u64, usize> = HashMap::new();
    for (idx, bundle) in bundles.iter().enumerate() {
        if by_offset
            .insert(bundle.spec.offset_in_output, idx)
            .is_some()
        {
            return Err(LayoutError::DuplicateTarget {
                offset: bundle.spec.offset_in_output,
            });
        }
    }

    // Destinations are configured as output offsets; resolve them to
    // indices now, before any reordering invalidates the correspondence.
    for i in 0..bundles.len() {
        if let TargetKind::Range {
            normal_dest,
            flip_dest,
            ..
        } = bundles[i].spec.kind
        {
            // a miss here usually means overlapping target offsets in the
            // config
            let normal = *by_offset.get(&normal_dest).ok_or(
                LayoutError::DestinationNotFound { offset: normal_dest },
            )?;
            let flip = *by_offset
                .get(&flip_dest)
                .ok_or(LayoutError::DestinationNotFound { offset: flip_dest })?;
            bundles[i].dests = Some((normal, flip));
        }
    }

    log::debug!(
        "section {}: {} fragments in {} bundles",
        section.name,
        order.len(),
        bundles.len()
    );

    Ok(bundles)
}

/// Insert bridge jumps and labels so bundles stay sequential when moved.
///
/// Scanning in reverse, each bundle's head gets a label and the bundle
/// before it jumps to that label; the last bundle falls through to the
/// section end and gets no jump. Costs [`NEAR_JMP_SIZE`] bytes per bundle.
///
/// [`NEAR_JMP_SIZE`]: super::encode::NEAR_JMP_SIZE
pub fn insert_bridge_jumps(
    section: &mut Section,
    bundles: &[Bundle],
) -> Result<(), LayoutError> {
    let mut next_label = None;
    for (idx, bundle) in bundles.iter().enumerate().rev() {
        if let Some(label) = next_label {
            let anchor = bundle
                .frags
                .iter()
                .rev()
                .copied()
                .find(|&id| section.frag(id).is_encoded())
                .ok_or(LayoutError::NoJumpAnchor { bundle: idx })?;
            section.frag_mut(anchor).append_jump(label);
        }

        let label = section.temp_symbol();
        section.bind_symbol(label, bundle.frags[0], 0);
        next_label = Some(label);
    }
    Ok(())
}
