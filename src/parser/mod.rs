//! Fragment listing parser.
//!
//! The binary consumes a small text format standing in for the host
//! compiler's fragment stream: one directive per line, `#` starts a
//! comment.
//!
//! ```text
//! section .dbl_text
//! data 55 48 89 e5        # hex bytes, one fragment
//! label loop_head         # bind a symbol to the next fragment
//! data 48 ff c0
//! jcc ne loop_head        # relaxable conditional jump
//! jmp done
//! align 16
//! label done
//! data c3
//! ```
//!
//! Labels bind to the start of the next fragment. Jumps are emitted in
//! their short form and widened by relaxation as needed.

use crate::asm::encode::{Cond, JumpInst};
use crate::asm::fragment::{FragId, Fragment, SymId};
use crate::asm::section::Section;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("line {line}: unknown directive '{directive}'")]
    UnknownDirective { line: usize, directive: String },

    #[error("listing defines no section")]
    NoSection,

    #[error("label '{0}' bound to nothing (listing ends after it)")]
    DanglingLabel(String),
}

/// Parse a listing into sections.
pub fn parse(text: &str) -> Result<Vec<Section>, ParseError> {
    let mut sections: Vec<Section> = Vec::new();
    // labels seen since the last fragment; they bind to the next one
    let mut pending_labels: Vec<SymId> = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = match raw.find('#') {
            Some(pos) => &raw[..pos],
            None => raw,
        }
        .trim();
        if line.is_empty() {
            continue;
        }

        let mut words = line.split_whitespace();
        let directive = words.next().unwrap_or_default();
        let args: Vec<&str> = words.collect();

        if directive == "section" {
            let name = args.first().ok_or_else(|| syntax(line_no, "missing section name"))?;
            if !pending_labels.is_empty() {
                return Err(ParseError::DanglingLabel(label_names(&sections, &pending_labels)));
            }
            sections.push(Section::new(*name));
            continue;
        }

        let section = sections.last_mut().ok_or(ParseError::NoSection)?;
        match directive {
            "data" => {
                let mut bytes = Vec::with_capacity(args.len());
                for arg in &args {
                    let b = u8::from_str_radix(arg, 16)
                        .map_err(|_| syntax(line_no, &format!("bad hex byte '{}'", arg)))?;
                    bytes.push(b);
                }
                if bytes.is_empty() {
                    return Err(syntax(line_no, "data directive without bytes"));
                }
                let id = section.push(Fragment::data(bytes));
                bind_pending(section, &mut pending_labels, id);
            }
            "jmp" => {
                let label = args
                    .first()
                    .ok_or_else(|| syntax(line_no, "jmp needs a label"))?;
                let target = resolve_label(section, label);
                let id = section.push(Fragment::relaxable(JumpInst::jmp(target)));
                bind_pending(section, &mut pending_labels, id);
            }
            "jcc" => {
                let (cc, label) = match args.as_slice() {
                    [cc, label] => (*cc, *label),
                    _ => return Err(syntax(line_no, "jcc needs a condition and a label")),
                };
                let cond = Cond::from_str(cc)
                    .ok_or_else(|| syntax(line_no, &format!("bad condition '{}'", cc)))?;
                let target = resolve_label(section, label);
                let id = section.push(Fragment::relaxable(JumpInst::jcc(cond, target)));
                bind_pending(section, &mut pending_labels, id);
            }
            "fill" => {
                let (value, size) = match args.as_slice() {
                    [value, size] => (
                        u8::from_str_radix(value, 16)
                            .map_err(|_| syntax(line_no, "bad fill value"))?,
                        parse_int(size).ok_or_else(|| syntax(line_no, "bad fill size"))?,
                    ),
                    _ => return Err(syntax(line_no, "fill needs a value and a size")),
                };
                let id = section.push(Fragment::fill(value, size));
                bind_pending(section, &mut pending_labels, id);
            }
            "align" => {
                let alignment = args
                    .first()
                    .and_then(|a| parse_int(a))
                    .ok_or_else(|| syntax(line_no, "align needs an alignment"))?;
                if !alignment.is_power_of_two() {
                    return Err(syntax(line_no, "alignment must be a power of two"));
                }
                let value = match args.get(1) {
                    Some(v) => u8::from_str_radix(v, 16)
                        .map_err(|_| syntax(line_no, "bad align value"))?,
                    None => 0x90,
                };
                let id = section.push(Fragment::align(alignment, value));
                bind_pending(section, &mut pending_labels, id);
            }
            "label" => {
                let name = args
                    .first()
                    .ok_or_else(|| syntax(line_no, "label needs a name"))?;
                let sym = resolve_label(section, name);
                pending_labels.push(sym);
            }
            other => {
                return Err(ParseError::UnknownDirective {
                    line: line_no,
                    directive: other.to_string(),
                })
            }
        }
    }

    if !pending_labels.is_empty() {
        return Err(ParseError::DanglingLabel(label_names(&sections, &pending_labels)));
    }
    if sections.is_empty() {
        return Err(ParseError::NoSection);
    }
    Ok(sections)
}

fn syntax(line: usize, message: &str) -> ParseError {
    ParseError::Syntax {
        line,
        message: message.to_string(),
    }
}

fn parse_int(s: &str) -> Option<u64> {
    match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

/// Forward references are allowed; a label is created unbound on first
/// mention and bound when its `label` line's next fragment appears.
fn resolve_label(section: &mut Section, name: &str) -> SymId {
    section
        .find_symbol(name)
        .unwrap_or_else(|| section.define_symbol(name))
}

fn bind_pending(section: &mut Section, pending: &mut Vec<SymId>, frag: FragId) {
    for sym in pending.drain(..) {
        section.bind_symbol(sym, frag, 0);
    }
}

fn label_names(sections: &[Section], pending: &[SymId]) -> String {
    let Some(section) = sections.last() else {
        return String::new();
    };
    pending
        .iter()
        .map(|&s| section.symbol(s).name.clone())
        .collect::<Vec<_>>()
        .join(", ")
}
