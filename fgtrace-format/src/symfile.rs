//! Per-module symbol files saved next to the trace data.
//!
//! The engine resolves symbols inside the traced process and writes one
//! `<module>.sym` file per mapped image so the analysis side can map the
//! recorded addresses back to names without reopening the binaries. One
//! line per symbol: `<hex address> <size> <kind letter> <name>`, sorted by
//! address.

use crate::FormatError;
use std::io::{BufRead, Write};

/// Symbol classification, a letter on each `.sym` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymKind {
    /// Global text symbol.
    Text,
    /// Local text symbol.
    Local,
    /// Weak text symbol.
    Weak,
    /// A PLT entry synthesized from the relocation tables.
    Plt,
}

impl SymKind {
    pub fn letter(self) -> char {
        match self {
            SymKind::Text => 'T',
            SymKind::Local => 't',
            SymKind::Weak => 'w',
            SymKind::Plt => 'P',
        }
    }

    pub fn from_letter(c: char) -> Option<Self> {
        match c {
            'T' => Some(SymKind::Text),
            't' => Some(SymKind::Local),
            'w' => Some(SymKind::Weak),
            'P' => Some(SymKind::Plt),
            _ => None,
        }
    }
}

/// One symbol as stored in a `.sym` file. Addresses are relative to the
/// module load base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymEntry {
    pub addr: u64,
    pub size: u64,
    pub kind: SymKind,
    pub name: String,
}

/// Write a symbol file. `entries` must already be sorted by address.
pub fn write_symfile<W: Write>(w: &mut W, path: &str, entries: &[SymEntry]) -> Result<(), FormatError> {
    writeln!(w, "# path: {path}")?;
    for e in entries {
        writeln!(w, "{:016x} {:x} {} {}", e.addr, e.size, e.kind.letter(), e.name)?;
    }
    Ok(())
}

/// Read a symbol file back.
pub fn read_symfile<R: BufRead>(r: &mut R) -> Result<Vec<SymEntry>, FormatError> {
    let mut entries = Vec::new();
    for line in r.lines() {
        let line = line?;
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let bad = || FormatError::BadSymLine(line.clone());
        let mut fields = line.splitn(4, ' ');
        let addr = fields
            .next()
            .and_then(|f| u64::from_str_radix(f, 16).ok())
            .ok_or_else(bad)?;
        let size = fields
            .next()
            .and_then(|f| u64::from_str_radix(f, 16).ok())
            .ok_or_else(bad)?;
        let kind = fields
            .next()
            .and_then(|f| f.chars().next())
            .and_then(SymKind::from_letter)
            .ok_or_else(bad)?;
        let name = fields.next().ok_or_else(bad)?.to_string();
        entries.push(SymEntry {
            addr,
            size,
            kind,
            name,
        });
    }
    Ok(entries)
}
