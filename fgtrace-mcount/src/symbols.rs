//! The symbol and module index.
//!
//! Built once while the session arms: every loaded ELF image is
//! enumerated through the dynamic linker, parsed with `object`, and its
//! function symbols land in one address-sorted arena. Modules and
//! symbols cross-reference each other through plain indices
//! ([`ModuleId`]); nothing holds a pointer into anything else. After
//! arming the index is immutable except for dlopen'd modules, which
//! take the session's writer lock.

use crate::error::McountError;
use crate::sdt::{parse_stapsdt_notes, SdtNote};
use fgtrace_format::spec::Pattern;
use fgtrace_format::symfile::{write_symfile, SymEntry, SymKind};
use object::{Object, ObjectSection, ObjectSymbol, ObjectSymbolTable};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleId(pub u32);

/// One loaded ELF image.
#[derive(Debug)]
pub struct Module {
    pub path: PathBuf,
    /// Load bias added to the file's virtual addresses.
    pub base: u64,
    pub build_id: Option<[u8; 20]>,
    /// Absolute address of the `.plt` section, if present.
    pub plt_addr: Option<u64>,
    /// Absolute address of `.got.plt`; slot 2 holds the lazy resolver.
    pub got_plt: Option<u64>,
    pub sdt_notes: Vec<SdtNote>,
}

/// One function symbol, address-sorted in the arena.
#[derive(Debug)]
pub struct Symbol {
    pub addr: u64,
    pub size: u64,
    pub name: String,
    pub demangled: Option<String>,
    pub kind: SymKind,
    pub module: ModuleId,
}

impl Symbol {
    /// The name the user sees and filters against.
    pub fn display_name(&self) -> &str {
        self.demangled.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Default)]
pub struct SymbolIndex {
    modules: Vec<Module>,
    symbols: Vec<Symbol>,
}

impl SymbolIndex {
    pub fn empty() -> Self {
        SymbolIndex::default()
    }

    /// Enumerate every image in the running process and load its
    /// symbols. Unparseable modules are skipped, not fatal.
    pub fn load_process() -> Self {
        let mut index = SymbolIndex::empty();
        for (path, base) in enumerate_modules() {
            if let Err(err) = index.load_module(&path, base) {
                log::debug!("skipping module {}: {err}", path.display());
            }
        }
        index
    }

    pub fn load_module(&mut self, path: &Path, base: u64) -> Result<ModuleId, McountError> {
        let file = File::open(path)?;
        let data = unsafe { memmap2::Mmap::map(&file) }?;
        let obj = object::File::parse(&*data).map_err(|source| McountError::ObjectParse {
            path: path.to_path_buf(),
            source,
        })?;

        let build_id = obj
            .build_id()
            .ok()
            .flatten()
            .and_then(|id| <[u8; 20]>::try_from(id).ok());

        let plt_addr = obj
            .section_by_name(".plt")
            .map(|s| s.address().wrapping_add(base));
        let got_plt = obj
            .section_by_name(".got.plt")
            .map(|s| s.address().wrapping_add(base));

        let sdt_notes = obj
            .section_by_name(".note.stapsdt")
            .and_then(|s| s.data().ok().map(|d| parse_stapsdt_notes(d, base)))
            .unwrap_or_default();

        let module_id = ModuleId(self.modules.len() as u32);

        for sym in obj.symbols().chain(obj.dynamic_symbols()) {
            if sym.kind() != object::SymbolKind::Text || sym.size() == 0 {
                continue;
            }
            let Ok(name) = sym.name() else { continue };
            if name.is_empty() {
                continue;
            }
            let kind = if sym.is_weak() {
                SymKind::Weak
            } else if sym.is_local() {
                SymKind::Local
            } else {
                SymKind::Text
            };
            self.symbols.push(Symbol {
                addr: sym.address().wrapping_add(base),
                size: sym.size(),
                name: name.to_string(),
                demangled: demangle(name),
                kind,
                module: module_id,
            });
        }

        // Synthesize one symbol per PLT slot so library calls resolve
        // to `name@plt`.
        if let Some(plt) = plt_addr {
            let plt0 = crate::arch::Arch::plt0_size(crate::arch::native()) as u64;
            for (i, name) in plt_relocation_names(&obj).into_iter().enumerate() {
                self.symbols.push(Symbol {
                    addr: plt + plt0 + i as u64 * 16,
                    size: 16,
                    name: format!("{name}@plt"),
                    demangled: demangle(&name).map(|d| format!("{d}@plt")),
                    kind: SymKind::Plt,
                    module: module_id,
                });
            }
        }

        self.symbols.sort_by_key(|s| s.addr);
        self.modules.push(Module {
            path: path.to_path_buf(),
            base,
            build_id,
            plt_addr,
            got_plt,
            sdt_notes,
        });
        Ok(module_id)
    }

    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Address-to-symbol lookup; `addr` must fall inside the symbol's
    /// range.
    pub fn lookup(&self, addr: u64) -> Option<&Symbol> {
        let idx = self.symbols.partition_point(|s| s.addr <= addr);
        let sym = &self.symbols[idx.checked_sub(1)?];
        if addr < sym.addr + sym.size.max(1) {
            Some(sym)
        } else {
            None
        }
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Symbol> {
        self.symbols
            .iter()
            .find(|s| s.name == name || s.demangled.as_deref() == Some(name))
    }

    /// Write one `.sym` sidecar per module into the trace directory.
    /// Addresses are absolute for this run; the analysis side reads
    /// them back as-is.
    pub fn write_symfiles(&self, dir: &Path) -> Result<(), McountError> {
        for (mi, module) in self.modules.iter().enumerate() {
            let entries: Vec<SymEntry> = self
                .symbols
                .iter()
                .filter(|s| s.module == ModuleId(mi as u32))
                .map(|s| SymEntry {
                    addr: s.addr,
                    size: s.size,
                    kind: s.kind,
                    name: s.display_name().to_string(),
                })
                .collect();
            if entries.is_empty() {
                continue;
            }
            let stem = module
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "unknown".to_string());
            let out = File::create(dir.join(format!("{stem}.sym")))?;
            let mut writer = BufWriter::new(out);
            write_symfile(&mut writer, &module.path.to_string_lossy(), &entries)?;
        }
        Ok(())
    }
}

impl crate::filter::ResolvePattern for SymbolIndex {
    fn resolve(&self, pattern: &Pattern) -> Vec<(u64, u64)> {
        self.symbols
            .iter()
            .filter(|s| {
                pattern.matches(&s.name)
                    || s.demangled.as_deref().is_some_and(|d| pattern.matches(d))
            })
            .map(|s| (s.addr, s.addr + s.size.max(1)))
            .collect()
    }
}

/// Demangle C++ and Rust names; `None` keeps the raw name.
pub fn demangle(name: &str) -> Option<String> {
    if let Ok(sym) = rustc_demangle::try_demangle(name) {
        return Some(format!("{sym:#}"));
    }
    if name.starts_with("_Z") {
        let options = cpp_demangle::DemangleOptions::default().no_return_type();
        if let Ok(sym) = cpp_demangle::Symbol::new(name) {
            if let Ok(demangled) = sym.demangle_with_options(&options) {
                return Some(demangled);
            }
        }
    }
    None
}

fn plt_relocation_names(obj: &object::File) -> Vec<String> {
    let endian = if obj.is_little_endian() {
        object::Endianness::Little
    } else {
        object::Endianness::Big
    };
    let Some(section) = obj.section_by_name(".rela.plt") else {
        return Vec::new();
    };
    let Ok(data) = section.data() else {
        return Vec::new();
    };
    let table = obj.dynamic_symbol_table();

    let entry_size = std::mem::size_of::<object::elf::Rela64<object::Endianness>>();
    data.chunks_exact(entry_size)
        .map(|chunk| {
            let rela = unsafe {
                &*(chunk.as_ptr() as *const object::elf::Rela64<object::Endianness>)
            };
            let sym_index = rela.r_sym(endian, false) as usize;
            table
                .as_ref()
                .and_then(|t| t.symbol_by_index(object::SymbolIndex(sym_index)).ok())
                .and_then(|s| s.name().ok())
                .unwrap_or("?")
                .to_string()
        })
        .collect()
}

/// Walk the images currently mapped into this process. The engine's own
/// library and the vdso are not interesting.
fn enumerate_modules() -> Vec<(PathBuf, u64)> {
    struct State {
        out: Vec<(PathBuf, u64)>,
    }

    unsafe extern "C" fn callback(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut libc::c_void,
    ) -> libc::c_int {
        let state = &mut *(data as *mut State);
        let info = &*info;
        let name = if info.dlpi_name.is_null() {
            String::new()
        } else {
            std::ffi::CStr::from_ptr(info.dlpi_name)
                .to_string_lossy()
                .into_owned()
        };
        let path = if name.is_empty() {
            match std::fs::read_link("/proc/self/exe") {
                Ok(p) => p,
                Err(_) => return 0,
            }
        } else {
            PathBuf::from(name)
        };
        let lossy = path.to_string_lossy();
        if lossy.contains("linux-vdso") || lossy.contains("fgtrace_mcount") {
            return 0;
        }
        state.out.push((path, info.dlpi_addr as u64));
        0
    }

    let mut state = State { out: Vec::new() };
    unsafe {
        libc::dl_iterate_phdr(Some(callback), &mut state as *mut State as *mut libc::c_void);
    }
    state.out
}

/// Build an index from bare name/address/size triples, bypassing disk.
#[cfg(test)]
pub(crate) fn index_for_tests(symbols: Vec<(&str, u64, u64)>) -> SymbolIndex {
    let mut index = SymbolIndex::empty();
    index.modules.push(Module {
        path: PathBuf::from("/fake/bin"),
        base: 0,
        build_id: None,
        plt_addr: None,
        got_plt: None,
        sdt_notes: Vec::new(),
    });
    for (name, addr, size) in symbols {
        index.symbols.push(Symbol {
            addr,
            size,
            name: name.to_string(),
            demangled: demangle(name),
            kind: SymKind::Text,
            module: ModuleId(0),
        });
    }
    index.symbols.sort_by_key(|s| s.addr);
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_respects_ranges() {
        let index = index_for_tests(vec![("a", 0x1000, 0x100), ("b", 0x2000, 0x80)]);
        assert_eq!(index.lookup(0x1000).unwrap().name, "a");
        assert_eq!(index.lookup(0x10ff).unwrap().name, "a");
        assert!(index.lookup(0x1100).is_none());
        assert_eq!(index.lookup(0x2001).unwrap().name, "b");
        assert!(index.lookup(0x999).is_none());
    }

    #[test]
    fn demangles_cpp_names() {
        assert_eq!(
            demangle("_ZNK3foo3barEv").as_deref(),
            Some("foo::bar() const")
        );
        assert!(demangle("plain_c_name").is_none());
    }

    #[test]
    fn loads_own_test_binary() {
        // The test runner is a real ELF with symbols; smoke-test the
        // object path end to end.
        let exe = std::fs::read_link("/proc/self/exe").unwrap();
        let mut index = SymbolIndex::empty();
        match index.load_module(&exe, 0) {
            Ok(_) => assert!(!index.is_empty()),
            Err(err) => panic!("cannot parse own binary: {err}"),
        }
    }

    #[test]
    fn symfiles_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_for_tests(vec![("alpha", 0x1000, 0x40), ("beta", 0x1040, 0x40)]);
        index.write_symfiles(dir.path()).unwrap();
        let data = std::fs::read(dir.path().join("bin.sym")).unwrap();
        let entries =
            fgtrace_format::symfile::read_symfile(&mut std::io::Cursor::new(data)).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "alpha");
    }
}
