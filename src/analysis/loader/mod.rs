//! Binary Loader Module
//!
//! Parses the ELF files mapped into the target using goblin and builds a
//! process-wide function symbol table:
//! - Load bias of position-independent objects
//! - Function symbols from `.symtab` and `.dynsym`
//! - Address -> `symbol+offset` rendering and name search

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Result};
use goblin::elf::{header, program_header, sym, Elf};
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};

use crate::core::memory::MemoryRegion;

/// Whether a function symbol comes with debug information
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FunctionKind {
    /// Object carries DWARF debug information
    Defined,
    /// Minimal (symbol table only) symbol
    NonDebugging,
}

/// Information about a function found in a mapped object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSymbol {
    /// Symbol name
    pub name: String,
    /// Runtime address (load bias applied)
    pub address: u64,
    /// Size in bytes (0 if unknown)
    pub size: u64,
    pub kind: FunctionKind,
}

/// Parsed ELF object
#[derive(Debug)]
pub struct LoadedBinary {
    /// Original file path
    pub path: String,
    /// Entry point address (unrelocated)
    pub entry_point: u64,
    /// Lowest PT_LOAD virtual address
    pub image_base: u64,
    /// Is this a 64-bit binary?
    pub is_64bit: bool,
    /// Position independent (ET_DYN)?
    pub is_dynamic: bool,
    /// Has a `.debug_info` section?
    pub has_debug_info: bool,
    /// All discovered functions (unrelocated)
    pub functions: Vec<FunctionSymbol>,
}

impl LoadedBinary {
    /// Load and parse a binary file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let data = fs::read(&path)?;
        Self::from_bytes(&data, path_str)
    }

    /// Parse an ELF image from bytes
    pub fn from_bytes(data: &[u8], path: String) -> Result<Self> {
        if data.len() < 4 || data[0..4] != [0x7F, b'E', b'L', b'F'] {
            return Err(anyhow!("{}: not an ELF file", path));
        }
        let elf = Elf::parse(data)?;

        let image_base = elf
            .program_headers
            .iter()
            .filter(|ph| ph.p_type == program_header::PT_LOAD)
            .map(|ph| ph.p_vaddr & !0xfff)
            .min()
            .unwrap_or(0);

        let has_debug_info = elf
            .section_headers
            .iter()
            .any(|sh| elf.shdr_strtab.get_at(sh.sh_name) == Some(".debug_info"));
        let kind = if has_debug_info {
            FunctionKind::Defined
        } else {
            FunctionKind::NonDebugging
        };

        // Static symbols first, dynamic ones fill the gaps
        let mut functions: BTreeMap<(u64, String), FunctionSymbol> = BTreeMap::new();
        let tables = [(&elf.syms, &elf.strtab), (&elf.dynsyms, &elf.dynstrtab)];
        for (symbols, strings) in tables {
            for symbol in symbols.iter() {
                if symbol.st_type() != sym::STT_FUNC || symbol.st_value == 0 {
                    continue;
                }
                let Some(name) = strings.get_at(symbol.st_name) else {
                    continue;
                };
                if name.is_empty() {
                    continue;
                }
                functions
                    .entry((symbol.st_value, name.to_string()))
                    .or_insert_with(|| FunctionSymbol {
                        name: name.to_string(),
                        address: symbol.st_value,
                        size: symbol.st_size,
                        kind,
                    });
            }
        }

        Ok(Self {
            path,
            entry_point: elf.entry,
            image_base,
            is_64bit: elf.is_64,
            is_dynamic: elf.header.e_type == header::ET_DYN,
            has_debug_info,
            functions: functions.into_values().collect(),
        })
    }

    /// Load bias for a mapping of this object starting at `mapped_base`
    pub fn load_bias(&self, mapped_base: u64) -> u64 {
        if self.is_dynamic {
            mapped_base.wrapping_sub(self.image_base)
        } else {
            0
        }
    }

    /// Get summary string
    pub fn summary(&self) -> String {
        format!(
            "{} ELF {}\n\
             Entry: 0x{:x}\n\
             Image Base: 0x{:x}\n\
             Functions: {}{}",
            if self.is_64bit { "64-bit" } else { "32-bit" },
            if self.is_dynamic { "shared object" } else { "executable" },
            self.entry_point,
            self.image_base,
            self.functions.len(),
            if self.has_debug_info { " (with debug info)" } else { "" }
        )
    }
}

/// Process-wide function symbols at runtime addresses
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    /// Sorted by address
    functions: Vec<FunctionSymbol>,
    by_name: HashMap<String, u64>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from already relocated symbols
    pub fn from_symbols(symbols: Vec<FunctionSymbol>) -> Self {
        let mut table = Self::new();
        table.extend(symbols);
        table
    }

    /// Load every ELF object backing a region of the process map.
    /// Objects that cannot be read are skipped.
    pub fn load_process(regions: &[MemoryRegion]) -> Self {
        let mut bases: BTreeMap<&str, u64> = BTreeMap::new();
        for region in regions {
            if !region.backing_path.starts_with('/') || region.offset != 0 {
                continue;
            }
            bases
                .entry(region.backing_path.as_str())
                .and_modify(|base| *base = (*base).min(region.start))
                .or_insert(region.start);
        }

        let mut table = Self::new();
        for (path, base) in bases {
            match LoadedBinary::from_file(path) {
                Ok(binary) => {
                    let bias = binary.load_bias(base);
                    log::debug!(
                        "Loaded {} functions from {} (bias {:#x})",
                        binary.functions.len(),
                        path,
                        bias
                    );
                    table.extend(binary.functions.into_iter().map(|mut f| {
                        f.address = f.address.wrapping_add(bias);
                        f
                    }));
                }
                Err(e) => log::debug!("Skipping symbols of {}: {}", path, e),
            }
        }
        log::info!("Symbol table holds {} functions", table.len());
        table
    }

    fn extend(&mut self, symbols: impl IntoIterator<Item = FunctionSymbol>) {
        for symbol in symbols {
            self.by_name
                .entry(symbol.name.clone())
                .or_insert(symbol.address);
            self.functions.push(symbol);
        }
        self.functions.sort_by_key(|f| f.address);
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Address of a function by exact name
    pub fn lookup(&self, name: &str) -> Option<u64> {
        self.by_name.get(name).copied()
    }

    /// Function containing `address` and the offset into it
    pub fn resolve(&self, address: u64) -> Option<(&FunctionSymbol, u64)> {
        let index = self.functions.partition_point(|f| f.address <= address);
        let candidate = self.functions[..index].iter().rev().find(|f| {
            f.address == address || (f.size > 0 && address < f.address.saturating_add(f.size))
        })?;
        Some((candidate, address - candidate.address))
    }

    /// `name+offset` (or `name`) for an address inside a known function
    pub fn symbolize(&self, address: u64) -> Option<String> {
        self.resolve(address).map(|(f, offset)| {
            if offset == 0 {
                f.name.clone()
            } else {
                format!("{}+{}", f.name, offset)
            }
        })
    }

    /// `0x401004 <main+4>`, or just the address when unknown
    pub fn describe(&self, address: u64) -> String {
        match self.symbolize(address) {
            Some(symbol) => format!("{:#x} <{}>", address, symbol),
            None => format!("{:#x}", address),
        }
    }

    /// Functions whose name matches the regular expression `pattern`.
    /// Defined functions come first, each group ordered by address.
    pub fn search(&self, pattern: &str, case_sensitive: bool) -> Result<Vec<FunctionSymbol>, regex::Error> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(!case_sensitive)
            .build()?;
        let mut found: Vec<FunctionSymbol> = self
            .functions
            .iter()
            .filter(|f| regex.is_match(&f.name))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.kind.cmp(&b.kind).then(a.address.cmp(&b.address)));
        Ok(found)
    }
}
