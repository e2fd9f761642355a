//! ELF image analysis: header facts, program headers, dynamic section
//! entries and versioned symbol tables, extracted from an in-memory
//! image.

use goblin::elf::section_header::{SHF_ALLOC, SHT_NOBITS, SHT_NOTE, SHT_SYMTAB_SHNDX};
use goblin::elf::sym::Sym;
use goblin::elf::Elf;
use thiserror::Error;

pub const ET_DYN: u16 = 3;

const SHN_UNDEF: usize = 0;
const SHN_LORESERVE: usize = 0xff00;
const SHN_XINDEX: usize = 0xffff;

#[derive(Debug, Error)]
pub enum ElfError {
    #[error("ELF error: {0}")]
    Parse(String),
    #[error("bad dynamic symbol {0}")]
    BadDynamicSymbol(usize),
}

impl From<goblin::error::Error> for ElfError {
    fn from(e: goblin::error::Error) -> ElfError {
        ElfError::Parse(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct ProgramHeaderInfo {
    pub p_type: u32,
    pub file_offset: u64,
    pub virt_addr: u64,
    pub phys_addr: u64,
    pub file_size: u64,
    pub memory_size: u64,
    pub align: u64,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
}

#[derive(Debug, Clone)]
pub enum DynamicEntry {
    Needed(String),
    Soname(String),
    Rpath(String),
    Runpath(String),
    Other { tag: u64, value: u64 },
}

#[derive(Debug, Clone)]
pub struct SymbolDefinition {
    pub name: String,
    pub version: Option<String>,
    pub default_version: bool,
    pub sym_type: u8,
    pub binding: u8,
    pub visibility: u8,
    pub section: u16,
    pub xsection: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct SymbolReference {
    pub name: String,
    pub version: Option<String>,
    pub sym_type: u8,
    pub binding: u8,
    pub visibility: u8,
    pub other: u8,
}

#[derive(Debug, Clone)]
pub enum Symbol {
    Definition(SymbolDefinition),
    Reference(SymbolReference),
}

/// Map (EI_CLASS, e_machine) to the architecture tag used in the
/// database. Unknown combinations map to None.
pub fn arch_tag(ei_class: u8, e_machine: u16) -> Option<&'static str> {
    const ELFCLASS32: u8 = 1;
    const ELFCLASS64: u8 = 2;
    let (name_32, name_64): (Option<&str>, Option<&str>) = match e_machine {
        3 => (Some("i386"), None),
        2 => (Some("sparc"), None),
        43 => (None, Some("sparc64")),
        20 => (Some("ppc"), None),
        21 => (None, Some("ppc64")),
        22 => (Some("s390"), Some("s390x")),
        62 => (None, Some("x86_64")),
        40 => (Some("arm"), None),
        183 => (None, Some("aarch64")),
        _ => (None, None),
    };
    match ei_class {
        ELFCLASS32 => name_32,
        ELFCLASS64 => name_64,
        _ => None,
    }
}

/// The implicit soname of a shared object without DT_SONAME is the last
/// path component of its install location.
pub fn soname_from_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

pub struct ElfImage<'a> {
    elf: Elf<'a>,
    data: &'a [u8],
}

impl<'a> ElfImage<'a> {
    pub fn parse(data: &'a [u8]) -> Result<ElfImage<'a>, ElfError> {
        let elf = Elf::parse(data)?;
        Ok(ElfImage { elf, data })
    }

    pub fn ei_class(&self) -> u8 {
        self.elf.header.e_ident[4]
    }

    pub fn ei_data(&self) -> u8 {
        self.elf.header.e_ident[5]
    }

    pub fn e_type(&self) -> u16 {
        self.elf.header.e_type
    }

    pub fn e_machine(&self) -> u16 {
        self.elf.header.e_machine
    }

    pub fn arch(&self) -> Option<&'static str> {
        arch_tag(self.ei_class(), self.e_machine())
    }

    /// PT_INTERP payload; may legitimately be empty.
    pub fn interp(&self) -> Option<&str> {
        self.elf.interpreter
    }

    /// The GNU build-id note. Allocated SHT_NOTE sections are searched
    /// first, then PT_NOTE segments.
    pub fn build_id(&self) -> Option<Vec<u8>> {
        let little_endian = self.ei_data() != 2;
        for shdr in &self.elf.section_headers {
            if shdr.sh_type != SHT_NOTE || shdr.sh_flags & SHF_ALLOC as u64 == 0 {
                continue;
            }
            let start = shdr.sh_offset as usize;
            let Some(end) = start.checked_add(shdr.sh_size as usize) else {
                continue;
            };
            if let Some(raw) = self.data.get(start..end) {
                if let Some(id) = find_build_id(raw, little_endian) {
                    return Some(id);
                }
            }
        }
        for phdr in &self.elf.program_headers {
            if phdr.p_type != goblin::elf::program_header::PT_NOTE {
                continue;
            }
            let start = phdr.p_offset as usize;
            let Some(end) = start.checked_add(phdr.p_filesz as usize) else {
                continue;
            };
            if let Some(raw) = self.data.get(start..end) {
                if let Some(id) = find_build_id(raw, little_endian) {
                    return Some(id);
                }
            }
        }
        None
    }

    pub fn program_headers(&self) -> impl Iterator<Item = ProgramHeaderInfo> + '_ {
        const PF_X: u32 = 1;
        const PF_W: u32 = 2;
        const PF_R: u32 = 4;
        self.elf.program_headers.iter().map(|ph| ProgramHeaderInfo {
            p_type: ph.p_type,
            file_offset: ph.p_offset,
            virt_addr: ph.p_vaddr,
            phys_addr: ph.p_paddr,
            file_size: ph.p_filesz,
            memory_size: ph.p_memsz,
            align: ph.p_align,
            readable: ph.p_flags & PF_R != 0,
            writable: ph.p_flags & PF_W != 0,
            executable: ph.p_flags & PF_X != 0,
        })
    }

    pub fn dynamic_entries(&self) -> impl Iterator<Item = DynamicEntry> + '_ {
        use goblin::elf::dynamic::{DT_NEEDED, DT_RPATH, DT_RUNPATH, DT_SONAME};
        let strtab = &self.elf.dynstrtab;
        self.elf
            .dynamic
            .iter()
            .flat_map(|d| d.dyns.iter())
            .map(move |dyn_entry| {
                let text = || {
                    strtab
                        .get_at(dyn_entry.d_val as usize)
                        .unwrap_or("")
                        .to_string()
                };
                match dyn_entry.d_tag {
                    DT_NEEDED => DynamicEntry::Needed(text()),
                    DT_SONAME => DynamicEntry::Soname(text()),
                    DT_RPATH => DynamicEntry::Rpath(text()),
                    DT_RUNPATH => DynamicEntry::Runpath(text()),
                    tag => DynamicEntry::Other {
                        tag,
                        value: dyn_entry.d_val,
                    },
                }
            })
    }

    /// Walk the dynamic and static symbol tables, resolving GNU symbol
    /// versions for the dynamic one.
    pub fn symbols(&self) -> Result<Vec<Symbol>, ElfError> {
        let mut out = Vec::new();
        let shndx_dynsym = self.symtab_shndx(goblin::elf::section_header::SHT_DYNSYM);
        for (idx, sym) in self.elf.dynsyms.iter().enumerate() {
            let name = self
                .elf
                .dynstrtab
                .get_at(sym.st_name)
                .unwrap_or("")
                .to_string();
            out.push(self.classify(idx, sym, name, true, &shndx_dynsym)?);
        }
        let shndx_symtab = self.symtab_shndx(goblin::elf::section_header::SHT_SYMTAB);
        for (idx, sym) in self.elf.syms.iter().enumerate() {
            let name = self
                .elf
                .strtab
                .get_at(sym.st_name)
                .unwrap_or("")
                .to_string();
            out.push(self.classify(idx, sym, name, false, &shndx_symtab)?);
        }
        Ok(out)
    }

    /// Extended section index table for the symbol table of the given
    /// type, if one is present.
    fn symtab_shndx(&self, symtab_type: u32) -> Vec<u32> {
        let symtab_idx = self
            .elf
            .section_headers
            .iter()
            .position(|s| s.sh_type == symtab_type);
        let symtab_idx = match symtab_idx {
            Some(i) => i,
            None => return Vec::new(),
        };
        for shdr in &self.elf.section_headers {
            if shdr.sh_type == SHT_SYMTAB_SHNDX && shdr.sh_link as usize == symtab_idx {
                let start = shdr.sh_offset as usize;
                let end = start + shdr.sh_size as usize;
                if let Some(raw) = self.data.get(start..end) {
                    let le = self.ei_data() != 2;
                    return raw
                        .chunks_exact(4)
                        .map(|c| {
                            let b = [c[0], c[1], c[2], c[3]];
                            if le {
                                u32::from_le_bytes(b)
                            } else {
                                u32::from_be_bytes(b)
                            }
                        })
                        .collect();
                }
            }
        }
        Vec::new()
    }

    fn section_is_nobits(&self, index: usize) -> bool {
        self.elf
            .section_headers
            .get(index)
            .map(|s| s.sh_type == SHT_NOBITS)
            .unwrap_or(false)
    }

    fn verneed_name(&self, versym: u16) -> Option<String> {
        let verneed = self.elf.verneed.as_ref()?;
        for need in verneed.iter() {
            for aux in need.iter() {
                if aux.vna_other == versym {
                    return Some(
                        self.elf
                            .dynstrtab
                            .get_at(aux.vna_name)
                            .unwrap_or("")
                            .to_string(),
                    );
                }
            }
        }
        None
    }

    fn verdef_name(&self, index: u16) -> Option<String> {
        let verdef = self.elf.verdef.as_ref()?;
        for def in verdef.iter() {
            if def.vd_ndx == index {
                let aux = def.iter().next()?;
                return Some(
                    self.elf
                        .dynstrtab
                        .get_at(aux.vda_name)
                        .unwrap_or("")
                        .to_string(),
                );
            }
        }
        None
    }

    fn classify(
        &self,
        idx: usize,
        sym: Sym,
        name: String,
        dynamic: bool,
        shndx_table: &[u32],
    ) -> Result<Symbol, ElfError> {
        let mut xndx = sym.st_shndx;
        if sym.st_shndx == SHN_XINDEX {
            xndx = shndx_table.get(idx).copied().unwrap_or(0) as usize;
        }
        let mut check_def = xndx != SHN_UNDEF;
        let mut ref_version = None;
        let mut def_version = None;
        let mut default_version = false;

        let versym = if dynamic {
            self.elf
                .versym
                .as_ref()
                .and_then(|v| v.get_at(idx))
                .map(|v| v.vs_val)
        } else {
            None
        };
        if let Some(vs) = versym {
            if vs & 0x8000 != 0 || vs > 1 {
                let is_nobits = if xndx < SHN_LORESERVE || sym.st_shndx == SHN_XINDEX {
                    self.section_is_nobits(xndx)
                } else {
                    false
                };
                if is_nobits || !check_def {
                    match self.verneed_name(vs) {
                        Some(version) => {
                            ref_version = Some(version);
                            check_def = false;
                        }
                        None if !is_nobits => {
                            return Err(ElfError::BadDynamicSymbol(idx));
                        }
                        None => check_def = true,
                    }
                }
                if check_def && vs != 0x8001 {
                    if let Some(version) = self.verdef_name(vs & 0x7fff) {
                        def_version = Some(version);
                    }
                    if vs & 0x8000 != 0 {
                        default_version = true;
                    }
                }
            }
        }

        let sym_type = sym.st_type();
        let binding = sym.st_bind();
        let visibility = sym.st_other & 0x3;
        Ok(if check_def {
            Symbol::Definition(SymbolDefinition {
                name,
                version: def_version.filter(|v| !v.is_empty()),
                default_version,
                sym_type,
                binding,
                visibility,
                section: sym.st_shndx as u16,
                xsection: if sym.st_shndx == SHN_XINDEX {
                    Some(xndx as u32)
                } else {
                    None
                },
            })
        } else {
            Symbol::Reference(SymbolReference {
                name,
                version: ref_version.filter(|v| !v.is_empty()),
                sym_type,
                binding,
                visibility,
                other: sym.st_other,
            })
        })
    }
}

/// Scan a note area for the GNU build-id (type 3) record.
fn find_build_id(mut raw: &[u8], little_endian: bool) -> Option<Vec<u8>> {
    let read_u32 = |b: &[u8]| {
        let arr = [b[0], b[1], b[2], b[3]];
        if little_endian {
            u32::from_le_bytes(arr)
        } else {
            u32::from_be_bytes(arr)
        }
    };
    while raw.len() >= 12 {
        let namesz = read_u32(&raw[0..4]) as usize;
        let descsz = read_u32(&raw[4..8]) as usize;
        let n_type = read_u32(&raw[8..12]);
        let name_end = 12usize.checked_add(namesz)?;
        let desc_start = (name_end + 3) & !3;
        let desc_end = desc_start.checked_add(descsz)?;
        if desc_end > raw.len() {
            return None;
        }
        let name = &raw[12..name_end];
        if n_type == 3 && name == b"GNU\0" {
            return Some(raw[desc_start..desc_end].to_vec());
        }
        let next = (desc_end + 3) & !3;
        if next <= 12 || next > raw.len() {
            return None;
        }
        raw = &raw[next..];
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arch_tags() {
        assert_eq!(arch_tag(1, 3), Some("i386"));
        assert_eq!(arch_tag(2, 62), Some("x86_64"));
        assert_eq!(arch_tag(2, 21), Some("ppc64"));
        assert_eq!(arch_tag(1, 20), Some("ppc"));
        assert_eq!(arch_tag(1, 2), Some("sparc"));
        assert_eq!(arch_tag(2, 43), Some("sparc64"));
        assert_eq!(arch_tag(2, 22), Some("s390x"));
        assert_eq!(arch_tag(1, 22), Some("s390"));
        assert_eq!(arch_tag(1, 40), Some("arm"));
        assert_eq!(arch_tag(2, 183), Some("aarch64"));
        assert_eq!(arch_tag(2, 3), None);
        assert_eq!(arch_tag(1, 0xbeef), None);
    }

    #[test]
    fn test_soname_from_path() {
        assert_eq!(soname_from_path("/usr/lib64/libz.so.1"), "libz.so.1");
        assert_eq!(soname_from_path("libfoo.so"), "libfoo.so");
    }

    #[test]
    fn test_find_build_id() {
        let mut note = Vec::new();
        note.extend_from_slice(&4u32.to_le_bytes()); // namesz
        note.extend_from_slice(&8u32.to_le_bytes()); // descsz
        note.extend_from_slice(&3u32.to_le_bytes()); // NT_GNU_BUILD_ID
        note.extend_from_slice(b"GNU\0");
        note.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(
            find_build_id(&note, true),
            Some(vec![1, 2, 3, 4, 5, 6, 7, 8])
        );
        // An ABI-tag note before the build-id must be skipped.
        let mut stream = Vec::new();
        stream.extend_from_slice(&4u32.to_le_bytes());
        stream.extend_from_slice(&16u32.to_le_bytes());
        stream.extend_from_slice(&1u32.to_le_bytes());
        stream.extend_from_slice(b"GNU\0");
        stream.extend_from_slice(&[0u8; 16]);
        stream.extend_from_slice(&note);
        assert_eq!(
            find_build_id(&stream, true),
            Some(vec![1, 2, 3, 4, 5, 6, 7, 8])
        );
        assert_eq!(find_build_id(&note[..8], true), None);
    }

    #[test]
    fn test_parse_minimal_shared_object() {
        // A handcrafted little-endian ELFCLASS64 header with no program
        // or section headers: enough for the header accessors.
        let mut image = vec![0u8; 64];
        image[..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        image[4] = 2; // ELFCLASS64
        image[5] = 1; // ELFDATA2LSB
        image[6] = 1; // EV_CURRENT
        image[16..18].copy_from_slice(&3u16.to_le_bytes()); // ET_DYN
        image[18..20].copy_from_slice(&62u16.to_le_bytes()); // EM_X86_64
        image[20..24].copy_from_slice(&1u32.to_le_bytes()); // e_version
        image[52..54].copy_from_slice(&64u16.to_le_bytes()); // e_ehsize
        let parsed = ElfImage::parse(&image).unwrap();
        assert_eq!(parsed.e_type(), ET_DYN);
        assert_eq!(parsed.arch(), Some("x86_64"));
        assert!(parsed.build_id().is_none());
        assert!(parsed.symbols().unwrap().is_empty());
        assert_eq!(parsed.dynamic_entries().count(), 0);
    }
}
