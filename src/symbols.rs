use std::collections::HashMap;
use std::collections::HashSet;
use std::fs::File;

use anyhow::anyhow;
use anyhow::Result;
use memmap2::Mmap;
use object::elf::FileHeader32;
use object::elf::FileHeader64;
use object::elf::PF_X;
use object::elf::PT_LOAD;
use object::read::elf::FileHeader;
use object::read::elf::ProgramHeader;
use object::Endianness;
use object::FileKind;
use object::Object;
use object::ObjectSymbol;

/// Executable load segments, for translating symbol virtual addresses to
/// file offsets.
#[derive(Debug, Clone)]
struct ElfLoad {
    p_offset: u64,
    p_vaddr: u64,
    p_memsz: u64,
}

/// Resolves symbol names to file offsets, the form uprobe attachment wants.
///
/// Dynamic symbols take precedence over the full symbol table. Symbols with
/// a zero value or size are skipped, those are usually undefined imports. A
/// requested name that is missing, or whose address falls outside every
/// executable load segment, is omitted from the result.
pub fn symbol_file_offsets(file: &File, names: &[&str]) -> Result<HashMap<String, u64>> {
    let mmap = unsafe { Mmap::map(file) }?;
    let data = &*mmap;
    let object = object::File::parse(data)?;

    let mut to_find: HashSet<&str> = names.iter().copied().collect();
    let mut found: HashMap<String, u64> = HashMap::new();

    scan_symbols(object.dynamic_symbols(), &mut to_find, &mut found);
    if !to_find.is_empty() {
        scan_symbols(object.symbols(), &mut to_find, &mut found);
    }

    let loads = elf_load_segments(data)?;
    let mut offsets = HashMap::with_capacity(found.len());
    for (name, vaddr) in found {
        let load = loads
            .iter()
            .find(|load| load.p_vaddr <= vaddr && vaddr < load.p_vaddr + load.p_memsz);
        if let Some(load) = load {
            offsets.insert(name, vaddr - load.p_vaddr + load.p_offset);
        }
    }
    Ok(offsets)
}

fn scan_symbols<'data, I>(
    symbols: I,
    to_find: &mut HashSet<&str>,
    found: &mut HashMap<String, u64>,
) where
    I: Iterator,
    I::Item: ObjectSymbol<'data>,
{
    for symbol in symbols {
        if symbol.size() == 0 || symbol.address() == 0 {
            continue;
        }
        let Ok(name) = symbol.name() else {
            continue;
        };
        if to_find.remove(name) {
            found.insert(name.to_string(), symbol.address());
            if to_find.is_empty() {
                return;
            }
        }
    }
}

fn elf_load_segments(data: &[u8]) -> Result<Vec<ElfLoad>> {
    match FileKind::parse(data) {
        Ok(FileKind::Elf32) => {
            let header: &FileHeader32<Endianness> = FileHeader32::<Endianness>::parse(data)?;
            let endian = header.endian()?;
            let segments = header.program_headers(endian, data)?;

            let mut elf_loads = Vec::new();
            for segment in segments {
                if segment.p_type(endian) != PT_LOAD || segment.p_flags(endian) & PF_X == 0 {
                    continue;
                }
                elf_loads.push(ElfLoad {
                    p_offset: segment.p_offset(endian) as u64,
                    p_vaddr: segment.p_vaddr(endian) as u64,
                    p_memsz: segment.p_memsz(endian) as u64,
                });
            }
            Ok(elf_loads)
        }
        Ok(FileKind::Elf64) => {
            let header: &FileHeader64<Endianness> = FileHeader64::<Endianness>::parse(data)?;
            let endian = header.endian()?;
            let segments = header.program_headers(endian, data)?;

            let mut elf_loads = Vec::new();
            for segment in segments {
                if segment.p_type(endian) != PT_LOAD || segment.p_flags(endian) & PF_X == 0 {
                    continue;
                }
                elf_loads.push(ElfLoad {
                    p_offset: segment.p_offset(endian),
                    p_vaddr: segment.p_vaddr(endian),
                    p_memsz: segment.p_memsz(endian),
                });
            }
            Ok(elf_loads)
        }
        Ok(other_file_kind) => Err(anyhow!(
            "object is not a 32 or 64 bits ELF but {:?}",
            other_file_kind
        )),
        Err(e) => Err(anyhow!("FileKind failed with {:?}", e)),
    }
}
