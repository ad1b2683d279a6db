//! PE structural features: general info, headers, sections, imports, exports,
//! data directories.
//!
//! Flag and enum names follow the LIEF spellings the model was trained on
//! (`EXECUTABLE_IMAGE`, `MEM_EXECUTE`, `WINDOWS_GUI`, ...); they are hashed,
//! so a renamed flag silently moves to a different bucket.

use std::collections::BTreeMap;

use goblin::pe::options::ParseOptions;
use goblin::pe::section_table::SectionTable;
use goblin::pe::PE;

use super::bytes::shannon_entropy;
use super::hashing::FeatureHasher;

pub const GENERAL_DIM: usize = 10;
pub const HEADER_DIM: usize = 62;
pub const SECTION_DIM: usize = 255;
pub const IMPORTS_DIM: usize = 1280;
pub const EXPORTS_DIM: usize = 128;
pub const DATA_DIRECTORIES_DIM: usize = 30;

/// Data directories in optional-header order (the CLR header is the 15th).
const NUM_DATA_DIRECTORIES: usize = 15;

const DIR_EXPORT: usize = 0;
const DIR_IMPORT: usize = 1;
const DIR_RESOURCE: usize = 2;
const DIR_EXCEPTION: usize = 3;
const DIR_CERTIFICATE: usize = 4;
const DIR_BASE_RELOCATION: usize = 5;
const DIR_DEBUG: usize = 6;
const DIR_TLS: usize = 9;

/// Longest import/export name kept before hashing.
const MAX_SYMBOL_NAME: usize = 10_000;

// ---------------------------------------------------------------------------
// Name tables
// ---------------------------------------------------------------------------

const COFF_CHARACTERISTICS: &[(u16, &str)] = &[
    (0x0001, "RELOCS_STRIPPED"),
    (0x0002, "EXECUTABLE_IMAGE"),
    (0x0004, "LINE_NUMS_STRIPPED"),
    (0x0008, "LOCAL_SYMS_STRIPPED"),
    (0x0010, "AGGRESSIVE_WS_TRIM"),
    (0x0020, "LARGE_ADDRESS_AWARE"),
    (0x0080, "BYTES_REVERSED_LO"),
    (0x0100, "CHARA_32BIT_MACHINE"),
    (0x0200, "DEBUG_STRIPPED"),
    (0x0400, "REMOVABLE_RUN_FROM_SWAP"),
    (0x0800, "NET_RUN_FROM_SWAP"),
    (0x1000, "SYSTEM"),
    (0x2000, "DLL"),
    (0x4000, "UP_SYSTEM_ONLY"),
    (0x8000, "BYTES_REVERSED_HI"),
];

const DLL_CHARACTERISTICS: &[(u16, &str)] = &[
    (0x0020, "HIGH_ENTROPY_VA"),
    (0x0040, "DYNAMIC_BASE"),
    (0x0080, "FORCE_INTEGRITY"),
    (0x0100, "NX_COMPAT"),
    (0x0200, "NO_ISOLATION"),
    (0x0400, "NO_SEH"),
    (0x0800, "NO_BIND"),
    (0x1000, "APPCONTAINER"),
    (0x2000, "WDM_DRIVER"),
    (0x4000, "GUARD_CF"),
    (0x8000, "TERMINAL_SERVER_AWARE"),
];

const SECTION_CHARACTERISTICS: &[(u32, &str)] = &[
    (0x0000_0008, "TYPE_NO_PAD"),
    (0x0000_0020, "CNT_CODE"),
    (0x0000_0040, "CNT_INITIALIZED_DATA"),
    (0x0000_0080, "CNT_UNINITIALIZED_DATA"),
    (0x0000_0100, "LNK_OTHER"),
    (0x0000_0200, "LNK_INFO"),
    (0x0000_0800, "LNK_REMOVE"),
    (0x0000_1000, "LNK_COMDAT"),
    (0x0000_8000, "GPREL"),
    (0x0002_0000, "MEM_PURGEABLE"),
    (0x0004_0000, "MEM_LOCKED"),
    (0x0008_0000, "MEM_PRELOAD"),
    (0x0100_0000, "LNK_NRELOC_OVFL"),
    (0x0200_0000, "MEM_DISCARDABLE"),
    (0x0400_0000, "MEM_NOT_CACHED"),
    (0x0800_0000, "MEM_NOT_PAGED"),
    (0x1000_0000, "MEM_SHARED"),
    (0x2000_0000, "MEM_EXECUTE"),
    (0x4000_0000, "MEM_READ"),
    (0x8000_0000, "MEM_WRITE"),
];

/// Section alignment is a 4-bit field, not a flag set.
const SECTION_ALIGN_MASK: u32 = 0x00f0_0000;

fn machine_name(machine: u16) -> &'static str {
    match machine {
        0x014c => "I386",
        0x8664 => "AMD64",
        0x01c0 => "ARM",
        0x01c2 => "THUMB",
        0x01c4 => "ARMNT",
        0xaa64 => "ARM64",
        0x0200 => "IA64",
        0x0166 => "R4000",
        0x01f0 => "POWERPC",
        0x01f1 => "POWERPCFP",
        0x0ebc => "EBC",
        0x9041 => "M32R",
        0x01a2 => "SH3",
        0x01a6 => "SH4",
        0x0284 => "ALPHA64",
        _ => "UNKNOWN",
    }
}

fn subsystem_name(subsystem: u16) -> &'static str {
    match subsystem {
        1 => "NATIVE",
        2 => "WINDOWS_GUI",
        3 => "WINDOWS_CUI",
        5 => "OS2_CUI",
        7 => "POSIX_CUI",
        8 => "NATIVE_WINDOWS",
        9 => "WINDOWS_CE_GUI",
        10 => "EFI_APPLICATION",
        11 => "EFI_BOOT_SERVICE_DRIVER",
        12 => "EFI_RUNTIME_DRIVER",
        13 => "EFI_ROM",
        14 => "XBOX",
        16 => "WINDOWS_BOOT_APPLICATION",
        _ => "UNKNOWN",
    }
}

fn magic_name(magic: u16) -> &'static str {
    match magic {
        0x10b => "PE32",
        0x20b => "PE32_PLUS",
        _ => "UNKNOWN",
    }
}

fn flag_names<T>(value: T, table: &[(T, &'static str)]) -> Vec<&'static str>
where
    T: Copy + std::ops::BitAnd<Output = T> + PartialEq + Default,
{
    table
        .iter()
        .filter(|(bit, _)| value & *bit != T::default())
        .map(|(_, name)| *name)
        .collect()
}

fn section_props(characteristics: u32) -> Vec<&'static str> {
    let mut props = flag_names(characteristics, SECTION_CHARACTERISTICS);
    let align = (characteristics & SECTION_ALIGN_MASK) >> 20;
    if align > 0 && align <= 14 {
        const ALIGN_NAMES: [&str; 14] = [
            "ALIGN_1BYTES",
            "ALIGN_2BYTES",
            "ALIGN_4BYTES",
            "ALIGN_8BYTES",
            "ALIGN_16BYTES",
            "ALIGN_32BYTES",
            "ALIGN_64BYTES",
            "ALIGN_128BYTES",
            "ALIGN_256BYTES",
            "ALIGN_512BYTES",
            "ALIGN_1024BYTES",
            "ALIGN_2048BYTES",
            "ALIGN_4096BYTES",
            "ALIGN_8192BYTES",
        ];
        props.push(ALIGN_NAMES[align as usize - 1]);
    }
    props
}

// ---------------------------------------------------------------------------
// Data directories
// ---------------------------------------------------------------------------

/// Directories dropped, stage by stage, when goblin rejects the image.
///
/// goblin resolves these eagerly and fails the whole parse when one points
/// outside every section. The first stage only drops tables no feature reads;
/// the second also gives up imports and exports to salvage the rest.
const LENIENT_STAGES: &[&[usize]] = &[
    &[DIR_DEBUG, DIR_EXCEPTION],
    &[DIR_DEBUG, DIR_EXCEPTION, DIR_IMPORT, DIR_EXPORT],
];

/// Parse without attribute certificates; no feature reads them and a
/// certificate table running past EOF is common in truncated samples.
pub fn parse(bytes: &[u8]) -> goblin::error::Result<PE<'_>> {
    let mut opts = ParseOptions::default();
    opts.parse_attribute_certificates = false;
    PE::parse_with_opts(bytes, &opts)
}

/// [`parse`], retrying on a copy with unmappable directories zeroed.
///
/// The copy lives in `scratch`. Byte-level features and [`data_directories`]
/// still read the original bytes, so `has_debug` and friends are unaffected.
/// On failure the error of the unmodified parse is returned.
pub fn parse_lenient<'a>(
    bytes: &'a [u8],
    scratch: &'a mut Vec<u8>,
) -> goblin::error::Result<PE<'a>> {
    let err = match parse(bytes) {
        Ok(pe) => return Ok(pe),
        Err(err) => err,
    };
    for stage in LENIENT_STAGES {
        let candidate = without_directories(bytes, stage);
        if parse(&candidate).is_ok() {
            tracing::debug!(
                error = %err,
                dropped = ?stage,
                "parsed with data directories dropped"
            );
            *scratch = candidate;
            let salvaged: &'a [u8] = scratch;
            return parse(salvaged);
        }
    }
    Err(err)
}

/// Copy of `bytes` with the given data directory entries zeroed.
pub fn without_directories(bytes: &[u8], indices: &[usize]) -> Vec<u8> {
    let mut copy = bytes.to_vec();
    if let Some((table, count)) = directory_table(bytes) {
        for &i in indices.iter().filter(|&&i| i < count) {
            let at = table + i * 8;
            if let Some(entry) = copy.get_mut(at..at + 8) {
                entry.fill(0);
            }
        }
    }
    copy
}

/// File offset of the data directory table and its entry count (capped at
/// 15), or `None` when the headers do not reach it.
fn directory_table(bytes: &[u8]) -> Option<(usize, usize)> {
    let pe_offset = read_u32(bytes, 0x3c)? as usize;
    // signature (4) + COFF header (20)
    let optional_offset = pe_offset.checked_add(24)?;
    if read_u16(bytes, pe_offset.checked_add(20)?)? == 0 {
        return None;
    }
    let (count_at, table_at) = match read_u16(bytes, optional_offset)? {
        0x20b => (108, 112),
        _ => (92, 96),
    };
    let count = read_u32(bytes, optional_offset + count_at)? as usize;
    Some((optional_offset + table_at, count.min(NUM_DATA_DIRECTORIES)))
}

/// `(size, virtual_address)` of the first 15 data directories, read straight
/// from the optional header. Entries beyond `NumberOfRvaAndSizes` or past the
/// end of the file are zero.
pub fn data_directories(bytes: &[u8]) -> [(u32, u32); NUM_DATA_DIRECTORIES] {
    let mut dirs = [(0u32, 0u32); NUM_DATA_DIRECTORIES];
    let Some((table, count)) = directory_table(bytes) else {
        return dirs;
    };

    for (i, dir) in dirs.iter_mut().enumerate().take(count) {
        let at = table + i * 8;
        let (Some(rva), Some(size)) = (read_u32(bytes, at), read_u32(bytes, at + 4)) else {
            break;
        };
        *dir = (size, rva);
    }
    dirs
}

fn read_u16(bytes: &[u8], at: usize) -> Option<u16> {
    let slice = bytes.get(at..at.checked_add(2)?)?;
    Some(u16::from_le_bytes([slice[0], slice[1]]))
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let slice = bytes.get(at..at.checked_add(4)?)?;
    Some(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

fn present(dir: (u32, u32)) -> bool {
    dir.1 != 0
}

// ---------------------------------------------------------------------------
// Feature blocks
// ---------------------------------------------------------------------------

/// size, vsize, has_debug, exports, imports, has_relocations, has_resources,
/// has_signature, has_tls, symbols.
pub fn general_info(pe: &PE, bytes: &[u8], dirs: &[(u32, u32)]) -> Vec<f64> {
    let vsize = pe
        .header
        .optional_header
        .as_ref()
        .map(|o| o.windows_fields.size_of_image as f64)
        .unwrap_or(0.0);
    let flag = |present: bool| if present { 1.0 } else { 0.0 };

    vec![
        bytes.len() as f64,
        vsize,
        flag(present(dirs[DIR_DEBUG])),
        pe.exports.len() as f64,
        pe.imports.len() as f64,
        flag(present(dirs[DIR_BASE_RELOCATION])),
        flag(present(dirs[DIR_RESOURCE])),
        flag(present(dirs[DIR_CERTIFICATE])),
        flag(present(dirs[DIR_TLS])),
        pe.header.coff_header.number_of_symbol_table as f64,
    ]
}

/// COFF and optional header fields, enum/flag names hashed into 10 buckets each.
pub fn header_info(pe: &PE) -> Vec<f64> {
    let hasher = FeatureHasher::new(10);
    let coff = &pe.header.coff_header;

    let mut out = Vec::with_capacity(HEADER_DIM);
    out.push(coff.time_date_stamp as f64);
    out.extend(hasher.hash_strings([machine_name(coff.machine)]));
    out.extend(hasher.hash_strings(flag_names(coff.characteristics, COFF_CHARACTERISTICS)));

    match pe.header.optional_header.as_ref() {
        Some(optional) => {
            let standard = &optional.standard_fields;
            let win = &optional.windows_fields;
            out.extend(hasher.hash_strings([subsystem_name(win.subsystem)]));
            out.extend(hasher.hash_strings(flag_names(
                win.dll_characteristics,
                DLL_CHARACTERISTICS,
            )));
            out.extend(hasher.hash_strings([magic_name(standard.magic)]));
            out.extend([
                win.major_image_version as f64,
                win.minor_image_version as f64,
                standard.major_linker_version as f64,
                standard.minor_linker_version as f64,
                win.major_operating_system_version as f64,
                win.minor_operating_system_version as f64,
                win.major_subsystem_version as f64,
                win.minor_subsystem_version as f64,
                standard.size_of_code as f64,
                win.size_of_headers as f64,
                win.size_of_heap_commit as f64,
            ]);
        }
        None => {
            out.extend(hasher.hash_strings([""]));
            out.extend(vec![0.0; 10]);
            out.extend(hasher.hash_strings([""]));
            out.extend(vec![0.0; 11]);
        }
    }
    out
}

struct SectionSummary<'a> {
    name: String,
    size: u32,
    vsize: u32,
    entropy: f64,
    props: Vec<&'static str>,
    table: &'a SectionTable,
}

fn summarize_sections<'a>(pe: &'a PE, bytes: &[u8]) -> Vec<SectionSummary<'a>> {
    pe.sections
        .iter()
        .map(|s| {
            let start = s.pointer_to_raw_data as usize;
            let end = start.saturating_add(s.size_of_raw_data as usize).min(bytes.len());
            let content = bytes.get(start..end).unwrap_or(&[]);
            SectionSummary {
                name: s.name().map(str::to_string).unwrap_or_default(),
                size: s.size_of_raw_data,
                vsize: s.virtual_size,
                entropy: shannon_entropy(content),
                props: section_props(s.characteristics),
                table: s,
            }
        })
        .collect()
}

/// Name of the section whose virtual range holds the entry point. Packed
/// samples often point outside every section; then the first executable
/// section stands in, and "" when there is none.
fn entry_section_name(pe: &PE, sections: &[SectionSummary]) -> String {
    let entry = pe.entry as u64;
    sections
        .iter()
        .find(|s| {
            let start = s.table.virtual_address as u64;
            let span = s.table.virtual_size.max(s.table.size_of_raw_data) as u64;
            entry >= start && entry < start + span
        })
        .or_else(|| sections.iter().find(|s| s.props.contains(&"MEM_EXECUTE")))
        .map(|s| s.name.clone())
        .unwrap_or_default()
}

/// Section counts plus hashed per-section size, entropy, virtual size, entry
/// section name and entry section characteristics (50 buckets each).
pub fn section_info(pe: &PE, bytes: &[u8]) -> Vec<f64> {
    let sections = summarize_sections(pe, bytes);
    let entry = entry_section_name(pe, &sections);
    let hasher = FeatureHasher::new(50);

    let has = |s: &SectionSummary, prop: &str| s.props.contains(&prop);

    let mut out = Vec::with_capacity(SECTION_DIM);
    out.push(sections.len() as f64);
    out.push(sections.iter().filter(|s| s.size == 0).count() as f64);
    out.push(sections.iter().filter(|s| s.name.is_empty()).count() as f64);
    out.push(
        sections
            .iter()
            .filter(|s| has(s, "MEM_READ") && has(s, "MEM_EXECUTE"))
            .count() as f64,
    );
    out.push(sections.iter().filter(|s| has(s, "MEM_WRITE")).count() as f64);

    out.extend(hasher.hash_pairs(sections.iter().map(|s| (s.name.as_str(), s.size as f64))));
    out.extend(hasher.hash_pairs(sections.iter().map(|s| (s.name.as_str(), s.entropy))));
    out.extend(hasher.hash_pairs(sections.iter().map(|s| (s.name.as_str(), s.vsize as f64))));
    out.extend(hasher.hash_strings([entry.as_str()]));

    let entry_props = sections
        .iter()
        .filter(|s| s.name == entry)
        .flat_map(|s| s.props.iter().copied());
    out.extend(hasher.hash_strings(entry_props));
    out
}

/// Imported functions grouped by library, ordinal imports spelled `ordinalN`.
pub fn import_table(pe: &PE) -> BTreeMap<String, Vec<String>> {
    let mut table: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for import in &pe.imports {
        let name = if import.name.starts_with("ORDINAL ") {
            format!("ordinal{}", import.ordinal)
        } else {
            truncate(&import.name, MAX_SYMBOL_NAME).to_string()
        };
        table.entry(import.dll.to_string()).or_default().push(name);
    }
    table
}

/// Hashed lowercase library names (256) and `library:function` pairs (1024).
pub fn imports_info(pe: &PE) -> Vec<f64> {
    let table = import_table(pe);

    let mut libraries: Vec<String> = table.keys().map(|l| l.to_lowercase()).collect();
    libraries.sort();
    libraries.dedup();

    let functions = table.iter().flat_map(|(lib, names)| {
        let lib = lib.to_lowercase();
        names.iter().map(move |n| format!("{lib}:{n}"))
    });

    let mut out = Vec::with_capacity(IMPORTS_DIM);
    out.extend(FeatureHasher::new(256).hash_strings(&libraries));
    out.extend(FeatureHasher::new(1024).hash_strings(functions));
    out
}

/// Hashed export names (128).
pub fn exports_info(pe: &PE) -> Vec<f64> {
    FeatureHasher::new(EXPORTS_DIM).hash_strings(
        pe.exports
            .iter()
            .map(|e| truncate(e.name.unwrap_or(""), MAX_SYMBOL_NAME)),
    )
}

/// Interleaved `(size, virtual_address)` for the 15 data directories.
pub fn data_directories_info(dirs: &[(u32, u32)]) -> Vec<f64> {
    dirs.iter()
        .flat_map(|&(size, rva)| [size as f64, rva as f64])
        .collect()
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
