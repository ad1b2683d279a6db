//! Hand-built PE images for tests.
//!
//! Shared by the unit tests and the `tests/` suites so there is one layout
//! to keep in sync with the header offsets below.

/// File offset of `AddressOfEntryPoint` in [`synthetic_pe`].
pub const ENTRY_POINT_OFFSET: usize = 0xa8;
/// File offset of the data directory table in [`synthetic_pe`].
pub const DATA_DIRECTORY_TABLE_OFFSET: usize = 0xf8;

fn put16(buf: &mut [u8], at: usize, v: u16) {
    buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

fn put32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

/// A minimal PE32 console executable: DOS header, empty stub, COFF and
/// optional headers, one `.text` section (RVA 0x1000, file offset 0x200)
/// starting with `ret`. `payload` follows the `ret` and is cut to fit the
/// section. The image is 0x400 bytes.
pub fn synthetic_pe(payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; 0x400];
    buf[0..2].copy_from_slice(b"MZ");
    put32(&mut buf, 0x3c, 0x80);

    buf[0x80..0x84].copy_from_slice(b"PE\0\0");
    // COFF header
    put16(&mut buf, 0x84, 0x014c);
    put16(&mut buf, 0x86, 1);
    put32(&mut buf, 0x88, 0x5f00_0000);
    put16(&mut buf, 0x94, 0xe0);
    put16(&mut buf, 0x96, 0x0102);
    // optional header, standard fields
    put16(&mut buf, 0x98, 0x10b);
    buf[0x9a] = 14;
    put32(&mut buf, 0x9c, 0x200);
    put32(&mut buf, ENTRY_POINT_OFFSET, 0x1000);
    put32(&mut buf, 0xac, 0x1000);
    // windows fields
    put32(&mut buf, 0xb4, 0x40_0000);
    put32(&mut buf, 0xb8, 0x1000);
    put32(&mut buf, 0xbc, 0x200);
    put16(&mut buf, 0xc0, 6);
    put16(&mut buf, 0xc8, 6);
    put32(&mut buf, 0xd0, 0x2000);
    put32(&mut buf, 0xd4, 0x200);
    put16(&mut buf, 0xdc, 3);
    put16(&mut buf, 0xde, 0x8140);
    put32(&mut buf, 0xe0, 0x10_0000);
    put32(&mut buf, 0xe4, 0x1000);
    put32(&mut buf, 0xe8, 0x10_0000);
    put32(&mut buf, 0xec, 0x1000);
    put32(&mut buf, 0xf4, 16);
    // section table
    buf[0x178..0x17d].copy_from_slice(b".text");
    put32(&mut buf, 0x180, 0x200);
    put32(&mut buf, 0x184, 0x1000);
    put32(&mut buf, 0x188, 0x200);
    put32(&mut buf, 0x18c, 0x200);
    put32(&mut buf, 0x19c, 0x6000_0020);
    // section data
    buf[0x200] = 0xc3;
    let n = payload.len().min(0x1ff);
    buf[0x201..0x201 + n].copy_from_slice(&payload[..n]);
    buf
}

/// Overwrite data directory `index` of a [`synthetic_pe`] image.
pub fn set_data_directory(pe: &mut [u8], index: usize, rva: u32, size: u32) {
    let at = DATA_DIRECTORY_TABLE_OFFSET + index * 8;
    put32(pe, at, rva);
    put32(pe, at + 4, size);
}

/// Overwrite `AddressOfEntryPoint` of a [`synthetic_pe`] image.
pub fn set_entry_point(pe: &mut [u8], rva: u32) {
    put32(pe, ENTRY_POINT_OFFSET, rva);
}
