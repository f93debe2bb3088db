//! Loader for `state/mem.dmp`.
//!
//! The real Windows crash-dump formats (BMP/Full) pack physical pages as
//! contiguous PFN "runs" with no 1:1 PFN-to-file-offset relationship; parsing
//! that format is an external collaborator (§1). This crate's on-disk stand-in
//! is already the fully-resolved `{aligned-Gpa -> bytes}` map: a flat sequence
//! of `(gpa: u64 LE, bytes: [u8; 4096])` records, which is what a real dump
//! parser would hand back after doing the PFN/run bookkeeping.
//!
//! A dump may optionally be LZ4-compressed (whole-file, prefixed with
//! [`LZ4_MAGIC`]) to keep large snapshots off disk uncompressed; this loader
//! transparently decompresses before parsing records.

use std::io::Read;

use aero_types::{Page, PAGE_SIZE};

use crate::ram::DumpPages;
use crate::SnapshotError;

const RECORD_LEN: usize = 8 + PAGE_SIZE as usize;

/// Marker prefix identifying an LZ4-block-compressed `mem.dmp` (size
/// prepended per `lz4_flex::block::compress_prepend_size`).
const LZ4_MAGIC: &[u8; 4] = b"AEL4";

pub fn parse_mem_dmp(mut reader: impl Read) -> Result<DumpPages, SnapshotError> {
    let mut raw = Vec::new();
    reader.read_to_end(&mut raw)?;

    let body = if raw.starts_with(LZ4_MAGIC) {
        let compressed = &raw[LZ4_MAGIC.len()..];
        tracing::debug!(compressed_bytes = compressed.len(), "decompressing lz4 mem.dmp");
        lz4_flex::block::decompress_size_prepended(compressed)
            .map_err(|e| SnapshotError::MalformedDump { reason: format!("lz4 decompress failed: {e}") })?
    } else {
        raw
    };

    parse_records(&body)
}

fn parse_records(body: &[u8]) -> Result<DumpPages, SnapshotError> {
    if body.len() % RECORD_LEN != 0 {
        return Err(SnapshotError::MalformedDump {
            reason: format!(
                "mem.dmp length {} is not a multiple of the {RECORD_LEN}-byte record size",
                body.len()
            ),
        });
    }

    let mut pages = DumpPages::new();
    for record in body.chunks_exact(RECORD_LEN) {
        let gpa = u64::from_le_bytes(record[0..8].try_into().unwrap());
        if aero_types::offset(gpa) != 0 {
            return Err(SnapshotError::MalformedDump { reason: format!("gpa {gpa:#x} is not page aligned") });
        }

        let mut page: Page = aero_types::zero_page();
        page.copy_from_slice(&record[8..]);
        pages.insert(gpa, page);
    }

    tracing::debug!(pages = pages.len(), "parsed mem.dmp");
    Ok(pages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trips_a_couple_of_pages() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0x1000u64.to_le_bytes());
        buf.extend_from_slice(&[0xaa; PAGE_SIZE as usize]);
        buf.extend_from_slice(&0x3000u64.to_le_bytes());
        buf.extend_from_slice(&[0xbb; PAGE_SIZE as usize]);

        let pages = parse_mem_dmp(Cursor::new(buf)).unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[&0x1000][0], 0xaa);
        assert_eq!(pages[&0x3000][0], 0xbb);
    }

    #[test]
    fn empty_input_yields_no_pages() {
        let pages = parse_mem_dmp(Cursor::new(Vec::new())).unwrap();
        assert!(pages.is_empty());
    }

    #[test]
    fn misaligned_gpa_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0x1001u64.to_le_bytes());
        buf.extend_from_slice(&[0u8; PAGE_SIZE as usize]);
        let err = parse_mem_dmp(Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, SnapshotError::MalformedDump { .. }));
    }

    #[test]
    fn truncated_record_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0x1000u64.to_le_bytes());
        buf.extend_from_slice(&[0u8; PAGE_SIZE as usize / 2]);
        let err = parse_mem_dmp(Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, SnapshotError::MalformedDump { .. }));
    }

    #[test]
    fn lz4_compressed_dump_round_trips() {
        let mut plain = Vec::new();
        plain.extend_from_slice(&0x2000u64.to_le_bytes());
        plain.extend_from_slice(&[0xcc; PAGE_SIZE as usize]);

        let mut compressed = LZ4_MAGIC.to_vec();
        compressed.extend_from_slice(&lz4_flex::block::compress_prepend_size(&plain));

        let pages = parse_mem_dmp(Cursor::new(compressed)).unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[&0x2000][0], 0xcc);
    }
}
