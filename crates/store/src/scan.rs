//! Open-time recovery scan.
//!
//! The scan walks the file from byte 0 hunting for the block magic. Each
//! candidate must survive the full gauntlet (header CRC32, plausible
//! lengths, trailer CRC64) before it is indexed; anything else advances
//! the cursor one byte and resumes the hunt. Corrupt regions and a
//! partially-written final block therefore cost index entries, never the
//! file. A magic that happens to appear inside a previous block's payload
//! is harmless: that candidate's trailer checksum cannot hold.

use crate::{
    block::{trailer_checksum, BlockHeader, BLOCK_MAGIC, HEADER_WITH_CHECKSUM_LEN, MIN_BLOCK_LEN,
            TRAILER_LEN},
    store::BlockLocation,
    StoreResult,
};
use emdb_types::BlockType;
use std::{fs::File, os::unix::fs::FileExt};
use tracing::{debug, warn};

/// Read granularity for the magic hunt and checksum verification.
const CHUNK: usize = 64 * 1024;

/// One block that survived the scan gauntlet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScannedBlock {
    /// Block id from the validated header.
    pub block_id: i64,
    /// Block type from the validated header.
    pub block_type: BlockType,
    /// Creator timestamp from the validated header.
    pub timestamp: i64,
    /// Where the block lives.
    pub location: BlockLocation,
}

/// Result of scanning a file.
#[derive(Debug, Default, Clone)]
pub struct ScanReport {
    /// Valid blocks in file order. A block id appearing twice keeps both
    /// entries; callers index later-offset-wins.
    pub blocks: Vec<ScannedBlock>,
    /// Candidate headers rejected by a checksum or length check.
    pub rejected_candidates: u64,
    /// Total bytes examined.
    pub bytes_scanned: u64,
}

/// Scans `len` bytes of `file` and returns every valid block.
pub fn scan_file(file: &File, len: u64) -> StoreResult<ScanReport> {
    let mut report = ScanReport { bytes_scanned: len, ..Default::default() };
    let mut pos = 0u64;

    while pos + (MIN_BLOCK_LEN as u64) <= len {
        let Some(candidate) = find_magic(file, pos, len)? else {
            break;
        };
        if candidate + (MIN_BLOCK_LEN as u64) > len {
            break;
        }

        match try_parse_block(file, candidate, len) {
            Ok(scanned) => {
                pos = candidate + scanned.location.len;
                report.blocks.push(scanned);
            }
            Err(reject) => {
                debug!(target: "emdb::store", offset = candidate, %reject, "rejected scan candidate");
                report.rejected_candidates += 1;
                pos = candidate + 1;
            }
        }
    }

    if report.rejected_candidates > 0 {
        warn!(
            target: "emdb::store",
            rejected = report.rejected_candidates,
            indexed = report.blocks.len(),
            "scan skipped unparseable regions"
        );
    }
    Ok(report)
}

/// Why a candidate offset was not a block. Internal to the scan; callers
/// only ever see the aggregate report.
#[derive(Debug, thiserror::Error)]
enum Reject {
    #[error("{0}")]
    BadHeader(String),
    #[error("block extends past end of file")]
    Truncated,
    #[error("trailer checksum mismatch")]
    BadTrailer,
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

fn try_parse_block(file: &File, offset: u64, len: u64) -> Result<ScannedBlock, Reject> {
    let mut head = [0u8; HEADER_WITH_CHECKSUM_LEN];
    file.read_exact_at(&mut head, offset)?;
    let header = BlockHeader::decode(&head).map_err(|e| Reject::BadHeader(e.to_string()))?;

    let block_len = header.block_len();
    let end = offset.checked_add(block_len).ok_or(Reject::Truncated)?;
    if end > len {
        return Err(Reject::Truncated);
    }

    // CRC64 over header + extended header + payload, streamed in chunks.
    let mut digest = crc64_digest();
    digest.update(&head);
    let mut remaining = block_len - HEADER_WITH_CHECKSUM_LEN as u64 - TRAILER_LEN as u64;
    let mut at = offset + HEADER_WITH_CHECKSUM_LEN as u64;
    let mut buf = vec![0u8; CHUNK];
    while remaining > 0 {
        let take = remaining.min(CHUNK as u64) as usize;
        file.read_exact_at(&mut buf[..take], at)?;
        digest.update(&buf[..take]);
        at += take as u64;
        remaining -= take as u64;
    }

    let mut trailer = [0u8; TRAILER_LEN];
    file.read_exact_at(&mut trailer, end - TRAILER_LEN as u64)?;
    if u64::from_be_bytes(trailer) != digest.finalize() {
        return Err(Reject::BadTrailer);
    }

    Ok(ScannedBlock {
        block_id: header.block_id,
        block_type: header.block_type,
        timestamp: header.timestamp,
        location: BlockLocation { offset, len: block_len },
    })
}

// The digest type of the `crc` crate is generic and unnameable without
// repeating the algorithm constant, so wrap construction.
struct Crc64Digest(crc::Digest<'static, u64>);

static CRC64: crc::Crc<u64> = crc::Crc::<u64>::new(&crc::CRC_64_XZ);

fn crc64_digest() -> Crc64Digest {
    Crc64Digest(CRC64.digest())
}

impl Crc64Digest {
    fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    fn finalize(self) -> u64 {
        self.0.finalize()
    }
}

/// Finds the next magic at or after `from`, chunked with a 3-byte overlap
/// so a magic spanning a chunk boundary is still seen.
fn find_magic(file: &File, from: u64, len: u64) -> StoreResult<Option<u64>> {
    let needle = BLOCK_MAGIC.to_be_bytes();
    let mut base = from;
    let mut buf = vec![0u8; CHUNK];

    while base + 4 <= len {
        let take = ((len - base) as usize).min(CHUNK);
        file.read_exact_at(&mut buf[..take], base)?;
        if take >= 4 {
            if let Some(i) = buf[..take].windows(4).position(|w| w == needle) {
                return Ok(Some(base + i as u64));
            }
        }
        if take < CHUNK {
            break;
        }
        base += (CHUNK - 3) as u64;
    }
    Ok(None)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Block;
    use emdb_types::Encoding;
    use std::io::Write;

    fn write_temp(bytes: &[u8]) -> (tempfile::TempDir, File, u64) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.emdb");
        let mut f = File::create(&path).unwrap();
        f.write_all(bytes).unwrap();
        f.flush().unwrap();
        let file = File::open(&path).unwrap();
        let len = bytes.len() as u64;
        (dir, file, len)
    }

    fn block(id: i64, payload: &[u8]) -> Block {
        Block::new(BlockType::Segment, id, 1_700_000_000_000, Encoding::RawBytes, payload.to_vec())
    }

    #[test]
    fn scans_contiguous_blocks() {
        let mut bytes = Vec::new();
        for id in 1..=10 {
            bytes.extend_from_slice(&block(id, &[id as u8; 100]).encode());
        }
        let (_dir, file, len) = write_temp(&bytes);
        let report = scan_file(&file, len).unwrap();
        assert_eq!(report.blocks.len(), 10);
        assert_eq!(report.rejected_candidates, 0);
        assert_eq!(
            report.blocks.iter().map(|b| b.block_id).collect::<Vec<_>>(),
            (1..=10).collect::<Vec<_>>()
        );
    }

    #[test]
    fn skips_leading_garbage() {
        let mut bytes = vec![0xAA; 1234];
        bytes.extend_from_slice(&block(7, b"payload").encode());
        let (_dir, file, len) = write_temp(&bytes);
        let report = scan_file(&file, len).unwrap();
        assert_eq!(report.blocks.len(), 1);
        assert_eq!(report.blocks[0].block_id, 7);
        assert_eq!(report.blocks[0].location.offset, 1234);
    }

    #[test]
    fn skips_partial_final_block() {
        let mut bytes = block(1, &[1; 64]).encode();
        let complete = block(2, &[2; 64]).encode();
        bytes.extend_from_slice(&complete[..complete.len() / 2]);
        let (_dir, file, len) = write_temp(&bytes);
        let report = scan_file(&file, len).unwrap();
        assert_eq!(report.blocks.iter().map(|b| b.block_id).collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn embedded_magic_in_payload_is_not_misparsed() {
        // A payload that contains a full fake header for a huge block.
        let mut payload = Vec::new();
        payload.extend_from_slice(&BLOCK_MAGIC.to_be_bytes());
        payload.extend_from_slice(&[0u8; 60]);
        let mut bytes = block(1, &payload).encode();
        bytes.extend_from_slice(&block(2, b"after").encode());
        let (_dir, file, len) = write_temp(&bytes);
        let report = scan_file(&file, len).unwrap();
        assert_eq!(
            report.blocks.iter().map(|b| b.block_id).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn corrupted_block_is_dropped_neighbors_survive() {
        let a = block(1, &[1; 256]).encode();
        let b = block(2, &[2; 256]).encode();
        let c = block(3, &[3; 256]).encode();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&a);
        let b_start = bytes.len();
        bytes.extend_from_slice(&b);
        // Flip a payload byte of block 2.
        bytes[b_start + HEADER_WITH_CHECKSUM_LEN + 10] ^= 0xff;
        bytes.extend_from_slice(&c);
        let (_dir, file, len) = write_temp(&bytes);
        let report = scan_file(&file, len).unwrap();
        assert_eq!(
            report.blocks.iter().map(|b| b.block_id).collect::<Vec<_>>(),
            vec![1, 3]
        );
        assert!(report.rejected_candidates >= 1);
    }
}
