//! Ad-hoc code signature generation.
//!
//! An ad-hoc signature carries no certificate chain: it is a single
//! CodeDirectory blob wrapped in a SuperBlob, whose code slots are SHA-256
//! hashes of every page of the file up to the signature itself. All
//! multi-byte fields in the signature are big-endian.
//!
//! The incremental writer reserves space for the signature before the load
//! commands are final (the reservation size depends only on the output
//! name and the file offset), then fills the reservation in as the very
//! last write of a flush.

use std::fs::File;
use std::os::unix::fs::FileExt;

use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::macho::constants::{
    CSMAGIC_CODEDIRECTORY, CSMAGIC_EMBEDDED_SIGNATURE, CSSLOT_CODEDIRECTORY, CS_ADHOC,
    CS_HASHTYPE_SHA256, CS_SHA256_LEN,
};
use crate::util::align_up;

/// SuperBlob header size: magic, length, blob count.
const SUPERBLOB_SIZE: usize = 12;
/// Blob index size: slot type, offset.
const BLOB_INDEX_SIZE: usize = 8;
/// CodeDirectory header size for version 0x20100.
const CODEDIRECTORY_SIZE: usize = 48;
/// CodeDirectory version with the scatter field.
const CD_VERSION: u32 = 0x20100;

/// Returns the number of bytes to reserve for the signature of a file
/// whose signable content ends at `file_offset`.
///
/// The result depends only on the identifier length, the covered size and
/// the page size, so the reservation can be made before the signature is
/// computable.
pub fn padding_size(ident: &str, file_offset: u64, page_size: u64) -> u32 {
    let n_pages = file_offset.div_ceil(page_size);
    let total = SUPERBLOB_SIZE as u64
        + BLOB_INDEX_SIZE as u64
        + CODEDIRECTORY_SIZE as u64
        + n_pages * CS_SHA256_LEN as u64
        + ident.len() as u64
        + 1;
    align_up(total, 8) as u32
}

/// Computes the ad-hoc signature blob for the file contents in
/// `[0, code_limit)`.
///
/// The returned buffer is exactly `padding_size(ident, code_limit,
/// page_size)` bytes, zero-padded past the SuperBlob, so writing it fills
/// the entire reservation.
pub fn compute(file: &File, ident: &str, code_limit: u64, page_size: u64) -> Result<Vec<u8>> {
    let n_pages = code_limit.div_ceil(page_size);

    let cd_hash_offset = CODEDIRECTORY_SIZE as u64;
    let cd_ident_offset = cd_hash_offset + n_pages * CS_SHA256_LEN as u64;
    let cd_size = cd_ident_offset + ident.len() as u64 + 1;

    // CodeDirectory header (version 0x20100, 48 bytes).
    let mut cd = Vec::with_capacity(cd_size as usize);
    cd.extend(&CSMAGIC_CODEDIRECTORY.to_be_bytes());
    cd.extend(&(cd_size as u32).to_be_bytes());
    cd.extend(&CD_VERSION.to_be_bytes());
    cd.extend(&CS_ADHOC.to_be_bytes());
    cd.extend(&(cd_hash_offset as u32).to_be_bytes());
    cd.extend(&(cd_ident_offset as u32).to_be_bytes());
    cd.extend(&0u32.to_be_bytes()); // nSpecialSlots
    cd.extend(&(n_pages as u32).to_be_bytes());
    cd.extend(&(code_limit as u32).to_be_bytes());
    cd.push(CS_SHA256_LEN as u8);
    cd.push(CS_HASHTYPE_SHA256);
    cd.push(0); // platform
    cd.push(page_size.trailing_zeros() as u8);
    cd.extend(&0u32.to_be_bytes()); // spare2
    cd.extend(&0u32.to_be_bytes()); // scatterOffset
    debug_assert_eq!(cd.len(), CODEDIRECTORY_SIZE);

    // One hash slot per page, the final page possibly short.
    let mut page = vec![0u8; page_size as usize];
    for page_idx in 0..n_pages {
        let page_start = page_idx * page_size;
        let page_len = (code_limit - page_start).min(page_size) as usize;
        file.read_exact_at(&mut page[..page_len], page_start)?;

        let mut hasher = Sha256::new();
        hasher.update(&page[..page_len]);
        cd.extend(hasher.finalize());
    }

    cd.extend(ident.as_bytes());
    cd.push(0);

    // SuperBlob wrapping the single CodeDirectory.
    let blob_len = SUPERBLOB_SIZE + BLOB_INDEX_SIZE + cd.len();
    let reserved = padding_size(ident, code_limit, page_size) as usize;
    let mut blob = Vec::with_capacity(reserved);
    blob.extend(&CSMAGIC_EMBEDDED_SIGNATURE.to_be_bytes());
    blob.extend(&(blob_len as u32).to_be_bytes());
    blob.extend(&1u32.to_be_bytes());
    blob.extend(&CSSLOT_CODEDIRECTORY.to_be_bytes());
    blob.extend(&((SUPERBLOB_SIZE + BLOB_INDEX_SIZE) as u32).to_be_bytes());
    blob.extend(&cd);
    blob.resize(reserved, 0);

    Ok(blob)
}

/// Extracts the page hashes from a signature blob.
///
/// Returns `(page_size, code_limit, hashes)` for verification against the
/// file contents. Returns `None` when the blob does not look like a
/// single-CodeDirectory ad-hoc signature.
pub fn parse_page_hashes(blob: &[u8]) -> Option<(u64, u64, Vec<[u8; CS_SHA256_LEN]>)> {
    let be32 = |off: usize| -> Option<u32> {
        blob.get(off..off + 4)
            .map(|b| u32::from_be_bytes(b.try_into().unwrap()))
    };

    if be32(0)? != CSMAGIC_EMBEDDED_SIGNATURE || be32(8)? != 1 {
        return None;
    }
    let cd_off = be32(SUPERBLOB_SIZE + 4)? as usize;
    if be32(cd_off)? != CSMAGIC_CODEDIRECTORY {
        return None;
    }

    let hash_offset = be32(cd_off + 16)? as usize;
    let n_code_slots = be32(cd_off + 28)? as usize;
    let code_limit = be32(cd_off + 32)? as u64;
    let page_size = 1u64 << *blob.get(cd_off + 39)?;

    let mut hashes = Vec::with_capacity(n_code_slots);
    for i in 0..n_code_slots {
        let start = cd_off + hash_offset + i * CS_SHA256_LEN;
        let hash: [u8; CS_SHA256_LEN] = blob.get(start..start + CS_SHA256_LEN)?.try_into().ok()?;
        hashes.push(hash);
    }

    Some((page_size, code_limit, hashes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_padding_size_aligned_and_monotonic() {
        let base = padding_size("a.out", 0x3000, 0x1000);
        assert_eq!(base % 8, 0);
        assert!(padding_size("a.out", 0x4000, 0x1000) >= base);
        assert!(padding_size("a_longer_name.out", 0x3000, 0x1000) >= base);
    }

    #[test]
    fn test_compute_hashes_match_content() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        let content = vec![0xABu8; 0x1800];
        tmp.write_all(&content).unwrap();

        let blob = compute(tmp.as_file(), "test", 0x1800, 0x1000).unwrap();
        assert_eq!(blob.len(), padding_size("test", 0x1800, 0x1000) as usize);

        let (page_size, code_limit, hashes) = parse_page_hashes(&blob).unwrap();
        assert_eq!(page_size, 0x1000);
        assert_eq!(code_limit, 0x1800);
        assert_eq!(hashes.len(), 2);

        let mut hasher = Sha256::new();
        hasher.update(&content[..0x1000]);
        assert_eq!(hashes[0][..], hasher.finalize()[..]);

        let mut hasher = Sha256::new();
        hasher.update(&content[0x1000..0x1800]);
        assert_eq!(hashes[1][..], hasher.finalize()[..]);
    }

    #[test]
    fn test_identifier_embedded() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(0x1000).unwrap();
        let blob = compute(tmp.as_file(), "hello.exe", 0x1000, 0x1000).unwrap();
        let window = b"hello.exe\0";
        assert!(blob.windows(window.len()).any(|w| w == window));
    }
}
