// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Functionality related to hashing files the way the code integrity engine does.
//!
//! An Authenticode hash covers the whole PE image except three regions:
//! the checksum field in the optional header, the security data directory
//! entry, and the attribute certificate table the entry points at. Section
//! data is hashed in file-offset order regardless of the order of the
//! section table. Non-PE files fall back to a flat hash of the entire file,
//! mirroring the behavior of the native hashing API when asked to process
//! non-conformant input.
//!
//! The page hash variant digests the same byte stream in 4096 byte pages
//! and condenses the per-page digests into a single value.

use {
    crate::error::AppControlSimError,
    digest::Digest,
    goblin::pe::PE,
    scroll::{Pread, LE},
    serde::Serialize,
    sha1::Sha1,
    sha2::Sha256,
    std::{ops::Range, path::Path},
};

/// Authenticode page size.
const PAGE_SIZE: usize = 4096;

/// Magic for PE32 optional headers.
const MAGIC_PE32: u16 = 0x10b;

/// The hashes the simulation cares about, expressed as uppercase hex.
///
/// Fields are `None` when the corresponding variant cannot be computed for
/// the input (e.g. page hashes of a non-PE file).
#[derive(Clone, Debug, Serialize)]
pub struct CodeIntegrityHashes {
    pub sha1_page: Option<String>,
    pub sha256_page: Option<String>,
    pub sha1_authenticode: Option<String>,
    pub sha256_authenticode: Option<String>,
}

/// Compute the code integrity hashes for a file on disk.
///
/// The file is opened for reading only and never mutated. Errors are
/// reported as [AppControlSimError::HashComputation] so callers can treat
/// them as a per-file rejection instead of a fatal condition.
pub fn compute_file_hashes(path: impl AsRef<Path>) -> Result<CodeIntegrityHashes, AppControlSimError> {
    let path = path.as_ref();

    let data = std::fs::read(path).map_err(|e| AppControlSimError::HashComputation {
        path: path.to_path_buf(),
        message: format!("unable to open file: {}", e),
    })?;

    Ok(compute_hashes_from_data(&data))
}

/// Compute the code integrity hashes over an in-memory file image.
pub fn compute_hashes_from_data(data: &[u8]) -> CodeIntegrityHashes {
    match authenticode_ranges(data) {
        Ok(ranges) => CodeIntegrityHashes {
            sha1_page: Some(page_digest::<Sha1>(data, &ranges)),
            sha256_page: Some(page_digest::<Sha256>(data, &ranges)),
            sha1_authenticode: Some(ranges_digest::<Sha1>(data, &ranges)),
            sha256_authenticode: Some(ranges_digest::<Sha256>(data, &ranges)),
        },
        // Flat fallback for files the PE parser rejects.
        Err(_) => {
            let whole = vec![0..data.len()];

            CodeIntegrityHashes {
                sha1_page: None,
                sha256_page: None,
                sha1_authenticode: Some(ranges_digest::<Sha1>(data, &whole)),
                sha256_authenticode: Some(ranges_digest::<Sha256>(data, &whole)),
            }
        }
    }
}

/// Resolve the byte ranges of a PE image that participate in its
/// Authenticode hash, in hashing order.
pub fn authenticode_ranges(data: &[u8]) -> Result<Vec<Range<usize>>, AppControlSimError> {
    let pe = PE::parse(data)?;

    let optional_header = pe
        .header
        .optional_header
        .ok_or_else(|| AppControlSimError::Goblin(goblin::error::Error::Malformed("missing optional header".into())))?;

    // Offset of the optional header within the file: PE signature (4) plus
    // COFF header (20) after the DOS stub pointer.
    let opt_offset = pe.header.dos_header.pe_pointer as usize + 24;

    let checksum_offset = opt_offset + 64;

    // Data directories start at offset 96 (PE32) or 112 (PE32+) into the
    // optional header. The security entry is directory index 4.
    let magic = optional_header.standard_fields.magic;
    let dd_offset = opt_offset + if magic == MAGIC_PE32 { 96 } else { 112 };
    let rva_count_offset = opt_offset + if magic == MAGIC_PE32 { 92 } else { 108 };
    let rva_count: u32 = data.pread_with(rva_count_offset, LE)?;

    let security_entry = if rva_count > 4 {
        Some(dd_offset + 4 * 8)
    } else {
        None
    };

    let size_of_headers = optional_header.windows_fields.size_of_headers as usize;

    if size_of_headers > data.len() || checksum_offset + 4 > size_of_headers {
        return Err(AppControlSimError::Goblin(goblin::error::Error::Malformed(
            "header sizes out of bounds".into(),
        )));
    }

    let mut ranges = Vec::new();

    // Header, excluding the checksum field and the security directory entry.
    match security_entry {
        Some(entry) => {
            ranges.push(0..checksum_offset);
            ranges.push(checksum_offset + 4..entry);
            ranges.push(entry + 8..size_of_headers);
        }
        None => {
            ranges.push(0..checksum_offset);
            ranges.push(checksum_offset + 4..size_of_headers);
        }
    }

    // Section data, ordered by file offset.
    let mut sections = pe
        .sections
        .iter()
        .filter(|s| s.size_of_raw_data > 0)
        .map(|s| {
            let start = s.pointer_to_raw_data as usize;
            let end = start.saturating_add(s.size_of_raw_data as usize);

            start.min(data.len())..end.min(data.len())
        })
        .collect::<Vec<_>>();
    sections.sort_unstable_by_key(|r| r.start);

    let mut hashed = size_of_headers;
    for section in sections {
        hashed += section.len();
        ranges.push(section);
    }

    // Trailing data after the sections, excluding the certificate table.
    let cert_table_size = optional_header
        .data_directories
        .get_certificate_table()
        .map(|dd| dd.size as usize)
        .unwrap_or(0);

    if let Some(extra) = data.len().checked_sub(hashed) {
        let extra = extra.saturating_sub(cert_table_size);

        if extra > 0 && hashed + extra <= data.len() {
            ranges.push(hashed..hashed + extra);
        }
    }

    ranges.retain(|r| !r.is_empty() && r.start <= r.end);

    Ok(ranges)
}

/// Digest a set of byte ranges as one continuous stream.
fn ranges_digest<D: Digest>(data: &[u8], ranges: &[Range<usize>]) -> String {
    let mut digest = D::new();

    for range in ranges {
        if let Some(bytes) = data.get(range.clone()) {
            digest.update(bytes);
        }
    }

    hex::encode_upper(digest.finalize())
}

/// Digest a set of byte ranges in [PAGE_SIZE] pages, then condense the
/// per-page digests into a single value.
fn page_digest<D: Digest>(data: &[u8], ranges: &[Range<usize>]) -> String {
    let mut pages = D::new();
    let mut page = Vec::with_capacity(PAGE_SIZE);

    for range in ranges {
        let mut bytes = match data.get(range.clone()) {
            Some(bytes) => bytes,
            None => continue,
        };

        while !bytes.is_empty() {
            let take = (PAGE_SIZE - page.len()).min(bytes.len());
            page.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];

            if page.len() == PAGE_SIZE {
                pages.update(D::digest(&page));
                page.clear();
            }
        }
    }

    if !page.is_empty() {
        pages.update(D::digest(&page));
    }

    hex::encode_upper(pages.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_fallback_for_non_pe() {
        let hashes = compute_hashes_from_data(b"not a portable executable");

        assert!(hashes.sha1_page.is_none());
        assert!(hashes.sha256_page.is_none());

        let expected = hex::encode_upper(Sha256::digest(b"not a portable executable"));
        assert_eq!(hashes.sha256_authenticode.as_deref(), Some(expected.as_str()));

        let expected = hex::encode_upper(Sha1::digest(b"not a portable executable"));
        assert_eq!(hashes.sha1_authenticode.as_deref(), Some(expected.as_str()));
    }

    #[test]
    fn hashes_are_uppercase_hex() {
        let hashes = compute_hashes_from_data(&[0u8; 64]);
        let value = hashes.sha256_authenticode.unwrap();

        assert_eq!(value.len(), 64);
        assert!(value.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    }

    #[test]
    fn ranges_digest_skips_excluded_bytes() {
        let data = (0u8..=255).collect::<Vec<_>>();
        let ranges = vec![0..16, 32..64];

        let mut expected = Sha256::new();
        expected.update(&data[0..16]);
        expected.update(&data[32..64]);

        assert_eq!(
            ranges_digest::<Sha256>(&data, &ranges),
            hex::encode_upper(expected.finalize())
        );
    }

    #[test]
    fn empty_file_still_hashes() {
        let hashes = compute_hashes_from_data(&[]);
        assert!(hashes.sha256_authenticode.is_some());
    }
}
