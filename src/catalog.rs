// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Security catalog hash indexing.
//!
//! Security catalogs (`.cat`) are PKCS#7 `SignedData` files whose payload
//! is a certificate trust list of member hashes. Catalog formats vary by
//! generation, so rather than modeling the full CTL schema this module
//! walks the payload's DER structure and harvests every plausible member
//! hash: either raw digest octets or the older UTF-16 hex string form.

use {
    crate::error::AppControlSimError,
    cryptographic_message_syntax::SignedData,
    std::{
        collections::BTreeMap,
        path::{Path, PathBuf},
    },
};

/// Digest lengths accepted as member hashes (MD5 through SHA-512).
const HASH_LENGTHS: &[usize] = &[16, 20, 32, 48, 64];

/// Immutable map from member hash to the catalog asserting it.
#[derive(Clone, Debug, Default)]
pub struct CatalogIndex {
    map: BTreeMap<String, PathBuf>,
    catalog_count: usize,
}

impl CatalogIndex {
    /// Scan directories non-recursively for catalog files and index every
    /// member hash. A hash appearing in multiple catalogs keeps its first
    /// catalog. Unreadable directories and catalogs that fail to parse are
    /// skipped and logged.
    pub fn build(directories: &[PathBuf]) -> Result<Self, AppControlSimError> {
        let mut index = Self::default();

        for directory in directories {
            let entries = match std::fs::read_dir(directory) {
                Ok(entries) => entries,
                Err(e) => {
                    log::warn!(
                        "skipping unreadable catalog directory {}: {}",
                        directory.display(),
                        e
                    );
                    continue;
                }
            };

            for entry in entries {
                let path = match entry {
                    Ok(entry) => entry.path(),
                    Err(e) => {
                        log::warn!("skipping unreadable catalog entry: {}", e);
                        continue;
                    }
                };

                let is_catalog = path
                    .extension()
                    .map(|ext| ext.eq_ignore_ascii_case("cat"))
                    .unwrap_or(false);

                if !path.is_file() || !is_catalog {
                    continue;
                }

                match index_catalog(&path) {
                    Ok(hashes) => {
                        for hash in hashes {
                            index.map.entry(hash).or_insert_with(|| path.clone());
                        }
                        index.catalog_count += 1;
                    }
                    Err(e) => {
                        log::warn!("skipping unparseable catalog {}: {}", path.display(), e);
                    }
                }
            }
        }

        log::info!(
            "indexed {} catalogs covering {} member hashes",
            index.catalog_count,
            index.map.len()
        );

        Ok(index)
    }

    /// Look up a hash, uppercase hex.
    pub fn lookup(&self, hash: &str) -> Option<&Path> {
        self.map.get(hash).map(|p| p.as_path())
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn catalog_count(&self) -> usize {
        self.catalog_count
    }
}

fn index_catalog(path: &Path) -> Result<Vec<String>, AppControlSimError> {
    let data = std::fs::read(path)?;

    let signed_data = SignedData::parse_ber(&data)?;

    let content = signed_data
        .signed_content()
        .ok_or_else(|| AppControlSimError::CatalogParse("catalog has no signed content".into()))?;

    let mut hashes = vec![];
    walk_der(content, 0, &mut hashes);

    Ok(hashes)
}

/// Recursively walk a DER blob, collecting hash-like OCTET STRING values.
///
/// Depth is bounded to keep hostile input from recursing unboundedly.
fn walk_der(data: &[u8], depth: usize, hashes: &mut Vec<String>) {
    if depth > 16 {
        return;
    }

    let mut offset = 0;

    while let Some((tag, content, next)) = read_tlv(data, offset) {
        if tag & 0x20 != 0 {
            walk_der(content, depth + 1, hashes);
        } else if tag == 0x04 {
            if let Some(hash) = hash_from_octets(content) {
                hashes.push(hash);
            } else {
                // Member attributes nest further DER inside octet strings.
                walk_der(content, depth + 1, hashes);
            }
        }

        offset = next;
    }
}

/// Read one tag-length-value at `offset`. Returns the tag byte, the content
/// slice and the offset of the following element. Multi-byte tags and any
/// malformed length abort the walk of the enclosing scope.
fn read_tlv(data: &[u8], offset: usize) -> Option<(u8, &[u8], usize)> {
    let tag = *data.get(offset)?;

    if tag & 0x1f == 0x1f {
        return None;
    }

    let first = *data.get(offset + 1)? as usize;

    let (length, content_start) = if first < 0x80 {
        (first, offset + 2)
    } else {
        let count = first & 0x7f;
        if count == 0 || count > 4 {
            return None;
        }

        let mut length = 0usize;
        for i in 0..count {
            length = (length << 8) | *data.get(offset + 2 + i)? as usize;
        }

        (length, offset + 2 + count)
    };

    let content_end = content_start.checked_add(length)?;
    if content_end > data.len() {
        return None;
    }

    Some((tag, &data[content_start..content_end], content_end))
}

/// Interpret an OCTET STRING as a member hash if its shape allows.
fn hash_from_octets(content: &[u8]) -> Option<String> {
    // Older catalogs store the hash as a NUL-terminated UTF-16 hex string.
    if content.len() >= 4 && content.len() % 2 == 0 {
        let units = content
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .take_while(|&u| u != 0)
            .collect::<Vec<_>>();

        if units.len() * 2 >= content.len() - 2
            && HASH_LENGTHS.contains(&(units.len() / 2))
            && units
                .iter()
                .all(|&u| u < 0x80 && (u as u8 as char).is_ascii_hexdigit())
        {
            let hex = units.iter().map(|&u| u as u8 as char).collect::<String>();

            return Some(hex.to_ascii_uppercase());
        }
    }

    if HASH_LENGTHS.contains(&content.len()) {
        return Some(hex::encode_upper(content));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_digest_octets_are_hashed() {
        assert_eq!(
            hash_from_octets(&[0xab; 20]).as_deref(),
            Some("ABABABABABABABABABABABABABABABABABABABAB")
        );
        assert!(hash_from_octets(&[0xab; 21]).is_none());
    }

    #[test]
    fn utf16_hex_string_form_decodes() {
        let hex = "aabbccddeeff00112233445566778899aabbccddeeff00112233445566778899";
        let mut content = hex
            .encode_utf16()
            .flat_map(|u| u.to_le_bytes())
            .collect::<Vec<_>>();
        content.extend_from_slice(&[0, 0]);

        assert_eq!(
            hash_from_octets(&content).as_deref(),
            Some("AABBCCDDEEFF00112233445566778899AABBCCDDEEFF00112233445566778899")
        );
    }

    #[test]
    fn der_walk_collects_nested_octet_strings() {
        // SEQUENCE { OCTET STRING <20 bytes>, SEQUENCE { OCTET STRING <32 bytes> } }
        let mut inner = vec![0x04, 32];
        inner.extend_from_slice(&[0x11; 32]);

        let mut seq_inner = vec![0x30, inner.len() as u8];
        seq_inner.extend_from_slice(&inner);

        let mut body = vec![0x04, 20];
        body.extend_from_slice(&[0x22; 20]);
        body.extend_from_slice(&seq_inner);

        let mut doc = vec![0x30, body.len() as u8];
        doc.extend_from_slice(&body);

        let mut hashes = vec![];
        walk_der(&doc, 0, &mut hashes);

        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes[0], "22".repeat(20));
        assert_eq!(hashes[1], "11".repeat(32));
    }

    #[test]
    fn truncated_der_stops_cleanly() {
        let mut hashes = vec![];
        walk_der(&[0x30, 0x10, 0x04], 0, &mut hashes);

        assert!(hashes.is_empty());
    }

    #[test]
    fn empty_directory_set_builds_empty_index() {
        let index = CatalogIndex::build(&[]).unwrap();

        assert!(index.is_empty());
        assert_eq!(index.catalog_count(), 0);
    }

    #[test]
    fn missing_directory_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no-such-catroot");

        let index = CatalogIndex::build(&[missing]).unwrap();

        assert!(index.is_empty());
        assert_eq!(index.catalog_count(), 0);
    }
}
