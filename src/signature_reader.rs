// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Authenticode signature extraction.
//!
//! Signed PEs carry one or more `WIN_CERTIFICATE` entries in the security
//! data directory, each wrapping a PKCS#7 `SignedData` blob. This module
//! locates those entries, parses the embedded certificate set, and orders
//! each signer's certificates into a leaf-first chain. No cryptographic
//! verification happens here; the simulation only needs chain identities.

use {
    crate::error::AppControlSimError,
    cryptographic_message_syntax::SignedData,
    goblin::pe::PE,
    scroll::Pread,
    std::path::Path,
    x509_certificate::CapturedX509Certificate,
};

const WIN_CERT_TYPE_PKCS_SIGNED_DATA: u16 = 0x0002;

/// One independent signature on a file.
#[derive(Clone, Debug)]
pub struct FileSignature {
    /// Certificate chain, leaf first, root last.
    pub chain: Vec<CapturedX509Certificate>,
    /// Extended key usage OIDs of the leaf certificate, dotted form.
    pub eku_oids: Vec<String>,
}

/// Source of per-file signature data.
pub trait SignatureReader {
    /// Obtain every independent signature on a file.
    ///
    /// An unsigned file yields an empty vector, not an error.
    fn read_signatures(&self, path: &Path) -> Result<Vec<FileSignature>, AppControlSimError>;
}

/// Reads embedded Authenticode signatures out of PE files.
#[derive(Clone, Copy, Debug, Default)]
pub struct PeSignatureReader;

impl SignatureReader for PeSignatureReader {
    fn read_signatures(&self, path: &Path) -> Result<Vec<FileSignature>, AppControlSimError> {
        let data = std::fs::read(path)?;

        signatures_from_pe(&data)
    }
}

/// Extract signatures from in-memory PE data.
pub fn signatures_from_pe(data: &[u8]) -> Result<Vec<FileSignature>, AppControlSimError> {
    let pe = match PE::parse(data) {
        Ok(pe) => pe,
        Err(_) => return Ok(vec![]),
    };

    let directory = match pe
        .header
        .optional_header
        .and_then(|opt| *opt.data_directories.get_certificate_table())
    {
        Some(directory) => directory,
        None => return Ok(vec![]),
    };

    // For the security directory the virtual address is a file offset.
    let table_start = directory.virtual_address as usize;
    let table_end = table_start.saturating_add(directory.size as usize).min(data.len());

    let mut signatures = vec![];
    let mut offset = table_start;

    // WIN_CERTIFICATE entries are 8-byte aligned within the table.
    while offset + 8 <= table_end {
        let length: u32 = data.pread_with(offset, scroll::LE)?;
        let _revision: u16 = data.pread_with(offset + 4, scroll::LE)?;
        let cert_type: u16 = data.pread_with(offset + 6, scroll::LE)?;

        if length < 8 {
            break;
        }

        let blob_end = offset.saturating_add(length as usize).min(table_end);

        if cert_type == WIN_CERT_TYPE_PKCS_SIGNED_DATA {
            match signature_from_pkcs7(&data[offset + 8..blob_end]) {
                Ok(Some(signature)) => signatures.push(signature),
                Ok(None) => {}
                Err(e) => {
                    log::warn!("unparseable signature entry skipped: {}", e);
                }
            }
        }

        offset = (offset + length as usize + 7) & !7;
    }

    Ok(signatures)
}

/// Build a [FileSignature] from a raw PKCS#7 `SignedData` blob.
///
/// The leaf is the certificate that issues no other certificate in the
/// blob; the chain is then walked issuer by issuer until a self-signed
/// certificate or a missing issuer terminates it.
pub fn signature_from_pkcs7(data: &[u8]) -> Result<Option<FileSignature>, AppControlSimError> {
    let signed_data = SignedData::parse_ber(data)?;

    let certificates = signed_data.certificates().cloned().collect::<Vec<_>>();

    if certificates.is_empty() {
        return Ok(None);
    }

    let leaf_index = certificates
        .iter()
        .position(|candidate| {
            !certificates.iter().any(|other| {
                other.issuer_name() == candidate.subject_name()
                    && other.subject_name() != candidate.subject_name()
            })
        })
        .unwrap_or(0);

    let mut chain = vec![certificates[leaf_index].clone()];
    let mut used = vec![leaf_index];

    loop {
        let current = match chain.last() {
            Some(current) => current,
            None => break,
        };

        if current.subject_name() == current.issuer_name() {
            break;
        }

        let issuer = certificates.iter().enumerate().find(|(i, candidate)| {
            !used.contains(i) && candidate.subject_name() == current.issuer_name()
        });

        match issuer {
            Some((i, candidate)) => {
                chain.push(candidate.clone());
                used.push(i);
            }
            None => break,
        }
    }

    let eku_oids = leaf_eku_oids(&chain[0]);

    Ok(Some(FileSignature { chain, eku_oids }))
}

/// Extended key usage extension, 2.5.29.37.
const OID_EXT_KEY_USAGE: &[u8] = &[0x55, 0x1d, 0x25];

fn leaf_eku_oids(cert: &CapturedX509Certificate) -> Vec<String> {
    let raw_cert: &x509_certificate::rfc5280::Certificate = cert.as_ref();
    let tbs = &raw_cert.tbs_certificate;

    let extension = match tbs
        .extensions
        .as_ref()
        .and_then(|exts| exts.iter().find(|ext| ext.id.as_ref() == OID_EXT_KEY_USAGE))
    {
        Some(extension) => extension,
        None => return vec![],
    };

    let value = extension.value.to_bytes();

    let oids = bcder::decode::Constructed::decode(value.as_ref(), bcder::Mode::Der, |cons| {
        cons.take_sequence(|cons| {
            let mut oids = vec![];

            while let Some(oid) = bcder::Oid::take_opt_from(cons)? {
                oids.push(oid.to_string());
            }

            Ok(oids)
        })
    });

    match oids {
        Ok(oids) => oids,
        Err(_) => {
            log::warn!("malformed extended key usage extension ignored");
            vec![]
        }
    }
}
