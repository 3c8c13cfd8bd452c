// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Classification of signer certificate chains.
//!
//! A signature's certificate chain is ordered leaf first, root last. A
//! chain of 1 certificate carries only a Root; a chain of 2 a Root and a
//! Leaf; longer chains have Intermediates between the two. The policy
//! engine reasons about signers in terms of these roles, so chains are
//! normalized into [ChainPackage] values before arbitration.

use {
    crate::{error::AppControlSimError, signature_reader::FileSignature},
    chrono::{DateTime, Utc},
    md5::Md5,
    sha1::Sha1,
    sha2::{Digest, Sha256, Sha384, Sha512},
    x509_certificate::{asn1time::Time, CapturedX509Certificate},
};

/// Role a certificate plays within its chain.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CertificateRole {
    Root,
    Intermediate,
    Leaf,
}

/// Normalized identity fields for one certificate in a chain.
#[derive(Clone, Debug)]
pub struct ChainElement {
    pub subject_cn: Option<String>,
    pub issuer_cn: Option<String>,
    pub not_after: DateTime<Utc>,
    /// Uppercase hex digest of the to-be-signed certificate data, using the
    /// digest algorithm named by the certificate's signature algorithm.
    pub tbs_hash: String,
    pub role: CertificateRole,
}

impl ChainElement {
    fn new(cert: &CapturedX509Certificate, role: CertificateRole) -> Result<Self, AppControlSimError> {
        let raw_cert: &x509_certificate::rfc5280::Certificate = cert.as_ref();

        Ok(Self {
            subject_cn: common_name(cert.subject_name()),
            issuer_cn: common_name(cert.issuer_name()),
            not_after: time_to_utc(&raw_cert.tbs_certificate.validity.not_after),
            tbs_hash: tbs_hash(cert)?,
            role,
        })
    }
}

/// One signer's classified chain.
#[derive(Clone, Debug)]
pub struct ChainPackage {
    pub root: ChainElement,
    pub intermediates: Vec<ChainElement>,
    pub leaf: Option<ChainElement>,
}

/// Classify each signature's certificate chain into a [ChainPackage].
///
/// Multi-signed files produce one package per independent signer. Chains
/// with no certificates at all are skipped.
pub fn classify_signatures(
    signatures: &[FileSignature],
) -> Result<Vec<ChainPackage>, AppControlSimError> {
    let mut packages = Vec::with_capacity(signatures.len());

    for signature in signatures {
        let chain = &signature.chain;

        match chain.len() {
            0 => {}
            1 => {
                packages.push(ChainPackage {
                    root: ChainElement::new(&chain[0], CertificateRole::Root)?,
                    intermediates: vec![],
                    leaf: None,
                });
            }
            2 => {
                packages.push(ChainPackage {
                    root: ChainElement::new(&chain[1], CertificateRole::Root)?,
                    intermediates: vec![],
                    leaf: Some(ChainElement::new(&chain[0], CertificateRole::Leaf)?),
                });
            }
            n => {
                let intermediates = chain[1..n - 1]
                    .iter()
                    .map(|cert| ChainElement::new(cert, CertificateRole::Intermediate))
                    .collect::<Result<Vec<_>, _>>()?;

                packages.push(ChainPackage {
                    root: ChainElement::new(&chain[n - 1], CertificateRole::Root)?,
                    intermediates,
                    leaf: Some(ChainElement::new(&chain[0], CertificateRole::Leaf)?),
                });
            }
        }
    }

    Ok(packages)
}

/// Obtain the first common name attribute of an X.509 name, if present.
pub fn common_name(name: &x509_certificate::rfc3280::Name) -> Option<String> {
    name.iter_common_name()
        .next()
        .and_then(|atv| atv.to_string().ok())
}

/// Compute the TBS hash of a certificate.
///
/// The digest algorithm is derived from the certificate's signature
/// algorithm OID, matching how the policy format records root identities.
pub fn tbs_hash(cert: &CapturedX509Certificate) -> Result<String, AppControlSimError> {
    let raw_cert: &x509_certificate::rfc5280::Certificate = cert.as_ref();

    let tbs = raw_cert
        .tbs_certificate
        .raw_data
        .as_ref()
        .ok_or(AppControlSimError::CertificateNoTbsData)?;

    let algorithm = format!("{}", raw_cert.signature_algorithm.algorithm);

    let digest = match algorithm.as_str() {
        // md5WithRSAEncryption
        "1.2.840.113549.1.1.4" => Md5::digest(tbs).to_vec(),
        // sha1 with RSA / DSA / ECDSA
        "1.2.840.113549.1.1.5" | "1.3.14.3.2.29" | "1.2.840.10040.4.3" | "1.2.840.10045.4.1" => {
            Sha1::digest(tbs).to_vec()
        }
        "1.2.840.113549.1.1.11" | "2.16.840.1.101.3.4.3.2" | "1.2.840.10045.4.3.2" => {
            Sha256::digest(tbs).to_vec()
        }
        "1.2.840.113549.1.1.12" | "2.16.840.1.101.3.4.3.3" | "1.2.840.10045.4.3.3" => {
            Sha384::digest(tbs).to_vec()
        }
        "1.2.840.113549.1.1.13" | "2.16.840.1.101.3.4.3.4" | "1.2.840.10045.4.3.4" => {
            Sha512::digest(tbs).to_vec()
        }
        _ => {
            return Err(AppControlSimError::UnsupportedSignatureAlgorithm(algorithm));
        }
    };

    Ok(hex::encode_upper(digest))
}

fn time_to_utc(time: &Time) -> DateTime<Utc> {
    match time {
        Time::UtcTime(utc) => **utc,
        Time::GeneralTime(gt) => DateTime::from(gt.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Self-signed "Test Root" certificate, ecdsa-with-SHA256.
    const TEST_CERT_PEM: &str = "-----BEGIN CERTIFICATE-----
MIIBfTCCASOgAwIBAgIUFb0hXbA1hhq38jPzuCY/YTR54A4wCgYIKoZIzj0EAwIw
FDESMBAGA1UEAwwJVGVzdCBSb290MB4XDTI2MDgyOTA0MDYzMloXDTM2MDgyNjA0
MDYzMlowFDESMBAGA1UEAwwJVGVzdCBSb290MFkwEwYHKoZIzj0CAQYIKoZIzj0D
AQcDQgAEWiTwz9foWP4ScyD1hv5TJ9GVNM4ioeQcbFgeAO/kK6m0Ob4WbeDDCgvd
zb3dAdEA/HHEDPXmWPJIr5vB70PkraNTMFEwHQYDVR0OBBYEFCYr/zdyy/h0Kali
/NXApx2k15dJMB8GA1UdIwQYMBaAFCYr/zdyy/h0Kali/NXApx2k15dJMA8GA1Ud
EwEB/wQFMAMBAf8wCgYIKoZIzj0EAwIDSAAwRQIgTHg0TAzn0sw1GCpWWgQrfYY+
fwNumcRGusWVJmLtso4CIQCSROG7SjiMLno1TPh2YD9wSp0QTL3JgUAVJ5bOvrEZ
lQ==
-----END CERTIFICATE-----";

    fn test_cert() -> CapturedX509Certificate {
        CapturedX509Certificate::from_pem(TEST_CERT_PEM.as_bytes()).unwrap()
    }

    #[test]
    fn single_certificate_chain_is_root_only() {
        let cert = test_cert();
        let signature = FileSignature {
            chain: vec![cert],
            eku_oids: vec![],
        };

        let packages = classify_signatures(&[signature]).unwrap();

        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].root.role, CertificateRole::Root);
        assert!(packages[0].intermediates.is_empty());
        assert!(packages[0].leaf.is_none());
    }

    #[test]
    fn two_certificate_chain_has_root_and_leaf() {
        let cert = test_cert();
        let signature = FileSignature {
            chain: vec![cert.clone(), cert],
            eku_oids: vec![],
        };

        let packages = classify_signatures(&[signature]).unwrap();

        assert_eq!(packages[0].root.role, CertificateRole::Root);
        assert_eq!(
            packages[0].leaf.as_ref().map(|l| l.role),
            Some(CertificateRole::Leaf)
        );
        assert!(packages[0].intermediates.is_empty());
    }

    #[test]
    fn long_chain_classifies_intermediates_in_order() {
        let cert = test_cert();
        let signature = FileSignature {
            chain: vec![cert.clone(), cert.clone(), cert.clone(), cert],
            eku_oids: vec![],
        };

        let packages = classify_signatures(&[signature]).unwrap();

        assert_eq!(packages[0].intermediates.len(), 2);
        assert!(packages[0]
            .intermediates
            .iter()
            .all(|e| e.role == CertificateRole::Intermediate));
    }

    #[test]
    fn tbs_hash_is_uppercase_hex() {
        let cert = test_cert();
        let hash = tbs_hash(&cert).unwrap();

        // ecdsa-with-SHA256 -> 32 byte digest.
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    }
}
