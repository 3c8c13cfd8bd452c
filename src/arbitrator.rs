// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signer arbitration.
//!
//! Once the fast paths (allow-all, file path rules, hash rules, unsigned
//! extension rejection) have not produced a verdict, a file's classified
//! chain packages are weighed against the policy's signers. Denied signers
//! are evaluated before allowed signers, so a deny match rejects a file
//! even when an allow match exists on another chain.

use {
    crate::{
        chain::{CertificateRole, ChainElement, ChainPackage},
        file_metadata::ExtendedFileInfo,
        policy::{FileAttribute, FileNameCriteria, PolicySigner},
    },
    serde::Serialize,
    std::path::{Path, PathBuf},
};

pub const CRITERIA_ALLOW_ALL: &str = "Has AllowAll rule";
pub const CRITERIA_FILE_PATH: &str = "Allowed By File Path";
pub const CRITERIA_HASH: &str = "Hash Level";
pub const CRITERIA_CATALOG: &str = "Catalog Hash";
pub const CRITERIA_NOT_ALLOWED: &str = "Not Allowed";
pub const CRITERIA_SIGNER_DENIED: &str = "Signer Denied";
pub const CRITERIA_INACCESSIBLE: &str = "Not processed, Inaccessible file";
pub const CRITERIA_HASH_MISMATCH: &str = "Hash Mismatch";

pub const LEVEL_FILE_PUBLISHER: &str = "FilePublisher";
pub const LEVEL_SIGNED_VERSION: &str = "SignedVersion";
pub const LEVEL_PUBLISHER: &str = "Publisher";
pub const LEVEL_ROOT_CERTIFICATE: &str = "PcaCertificate/RootCertificate";
pub const LEVEL_LEAF_CERTIFICATE: &str = "LeafCertificate";

/// Which rule family produced a verdict.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum VerdictSource {
    AllowAllRule,
    FilePath,
    Hash,
    Unsigned,
    CatalogSigned,
    Signer,
    Unknown,
}

impl VerdictSource {
    pub fn label(&self) -> &'static str {
        match self {
            Self::AllowAllRule => "AllowAllRule",
            Self::FilePath => "FilePath",
            Self::Hash => "Hash",
            Self::Unsigned => "Unsigned",
            Self::CatalogSigned => "CatalogSigned",
            Self::Signer => "Signer",
            Self::Unknown => "Unknown",
        }
    }
}

/// The per-file verdict record. Exactly one exists per evaluated file.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct SimulationOutput {
    pub file_name: String,
    pub source: VerdictSource,
    pub is_authorized: bool,
    pub signer_id: Option<String>,
    pub signer_name: Option<String>,
    pub signer_cert_root: Option<String>,
    pub signer_cert_publisher: Option<String>,
    pub signer_scope: Option<String>,
    pub signer_file_attribute_ids: Vec<String>,
    pub match_criteria: String,
    pub specific_file_name_criteria: Option<String>,
    pub cert_subject_cn: Option<String>,
    pub cert_issuer_cn: Option<String>,
    pub cert_not_after: Option<String>,
    pub cert_tbs_value: Option<String>,
    pub file_path: PathBuf,
}

impl SimulationOutput {
    /// A verdict carrying no signer or certificate identity.
    pub fn bare(
        path: &Path,
        source: VerdictSource,
        is_authorized: bool,
        match_criteria: impl Into<String>,
    ) -> Self {
        Self {
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            source,
            is_authorized,
            signer_id: None,
            signer_name: None,
            signer_cert_root: None,
            signer_cert_publisher: None,
            signer_scope: None,
            signer_file_attribute_ids: vec![],
            match_criteria: match_criteria.into(),
            specific_file_name_criteria: None,
            cert_subject_cn: None,
            cert_issuer_cn: None,
            cert_not_after: None,
            cert_tbs_value: None,
            file_path: path.to_path_buf(),
        }
    }
}

/// Identity reported when a file is authorized through a security catalog.
#[derive(Clone, Debug)]
pub struct CatalogHit {
    pub catalog_path: PathBuf,
    pub subject_cn: Option<String>,
    pub issuer_cn: Option<String>,
    pub not_after: Option<String>,
    pub tbs_hash: Option<String>,
}

struct SignerMatch<'a> {
    signer: &'a PolicySigner,
    package: &'a ChainPackage,
    /// The chain element whose TBS hash matched the signer's cert root.
    anchor: &'a ChainElement,
    level: &'static str,
    attribute: Option<&'a FileAttribute>,
}

/// Arbitrate one file against the policy signers.
///
/// `catalog_hit` carries the pre-computed catalog lookup for the file's
/// hashes; it is consulted only when the file has no parseable signature.
pub fn decide(
    path: &Path,
    packages: &[ChainPackage],
    signers: &[PolicySigner],
    file_ekus: &[String],
    file_info: &ExtendedFileInfo,
    catalog_hit: Option<&CatalogHit>,
) -> SimulationOutput {
    if packages.is_empty() {
        return match catalog_hit {
            Some(hit) => catalog_verdict(path, hit),
            None => SimulationOutput::bare(path, VerdictSource::Unsigned, false, CRITERIA_NOT_ALLOWED),
        };
    }

    // Deny precedence: a matching denied signer rejects the file before
    // any allowed signer is consulted.
    for denied in signers.iter().filter(|s| !s.is_allowed) {
        for package in packages {
            if let Some(m) = match_signer(denied, package, file_ekus, file_info) {
                return signer_verdict(path, &m, false, CRITERIA_SIGNER_DENIED);
            }
        }
    }

    for allowed in signers.iter().filter(|s| s.is_allowed) {
        for package in packages {
            if let Some(m) = match_signer(allowed, package, file_ekus, file_info) {
                let level = m.level;
                return signer_verdict(path, &m, true, level);
            }
        }
    }

    SimulationOutput::bare(path, VerdictSource::Signer, false, CRITERIA_NOT_ALLOWED)
}

fn match_signer<'a>(
    signer: &'a PolicySigner,
    package: &'a ChainPackage,
    file_ekus: &[String],
    file_info: &ExtendedFileInfo,
) -> Option<SignerMatch<'a>> {
    // Policy signers anchor at any certificate of the chain: the root, a
    // PCA intermediate, or the leaf itself.
    let (anchor, anchor_level) = if signer.cert_root == package.root.tbs_hash {
        (&package.root, LEVEL_ROOT_CERTIFICATE)
    } else if let Some(intermediate) = package
        .intermediates
        .iter()
        .find(|element| signer.cert_root == element.tbs_hash)
    {
        (intermediate, LEVEL_ROOT_CERTIFICATE)
    } else if let Some(leaf) = package
        .leaf
        .as_ref()
        .filter(|leaf| signer.cert_root == leaf.tbs_hash)
    {
        (leaf, LEVEL_LEAF_CERTIFICATE)
    } else {
        return None;
    };

    if !signer
        .required_ekus
        .iter()
        .all(|required| file_ekus.iter().any(|have| have == required))
    {
        return None;
    }

    if let Some(expected) = &signer.cert_publisher {
        let leaf_cn = package.leaf.as_ref().and_then(|l| l.subject_cn.as_deref())?;

        if !leaf_cn.eq_ignore_ascii_case(expected) {
            return None;
        }
    }

    if let Some(expected) = &signer.cert_issuer {
        let issuer_cn = package.leaf.as_ref().and_then(|l| l.issuer_cn.as_deref())?;

        if !issuer_cn.eq_ignore_ascii_case(expected) {
            return None;
        }
    }

    if signer.has_file_attributes() {
        let attribute = signer
            .file_attributes
            .iter()
            .find(|a| attribute_matches(a, file_info))?;

        let wildcard =
            attribute.criteria == FileNameCriteria::OriginalFileName && attribute.value == "*";

        return Some(SignerMatch {
            signer,
            package,
            anchor,
            level: if wildcard {
                LEVEL_SIGNED_VERSION
            } else {
                LEVEL_FILE_PUBLISHER
            },
            attribute: Some(attribute),
        });
    }

    let level = if signer.cert_publisher.is_some() {
        LEVEL_PUBLISHER
    } else {
        anchor_level
    };

    Some(SignerMatch {
        signer,
        package,
        anchor,
        level,
        attribute: None,
    })
}

fn attribute_matches(attribute: &FileAttribute, file_info: &ExtendedFileInfo) -> bool {
    let wildcard =
        attribute.criteria == FileNameCriteria::OriginalFileName && attribute.value == "*";

    if !wildcard {
        let actual = match file_info.field(attribute.criteria) {
            Some(actual) => actual,
            None => return false,
        };

        if !actual.eq_ignore_ascii_case(&attribute.value) {
            return false;
        }
    }

    if attribute.min_version.is_some() || attribute.max_version.is_some() {
        let version = match file_info.file_version {
            Some(version) => version,
            None => return false,
        };

        if let Some(min) = attribute.min_version {
            if version < min {
                return false;
            }
        }

        if let Some(max) = attribute.max_version {
            if version > max {
                return false;
            }
        }
    }

    true
}

fn signer_verdict(
    path: &Path,
    m: &SignerMatch<'_>,
    is_authorized: bool,
    match_criteria: &str,
) -> SimulationOutput {
    // Intermediate-anchored matches report the matched intermediate's
    // identity. Everything else reports the leaf, falling back to the root
    // for root-only chains.
    let identity = if m.anchor.role == CertificateRole::Intermediate {
        m.anchor
    } else {
        m.package.leaf.as_ref().unwrap_or(&m.package.root)
    };

    let mut output = SimulationOutput::bare(path, VerdictSource::Signer, is_authorized, match_criteria);

    output.signer_id = Some(m.signer.id.clone());
    output.signer_name = Some(m.signer.name.clone());
    output.signer_cert_root = Some(m.signer.cert_root.clone());
    output.signer_cert_publisher = m.signer.cert_publisher.clone();
    output.signer_scope = Some(m.signer.scope.label().to_string());
    output.signer_file_attribute_ids = m.signer.file_attribute_ids.clone();
    output.specific_file_name_criteria = m.attribute.map(|a| a.criteria.label().to_string());
    output.cert_subject_cn = identity.subject_cn.clone();
    output.cert_issuer_cn = identity.issuer_cn.clone();
    output.cert_not_after = Some(identity.not_after.to_rfc3339());
    output.cert_tbs_value = Some(identity.tbs_hash.clone());

    output
}

fn catalog_verdict(path: &Path, hit: &CatalogHit) -> SimulationOutput {
    let mut output =
        SimulationOutput::bare(path, VerdictSource::CatalogSigned, true, CRITERIA_CATALOG);

    output.signer_name = Some(hit.catalog_path.display().to_string());
    output.cert_subject_cn = hit.subject_cn.clone();
    output.cert_issuer_cn = hit.issuer_cn.clone();
    output.cert_not_after = hit.not_after.clone();
    output.cert_tbs_value = hit.tbs_hash.clone();

    output
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            chain::{CertificateRole, ChainElement},
            policy::SignerScope,
        },
        chrono::{TimeZone, Utc},
        std::collections::BTreeSet,
    };

    fn element(role: CertificateRole, tbs: &str, subject: &str, issuer: &str) -> ChainElement {
        ChainElement {
            subject_cn: Some(subject.to_string()),
            issuer_cn: Some(issuer.to_string()),
            not_after: Utc.ymd(2030, 1, 1).and_hms(0, 0, 0),
            tbs_hash: tbs.to_string(),
            role,
        }
    }

    fn package(root_tbs: &str, leaf_subject: &str) -> ChainPackage {
        ChainPackage {
            root: element(CertificateRole::Root, root_tbs, "Root CA", "Root CA"),
            intermediates: vec![],
            leaf: Some(element(
                CertificateRole::Leaf,
                "LEAFTBS",
                leaf_subject,
                "Root CA",
            )),
        }
    }

    fn signer(id: &str, cert_root: &str, is_allowed: bool) -> PolicySigner {
        PolicySigner {
            id: id.to_string(),
            name: format!("{} name", id),
            cert_root: cert_root.to_string(),
            cert_publisher: None,
            cert_issuer: None,
            required_ekus: BTreeSet::new(),
            file_attribute_ids: vec![],
            file_attributes: vec![],
            scope: SignerScope::UserMode,
            is_allowed,
        }
    }

    fn attribute(value: &str, min: Option<&str>, max: Option<&str>) -> FileAttribute {
        FileAttribute {
            id: "ID_FILEATTRIB_T".to_string(),
            criteria: FileNameCriteria::OriginalFileName,
            value: value.to_string(),
            min_version: min.map(|v| v.parse().unwrap()),
            max_version: max.map(|v| v.parse().unwrap()),
        }
    }

    fn versioned_info(name: &str, version: &str) -> ExtendedFileInfo {
        ExtendedFileInfo {
            original_file_name: Some(name.to_string()),
            file_version: Some(version.parse().unwrap()),
            ..Default::default()
        }
    }

    const FILE: &str = "/scan/tool.exe";

    #[test]
    fn root_match_authorizes_at_root_level() {
        let packages = vec![package("ROOTTBS", "Contoso Corp")];
        let signers = vec![signer("ID_SIGNER_A", "ROOTTBS", true)];

        let out = decide(
            Path::new(FILE),
            &packages,
            &signers,
            &[],
            &ExtendedFileInfo::default(),
            None,
        );

        assert!(out.is_authorized);
        assert_eq!(out.source, VerdictSource::Signer);
        assert_eq!(out.match_criteria, LEVEL_ROOT_CERTIFICATE);
        assert_eq!(out.signer_id.as_deref(), Some("ID_SIGNER_A"));
        assert_eq!(out.cert_subject_cn.as_deref(), Some("Contoso Corp"));
    }

    #[test]
    fn unmatched_root_is_not_allowed() {
        let packages = vec![package("ROOTTBS", "Contoso Corp")];
        let signers = vec![signer("ID_SIGNER_A", "OTHERTBS", true)];

        let out = decide(
            Path::new(FILE),
            &packages,
            &signers,
            &[],
            &ExtendedFileInfo::default(),
            None,
        );

        assert!(!out.is_authorized);
        assert_eq!(out.match_criteria, CRITERIA_NOT_ALLOWED);
    }

    #[test]
    fn deny_wins_over_allow_across_packages() {
        let packages = vec![package("ALLOWTBS", "A"), package("DENYTBS", "B")];
        let signers = vec![
            signer("ID_SIGNER_ALLOW", "ALLOWTBS", true),
            signer("ID_SIGNER_DENY", "DENYTBS", false),
        ];

        let out = decide(
            Path::new(FILE),
            &packages,
            &signers,
            &[],
            &ExtendedFileInfo::default(),
            None,
        );

        assert!(!out.is_authorized);
        assert_eq!(out.match_criteria, CRITERIA_SIGNER_DENIED);
        assert_eq!(out.signer_id.as_deref(), Some("ID_SIGNER_DENY"));
    }

    #[test]
    fn eku_gate_blocks_insufficient_leaf_ekus() {
        let packages = vec![package("ROOTTBS", "Contoso Corp")];
        let mut s = signer("ID_SIGNER_A", "ROOTTBS", true);
        s.required_ekus.insert("1.3.6.1.4.1.311.10.3.5".to_string());

        let missing = decide(
            Path::new(FILE),
            &packages,
            &[s.clone()],
            &["1.3.6.1.5.5.7.3.3".to_string()],
            &ExtendedFileInfo::default(),
            None,
        );
        assert!(!missing.is_authorized);

        let satisfied = decide(
            Path::new(FILE),
            &packages,
            &[s],
            &[
                "1.3.6.1.5.5.7.3.3".to_string(),
                "1.3.6.1.4.1.311.10.3.5".to_string(),
            ],
            &ExtendedFileInfo::default(),
            None,
        );
        assert!(satisfied.is_authorized);
    }

    #[test]
    fn publisher_refinement_matches_leaf_cn() {
        let packages = vec![package("ROOTTBS", "Contoso Corp")];
        let mut s = signer("ID_SIGNER_A", "ROOTTBS", true);
        s.cert_publisher = Some("contoso corp".to_string());

        let out = decide(
            Path::new(FILE),
            &packages,
            &[s.clone()],
            &[],
            &ExtendedFileInfo::default(),
            None,
        );
        assert!(out.is_authorized);
        assert_eq!(out.match_criteria, LEVEL_PUBLISHER);

        s.cert_publisher = Some("Someone Else".to_string());
        let out = decide(
            Path::new(FILE),
            &packages,
            &[s],
            &[],
            &ExtendedFileInfo::default(),
            None,
        );
        assert!(!out.is_authorized);
    }

    #[test]
    fn version_bounds_are_inclusive() {
        let packages = vec![package("ROOTTBS", "Contoso Corp")];
        let mut s = signer("ID_SIGNER_A", "ROOTTBS", true);
        s.file_attributes = vec![attribute("TOOL.EXE", Some("2.0.0.0"), Some("3.0.0.0"))];
        s.file_attribute_ids = vec!["ID_FILEATTRIB_T".to_string()];

        let within = decide(
            Path::new(FILE),
            &packages,
            &[s.clone()],
            &[],
            &versioned_info("TOOL.EXE", "2.5.0.0"),
            None,
        );
        assert!(within.is_authorized);
        assert_eq!(within.match_criteria, LEVEL_FILE_PUBLISHER);
        assert_eq!(
            within.specific_file_name_criteria.as_deref(),
            Some("OriginalFileName")
        );

        let below = decide(
            Path::new(FILE),
            &packages,
            &[s.clone()],
            &[],
            &versioned_info("TOOL.EXE", "1.9.0.0"),
            None,
        );
        assert!(!below.is_authorized);

        let above = decide(
            Path::new(FILE),
            &packages,
            &[s],
            &[],
            &versioned_info("TOOL.EXE", "3.0.0.1"),
            None,
        );
        assert!(!above.is_authorized);
    }

    #[test]
    fn wildcard_attribute_reports_signed_version_level() {
        let packages = vec![package("ROOTTBS", "Contoso Corp")];
        let mut s = signer("ID_SIGNER_A", "ROOTTBS", true);
        s.file_attributes = vec![attribute("*", Some("1.0.0.0"), None)];

        let out = decide(
            Path::new(FILE),
            &packages,
            &[s],
            &[],
            &versioned_info("ANYTHING.EXE", "5.0.0.0"),
            None,
        );

        assert!(out.is_authorized);
        assert_eq!(out.match_criteria, LEVEL_SIGNED_VERSION);
    }

    #[test]
    fn leaf_anchored_signer_reports_leaf_level() {
        let packages = vec![package("ROOTTBS", "Contoso Corp")];
        let signers = vec![signer("ID_SIGNER_A", "LEAFTBS", true)];

        let out = decide(
            Path::new(FILE),
            &packages,
            &signers,
            &[],
            &ExtendedFileInfo::default(),
            None,
        );

        assert!(out.is_authorized);
        assert_eq!(out.match_criteria, LEVEL_LEAF_CERTIFICATE);
    }

    #[test]
    fn intermediate_anchored_signer_matches_at_publisher_level() {
        // Production signers are typically anchored at the issuing PCA,
        // which classifies as an intermediate in chains of 3 or more.
        let mut package = package("ROOTTBS", "Contoso Corp");
        package.intermediates = vec![element(
            CertificateRole::Intermediate,
            "PCATBS",
            "Contoso Code Signing PCA",
            "Root CA",
        )];

        let mut s = signer("ID_SIGNER_A", "PCATBS", true);
        s.cert_publisher = Some("Contoso Corp".to_string());

        let out = decide(
            Path::new(FILE),
            &[package.clone()],
            &[s],
            &[],
            &ExtendedFileInfo::default(),
            None,
        );

        assert!(out.is_authorized);
        assert_eq!(out.match_criteria, LEVEL_PUBLISHER);
        assert_eq!(out.cert_tbs_value.as_deref(), Some("PCATBS"));
        assert_eq!(
            out.cert_subject_cn.as_deref(),
            Some("Contoso Code Signing PCA")
        );

        // Without a publisher refinement the same anchor authorizes at the
        // PCA level.
        let out = decide(
            Path::new(FILE),
            &[package],
            &[signer("ID_SIGNER_B", "PCATBS", true)],
            &[],
            &ExtendedFileInfo::default(),
            None,
        );

        assert!(out.is_authorized);
        assert_eq!(out.match_criteria, LEVEL_ROOT_CERTIFICATE);
    }

    #[test]
    fn unsigned_file_uses_catalog_fallback() {
        let hit = CatalogHit {
            catalog_path: PathBuf::from("/catroot/drivers.cat"),
            subject_cn: Some("Catalog Leaf".to_string()),
            issuer_cn: None,
            not_after: None,
            tbs_hash: None,
        };

        let out = decide(
            Path::new(FILE),
            &[],
            &[],
            &[],
            &ExtendedFileInfo::default(),
            Some(&hit),
        );
        assert!(out.is_authorized);
        assert_eq!(out.source, VerdictSource::CatalogSigned);
        assert_eq!(out.match_criteria, CRITERIA_CATALOG);

        let out = decide(
            Path::new(FILE),
            &[],
            &[],
            &[],
            &ExtendedFileInfo::default(),
            None,
        );
        assert!(!out.is_authorized);
        assert_eq!(out.source, VerdictSource::Unsigned);
    }
}
