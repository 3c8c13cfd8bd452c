// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Application control policy parsing and rule extraction.
//!
//! Policies are XML documents rooted at a `SiPolicy` element. This module
//! lowers the document into the rule structures the simulation consumes:
//! hash records, literal file path rules, signers with their certificate
//! root / publisher / EKU / file attribute constraints, and an allow-all
//! flag. Rule kinds are discriminated at parse time; nothing downstream
//! inspects raw XML.

use {
    crate::{error::AppControlSimError, file_metadata::FileVersion},
    once_cell::sync::Lazy,
    std::{
        collections::{BTreeMap, BTreeSet, HashMap},
        fmt::Write as _,
        io::Read,
        path::Path,
    },
    xml::reader::{EventReader, XmlEvent},
};

/// User mode code integrity signing scenario value.
pub const SCENARIO_USER_MODE: &str = "12";

/// Kernel mode code integrity signing scenario value.
pub const SCENARIO_KERNEL_MODE: &str = "131";

/// Well-known certificate root codes and their canonical TBS hash and
/// display name. Policies may reference common Microsoft roots by a short
/// code instead of a TBS value.
static WELL_KNOWN_ROOTS: Lazy<HashMap<&'static str, (&'static str, &'static str)>> =
    Lazy::new(|| {
        let mut m = HashMap::new();
        m.insert(
            "03",
            (
                "D67576F5521D1CCAB52E9215E0F9F743",
                "Microsoft Authenticode(tm) Root Authority",
            ),
        );
        m.insert(
            "04",
            (
                "8B3C3087B7056F5EC5DDBA91A1B901F0",
                "Microsoft Root Authority",
            ),
        );
        m.insert(
            "05",
            (
                "391BE92883D52509155BFEAE27B9BD340170B76B",
                "Microsoft Root Certificate Authority",
            ),
        );
        m.insert(
            "06",
            (
                "08FBA831C08544208F5208686B991CA1B2CFC510E7301784DDF1EB5BF0393239",
                "Microsoft Root Certificate Authority 2010",
            ),
        );
        m.insert(
            "07",
            (
                "279CD652C4E252BFBE5217AC722205D7729BA409148CFA9E6D9E5B1CB94EAFF1",
                "Microsoft Root Certificate Authority 2011",
            ),
        );
        m.insert(
            "09",
            (
                "09CBAFBD98E81B4D6BAAAB32B8B2F5D7",
                "Microsoft Test Root Authority",
            ),
        );
        m.insert(
            "0A",
            (
                "7A4D9890B0F9006A6F77472D50D83CA54975FCC2B7EA0563490134E19B78782A",
                "Microsoft Testing Root Certificate Authority 2010",
            ),
        );
        m.insert(
            "0E",
            (
                "ED55F82E1444F79CA9DCE826846FDC4E0EA3859E3D26EFEF412D2FFF0C7C8E6C",
                "Microsoft Development Root Certificate Authority 2014",
            ),
        );
        m.insert(
            "0G",
            (
                "68D221D720E975DB5CD14B24F2970F86A5B8605A2A1BC784A17B83F7CF500A70EB177CE228273B8540A800178F23EAC8",
                "Microsoft ECC Testing Root Certificate Authority 2017",
            ),
        );
        m.insert(
            "0H",
            (
                "214592CB01B59104195F80AF2886DBF85771AF42A3821D104BF18F415158C49CBC233511672CD6C432351AC9228E3E75",
                "Microsoft ECC Development Root Certificate Authority 2018",
            ),
        );
        m.insert(
            "0I",
            (
                "32991981BF1575A1A5303BB93A381723EA346B9EC130FDB596A75BA1D7CE0B0A06570BB985D25841E23BE944E8FF118F",
                "Microsoft ECC Product Root Certificate Authority 2018",
            ),
        );
        m
    });

/// Hash type label embedded in a hash rule's friendly name.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HashAlgorithmLabel {
    Sha1,
    Sha256,
    PageSha1,
    PageSha256,
    AuthenticodeSip256,
}

impl HashAlgorithmLabel {
    fn from_suffix(friendly_name: &str) -> Option<(Self, &str)> {
        // Longer suffixes first so "Hash Page Sha1" is not mistaken for
        // "Hash Sha1".
        const SUFFIXES: &[(&str, HashAlgorithmLabel)] = &[
            (" Hash Authenticode SIP Sha256", HashAlgorithmLabel::AuthenticodeSip256),
            (" Hash Page Sha256", HashAlgorithmLabel::PageSha256),
            (" Hash Page Sha1", HashAlgorithmLabel::PageSha1),
            (" Hash Sha256", HashAlgorithmLabel::Sha256),
            (" Hash Sha1", HashAlgorithmLabel::Sha1),
        ];

        for (suffix, label) in SUFFIXES {
            if let Some(prefix) = friendly_name.strip_suffix(suffix) {
                return Some((*label, prefix));
            }
        }

        None
    }
}

/// A single hash rule lowered from an `<Allow>` element.
#[derive(Clone, Debug)]
pub struct HashRecord {
    pub hash_value: String,
    pub label: HashAlgorithmLabel,
    pub associated_file_path: String,
}

/// Which descriptive field of a file an attribute constrains.
///
/// Ordering reflects the match specificity ladder: original filename is the
/// most specific criterion, product name the least.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum FileNameCriteria {
    OriginalFileName,
    FileDescription,
    InternalName,
    ProductName,
}

impl FileNameCriteria {
    pub fn label(&self) -> &'static str {
        match self {
            Self::OriginalFileName => "OriginalFileName",
            Self::FileDescription => "FileDescription",
            Self::InternalName => "InternalName",
            Self::ProductName => "ProductName",
        }
    }
}

/// A file attribute entry referenced by a signer.
#[derive(Clone, Debug)]
pub struct FileAttribute {
    pub id: String,
    pub criteria: FileNameCriteria,
    pub value: String,
    pub min_version: Option<FileVersion>,
    pub max_version: Option<FileVersion>,
}

/// Reporting scope for a signer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignerScope {
    UserMode,
    KernelMode,
}

impl SignerScope {
    pub fn label(&self) -> &'static str {
        match self {
            Self::UserMode => "UserMode",
            Self::KernelMode => "KernelMode",
        }
    }
}

/// One policy signer, with all referenced tables resolved.
#[derive(Clone, Debug)]
pub struct PolicySigner {
    pub id: String,
    pub name: String,
    /// Uppercase hex TBS value of the certificate element this signer is
    /// anchored to. Well-known root codes are resolved before this is set.
    pub cert_root: String,
    pub cert_publisher: Option<String>,
    pub cert_issuer: Option<String>,
    pub required_ekus: BTreeSet<String>,
    pub file_attribute_ids: Vec<String>,
    pub file_attributes: Vec<FileAttribute>,
    pub scope: SignerScope,
    pub is_allowed: bool,
}

impl PolicySigner {
    pub fn has_eku_requirement(&self) -> bool {
        !self.required_ekus.is_empty()
    }

    pub fn has_file_attributes(&self) -> bool {
        !self.file_attributes.is_empty()
    }
}

/// All rules extracted from one policy document.
#[derive(Clone, Debug, Default)]
pub struct PolicyRules {
    pub hash_records: Vec<HashRecord>,
    pub file_path_rules: BTreeSet<String>,
    pub signers: Vec<PolicySigner>,
    pub allow_all: bool,
}

impl PolicyRules {
    /// Parse and extract rules from a policy file on disk.
    pub fn from_file(path: &Path) -> Result<Self, AppControlSimError> {
        if !path.exists() {
            return Err(AppControlSimError::PolicyNotFound(path.to_path_buf()));
        }

        let data = std::fs::read(path)?;

        Self::from_xml(data.as_slice())
    }

    /// Parse and extract rules from policy XML.
    ///
    /// A document whose root element is not `SiPolicy` is malformed. Any
    /// missing optional table degrades to an empty collection.
    pub fn from_xml(reader: impl Read) -> Result<Self, AppControlSimError> {
        let root = Element::parse(reader)?;

        if root.name != "SiPolicy" {
            return Err(AppControlSimError::MalformedPolicy(format!(
                "root element is <{}>, expected <SiPolicy>",
                root.name
            )));
        }

        let file_rules = root.child("FileRules");

        let mut hash_records = vec![];
        let mut file_path_rules = BTreeSet::new();
        let mut allow_all = false;
        let mut file_attributes: BTreeMap<String, FileAttribute> = BTreeMap::new();

        if let Some(file_rules) = file_rules {
            for rule in &file_rules.children {
                match rule.name.as_str() {
                    "Allow" => {
                        if let Some(hash) = rule.attr("Hash") {
                            if let Some(record) = hash_record_from_rule(rule, hash) {
                                hash_records.push(record);
                            }
                        } else if let Some(path) = rule.attr("FilePath") {
                            file_path_rules.insert(path.to_string());
                        } else if rule.attr("FileName") == Some("*")
                            && rule.attr("MinimumFileVersion").is_none()
                            && rule.attr("MaximumFileVersion").is_none()
                        {
                            allow_all = true;
                        }
                    }
                    "FileAttrib" => {
                        if let Some(attrib) = file_attribute_from_element(rule) {
                            file_attributes.insert(attrib.id.clone(), attrib);
                        }
                    }
                    _ => {}
                }
            }
        }

        let eku_table = extract_eku_table(&root);
        let signers = extract_signers(&root, &eku_table, &file_attributes)?;

        Ok(Self {
            hash_records,
            file_path_rules,
            signers,
            allow_all,
        })
    }

    /// The set of hash values eligible for hash-level matching.
    ///
    /// Only whole-file SHA-256 records participate; page and SIP hashes are
    /// carried for reporting but never matched.
    pub fn matchable_hashes(&self) -> BTreeSet<&str> {
        self.hash_records
            .iter()
            .filter(|r| r.label == HashAlgorithmLabel::Sha256)
            .map(|r| r.hash_value.as_str())
            .collect()
    }
}

fn hash_record_from_rule(rule: &Element, hash: &str) -> Option<HashRecord> {
    let friendly_name = rule.attr("FriendlyName")?;
    let (label, path) = HashAlgorithmLabel::from_suffix(friendly_name)?;

    Some(HashRecord {
        hash_value: hash.to_ascii_uppercase(),
        label,
        associated_file_path: path.to_string(),
    })
}

fn file_attribute_from_element(rule: &Element) -> Option<FileAttribute> {
    let id = rule.attr("ID")?.to_string();

    // Strict priority order when more than one field is declared.
    let (criteria, value) = if let Some(v) = rule.attr("FileName") {
        (FileNameCriteria::OriginalFileName, v)
    } else if let Some(v) = rule.attr("FileDescription") {
        (FileNameCriteria::FileDescription, v)
    } else if let Some(v) = rule.attr("InternalName") {
        (FileNameCriteria::InternalName, v)
    } else if let Some(v) = rule.attr("ProductName") {
        (FileNameCriteria::ProductName, v)
    } else {
        return None;
    };

    Some(FileAttribute {
        id,
        criteria,
        value: value.to_string(),
        min_version: rule.attr("MinimumFileVersion").and_then(|v| v.parse().ok()),
        max_version: rule.attr("MaximumFileVersion").and_then(|v| v.parse().ok()),
    })
}

fn extract_eku_table(root: &Element) -> BTreeMap<String, String> {
    let mut table = BTreeMap::new();

    if let Some(ekus) = root.child("EKUs") {
        for eku in ekus.children_named("EKU") {
            if let (Some(id), Some(value)) = (eku.attr("ID"), eku.attr("Value")) {
                match convert_hex_to_oid(value) {
                    Ok(oid) => {
                        table.insert(id.to_string(), oid);
                    }
                    Err(e) => {
                        log::warn!("skipping EKU {} with undecodable value: {}", id, e);
                    }
                }
            }
        }
    }

    table
}

fn extract_signers(
    root: &Element,
    eku_table: &BTreeMap<String, String>,
    file_attributes: &BTreeMap<String, FileAttribute>,
) -> Result<Vec<PolicySigner>, AppControlSimError> {
    let mut um_allowed = BTreeSet::new();
    let mut um_denied = BTreeSet::new();
    let mut km_allowed = BTreeSet::new();
    let mut km_denied = BTreeSet::new();

    if let Some(scenarios) = root.child("SigningScenarios") {
        for scenario in scenarios.children_named("SigningScenario") {
            let (allowed, denied) = match scenario.attr("Value") {
                Some(SCENARIO_USER_MODE) => (&mut um_allowed, &mut um_denied),
                Some(SCENARIO_KERNEL_MODE) => (&mut km_allowed, &mut km_denied),
                _ => continue,
            };

            if let Some(product) = scenario.child("ProductSigners") {
                if let Some(list) = product.child("AllowedSigners") {
                    for entry in list.children_named("AllowedSigner") {
                        if let Some(id) = entry.attr("SignerId") {
                            allowed.insert(id.to_string());
                        }
                    }
                }
                if let Some(list) = product.child("DeniedSigners") {
                    for entry in list.children_named("DeniedSigner") {
                        if let Some(id) = entry.attr("SignerId") {
                            denied.insert(id.to_string());
                        }
                    }
                }
            }
        }
    }

    let mut signers = vec![];

    if let Some(signer_table) = root.child("Signers") {
        for signer in signer_table.children_named("Signer") {
            let id = match signer.attr("ID") {
                Some(id) => id.to_string(),
                None => continue,
            };

            let denied = um_denied.contains(&id) || km_denied.contains(&id);
            let allowed = um_allowed.contains(&id) || km_allowed.contains(&id);

            // Signers referenced by neither scenario belong to update or
            // supplemental policy sections and are not product signers.
            if !denied && !allowed {
                continue;
            }

            let mut name = signer.attr("Name").unwrap_or("").to_string();

            let cert_root = match signer.child("CertRoot") {
                Some(cert_root) => {
                    let value = cert_root.attr("Value").unwrap_or("");

                    if cert_root.attr("Type") == Some("Wellknown") {
                        match WELL_KNOWN_ROOTS.get(value) {
                            Some((tbs, display_name)) => {
                                name = (*display_name).to_string();
                                (*tbs).to_string()
                            }
                            None => {
                                log::warn!(
                                    "signer {} references unknown well-known root {}",
                                    id,
                                    value
                                );
                                continue;
                            }
                        }
                    } else {
                        value.to_ascii_uppercase()
                    }
                }
                None => continue,
            };

            let required_ekus = signer
                .children_named("CertEKU")
                .filter_map(|e| e.attr("ID"))
                .filter_map(|eku_id| eku_table.get(eku_id).cloned())
                .collect::<BTreeSet<_>>();

            let file_attribute_ids = signer
                .children_named("FileAttribRef")
                .filter_map(|e| e.attr("RuleID"))
                .map(|s| s.to_string())
                .collect::<Vec<_>>();

            let resolved_attributes = file_attribute_ids
                .iter()
                .filter_map(|attr_id| file_attributes.get(attr_id).cloned())
                .collect::<Vec<_>>();

            let scope = if um_allowed.contains(&id) {
                SignerScope::UserMode
            } else {
                SignerScope::KernelMode
            };

            signers.push(PolicySigner {
                id,
                name,
                cert_root,
                cert_publisher: signer
                    .child("CertPublisher")
                    .and_then(|e| e.attr("Value"))
                    .map(|s| s.to_string()),
                cert_issuer: signer
                    .child("CertIssuer")
                    .and_then(|e| e.attr("Value"))
                    .map(|s| s.to_string()),
                required_ekus,
                file_attribute_ids,
                file_attributes: resolved_attributes,
                scope,
                is_allowed: allowed && !denied,
            });
        }
    }

    Ok(signers)
}

/// Decode a policy EKU value into a dotted OID string.
///
/// The value is a hex string whose first byte is a placeholder tag and
/// second byte the content length; the remaining bytes are standard
/// base-128 OID content.
pub fn convert_hex_to_oid(value: &str) -> Result<String, AppControlSimError> {
    let bytes = hex::decode(value)
        .map_err(|e| AppControlSimError::MalformedPolicy(format!("bad EKU hex: {}", e)))?;

    if bytes.len() < 3 {
        return Err(AppControlSimError::MalformedPolicy(format!(
            "EKU value {} too short",
            value
        )));
    }

    let content = &bytes[2..];

    let mut oid = format!("{}.{}", content[0] / 40, content[0] % 40);

    let mut arc: u64 = 0;
    for &byte in &content[1..] {
        arc = (arc << 7) | u64::from(byte & 0x7f);

        if byte & 0x80 == 0 {
            write!(oid, ".{}", arc)
                .map_err(|e| AppControlSimError::MalformedPolicy(e.to_string()))?;
            arc = 0;
        }
    }

    Ok(oid)
}

/// Minimal XML element tree. Namespaces are ignored; only local names,
/// attributes and element nesting are retained.
#[derive(Clone, Debug)]
struct Element {
    name: String,
    attributes: HashMap<String, String>,
    children: Vec<Element>,
}

impl Element {
    fn parse(reader: impl Read) -> Result<Self, AppControlSimError> {
        let parser = EventReader::new(reader);

        let mut stack: Vec<Element> = vec![];
        let mut root = None;

        for event in parser {
            match event? {
                XmlEvent::StartElement {
                    name, attributes, ..
                } => {
                    stack.push(Element {
                        name: name.local_name,
                        attributes: attributes
                            .into_iter()
                            .map(|a| (a.name.local_name, a.value))
                            .collect(),
                        children: vec![],
                    });
                }
                XmlEvent::EndElement { .. } => {
                    let element = match stack.pop() {
                        Some(element) => element,
                        None => {
                            return Err(AppControlSimError::MalformedPolicy(
                                "unbalanced element nesting".into(),
                            ))
                        }
                    };

                    match stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None => root = Some(element),
                    }
                }
                _ => {}
            }
        }

        root.ok_or_else(|| AppControlSimError::MalformedPolicy("empty document".into()))
    }

    fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(|s| s.as_str())
    }

    fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |c| c.name == name)
    }
}

#[cfg(test)]
mod tests {
    use {super::*, indoc::indoc};

    const POLICY: &str = indoc! {r#"
        <?xml version="1.0" encoding="utf-8"?>
        <SiPolicy xmlns="urn:schemas-microsoft-com:sipolicy" PolicyType="Base Policy">
          <VersionEx>10.0.0.0</VersionEx>
          <EKUs>
            <EKU ID="ID_EKU_WHQL" Value="010A2B0601040182370A0305" FriendlyName="WHQL" />
          </EKUs>
          <FileRules>
            <Allow ID="ID_ALLOW_HASH_1" FriendlyName="C:\apps\tool.exe Hash Sha256" Hash="aabbccdd" />
            <Allow ID="ID_ALLOW_HASH_2" FriendlyName="C:\apps\tool.exe Hash Page Sha256" Hash="11223344" />
            <Allow ID="ID_ALLOW_PATH_1" FriendlyName="path rule" FilePath="C:\trusted\run.exe" />
            <FileAttrib ID="ID_FILEATTRIB_1" FileName="TOOL.EXE" MinimumFileVersion="2.0.0.0" MaximumFileVersion="3.0.0.0" />
            <FileAttrib ID="ID_FILEATTRIB_2" ProductName="Example Product" />
          </FileRules>
          <Signers>
            <Signer ID="ID_SIGNER_A" Name="Contoso Signer">
              <CertRoot Type="TBS" Value="00ff00ff" />
              <CertPublisher Value="Contoso Corp" />
              <CertEKU ID="ID_EKU_WHQL" />
              <FileAttribRef RuleID="ID_FILEATTRIB_1" />
            </Signer>
            <Signer ID="ID_SIGNER_WK" Name="placeholder">
              <CertRoot Type="Wellknown" Value="06" />
            </Signer>
            <Signer ID="ID_SIGNER_DENIED" Name="Blocked Signer">
              <CertRoot Type="TBS" Value="deadbeef" />
            </Signer>
            <Signer ID="ID_SIGNER_ORPHAN" Name="Update Signer">
              <CertRoot Type="TBS" Value="12345678" />
            </Signer>
          </Signers>
          <SigningScenarios>
            <SigningScenario Value="12" ID="ID_SIGNINGSCENARIO_UM" FriendlyName="User Mode">
              <ProductSigners>
                <AllowedSigners>
                  <AllowedSigner SignerId="ID_SIGNER_A" />
                  <AllowedSigner SignerId="ID_SIGNER_WK" />
                </AllowedSigners>
                <DeniedSigners>
                  <DeniedSigner SignerId="ID_SIGNER_DENIED" />
                </DeniedSigners>
              </ProductSigners>
            </SigningScenario>
          </SigningScenarios>
        </SiPolicy>
    "#};

    fn parsed() -> PolicyRules {
        PolicyRules::from_xml(POLICY.as_bytes()).unwrap()
    }

    #[test]
    fn rejects_non_sipolicy_root() {
        let err = PolicyRules::from_xml("<Wrong />".as_bytes()).unwrap_err();

        assert!(matches!(err, AppControlSimError::MalformedPolicy(_)));
    }

    #[test]
    fn extracts_hash_and_path_rules() {
        let rules = parsed();

        assert_eq!(rules.hash_records.len(), 2);
        assert_eq!(rules.hash_records[0].hash_value, "AABBCCDD");
        assert_eq!(rules.hash_records[0].label, HashAlgorithmLabel::Sha256);
        assert_eq!(
            rules.hash_records[0].associated_file_path,
            "C:\\apps\\tool.exe"
        );
        assert_eq!(rules.hash_records[1].label, HashAlgorithmLabel::PageSha256);

        // Only the whole-file SHA-256 record is matchable.
        assert_eq!(rules.matchable_hashes().len(), 1);
        assert!(rules.matchable_hashes().contains("AABBCCDD"));

        assert!(rules.file_path_rules.contains("C:\\trusted\\run.exe"));
        assert!(!rules.allow_all);
    }

    #[test]
    fn allow_all_detected() {
        let xml = indoc! {r#"
            <SiPolicy>
              <FileRules>
                <Allow ID="ID_ALLOW_A_1" FriendlyName="allow everything" FileName="*" />
              </FileRules>
            </SiPolicy>
        "#};

        assert!(PolicyRules::from_xml(xml.as_bytes()).unwrap().allow_all);
    }

    #[test]
    fn signer_constraints_resolved() {
        let rules = parsed();

        let a = rules.signers.iter().find(|s| s.id == "ID_SIGNER_A").unwrap();
        assert!(a.is_allowed);
        assert_eq!(a.cert_root, "00FF00FF");
        assert_eq!(a.cert_publisher.as_deref(), Some("Contoso Corp"));
        assert!(a.required_ekus.contains("1.3.6.1.4.1.311.10.3.5"));
        assert_eq!(a.file_attributes.len(), 1);
        assert_eq!(
            a.file_attributes[0].criteria,
            FileNameCriteria::OriginalFileName
        );
        assert_eq!(
            a.file_attributes[0].min_version,
            Some("2.0.0.0".parse().unwrap())
        );
        assert_eq!(a.scope, SignerScope::UserMode);
    }

    #[test]
    fn well_known_root_resolved_to_canonical_identity() {
        let rules = parsed();

        let wk = rules
            .signers
            .iter()
            .find(|s| s.id == "ID_SIGNER_WK")
            .unwrap();
        assert_eq!(
            wk.cert_root,
            "08FBA831C08544208F5208686B991CA1B2CFC510E7301784DDF1EB5BF0393239"
        );
        assert_eq!(wk.name, "Microsoft Root Certificate Authority 2010");
    }

    #[test]
    fn denied_signer_retained_and_orphan_dropped() {
        let rules = parsed();

        let denied = rules
            .signers
            .iter()
            .find(|s| s.id == "ID_SIGNER_DENIED")
            .unwrap();
        assert!(!denied.is_allowed);

        assert!(!rules.signers.iter().any(|s| s.id == "ID_SIGNER_ORPHAN"));
    }

    #[test]
    fn whql_eku_decodes() {
        assert_eq!(
            convert_hex_to_oid("010A2B0601040182370A0305").unwrap(),
            "1.3.6.1.4.1.311.10.3.5"
        );
    }
}
