// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulation orchestration.
//!
//! Drives a full policy simulation: load the policy, enumerate candidate
//! files, optionally index security catalogs, then evaluate every file on
//! a bounded worker pool. Evaluation applies the cheap rule families first
//! (allow-all, file path, hash, unsigned extension) and falls through to
//! signature extraction plus signer arbitration. Every candidate file ends
//! up with exactly one verdict; per-file failures become rejection verdicts
//! rather than run failures.

use {
    crate::{
        arbitrator::{
            self, CatalogHit, SimulationOutput, VerdictSource, CRITERIA_ALLOW_ALL,
            CRITERIA_FILE_PATH, CRITERIA_HASH, CRITERIA_HASH_MISMATCH, CRITERIA_INACCESSIBLE,
            CRITERIA_NOT_ALLOWED,
        },
        authenticode_hash::{compute_file_hashes, CodeIntegrityHashes},
        catalog::CatalogIndex,
        chain::{classify_signatures, common_name},
        error::AppControlSimError,
        file_metadata::ExtendedFileInfo,
        policy::PolicyRules,
        scan,
        signature_reader::{signature_from_pkcs7, PeSignatureReader, SignatureReader},
    },
    std::{
        collections::{BTreeMap, BTreeSet},
        io::Write,
        path::{Path, PathBuf},
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Mutex,
        },
    },
};

/// Everything a simulation run needs.
#[derive(Clone, Debug, Default)]
pub struct SimulationRequest {
    pub policy_path: PathBuf,
    pub files: Vec<PathBuf>,
    pub folders: Vec<PathBuf>,
    pub catalog_folders: Vec<PathBuf>,
    /// Worker count, clamped to a minimum of 1.
    pub threads: usize,
    /// When set, the result set is also exported as CSV to this path.
    pub csv_path: Option<PathBuf>,
}

/// Run a full simulation, returning one verdict per candidate file keyed
/// by path.
///
/// `progress` is invoked with a 0-100 percentage from worker threads and
/// must be cheap. `cancel` is checked once per file; a cancelled run
/// returns the verdicts accumulated so far.
pub fn run_simulation(
    request: &SimulationRequest,
    progress: Option<&(dyn Fn(u8) + Send + Sync)>,
    cancel: Option<&AtomicBool>,
) -> Result<BTreeMap<PathBuf, SimulationOutput>, AppControlSimError> {
    let policy = PolicyRules::from_file(&request.policy_path)?;

    let candidates = scan::collect_candidate_files(&request.files, &request.folders)?;

    log::info!(
        "simulating {} files against {}",
        candidates.len(),
        request.policy_path.display()
    );

    let results = if policy.allow_all {
        log::info!("policy allows all files, skipping per-file evaluation");

        candidates
            .into_iter()
            .map(|path| {
                let output = SimulationOutput::bare(
                    &path,
                    VerdictSource::AllowAllRule,
                    true,
                    CRITERIA_ALLOW_ALL,
                );
                (path, output)
            })
            .collect()
    } else {
        let catalogs = CatalogIndex::build(&request.catalog_folders)?;

        scan_files(&candidates, &policy, &catalogs, request.threads, progress, cancel)
    };

    if let Some(csv_path) = &request.csv_path {
        export_csv(csv_path, &results)?;
        log::info!("exported {} verdicts to {}", results.len(), csv_path.display());
    }

    Ok(results)
}

/// Run a simulation and report whether every file was authorized.
pub fn all_authorized(request: &SimulationRequest) -> Result<bool, AppControlSimError> {
    let results = run_simulation(request, None, None)?;

    Ok(results.values().all(|output| output.is_authorized))
}

fn scan_files(
    candidates: &[PathBuf],
    policy: &PolicyRules,
    catalogs: &CatalogIndex,
    threads: usize,
    progress: Option<&(dyn Fn(u8) + Send + Sync)>,
    cancel: Option<&AtomicBool>,
) -> BTreeMap<PathBuf, SimulationOutput> {
    let matchable_hashes = policy.matchable_hashes();

    let results = Mutex::new(BTreeMap::new());
    let processed = AtomicUsize::new(0);
    let total = candidates.len();

    let thread_count = threads.max(1);
    let chunk_size = (total + thread_count - 1) / thread_count;

    std::thread::scope(|scope| {
        for chunk in candidates.chunks(chunk_size.max(1)) {
            let results = &results;
            let processed = &processed;
            let matchable_hashes = &matchable_hashes;

            scope.spawn(move || {
                for path in chunk {
                    if let Some(cancel) = cancel {
                        if cancel.load(Ordering::Relaxed) {
                            return;
                        }
                    }

                    let output = match evaluate_file(path, policy, matchable_hashes, catalogs) {
                        Ok(output) => output,
                        Err(e) => SimulationOutput::bare(
                            path,
                            VerdictSource::Unknown,
                            false,
                            format!("UnknownError: {}", e),
                        ),
                    };

                    results
                        .lock()
                        .expect("result map lock poisoned")
                        .entry(path.clone())
                        .or_insert(output);

                    let done = processed.fetch_add(1, Ordering::Relaxed) + 1;

                    if let Some(progress) = progress {
                        progress(((done * 100 / total).min(100)) as u8);
                    }
                }
            });
        }
    });

    results.into_inner().expect("result map lock poisoned")
}

fn evaluate_file(
    path: &Path,
    policy: &PolicyRules,
    matchable_hashes: &BTreeSet<&str>,
    catalogs: &CatalogIndex,
) -> Result<SimulationOutput, AppControlSimError> {
    if policy
        .file_path_rules
        .contains(path.to_string_lossy().as_ref())
    {
        return Ok(SimulationOutput::bare(
            path,
            VerdictSource::FilePath,
            true,
            CRITERIA_FILE_PATH,
        ));
    }

    let hashes = match compute_file_hashes(path) {
        Ok(hashes) => hashes,
        Err(e) => {
            log::warn!("cannot hash {}: {}", path.display(), e);

            return Ok(SimulationOutput::bare(
                path,
                VerdictSource::Unknown,
                false,
                CRITERIA_INACCESSIBLE,
            ));
        }
    };

    let hash_matched = [&hashes.sha256_authenticode, &hashes.sha1_authenticode]
        .iter()
        .any(|h| {
            h.as_deref()
                .map(|h| matchable_hashes.contains(h))
                .unwrap_or(false)
        });

    if hash_matched {
        return Ok(SimulationOutput::bare(
            path,
            VerdictSource::Hash,
            true,
            CRITERIA_HASH,
        ));
    }

    // Script-like formats carry no usable signature; without a hash match
    // they are rejected before any signature work.
    if scan::has_unsigned_rejected_extension(path) {
        return Ok(SimulationOutput::bare(
            path,
            VerdictSource::Unsigned,
            false,
            CRITERIA_NOT_ALLOWED,
        ));
    }

    let signatures = match PeSignatureReader.read_signatures(path) {
        Ok(signatures) => signatures,
        Err(e) => {
            log::warn!("signature extraction failed for {}: {}", path.display(), e);
            vec![]
        }
    };

    let packages = match classify_signatures(&signatures) {
        Ok(packages) => packages,
        Err(e) => {
            log::warn!("chain classification failed for {}: {}", path.display(), e);

            return Ok(SimulationOutput::bare(
                path,
                VerdictSource::Signer,
                false,
                CRITERIA_HASH_MISMATCH,
            ));
        }
    };

    let file_ekus = signatures
        .iter()
        .flat_map(|s| s.eku_oids.iter().cloned())
        .collect::<Vec<_>>();

    let file_info = ExtendedFileInfo::from_file(path).unwrap_or_default();

    let catalog_hit = if packages.is_empty() {
        catalog_lookup(&hashes, catalogs)
    } else {
        None
    };

    Ok(arbitrator::decide(
        path,
        &packages,
        &policy.signers,
        &file_ekus,
        &file_info,
        catalog_hit.as_ref(),
    ))
}

/// Look up a file's hashes in the catalog index, SHA-1 first, and derive
/// the catalog's own signing identity for reporting.
fn catalog_lookup(hashes: &CodeIntegrityHashes, catalogs: &CatalogIndex) -> Option<CatalogHit> {
    let catalog_path = [&hashes.sha1_authenticode, &hashes.sha256_authenticode]
        .iter()
        .find_map(|h| h.as_deref().and_then(|h| catalogs.lookup(h)))?
        .to_path_buf();

    let mut hit = CatalogHit {
        catalog_path: catalog_path.clone(),
        subject_cn: None,
        issuer_cn: None,
        not_after: None,
        tbs_hash: None,
    };

    // Catalog files are raw PKCS#7, their own chain names the authority.
    if let Ok(data) = std::fs::read(&catalog_path) {
        if let Ok(Some(signature)) = signature_from_pkcs7(&data) {
            if let Some(leaf) = signature.chain.first() {
                hit.subject_cn = common_name(leaf.subject_name());
                hit.issuer_cn = common_name(leaf.issuer_name());
                hit.tbs_hash = crate::chain::tbs_hash(leaf).ok();
            }
        }
    }

    Some(hit)
}

const CSV_HEADER: &str = "\"Path\",\"Source\",\"IsAuthorized\",\"SignerID\",\"SignerName\",\"SignerCertRoot\",\"SignerCertPublisher\",\"SignerScope\",\"SignerFileAttributeIDs\",\"MatchCriteria\",\"SpecificFileNameLevelMatchCriteria\",\"CertSubjectCN\",\"CertIssuerCN\",\"CertNotAfter\",\"CertTBSValue\",\"FilePath\"";

/// Export the result set as CSV with a fixed column order. Every value is
/// double-quoted; attribute ID lists are comma-joined inside their field.
pub fn export_csv(
    path: &Path,
    results: &BTreeMap<PathBuf, SimulationOutput>,
) -> Result<(), AppControlSimError> {
    let mut file = std::fs::File::create(path)?;

    writeln!(file, "{}", CSV_HEADER)?;

    for output in results.values() {
        let columns = [
            output.file_name.clone(),
            output.source.label().to_string(),
            output.is_authorized.to_string(),
            output.signer_id.clone().unwrap_or_default(),
            output.signer_name.clone().unwrap_or_default(),
            output.signer_cert_root.clone().unwrap_or_default(),
            output.signer_cert_publisher.clone().unwrap_or_default(),
            output.signer_scope.clone().unwrap_or_default(),
            output.signer_file_attribute_ids.join(","),
            output.match_criteria.clone(),
            output
                .specific_file_name_criteria
                .clone()
                .unwrap_or_default(),
            output.cert_subject_cn.clone().unwrap_or_default(),
            output.cert_issuer_cn.clone().unwrap_or_default(),
            output.cert_not_after.clone().unwrap_or_default(),
            output.cert_tbs_value.clone().unwrap_or_default(),
            output.file_path.to_string_lossy().into_owned(),
        ];

        let row = columns
            .iter()
            .map(|value| format!("\"{}\"", value.replace('"', "\"\"")))
            .collect::<Vec<_>>()
            .join(",");

        writeln!(file, "{}", row)?;
    }

    Ok(())
}
