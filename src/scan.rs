// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Candidate file enumeration.

use {
    crate::error::AppControlSimError,
    std::path::{Path, PathBuf},
};

/// File extensions covered by application control policy.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "sys", "exe", "com", "dll", "rll", "ocx", "msp", "msi", "js", "vbs", "ps1", "appx", "bin",
    "bat", "hxs", "mui", "lex", "mof",
];

/// Extensions whose files are rejected outright when unsigned and not
/// covered by a hash rule.
pub const UNSIGNED_REJECTED_EXTENSIONS: &[&str] = &["ocx", "bat", "bin"];

pub fn has_supported_extension(path: &Path) -> bool {
    extension_matches(path, SUPPORTED_EXTENSIONS)
}

pub fn has_unsigned_rejected_extension(path: &Path) -> bool {
    extension_matches(path, UNSIGNED_REJECTED_EXTENSIONS)
}

fn extension_matches(path: &Path, set: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| set.iter().any(|s| ext.eq_ignore_ascii_case(s)))
        .unwrap_or(false)
}

/// Flatten explicit file paths and recursive folder scans into one
/// candidate list, restricted to supported extensions.
///
/// Explicit files are taken as given when they exist and carry a supported
/// extension; anything else is logged and dropped. The list preserves
/// enumeration order and contains no duplicates.
pub fn collect_candidate_files(
    files: &[PathBuf],
    folders: &[PathBuf],
) -> Result<Vec<PathBuf>, AppControlSimError> {
    let mut candidates = vec![];

    for file in files {
        if file.is_file() && has_supported_extension(file) {
            push_unique(&mut candidates, file.clone());
        } else {
            log::warn!("skipping unsupported or missing file {}", file.display());
        }
    }

    for folder in folders {
        scan_folder(folder, &mut candidates)?;
    }

    if candidates.is_empty() {
        return Err(AppControlSimError::NoValidFilesSelected);
    }

    Ok(candidates)
}

fn scan_folder(folder: &Path, candidates: &mut Vec<PathBuf>) -> Result<(), AppControlSimError> {
    let entries = match std::fs::read_dir(folder) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("skipping unreadable folder {}: {}", folder.display(), e);
            return Ok(());
        }
    };

    for entry in entries {
        let path = entry?.path();

        if path.is_dir() {
            scan_folder(&path, candidates)?;
        } else if path.is_file() && has_supported_extension(&path) {
            push_unique(candidates, path);
        }
    }

    Ok(())
}

fn push_unique(candidates: &mut Vec<PathBuf>, path: PathBuf) {
    if !candidates.contains(&path) {
        candidates.push(path);
    }
}
