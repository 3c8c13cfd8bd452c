// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Application control policy simulation.
//!
//! This crate evaluates whether files would be authorized or blocked by an
//! application control policy, without enforcing anything. Given a policy
//! document, a set of candidate files and optionally a set of security
//! catalog directories, it reproduces the policy engine's decision per
//! file:
//!
//! * Allow-all and literal file path rules short-circuit evaluation.
//! * Authenticode file hashes are matched against the policy's hash rules.
//! * Embedded signatures are parsed, their certificate chains classified
//!   into root / intermediate / leaf roles, and weighed against the
//!   policy's signers including EKU, publisher and file attribute
//!   constraints. Denied signers take precedence over allowed ones.
//! * Unsigned files fall back to security catalog membership.
//!
//! Every candidate file receives exactly one verdict; per-file failures
//! are reported as rejection verdicts rather than aborting the run. The
//! result set can be exported as CSV or consumed programmatically.
//!
//! No signature verification is performed. The simulation reasons about
//! identities, not cryptographic validity.

pub mod arbitrator;
pub mod authenticode_hash;
pub mod catalog;
pub mod chain;
pub mod error;
pub mod file_metadata;
pub mod policy;
pub mod scan;
pub mod signature_reader;
pub mod simulation;

pub use {
    arbitrator::{CatalogHit, SimulationOutput, VerdictSource},
    authenticode_hash::{compute_file_hashes, CodeIntegrityHashes},
    catalog::CatalogIndex,
    chain::{CertificateRole, ChainElement, ChainPackage},
    error::AppControlSimError,
    file_metadata::{ExtendedFileInfo, FileVersion},
    policy::{HashRecord, PolicyRules, PolicySigner},
    signature_reader::{FileSignature, PeSignatureReader, SignatureReader},
    simulation::{all_authorized, run_simulation, SimulationRequest},
};
