// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    cryptographic_message_syntax::CmsError, std::path::PathBuf, thiserror::Error,
    x509_certificate::X509CertificateError,
};

/// Unified error type for policy simulation.
#[derive(Debug, Error)]
pub enum AppControlSimError {
    #[error("unknown command")]
    CliUnknownCommand,

    #[error("bad argument")]
    CliBadArgument,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("binary parsing error: {0}")]
    Goblin(#[from] goblin::error::Error),

    #[error("data structure parse error: {0}")]
    Scroll(#[from] scroll::Error),

    #[error("X.509 certificate handler error: {0}")]
    X509(#[from] X509CertificateError),

    #[error("CMS error: {0}")]
    Cms(#[from] CmsError),

    #[error("JSON serialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("policy file does not exist: {0}")]
    PolicyNotFound(PathBuf),

    #[error("malformed policy document: {0}")]
    MalformedPolicy(String),

    #[error("error parsing policy XML: {0}")]
    PolicyXml(#[from] xml::reader::Error),

    #[error("no files supported by the simulation engine were selected")]
    NoValidFilesSelected,

    #[error("unable to compute file hashes for {path}: {message}")]
    HashComputation { path: PathBuf, message: String },

    #[error("no handler for certificate signature algorithm: {0}")]
    UnsupportedSignatureAlgorithm(String),

    #[error("certificate does not expose its to-be-signed data")]
    CertificateNoTbsData,

    #[error("security catalog parse error: {0}")]
    CatalogParse(String),
}
