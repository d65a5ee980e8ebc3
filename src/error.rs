// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Error handling. */

use thiserror::Error;

/// Primary crate error type.
#[derive(Debug, Error)]
pub enum DebmillError {
    #[error("URL error: {0:?}")]
    Url(#[from] url::ParseError),

    #[error("PGP error: {0:?}")]
    Pgp(#[from] pgp::errors::Error),

    #[error("HTTP error: {0:?}")]
    Reqwest(#[from] reqwest::Error),

    #[error("I/O error: {0:?}")]
    Io(#[from] std::io::Error),

    #[error("I/O error on path {0}: {1:?}")]
    IoPath(String, std::io::Error),

    #[error("integer parsing error: {0:?}")]
    ParseInt(#[from] std::num::ParseIntError),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration invalid: {0}")]
    ConfigInvalid(String),

    #[error("control file parse error: {0}")]
    ControlParse(String),

    #[error("control file lacks a paragraph")]
    ControlNoParagraph,

    #[error("required control field missing: {0}")]
    ControlRequiredFieldMissing(String),

    #[error("unknown entry in binary package archive: {0}")]
    DebUnknownEntry(String),

    #[error("unknown compression in deb archive member: {0}")]
    DebUnknownCompression(String),

    #[error("file is not signed: {0}")]
    SignatureMissing(String),

    #[error("signature verification failed: {0}")]
    SignatureInvalid(String),

    #[error("{file} missing from Release file manifest")]
    ReleaseFileEntryMissing { file: String },

    #[error("invalid Release checksum entry: {0}")]
    ReleaseEntryInvalid(String),

    #[error("invalid Date in Release file: {0}")]
    ReleaseDateInvalid(String),

    #[error("download of {url} failed: {message}")]
    Download { url: String, message: String },

    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    DigestMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("conflicting in-flight downloads for {destination}: {message}")]
    DownloadConflict {
        destination: String,
        message: String,
    },

    #[error("file must have a compression extension (.gz, .bz2, .xz): {0}")]
    NotCompressed(String),

    #[error("unsupported compression format for {0}")]
    UnsupportedCompression(String),

    #[error("conflict: different contents want trusted path {0}")]
    TrustedStoreConflict(String),

    #[error("retention pattern error: {0}")]
    RetentionPattern(String),

    #[error("version {version} does not match any retention pattern")]
    RetentionNoMatch { version: String },

    #[error("no redirect target recorded for {path} in feed {feed}")]
    RedirectTargetMissing { path: String, feed: String },

    #[error("asset URL {url} is not under feed download URL {base}")]
    RedirectBaseMismatch { url: String, base: String },

    #[error("asset not found for referenced file {0}")]
    AssetNotFound(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

/// Result wrapper for this crate.
pub type Result<T> = std::result::Result<T, DebmillError>;

impl DebmillError {
    /// Whether this error is a signature-presence or signature-validity failure.
    ///
    /// Feed adapters retry `.dsc` parsing without signature enforcement for
    /// exactly these two kinds and no others.
    pub fn is_signature_error(&self) -> bool {
        matches!(
            self,
            DebmillError::SignatureMissing(_) | DebmillError::SignatureInvalid(_)
        )
    }
}
