// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! `Release` / `InRelease` file primitives.

The parse side consumes a (possibly clearsigned) `InRelease` document through
the signature verifier and exposes the identity fields plus the SHA-256 files
map that anchors the chain of trust for every index download.

The emit side produces the composer's distribution-level `Release` file with
all four checksum blocks.
*/

use {
    crate::{
        control::{parse_single_paragraph, ControlField, ControlParagraph},
        error::{DebmillError, Result},
        io::{ChecksumSet, ChecksumType},
        signature::SignatureVerifier,
    },
    chrono::{DateTime, NaiveDateTime, TimeZone, Utc},
    std::{collections::BTreeMap, io::Write},
};

/// Date format emitted into `Release` files (RFC 1123 with the `UTC` zone
/// name, as produced by the Debian archive tooling).
pub const RELEASE_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S UTC";

/// Canonical emission order for `Release` paragraphs.
const RELEASE_FIELD_ORDER: &[&str] = &[
    "Origin",
    "Label",
    "Suite",
    "Codename",
    "Date",
    "Architectures",
    "Components",
    "Description",
    "MD5Sum",
    "SHA1",
    "SHA256",
    "SHA512",
];

/// A file advertised by a `Release` manifest: declared size and SHA-256.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ManifestEntry {
    pub size: u64,
    pub sha256: String,
}

/// A parsed, signature-checked `InRelease` manifest.
#[derive(Clone, Debug)]
pub struct ReleaseManifest {
    pub origin: String,
    pub label: String,
    pub suite: String,
    pub codename: String,
    pub date: DateTime<Utc>,
    pub architectures: Vec<String>,
    pub components: Vec<String>,
    pub description: String,

    /// Relative path -> declared size and SHA-256.
    pub files: BTreeMap<String, ManifestEntry>,

    /// Key ids that verified the document's signature. Empty when the
    /// verifier accepted unsigned input or was told to ignore signatures.
    pub verified_keys: Vec<String>,
}

impl ReleaseManifest {
    /// Parse and verify an `InRelease` document.
    pub fn parse(name: &str, data: &[u8], verifier: &SignatureVerifier) -> Result<Self> {
        let (cleartext, verified_keys) = verifier.verify_and_clear(name, data)?;

        let paragraph = parse_single_paragraph(&cleartext)?;

        let date_str = paragraph.field_str("Date").unwrap_or_default();
        let date = parse_release_date(date_str)
            .ok_or_else(|| DebmillError::ReleaseDateInvalid(date_str.to_string()))?;

        let files = parse_sha256_block(&paragraph)?;

        let words = |field: &str| -> Vec<String> {
            paragraph
                .field(field)
                .map(|f| f.iter_words().map(|w| w.to_string()).collect())
                .unwrap_or_default()
        };

        Ok(Self {
            origin: paragraph.field_str("Origin").unwrap_or_default().to_string(),
            label: paragraph.field_str("Label").unwrap_or_default().to_string(),
            suite: paragraph.field_str("Suite").unwrap_or_default().to_string(),
            codename: paragraph
                .field_str("Codename")
                .unwrap_or_default()
                .to_string(),
            date,
            architectures: words("Architectures"),
            components: words("Components"),
            description: paragraph
                .field("Description")
                .map(|f| f.iter_lines().collect::<Vec<_>>().join(" ").trim().to_string())
                .unwrap_or_default(),
            files,
            verified_keys,
        })
    }

    /// Whether the manifest carried a signature that verified.
    pub fn is_signed(&self) -> bool {
        !self.verified_keys.is_empty()
    }

    /// Look up a file's declared entry, or fail with its path.
    pub fn entry(&self, path: &str) -> Result<&ManifestEntry> {
        self.files
            .get(path)
            .ok_or_else(|| DebmillError::ReleaseFileEntryMissing {
                file: path.to_string(),
            })
    }
}

fn parse_sha256_block(paragraph: &ControlParagraph) -> Result<BTreeMap<String, ManifestEntry>> {
    let block = paragraph
        .field("SHA256")
        .ok_or_else(|| DebmillError::ReleaseEntryInvalid("missing SHA256 section".to_string()))?;

    let mut files = BTreeMap::new();

    for line in block.iter_lines().filter(|line| !line.is_empty()) {
        let mut parts = line.split_ascii_whitespace();

        let (sha256, size, path) = match (parts.next(), parts.next(), parts.next()) {
            (Some(digest), Some(size), Some(path)) => (digest, size, path),
            _ => return Err(DebmillError::ReleaseEntryInvalid(line.to_string())),
        };

        if parts.next().is_some() {
            return Err(DebmillError::ReleaseEntryInvalid(line.to_string()));
        }

        files.insert(
            path.to_string(),
            ManifestEntry {
                size: size.parse::<u64>()?,
                sha256: sha256.to_string(),
            },
        );
    }

    Ok(files)
}

/// Parse a `Date` field value.
///
/// Accepted formats, first match wins: RFC 1123 with a named or numeric zone
/// (via the RFC 2822 parser and a mail-date fallback for exotic zone names),
/// then legacy Unix `date` output with or without a zone. A value without
/// zone information is interpreted as UTC.
pub fn parse_release_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(parsed) = DateTime::parse_from_rfc2822(value) {
        return Some(parsed.with_timezone(&Utc));
    }

    if let Ok(timestamp) = mailparse::dateparse(value) {
        return Utc.timestamp_opt(timestamp, 0).single();
    }

    // Unix `date` output: "Mon Jan  2 15:04:05 2006", optionally followed by
    // a zone name. The zone-less form is assumed UTC.
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%a %b %e %H:%M:%S %Y") {
        return Some(Utc.from_utc_datetime(&naive));
    }

    if let Some((front, zone)) = value.rsplit_once(' ') {
        if zone.chars().all(|c| c.is_ascii_alphabetic()) {
            if let Ok(naive) = NaiveDateTime::parse_from_str(front, "%a %b %e %H:%M:%S %Y") {
                return Some(Utc.from_utc_datetime(&naive));
            }
        }
    }

    None
}

/// Everything needed to emit a distribution-level `Release` file.
#[derive(Clone, Debug)]
pub struct ReleaseFields {
    pub origin: String,
    pub label: String,
    pub suite: String,
    pub codename: String,
    pub date: DateTime<Utc>,
    pub architectures: Vec<String>,
    pub components: Vec<String>,
    pub description: String,

    /// Relative path -> checksums, for the four checksum blocks.
    pub files: BTreeMap<String, ChecksumSet>,
}

/// Serialize a `Release` file.
///
/// Checksum block lines are ` <hash> <8-width size> <path>`, sorted by path
/// (the `BTreeMap` iteration order).
pub fn generate_release<W: Write>(writer: &mut W, fields: &ReleaseFields) -> Result<()> {
    let mut paragraph = ControlParagraph::default();

    paragraph.set_field_str("Origin", &fields.origin);
    paragraph.set_field_str("Label", &fields.label);
    paragraph.set_field_str("Suite", &fields.suite);
    paragraph.set_field_str("Codename", &fields.codename);
    paragraph.set_field_str("Date", fields.date.format(RELEASE_DATE_FORMAT).to_string());
    paragraph.set_field_str("Architectures", fields.architectures.join(" "));
    paragraph.set_field_str("Components", fields.components.join(" "));
    paragraph.set_field_str("Description", &fields.description);

    for checksum in ChecksumType::release_order() {
        let lines = std::iter::once(String::new()).chain(fields.files.iter().map(
            |(path, checksums)| {
                format!("{} {:>8} {}", checksums.digest_hex(checksum), checksums.size, path)
            },
        ));

        paragraph.set_field(ControlField::from_lines(
            checksum.release_field_name(),
            lines,
        ));
    }

    paragraph.write_canonical(writer, RELEASE_FIELD_ORDER)?;

    Ok(())
}
