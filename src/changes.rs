// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! `.changes` upload control files.

A `.changes` file is the signed trust anchor of a source build: it names the
source package, version, and target distribution, and declares the checksums
of every artifact the build produced. Release-page feeds verify it first and
then download everything else against the digests it declares.
*/

use {
    crate::{
        control::parse_single_paragraph,
        error::{DebmillError, Result},
        io::ChecksumSet,
        package::PackageFile,
        signature::{is_clearsigned, SignatureVerifier},
    },
    std::collections::BTreeMap,
};

/// A parsed `.changes` file.
#[derive(Clone, Debug)]
pub struct ChangesFile {
    pub source: String,
    pub version: String,
    pub distribution: String,

    /// Artifacts declared by this upload, with merged checksums.
    pub files: Vec<PackageFile>,

    /// Whether the input document carried a cleartext signature.
    pub clearsigned: bool,

    /// Key ids that verified the signature, when verification ran.
    pub verified_keys: Vec<String>,
}

impl ChangesFile {
    /// Parse and verify a `.changes` document.
    pub fn parse(name: &str, data: &[u8], verifier: &SignatureVerifier) -> Result<Self> {
        let clearsigned = is_clearsigned(data);
        let (cleartext, verified_keys) = verifier.verify_and_clear(name, data)?;

        let paragraph = parse_single_paragraph(&cleartext)?;

        let source = paragraph.required_field_str("Source")?.to_string();
        let version = paragraph.required_field_str("Version")?.to_string();
        let distribution = paragraph
            .required_field_str("Distribution")?
            .split_ascii_whitespace()
            .next()
            .unwrap_or_default()
            .to_string();

        // `Files` carries md5/size plus section and priority columns;
        // `Checksums-*` blocks carry digest/size/name. Merge them by name.
        let mut files: BTreeMap<String, PackageFile> = BTreeMap::new();
        let mut order = vec![];

        let mut ingest = |field: &str, assign: fn(&mut ChecksumSet, String)| -> Result<()> {
            let Some(block) = paragraph.field(field) else {
                return Ok(());
            };

            for line in block.iter_lines().filter(|line| !line.is_empty()) {
                let mut parts = line.split_ascii_whitespace();
                let (digest, size, filename) = match (parts.next(), parts.next(), parts.last()) {
                    (Some(digest), Some(size), Some(filename)) => (digest, size, filename),
                    _ => {
                        return Err(DebmillError::ControlParse(format!(
                            "malformed {} entry in {}: {}",
                            field, name, line
                        )))
                    }
                };

                let entry = files.entry(filename.to_string()).or_insert_with(|| {
                    order.push(filename.to_string());
                    PackageFile {
                        filename: filename.to_string(),
                        checksums: ChecksumSet::default(),
                    }
                });

                entry.checksums.size = size.parse::<u64>()?;
                assign(&mut entry.checksums, digest.to_string());
            }

            Ok(())
        };

        ingest("Files", |c, v| c.md5 = v)?;
        ingest("Checksums-Sha1", |c, v| c.sha1 = v)?;
        ingest("Checksums-Sha256", |c, v| c.sha256 = v)?;

        let files = order
            .into_iter()
            .map(|filename| files.remove(&filename).expect("inserted during ingest"))
            .collect();

        Ok(Self {
            source,
            version,
            distribution,
            files,
            clearsigned,
            verified_keys,
        })
    }

    /// Whether the document carried a signature that verified.
    ///
    /// Distinct from [Self::clearsigned]: a document can be structurally
    /// clearsigned without any signature verifying (for example when the
    /// verifier ignores signatures). Trust decisions key off this.
    pub fn is_signed(&self) -> bool {
        !self.verified_keys.is_empty()
    }
}
