// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Package models for binary and source packages.

A [Package] wraps the control paragraph a package contributes to a
`Packages` or `Sources` index. The two variants share stanza access and
rewriting; source packages additionally track their referenced file list
(the `.dsc`, upstream tarball, and packaging tarball).
*/

use {
    crate::{
        control::{ControlField, ControlParagraph},
        error::{DebmillError, Result},
        io::ChecksumSet,
    },
    std::io::Write,
};

/// Architecture token for architecture-neutral binary packages.
pub const ALL_ARCHITECTURE: &str = "all";

/// Architecture token under which source packages are indexed.
pub const SOURCE_ARCHITECTURE: &str = "source";

/// Component carrying ordinary packages.
pub const MAIN_COMPONENT: &str = "main";

/// Component carrying debug packages.
pub const DEBUG_COMPONENT: &str = "debug";

/// Name suffix marking debug symbol packages.
pub const DEBUG_PACKAGE_SUFFIX: &str = "-dbgsym";

/// Section value marking debug packages.
pub const DEBUG_PACKAGE_SECTION: &str = "debug";

/// Canonical emission order for `Packages` stanzas.
const BINARY_FIELD_ORDER: &[&str] = &[
    "Package",
    "Source",
    "Version",
    "Installed-Size",
    "Maintainer",
    "Architecture",
    "Replaces",
    "Provides",
    "Depends",
    "Pre-Depends",
    "Recommends",
    "Suggests",
    "Conflicts",
    "Breaks",
    "Enhances",
    "Priority",
    "Section",
    "Filename",
    "Size",
    "MD5sum",
    "SHA1",
    "SHA256",
    "SHA512",
    "Homepage",
    "Description",
];

/// Canonical emission order for `Sources` stanzas.
const SOURCE_FIELD_ORDER: &[&str] = &[
    "Package",
    "Format",
    "Binary",
    "Architecture",
    "Version",
    "Maintainer",
    "Uploaders",
    "Standards-Version",
    "Build-Depends",
    "Build-Depends-Indep",
    "Build-Conflicts",
    "Testsuite",
    "Homepage",
    "Vcs-Browser",
    "Vcs-Git",
    "Priority",
    "Section",
    "Directory",
    "Files",
    "Checksums-Sha1",
    "Checksums-Sha256",
    "Checksums-Sha512",
    "Package-List",
];

/// A file referenced by a package, with its full checksum set.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PackageFile {
    /// Filename relative to the package's directory (source) or the
    /// `Filename` field's directory (binary).
    pub filename: String,
    pub checksums: ChecksumSet,
}

/// A binary package entry, backed by its `Packages` stanza.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BinaryPackage {
    paragraph: ControlParagraph,
}

impl BinaryPackage {
    /// Construct from a parsed stanza. `Package`, `Version`, and
    /// `Architecture` are required.
    pub fn from_paragraph(paragraph: ControlParagraph) -> Result<Self> {
        for required in ["Package", "Version", "Architecture"] {
            paragraph.required_field_str(required)?;
        }

        Ok(Self { paragraph })
    }

    pub fn paragraph(&self) -> &ControlParagraph {
        &self.paragraph
    }

    pub fn name(&self) -> &str {
        self.paragraph
            .field_str("Package")
            .expect("validated at construction")
    }

    pub fn version_str(&self) -> &str {
        self.paragraph
            .field_str("Version")
            .expect("validated at construction")
    }

    pub fn architecture(&self) -> &str {
        self.paragraph
            .field_str("Architecture")
            .expect("validated at construction")
    }

    /// The `Filename` field: the repository-relative path of the `.deb`.
    pub fn filename(&self) -> Result<&str> {
        self.paragraph.required_field_str("Filename")
    }

    /// The source package name, resolving the `Source` field.
    ///
    /// A binary sharing its source's name omits the field. A `Source` value
    /// may carry a version in parentheses, which is stripped.
    pub fn source_name(&self) -> &str {
        match self.paragraph.field_str("Source") {
            Some(source) => source.split_whitespace().next().unwrap_or(source),
            None => self.name(),
        }
    }

    /// The single pool file backing this package.
    pub fn file(&self) -> Result<PackageFile> {
        let filename = self
            .filename()?
            .rsplit('/')
            .next()
            .expect("rsplit yields at least one element")
            .to_string();

        Ok(PackageFile {
            filename,
            checksums: ChecksumSet {
                size: self.paragraph.field_u64("Size").transpose()?.unwrap_or(0),
                md5: self.paragraph.field_str("MD5sum").unwrap_or("").to_string(),
                sha1: self.paragraph.field_str("SHA1").unwrap_or("").to_string(),
                sha256: self.paragraph.field_str("SHA256").unwrap_or("").to_string(),
                sha512: self.paragraph.field_str("SHA512").unwrap_or("").to_string(),
            },
        })
    }
}

/// A source package entry, backed by its `Sources` stanza plus the list of
/// files it distributes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SourcePackage {
    paragraph: ControlParagraph,
    files: Vec<PackageFile>,
}

impl SourcePackage {
    /// Construct from a `Sources` index stanza, parsing the `Files` and
    /// `Checksums-*` blocks into the file list.
    pub fn from_paragraph(paragraph: ControlParagraph) -> Result<Self> {
        for required in ["Package", "Version"] {
            paragraph.required_field_str(required)?;
        }

        let files = parse_file_blocks(&paragraph)?;

        Ok(Self { paragraph, files })
    }

    /// Construct from a `.dsc` control paragraph (already signature-cleared).
    ///
    /// `.dsc` files name the package in a `Source` field; `Sources` indices
    /// use `Package`. The field is renamed here. The `Directory` field is set
    /// to `directory`.
    pub fn from_dsc_paragraph(mut paragraph: ControlParagraph, directory: &str) -> Result<Self> {
        if let Some(source) = paragraph.field_str("Source").map(|v| v.to_string()) {
            paragraph.remove_field("Source");
            paragraph.set_field_str("Package", source);
        }

        paragraph.set_field_str("Directory", directory);

        Self::from_paragraph(paragraph)
    }

    pub fn paragraph(&self) -> &ControlParagraph {
        &self.paragraph
    }

    pub fn name(&self) -> &str {
        self.paragraph
            .field_str("Package")
            .expect("validated at construction")
    }

    pub fn version_str(&self) -> &str {
        self.paragraph
            .field_str("Version")
            .expect("validated at construction")
    }

    /// The `Directory` field: the repository-relative directory holding the
    /// distributed files.
    pub fn directory(&self) -> Result<&str> {
        self.paragraph.required_field_str("Directory")
    }

    /// Files distributed by this source package.
    pub fn files(&self) -> &[PackageFile] {
        &self.files
    }

    /// Replace the file list and regenerate the stanza's `Files` and
    /// `Checksums-*` blocks from it.
    pub fn update_files(&mut self, files: Vec<PackageFile>) {
        self.files = files;
        self.sync_file_fields();
    }

    fn sync_file_fields(&mut self) {
        let blocks: [(&str, fn(&ChecksumSet) -> &str); 4] = [
            ("Files", |c| c.md5.as_str()),
            ("Checksums-Sha1", |c| c.sha1.as_str()),
            ("Checksums-Sha256", |c| c.sha256.as_str()),
            ("Checksums-Sha512", |c| c.sha512.as_str()),
        ];

        for (field_name, digest_of) in blocks {
            let lines = std::iter::once(String::new()).chain(self.files.iter().map(|file| {
                format!(
                    "{} {} {}",
                    digest_of(&file.checksums),
                    file.checksums.size,
                    file.filename
                )
            }));

            self.paragraph
                .set_field(ControlField::from_lines(field_name, lines));
        }
    }
}

/// Parse `Files` plus `Checksums-*` multiline blocks into merged
/// [PackageFile] descriptors.
fn parse_file_blocks(paragraph: &ControlParagraph) -> Result<Vec<PackageFile>> {
    let mut files: Vec<PackageFile> = vec![];

    let mut apply = |field: &str, assign: fn(&mut ChecksumSet, String)| -> Result<()> {
        let Some(block) = paragraph.field(field) else {
            return Ok(());
        };

        for line in block.iter_lines().filter(|line| !line.is_empty()) {
            let mut parts = line.split_ascii_whitespace();
            let (digest, size, filename) = match (parts.next(), parts.next(), parts.last()) {
                (Some(digest), Some(size), Some(filename)) => (digest, size, filename),
                _ => {
                    return Err(DebmillError::ControlParse(format!(
                        "malformed {} entry: {}",
                        field, line
                    )))
                }
            };

            let size = size.parse::<u64>()?;

            let entry = match files.iter_mut().find(|f| f.filename == filename) {
                Some(entry) => entry,
                None => {
                    files.push(PackageFile {
                        filename: filename.to_string(),
                        checksums: ChecksumSet::default(),
                    });
                    files.last_mut().expect("pushed above")
                }
            };

            entry.checksums.size = size;
            assign(&mut entry.checksums, digest.to_string());
        }

        Ok(())
    };

    apply("Files", |c, v| c.md5 = v)?;
    apply("Checksums-Sha1", |c, v| c.sha1 = v)?;
    apply("Checksums-Sha256", |c, v| c.sha256 = v)?;
    apply("Checksums-Sha512", |c, v| c.sha512 = v)?;

    Ok(files)
}

/// A package of either variant.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Package {
    Binary(BinaryPackage),
    Source(SourcePackage),
}

impl Package {
    pub fn is_source(&self) -> bool {
        matches!(self, Package::Source(_))
    }

    pub fn name(&self) -> &str {
        match self {
            Package::Binary(p) => p.name(),
            Package::Source(p) => p.name(),
        }
    }

    pub fn version_str(&self) -> &str {
        match self {
            Package::Binary(p) => p.version_str(),
            Package::Source(p) => p.version_str(),
        }
    }

    /// Architecture token. Source packages always report `source`.
    pub fn architecture(&self) -> &str {
        match self {
            Package::Binary(p) => p.architecture(),
            Package::Source(_) => SOURCE_ARCHITECTURE,
        }
    }

    /// The source package name grouping this package.
    pub fn source_name(&self) -> &str {
        match self {
            Package::Binary(p) => p.source_name(),
            Package::Source(p) => p.name(),
        }
    }

    pub fn paragraph(&self) -> &ControlParagraph {
        match self {
            Package::Binary(p) => p.paragraph(),
            Package::Source(p) => p.paragraph(),
        }
    }

    /// Files this package distributes.
    pub fn files(&self) -> Result<Vec<PackageFile>> {
        match self {
            Package::Binary(p) => Ok(vec![p.file()?]),
            Package::Source(p) => Ok(p.files().to_vec()),
        }
    }

    /// Produce a copy of this package with one stanza field replaced.
    ///
    /// The variant is preserved; the field list is small and cheap to copy.
    pub fn with_field(&self, name: &str, value: &str) -> Result<Package> {
        let mut paragraph = self.paragraph().clone();
        paragraph.set_field_str(name, value);

        Ok(match self {
            Package::Binary(_) => Package::Binary(BinaryPackage::from_paragraph(paragraph)?),
            Package::Source(p) => Package::Source(SourcePackage {
                paragraph,
                files: p.files.clone(),
            }),
        })
    }

    /// Whether this is a debug package: `Section: debug`, a `-dbgsym` name,
    /// or a `.ddeb` filename. Source packages are never debug packages.
    pub fn is_debug(&self) -> bool {
        let Package::Binary(p) = self else {
            return false;
        };

        if p.paragraph().field_str("Section") == Some(DEBUG_PACKAGE_SECTION) {
            return true;
        }

        if p.name().ends_with(DEBUG_PACKAGE_SUFFIX) {
            return true;
        }

        p.filename()
            .map(|f| f.ends_with(".ddeb"))
            .unwrap_or(false)
    }

    /// Serialize this package's stanza in canonical field order.
    pub fn write_stanza<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        let order = match self {
            Package::Binary(_) => BINARY_FIELD_ORDER,
            Package::Source(_) => SOURCE_FIELD_ORDER,
        };

        self.paragraph().write_canonical(writer, order)
    }
}

/// Whether a bare package or file name denotes a debug artifact.
pub fn is_debug_name(name: &str) -> bool {
    name.ends_with(DEBUG_PACKAGE_SUFFIX)
        || name.contains(&format!("{}_", DEBUG_PACKAGE_SUFFIX))
        || name.ends_with(".ddeb")
}

#[cfg(test)]
mod test {
    use {super::*, crate::control::parse_single_paragraph};

    const BINARY_STANZA: &str = "Package: libvips-tools\n\
        Source: vips\n\
        Version: 8.17.3-1\n\
        Architecture: amd64\n\
        Section: graphics\n\
        Filename: pool/main/v/vips/libvips-tools_8.17.3-1_amd64.deb\n\
        Size: 1024\n\
        MD5sum: 0123456789abcdef0123456789abcdef\n\
        SHA256: 00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff\n\
        Description: command-line tools\n";

    const DSC_STANZA: &str = "Format: 3.0 (quilt)\n\
        Source: immich\n\
        Binary: immich-server\n\
        Architecture: any\n\
        Version: 2.4.1-0alpha3~noble\n\
        Files:\n\
        \x20d41d8cd98f00b204e9800998ecf8427e 4 immich_2.4.1.orig.tar.xz\n\
        \x20d41d8cd98f00b204e9800998ecf8427e 3 immich_2.4.1-0alpha3~noble.debian.tar.xz\n\
        Checksums-Sha256:\n\
        \x20e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855 4 immich_2.4.1.orig.tar.xz\n\
        \x20e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855 3 immich_2.4.1-0alpha3~noble.debian.tar.xz\n";

    fn binary() -> Package {
        Package::Binary(
            BinaryPackage::from_paragraph(parse_single_paragraph(BINARY_STANZA.as_bytes()).unwrap())
                .unwrap(),
        )
    }

    #[test]
    fn binary_accessors() -> Result<()> {
        let pkg = binary();

        assert_eq!(pkg.name(), "libvips-tools");
        assert_eq!(pkg.version_str(), "8.17.3-1");
        assert_eq!(pkg.architecture(), "amd64");
        assert_eq!(pkg.source_name(), "vips");
        assert!(!pkg.is_source());
        assert!(!pkg.is_debug());

        let files = pkg.files()?;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].filename, "libvips-tools_8.17.3-1_amd64.deb");
        assert_eq!(files[0].checksums.size, 1024);

        Ok(())
    }

    #[test]
    fn source_field_version_is_stripped() -> Result<()> {
        let mut paragraph = parse_single_paragraph(BINARY_STANZA.as_bytes())?;
        paragraph.set_field_str("Source", "vips (8.17.3-1)");
        let pkg = Package::Binary(BinaryPackage::from_paragraph(paragraph)?);

        assert_eq!(pkg.source_name(), "vips");
        Ok(())
    }

    #[test]
    fn debug_classification() -> Result<()> {
        let mut paragraph = parse_single_paragraph(BINARY_STANZA.as_bytes())?;
        paragraph.set_field_str("Section", "debug");
        assert!(Package::Binary(BinaryPackage::from_paragraph(paragraph.clone())?).is_debug());

        paragraph.set_field_str("Section", "graphics");
        paragraph.set_field_str("Package", "libvips-tools-dbgsym");
        assert!(Package::Binary(BinaryPackage::from_paragraph(paragraph.clone())?).is_debug());

        paragraph.set_field_str("Package", "libvips-tools");
        paragraph.set_field_str(
            "Filename",
            "pool/main/v/vips/libvips-tools_8.17.3-1_amd64.ddeb",
        );
        assert!(Package::Binary(BinaryPackage::from_paragraph(paragraph)?).is_debug());

        assert!(is_debug_name("vips-dbgsym"));
        assert!(is_debug_name("vips-dbgsym_8.17.3-1_amd64.deb"));
        assert!(is_debug_name("vips_8.17.3-1_amd64.ddeb"));
        assert!(!is_debug_name("vips_8.17.3-1_amd64.deb"));

        Ok(())
    }

    #[test]
    fn dsc_parsing_renames_source_and_merges_checksums() -> Result<()> {
        let paragraph = parse_single_paragraph(DSC_STANZA.as_bytes())?;
        let source = SourcePackage::from_dsc_paragraph(paragraph, "github/immich-app/immich/noble/immich")?;

        assert_eq!(source.name(), "immich");
        assert!(!source.paragraph().has_field("Source"));
        assert_eq!(
            source.directory()?,
            "github/immich-app/immich/noble/immich"
        );

        let files = source.files();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].filename, "immich_2.4.1.orig.tar.xz");
        assert_eq!(files[0].checksums.size, 4);
        assert_eq!(files[0].checksums.md5, "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(
            files[0].checksums.sha256,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );

        Ok(())
    }

    #[test]
    fn update_files_rewrites_blocks() -> Result<()> {
        let paragraph = parse_single_paragraph(DSC_STANZA.as_bytes())?;
        let mut source = SourcePackage::from_dsc_paragraph(paragraph, ".")?;

        source.update_files(vec![PackageFile {
            filename: "immich_2.4.1.orig.tar.xz".to_string(),
            checksums: ChecksumSet {
                size: 99,
                md5: "aa".repeat(16),
                sha1: "bb".repeat(20),
                sha256: "cc".repeat(32),
                sha512: "dd".repeat(64),
            },
        }]);

        let stanza = source.paragraph().to_control_string();
        assert!(stanza.contains(&format!("Files:\n {} 99 immich_2.4.1.orig.tar.xz", "aa".repeat(16))));
        assert!(stanza
            .contains(&format!("Checksums-Sha512:\n {} 99 immich_2.4.1.orig.tar.xz", "dd".repeat(64))));

        Ok(())
    }

    #[test]
    fn with_field_preserves_variant() -> Result<()> {
        let pkg = binary();
        let rewritten = pkg.with_field("Filename", "pool/x/y/z.deb")?;

        assert!(matches!(rewritten, Package::Binary(_)));
        assert_eq!(
            rewritten.paragraph().field_str("Filename"),
            Some("pool/x/y/z.deb")
        );
        // The original is untouched.
        assert_eq!(
            pkg.paragraph().field_str("Filename"),
            Some("pool/main/v/vips/libvips-tools_8.17.3-1_amd64.deb")
        );

        Ok(())
    }

    #[test]
    fn canonical_stanza_order() {
        let pkg = binary();
        let mut buf = vec![];
        pkg.write_stanza(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();

        let package_pos = text.find("Package:").unwrap();
        let version_pos = text.find("Version:").unwrap();
        let filename_pos = text.find("Filename:").unwrap();
        let description_pos = text.find("Description:").unwrap();

        assert!(package_pos < version_pos);
        assert!(version_pos < filename_pos);
        assert!(filename_pos < description_pos);
    }
}
