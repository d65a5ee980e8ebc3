// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! I/O helpers: content digests, compression formats, and file transforms. */

use {
    crate::error::{DebmillError, Result},
    async_compression::futures::bufread::{
        BzDecoder, BzEncoder, GzipDecoder, GzipEncoder, XzDecoder, XzEncoder,
    },
    digest::Digest,
    futures::{io::AllowStdIo, AsyncBufRead, AsyncRead},
    std::{
        io::Read,
        path::{Path, PathBuf},
        pin::Pin,
    },
};

/// Checksum flavor used in repository metadata.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ChecksumType {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl ChecksumType {
    /// Emit variants in preferred order, weakest first.
    ///
    /// This is the order checksum blocks appear in `Release` files.
    pub fn release_order() -> impl Iterator<Item = ChecksumType> {
        [Self::Md5, Self::Sha1, Self::Sha256, Self::Sha512].into_iter()
    }

    /// Name of the control field in `Release` files holding this variant.
    pub fn release_field_name(&self) -> &'static str {
        match self {
            Self::Md5 => "MD5Sum",
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA256",
            Self::Sha512 => "SHA512",
        }
    }

}

/// The full set of checksums we track per repository file, plus its size.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ChecksumSet {
    pub size: u64,
    pub md5: String,
    pub sha1: String,
    pub sha256: String,
    pub sha512: String,
}

impl ChecksumSet {
    /// Obtain the hex digest for a given checksum flavor.
    pub fn digest_hex(&self, checksum: ChecksumType) -> &str {
        match checksum {
            ChecksumType::Md5 => &self.md5,
            ChecksumType::Sha1 => &self.sha1,
            ChecksumType::Sha256 => &self.sha256,
            ChecksumType::Sha512 => &self.sha512,
        }
    }
}

/// A content digester that simultaneously computes all tracked digest types.
pub struct MultiDigester {
    size: u64,
    md5: md5::Md5,
    sha1: sha1::Sha1,
    sha256: sha2::Sha256,
    sha512: sha2::Sha512,
}

impl Default for MultiDigester {
    fn default() -> Self {
        Self {
            size: 0,
            md5: md5::Md5::new(),
            sha1: sha1::Sha1::new(),
            sha256: sha2::Sha256::new(),
            sha512: sha2::Sha512::new(),
        }
    }
}

impl MultiDigester {
    /// Write content into the digesters.
    pub fn update(&mut self, data: &[u8]) {
        self.size += data.len() as u64;
        self.md5.update(data);
        self.sha1.update(data);
        self.sha256.update(data);
        self.sha512.update(data);
    }

    /// Finish digesting, consuming the instance.
    pub fn finish(self) -> ChecksumSet {
        ChecksumSet {
            size: self.size,
            md5: hex::encode(self.md5.finalize()),
            sha1: hex::encode(self.sha1.finalize()),
            sha256: hex::encode(self.sha256.finalize()),
            sha512: hex::encode(self.sha512.finalize()),
        }
    }
}

/// Compute the full checksum set of a file on disk.
pub fn checksums_for_file(path: impl AsRef<Path>) -> Result<ChecksumSet> {
    let path = path.as_ref();
    let mut fh = std::fs::File::open(path)
        .map_err(|e| DebmillError::IoPath(path.display().to_string(), e))?;

    let mut digester = MultiDigester::default();
    let mut buf = [0u8; 65536];

    loop {
        let count = fh
            .read(&mut buf)
            .map_err(|e| DebmillError::IoPath(path.display().to_string(), e))?;
        if count == 0 {
            break;
        }
        digester.update(&buf[0..count]);
    }

    Ok(digester.finish())
}

/// Compute only the SHA-256 hex digest of a file on disk.
pub fn sha256_for_file(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let mut fh = std::fs::File::open(path)
        .map_err(|e| DebmillError::IoPath(path.display().to_string(), e))?;

    let mut hasher = sha2::Sha256::new();
    let mut buf = [0u8; 65536];

    loop {
        let count = fh
            .read(&mut buf)
            .map_err(|e| DebmillError::IoPath(path.display().to_string(), e))?;
        if count == 0 {
            break;
        }
        hasher.update(&buf[0..count]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Compression format used by repository index and package files.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Compression {
    /// No compression (no extension).
    None,

    /// Gzip compression (.gz extension).
    Gzip,

    /// Bzip2 compression (.bz2 extension).
    Bzip2,

    /// XZ compression (.xz extension).
    Xz,
}

impl Compression {
    /// Filename extension for files compressed in this format.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::Gzip => ".gz",
            Self::Bzip2 => ".bz2",
            Self::Xz => ".xz",
        }
    }

    /// Detect the compression format from a filename extension.
    pub fn from_filename(filename: &str) -> Compression {
        if filename.ends_with(".gz") {
            Self::Gzip
        } else if filename.ends_with(".bz2") {
            Self::Bzip2
        } else if filename.ends_with(".xz") {
            Self::Xz
        } else {
            Self::None
        }
    }

    /// The set of compressed variants emitted for every generated index file.
    pub fn index_variants() -> impl Iterator<Item = Compression> {
        [Self::Gzip, Self::Bzip2, Self::Xz].into_iter()
    }
}

/// Wrap a reader with transparent decompression.
pub fn read_decompressed<'a>(
    stream: impl AsyncBufRead + Send + 'a,
    compression: Compression,
) -> Pin<Box<dyn AsyncRead + Send + 'a>> {
    match compression {
        Compression::None => Box::pin(stream),
        Compression::Gzip => Box::pin(GzipDecoder::new(stream)),
        Compression::Bzip2 => Box::pin(BzDecoder::new(stream)),
        Compression::Xz => Box::pin(XzDecoder::new(stream)),
    }
}

/// Wrap a reader with transparent compression.
pub fn read_compressed<'a>(
    stream: impl AsyncBufRead + Send + 'a,
    compression: Compression,
) -> Pin<Box<dyn AsyncRead + Send + 'a>> {
    match compression {
        Compression::None => Box::pin(stream),
        Compression::Gzip => Box::pin(GzipEncoder::new(stream)),
        Compression::Bzip2 => Box::pin(BzEncoder::new(stream)),
        Compression::Xz => Box::pin(XzEncoder::new(stream)),
    }
}

/// Decompress a file next to itself, deriving the destination by stripping the
/// compression extension. Returns the destination path.
///
/// The source file is left in place.
pub async fn decompress_file(source: impl AsRef<Path>) -> Result<PathBuf> {
    let source = source.as_ref();
    let filename = source
        .file_name()
        .and_then(|v| v.to_str())
        .ok_or_else(|| DebmillError::UnsupportedCompression(source.display().to_string()))?;

    let compression = Compression::from_filename(filename);
    if compression == Compression::None {
        return Err(DebmillError::NotCompressed(source.display().to_string()));
    }

    let dest = source.with_file_name(
        filename
            .strip_suffix(compression.extension())
            .expect("extension detected above"),
    );

    let fh = std::fs::File::open(source)
        .map_err(|e| DebmillError::IoPath(source.display().to_string(), e))?;
    let reader = read_decompressed(
        futures::io::BufReader::new(AllowStdIo::new(fh)),
        compression,
    );

    let out = std::fs::File::create(&dest)
        .map_err(|e| DebmillError::IoPath(dest.display().to_string(), e))?;
    let mut writer = AllowStdIo::new(out);

    futures::io::copy(reader, &mut writer)
        .await
        .map_err(|e| DebmillError::IoPath(dest.display().to_string(), e))?;

    Ok(dest)
}

/// Compress a file next to itself, deriving the destination by appending the
/// compression extension. Returns the destination path.
pub async fn compress_file(source: impl AsRef<Path>, compression: Compression) -> Result<PathBuf> {
    let source = source.as_ref();
    if compression == Compression::None {
        return Err(DebmillError::UnsupportedCompression(
            source.display().to_string(),
        ));
    }

    let mut dest = source.as_os_str().to_os_string();
    dest.push(compression.extension());
    let dest = PathBuf::from(dest);

    let fh = std::fs::File::open(source)
        .map_err(|e| DebmillError::IoPath(source.display().to_string(), e))?;
    let reader = read_compressed(
        futures::io::BufReader::new(AllowStdIo::new(fh)),
        compression,
    );

    let out = std::fs::File::create(&dest)
        .map_err(|e| DebmillError::IoPath(dest.display().to_string(), e))?;
    let mut writer = AllowStdIo::new(out);

    futures::io::copy(reader, &mut writer)
        .await
        .map_err(|e| DebmillError::IoPath(dest.display().to_string(), e))?;

    Ok(dest)
}

#[cfg(test)]
mod test {
    use {super::*, futures::AsyncReadExt};

    #[test]
    fn multi_digester_known_values() {
        let mut digester = MultiDigester::default();
        digester.update(b"debmill");
        let set = digester.finish();

        assert_eq!(set.size, 7);
        assert_eq!(set.md5.len(), 32);
        assert_eq!(set.sha1.len(), 40);
        assert_eq!(set.sha256.len(), 64);
        assert_eq!(set.sha512.len(), 128);
        // Spot check one digest against a known value.
        assert_eq!(
            set.sha256,
            {
                let mut h = sha2::Sha256::new();
                h.update(b"debmill");
                hex::encode(h.finalize())
            }
        );
    }

    #[test]
    fn compression_detection() {
        assert_eq!(Compression::from_filename("Packages"), Compression::None);
        assert_eq!(Compression::from_filename("Packages.gz"), Compression::Gzip);
        assert_eq!(
            Compression::from_filename("Packages.bz2"),
            Compression::Bzip2
        );
        assert_eq!(Compression::from_filename("Sources.xz"), Compression::Xz);
    }

    #[tokio::test]
    async fn stream_round_trip() {
        for compression in Compression::index_variants() {
            let compressed = {
                let mut reader = read_compressed(
                    futures::io::BufReader::new(&b"Package: zstd\n"[..]),
                    compression,
                );
                let mut buf = vec![];
                reader.read_to_end(&mut buf).await.unwrap();
                buf
            };

            let mut reader = read_decompressed(
                futures::io::BufReader::new(std::io::Cursor::new(compressed)),
                compression,
            );
            let mut buf = vec![];
            reader.read_to_end(&mut buf).await.unwrap();

            assert_eq!(buf, b"Package: zstd\n");
        }
    }

    #[tokio::test]
    async fn file_compress_then_decompress() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("Packages");
        std::fs::write(&source, b"Package: immich\nVersion: 2.4.1\n").unwrap();

        let compressed = compress_file(&source, Compression::Xz).await?;
        assert_eq!(compressed, dir.path().join("Packages.xz"));

        std::fs::remove_file(&source).unwrap();
        let restored = decompress_file(&compressed).await?;
        assert_eq!(restored, source);
        assert_eq!(
            std::fs::read(&restored).unwrap(),
            b"Package: immich\nVersion: 2.4.1\n"
        );

        Ok(())
    }

    #[test]
    fn decompress_requires_known_extension() {
        let err = futures::executor::block_on(decompress_file("/tmp/Packages")).unwrap_err();
        assert!(matches!(err, DebmillError::NotCompressed(_)));
    }
}
