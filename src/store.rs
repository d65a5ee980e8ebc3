// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The trusted store.

Two roots cooperate: a mutable *cache* holding every file ever downloaded,
and a *trusted* root holding only files whose content was verified against a
trust anchor. Promotion is by hardlink, so no byte is ever copied twice and
re-running a fetch is idempotent.

A store instance is scoped by a path prefix; scoping is compositional:
`store.scope(a).scope(b)` addresses the same tree as `store.scope_parts(&[a, b])`.
*/

use {
    crate::{
        download::{DownloadRequest, Downloader},
        error::{DebmillError, Result},
        io::{sha256_for_file, Compression},
    },
    std::{
        collections::BTreeMap,
        path::{Path, PathBuf},
        sync::Arc,
    },
    tracing::debug,
    url::Url,
};

/// Filename of the per-scope redirect map.
pub const REDIRECT_MAP_FILENAME: &str = "redirects.yaml";

/// Create a hardlink from `src` to `dst` with force semantics: an existing
/// destination with a different inode is replaced; the same inode is a
/// no-op. Guarded by the process-wide hardlink mutex to close the
/// unlink-then-link race between concurrent linkers.
pub fn ensure_hardlink(
    runtime: &crate::runtime::Runtime,
    src: &Path,
    dst: &Path,
) -> Result<()> {
    use std::os::unix::fs::MetadataExt;

    let _guard = runtime.hardlink_guard();

    if let Ok(dst_meta) = std::fs::symlink_metadata(dst) {
        let src_meta = std::fs::symlink_metadata(src)
            .map_err(|e| DebmillError::IoPath(src.display().to_string(), e))?;

        if src_meta.dev() == dst_meta.dev() && src_meta.ino() == dst_meta.ino() {
            return Ok(());
        }

        std::fs::remove_file(dst)
            .map_err(|e| DebmillError::IoPath(dst.display().to_string(), e))?;
    }

    std::fs::hard_link(src, dst)
        .map_err(|e| DebmillError::IoPath(format!("{} -> {}", src.display(), dst.display()), e))
}

/// A verified file to promote into the trusted root.
#[derive(Clone, Debug)]
pub struct TrustedFile {
    /// Absolute path of the verified file in the cache.
    pub path: PathBuf,

    /// Distribution directory the file belongs under.
    pub distribution: String,

    /// Hex SHA-256 the file was verified against.
    pub sha256: String,

    /// Source package name, used as the grouping directory.
    pub source: String,

    /// Path of the original download relative to the feed's base URL, when
    /// the feed publishes under rewritable upstream paths.
    pub redirect: Option<String>,
}

/// A scoped view over the cache and trusted roots.
#[derive(Clone)]
pub struct TrustedStore {
    cache_root: PathBuf,
    trusted_root: PathBuf,
    downloader: Arc<Downloader>,
    redirect_lock: Arc<tokio::sync::Mutex<()>>,
}

impl TrustedStore {
    /// Construct a store over absolute cache and trusted roots.
    pub fn new(
        downloader: Arc<Downloader>,
        cache_root: impl Into<PathBuf>,
        trusted_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cache_root: cache_root.into(),
            trusted_root: trusted_root.into(),
            downloader,
            redirect_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// A store scoped one path segment deeper.
    pub fn scope(&self, part: impl AsRef<Path>) -> TrustedStore {
        TrustedStore {
            cache_root: self.cache_root.join(part.as_ref()),
            trusted_root: self.trusted_root.join(part.as_ref()),
            downloader: self.downloader.clone(),
            redirect_lock: self.redirect_lock.clone(),
        }
    }

    /// A store scoped by several path segments at once.
    pub fn scope_parts(&self, parts: &[&str]) -> TrustedStore {
        parts.iter().fold(self.clone(), |store, part| store.scope(part))
    }

    /// Absolute cache path for a scope-relative path.
    pub fn cache_path(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.cache_root.join(rel.as_ref())
    }

    /// Absolute trusted path for a scope-relative path.
    pub fn trusted_path(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.trusted_root.join(rel.as_ref())
    }

    /// The trusted root of this scope.
    pub fn trusted_root(&self) -> &Path {
        &self.trusted_root
    }

    pub fn downloader(&self) -> &Arc<Downloader> {
        &self.downloader
    }

    fn cache_file_matches(&self, rel: &Path, expected_sha256: &str) -> bool {
        if expected_sha256.is_empty() {
            return false;
        }

        let path = self.cache_path(rel);
        let matched = sha256_for_file(&path)
            .map(|actual| actual.eq_ignore_ascii_case(expected_sha256))
            .unwrap_or(false);

        if matched {
            debug!(file = %rel.display(), sha256 = expected_sha256, "cache hit, download skipped");
        } else {
            debug!(file = %rel.display(), sha256 = expected_sha256, "cache miss, downloading");
        }

        matched
    }

    /// Return the cache path of a file with the expected SHA-256, downloading
    /// it if the cache does not already hold matching content.
    ///
    /// Idempotent: a cache hit issues no network request.
    pub async fn download_or_reuse(
        &self,
        expected_sha256: &str,
        url: Url,
        rel: impl AsRef<Path>,
    ) -> Result<PathBuf> {
        let rel = rel.as_ref();

        if self.cache_file_matches(rel, expected_sha256) {
            return Ok(self.cache_path(rel));
        }

        self.downloader
            .fetch(DownloadRequest {
                url,
                destination: self.cache_path(rel),
                checksum: Some(expected_sha256.to_string()),
            })
            .await?;

        Ok(self.cache_path(rel))
    }

    /// Return the cache path of an uncompressed file, preferring in order: an
    /// existing uncompressed file with the expected hash, decompressing an
    /// existing compressed file, and finally fetching the compressed variant
    /// and decompressing it.
    pub async fn download_or_reuse_compressed(
        &self,
        uncompressed_sha256: &str,
        compressed_sha256: &str,
        url: Url,
        compression: Compression,
        rel: impl AsRef<Path>,
    ) -> Result<PathBuf> {
        let rel = rel.as_ref();

        if self.cache_file_matches(rel, uncompressed_sha256) {
            return Ok(self.cache_path(rel));
        }

        let mut compressed_rel = rel.as_os_str().to_os_string();
        compressed_rel.push(compression.extension());
        let compressed_rel = PathBuf::from(compressed_rel);

        let path = if compression != Compression::None
            && self.cache_file_matches(&compressed_rel, compressed_sha256)
        {
            self.downloader
                .decompress(&self.cache_path(&compressed_rel))
                .await?
        } else {
            self.downloader
                .fetch_and_decompress(DownloadRequest {
                    url,
                    destination: self.cache_path(&compressed_rel),
                    checksum: Some(compressed_sha256.to_string()),
                })
                .await?
        };

        // The compressed hash was enforced during the transfer; the
        // uncompressed content is checked as well before anything trusts it.
        let actual = sha256_for_file(&path)?;
        if !actual.eq_ignore_ascii_case(uncompressed_sha256) {
            let _ = std::fs::remove_file(&path);
            return Err(DebmillError::DigestMismatch {
                path: path.display().to_string(),
                expected: uncompressed_sha256.to_string(),
                actual,
            });
        }

        Ok(path)
    }

    /// Promote verified files into the trusted root as one batch.
    ///
    /// The destination is `<scope>/<distribution>/<source>/<basename>`. Two
    /// batch entries wanting the same destination with different hashes is a
    /// hard error. Redirect suffixes are merged into the scope's
    /// `redirects.yaml`.
    pub async fn promote_to_trusted(&self, files: &[TrustedFile]) -> Result<()> {
        let mut seen: BTreeMap<PathBuf, &str> = BTreeMap::new();
        let mut redirects: BTreeMap<String, String> = BTreeMap::new();

        for file in files {
            let basename = file
                .path
                .file_name()
                .ok_or_else(|| DebmillError::Other(format!(
                    "trusted file has no basename: {}",
                    file.path.display()
                )))?;

            let rel = Path::new(&file.distribution)
                .join(&file.source)
                .join(basename);
            let dest = self.trusted_path(&rel);

            match seen.get(&dest) {
                Some(existing) if !existing.eq_ignore_ascii_case(&file.sha256) => {
                    return Err(DebmillError::TrustedStoreConflict(
                        dest.display().to_string(),
                    ));
                }
                Some(_) => continue,
                None => {
                    seen.insert(dest.clone(), &file.sha256);
                }
            }

            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| DebmillError::IoPath(parent.display().to_string(), e))?;
            }

            self.ensure_hardlink(&file.path, &dest)?;

            if let Some(redirect) = &file.redirect {
                redirects.insert(rel.to_string_lossy().into_owned(), redirect.clone());
            }
        }

        if !redirects.is_empty() {
            self.merge_redirect_map(redirects).await?;
        }

        Ok(())
    }

    fn ensure_hardlink(&self, src: &Path, dst: &Path) -> Result<()> {
        ensure_hardlink(self.downloader.runtime(), src, dst)
    }

    /// Merge entries into the scope's redirect map with read-modify-write
    /// serialized by the per-store mutex.
    async fn merge_redirect_map(&self, entries: BTreeMap<String, String>) -> Result<()> {
        let _guard = self.redirect_lock.lock().await;

        let map_path = self.trusted_root.join(REDIRECT_MAP_FILENAME);

        let mut merged: BTreeMap<String, String> = match std::fs::read(&map_path) {
            Ok(data) => serde_yaml::from_slice(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(DebmillError::IoPath(map_path.display().to_string(), e)),
        };

        merged.extend(entries);

        std::fs::create_dir_all(&self.trusted_root)
            .map_err(|e| DebmillError::IoPath(self.trusted_root.display().to_string(), e))?;
        std::fs::write(&map_path, serde_yaml::to_string(&merged)?)
            .map_err(|e| DebmillError::IoPath(map_path.display().to_string(), e))?;

        Ok(())
    }

    /// Load this scope's redirect map, or an empty map when none exists.
    pub fn load_redirect_map(&self) -> Result<BTreeMap<String, String>> {
        let map_path = self.trusted_root.join(REDIRECT_MAP_FILENAME);

        match std::fs::read(&map_path) {
            Ok(data) => Ok(serde_yaml::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(DebmillError::IoPath(map_path.display().to_string(), e)),
        }
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::runtime::{Runtime, RuntimeOptions},
        sha2::Digest,
    };

    fn store(dir: &Path) -> TrustedStore {
        let runtime = Runtime::new(&RuntimeOptions::default()).unwrap();
        TrustedStore::new(
            Downloader::new(runtime),
            dir.join("downloads"),
            dir.join("trusted"),
        )
    }

    fn sha256_of(data: &[u8]) -> String {
        let mut hasher = sha2::Sha256::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }

    fn seed_cache(store: &TrustedStore, rel: &str, data: &[u8]) -> PathBuf {
        let path = store.cache_path(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn scoping_is_compositional() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let nested = store.scope("github").scope("immich-app/immich");
        let flat = store.scope_parts(&["github", "immich-app/immich"]);

        assert_eq!(nested.cache_path("x"), flat.cache_path("x"));
        assert_eq!(nested.trusted_path("x"), flat.trusted_path("x"));
    }

    #[tokio::test]
    async fn download_or_reuse_is_idempotent_on_cache_hit() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let data = b"cached content";
        seed_cache(&store, "noble/vips.deb", data);

        // The URL is unroutable; a cache hit must not contact it.
        let path = store
            .download_or_reuse(
                &sha256_of(data),
                Url::parse("http://192.0.2.1:1/vips.deb").unwrap(),
                "noble/vips.deb",
            )
            .await?;

        assert_eq!(path, store.cache_path("noble/vips.deb"));
        Ok(())
    }

    #[tokio::test]
    async fn compressed_reuse_decompresses_existing_file() -> Result<()> {
        use std::io::Write as _;

        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let mut encoder = libflate::gzip::Encoder::new(vec![]).unwrap();
        encoder.write_all(b"Package: vips\n").unwrap();
        let gz = encoder.finish().into_result().unwrap();

        seed_cache(&store, "noble/Packages.gz", &gz);

        let path = store
            .download_or_reuse_compressed(
                &sha256_of(b"Package: vips\n"),
                &sha256_of(&gz),
                Url::parse("http://192.0.2.1:1/Packages.gz").unwrap(),
                Compression::Gzip,
                "noble/Packages",
            )
            .await?;

        assert_eq!(path, store.cache_path("noble/Packages"));
        assert_eq!(std::fs::read(&path).unwrap(), b"Package: vips\n");

        Ok(())
    }

    #[tokio::test]
    async fn promotion_hardlinks_and_is_idempotent() -> Result<()> {
        use std::os::unix::fs::MetadataExt;

        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let data = b"deb content";
        let cached = seed_cache(&store, "vips_8.17.3-1_amd64.deb", data);

        let file = TrustedFile {
            path: cached.clone(),
            distribution: "noble".to_string(),
            sha256: sha256_of(data),
            source: "vips".to_string(),
            redirect: None,
        };

        store.promote_to_trusted(&[file.clone()]).await?;
        store.promote_to_trusted(&[file]).await?;

        let promoted = store.trusted_path("noble/vips/vips_8.17.3-1_amd64.deb");
        let src_meta = std::fs::metadata(&cached).unwrap();
        let dst_meta = std::fs::metadata(&promoted).unwrap();
        assert_eq!(src_meta.ino(), dst_meta.ino());

        Ok(())
    }

    #[tokio::test]
    async fn batch_conflict_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let cached = seed_cache(&store, "vips.deb", b"content");

        let a = TrustedFile {
            path: cached.clone(),
            distribution: "noble".to_string(),
            sha256: "aa".repeat(32),
            source: "vips".to_string(),
            redirect: None,
        };
        let mut b = a.clone();
        b.sha256 = "bb".repeat(32);

        let err = store.promote_to_trusted(&[a, b]).await.unwrap_err();
        assert!(matches!(err, DebmillError::TrustedStoreConflict(_)));
    }

    #[tokio::test]
    async fn concurrent_promotion_of_identical_content_succeeds() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let data = b"identical";
        let cached = seed_cache(&store, "vips.deb", data);

        let tasks = (0..8)
            .map(|_| {
                let store = store.clone();
                let file = TrustedFile {
                    path: cached.clone(),
                    distribution: "noble".to_string(),
                    sha256: sha256_of(data),
                    source: "vips".to_string(),
                    redirect: None,
                };
                tokio::spawn(async move { store.promote_to_trusted(&[file]).await })
            })
            .collect::<Vec<_>>();

        for task in tasks {
            task.await.unwrap()?;
        }

        assert!(store.trusted_path("noble/vips/vips.deb").exists());
        Ok(())
    }

    #[tokio::test]
    async fn redirect_map_merges_incrementally() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let first = seed_cache(&store, "a.deb", b"a");
        let second = seed_cache(&store, "b.deb", b"b");

        store
            .promote_to_trusted(&[TrustedFile {
                path: first,
                distribution: "noble".to_string(),
                sha256: sha256_of(b"a"),
                source: "vips".to_string(),
                redirect: Some("v1.0/a.deb".to_string()),
            }])
            .await?;

        store
            .promote_to_trusted(&[TrustedFile {
                path: second,
                distribution: "noble".to_string(),
                sha256: sha256_of(b"b"),
                source: "vips".to_string(),
                redirect: Some("v1.1/b.deb".to_string()),
            }])
            .await?;

        let map = store.load_redirect_map()?;
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("noble/vips/a.deb").map(String::as_str), Some("v1.0/a.deb"));
        assert_eq!(map.get("noble/vips/b.deb").map(String::as_str), Some("v1.1/b.deb"));

        Ok(())
    }
}
