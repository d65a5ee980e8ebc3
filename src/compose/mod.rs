// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The repository composer.

The composer walks the trusted store, parses every package file, applies
filters and retention, and emits a conforming APT tree: per-architecture
`Packages`/`Sources` indices in three compressed variants, a checksummed
`Release` per distribution, and its `InRelease`/`Release.gpg` signatures.

Pipeline per invocation, strictly linear: load redirect maps (redirect mode
only) -> ingest -> materialize -> emit per distribution -> sign. In
hierarchical pool mode, package files are hardlinked into
`pool/<component>/<prefix>/<source>/` and stanzas rewritten to match; in
redirect mode stanzas point at `pool/<feed-scope>/<redirect-target>` and no
pool files are produced.
*/

use {
    crate::{
        collector::{ItemMetadata, RetentionCollector},
        config::{PackageToggles, PoolMode},
        deb::control_paragraph_from_deb,
        error::{DebmillError, Result},
        feed::{normalize_asset_filename, FeedKind, FeedOptions},
        filters::matches_glob_patterns,
        io::{checksums_for_file, compress_file, ChecksumSet, Compression},
        package::{
            is_debug_name, Package, PackageFile, SourcePackage, ALL_ARCHITECTURE,
            DEBUG_COMPONENT, MAIN_COMPONENT, SOURCE_ARCHITECTURE,
        },
        release::{generate_release, ReleaseFields},
        repository::Repository,
        retention::RetentionPolicy,
        runtime::{Runtime, SUBGROUP_WIDTH},
        signature::{RepoSigner, SignatureVerifier},
        store::{ensure_hardlink, REDIRECT_MAP_FILENAME},
    },
    futures::StreamExt,
    std::{
        collections::BTreeMap,
        path::{Path, PathBuf},
        sync::Arc,
    },
    tracing::warn,
};

/// The pool directory of a source package: `pool/<component>/<prefix>/<source>`,
/// where the prefix is the first letter, or the first four characters for
/// names beginning with `lib`.
pub fn pool_path(component: &str, source: &str) -> String {
    let prefix = if source.starts_with("lib") && source.len() > 3 {
        &source[..4]
    } else {
        &source[..source.len().min(1)]
    };

    format!("pool/{}/{}/{}", component, prefix, source)
}

/// Composer inputs.
#[derive(Clone)]
pub struct ComposeOptions {
    /// Output directory (typically `staging/<timestamp>/<repository>`).
    pub target: PathBuf,

    /// Repository name, used in `Release` identity fields.
    pub name: String,

    /// Root of the trusted store.
    pub trusted: PathBuf,

    pub pool_mode: PoolMode,

    /// Expanded feed list; locates source files and redirect maps.
    pub feeds: Vec<FeedOptions>,

    /// Repository-wide settings.
    pub toggles: PackageToggles,
    pub distributions: Vec<String>,
    pub architectures: Vec<String>,
    pub retention: Vec<RetentionPolicy>,
}

pub struct Composer {
    options: ComposeOptions,
    collector: RetentionCollector<Package>,
    verifier: SignatureVerifier,
    signer: Option<RepoSigner>,
    runtime: Arc<Runtime>,

    /// Feed scope -> (trusted-relative path within the feed -> redirect
    /// target). Immutable after loading.
    redirect_maps: BTreeMap<String, BTreeMap<String, String>>,
}

impl Composer {
    /// Construct a composer. Passing no signer skips the `InRelease` and
    /// `Release.gpg` outputs (preview runs and tests).
    pub fn new(
        options: ComposeOptions,
        signer: Option<RepoSigner>,
        runtime: Arc<Runtime>,
    ) -> Self {
        // Files in the trusted store were verified during fetch; ingest
        // strips signatures without re-verifying.
        let mut verifier = SignatureVerifier::new(vec![]);
        verifier.accept_unsigned = true;
        verifier.ignore_signatures = true;

        let collector = RetentionCollector::new(options.retention.clone(), |p: &Package| {
            ItemMetadata {
                source: p.source_name().to_string(),
                package: p.name().to_string(),
                architecture: p.architecture().to_string(),
                version: p.version_str().to_string(),
            }
        });

        Self {
            options,
            collector,
            verifier,
            signer,
            runtime,
            redirect_maps: BTreeMap::new(),
        }
    }

    /// Run the full pipeline and return the composed repository model.
    pub async fn compose(&mut self) -> Result<Repository> {
        if self.options.pool_mode == PoolMode::Redirect {
            self.load_redirect_maps()?;
        }

        self.ingest().await?;

        let repository = self.materialize()?;
        self.generate(&repository).await?;

        Ok(repository)
    }

    fn load_redirect_maps(&mut self) -> Result<()> {
        for feed in &self.options.feeds {
            let map_path = self
                .options
                .trusted
                .join(&feed.scope)
                .join(REDIRECT_MAP_FILENAME);

            let map: BTreeMap<String, String> = match std::fs::read(&map_path) {
                Ok(data) => serde_yaml::from_slice(&data)?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(DebmillError::IoPath(map_path.display().to_string(), e)),
            };

            self.redirect_maps.insert(feed.scope.clone(), map);
        }

        Ok(())
    }

    fn redirect_target(&self, feed_scope: &str, rel: &Path) -> Result<String> {
        let within_feed = rel
            .strip_prefix(feed_scope)
            .map_err(|_| DebmillError::RedirectTargetMissing {
                path: rel.display().to_string(),
                feed: feed_scope.to_string(),
            })?
            .to_string_lossy()
            .into_owned();

        self.redirect_maps
            .get(feed_scope)
            .and_then(|map| map.get(&within_feed))
            .cloned()
            .ok_or_else(|| DebmillError::RedirectTargetMissing {
                path: within_feed,
                feed: feed_scope.to_string(),
            })
    }

    /// Walk every feed scope in the trusted store and collect retained
    /// packages.
    async fn ingest(&self) -> Result<()> {
        // (feed, feed distribution, target distribution) triples to walk.
        let mut work = vec![];

        for feed in &self.options.feeds {
            if feed.distributions.is_empty() {
                // Discover mode: every distribution directory present under
                // the feed's trusted scope, filtered by the repository
                // allowlist.
                let feed_base = self.options.trusted.join(&feed.scope);
                let entries = match std::fs::read_dir(&feed_base) {
                    Ok(entries) => entries,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => {
                        return Err(DebmillError::IoPath(feed_base.display().to_string(), e))
                    }
                };

                for entry in entries {
                    let entry = entry?;
                    if !entry.file_type()?.is_dir() {
                        continue;
                    }
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if self.distribution_allowed(&name) {
                        work.push((feed.clone(), name.clone(), name));
                    }
                }
            } else {
                for map in &feed.distributions {
                    if self.distribution_allowed(&map.target) {
                        let local = if map.feed == "/" {
                            ".".to_string()
                        } else {
                            map.feed.clone()
                        };
                        work.push((feed.clone(), local, map.target.clone()));
                    }
                }
            }
        }

        let mut results = futures::stream::iter(work.iter().map(|(feed, feed_dist, target)| {
            self.ingest_feed_distribution(feed, feed_dist, target)
        }))
        .buffer_unordered(SUBGROUP_WIDTH);

        while let Some(result) = results.next().await {
            result?;
        }

        Ok(())
    }

    fn distribution_allowed(&self, distribution: &str) -> bool {
        self.options.distributions.is_empty()
            || self
                .options
                .distributions
                .iter()
                .any(|allowed| allowed == distribution)
    }

    async fn ingest_feed_distribution(
        &self,
        feed: &FeedOptions,
        feed_dist: &str,
        target_dist: &str,
    ) -> Result<()> {
        let dist_dir = self.options.trusted.join(&feed.scope).join(feed_dist);

        for path in walk_files(&dist_dir)? {
            let rel = path
                .strip_prefix(&self.options.trusted)
                .expect("walked paths live under the trusted root")
                .to_path_buf();

            self.ingest_package_file(feed, &rel, target_dist)?;
        }

        Ok(())
    }

    fn ingest_package_file(
        &self,
        feed: &FeedOptions,
        rel: &Path,
        distribution: &str,
    ) -> Result<()> {
        let Some(package) = self.parse_file(rel)? else {
            return Ok(());
        };

        let mut component = MAIN_COMPONENT;

        if package.is_source() && !self.options.toggles.source {
            return Ok(());
        }

        if package.is_debug() {
            if !self.options.toggles.debug {
                return Ok(());
            }
            component = DEBUG_COMPONENT;
        }

        if !self.options.architectures.is_empty() {
            let arch = package.architecture();
            let allowed = arch == ALL_ARCHITECTURE
                || (arch == SOURCE_ARCHITECTURE && self.options.toggles.source)
                || self.options.architectures.iter().any(|a| a == arch);

            if !allowed {
                return Ok(());
            }
        }

        if !matches_glob_patterns(&feed.sources, package.source_name()) {
            return Ok(());
        }
        if !matches_glob_patterns(&feed.packages, package.name()) {
            return Ok(());
        }

        let package = if self.options.pool_mode == PoolMode::Redirect {
            if package.is_source() && feed.kind == FeedKind::Github {
                self.normalize_github_source_package(package, rel, &feed.scope)?
            } else {
                self.apply_redirects(package, rel, &feed.scope)?
            }
        } else {
            package
        };

        self.collector.add(distribution, component, package)
    }

    /// Parse one trusted file into a package, or [None] for files the
    /// composer does not index.
    fn parse_file(&self, rel: &Path) -> Result<Option<Package>> {
        let path = self.options.trusted.join(rel);
        let filename = rel
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or_default()
            .to_string();

        if filename == REDIRECT_MAP_FILENAME {
            return Ok(None);
        }

        if !self.options.toggles.debug && is_debug_name(&filename) {
            return Ok(None);
        }

        let rel_dir = rel
            .parent()
            .unwrap_or_else(|| Path::new(""))
            .to_string_lossy()
            .into_owned();

        if filename.ends_with(".deb") || filename.ends_with(".ddeb") {
            let mut paragraph = control_paragraph_from_deb(&path)?;
            let checksums = checksums_for_file(&path)?;

            paragraph.set_field_str("Filename", format!("{}/{}", rel_dir, filename));
            paragraph.set_field_str("Size", checksums.size.to_string());
            paragraph.set_field_str("MD5sum", &checksums.md5);
            paragraph.set_field_str("SHA1", &checksums.sha1);
            paragraph.set_field_str("SHA256", &checksums.sha256);
            paragraph.set_field_str("SHA512", &checksums.sha512);

            return Ok(Some(Package::Binary(
                crate::package::BinaryPackage::from_paragraph(paragraph)?,
            )));
        }

        if filename.ends_with(".dsc") {
            if !self.options.toggles.source {
                return Ok(None);
            }

            let data = std::fs::read(&path)
                .map_err(|e| DebmillError::IoPath(path.display().to_string(), e))?;
            let (cleartext, _) = self.verifier.verify_and_clear(&filename, &data)?;

            let mut source = SourcePackage::from_dsc_paragraph(
                crate::control::parse_single_paragraph(&cleartext)?,
                &rel_dir,
            )?;

            // The original `.dsc` only declares MD5/SHA-1/SHA-256; compute
            // the full checksum set from the trusted files, and include the
            // `.dsc` itself in the file list.
            let mut files = Vec::with_capacity(source.files().len() + 1);
            for file in source.files() {
                let file_path = self.options.trusted.join(&rel_dir).join(&file.filename);
                files.push(PackageFile {
                    filename: file.filename.clone(),
                    checksums: checksums_for_file(&file_path)?,
                });
            }
            files.push(PackageFile {
                filename: filename.clone(),
                checksums: checksums_for_file(&path)?,
            });
            source.update_files(files);

            return Ok(Some(Package::Source(source)));
        }

        Ok(None)
    }

    /// Rewrite a package's pool reference to its upstream URL: binaries point
    /// `Filename` at `pool/<scope>/<redirect>`, sources point `Directory` at
    /// `pool/<scope>/<dirname(redirect)>`.
    fn apply_redirects(&self, package: Package, rel: &Path, feed_scope: &str) -> Result<Package> {
        let redirect = self.redirect_target(feed_scope, rel)?;

        if package.is_source() {
            let directory = Path::new(&redirect)
                .parent()
                .unwrap_or_else(|| Path::new(""))
                .to_string_lossy()
                .into_owned();

            package.with_field(
                "Directory",
                &format!("pool/{}/{}", feed_scope, directory),
            )
        } else {
            package.with_field("Filename", &format!("pool/{}/{}", feed_scope, redirect))
        }
    }

    /// Rewrite a code-host source package for asset-name compatibility.
    ///
    /// The host stores assets with `~` (and other characters) collapsed to
    /// `.`, so the published `Sources` entry must use the dotted version and
    /// filenames, and a matching `.dsc` must exist since the original one
    /// references the un-normalized names. This re-reads the original signed
    /// `.dsc`, strips its signature, normalizes the version and every inner
    /// filename, writes the rewritten file under `dsc/<scope>/<dir>/`, and
    /// updates the package's Files, Version, and Directory accordingly.
    fn normalize_github_source_package(
        &self,
        package: Package,
        rel: &Path,
        feed_scope: &str,
    ) -> Result<Package> {
        let Package::Source(source) = package else {
            return Err(DebmillError::Other(
                "normalization applies to source packages only".to_string(),
            ));
        };

        let dsc_path = self.options.trusted.join(rel);
        let data = std::fs::read(&dsc_path)
            .map_err(|e| DebmillError::IoPath(dsc_path.display().to_string(), e))?;

        let original_name = rel
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or_default()
            .to_string();
        let (cleartext, _) = self.verifier.verify_and_clear(&original_name, &data)?;
        let mut text = String::from_utf8_lossy(&cleartext).into_owned();

        let original_version = source.version_str().to_string();
        let normalized_version = normalize_asset_filename(&original_version);
        if original_version != normalized_version {
            text = text.replace(&original_version, &normalized_version);
        }

        let normalized_dsc_name = normalize_asset_filename(&original_name);

        let mut normalized_files = Vec::with_capacity(source.files().len());
        for file in source.files() {
            let normalized = normalize_asset_filename(&file.filename);
            if normalized != file.filename {
                text = text.replace(&file.filename, &normalized);
            }
            normalized_files.push(PackageFile {
                filename: normalized,
                checksums: file.checksums.clone(),
            });
        }

        // The rewritten `.dsc` is hosted from the output tree itself; its
        // directory mirrors the redirect target's directory.
        let redirect = self.redirect_target(feed_scope, rel)?;
        let target_dir = Path::new(&redirect)
            .parent()
            .unwrap_or_else(|| Path::new(""))
            .to_string_lossy()
            .into_owned();

        let out_path = self
            .options
            .target
            .join("dsc")
            .join(feed_scope)
            .join(&target_dir)
            .join(&normalized_dsc_name);

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DebmillError::IoPath(parent.display().to_string(), e))?;
        }
        std::fs::write(&out_path, text.as_bytes())
            .map_err(|e| DebmillError::IoPath(out_path.display().to_string(), e))?;

        let dsc_checksums = checksums_for_file(&out_path)?;
        for file in &mut normalized_files {
            if file.filename == normalized_dsc_name {
                file.checksums = dsc_checksums.clone();
            }
        }

        let mut source = source;
        source.update_files(normalized_files);

        let package = Package::Source(source)
            .with_field("Version", &normalized_version)?
            .with_field(
                "Directory",
                &format!("pool/{}/{}", feed_scope, target_dir),
            )?;

        Ok(package)
    }

    /// Build the repository model from every retained package.
    fn materialize(&self) -> Result<Repository> {
        let mut repository = Repository::new();

        self.collector.for_each_kept(|dist, component, _, _, package| {
            repository.add_package(package, dist, component)
        })?;

        Ok(repository)
    }

    async fn generate(&self, repository: &Repository) -> Result<()> {
        let mut distributions = futures::stream::iter(
            repository
                .distributions()
                .into_iter()
                .map(|dist| self.generate_distribution(repository, dist.to_string())),
        )
        .buffer_unordered(SUBGROUP_WIDTH);

        while let Some(result) = distributions.next().await {
            result?;
        }

        Ok(())
    }

    async fn generate_distribution(&self, repository: &Repository, dist: String) -> Result<()> {
        let mut components = vec![MAIN_COMPONENT];
        if self.options.toggles.debug {
            components.push(DEBUG_COMPONENT);
        }

        let mut index_files: BTreeMap<String, ChecksumSet> = BTreeMap::new();

        for component in &components {
            // Architectures process sequentially within a component; the
            // underlying package list is shared between them.
            let mut architectures =
                repository.architectures(&dist, component, self.options.toggles.source);

            // Sources enabled means a Sources index exists even when no
            // source package survived; only the main component carries it.
            if self.options.toggles.source
                && *component == MAIN_COMPONENT
                && !architectures.iter().any(|a| a == SOURCE_ARCHITECTURE)
            {
                architectures.push(SOURCE_ARCHITECTURE.to_string());
            }

            for architecture in architectures {
                let files = self
                    .generate_package_index(repository, &dist, component, &architecture)
                    .await?;
                index_files.extend(files);
            }
        }

        if !index_files.is_empty() {
            self.generate_release_files(repository, &dist, index_files)?;
        }

        Ok(())
    }

    async fn generate_package_index(
        &self,
        repository: &Repository,
        dist: &str,
        component: &str,
        architecture: &str,
    ) -> Result<BTreeMap<String, ChecksumSet>> {
        let is_source = architecture == SOURCE_ARCHITECTURE;

        let arch_dirname = if is_source {
            SOURCE_ARCHITECTURE.to_string()
        } else {
            format!("binary-{}", architecture)
        };

        let rel_dir = format!("{}/{}", component, arch_dirname);
        let out_dir = self.options.target.join("dists").join(dist).join(&rel_dir);

        let packages = repository
            .package_list(dist, component)
            .map(|list| {
                list.sorted_for_index(architecture)
                    .into_iter()
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        if packages.is_empty() && is_source && component == MAIN_COMPONENT {
            warn!(dist = %dist, component, "empty source package list but sources are enabled");
        }
        if packages.is_empty() && !is_source {
            return Ok(BTreeMap::new());
        }

        // Hierarchical mode hardlinks pool files and rewrites stanzas before
        // emission so every emitted path exists in the produced pool.
        let packages = if self.options.pool_mode == PoolMode::Hierarchical {
            packages
                .into_iter()
                .map(|package| self.link_package_to_pool(package, component))
                .collect::<Result<Vec<_>>>()?
        } else {
            packages
        };

        std::fs::create_dir_all(&out_dir)
            .map_err(|e| DebmillError::IoPath(out_dir.display().to_string(), e))?;

        let index_name = if is_source { "Sources" } else { "Packages" };
        let index_path = out_dir.join(index_name);

        {
            let mut fh = std::fs::File::create(&index_path)
                .map_err(|e| DebmillError::IoPath(index_path.display().to_string(), e))?;

            for package in &packages {
                package.write_stanza(&mut fh)?;
                std::io::Write::write_all(&mut fh, b"\n")?;
            }
        }

        let mut index_files = BTreeMap::new();
        index_files.insert(
            format!("{}/{}", rel_dir, index_name),
            checksums_for_file(&index_path)?,
        );

        // All compressed variants in parallel, each under a compression slot.
        let mut compressions =
            futures::stream::iter(Compression::index_variants().map(|compression| {
                let index_path = index_path.clone();
                async move {
                    let _permit = self.runtime.acquire_compression().await;
                    compress_file(&index_path, compression).await
                }
            }))
            .buffer_unordered(SUBGROUP_WIDTH);

        while let Some(compressed_path) = compressions.next().await {
            let compressed_path = compressed_path?;
            let compressed_name = compressed_path
                .file_name()
                .and_then(|v| v.to_str())
                .expect("compressed index has a UTF-8 name")
                .to_string();

            index_files.insert(
                format!("{}/{}", rel_dir, compressed_name),
                checksums_for_file(&compressed_path)?,
            );
        }

        Ok(index_files)
    }

    /// Hardlink a package's files from the trusted store into the pool and
    /// rewrite its stanza to the pool location.
    fn link_package_to_pool(&self, package: Package, component: &str) -> Result<Package> {
        let target_rel = pool_path(component, package.source_name());
        let target_dir = self.options.target.join(&target_rel);

        std::fs::create_dir_all(&target_dir)
            .map_err(|e| DebmillError::IoPath(target_dir.display().to_string(), e))?;

        let original_dir = match &package {
            Package::Source(source) => source.directory()?.to_string(),
            Package::Binary(binary) => Path::new(binary.filename()?)
                .parent()
                .unwrap_or_else(|| Path::new(""))
                .to_string_lossy()
                .into_owned(),
        };

        for file in package.files()? {
            let source_path = self
                .options
                .trusted
                .join(&original_dir)
                .join(&file.filename);
            let dest_path = target_dir.join(&file.filename);

            ensure_hardlink(&self.runtime, &source_path, &dest_path)?;
        }

        match &package {
            Package::Source(_) => package.with_field("Directory", &target_rel),
            Package::Binary(binary) => {
                let filename = Path::new(binary.filename()?)
                    .file_name()
                    .and_then(|v| v.to_str())
                    .unwrap_or_default()
                    .to_string();

                package.with_field("Filename", &format!("{}/{}", target_rel, filename))
            }
        }
    }

    fn generate_release_files(
        &self,
        repository: &Repository,
        dist: &str,
        files: BTreeMap<String, ChecksumSet>,
    ) -> Result<()> {
        // Union of architectures across components; `all` and `source` are
        // excluded by the architecture enumeration.
        let mut architectures = vec![];
        for component in repository.components(dist) {
            architectures.extend(repository.architectures(dist, component, false));
        }
        architectures.sort();
        architectures.dedup();

        let components = repository
            .components(dist)
            .into_iter()
            .map(|c| c.to_string())
            .collect();

        let fields = ReleaseFields {
            origin: format!("{} {}", self.options.name, dist),
            label: format!("{} {}", self.options.name, dist),
            suite: dist.to_string(),
            codename: dist.to_string(),
            date: chrono::Utc::now(),
            architectures,
            components,
            description: "Generated by debmill".to_string(),
            files,
        };

        let dist_dir = self.options.target.join("dists").join(dist);
        std::fs::create_dir_all(&dist_dir)
            .map_err(|e| DebmillError::IoPath(dist_dir.display().to_string(), e))?;

        let release_path = dist_dir.join("Release");
        {
            let mut fh = std::fs::File::create(&release_path)
                .map_err(|e| DebmillError::IoPath(release_path.display().to_string(), e))?;
            generate_release(&mut fh, &fields)?;
        }

        // Signing is single-threaded per distribution: the two signatures of
        // one Release are produced back to back.
        if let Some(signer) = &self.signer {
            signer.clearsign(&release_path, &dist_dir.join("InRelease"))?;
            signer.detached_sign(&release_path, &dist_dir.join("Release.gpg"))?;
        }

        Ok(())
    }
}

/// Recursively collect every file under `dir`. A missing directory yields an
/// empty list.
fn walk_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = vec![];

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(DebmillError::IoPath(dir.display().to_string(), e)),
    };

    for entry in entries {
        let entry = entry?;
        let path = entry.path();

        if entry.file_type()?.is_dir() {
            files.extend(walk_files(&path)?);
        } else {
            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}
