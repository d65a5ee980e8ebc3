// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The release-page feed adapter.

Release pages publish build artifacts as named assets. A `.changes` file is
the trust anchor of each source build: it is downloaded first (against the
digest the hosting API advertises), signature-verified, and filtered; the
retained `.changes` files then drive every other download against the
SHA-256 digests they declare, preserving the chain of trust.

The host normalizes uploaded filenames into `[A-Za-z0-9._-]`, collapsing
every other character to `.`. Asset lookups apply the same substitution when
resolving the filenames Debian metadata references.
*/

use {
    crate::{
        changes::ChangesFile,
        collector::{ItemMetadata, RetentionCollector},
        control::parse_single_paragraph,
        download::DownloadRequest,
        error::{DebmillError, Result},
        feed::{normalize_asset_filename, Feed, FeedOptions, ReleaseKind},
        filters::matches_glob_patterns,
        package::{
            is_debug_name, PackageFile, SourcePackage, MAIN_COMPONENT, SOURCE_ARCHITECTURE,
        },
        runtime::{Runtime, SUBGROUP_WIDTH},
        signature::SignatureVerifier,
        store::{TrustedFile, TrustedStore},
    },
    async_trait::async_trait,
    futures::{future::BoxFuture, StreamExt},
    serde::Deserialize,
    std::{path::Path, sync::Arc},
    tracing::warn,
    url::Url,
};

const RELEASES_PER_PAGE: usize = 100;

/// A release on the hosting provider's release page.
#[derive(Clone, Debug, Deserialize)]
pub struct ReleasePage {
    pub tag_name: String,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub prerelease: bool,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

impl ReleasePage {
    fn kind(&self) -> ReleaseKind {
        if self.draft {
            ReleaseKind::Draft
        } else if self.prerelease {
            ReleaseKind::PreRelease
        } else {
            ReleaseKind::Release
        }
    }
}

/// An asset attached to a release.
#[derive(Clone, Debug, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,

    /// Digest advertised by the API, in `algo:hex` form.
    #[serde(default)]
    pub digest: Option<String>,
}

/// Split an advertised digest into algorithm and hex value. A bare hex value
/// is assumed SHA-256.
pub fn parse_asset_digest(digest: &str) -> Option<(&str, &str)> {
    if digest.is_empty() {
        return None;
    }

    match digest.split_once(':') {
        Some((algorithm, value)) => Some((algorithm, value)),
        None => Some(("sha256", digest)),
    }
}

/// Minimal REST client for the hosting provider's release listing.
pub struct ReleaseClient {
    runtime: Arc<Runtime>,
    api_base: Url,
    token: Option<String>,
}

impl ReleaseClient {
    pub fn new(runtime: Arc<Runtime>, token: Option<String>) -> Self {
        Self {
            runtime,
            api_base: Url::parse("https://api.github.com").expect("static URL parses"),
            token,
        }
    }

    /// Construct against a different API endpoint (used by tests).
    pub fn with_api_base(runtime: Arc<Runtime>, token: Option<String>, api_base: Url) -> Self {
        Self {
            runtime,
            api_base,
            token,
        }
    }

    /// List all releases of a repository, following pagination.
    pub async fn list_releases(&self, owner: &str, repo: &str) -> Result<Vec<ReleasePage>> {
        let mut releases = vec![];
        let mut page = 1usize;

        loop {
            let url = Url::parse(&format!(
                "{}/repos/{}/{}/releases?per_page={}&page={}",
                self.api_base.as_str().trim_end_matches('/'),
                owner,
                repo,
                RELEASES_PER_PAGE,
                page
            ))?;

            let mut request = self
                .runtime
                .http()
                .get(url)
                .header("Accept", "application/vnd.github+json")
                .header("User-Agent", "debmill");

            if let Some(token) = &self.token {
                request = request.header("Authorization", format!("Bearer {}", token));
            }

            let batch: Vec<ReleasePage> = request
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            let count = batch.len();
            releases.extend(batch);

            if count < RELEASES_PER_PAGE {
                break;
            }
            page += 1;
        }

        Ok(releases)
    }
}

/// A retained `.changes` file together with the release it came from.
#[derive(Clone)]
struct ChangesCandidate {
    changes: ChangesFile,
    release: ReleasePage,
}

pub struct GithubFeed {
    options: FeedOptions,
    verifier: SignatureVerifier,
    client: ReleaseClient,
    owner: String,
    repo: String,
}

impl GithubFeed {
    pub fn new(
        options: FeedOptions,
        verifier: SignatureVerifier,
        client: ReleaseClient,
    ) -> Result<Self> {
        let mut parts = options.name.splitn(2, '/');
        let (owner, repo) = match (parts.next(), parts.next()) {
            (Some(owner), Some(repo)) => (owner.to_string(), repo.to_string()),
            _ => {
                return Err(DebmillError::ConfigInvalid(format!(
                    "repository must be in 'owner/repo' format, got: {}",
                    options.name
                )))
            }
        };

        Ok(Self {
            options,
            verifier,
            client,
            owner,
            repo,
        })
    }

    fn matches_release_kind(&self, release: &ReleasePage) -> bool {
        if self.options.releases.is_empty() {
            return release.kind() == ReleaseKind::Release;
        }

        self.options.releases.contains(&release.kind())
    }

    fn include_distribution(&self, distribution: &str) -> bool {
        if self.options.distributions.is_empty() {
            return true;
        }

        self.options
            .distributions
            .iter()
            .any(|map| map.feed == distribution)
    }

    /// Resolve a referenced filename to its release asset through the host's
    /// filename normalization.
    fn find_asset<'a>(&self, release: &'a ReleasePage, filename: &str) -> Result<&'a ReleaseAsset> {
        let normalized = normalize_asset_filename(filename);

        release
            .assets
            .iter()
            .find(|asset| asset.name == normalized)
            .ok_or_else(|| DebmillError::AssetNotFound(filename.to_string()))
    }

    /// The asset URL's path relative to the feed's download base URL.
    fn redirect_suffix(&self, asset_url: &str) -> Result<String> {
        let base = format!("{}/", self.options.download_url.as_str().trim_end_matches('/'));

        asset_url
            .strip_prefix(&base)
            .map(|suffix| suffix.to_string())
            .ok_or_else(|| DebmillError::RedirectBaseMismatch {
                url: asset_url.to_string(),
                base,
            })
    }

    async fn collect_changes(
        &self,
        store: &TrustedStore,
        release: &ReleasePage,
        collector: &RetentionCollector<ChangesCandidate>,
    ) -> Result<()> {
        for asset in release
            .assets
            .iter()
            .filter(|asset| asset.name.ends_with(".changes"))
        {
            let cache_rel = Path::new(&release.tag_name).join(&asset.name);
            let url = Url::parse(&asset.browser_download_url)?;

            // Prefer the digest the hosting API advertises for the trust
            // anchor itself.
            let sha256 = asset
                .digest
                .as_deref()
                .and_then(parse_asset_digest)
                .filter(|(algorithm, _)| *algorithm == "sha256")
                .map(|(_, value)| value.to_string());

            let path = match sha256 {
                Some(sha256) => store.download_or_reuse(&sha256, url, &cache_rel).await?,
                None => {
                    let destination = store.cache_path(&cache_rel);
                    store
                        .downloader()
                        .fetch(DownloadRequest {
                            url,
                            destination: destination.clone(),
                            checksum: None,
                        })
                        .await?;
                    destination
                }
            };

            let data = std::fs::read(&path)
                .map_err(|e| DebmillError::IoPath(path.display().to_string(), e))?;
            let changes = ChangesFile::parse(&asset.name, &data, &self.verifier)?;

            if !self.include_distribution(&changes.distribution) {
                continue;
            }
            if !matches_glob_patterns(&self.options.sources, &changes.source) {
                continue;
            }
            if !matches_glob_patterns(&self.options.packages, &changes.source) {
                continue;
            }

            let distribution = changes.distribution.clone();
            collector.add(
                &distribution,
                MAIN_COMPONENT,
                ChangesCandidate {
                    changes,
                    release: release.clone(),
                },
            )?;
        }

        Ok(())
    }

    async fn process_kept_changes(
        &self,
        store: &TrustedStore,
        candidate: &ChangesCandidate,
    ) -> Result<()> {
        let changes = &candidate.changes;
        let release = &candidate.release;

        let mut work = vec![];
        for file in &changes.files {
            if file.filename.ends_with(".dsc") {
                if self.options.toggles.source {
                    work.push((file.clone(), true));
                }
            } else if file.filename.ends_with(".deb") || file.filename.ends_with(".ddeb") {
                if is_debug_name(&file.filename) && !self.options.toggles.debug {
                    continue;
                }
                work.push((file.clone(), false));
            }
        }

        let mut results = futures::stream::iter(work.iter().map(
            |(file, is_dsc)| -> BoxFuture<'_, Result<Vec<TrustedFile>>> {
                Box::pin(async move {
                    if *is_dsc {
                        self.process_dsc_file(store, file, release, changes).await
                    } else {
                        self.download_referenced_file(
                            store,
                            file,
                            release,
                            &changes.distribution,
                            &changes.source,
                        )
                        .await
                        .map(|file| vec![file])
                    }
                })
            },
        ))
        .buffer_unordered(SUBGROUP_WIDTH);

        let mut files = vec![];
        while let Some(result) = results.next().await {
            files.extend(result?);
        }

        store.promote_to_trusted(&files).await
    }

    /// Download a file referenced by Debian metadata, verified against the
    /// declaring document's SHA-256, and register it with its redirect
    /// suffix.
    async fn download_referenced_file(
        &self,
        store: &TrustedStore,
        file: &PackageFile,
        release: &ReleasePage,
        distribution: &str,
        source: &str,
    ) -> Result<TrustedFile> {
        let asset = self.find_asset(release, &file.filename)?;

        if file.checksums.sha256.is_empty() {
            return Err(DebmillError::Other(format!(
                "referenced file {} lacks a SHA256 digest",
                file.filename
            )));
        }

        let cache_rel = Path::new(&release.tag_name).join(&file.filename);
        let path = store
            .download_or_reuse(
                &file.checksums.sha256,
                Url::parse(&asset.browser_download_url)?,
                &cache_rel,
            )
            .await?;

        Ok(TrustedFile {
            path,
            distribution: distribution.to_string(),
            sha256: file.checksums.sha256.clone(),
            source: source.to_string(),
            redirect: Some(self.redirect_suffix(&asset.browser_download_url)?),
        })
    }

    /// Download and parse a `.dsc`, then transitively download the files it
    /// references. An unsigned `.dsc` is accepted with a warning when (and
    /// only when) the enclosing `.changes` signature actually verified; a
    /// merely clearsigned-looking `.changes` does not qualify.
    async fn process_dsc_file(
        &self,
        store: &TrustedStore,
        file: &PackageFile,
        release: &ReleasePage,
        changes: &ChangesFile,
    ) -> Result<Vec<TrustedFile>> {
        let dsc = self
            .download_referenced_file(store, file, release, &changes.distribution, &changes.source)
            .await?;

        let data = std::fs::read(&dsc.path)
            .map_err(|e| DebmillError::IoPath(dsc.path.display().to_string(), e))?;

        let cleartext = match self.verifier.verify_and_clear(&file.filename, &data) {
            Ok((cleartext, _)) => cleartext,
            Err(err) if err.is_signature_error() && changes.is_signed() => {
                let (cleartext, _) = self
                    .verifier
                    .accepting_unsigned()
                    .verify_and_clear(&file.filename, &data)?;

                warn!(
                    file = file.filename.as_str(),
                    "accepting unsigned .dsc file since .changes is signed"
                );
                cleartext
            }
            Err(err) => return Err(err),
        };

        let source_package =
            SourcePackage::from_dsc_paragraph(parse_single_paragraph(&cleartext)?, ".")?;

        let mut files = vec![dsc];

        let nested = source_package
            .files()
            .iter()
            .filter(|nested| nested.filename != file.filename)
            .cloned()
            .collect::<Vec<_>>();

        let mut results = futures::stream::iter(nested.iter().map(
            |nested| -> BoxFuture<'_, Result<TrustedFile>> {
                Box::pin(self.download_referenced_file(
                    store,
                    nested,
                    release,
                    &changes.distribution,
                    &changes.source,
                ))
            },
        ))
        .buffer_unordered(SUBGROUP_WIDTH);

        while let Some(result) = results.next().await {
            files.push(result?);
        }

        Ok(files)
    }
}

#[async_trait]
impl Feed for GithubFeed {
    async fn run(&self, store: &TrustedStore) -> Result<()> {
        let releases = self.client.list_releases(&self.owner, &self.repo).await?;

        let collector = RetentionCollector::new(
            self.options.retention.clone(),
            |candidate: &ChangesCandidate| ItemMetadata {
                source: candidate.changes.source.clone(),
                package: candidate.changes.source.clone(),
                architecture: SOURCE_ARCHITECTURE.to_string(),
                version: candidate.changes.version.clone(),
            },
        );

        let selected = releases
            .iter()
            .filter(|release| self.matches_release_kind(release))
            .filter(|release| matches_glob_patterns(&self.options.tags, &release.tag_name))
            .collect::<Vec<_>>();

        let mut listings = futures::stream::iter(selected.iter().map(
            |release| -> BoxFuture<'_, Result<()>> {
                Box::pin(self.collect_changes(store, release, &collector))
            },
        ))
        .buffer_unordered(SUBGROUP_WIDTH);

        while let Some(result) = listings.next().await {
            result?;
        }

        let kept = collector.kept()?;

        let mut processing = futures::stream::iter(kept.iter().map(
            |candidate| -> BoxFuture<'_, Result<()>> {
                Box::pin(self.process_kept_changes(store, candidate))
            },
        ))
        .buffer_unordered(SUBGROUP_WIDTH);

        while let Some(result) = processing.next().await {
            result?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{
            download::Downloader,
            feed::DistributionMap,
            runtime::RuntimeOptions,
            signature::{create_self_signed_key, signing_key_params_builder, RepoSigner},
        },
        sha2::Digest,
        std::collections::HashMap,
        tokio::io::{AsyncReadExt, AsyncWriteExt},
    };

    fn sha256_of(data: &[u8]) -> String {
        let mut hasher = sha2::Sha256::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }

    type Routes = Arc<std::sync::Mutex<HashMap<String, Vec<u8>>>>;

    /// Bind a server first, returning its base URL and a mutable route
    /// table, so fixtures can register routes that reference the server's
    /// own address.
    async fn spawn_server() -> (Url, Routes) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let routes: Routes = Arc::new(std::sync::Mutex::new(HashMap::new()));

        let server_routes = routes.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let routes = server_routes.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 16384];
                    let count = socket.read(&mut buf).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buf[..count]).to_string();
                    let path = request
                        .split_whitespace()
                        .nth(1)
                        .unwrap_or_default()
                        .to_string();

                    let body = routes.lock().unwrap().get(&path).cloned();
                    let response = match body {
                        Some(body) => {
                            let mut response = format!(
                                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                                body.len()
                            )
                            .into_bytes();
                            response.extend_from_slice(body);
                            response
                        }
                        None => b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec(),
                    };

                    let _ = socket.write_all(&response).await;
                });
            }
        });

        (Url::parse(&format!("http://{}", addr)).unwrap(), routes)
    }

    const ORIG_TAR: &[u8] = b"original tarball bytes";
    const DEBIAN_TAR: &[u8] = b"debian tarball bytes";
    const DEB: &[u8] = b"server binary package bytes";

    fn dsc_text() -> String {
        format!(
            "Format: 3.0 (quilt)\n\
             Source: immich\n\
             Binary: immich-server\n\
             Architecture: any\n\
             Version: 2.4.1-0alpha3~noble\n\
             Checksums-Sha256:\n\
             \x20{} {} immich_2.4.1.orig.tar.xz\n\
             \x20{} {} immich_2.4.1-0alpha3~noble.debian.tar.xz\n\
             Files:\n\
             \x20{} {} immich_2.4.1.orig.tar.xz\n\
             \x20{} {} immich_2.4.1-0alpha3~noble.debian.tar.xz\n",
            sha256_of(ORIG_TAR),
            ORIG_TAR.len(),
            sha256_of(DEBIAN_TAR),
            DEBIAN_TAR.len(),
            "d41d8cd98f00b204e9800998ecf8427e",
            ORIG_TAR.len(),
            "d41d8cd98f00b204e9800998ecf8427e",
            DEBIAN_TAR.len(),
        )
    }

    fn changes_text(dsc: &str) -> String {
        format!(
            "Format: 1.8\n\
             Source: immich\n\
             Binary: immich-server\n\
             Architecture: source amd64\n\
             Version: 2.4.1-0alpha3~noble\n\
             Distribution: noble\n\
             Checksums-Sha256:\n\
             \x20{} {} immich_2.4.1-0alpha3~noble.dsc\n\
             \x20{} {} immich-server_2.4.1-0alpha3~noble_amd64.deb\n\
             Files:\n\
             \x20{} {} a b immich_2.4.1-0alpha3~noble.dsc\n\
             \x20{} {} a b immich-server_2.4.1-0alpha3~noble_amd64.deb\n",
            sha256_of(dsc.as_bytes()),
            dsc.len(),
            sha256_of(DEB),
            DEB.len(),
            "d41d8cd98f00b204e9800998ecf8427e",
            dsc.len(),
            "d41d8cd98f00b204e9800998ecf8427e",
            DEB.len(),
        )
    }

    fn release_json(base: &Url, tag: &str, assets: &[(&str, &[u8])]) -> serde_json::Value {
        serde_json::json!([{
            "tag_name": tag,
            "draft": false,
            "prerelease": false,
            "assets": assets.iter().map(|(name, body)| serde_json::json!({
                "name": name,
                "browser_download_url": format!("{}/releases/download/{}/{}", base.as_str().trim_end_matches('/'), tag, name),
                "digest": format!("sha256:{}", sha256_of(body)),
            })).collect::<Vec<_>>(),
        }])
    }

    struct Fixture {
        store: TrustedStore,
        feed: GithubFeed,
        _dir: tempfile::TempDir,
    }

    async fn fixture(source_enabled: bool) -> Fixture {
        let mut verifier = SignatureVerifier::new(vec![]);
        verifier.accept_unsigned = true;

        let changes = changes_text(&dsc_text());
        build_fixture(source_enabled, changes.into_bytes(), verifier).await
    }

    /// Build a feed + store against a local server. The `.changes` asset
    /// body and the feed verifier are caller-supplied so signature handling
    /// can be exercised.
    async fn build_fixture(
        source_enabled: bool,
        changes_asset: Vec<u8>,
        verifier: SignatureVerifier,
    ) -> Fixture {
        let dsc = dsc_text();

        // Asset names as the host normalizes them: tildes become dots.
        let assets: Vec<(String, Vec<u8>)> = vec![
            (
                "immich_2.4.1-0alpha3.noble.changes".to_string(),
                changes_asset,
            ),
            (
                "immich_2.4.1-0alpha3.noble.dsc".to_string(),
                dsc.clone().into_bytes(),
            ),
            ("immich_2.4.1.orig.tar.xz".to_string(), ORIG_TAR.to_vec()),
            (
                "immich_2.4.1-0alpha3.noble.debian.tar.xz".to_string(),
                DEBIAN_TAR.to_vec(),
            ),
            (
                "immich-server_2.4.1-0alpha3.noble_amd64.deb".to_string(),
                DEB.to_vec(),
            ),
        ];

        let (base, routes) = spawn_server().await;

        {
            let asset_refs = assets
                .iter()
                .map(|(name, body)| (name.as_str(), body.as_slice()))
                .collect::<Vec<_>>();

            let mut routes = routes.lock().unwrap();
            routes.insert(
                "/repos/immich-app/immich/releases?per_page=100&page=1".to_string(),
                serde_json::to_vec(&release_json(&base, "v2.4.1", &asset_refs)).unwrap(),
            );
            for (name, body) in &assets {
                routes.insert(format!("/releases/download/v2.4.1/{}", name), body.clone());
            }
        }

        let runtime = Runtime::new(&RuntimeOptions::default()).unwrap();
        let downloader = Downloader::new(runtime.clone());

        let dir = tempfile::tempdir().unwrap();
        let store = TrustedStore::new(
            downloader,
            dir.path().join("downloads"),
            dir.path().join("trusted"),
        );

        let mut options: FeedOptions = serde_yaml::from_str("github: immich-app/immich").unwrap();
        options.download_url = Url::parse(&format!("{}/releases/download", base.as_str().trim_end_matches('/'))).unwrap();
        options.distributions = vec![DistributionMap {
            feed: "noble".to_string(),
            target: "noble".to_string(),
        }];
        options.toggles.source = source_enabled;
        options.toggles.debug = false;

        let client = ReleaseClient::with_api_base(runtime, None, base);
        let feed = GithubFeed::new(options, verifier, client).unwrap();

        Fixture {
            store,
            feed,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn changes_anchored_fetch_promotes_binaries() -> Result<()> {
        let fixture = fixture(false).await;
        fixture.feed.run(&fixture.store).await?;

        let promoted = fixture
            .store
            .trusted_path("noble/immich/immich-server_2.4.1-0alpha3~noble_amd64.deb");
        assert_eq!(std::fs::read(&promoted).unwrap(), DEB);

        // No source artifacts without the source toggle.
        assert!(!fixture
            .store
            .trusted_path("noble/immich/immich_2.4.1-0alpha3~noble.dsc")
            .exists());

        let redirects = fixture.store.load_redirect_map()?;
        assert_eq!(
            redirects
                .get("noble/immich/immich-server_2.4.1-0alpha3~noble_amd64.deb")
                .map(String::as_str),
            Some("v2.4.1/immich-server_2.4.1-0alpha3.noble_amd64.deb")
        );

        Ok(())
    }

    #[tokio::test]
    async fn dsc_files_download_transitively() -> Result<()> {
        let fixture = fixture(true).await;
        fixture.feed.run(&fixture.store).await?;

        for file in [
            "noble/immich/immich_2.4.1-0alpha3~noble.dsc",
            "noble/immich/immich_2.4.1.orig.tar.xz",
            "noble/immich/immich_2.4.1-0alpha3~noble.debian.tar.xz",
            "noble/immich/immich-server_2.4.1-0alpha3~noble_amd64.deb",
        ] {
            assert!(fixture.store.trusted_path(file).exists(), "{}", file);
        }

        let redirects = fixture.store.load_redirect_map()?;
        assert_eq!(
            redirects
                .get("noble/immich/immich_2.4.1-0alpha3~noble.dsc")
                .map(String::as_str),
            Some("v2.4.1/immich_2.4.1-0alpha3.noble.dsc")
        );

        Ok(())
    }

    /// Clearsign `text` with a freshly generated key, returning the signed
    /// bytes and the public key that verifies them.
    fn clearsigned_changes(text: &str) -> (Vec<u8>, pgp::SignedPublicKey) {
        let (secret, public) = create_self_signed_key(
            signing_key_params_builder("Uploader <uploader@example.com>")
                .build()
                .unwrap(),
            String::new,
        )
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("upload.changes");
        let signed = dir.path().join("upload.changes.asc");
        std::fs::write(&plain, text).unwrap();

        RepoSigner::new(secret, "")
            .clearsign(&plain, &signed)
            .unwrap();

        (std::fs::read(&signed).unwrap(), public)
    }

    #[tokio::test]
    async fn verified_changes_admits_unsigned_dsc() -> Result<()> {
        let (signed_changes, public) = clearsigned_changes(&changes_text(&dsc_text()));

        // Strict verifier: the .changes signature verifies, so the unsigned
        // .dsc passes through the fallback with a warning.
        let verifier = SignatureVerifier::new(vec![public]);
        let fixture = build_fixture(true, signed_changes, verifier).await;

        fixture.feed.run(&fixture.store).await?;

        for file in [
            "noble/immich/immich_2.4.1-0alpha3~noble.dsc",
            "noble/immich/immich_2.4.1.orig.tar.xz",
            "noble/immich/immich_2.4.1-0alpha3~noble.debian.tar.xz",
            "noble/immich/immich-server_2.4.1-0alpha3~noble_amd64.deb",
        ] {
            assert!(fixture.store.trusted_path(file).exists(), "{}", file);
        }

        Ok(())
    }

    #[tokio::test]
    async fn unverified_clearsigned_changes_rejects_unsigned_dsc() -> Result<()> {
        let (signed_changes, _public) = clearsigned_changes(&changes_text(&dsc_text()));

        // The cleartext wrapper is present but nothing verifies it: with
        // signatures ignored the .changes is not a signed trust anchor, so
        // the unsigned .dsc must be rejected rather than falling back.
        let mut verifier = SignatureVerifier::new(vec![]);
        verifier.ignore_signatures = true;

        let fixture = build_fixture(true, signed_changes, verifier).await;

        let err = fixture.feed.run(&fixture.store).await.unwrap_err();
        assert!(matches!(err, DebmillError::SignatureMissing(_)));

        Ok(())
    }

    #[test]
    fn digest_parsing() {
        assert_eq!(parse_asset_digest("sha256:abcd"), Some(("sha256", "abcd")));
        assert_eq!(parse_asset_digest("abcd"), Some(("sha256", "abcd")));
        assert_eq!(parse_asset_digest(""), None);
    }

    #[test]
    fn release_kind_classification() {
        let release = ReleasePage {
            tag_name: "v1".to_string(),
            draft: false,
            prerelease: true,
            assets: vec![],
        };
        assert_eq!(release.kind(), ReleaseKind::PreRelease);

        let draft = ReleasePage {
            tag_name: "v2".to_string(),
            draft: true,
            prerelease: true,
            assets: vec![],
        };
        assert_eq!(draft.kind(), ReleaseKind::Draft);
    }

    #[tokio::test]
    async fn redirect_suffix_requires_download_base() {
        let fixture = fixture(false).await;

        let err = fixture
            .feed
            .redirect_suffix("https://elsewhere.example.com/file.deb")
            .unwrap_err();
        assert!(matches!(err, DebmillError::RedirectBaseMismatch { .. }));
    }
}
