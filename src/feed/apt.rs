// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The APT feed adapter.

For each configured distribution: fetch and verify `InRelease`, pick the
smallest declared variant of every `Packages`/`Sources` index, download and
verify it, then download every package file the retained entries reference,
each against the SHA-256 declared by the verified index. Verified files are
promoted into the feed's trusted scope as one batch per distribution.

A distribution entry of `/` denotes a flat repository: `InRelease` sits
directly under the base URL and files store under `.` locally.
*/

use {
    crate::{
        collector::{ItemMetadata, RetentionCollector},
        control::ControlParagraphReader,
        error::{DebmillError, Result},
        feed::{join_url, DistributionMap, Feed, FeedOptions},
        filters::matches_glob_patterns,
        io::Compression,
        package::{BinaryPackage, Package, SourcePackage, DEBUG_COMPONENT, MAIN_COMPONENT},
        release::ReleaseManifest,
        runtime::SUBGROUP_WIDTH,
        signature::SignatureVerifier,
        store::{TrustedFile, TrustedStore},
    },
    async_trait::async_trait,
    futures::{future::BoxFuture, StreamExt},
    std::path::Path,
    tracing::warn,
};

pub struct AptFeed {
    options: FeedOptions,
    verifier: SignatureVerifier,
}

impl AptFeed {
    pub fn new(options: FeedOptions, verifier: SignatureVerifier) -> Self {
        Self { options, verifier }
    }

    async fn process_distribution(
        &self,
        store: &TrustedStore,
        map: &DistributionMap,
    ) -> Result<()> {
        let is_flat = map.feed == "/";
        let local = if is_flat { "." } else { map.feed.as_str() };

        let release_url = if is_flat {
            join_url(&self.options.download_url, "InRelease")?
        } else {
            join_url(
                &self.options.download_url,
                &format!("dists/{}/InRelease", map.feed),
            )?
        };

        let release_rel = Path::new(local).join("InRelease");
        store
            .downloader()
            .fetch(crate::download::DownloadRequest {
                url: release_url,
                destination: store.cache_path(&release_rel),
                checksum: None,
            })
            .await?;

        let release_data = std::fs::read(store.cache_path(&release_rel))
            .map_err(|e| DebmillError::IoPath(release_rel.display().to_string(), e))?;
        let manifest = ReleaseManifest::parse("InRelease", &release_data, &self.verifier)?;

        // URL path between the base and index paths: empty for flat
        // repositories, `dists/<dist>` otherwise.
        let url_infix = if is_flat {
            String::new()
        } else {
            format!("dists/{}", map.feed)
        };

        let indices = self.unique_base_indices(&manifest);

        let mut results = futures::stream::iter(indices.iter().map(
            |index| -> BoxFuture<'_, Result<Vec<TrustedFile>>> {
                Box::pin(self.process_index(store, local, index, &manifest, &url_infix))
            },
        ))
        .buffer_unordered(SUBGROUP_WIDTH);

        let mut files = vec![];
        while let Some(result) = results.next().await {
            files.extend(result?);
        }

        store.promote_to_trusted(&files).await
    }

    /// Deduplicated index base paths: every `Packages` index, plus `Sources`
    /// when source packages are enabled. Compression extensions are stripped
    /// to find the base.
    fn unique_base_indices(&self, manifest: &ReleaseManifest) -> Vec<String> {
        let mut indices = vec![];

        for path in manifest.files.keys() {
            let compression = Compression::from_filename(path);
            let base = path
                .strip_suffix(compression.extension())
                .unwrap_or(path)
                .to_string();

            if indices.contains(&base) {
                continue;
            }

            let basename = base.rsplit('/').next().unwrap_or(&base);
            match basename {
                "Packages" => {}
                "Sources" if self.options.toggles.source => {}
                _ => continue,
            }

            indices.push(base);
        }

        indices.sort();
        indices
    }

    async fn process_index(
        &self,
        store: &TrustedStore,
        local: &str,
        index_path: &str,
        manifest: &ReleaseManifest,
        url_infix: &str,
    ) -> Result<Vec<TrustedFile>> {
        let is_source = index_path.rsplit('/').next() == Some("Sources");

        let uncompressed = manifest.entry(index_path)?;

        // Smallest declared variant wins: best compression available.
        let (variant_path, variant) = manifest
            .files
            .iter()
            .filter(|(path, _)| path.starts_with(index_path))
            .min_by_key(|(_, entry)| entry.size)
            .map(|(path, entry)| (path.clone(), entry.clone()))
            .ok_or_else(|| DebmillError::ReleaseFileEntryMissing {
                file: index_path.to_string(),
            })?;

        let url = join_url(
            &self.options.download_url,
            &format!("{}/{}", url_infix, variant_path),
        )?;

        let index_rel = Path::new(local).join(index_path);

        let uncompressed_path = if variant_path == index_path {
            store
                .download_or_reuse(&uncompressed.sha256, url, &index_rel)
                .await?
        } else {
            let compression = Compression::from_filename(&variant_path);
            store
                .download_or_reuse_compressed(
                    &uncompressed.sha256,
                    &variant.sha256,
                    url,
                    compression,
                    &index_rel,
                )
                .await?
        };

        let packages = parse_package_index(&uncompressed_path, is_source)?;

        self.download_package_files(store, local, packages, manifest.is_signed())
            .await
    }

    async fn download_package_files(
        &self,
        store: &TrustedStore,
        distribution: &str,
        packages: Vec<Package>,
        release_signed: bool,
    ) -> Result<Vec<TrustedFile>> {
        let collector = RetentionCollector::new(self.options.retention.clone(), |p: &Package| {
            ItemMetadata {
                source: p.source_name().to_string(),
                package: p.name().to_string(),
                architecture: p.architecture().to_string(),
                version: p.version_str().to_string(),
            }
        });

        for package in packages {
            if !matches_glob_patterns(&self.options.sources, package.source_name()) {
                continue;
            }
            if !matches_glob_patterns(&self.options.packages, package.name()) {
                continue;
            }

            let component = if package.is_debug() {
                DEBUG_COMPONENT
            } else {
                MAIN_COMPONENT
            };

            collector.add(distribution, component, package)?;
        }

        // Every file of every retained package, with its trusted-store
        // registration and the relative path it downloads from.
        let mut pending: Vec<(TrustedFile, String)> = vec![];

        for package in collector.kept()? {
            let source_name = package.source_name().to_string();

            for file in package.files()? {
                let download_rel = match &package {
                    Package::Binary(binary) => binary.filename()?.to_string(),
                    Package::Source(source) => {
                        format!("{}/{}", source.directory()?, file.filename)
                    }
                };

                if file.checksums.sha256.is_empty() {
                    return Err(DebmillError::Other(format!(
                        "index entry for {} lacks a SHA256 digest",
                        download_rel
                    )));
                }

                pending.push((
                    TrustedFile {
                        path: store.cache_path(&download_rel),
                        distribution: distribution.to_string(),
                        sha256: file.checksums.sha256.clone(),
                        source: source_name.clone(),
                        redirect: Some(download_rel.clone()),
                    },
                    download_rel,
                ));
            }
        }

        let mut downloads = futures::stream::iter(pending.iter().map(
            |(file, download_rel)| -> BoxFuture<'_, Result<()>> {
                let sha256 = file.sha256.clone();
                Box::pin(async move {
                    let url = join_url(&self.options.download_url, download_rel)?;
                    let path = store.download_or_reuse(&sha256, url, download_rel).await?;

                    if download_rel.ends_with(".dsc") && self.options.toggles.source {
                        self.verify_dsc_file(&path, download_rel, release_signed)?;
                    }

                    Ok::<_, DebmillError>(())
                })
            },
        ))
        .buffer_unordered(SUBGROUP_WIDTH);

        while let Some(result) = downloads.next().await {
            result?;
        }
        drop(downloads);

        Ok(pending.into_iter().map(|(file, _)| file).collect())
    }

    /// Re-verify a downloaded `.dsc`. On a signature-only failure, retry
    /// accepting unsigned input, but only when the enclosing `Release` was
    /// itself signed; the content digest was already enforced during
    /// download.
    fn verify_dsc_file(&self, path: &Path, name: &str, release_signed: bool) -> Result<()> {
        let data =
            std::fs::read(path).map_err(|e| DebmillError::IoPath(path.display().to_string(), e))?;

        match self.verifier.verify_and_clear(name, &data) {
            Ok(_) => Ok(()),
            Err(err) if err.is_signature_error() && release_signed => {
                self.verifier
                    .accepting_unsigned()
                    .verify_and_clear(name, &data)?;

                warn!(file = name, "accepting unsigned .dsc file since Release is signed");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl Feed for AptFeed {
    async fn run(&self, store: &TrustedStore) -> Result<()> {
        let mut distributions = futures::stream::iter(self.options.distributions.iter().map(
            |map| -> BoxFuture<'_, Result<()>> { Box::pin(self.process_distribution(store, map)) },
        ))
        .buffer_unordered(SUBGROUP_WIDTH);

        while let Some(result) = distributions.next().await {
            result?;
        }

        Ok(())
    }
}

/// Parse a `Packages` or `Sources` index file into packages.
pub fn parse_package_index(path: &Path, is_source: bool) -> Result<Vec<Package>> {
    let fh = std::fs::File::open(path)
        .map_err(|e| DebmillError::IoPath(path.display().to_string(), e))?;

    ControlParagraphReader::new(std::io::BufReader::new(fh))
        .map(|paragraph| {
            let paragraph = paragraph?;
            Ok(if is_source {
                Package::Source(SourcePackage::from_paragraph(paragraph)?)
            } else {
                Package::Binary(BinaryPackage::from_paragraph(paragraph)?)
            })
        })
        .collect()
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{
            download::Downloader,
            runtime::{Runtime, RuntimeOptions},
        },
        sha2::Digest,
        std::{collections::HashMap, sync::Arc},
        tokio::io::{AsyncReadExt, AsyncWriteExt},
        url::Url,
    };

    fn sha256_of(data: &[u8]) -> String {
        let mut hasher = sha2::Sha256::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }

    /// Minimal HTTP server over a static route table.
    async fn spawn_server(routes: HashMap<String, Vec<u8>>) -> Url {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let routes = Arc::new(routes);

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let routes = routes.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    let count = socket.read(&mut buf).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buf[..count]).to_string();
                    let path = request
                        .split_whitespace()
                        .nth(1)
                        .unwrap_or_default()
                        .to_string();

                    let response = match routes.get(&path) {
                        Some(body) => {
                            let header = format!(
                                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                                body.len()
                            );
                            let mut response = header.into_bytes();
                            response.extend_from_slice(body);
                            response
                        }
                        None => b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                            .to_vec(),
                    };

                    let _ = socket.write_all(&response).await;
                });
            }
        });

        Url::parse(&format!("http://{}/repo", addr)).unwrap()
    }

    const DEB_BODY: &[u8] = b"not a real deb, content is opaque to the feed";

    fn packages_index(deb_sha: &str) -> String {
        // A long repetitive description keeps the gzip variant reliably
        // smaller than the plain index in the variant-selection test.
        format!(
            "Package: vips\n\
             Version: 8.17.3-1\n\
             Architecture: amd64\n\
             Filename: pool/main/v/vips/vips_8.17.3-1_amd64.deb\n\
             Size: {}\n\
             SHA256: {}\n\
             Description: {}\n",
            DEB_BODY.len(),
            deb_sha,
            "image processing library ".repeat(50).trim_end()
        )
    }

    fn inrelease(files: &[(&str, &[u8])]) -> String {
        let mut lines = String::new();
        for (path, body) in files {
            lines.push_str(&format!(
                " {} {:>8} {}\n",
                sha256_of(body),
                body.len(),
                path
            ));
        }

        format!(
            "Origin: example\n\
             Label: example\n\
             Suite: stable\n\
             Codename: stable\n\
             Date: Sat, 09 Oct 2021 09:34:56 UTC\n\
             Architectures: amd64\n\
             Components: main\n\
             Description: test repository\n\
             SHA256:\n{}",
            lines
        )
    }

    fn feed_options(url: &Url, distributions: &[&str]) -> FeedOptions {
        let mut options: FeedOptions =
            serde_yaml::from_str(&format!("apt: {}", url)).unwrap();
        options.distributions = distributions
            .iter()
            .map(|name| DistributionMap {
                feed: name.to_string(),
                target: name.to_string(),
            })
            .collect();
        options
    }

    fn test_store(dir: &Path) -> TrustedStore {
        let runtime = Runtime::new(&RuntimeOptions::default()).unwrap();
        TrustedStore::new(
            Downloader::new(runtime),
            dir.join("downloads"),
            dir.join("trusted"),
        )
    }

    fn accepting_verifier() -> SignatureVerifier {
        let mut verifier = SignatureVerifier::new(vec![]);
        verifier.accept_unsigned = true;
        verifier
    }

    #[tokio::test]
    async fn flat_repository_fetch_promotes_debs() -> Result<()> {
        let deb_sha = sha256_of(DEB_BODY);
        let packages = packages_index(&deb_sha);
        let release = inrelease(&[("Packages", packages.as_bytes())]);

        let mut routes = HashMap::new();
        routes.insert("/repo/InRelease".to_string(), release.into_bytes());
        routes.insert("/repo/Packages".to_string(), packages.into_bytes());
        routes.insert(
            "/repo/pool/main/v/vips/vips_8.17.3-1_amd64.deb".to_string(),
            DEB_BODY.to_vec(),
        );

        let base = spawn_server(routes).await;
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());

        let feed = AptFeed::new(feed_options(&base, &["/"]), accepting_verifier());
        feed.run(&store).await?;

        // Flat repositories store under `.` locally.
        let promoted = store.trusted_path("./vips/vips_8.17.3-1_amd64.deb");
        assert_eq!(std::fs::read(&promoted).unwrap(), DEB_BODY);

        // The redirect suffix is the path relative to the feed base URL.
        let redirects = store.load_redirect_map()?;
        assert_eq!(
            redirects
                .get("./vips/vips_8.17.3-1_amd64.deb")
                .map(String::as_str),
            Some("pool/main/v/vips/vips_8.17.3-1_amd64.deb")
        );

        Ok(())
    }

    #[tokio::test]
    async fn standard_distribution_selects_smallest_variant() -> Result<()> {
        use std::io::Write as _;

        let deb_sha = sha256_of(DEB_BODY);
        let packages = packages_index(&deb_sha);

        let mut encoder = libflate::gzip::Encoder::new(vec![]).unwrap();
        encoder.write_all(packages.as_bytes()).unwrap();
        let packages_gz = encoder.finish().into_result().unwrap();

        let release = inrelease(&[
            ("main/binary-amd64/Packages", packages.as_bytes()),
            ("main/binary-amd64/Packages.gz", &packages_gz),
        ]);

        let mut routes = HashMap::new();
        routes.insert("/repo/dists/noble/InRelease".to_string(), release.into_bytes());
        // Only the compressed variant is served; fetching the uncompressed
        // path would 404.
        routes.insert(
            "/repo/dists/noble/main/binary-amd64/Packages.gz".to_string(),
            packages_gz,
        );
        routes.insert(
            "/repo/pool/main/v/vips/vips_8.17.3-1_amd64.deb".to_string(),
            DEB_BODY.to_vec(),
        );

        let base = spawn_server(routes).await;
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());

        let feed = AptFeed::new(feed_options(&base, &["noble"]), accepting_verifier());
        feed.run(&store).await?;

        assert!(store
            .trusted_path("noble/vips/vips_8.17.3-1_amd64.deb")
            .exists());

        Ok(())
    }

    #[tokio::test]
    async fn retention_limits_downloaded_versions() -> Result<()> {
        let old_body: &[u8] = b"old deb content";
        let new_sha = sha256_of(DEB_BODY);
        let old_sha = sha256_of(old_body);

        let packages = format!(
            "Package: vips\nVersion: 8.17.3-1\nArchitecture: amd64\n\
             Filename: pool/vips_8.17.3-1_amd64.deb\nSize: {}\nSHA256: {}\n\n\
             Package: vips\nVersion: 8.16.0-1\nArchitecture: amd64\n\
             Filename: pool/vips_8.16.0-1_amd64.deb\nSize: {}\nSHA256: {}\n",
            DEB_BODY.len(),
            new_sha,
            old_body.len(),
            old_sha
        );
        let release = inrelease(&[("Packages", packages.as_bytes())]);

        let mut routes = HashMap::new();
        routes.insert("/repo/InRelease".to_string(), release.into_bytes());
        routes.insert("/repo/Packages".to_string(), packages.into_bytes());
        routes.insert("/repo/pool/vips_8.17.3-1_amd64.deb".to_string(), DEB_BODY.to_vec());
        routes.insert("/repo/pool/vips_8.16.0-1_amd64.deb".to_string(), old_body.to_vec());

        let base = spawn_server(routes).await;
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());

        let mut options = feed_options(&base, &["/"]);
        options.retention = vec![crate::retention::RetentionPolicy {
            rule: crate::retention::RetentionRule {
                pattern: "*.#.*-*".to_string(),
                amount: vec![1],
            },
            from_sources: vec![],
        }];

        let feed = AptFeed::new(options, accepting_verifier());
        feed.run(&store).await?;

        assert!(store.trusted_path("./vips/vips_8.17.3-1_amd64.deb").exists());
        assert!(!store.trusted_path("./vips/vips_8.16.0-1_amd64.deb").exists());

        Ok(())
    }

    #[test]
    fn unsigned_dsc_fallback_requires_signed_release() {
        let url = Url::parse("https://example.com/repo").unwrap();
        let mut options = feed_options(&url, &["/"]);
        options.toggles.source = true;

        // Strict verifier: an unsigned .dsc fails primary verification.
        let feed = AptFeed::new(options, SignatureVerifier::new(vec![]));

        let dir = tempfile::tempdir().unwrap();
        let dsc = dir.path().join("vips_8.17.3-1.dsc");
        std::fs::write(&dsc, b"Format: 3.0 (quilt)\nSource: vips\nVersion: 8.17.3-1\n").unwrap();

        // With a signed Release the fallback accepts the unsigned file.
        feed.verify_dsc_file(&dsc, "vips_8.17.3-1.dsc", true).unwrap();

        // Without one, the signature error propagates.
        let err = feed
            .verify_dsc_file(&dsc, "vips_8.17.3-1.dsc", false)
            .unwrap_err();
        assert!(matches!(err, DebmillError::SignatureMissing(_)));
    }

    #[test]
    fn base_index_discovery_dedups_and_gates_sources() {
        let release = inrelease(&[
            ("main/binary-amd64/Packages", b"x"),
            ("main/binary-amd64/Packages.gz", b"y"),
            ("main/source/Sources", b"z"),
            ("main/binary-amd64/Release", b"w"),
        ]);

        let manifest = ReleaseManifest::parse(
            "InRelease",
            release.as_bytes(),
            &accepting_verifier(),
        )
        .unwrap();

        let url = Url::parse("https://example.com/repo").unwrap();

        let feed = AptFeed::new(feed_options(&url, &["/"]), accepting_verifier());
        assert_eq!(
            feed.unique_base_indices(&manifest),
            vec!["main/binary-amd64/Packages"]
        );

        let mut options = feed_options(&url, &["/"]);
        options.toggles.source = true;
        let feed = AptFeed::new(options, accepting_verifier());
        assert_eq!(
            feed.unique_base_indices(&manifest),
            vec!["main/binary-amd64/Packages", "main/source/Sources"]
        );
    }
}
