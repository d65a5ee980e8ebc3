// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Application orchestration: the `fetch` and `generate` commands.

This is the glue around the core pipeline. `fetch` expands every configured
feed and runs its adapter against a scoped trusted store. `generate` composes
each repository into a timestamped staging directory, exports the signing
key, and atomically swaps the public symlink on success.
*/

use {
    crate::{
        compose::{ComposeOptions, Composer},
        config::{Config, RepositoryConfig},
        download::Downloader,
        error::{DebmillError, Result},
        feed::{apt::AptFeed, expand_feed, github::{GithubFeed, ReleaseClient}, Feed, FeedKind},
        runtime::{Runtime, RuntimeOptions, SUBGROUP_WIDTH},
        signature::{RepoSigner, SignatureVerifier},
        store::TrustedStore,
    },
    futures::StreamExt,
    std::{path::{Path, PathBuf}, sync::Arc},
    tracing::{info, warn},
};

pub struct App {
    config: Config,
    runtime: Arc<Runtime>,
    downloader: Arc<Downloader>,
    signer: Option<RepoSigner>,
}

impl App {
    pub fn new(config: Config) -> Result<Self> {
        let runtime = Runtime::new(&RuntimeOptions {
            http_timeout: config.http.timeout,
            user_agent: config.http.user_agent.clone(),
            download_workers: config.workers.download,
            compression_workers: config.workers.compression,
        })?;

        let downloader = Downloader::new(runtime.clone());

        let signer = if config.signing.private_key.is_empty() {
            None
        } else {
            let key_path = {
                let configured = Path::new(&config.signing.private_key);
                if configured.is_absolute() {
                    configured.to_path_buf()
                } else {
                    config.config_dir.join(configured)
                }
            };
            let data = std::fs::read(&key_path)
                .map_err(|e| DebmillError::IoPath(key_path.display().to_string(), e))?;

            Some(RepoSigner::from_armored_key(
                &data,
                config.signing.passphrase.clone().unwrap_or_default(),
            )?)
        };

        Ok(Self {
            config,
            runtime,
            downloader,
            signer,
        })
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    fn selected_repositories<'a>(
        &'a self,
        names: &[String],
    ) -> Result<Vec<&'a RepositoryConfig>> {
        if names.is_empty() {
            return Ok(self.config.repositories.iter().collect());
        }

        names
            .iter()
            .map(|name| self.config.repository(name))
            .collect()
    }

    fn repository_verifier(&self, repository: &RepositoryConfig) -> Result<SignatureVerifier> {
        let key_paths = repository.verification.key_paths(&self.config.config_dir);

        let mut keys = vec![];
        for path in &key_paths {
            let data = std::fs::read(path)
                .map_err(|e| DebmillError::IoPath(path.display().to_string(), e))?;
            keys.extend(SignatureVerifier::load_armored_keys(&data)?);
        }

        let mut verifier = SignatureVerifier::new(keys);

        if key_paths.is_empty() {
            // Without configured keys there is nothing to verify against;
            // extract cleartext and rely on the checksum chain.
            verifier.ignore_signatures = true;
            warn!(
                repository = repository.name.as_str(),
                "no verification keys configured; signatures will not be verified"
            );
        }

        Ok(verifier)
    }

    /// Download and verify packages from every configured feed.
    pub async fn fetch(&self, repository_names: &[String]) -> Result<()> {
        let store = TrustedStore::new(
            self.downloader.clone(),
            self.config.directories.downloads_path(),
            self.config.directories.trusted_path(),
        );

        // (feed options, verifier) pairs across all selected repositories.
        let mut work = vec![];

        for repository in self.selected_repositories(repository_names)? {
            let verifier = self.repository_verifier(repository)?;

            for feed in &repository.feeds {
                let feed_label = format!("{}:{}", feed.kind, feed.name);
                info!(
                    repository = repository.name.as_str(),
                    feed = feed_label.as_str(),
                    "fetching"
                );

                for expanded in expand_feed(feed)? {
                    work.push((expanded, verifier.clone()));
                }
            }
        }

        let mut feeds = futures::stream::iter(work.into_iter().map(|(options, verifier)| {
            let store = store.scope(&options.scope);
            async move {
                let name = options.name.clone();

                let adapter: Box<dyn Feed> = match options.kind {
                    FeedKind::Apt => Box::new(AptFeed::new(options, verifier)),
                    FeedKind::Github => Box::new(GithubFeed::new(
                        options,
                        verifier,
                        ReleaseClient::new(self.runtime.clone(), self.config.github.token.clone()),
                    )?),
                    FeedKind::BuildService => {
                        return Err(DebmillError::ConfigInvalid(
                            "build-service feeds must be expanded before running".to_string(),
                        ))
                    }
                };

                adapter
                    .run(&store)
                    .await
                    .map_err(|e| DebmillError::Other(format!("feed {}: {}", name, e)))
            }
        }))
        .buffer_unordered(SUBGROUP_WIDTH);

        while let Some(result) = feeds.next().await {
            result?;
        }

        info!("fetch complete");
        Ok(())
    }

    /// Compose every repository into a fresh staging directory and swap it
    /// live on success.
    pub async fn generate(&self, repository_names: &[String]) -> Result<()> {
        let timestamp = chrono::Utc::now().format("%Y%m%d-%H%M%S").to_string();
        let staging = self.config.directories.staging_path().join(&timestamp);

        std::fs::create_dir_all(&staging)
            .map_err(|e| DebmillError::IoPath(staging.display().to_string(), e))?;

        let result = self.generate_into(repository_names, &staging).await;

        if result.is_err() {
            let _ = std::fs::remove_dir_all(&staging);
            return result;
        }

        self.swap_public_symlink(&staging)?;
        self.cleanup_old_staging()?;

        info!("generate complete");
        Ok(())
    }

    async fn generate_into(&self, repository_names: &[String], staging: &Path) -> Result<()> {
        for repository in self.selected_repositories(repository_names)? {
            info!(repository = repository.name.as_str(), "generating repository");

            let mut feeds = vec![];
            for feed in &repository.feeds {
                feeds.extend(expand_feed(feed)?);
            }

            let options = ComposeOptions {
                target: staging.join(&repository.name),
                name: repository.name.clone(),
                trusted: self.config.directories.trusted_path(),
                pool_mode: self.config.generate.pool_mode,
                feeds,
                toggles: repository.packages.clone(),
                distributions: repository.distributions.clone(),
                architectures: repository.architectures.clone(),
                retention: repository.retention.clone(),
            };

            let signer = match &self.signer {
                Some(_) => Some(self.reload_signer()?),
                None => None,
            };

            let mut composer = Composer::new(options, signer, self.runtime.clone());
            let composed = composer.compose().await?;

            info!(
                repository = repository.name.as_str(),
                distributions = composed.distributions().len(),
                packages = composed.num_packages(),
                "repository generated"
            );
        }

        self.export_signing_key(staging)?;
        Ok(())
    }

    // Signers are stateful; give each repository its own instance.
    fn reload_signer(&self) -> Result<RepoSigner> {
        let key_path = {
            let configured = Path::new(&self.config.signing.private_key);
            if configured.is_absolute() {
                configured.to_path_buf()
            } else {
                self.config.config_dir.join(configured)
            }
        };
        let data = std::fs::read(&key_path)
            .map_err(|e| DebmillError::IoPath(key_path.display().to_string(), e))?;

        RepoSigner::from_armored_key(
            &data,
            self.config.signing.passphrase.clone().unwrap_or_default(),
        )
    }

    fn export_signing_key(&self, staging: &Path) -> Result<()> {
        use pgp::ser::Serialize as _;

        let Some(signer) = &self.signer else {
            return Ok(());
        };

        let public = signer.signed_public_key()?;

        let keys_dir = staging.join("keys");
        std::fs::create_dir_all(&keys_dir)
            .map_err(|e| DebmillError::IoPath(keys_dir.display().to_string(), e))?;

        std::fs::write(
            keys_dir.join("signing-key.asc"),
            public.to_armored_string(None)?,
        )
        .map_err(|e| DebmillError::IoPath(keys_dir.display().to_string(), e))?;

        std::fs::write(keys_dir.join("signing-key.gpg"), public.to_bytes()?)
            .map_err(|e| DebmillError::IoPath(keys_dir.display().to_string(), e))?;

        Ok(())
    }

    /// Atomically point the public symlink at the new staging directory.
    fn swap_public_symlink(&self, staging: &Path) -> Result<()> {
        let public = self.config.directories.public_path();

        let temp = PathBuf::from(format!("{}.symlink", staging.display()));
        std::os::unix::fs::symlink(staging, &temp)
            .map_err(|e| DebmillError::IoPath(temp.display().to_string(), e))?;

        std::fs::rename(&temp, &public).map_err(|e| {
            let _ = std::fs::remove_file(&temp);
            DebmillError::IoPath(public.display().to_string(), e)
        })?;

        Ok(())
    }

    /// Remove staging builds beyond the configured keep count.
    fn cleanup_old_staging(&self) -> Result<()> {
        let keep = self.config.generate.keep_last;
        if keep == 0 {
            return Ok(());
        }

        let base = self.config.directories.staging_path();
        let entries = match std::fs::read_dir(&base) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(DebmillError::IoPath(base.display().to_string(), e)),
        };

        let mut stagings = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.len() == 15 && name.as_bytes().get(8) == Some(&b'-'))
            .collect::<Vec<_>>();

        stagings.sort_by(|a, b| b.cmp(a));

        for name in stagings.into_iter().skip(keep) {
            let path = base.join(&name);
            if let Err(e) = std::fs::remove_dir_all(&path) {
                warn!(path = %path.display(), error = %e, "failed to delete old staging directory");
            }
        }

        Ok(())
    }
}
