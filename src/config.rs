// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Configuration loading and validation.

One `config.yaml` holds process-level settings; each repository is its own
document under the repositories directory (`<name>.yaml`, the file stem
becoming the repository name). Repository-level settings are inherited into
every feed during resolution so adapters are self-contained.
*/

use {
    crate::{
        error::{DebmillError, Result},
        feed::{FeedOptions, FeedKind, ReleaseKind},
        retention::RetentionPolicy,
    },
    serde::{Deserialize, Serialize},
    std::path::{Path, PathBuf},
};

/// Which package classes a repository carries.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct PackageToggles {
    /// The primary package, used for presentation-level sorting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<String>,

    /// Include debug packages (the `debug` component).
    #[serde(default)]
    pub debug: bool,

    /// Include source packages.
    #[serde(default)]
    pub source: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DirectoriesConfig {
    #[serde(default)]
    pub root: String,
    #[serde(default)]
    pub repositories: String,
    #[serde(default)]
    pub downloads: String,
    #[serde(default)]
    pub trusted: String,
    #[serde(default)]
    pub staging: String,
    #[serde(default)]
    pub public: String,
}

impl DirectoriesConfig {
    fn resolve(&self, value: &str) -> PathBuf {
        let path = Path::new(value);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.root).join(path)
        }
    }

    pub fn downloads_path(&self) -> PathBuf {
        self.resolve(&self.downloads)
    }

    pub fn trusted_path(&self) -> PathBuf {
        self.resolve(&self.trusted)
    }

    pub fn staging_path(&self) -> PathBuf {
        self.resolve(&self.staging)
    }

    pub fn public_path(&self) -> PathBuf {
        self.resolve(&self.public)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct HttpConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,

    /// Request timeout in seconds.
    #[serde(default)]
    pub timeout: u64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct SigningConfig {
    #[serde(default)]
    pub private_key: String,
    #[serde(default)]
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct GithubConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Pool layout of the generated repository.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolMode {
    /// Hardlink package files into `pool/<component>/<prefix>/<source>/`.
    #[default]
    Hierarchical,
    /// Reference upstream URLs through the per-feed redirect maps; no pool
    /// files are produced.
    Redirect,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct GenerateConfig {
    #[serde(default)]
    pub pool_mode: PoolMode,

    /// Staging builds to keep around after a successful swap.
    #[serde(default)]
    pub keep_last: usize,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct WorkersConfig {
    #[serde(default)]
    pub download: usize,
    #[serde(default)]
    pub compression: usize,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct VerificationConfig {
    #[serde(default)]
    pub keyring: String,
    #[serde(default)]
    pub keys: Vec<String>,
}

impl VerificationConfig {
    /// Absolute key file paths, resolved against the configuration directory.
    pub fn key_paths(&self, config_dir: &Path) -> Vec<PathBuf> {
        let resolve = |value: &str| {
            let path = Path::new(value);
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                config_dir.join(path)
            }
        };

        let mut paths = vec![];
        if !self.keyring.is_empty() {
            paths.push(resolve(&self.keyring));
        }
        paths.extend(self.keys.iter().map(|key| resolve(key)));
        paths
    }
}

/// One repository document.
#[derive(Clone, Debug, Deserialize)]
pub struct RepositoryConfig {
    /// Derived from the document's file stem, not the document body.
    #[serde(skip)]
    pub name: String,

    #[serde(default)]
    pub packages: PackageToggles,

    /// Distribution allowlist; empty admits everything the feeds provide.
    #[serde(default)]
    pub distributions: Vec<String>,

    /// Architecture allowlist; empty admits everything.
    #[serde(default)]
    pub architectures: Vec<String>,

    #[serde(default)]
    pub retention: Vec<RetentionPolicy>,

    #[serde(default)]
    pub verification: VerificationConfig,

    pub feeds: Vec<FeedOptions>,
}

impl RepositoryConfig {
    /// Inherit repository-level settings into every feed and apply feed-kind
    /// defaults.
    fn resolve(&mut self) {
        for feed in &mut self.feeds {
            feed.architectures = self.architectures.clone();
            feed.retention = self.retention.clone();
            feed.toggles = self.packages.clone();

            if feed.kind == FeedKind::Github && feed.releases.is_empty() {
                feed.releases = vec![ReleaseKind::Release];
            }
        }
    }
}

/// The complete application configuration.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub directories: DirectoriesConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub signing: SigningConfig,
    #[serde(default)]
    pub github: GithubConfig,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub generate: GenerateConfig,
    #[serde(default)]
    pub workers: WorkersConfig,

    #[serde(skip)]
    pub repositories: Vec<RepositoryConfig>,

    /// Directory containing `config.yaml`, for resolving relative paths.
    #[serde(skip)]
    pub config_dir: PathBuf,
}

impl Config {
    /// Load `config.yaml` and every repository document beside it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .map_err(|e| DebmillError::IoPath(path.display().to_string(), e))?;

        let mut config: Config = serde_yaml::from_slice(&data)?;
        config.config_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        config.apply_defaults();
        config.load_repositories()?;

        Ok(config)
    }

    /// Parse a configuration document without touching the filesystem.
    pub fn from_yaml(data: &[u8], config_dir: impl Into<PathBuf>) -> Result<Self> {
        let mut config: Config = serde_yaml::from_slice(data)?;
        config.config_dir = config_dir.into();
        config.apply_defaults();
        Ok(config)
    }

    fn apply_defaults(&mut self) {
        if self.github.token.is_none() {
            if let Ok(token) = std::env::var("GITHUB_TOKEN") {
                if !token.is_empty() {
                    self.github.token = Some(token);
                }
            }
        }

        let directories = &mut self.directories;
        if directories.root.is_empty() {
            directories.root = "/var/lib/debmill".to_string();
        }
        if directories.repositories.is_empty() {
            directories.repositories = "repos.d".to_string();
        }
        if directories.downloads.is_empty() {
            directories.downloads = "downloads".to_string();
        }
        if directories.trusted.is_empty() {
            directories.trusted = "trusted".to_string();
        }
        if directories.staging.is_empty() {
            directories.staging = "staging".to_string();
        }
        if directories.public.is_empty() {
            directories.public = "public".to_string();
        }

        if self.http.timeout == 0 {
            self.http.timeout = 300;
        }

        if self.workers.download == 0 {
            self.workers.download = 20;
        }
        if self.workers.compression == 0 {
            self.workers.compression = std::thread::available_parallelism()
                .map(|v| v.get())
                .unwrap_or(4);
        }

        if self.generate.keep_last == 0 {
            self.generate.keep_last = 5;
        }
    }

    fn load_repositories(&mut self) -> Result<()> {
        let repos_dir = {
            let configured = Path::new(&self.directories.repositories);
            if configured.is_absolute() {
                configured.to_path_buf()
            } else {
                self.config_dir.join(configured)
            }
        };

        let entries = std::fs::read_dir(&repos_dir)
            .map_err(|e| DebmillError::IoPath(repos_dir.display().to_string(), e))?;

        let mut repositories = vec![];

        let mut paths = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.is_file() && path.extension().map(|ext| ext == "yaml").unwrap_or(false)
            })
            .collect::<Vec<_>>();
        paths.sort();

        for path in paths {
            let name = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or_default()
                .to_string();

            let data = std::fs::read(&path)
                .map_err(|e| DebmillError::IoPath(path.display().to_string(), e))?;

            let mut repository: RepositoryConfig = serde_yaml::from_slice(&data)?;
            repository.name = name;
            repository.resolve();

            repositories.push(repository);
        }

        if repositories.is_empty() {
            return Err(DebmillError::ConfigInvalid(format!(
                "no repository documents found under {}",
                repos_dir.display()
            )));
        }

        self.repositories = repositories;
        Ok(())
    }

    /// Find a repository by name.
    pub fn repository(&self, name: &str) -> Result<&RepositoryConfig> {
        self.repositories
            .iter()
            .find(|repo| repo.name == name)
            .ok_or_else(|| DebmillError::ConfigInvalid(format!("repository not found: {}", name)))
    }
}
