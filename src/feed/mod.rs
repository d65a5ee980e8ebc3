// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Upstream feed descriptions and expansion.

A *feed* is one upstream package source: a code-hosting release page, an APT
repository, or a build-service project. Feed options are resolved from
configuration into a uniform shape; build-service feeds and APT feeds with
prefixed distributions are *expanded* into independent sub-feeds before
running, so every adapter only ever sees plain distributions.
*/

use {
    crate::{
        config::PackageToggles,
        error::{DebmillError, Result},
        retention::RetentionPolicy,
        store::TrustedStore,
    },
    async_trait::async_trait,
    serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer},
    std::collections::BTreeMap,
    url::Url,
};

pub mod apt;
pub mod github;

/// The kind of upstream a feed talks to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FeedKind {
    /// Code-hosting release pages (`github: owner/repo`).
    Github,
    /// A plain APT repository (`apt: <url>`).
    Apt,
    /// A build-service project (`obs: <project or url>`), expanded into flat
    /// APT sub-feeds.
    BuildService,
}

impl std::fmt::Display for FeedKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Github => "github",
            Self::Apt => "apt",
            Self::BuildService => "obs",
        })
    }
}

/// Release kinds on code-hosting release pages.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ReleaseKind {
    #[serde(rename = "release")]
    Release,
    #[serde(rename = "pre-release")]
    PreRelease,
    #[serde(rename = "draft")]
    Draft,
}

/// A mapping from a feed's distribution name to the target repository
/// distribution name.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DistributionMap {
    /// Distribution name in the feed (`/` for flat repositories,
    /// `prefix/dist` for prefixed layouts).
    pub feed: String,

    /// Distribution name in the composed repository.
    pub target: String,
}

impl<'de> Deserialize<'de> for DistributionMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Shape {
            Scalar(String),
            Map(BTreeMap<String, String>),
        }

        match Shape::deserialize(deserializer)? {
            Shape::Scalar(name) => Ok(DistributionMap {
                feed: name.clone(),
                target: name,
            }),
            Shape::Map(map) => {
                if map.len() != 1 {
                    return Err(D::Error::custom(
                        "distribution mapping must have exactly one key-value pair",
                    ));
                }
                let (feed, target) = map.into_iter().next().expect("length checked");
                Ok(DistributionMap { feed, target })
            }
        }
    }
}

impl Serialize for DistributionMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if self.feed == self.target {
            serializer.serialize_str(&self.feed)
        } else {
            let mut map = BTreeMap::new();
            map.insert(&self.feed, &self.target);
            map.serialize(serializer)
        }
    }
}

/// Fully resolved configuration for one feed.
///
/// Repository-level settings (architectures, retention, package toggles) are
/// inherited into each feed during configuration resolution.
#[derive(Clone, Debug)]
pub struct FeedOptions {
    pub kind: FeedKind,

    /// Identifies the feed: `owner/repo`, the APT URL without scheme, or the
    /// build-service project identifier.
    pub name: String,

    /// Base URL downloads resolve against.
    pub download_url: Url,

    /// Path prefix under the trusted store (the feed's scope). Path-safe: no
    /// scheme, port, query, or fragment.
    pub scope: String,

    /// Release kinds to include (code-hosting feeds). Empty means regular
    /// releases only.
    pub releases: Vec<ReleaseKind>,

    /// Tag name globs (code-hosting feeds).
    pub tags: Vec<String>,

    pub distributions: Vec<DistributionMap>,

    /// Source package name globs.
    pub sources: Vec<String>,

    /// Package name globs.
    pub packages: Vec<String>,

    /// Inherited from the repository document.
    pub architectures: Vec<String>,
    pub retention: Vec<RetentionPolicy>,
    pub toggles: PackageToggles,
}

#[derive(Deserialize)]
struct FeedOptionsShape {
    github: Option<String>,
    apt: Option<String>,
    obs: Option<String>,
    #[serde(default)]
    releases: Vec<ReleaseKind>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    distributions: Vec<DistributionMap>,
    #[serde(default)]
    sources: Vec<String>,
    #[serde(default)]
    packages: Vec<String>,
}

fn parse_feed_url(kind: &str, value: &str) -> Result<Url> {
    let url = Url::parse(value)
        .map_err(|e| DebmillError::ConfigInvalid(format!("{} URL {:?}: {}", kind, value, e)))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(DebmillError::ConfigInvalid(format!(
            "{} URL scheme must be http or https: {}",
            kind, value
        )));
    }

    if url.port().is_some() || url.query().is_some() || url.fragment().is_some() {
        return Err(DebmillError::ConfigInvalid(format!(
            "{} URL must not carry a port, query, or fragment: {}",
            kind, value
        )));
    }

    Ok(url)
}

/// Derive the path-safe storage scope from a feed URL: host plus path.
fn url_scope(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    format!("{}{}", host, url.path().trim_end_matches('/'))
}

impl TryFrom<FeedOptionsShape> for FeedOptions {
    type Error = DebmillError;

    fn try_from(shape: FeedOptionsShape) -> Result<Self> {
        let locators = [
            shape.github.is_some(),
            shape.apt.is_some(),
            shape.obs.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();

        if locators != 1 {
            return Err(DebmillError::ConfigInvalid(
                "feed must specify exactly one of: github, apt, obs".to_string(),
            ));
        }

        let (kind, name, download_url, scope) = if let Some(github) = shape.github {
            let mut parts = github.splitn(2, '/');
            let (owner, repo) = match (parts.next(), parts.next()) {
                (Some(owner), Some(repo)) if !owner.is_empty() && !repo.is_empty() => {
                    (owner, repo)
                }
                _ => {
                    return Err(DebmillError::ConfigInvalid(format!(
                        "github feed must be in 'owner/repo' format, got: {}",
                        github
                    )))
                }
            };

            let download_url = Url::parse(&format!(
                "https://github.com/{}/{}/releases/download",
                owner, repo
            ))?;

            (
                FeedKind::Github,
                github.clone(),
                download_url,
                format!("github/{}", github),
            )
        } else if let Some(apt) = shape.apt {
            let url = parse_feed_url("apt", &apt)?;
            let scope = url_scope(&url);
            (FeedKind::Apt, scope.clone(), url, scope)
        } else if let Some(obs) = shape.obs {
            if obs.contains('.') {
                // A domain means a custom build-service instance, given as a
                // full download URL.
                let url = parse_feed_url("obs", &obs)?;
                let scope = url_scope(&url);
                (FeedKind::BuildService, scope.clone(), url, scope)
            } else {
                // Project identifier form `home:user:project`; the public
                // download mirror separates segments with `:/`.
                let download_path = obs.replace(':', ":/");
                let url = Url::parse(&format!(
                    "https://download.opensuse.org/repositories/{}",
                    download_path
                ))?;

                (
                    FeedKind::BuildService,
                    obs,
                    url,
                    format!("download.opensuse.org/repositories/{}", download_path),
                )
            }
        } else {
            unreachable!("locator count validated above");
        };

        Ok(FeedOptions {
            kind,
            name,
            download_url,
            scope,
            releases: shape.releases,
            tags: shape.tags,
            distributions: shape.distributions,
            sources: shape.sources,
            packages: shape.packages,
            architectures: vec![],
            retention: vec![],
            toggles: PackageToggles::default(),
        })
    }
}

impl<'de> Deserialize<'de> for FeedOptions {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        FeedOptionsShape::deserialize(deserializer)?
            .try_into()
            .map_err(D::Error::custom)
    }
}

/// Join a relative path onto a URL, treating the URL's path as a directory.
pub fn join_url(base: &Url, path: &str) -> Result<Url> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        base.set_path(&format!("{}/", base.path()));
    }

    Ok(base.join(path.trim_start_matches('/'))?)
}

/// Expand an APT feed into one sub-feed per distribution prefix.
///
/// A distribution entry `prefix/dist` turns into a sub-feed whose download
/// URL and scope gain the prefix segment and whose inner distribution is
/// `dist` (or `/` when the remainder is empty, i.e. a flat repository under
/// the prefix). Entries without a prefix stay on the base feed. An empty
/// target maps to the inner distribution name.
pub fn expand_apt_feed(options: &FeedOptions) -> Result<Vec<FeedOptions>> {
    // Without configured distributions the feed passes through unchanged;
    // the composer discovers distributions from the trusted store.
    if options.distributions.is_empty() {
        let mut expanded = options.clone();
        expanded.kind = FeedKind::Apt;
        return Ok(vec![expanded]);
    }

    // Prefix -> inner distributions, preserving first-seen prefix order.
    let mut order: Vec<Option<String>> = vec![];
    let mut groups: BTreeMap<Option<String>, Vec<DistributionMap>> = BTreeMap::new();

    for map in &options.distributions {
        let (prefix, inner) = if map.feed == "/" || !map.feed.contains('/') {
            (None, map.clone())
        } else {
            let (prefix, rest) = map.feed.split_once('/').expect("contains '/' checked");

            let feed = if rest.is_empty() {
                "/".to_string()
            } else {
                rest.to_string()
            };

            let target = if map.target.is_empty() {
                if rest.is_empty() {
                    prefix.to_string()
                } else {
                    rest.to_string()
                }
            } else {
                map.target.clone()
            };

            (Some(prefix.to_string()), DistributionMap { feed, target })
        };

        if !groups.contains_key(&prefix) {
            order.push(prefix.clone());
        }
        groups.entry(prefix).or_default().push(inner);
    }

    order
        .into_iter()
        .map(|prefix| {
            let distributions = groups.remove(&prefix).expect("group recorded");

            let mut expanded = options.clone();
            expanded.kind = FeedKind::Apt;
            expanded.distributions = distributions;

            if let Some(prefix) = prefix {
                expanded.download_url = join_url(&options.download_url, &prefix)?;
                expanded.scope = format!("{}/{}", options.scope, prefix);
            }

            Ok(expanded)
        })
        .collect()
}

/// Expand a build-service feed into flat APT sub-feeds, one per target
/// distribution: each upstream distribution becomes a prefix holding a flat
/// repository mapped onto the configured target name.
pub fn expand_build_service_feed(options: &FeedOptions) -> Result<Vec<FeedOptions>> {
    let mut apt_options = options.clone();
    apt_options.kind = FeedKind::Apt;
    apt_options.distributions = options
        .distributions
        .iter()
        .map(|map| DistributionMap {
            feed: format!("{}/", map.feed),
            target: map.target.clone(),
        })
        .collect();

    expand_apt_feed(&apt_options)
}

/// Expand any feed into the list of adapter-ready sub-feeds.
pub fn expand_feed(options: &FeedOptions) -> Result<Vec<FeedOptions>> {
    match options.kind {
        FeedKind::Github => Ok(vec![options.clone()]),
        FeedKind::Apt => expand_apt_feed(options),
        FeedKind::BuildService => expand_build_service_feed(options),
    }
}

/// Replace every character outside `[A-Za-z0-9._-]` with `.`, the filename
/// normalization applied by the code-hosting provider to uploaded assets.
pub fn normalize_asset_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '.'
            }
        })
        .collect()
}

/// A runnable feed adapter: discover upstream metadata, download referenced
/// files, enforce the chain of trust, and promote verified files into the
/// feed's trusted store scope.
#[async_trait]
pub trait Feed {
    async fn run(&self, store: &TrustedStore) -> Result<()>;
}

#[cfg(test)]
mod test {
    use super::*;

    fn apt_options(url: &str, dists: &[(&str, &str)]) -> FeedOptions {
        let yaml = format!("apt: {}\n", url);
        let mut options: FeedOptions = serde_yaml::from_str(&yaml).unwrap();
        options.distributions = dists
            .iter()
            .map(|(feed, target)| DistributionMap {
                feed: feed.to_string(),
                target: target.to_string(),
            })
            .collect();
        options
    }

    #[test]
    fn distribution_map_scalar_and_map_forms() {
        let scalar: DistributionMap = serde_yaml::from_str("noble").unwrap();
        assert_eq!(scalar.feed, "noble");
        assert_eq!(scalar.target, "noble");

        let mapped: DistributionMap = serde_yaml::from_str("{focal: stable}").unwrap();
        assert_eq!(mapped.feed, "focal");
        assert_eq!(mapped.target, "stable");
    }

    #[test]
    fn feed_requires_exactly_one_locator() {
        assert!(serde_yaml::from_str::<FeedOptions>("tags: [v1]").is_err());
        assert!(
            serde_yaml::from_str::<FeedOptions>("github: a/b\napt: https://example.com").is_err()
        );
    }

    #[test]
    fn github_feed_shape() {
        let options: FeedOptions = serde_yaml::from_str("github: immich-app/immich").unwrap();

        assert_eq!(options.kind, FeedKind::Github);
        assert_eq!(options.name, "immich-app/immich");
        assert_eq!(options.scope, "github/immich-app/immich");
        assert_eq!(
            options.download_url.as_str(),
            "https://github.com/immich-app/immich/releases/download"
        );
    }

    #[test]
    fn apt_feed_scope_is_host_plus_path() {
        let options: FeedOptions =
            serde_yaml::from_str("apt: https://deb.debian.org/debian").unwrap();

        assert_eq!(options.kind, FeedKind::Apt);
        assert_eq!(options.scope, "deb.debian.org/debian");
        assert_eq!(options.name, "deb.debian.org/debian");
    }

    #[test]
    fn feed_urls_must_be_path_safe() {
        assert!(serde_yaml::from_str::<FeedOptions>("apt: ftp://example.com/x").is_err());
        assert!(serde_yaml::from_str::<FeedOptions>("apt: https://example.com:8080/x").is_err());
        assert!(serde_yaml::from_str::<FeedOptions>("apt: https://example.com/x?y=1").is_err());
    }

    #[test]
    fn build_service_identifier_expands_to_download_mirror() {
        let options: FeedOptions = serde_yaml::from_str("obs: home:dionysius:immich").unwrap();

        assert_eq!(options.kind, FeedKind::BuildService);
        assert_eq!(
            options.download_url.as_str(),
            "https://download.opensuse.org/repositories/home:/dionysius:/immich"
        );
        assert_eq!(
            options.scope,
            "download.opensuse.org/repositories/home:/dionysius:/immich"
        );
    }

    #[test]
    fn apt_expansion_passthrough_without_prefix() -> Result<()> {
        let options = apt_options("https://deb.debian.org/debian", &[("bookworm", "stable")]);
        let expanded = expand_apt_feed(&options)?;

        assert_eq!(expanded.len(), 1);
        assert_eq!(
            expanded[0].download_url.as_str(),
            "https://deb.debian.org/debian"
        );
        assert_eq!(expanded[0].scope, "deb.debian.org/debian");
        assert_eq!(expanded[0].distributions[0].feed, "bookworm");
        assert_eq!(expanded[0].distributions[0].target, "stable");

        Ok(())
    }

    #[test]
    fn apt_expansion_extracts_prefixes() -> Result<()> {
        let options = apt_options(
            "https://deb.debian.org/debian",
            &[
                ("debian/trixie", "trixie"),
                ("ubuntu/noble", "noble"),
                ("bookworm", "stable"),
            ],
        );
        let expanded = expand_apt_feed(&options)?;

        assert_eq!(expanded.len(), 3);

        assert_eq!(
            expanded[0].download_url.as_str(),
            "https://deb.debian.org/debian/debian"
        );
        assert_eq!(expanded[0].scope, "deb.debian.org/debian/debian");
        assert_eq!(expanded[0].distributions[0].feed, "trixie");

        assert_eq!(
            expanded[1].download_url.as_str(),
            "https://deb.debian.org/debian/ubuntu"
        );
        assert_eq!(expanded[1].distributions[0].feed, "noble");

        assert_eq!(
            expanded[2].download_url.as_str(),
            "https://deb.debian.org/debian"
        );
        assert_eq!(expanded[2].distributions[0].feed, "bookworm");

        Ok(())
    }

    #[test]
    fn apt_expansion_empty_target_maps_to_distribution_name() -> Result<()> {
        let options = apt_options("https://deb.debian.org/debian", &[("debian/trixie", "")]);
        let expanded = expand_apt_feed(&options)?;

        assert_eq!(expanded[0].distributions[0].feed, "trixie");
        assert_eq!(expanded[0].distributions[0].target, "trixie");

        Ok(())
    }

    #[test]
    fn flat_repository_entry_is_unchanged() -> Result<()> {
        let options = apt_options("https://example.com/repo", &[("/", "stable")]);
        let expanded = expand_apt_feed(&options)?;

        assert_eq!(expanded.len(), 1);
        assert_eq!(expanded[0].download_url.as_str(), "https://example.com/repo");
        assert_eq!(expanded[0].distributions[0].feed, "/");

        Ok(())
    }

    #[test]
    fn build_service_expansion_yields_flat_sub_feeds() -> Result<()> {
        let mut options: FeedOptions = serde_yaml::from_str("obs: home:dionysius:immich").unwrap();
        options.distributions = vec![
            DistributionMap {
                feed: "Debian_13".to_string(),
                target: "trixie".to_string(),
            },
            DistributionMap {
                feed: "xUbuntu_24.04".to_string(),
                target: "noble".to_string(),
            },
        ];

        let expanded = expand_build_service_feed(&options)?;
        assert_eq!(expanded.len(), 2);

        assert_eq!(expanded[0].kind, FeedKind::Apt);
        assert_eq!(
            expanded[0].download_url.as_str(),
            "https://download.opensuse.org/repositories/home:/dionysius:/immich/Debian_13"
        );
        assert_eq!(expanded[0].distributions[0].feed, "/");
        assert_eq!(expanded[0].distributions[0].target, "trixie");

        assert_eq!(
            expanded[1].download_url.as_str(),
            "https://download.opensuse.org/repositories/home:/dionysius:/immich/xUbuntu_24.04"
        );
        assert_eq!(expanded[1].distributions[0].target, "noble");

        Ok(())
    }

    #[test]
    fn asset_filename_normalization() {
        assert_eq!(
            normalize_asset_filename("immich_2.4.1-0alpha3~noble.dsc"),
            "immich_2.4.1-0alpha3.noble.dsc"
        );
        assert_eq!(
            normalize_asset_filename("vips_8.17.3-1_amd64.deb"),
            "vips_8.17.3-1_amd64.deb"
        );
        assert_eq!(normalize_asset_filename("a b+c"), "a.b.c");
    }

    #[test]
    fn join_url_treats_base_as_directory() -> Result<()> {
        let base = Url::parse("https://example.com/repo").unwrap();
        assert_eq!(
            join_url(&base, "dists/noble/InRelease")?.as_str(),
            "https://example.com/repo/dists/noble/InRelease"
        );
        Ok(())
    }
}
