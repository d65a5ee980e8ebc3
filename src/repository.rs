// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The in-memory output repository model.

Packages are organized `distribution -> component -> package list`, with an
auxiliary *latest* index tracking the highest version per package name,
distribution, and architecture. The latest index is strictly monotonic under
Debian ordering, so insertion order never affects the result.
*/

use {
    crate::{
        error::{DebmillError, Result},
        package::{Package, ALL_ARCHITECTURE, SOURCE_ARCHITECTURE},
        package_version::compare_versions,
    },
    std::collections::BTreeMap,
};

/// Packages of one distribution + component, keyed by
/// `(name, architecture, version)`.
#[derive(Debug, Default)]
pub struct PackageList {
    packages: BTreeMap<(String, String, String), Package>,
}

impl PackageList {
    /// Add a package. Re-adding an identical entry is a no-op; a different
    /// package under an existing identity is a conflict.
    pub fn add(&mut self, package: Package) -> Result<()> {
        let key = (
            package.name().to_string(),
            package.architecture().to_string(),
            package.version_str().to_string(),
        );

        if let Some(existing) = self.packages.get(&key) {
            if existing == &package {
                return Ok(());
            }
            return Err(DebmillError::Other(format!(
                "conflicting package content for {} {} {}",
                key.0, key.1, key.2
            )));
        }

        self.packages.insert(key, package);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Package> {
        self.packages.values()
    }

    /// Distinct architectures present, sorted. The `all` pseudo-architecture
    /// is always excluded; `source` only appears when `include_source` is set.
    pub fn architectures(&self, include_source: bool) -> Vec<String> {
        let mut architectures = self
            .packages
            .values()
            .map(|p| p.architecture())
            .filter(|arch| *arch != ALL_ARCHITECTURE)
            .filter(|arch| include_source || *arch != SOURCE_ARCHITECTURE)
            .map(|arch| arch.to_string())
            .collect::<Vec<_>>();

        architectures.sort();
        architectures.dedup();
        architectures
    }

    /// Packages matching an architecture query.
    ///
    /// `all` packages are not replicated into per-architecture lists; instead
    /// they match any binary architecture query. Source packages only match
    /// the `source` query.
    pub fn by_architecture(&self, architecture: &str) -> Vec<&Package> {
        self.packages
            .values()
            .filter(|p| {
                p.architecture() == architecture
                    || (p.architecture() == ALL_ARCHITECTURE
                        && architecture != SOURCE_ARCHITECTURE
                        && architecture != ALL_ARCHITECTURE)
            })
            .collect()
    }

    /// Packages for one architecture in index emission order: name
    /// ascending, then version newest-first.
    pub fn sorted_for_index(&self, architecture: &str) -> Vec<&Package> {
        let mut packages = self.by_architecture(architecture);

        packages.sort_by(|a, b| {
            a.name()
                .cmp(b.name())
                .then_with(|| compare_versions(b.version_str(), a.version_str()))
        });

        packages
    }
}

/// The composed repository: every retained package, indexed two ways.
#[derive(Debug, Default)]
pub struct Repository {
    packages: BTreeMap<String, BTreeMap<String, PackageList>>,
    latest: BTreeMap<String, BTreeMap<String, BTreeMap<String, Package>>>,
}

impl Repository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a package under a distribution and component. An empty component
    /// defaults to `main`.
    pub fn add_package(
        &mut self,
        package: Package,
        distribution: &str,
        component: &str,
    ) -> Result<()> {
        let component = if component.is_empty() {
            "main"
        } else {
            component
        };

        self.update_latest(&package, distribution);

        self.packages
            .entry(distribution.to_string())
            .or_default()
            .entry(component.to_string())
            .or_default()
            .add(package)
    }

    fn update_latest(&mut self, package: &Package, distribution: &str) {
        let slot = self
            .latest
            .entry(package.name().to_string())
            .or_default()
            .entry(distribution.to_string())
            .or_default()
            .entry(package.architecture().to_string());

        match slot {
            std::collections::btree_map::Entry::Occupied(mut entry) => {
                // Strictly monotonic: replace only on a greater version.
                if compare_versions(package.version_str(), entry.get().version_str())
                    == std::cmp::Ordering::Greater
                {
                    entry.insert(package.clone());
                }
            }
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(package.clone());
            }
        }
    }

    /// Sorted distribution names.
    pub fn distributions(&self) -> Vec<&str> {
        self.packages.keys().map(String::as_str).collect()
    }

    /// Sorted component names of a distribution.
    pub fn components(&self, distribution: &str) -> Vec<&str> {
        self.packages
            .get(distribution)
            .map(|components| components.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// The package list of a distribution + component, if any.
    pub fn package_list(&self, distribution: &str, component: &str) -> Option<&PackageList> {
        self.packages.get(distribution)?.get(component)
    }

    /// Architectures of a distribution + component (see
    /// [PackageList::architectures]).
    pub fn architectures(
        &self,
        distribution: &str,
        component: &str,
        include_source: bool,
    ) -> Vec<String> {
        self.package_list(distribution, component)
            .map(|list| list.architectures(include_source))
            .unwrap_or_default()
    }

    /// The highest-version package for a name, distribution, and
    /// architecture. Non-source queries fall back to the `all` architecture
    /// when no architecture-specific entry exists.
    pub fn latest(&self, name: &str, distribution: &str, architecture: &str) -> Option<&Package> {
        let by_arch = self.latest.get(name)?.get(distribution)?;

        if let Some(package) = by_arch.get(architecture) {
            return Some(package);
        }

        if architecture != SOURCE_ARCHITECTURE {
            return by_arch.get(ALL_ARCHITECTURE);
        }

        None
    }

    /// Sorted distinct package names present in a component across all
    /// distributions.
    pub fn package_names(&self, component: &str) -> Vec<String> {
        let mut names = self
            .packages
            .values()
            .filter_map(|components| components.get(component))
            .flat_map(|list| list.iter().map(|p| p.name().to_string()))
            .collect::<Vec<_>>();

        names.sort();
        names.dedup();
        names
    }

    /// Total package count across the repository.
    pub fn num_packages(&self) -> usize {
        self.packages
            .values()
            .flat_map(|components| components.values())
            .map(|list| list.len())
            .sum()
    }
}
