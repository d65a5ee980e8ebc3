// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Keyed collection with retention filtering.

The collector fronts the retention engine with a four-level keyspace:
`(distribution, component, package name, architecture)`. Each key owns one
[RetentionFilter] built from the policies applicable to the item's source
package, always with the keep-on-no-match behavior so unexpected version
formats survive.
*/

use {
    crate::{
        error::Result,
        retention::{rules_for_source, NoMatchBehavior, RetentionFilter, RetentionPolicy},
    },
    std::{
        collections::BTreeMap,
        sync::{Arc, Mutex},
    },
};

/// Metadata extracted from a collected item: source package name, package
/// name, architecture, and version.
pub struct ItemMetadata {
    pub source: String,
    pub package: String,
    pub architecture: String,
    pub version: String,
}

type CollectorKey = (String, String, String, String);
type MetadataFn<T> = Arc<dyn Fn(&T) -> ItemMetadata + Send + Sync>;

/// Collects items per `(distribution, component, package, architecture)` and
/// applies retention when materializing. Safe for concurrent use.
pub struct RetentionCollector<T> {
    policies: Vec<RetentionPolicy>,
    metadata_of: MetadataFn<T>,
    filters: Mutex<BTreeMap<CollectorKey, RetentionFilter<T>>>,
}

impl<T: Clone + 'static> RetentionCollector<T> {
    /// Construct a collector over the given retention policies.
    pub fn new(
        policies: Vec<RetentionPolicy>,
        metadata_of: impl Fn(&T) -> ItemMetadata + Send + Sync + 'static,
    ) -> Self {
        Self {
            policies,
            metadata_of: Arc::new(metadata_of),
            filters: Mutex::new(BTreeMap::new()),
        }
    }

    /// Add an item under a distribution and component.
    pub fn add(&self, distribution: &str, component: &str, item: T) -> Result<()> {
        let metadata = (self.metadata_of)(&item);

        let key = (
            distribution.to_string(),
            component.to_string(),
            metadata.package,
            metadata.architecture,
        );

        let mut filters = self.filters.lock().expect("collector filters lock");

        if !filters.contains_key(&key) {
            let rules = rules_for_source(&self.policies, &metadata.source);
            let metadata_of = self.metadata_of.clone();
            filters.insert(
                key.clone(),
                RetentionFilter::new(
                    rules,
                    move |item: &T| metadata_of(item).version,
                    NoMatchBehavior::Keep,
                )?,
            );
        }

        filters
            .get(&key)
            .expect("filter inserted above")
            .add(item)?;

        Ok(())
    }

    /// Visit every kept item with its key.
    pub fn for_each_kept(
        &self,
        mut callback: impl FnMut(&str, &str, &str, &str, T) -> Result<()>,
    ) -> Result<()> {
        let filters = self.filters.lock().expect("collector filters lock");

        for ((distribution, component, package, architecture), filter) in filters.iter() {
            for item in filter.kept()? {
                callback(distribution, component, package, architecture, item)?;
            }
        }

        Ok(())
    }

    /// Materialize all kept items across the whole keyspace.
    pub fn kept(&self) -> Result<Vec<T>> {
        let mut result = vec![];
        self.for_each_kept(|_, _, _, _, item| {
            result.push(item);
            Ok(())
        })?;
        Ok(result)
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::retention::{RetentionPolicy, RetentionRule},
    };

    #[derive(Clone, Debug, Eq, PartialEq)]
    struct Item {
        source: String,
        name: String,
        arch: String,
        version: String,
    }

    fn item(source: &str, name: &str, arch: &str, version: &str) -> Item {
        Item {
            source: source.to_string(),
            name: name.to_string(),
            arch: arch.to_string(),
            version: version.to_string(),
        }
    }

    fn collector(policies: Vec<RetentionPolicy>) -> RetentionCollector<Item> {
        RetentionCollector::new(policies, |item: &Item| ItemMetadata {
            source: item.source.clone(),
            package: item.name.clone(),
            architecture: item.arch.clone(),
            version: item.version.clone(),
        })
    }

    fn keep_one_minor() -> Vec<RetentionPolicy> {
        vec![RetentionPolicy {
            rule: RetentionRule {
                pattern: "*.#.*-*".to_string(),
                amount: vec![1],
            },
            from_sources: vec![],
        }]
    }

    #[test]
    fn retention_applies_per_key() -> Result<()> {
        let collector = collector(keep_one_minor());

        collector.add("noble", "main", item("vips", "vips", "amd64", "1.34.3-2"))?;
        collector.add("noble", "main", item("vips", "vips", "amd64", "1.33.2-0"))?;
        // A different architecture retains independently.
        collector.add("noble", "main", item("vips", "vips", "arm64", "1.33.2-0"))?;
        // A different distribution retains independently.
        collector.add("jammy", "main", item("vips", "vips", "amd64", "1.32.7-0"))?;

        let mut seen = vec![];
        collector.for_each_kept(|dist, _, _, arch, item| {
            seen.push(format!("{} {} {}", dist, arch, item.version));
            Ok(())
        })?;
        seen.sort();

        assert_eq!(
            seen,
            vec![
                "jammy amd64 1.32.7-0",
                "noble amd64 1.34.3-2",
                "noble arm64 1.33.2-0",
            ]
        );

        Ok(())
    }

    #[test]
    fn unmatched_versions_are_kept() -> Result<()> {
        let collector = collector(keep_one_minor());

        collector.add("noble", "main", item("vips", "vips", "amd64", "oddball"))?;
        assert_eq!(collector.kept()?.len(), 1);

        Ok(())
    }

    #[test]
    fn for_each_kept_reports_keys() -> Result<()> {
        let collector = collector(vec![]);
        collector.add("noble", "debug", item("vips", "vips-dbgsym", "amd64", "1.0-1"))?;

        let mut seen = vec![];
        collector.for_each_kept(|dist, comp, name, arch, item| {
            seen.push((
                dist.to_string(),
                comp.to_string(),
                name.to_string(),
                arch.to_string(),
                item.version,
            ));
            Ok(())
        })?;

        assert_eq!(
            seen,
            vec![(
                "noble".to_string(),
                "debug".to_string(),
                "vips-dbgsym".to_string(),
                "amd64".to_string(),
                "1.0-1".to_string()
            )]
        );

        Ok(())
    }

    #[test]
    fn source_scoped_policies_select_by_source_not_package() -> Result<()> {
        let policies = vec![RetentionPolicy {
            rule: RetentionRule {
                pattern: "*.#.*-*".to_string(),
                amount: vec![1],
            },
            from_sources: vec!["vips".to_string()],
        }];
        let collector = collector(policies);

        // Package name differs from source name; the policy still applies
        // because selection uses the source.
        collector.add(
            "noble",
            "main",
            item("vips", "libvips42t64", "amd64", "1.34.3-2"),
        )?;
        collector.add(
            "noble",
            "main",
            item("vips", "libvips42t64", "amd64", "1.33.2-0"),
        )?;

        assert_eq!(collector.kept()?.len(), 1);
        Ok(())
    }
}
