// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Pattern-based version retention.

A retention pattern is a mini-language over version segments: `*` matches a
segment without tracking it, `#` matches and tracks it, and any other
character is a delimiter. A rule pairs a pattern with per-tracked-segment
keep counts. Retention proceeds hierarchically: at each tracked segment,
bucket the candidate versions by that segment's value, keep the top N buckets
under Debian segment ordering, and recurse; a leaf keeps the single highest
version.

Example: pattern `*.#.*-*` with amount `[3]` keeps the three highest minor
series, each represented by its highest full version.
*/

use {
    crate::{
        error::{DebmillError, Result},
        filters::matches_glob_patterns,
        package_version::compare_fragment,
    },
    serde::{Deserialize, Serialize},
    std::{
        cmp::Ordering,
        collections::{BTreeMap, HashSet},
        sync::Mutex,
    },
};

/// How to handle items whose version matches no retention pattern.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum NoMatchBehavior {
    /// Keep items that match no pattern. The safe default.
    #[default]
    Keep,
    /// Silently drop items that match no pattern.
    Ignore,
    /// Fail when an item matches no pattern.
    Error,
}

/// A version pattern plus per-tracked-segment keep counts.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RetentionRule {
    pub pattern: String,
    pub amount: Vec<usize>,
}

/// A retention rule with an optional source-name restriction.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RetentionPolicy {
    #[serde(flatten)]
    pub rule: RetentionRule,

    /// Source-name glob patterns this policy applies to. Empty applies to all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub from_sources: Vec<String>,
}

/// Select the rules from `policies` applicable to `source_name`.
pub fn rules_for_source(policies: &[RetentionPolicy], source_name: &str) -> Vec<RetentionRule> {
    policies
        .iter()
        .filter(|policy| matches_glob_patterns(&policy.from_sources, source_name))
        .map(|policy| policy.rule.clone())
        .collect()
}

/// A parsed pattern: segment count, tracked segment indices, and the
/// delimiter set (the first character of each inter-segment delimiter run).
#[derive(Clone, Debug)]
struct Pattern {
    delimiters: Vec<char>,
    tracked: Vec<usize>,
    segment_count: usize,
}

fn parse_pattern(s: &str) -> Result<Pattern> {
    if s.is_empty() {
        return Err(DebmillError::RetentionPattern("empty pattern".to_string()));
    }

    let mut delimiters = vec![];
    let mut tracked = vec![];
    let mut segment_count = 0usize;
    let mut delimiter_run = vec![];

    for c in s.chars() {
        if c == '*' || c == '#' {
            if segment_count > 0 && delimiter_run.is_empty() {
                return Err(DebmillError::RetentionPattern(format!(
                    "expected delimiter between segments in {:?}",
                    s
                )));
            }

            if segment_count > 0 {
                delimiters.push(delimiter_run[0]);
            }
            delimiter_run.clear();

            if c == '#' {
                tracked.push(segment_count);
            }
            segment_count += 1;
        } else {
            delimiter_run.push(c);
        }
    }

    if segment_count == 0 {
        return Err(DebmillError::RetentionPattern(format!(
            "pattern {:?} must contain at least one segment (* or #)",
            s
        )));
    }

    Ok(Pattern {
        delimiters,
        tracked,
        segment_count,
    })
}

/// A version split into segments along one pattern's delimiters.
#[derive(Clone, Debug)]
struct SegmentedVersion {
    raw: String,
    segments: Vec<String>,
}

/// Split `version` on the pattern's delimiter set. Returns [None] when the
/// resulting segment count does not match the pattern.
fn segment_version(version: &str, pattern: &Pattern) -> Option<SegmentedVersion> {
    if version.is_empty() {
        return None;
    }

    let mut segments = vec![];
    let mut current = String::new();

    for c in version.chars() {
        if pattern.delimiters.contains(&c) {
            if !current.is_empty() {
                segments.push(std::mem::take(&mut current));
            }
        } else {
            current.push(c);
        }
    }
    if !current.is_empty() {
        segments.push(current);
    }

    if segments.len() != pattern.segment_count {
        return None;
    }

    Some(SegmentedVersion {
        raw: version.to_string(),
        segments,
    })
}

fn compare_segmented(a: &SegmentedVersion, b: &SegmentedVersion) -> Ordering {
    for (a_segment, b_segment) in a.segments.iter().zip(b.segments.iter()) {
        match compare_fragment(a_segment, b_segment) {
            Ordering::Equal => {}
            other => return other,
        }
    }

    Ordering::Equal
}

/// Applies retention rules to items carrying version strings.
///
/// Safe for concurrent [Self::add] and [Self::kept] calls.
pub struct RetentionFilter<T> {
    rules: Vec<RetentionRule>,
    patterns: Vec<Pattern>,
    version_of: Box<dyn Fn(&T) -> String + Send + Sync>,
    no_match: NoMatchBehavior,
    items: Mutex<Vec<T>>,
}

impl<T: Clone> RetentionFilter<T> {
    /// Construct a filter, validating every rule's pattern and amounts.
    pub fn new(
        rules: Vec<RetentionRule>,
        version_of: impl Fn(&T) -> String + Send + Sync + 'static,
        no_match: NoMatchBehavior,
    ) -> Result<Self> {
        let patterns = rules
            .iter()
            .map(|rule| {
                let pattern = parse_pattern(&rule.pattern)?;
                if rule.amount.len() != pattern.tracked.len() {
                    return Err(DebmillError::RetentionPattern(format!(
                        "amount count {} does not match tracked segment count {} in {:?}",
                        rule.amount.len(),
                        pattern.tracked.len(),
                        rule.pattern
                    )));
                }
                Ok(pattern)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            rules,
            patterns,
            version_of: Box::new(version_of),
            no_match,
            items: Mutex::new(vec![]),
        })
    }

    /// Record an item for later filtering.
    pub fn add(&self, item: T) -> Result<()> {
        if matches!(self.no_match, NoMatchBehavior::Error | NoMatchBehavior::Ignore) {
            let version = (self.version_of)(&item);
            if self.applicable_rules(&version).is_empty() {
                return match self.no_match {
                    NoMatchBehavior::Error => Err(DebmillError::RetentionNoMatch { version }),
                    _ => Ok(()),
                };
            }
        }

        self.items.lock().expect("retention items lock").push(item);
        Ok(())
    }

    /// Filter all recorded items.
    pub fn kept(&self) -> Result<Vec<T>> {
        let items = self.items.lock().expect("retention items lock").clone();
        self.filter(&items)
    }

    /// Return the subset of `items` retained under the configured rules.
    ///
    /// The result preserves input order and is invariant under permutation of
    /// the input.
    pub fn filter(&self, items: &[T]) -> Result<Vec<T>> {
        // ruleIdx -> items matched by that rule.
        let mut rule_groups: BTreeMap<usize, Vec<&T>> = BTreeMap::new();
        let mut unmatched = vec![];

        for item in items {
            let version = (self.version_of)(item);
            let applicable = self.applicable_rules(&version);

            if applicable.is_empty() {
                match self.no_match {
                    NoMatchBehavior::Keep => unmatched.push(item),
                    NoMatchBehavior::Ignore => {}
                    NoMatchBehavior::Error => {
                        return Err(DebmillError::RetentionNoMatch { version });
                    }
                }
                continue;
            }

            for rule_index in applicable {
                rule_groups.entry(rule_index).or_default().push(item);
            }
        }

        let mut keep: HashSet<String> = HashSet::new();

        for (rule_index, group) in &rule_groups {
            let rule = &self.rules[*rule_index];
            let pattern = &self.patterns[*rule_index];

            let versions = group
                .iter()
                .filter_map(|item| segment_version(&(self.version_of)(item), pattern))
                .collect::<Vec<_>>();

            for raw in retain_level(&versions, &pattern.tracked, &rule.amount, 0) {
                keep.insert(raw);
            }
        }

        for item in unmatched {
            keep.insert((self.version_of)(item));
        }

        Ok(items
            .iter()
            .filter(|item| keep.contains(&(self.version_of)(item)))
            .cloned()
            .collect())
    }

    /// Rule indices applicable to a version: among matching patterns, only
    /// those with the maximum segment count (most specific); ties union.
    fn applicable_rules(&self, version: &str) -> Vec<usize> {
        let mut max_segments = 0;
        let mut applicable = vec![];

        for (index, pattern) in self.patterns.iter().enumerate() {
            if segment_version(version, pattern).is_none() {
                continue;
            }

            match pattern.segment_count.cmp(&max_segments) {
                Ordering::Greater => {
                    max_segments = pattern.segment_count;
                    applicable = vec![index];
                }
                Ordering::Equal => applicable.push(index),
                Ordering::Less => {}
            }
        }

        applicable
    }
}

/// Hierarchical retention: bucket by the level-th tracked segment, keep the
/// top buckets, recurse. The leaf keeps the single highest whole version.
fn retain_level(
    versions: &[SegmentedVersion],
    tracked: &[usize],
    amounts: &[usize],
    level: usize,
) -> Vec<String> {
    if versions.is_empty() {
        return vec![];
    }

    if level >= tracked.len() {
        let best = versions
            .iter()
            .max_by(|a, b| compare_segmented(a, b))
            .expect("non-empty checked above");
        return vec![best.raw.clone()];
    }

    let index = tracked[level];
    let amount = amounts[level];

    // Group by the segments left of this tracked segment so sibling series
    // are retained independently.
    let mut groups: BTreeMap<String, Vec<&SegmentedVersion>> = BTreeMap::new();
    for version in versions {
        let key = version.segments[..index].join(":");
        groups.entry(key).or_default().push(version);
    }

    let mut result = vec![];

    for group in groups.values() {
        let mut buckets: BTreeMap<&str, Vec<SegmentedVersion>> = BTreeMap::new();
        for version in group {
            buckets
                .entry(version.segments[index].as_str())
                .or_default()
                .push((*version).clone());
        }

        let mut keys = buckets.keys().copied().collect::<Vec<_>>();
        keys.sort_by(|a, b| compare_fragment(b, a));

        for key in keys.into_iter().take(amount) {
            result.extend(retain_level(&buckets[key], tracked, amounts, level + 1));
        }
    }

    result
}
