// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Glob-based name filters.

Configuration filters for sources, packages, and tags are lists of glob
patterns (`*` and `?`). A pattern prefixed with `!` is a negation, applied
after positive matches. An empty list matches everything, and a list holding
only negations starts from match-all before subtracting.
*/

use glob::Pattern;

/// Whether `value` passes the given glob pattern list.
pub fn matches_glob_patterns(patterns: &[String], value: &str) -> bool {
    if patterns.is_empty() {
        return true;
    }

    let mut positive = vec![];
    let mut negative = vec![];

    for pattern in patterns {
        if let Some(negated) = pattern.strip_prefix('!') {
            negative.push(negated);
        } else {
            positive.push(pattern.as_str());
        }
    }

    let mut matched = positive.is_empty()
        || positive
            .iter()
            .any(|p| Pattern::new(p).map(|p| p.matches(value)).unwrap_or(false));

    if matched {
        matched = !negative
            .iter()
            .any(|p| Pattern::new(p).map(|p| p.matches(value)).unwrap_or(false));
    }

    matched
}
