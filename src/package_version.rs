// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Debian package version string handling.

Version semantics are defined at
<https://www.debian.org/doc/debian-policy/ch-controlfields.html#version>.
A version decomposes as `[epoch:]upstream_version[-debian_revision]` and
sorts by a custom ordering in which digit runs compare numerically and
non-digit runs compare with tilde-first, letters-before-non-letters rules.
*/

use {
    crate::error::{DebmillError, Result},
    std::{
        cmp::Ordering,
        fmt::{Display, Formatter},
        str::FromStr,
    },
};

/// A parsed Debian package version.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PackageVersion {
    epoch: Option<u32>,
    upstream: String,
    revision: Option<String>,
}

impl PackageVersion {
    /// Construct an instance by parsing a version string.
    pub fn parse(s: &str) -> Result<Self> {
        // The epoch precedes the first colon; the revision follows the last
        // hyphen. Both are optional.
        let (epoch, remainder) = match s.split_once(':') {
            Some((epoch, rest)) => (Some(epoch), rest),
            None => (None, s),
        };

        let (upstream, revision) = match remainder.rsplit_once('-') {
            Some((upstream, revision)) => (upstream, Some(revision)),
            None => (remainder, None),
        };

        let epoch = match epoch {
            Some(epoch) => {
                if epoch.is_empty() || !epoch.chars().all(|c| c.is_ascii_digit()) {
                    return Err(DebmillError::Other(format!(
                        "epoch component has non-digit characters: {}",
                        s
                    )));
                }
                Some(u32::from_str(epoch)?)
            }
            None => None,
        };

        if upstream.is_empty() {
            return Err(DebmillError::Other(format!(
                "upstream_version component is empty: {}",
                s
            )));
        }

        // The upstream version allows alphanumerics plus `.+~`, and hyphens
        // only when a revision follows.
        if !upstream.chars().all(|c| match c {
            c if c.is_ascii_alphanumeric() => true,
            '.' | '+' | '~' => true,
            '-' => revision.is_some(),
            _ => false,
        }) {
            return Err(DebmillError::Other(format!(
                "upstream_version component has illegal character: {}",
                s
            )));
        }

        if let Some(revision) = revision {
            if !revision
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '+' | '~'))
            {
                return Err(DebmillError::Other(format!(
                    "debian_revision component has illegal character: {}",
                    s
                )));
            }
        }

        Ok(Self {
            epoch,
            upstream: upstream.to_string(),
            revision: revision.map(|v| v.to_string()),
        })
    }

    /// The explicit `epoch` component, if present.
    pub fn epoch(&self) -> Option<u32> {
        self.epoch
    }

    /// The `upstream_version` component.
    pub fn upstream_version(&self) -> &str {
        &self.upstream
    }

    /// The `debian_revision` component, if present.
    pub fn debian_revision(&self) -> Option<&str> {
        self.revision.as_deref()
    }
}

impl Display for PackageVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(epoch) = self.epoch {
            write!(f, "{}:", epoch)?;
        }
        f.write_str(&self.upstream)?;
        if let Some(revision) = &self.revision {
            write!(f, "-{}", revision)?;
        }
        Ok(())
    }
}

impl PartialOrd for PackageVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PackageVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        // Epoch compares numerically with 0 assumed; a missing revision
        // compares as the empty string.
        self.epoch
            .unwrap_or(0)
            .cmp(&other.epoch.unwrap_or(0))
            .then_with(|| compare_fragment(&self.upstream, &other.upstream))
            .then_with(|| {
                compare_fragment(
                    self.revision.as_deref().unwrap_or(""),
                    other.revision.as_deref().unwrap_or(""),
                )
            })
    }
}

/// Compare two full version strings under Debian ordering.
///
/// Unparseable inputs fall back to fragment comparison of the raw strings,
/// so the ordering stays total over arbitrary input.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (PackageVersion::parse(a), PackageVersion::parse(b)) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => compare_fragment(a, b),
    }
}

/// Rank a character for the Debian lexical ordering of non-digit runs.
///
/// Tilde sorts before the end of the string, which sorts before letters,
/// which sort before everything else.
fn char_rank(c: char) -> u32 {
    match c {
        '~' => 0,
        c if c.is_ascii_alphabetic() => c as u32 + 2,
        c => c as u32 + 0x200,
    }
}

fn lexical_cmp(a: &str, b: &str) -> Ordering {
    let mut a_chars = a.chars();
    let mut b_chars = b.chars();

    loop {
        match (a_chars.next(), b_chars.next()) {
            (None, None) => return Ordering::Equal,
            // End of string ranks between tilde and everything else.
            (None, Some(bc)) => {
                return if bc == '~' {
                    Ordering::Greater
                } else {
                    Ordering::Less
                };
            }
            (Some(ac), None) => {
                return if ac == '~' {
                    Ordering::Less
                } else {
                    Ordering::Greater
                };
            }
            (Some(ac), Some(bc)) => match char_rank(ac).cmp(&char_rank(bc)) {
                Ordering::Equal => {}
                other => return other,
            },
        }
    }
}

fn split_leading<F: Fn(char) -> bool>(s: &str, pred: F) -> (&str, &str) {
    let end = s
        .char_indices()
        .find(|(_, c)| !pred(*c))
        .map(|(i, _)| i)
        .unwrap_or(s.len());

    s.split_at(end)
}

/// Compare one version fragment (upstream version, revision, or a retention
/// pattern segment) using Debian rules.
///
/// The fragment is consumed as alternating non-digit and digit runs. Non-digit
/// runs compare with the custom lexical ordering; digit runs compare
/// numerically, with an exhausted run counting as zero.
pub(crate) fn compare_fragment(a: &str, b: &str) -> Ordering {
    let mut a_rest = a;
    let mut b_rest = b;

    loop {
        let (a_alpha, a_after) = split_leading(a_rest, |c| !c.is_ascii_digit());
        let (b_alpha, b_after) = split_leading(b_rest, |c| !c.is_ascii_digit());

        match lexical_cmp(a_alpha, b_alpha) {
            Ordering::Equal => {}
            other => return other,
        }

        let (a_digits, a_after) = split_leading(a_after, |c| c.is_ascii_digit());
        let (b_digits, b_after) = split_leading(b_after, |c| c.is_ascii_digit());

        let a_num = if a_digits.is_empty() {
            0
        } else {
            a_digits.parse::<u64>().unwrap_or(u64::MAX)
        };
        let b_num = if b_digits.is_empty() {
            0
        } else {
            b_digits.parse::<u64>().unwrap_or(u64::MAX)
        };

        match a_num.cmp(&b_num) {
            Ordering::Equal => {}
            other => return other,
        }

        if a_after.is_empty() && b_after.is_empty() {
            return Ordering::Equal;
        }

        a_rest = a_after;
        b_rest = b_after;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_components() -> Result<()> {
        let v = PackageVersion::parse("1:4.7.0+dfsg1-2")?;
        assert_eq!(v.epoch(), Some(1));
        assert_eq!(v.upstream_version(), "4.7.0+dfsg1");
        assert_eq!(v.debian_revision(), Some("2"));

        let v = PackageVersion::parse("2.4.1-0alpha3~noble")?;
        assert_eq!(v.epoch(), None);
        assert_eq!(v.upstream_version(), "2.4.1");
        assert_eq!(v.debian_revision(), Some("0alpha3~noble"));

        let v = PackageVersion::parse("0.18.0+dfsg-2+b1")?;
        assert_eq!(v.upstream_version(), "0.18.0+dfsg");
        assert_eq!(v.debian_revision(), Some("2+b1"));

        Ok(())
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!(PackageVersion::parse("a:1.0").is_err());
        assert!(PackageVersion::parse("1.0 final").is_err());
        assert!(PackageVersion::parse("1.0-rev-with space").is_err());
    }

    #[test]
    fn display_round_trip() -> Result<()> {
        for s in [
            "1:4.7.0+dfsg1-2",
            "3.3.2.final~github",
            "0.18.0+dfsg-2+b1",
            "2.4.1-0alpha3~noble",
            "10",
        ] {
            assert_eq!(PackageVersion::parse(s)?.to_string(), s);
        }

        Ok(())
    }

    fn cmp(a: &str, b: &str) -> Ordering {
        compare_versions(a, b)
    }

    #[test]
    fn ordering_matches_dpkg() {
        // Each pair verified against `dpkg --compare-versions`.
        assert_eq!(cmp("1.0~rc1", "1.0"), Ordering::Less);
        assert_eq!(cmp("1.0", "1.0-1"), Ordering::Less);
        assert_eq!(cmp("10", "2"), Ordering::Greater);
        assert_eq!(cmp("1.0~beta1~svn1245", "1.0~beta1"), Ordering::Less);
        assert_eq!(cmp("1.0~beta1", "1.0"), Ordering::Less);
        assert_eq!(cmp("1:0.1", "2.0"), Ordering::Greater);
        assert_eq!(cmp("1.0", "1.0"), Ordering::Equal);
        // Letters sort before non-letters.
        assert_eq!(cmp("1.0a", "1.0+"), Ordering::Less);
        // Missing revision equals empty revision.
        assert_eq!(cmp("1.0", "1.0-0"), Ordering::Less);
        assert_eq!(cmp("2.4.1-0alpha3~noble", "2.4.1-0alpha3"), Ordering::Less);
    }

    #[test]
    fn fragment_edge_cases() {
        assert_eq!(compare_fragment("~", ""), Ordering::Less);
        assert_eq!(compare_fragment("", "~"), Ordering::Greater);
        assert_eq!(compare_fragment("a", ""), Ordering::Greater);
        assert_eq!(compare_fragment("", "a"), Ordering::Less);
        assert_eq!(compare_fragment("01", "1"), Ordering::Equal);
        assert_eq!(compare_fragment("", "0"), Ordering::Equal);
    }

    #[test]
    fn total_order_over_arbitrary_strings() {
        // compare_versions must not panic and must stay consistent on
        // unparseable inputs.
        let mut values = vec!["1.0", "not a version!", "2:x", "1.0-1", "~~"];
        values.sort_by(|a, b| cmp(a, b));
        assert_eq!(values.len(), 5);
    }
}
