//! Dotted version parsing and ordering.
//!
//! Parsing is permissive: a device may report anything as its version and
//! resolution must never fail because of it. Missing or non-numeric segments
//! read as 0, and any `-preRelease` / `+buildMetadata` suffix is dropped
//! before parsing. Ordering looks at (major, minor, patch) only, so
//! `2.0.0-beta` and `2.0.0` compare equal.

use std::cmp::Ordering;
use std::fmt;

/// A parsed `major.minor.patch` triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self { major, minor, patch }
    }

    /// Parse a version string. Never fails.
    pub fn parse(input: &str) -> Self {
        let core = input
            .trim()
            .split(['-', '+'])
            .next()
            .unwrap_or_default();

        let mut segments = core.split('.').map(parse_segment);
        Self {
            major: segments.next().unwrap_or(0),
            minor: segments.next().unwrap_or(0),
            patch: segments.next().unwrap_or(0),
        }
    }
}

fn parse_segment(segment: &str) -> u64 {
    segment.trim().parse().unwrap_or(0)
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl From<&str> for Version {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

/// Compare two version strings on (major, minor, patch).
pub fn compare(a: &str, b: &str) -> Ordering {
    Version::parse(a).cmp(&Version::parse(b))
}

/// `a >= b`.
pub fn gte(a: &str, b: &str) -> bool {
    compare(a, b) != Ordering::Less
}

/// `a <= b`.
pub fn lte(a: &str, b: &str) -> bool {
    compare(a, b) != Ordering::Greater
}

/// Whether `v` lies within the inclusive range; an absent bound is open.
pub fn in_range(v: &str, min: Option<&str>, max: Option<&str>) -> bool {
    min.is_none_or(|min| gte(v, min)) && max.is_none_or(|max| lte(v, max))
}

/// Whether a string carries at least one numeric version segment.
///
/// Used to flag release rows whose version cannot be meaningful. Device input
/// is never checked with this; it is always parsed permissively.
pub fn looks_like_version(input: &str) -> bool {
    input
        .trim()
        .split(['-', '+'])
        .next()
        .unwrap_or_default()
        .split('.')
        .any(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_and_partial_versions() {
        assert_eq!(Version::parse("1.2.3"), Version::new(1, 2, 3));
        assert_eq!(Version::parse("2"), Version::new(2, 0, 0));
        assert_eq!(Version::parse("2.1"), Version::new(2, 1, 0));
        assert_eq!(Version::parse(" 3.4.5 "), Version::new(3, 4, 5));
        assert_eq!(Version::parse("1.2.3.4"), Version::new(1, 2, 3));
    }

    #[test]
    fn strips_prerelease_and_build_suffixes() {
        assert_eq!(Version::parse("2.0.0-beta.1"), Version::new(2, 0, 0));
        assert_eq!(Version::parse("2.0.0+build.77"), Version::new(2, 0, 0));
        assert_eq!(Version::parse("2.0.0-rc.1+sha.abc"), Version::new(2, 0, 0));
        assert_eq!(compare("2.0.0-beta", "2.0.0"), Ordering::Equal);
    }

    #[test]
    fn garbage_degrades_to_zero() {
        assert_eq!(Version::parse(""), Version::new(0, 0, 0));
        assert_eq!(Version::parse("abc"), Version::new(0, 0, 0));
        assert_eq!(Version::parse("1.x.3"), Version::new(1, 0, 3));
        assert_eq!(Version::parse("v1.2.3"), Version::new(0, 2, 3));
        assert_eq!(Version::parse("..."), Version::new(0, 0, 0));
    }

    #[test]
    fn numeric_not_lexical_ordering() {
        assert_eq!(compare("1.10.0", "1.9.0"), Ordering::Greater);
        assert_eq!(compare("2.0.0", "10.0.0"), Ordering::Less);
        assert_eq!(compare("1.0.10", "1.0.9"), Ordering::Greater);
    }

    #[test]
    fn compare_is_antisymmetric_and_reflexive() {
        let samples = [
            "0.0.0", "1.0.0", "1.0.1", "1.2", "1.9.0", "1.10.0", "2.0.0-beta",
            "2.0.0", "10.0.0", "junk", "", "3.x", "14.0", "13.9.9",
        ];
        for a in samples {
            assert_eq!(compare(a, a), Ordering::Equal, "{a} vs itself");
            for b in samples {
                assert_eq!(compare(a, b), compare(b, a).reverse(), "{a} vs {b}");
            }
        }
    }

    #[test]
    fn derived_predicates() {
        assert!(gte("14.0", "14.0"));
        assert!(gte("14.1", "14.0"));
        assert!(!gte("13.0", "14.0"));
        assert!(lte("1.9.0", "2.0.0"));
        assert!(!lte("2.0.1", "2.0.0"));

        assert!(in_range("1.5.0", Some("1.0.0"), Some("2.0.0")));
        assert!(in_range("1.5.0", None, None));
        assert!(in_range("1.0.0", Some("1.0.0"), None));
        assert!(!in_range("2.0.1", None, Some("2.0.0")));
        assert!(!in_range("0.9", Some("1.0"), None));
    }

    #[test]
    fn version_shape_check() {
        assert!(looks_like_version("2.0.0"));
        assert!(looks_like_version("7"));
        assert!(looks_like_version("1.x"));
        assert!(!looks_like_version(""));
        assert!(!looks_like_version("latest"));
        assert!(!looks_like_version("-beta"));
    }
}
