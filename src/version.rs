// src/version.rs

//! Version comparison for package EVR strings
//!
//! Versions are compared segment by segment the way RPM does it: runs of
//! digits compare numerically, runs of letters compare lexically, a numeric
//! segment is newer than an alphabetic one, and `~` sorts before anything
//! (including the end of the string), which is how pre-releases are spelled.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Compare two version (or release) strings
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }

    let a = a.as_bytes();
    let b = b.as_bytes();
    let (mut i, mut j) = (0usize, 0usize);

    loop {
        while i < a.len() && !a[i].is_ascii_alphanumeric() && a[i] != b'~' {
            i += 1;
        }
        while j < b.len() && !b[j].is_ascii_alphanumeric() && b[j] != b'~' {
            j += 1;
        }

        let a_tilde = i < a.len() && a[i] == b'~';
        let b_tilde = j < b.len() && b[j] == b'~';
        if a_tilde || b_tilde {
            if !a_tilde {
                return Ordering::Greater;
            }
            if !b_tilde {
                return Ordering::Less;
            }
            i += 1;
            j += 1;
            continue;
        }

        if i >= a.len() || j >= b.len() {
            break;
        }

        let numeric = a[i].is_ascii_digit();
        let (start_a, start_b) = (i, j);
        if numeric {
            while i < a.len() && a[i].is_ascii_digit() {
                i += 1;
            }
            while j < b.len() && b[j].is_ascii_digit() {
                j += 1;
            }
        } else {
            while i < a.len() && a[i].is_ascii_alphabetic() {
                i += 1;
            }
            while j < b.len() && b[j].is_ascii_alphabetic() {
                j += 1;
            }
        }

        let seg_a = &a[start_a..i];
        let seg_b = &b[start_b..j];

        // Segments of different kinds: numeric is newer
        if seg_b.is_empty() {
            return if numeric {
                Ordering::Greater
            } else {
                Ordering::Less
            };
        }

        let ord = if numeric {
            let trim_a = trim_leading_zeros(seg_a);
            let trim_b = trim_leading_zeros(seg_b);
            trim_a
                .len()
                .cmp(&trim_b.len())
                .then_with(|| trim_a.cmp(trim_b))
        } else {
            seg_a.cmp(seg_b)
        };

        if ord != Ordering::Equal {
            return ord;
        }
    }

    match (i >= a.len(), j >= b.len()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        _ => Ordering::Greater,
    }
}

fn trim_leading_zeros(seg: &[u8]) -> &[u8] {
    let first = seg.iter().position(|c| *c != b'0').unwrap_or(seg.len());
    &seg[first..]
}

/// Epoch / version / release triple
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Evr {
    pub epoch: Option<u32>,
    pub version: String,
    pub release: Option<String>,
}

impl Evr {
    pub fn new(epoch: Option<u32>, version: impl Into<String>, release: Option<String>) -> Self {
        Self {
            epoch,
            version: version.into(),
            release,
        }
    }

    /// Parse `[epoch:]version[-release]`
    pub fn parse(s: &str) -> Self {
        let (epoch, rest) = match s.split_once(':') {
            Some((e, rest)) if !e.is_empty() && e.bytes().all(|c| c.is_ascii_digit()) => {
                (e.parse().ok(), rest)
            }
            _ => (None, s),
        };

        match rest.rsplit_once('-') {
            Some((v, r)) => Self::new(epoch, v, Some(r.to_string())),
            None => Self::new(epoch, rest, None),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.version.is_empty()
    }
}

impl Ord for Evr {
    fn cmp(&self, other: &Self) -> Ordering {
        self.epoch
            .unwrap_or(0)
            .cmp(&other.epoch.unwrap_or(0))
            .then_with(|| compare_versions(&self.version, &other.version))
            .then_with(|| match (&self.release, &other.release) {
                // A missing release matches any release
                (Some(a), Some(b)) => compare_versions(a, b),
                _ => Ordering::Equal,
            })
    }
}

impl PartialOrd for Evr {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Evr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(epoch) = self.epoch {
            write!(f, "{}:", epoch)?;
        }
        write!(f, "{}", self.version)?;
        if let Some(release) = &self.release {
            write!(f, "-{}", release)?;
        }
        Ok(())
    }
}

/// Comparison sense of a versioned dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DepFlags(pub u8);

impl DepFlags {
    pub const ANY: DepFlags = DepFlags(0);
    pub const LESS: DepFlags = DepFlags(0x02);
    pub const GREATER: DepFlags = DepFlags(0x04);
    pub const EQUAL: DepFlags = DepFlags(0x08);

    pub fn contains(self, other: DepFlags) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn is_versioned(self) -> bool {
        self.0 & (Self::LESS.0 | Self::GREATER.0 | Self::EQUAL.0) != 0
    }
}

impl std::ops::BitOr for DepFlags {
    type Output = DepFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        DepFlags(self.0 | rhs.0)
    }
}

/// Check whether two versioned ranges can be satisfied by a common EVR
pub fn ranges_overlap(a_flags: DepFlags, a_evr: &Evr, b_flags: DepFlags, b_evr: &Evr) -> bool {
    if !a_flags.is_versioned() || !b_flags.is_versioned() {
        return true;
    }
    if a_evr.is_empty() || b_evr.is_empty() {
        return true;
    }

    match a_evr.cmp(b_evr) {
        Ordering::Less => {
            a_flags.contains(DepFlags::GREATER) || b_flags.contains(DepFlags::LESS)
        }
        Ordering::Greater => {
            a_flags.contains(DepFlags::LESS) || b_flags.contains(DepFlags::GREATER)
        }
        Ordering::Equal => {
            (a_flags.contains(DepFlags::EQUAL) && b_flags.contains(DepFlags::EQUAL))
                || (a_flags.contains(DepFlags::LESS) && b_flags.contains(DepFlags::LESS))
                || (a_flags.contains(DepFlags::GREATER) && b_flags.contains(DepFlags::GREATER))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_segments() {
        assert_eq!(compare_versions("1.0", "1.0"), Ordering::Equal);
        assert_eq!(compare_versions("1.10", "1.9"), Ordering::Greater);
        assert_eq!(compare_versions("1.01", "1.1"), Ordering::Equal);
        assert_eq!(compare_versions("2", "10"), Ordering::Less);
    }

    #[test]
    fn test_alpha_and_mixed_segments() {
        assert_eq!(compare_versions("1.0a", "1.0b"), Ordering::Less);
        assert_eq!(compare_versions("1.0.1", "1.0a"), Ordering::Greater);
        assert_eq!(compare_versions("1.0", "1.0.1"), Ordering::Less);
    }

    #[test]
    fn test_tilde_sorts_first() {
        assert_eq!(compare_versions("1.0~rc1", "1.0"), Ordering::Less);
        assert_eq!(compare_versions("1.0~rc1", "1.0~rc2"), Ordering::Less);
    }

    #[test]
    fn test_evr_parse_and_order() {
        let evr = Evr::parse("2:1.4-3.fc40");
        assert_eq!(evr.epoch, Some(2));
        assert_eq!(evr.version, "1.4");
        assert_eq!(evr.release.as_deref(), Some("3.fc40"));
        assert_eq!(evr.to_string(), "2:1.4-3.fc40");

        assert!(Evr::parse("1:1.0-1") > Evr::parse("2.0-1"));
        assert!(Evr::parse("1.0-2") > Evr::parse("1.0-1"));
        // Release ignored when one side omits it
        assert_eq!(Evr::parse("1.0").cmp(&Evr::parse("1.0-7")), Ordering::Equal);
    }

    #[test]
    fn test_ranges_overlap() {
        let ge = DepFlags::GREATER | DepFlags::EQUAL;
        let eq = DepFlags::EQUAL;
        assert!(ranges_overlap(ge, &Evr::parse("1.0"), eq, &Evr::parse("1.2-1")));
        assert!(!ranges_overlap(ge, &Evr::parse("2.0"), eq, &Evr::parse("1.2-1")));
        assert!(ranges_overlap(DepFlags::ANY, &Evr::default(), eq, &Evr::parse("1.2-1")));
        assert!(!ranges_overlap(DepFlags::LESS, &Evr::parse("1.0"), eq, &Evr::parse("1.0")));
    }
}
