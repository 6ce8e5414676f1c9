//! # CPU ID Sets
//!
//! Ordered sets of CPU IDs with the set algebra the allocator and hint
//! generator are built on. Iteration is always ascending, so every consumer
//! sees the same deterministic order.
//!
//! Sets also speak the Linux cpulist text format (`"0-3,8"`), the same
//! grammar sysfs uses for `online` and per-node `cpulist` files.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// An ordered set of CPU IDs.
///
/// Also used for sets of core, socket, and NUMA node IDs; all four ID spaces
/// are plain integers and share the same algebra.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuSet(BTreeSet<usize>);

impl CpuSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// Creates a set from a slice of IDs. Duplicates collapse.
    #[must_use]
    pub fn from_slice(ids: &[usize]) -> Self {
        ids.iter().copied().collect()
    }

    /// Number of IDs in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `id` is a member.
    #[must_use]
    pub fn contains(&self, id: usize) -> bool {
        self.0.contains(&id)
    }

    /// Inserts a single ID.
    pub fn insert(&mut self, id: usize) {
        self.0.insert(id);
    }

    /// Removes a single ID.
    pub fn remove(&mut self, id: usize) {
        self.0.remove(&id);
    }

    /// Returns the union of `self` and `other` as a new set.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        Self(self.0.union(&other.0).copied().collect())
    }

    /// Returns the intersection of `self` and `other` as a new set.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Self {
        Self(self.0.intersection(&other.0).copied().collect())
    }

    /// Returns the IDs of `self` that are not in `other`, as a new set.
    #[must_use]
    pub fn difference(&self, other: &Self) -> Self {
        Self(self.0.difference(&other.0).copied().collect())
    }

    /// Whether every ID of `self` is also in `other`.
    #[must_use]
    pub fn is_subset(&self, other: &Self) -> bool {
        self.0.is_subset(&other.0)
    }

    /// Returns the members satisfying `pred` as a new set.
    #[must_use]
    pub fn filter(&self, pred: impl Fn(usize) -> bool) -> Self {
        Self(self.0.iter().copied().filter(|&id| pred(id)).collect())
    }

    /// Iterates the IDs in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().copied()
    }

    /// Returns the IDs as a vector in ascending order.
    #[must_use]
    pub fn to_vec(&self) -> Vec<usize> {
        self.0.iter().copied().collect()
    }
}

impl FromIterator<usize> for CpuSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a CpuSet {
    type Item = usize;
    type IntoIter = std::iter::Copied<std::collections::btree_set::Iter<'a, usize>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter().copied()
    }
}

impl fmt::Display for CpuSet {
    /// Renders the set in cpulist form, compressing runs: `{0,1,2,3,8}`
    /// becomes `"0-3,8"`. The empty set renders as `""`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut ids = self.0.iter().copied().peekable();
        while let Some(start) = ids.next() {
            let mut end = start;
            while let Some(&next) = ids.peek() {
                if next != end + 1 {
                    break;
                }
                end = next;
                ids.next();
            }
            if !first {
                write!(f, ",")?;
            }
            first = false;
            if end > start {
                write!(f, "{start}-{end}")?;
            } else {
                write!(f, "{start}")?;
            }
        }
        Ok(())
    }
}

/// Error parsing a cpulist string.
#[derive(Debug, thiserror::Error)]
#[error("invalid cpu list {0:?}")]
pub struct ParseCpuSetError(String);

impl FromStr for CpuSet {
    type Err = ParseCpuSetError;

    /// Parses the Linux cpulist grammar: comma-separated single IDs and
    /// inclusive ranges, e.g. `"0-7,16-23"`. Empty components are ignored,
    /// so `""` parses to the empty set.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut set = BTreeSet::new();
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if let Some((lo, hi)) = part.split_once('-') {
                let lo: usize = lo.trim().parse().map_err(|_| ParseCpuSetError(s.into()))?;
                let hi: usize = hi.trim().parse().map_err(|_| ParseCpuSetError(s.into()))?;
                if lo > hi {
                    return Err(ParseCpuSetError(s.into()));
                }
                set.extend(lo..=hi);
            } else {
                let id: usize = part.parse().map_err(|_| ParseCpuSetError(s.into()))?;
                set.insert(id);
            }
        }
        Ok(Self(set))
    }
}
