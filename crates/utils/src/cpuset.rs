//! Kubelet-style CPU list sets
//!
//! A `CpuSet` is an ordered set of logical CPU ids with the usual set
//! algebra and the `"0-3,8,10-11"` list syntax used by cpuset cgroup
//! files and the kubelet.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CpuSetError {
    #[error("malformed CPU list {list:?}: {reason}")]
    Malformed { list: String, reason: String },
}

/// An ordered set of logical CPU ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuSet {
    cpus: BTreeSet<u32>,
}

impl CpuSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a kubelet-style CPU list, e.g. `"0-3,8,10-11"`. An empty or
    /// all-whitespace string parses to the empty set.
    pub fn parse(list: &str) -> Result<Self, CpuSetError> {
        let mut cpus = BTreeSet::new();
        for part in list.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match part.split_once('-') {
                Some((lo, hi)) => {
                    let lo = parse_id(list, lo)?;
                    let hi = parse_id(list, hi)?;
                    if hi < lo {
                        return Err(CpuSetError::Malformed {
                            list: list.to_string(),
                            reason: format!("descending range {part:?}"),
                        });
                    }
                    cpus.extend(lo..=hi);
                }
                None => {
                    cpus.insert(parse_id(list, part)?);
                }
            }
        }
        Ok(Self { cpus })
    }

    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }

    pub fn size(&self) -> usize {
        self.cpus.len()
    }

    pub fn contains(&self, cpu: u32) -> bool {
        self.cpus.contains(&cpu)
    }

    pub fn add(&mut self, cpu: u32) {
        self.cpus.insert(cpu);
    }

    pub fn remove(&mut self, cpu: u32) -> bool {
        self.cpus.remove(&cpu)
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.cpus.iter().copied()
    }

    pub fn union(&self, other: &Self) -> Self {
        Self {
            cpus: self.cpus.union(&other.cpus).copied().collect(),
        }
    }

    pub fn intersection(&self, other: &Self) -> Self {
        Self {
            cpus: self.cpus.intersection(&other.cpus).copied().collect(),
        }
    }

    pub fn difference(&self, other: &Self) -> Self {
        Self {
            cpus: self.cpus.difference(&other.cpus).copied().collect(),
        }
    }

    pub fn is_subset(&self, other: &Self) -> bool {
        self.cpus.is_subset(&other.cpus)
    }

    /// The `n` lowest-numbered CPUs of the set. Returns `None` when the
    /// set holds fewer than `n` CPUs.
    pub fn lowest(&self, n: usize) -> Option<Self> {
        if self.cpus.len() < n {
            return None;
        }
        Some(Self {
            cpus: self.cpus.iter().take(n).copied().collect(),
        })
    }
}

fn parse_id(list: &str, s: &str) -> Result<u32, CpuSetError> {
    s.trim().parse().map_err(|_| CpuSetError::Malformed {
        list: list.to_string(),
        reason: format!("invalid CPU id {s:?}"),
    })
}

impl FromIterator<u32> for CpuSet {
    fn from_iter<T: IntoIterator<Item = u32>>(iter: T) -> Self {
        Self {
            cpus: iter.into_iter().collect(),
        }
    }
}

impl FromStr for CpuSet {
    type Err = CpuSetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CpuSet {
    /// Formats as a kubelet CPU list with ranges collapsed.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut iter = self.cpus.iter().copied().peekable();
        while let Some(lo) = iter.next() {
            let mut hi = lo;
            while iter.peek() == Some(&(hi + 1)) {
                hi = iter.next().unwrap();
            }
            if !first {
                write!(f, ",")?;
            }
            first = false;
            if hi > lo {
                write!(f, "{lo}-{hi}")?;
            } else {
                write!(f, "{lo}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_format_round_trip() {
        for list in ["", "0", "0-3", "0-3,8", "0-3,8,10-11", "2,4,6"] {
            let set = CpuSet::parse(list).expect("should parse CPU list");
            assert_eq!(set.to_string(), list);
        }
    }

    #[test]
    fn parse_normalizes_unsorted_input() {
        let set = CpuSet::parse("3,1,2,0").unwrap();
        assert_eq!(set.to_string(), "0-3");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(CpuSet::parse("0-").is_err());
        assert!(CpuSet::parse("a").is_err());
        assert!(CpuSet::parse("3-1").is_err());
    }

    #[test]
    fn set_algebra() {
        let a = CpuSet::parse("0-3").unwrap();
        let b = CpuSet::parse("2-5").unwrap();
        assert_eq!(a.union(&b).to_string(), "0-5");
        assert_eq!(a.intersection(&b).to_string(), "2-3");
        assert_eq!(a.difference(&b).to_string(), "0-1");
        assert!(a.intersection(&b).is_subset(&a));
    }

    #[test]
    fn lowest_takes_smallest_ids() {
        let a = CpuSet::parse("1,3,5,7").unwrap();
        assert_eq!(a.lowest(2).unwrap().to_string(), "1,3");
        assert!(a.lowest(5).is_none());
        assert_eq!(a.lowest(0).unwrap(), CpuSet::new());
    }
}
