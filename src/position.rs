//! Position Sets
//!
//! A position set records which transactions have been applied, as a set of
//! closed intervals of transaction numbers per originating source. It is the
//! watermark used to decide when a joining member has caught up.
//!
//! Text form: `uuid:1-5:7,uuid2:1-3`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Closed interval of transaction numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Interval {
    pub start: u64,
    pub end: u64,
}

/// Set of applied transactions, grouped by source
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionSet {
    /// Sorted, disjoint, non-adjacent intervals per source
    sources: BTreeMap<Uuid, Vec<Interval>>,
}

impl PositionSet {
    /// Create an empty position set
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if no transaction is recorded
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Number of transactions recorded in the set
    pub fn count(&self) -> u64 {
        self.sources
            .values()
            .flat_map(|intervals| intervals.iter())
            .map(|i| i.end - i.start + 1)
            .sum()
    }

    /// Add a single transaction
    pub fn add(&mut self, source: Uuid, number: u64) {
        self.add_interval(source, number, number);
    }

    /// Add a closed interval of transactions, merging with existing ranges
    pub fn add_interval(&mut self, source: Uuid, start: u64, end: u64) {
        if start == 0 || end < start {
            return;
        }

        let intervals = self.sources.entry(source).or_default();
        let mut merged = Interval { start, end };
        let mut kept = Vec::with_capacity(intervals.len() + 1);

        for current in intervals.drain(..) {
            // Overlapping or adjacent ranges collapse into one
            if current.end.saturating_add(1) < merged.start || merged.end.saturating_add(1) < current.start {
                kept.push(current);
            } else {
                merged.start = merged.start.min(current.start);
                merged.end = merged.end.max(current.end);
            }
        }

        kept.push(merged);
        kept.sort();
        *intervals = kept;
    }

    /// Check if a single transaction is part of the set
    pub fn contains(&self, source: &Uuid, number: u64) -> bool {
        self.sources
            .get(source)
            .map(|intervals| intervals.iter().any(|i| i.start <= number && number <= i.end))
            .unwrap_or(false)
    }

    /// Check if every transaction of `other` is also part of this set
    pub fn is_superset_of(&self, other: &PositionSet) -> bool {
        other.sources.iter().all(|(source, wanted)| {
            let Some(have) = self.sources.get(source) else {
                return false;
            };
            wanted.iter().all(|w| {
                have.iter().any(|h| h.start <= w.start && w.end <= h.end)
            })
        })
    }

    /// Merge every transaction of `other` into this set
    pub fn union(&mut self, other: &PositionSet) {
        for (source, intervals) in &other.sources {
            for interval in intervals {
                self.add_interval(*source, interval.start, interval.end);
            }
        }
    }
}

impl fmt::Display for PositionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (source, intervals) in &self.sources {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            write!(f, "{}", source)?;
            for interval in intervals {
                if interval.start == interval.end {
                    write!(f, ":{}", interval.start)?;
                } else {
                    write!(f, ":{}-{}", interval.start, interval.end)?;
                }
            }
        }
        Ok(())
    }
}

impl FromStr for PositionSet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidPositionSet {
            input: s.to_string(),
            reason: reason.to_string(),
        };

        let mut set = PositionSet::new();
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Ok(set);
        }

        for part in trimmed.split(',') {
            let mut fields = part.trim().split(':');
            let source = fields
                .next()
                .and_then(|u| Uuid::parse_str(u.trim()).ok())
                .ok_or_else(|| invalid("expected a source uuid"))?;

            let mut saw_interval = false;
            for range in fields {
                let (start, end) = match range.split_once('-') {
                    Some((a, b)) => (a.trim().parse::<u64>(), b.trim().parse::<u64>()),
                    None => (range.trim().parse::<u64>(), range.trim().parse::<u64>()),
                };
                let (start, end) = match (start, end) {
                    (Ok(a), Ok(b)) => (a, b),
                    _ => return Err(invalid("interval bounds must be integers")),
                };
                if start == 0 || end < start {
                    return Err(invalid("interval must satisfy 1 <= start <= end"));
                }
                set.add_interval(source, start, end);
                saw_interval = true;
            }

            if !saw_interval {
                return Err(invalid("source has no intervals"));
            }
        }

        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";
    const B: &str = "8a94f357-aab4-11df-86ab-c80aa9429562";

    #[test]
    fn test_parse_and_display() {
        let text = format!("{}:1-5:7,{}:1-3", A, B);
        let set: PositionSet = text.parse().unwrap();
        assert_eq!(set.to_string(), text);
        assert_eq!(set.count(), 9);
    }

    #[test]
    fn test_adjacent_intervals_merge() {
        let source = Uuid::parse_str(A).unwrap();
        let mut set = PositionSet::new();
        set.add_interval(source, 1, 3);
        set.add_interval(source, 7, 9);
        set.add_interval(source, 4, 6);
        assert_eq!(set.to_string(), format!("{}:1-9", A));
        assert!(set.contains(&source, 5));
        assert!(!set.contains(&source, 10));
        assert!(!set.contains(&Uuid::parse_str(B).unwrap(), 5));
    }

    #[test]
    fn test_superset() {
        let applied: PositionSet = format!("{}:1-100,{}:1-20", A, B).parse().unwrap();
        let target: PositionSet = format!("{}:10-50", A).parse().unwrap();
        assert!(applied.is_superset_of(&target));
        assert!(!target.is_superset_of(&applied));

        let missing: PositionSet = format!("{}:90-101", A).parse().unwrap();
        assert!(!applied.is_superset_of(&missing));
        assert!(applied.is_superset_of(&PositionSet::new()));
    }

    #[test]
    fn test_rejects_malformed() {
        assert!("not-a-uuid:1-2".parse::<PositionSet>().is_err());
        assert!(format!("{}:5-2", A).parse::<PositionSet>().is_err());
        assert!(format!("{}", A).parse::<PositionSet>().is_err());
        assert!(format!("{}:x", A).parse::<PositionSet>().is_err());
        assert!("".parse::<PositionSet>().unwrap().is_empty());
    }
}
