//! Core shift model: identity, listing sets and the merge fold shared by
//! the parser, the aggregator and the reconciler.

use std::collections::btree_map::{self, BTreeMap};
use std::collections::BTreeSet;

use chrono::DateTime;
use chrono_tz::Tz;
use serde::Serialize;

pub const CRATE_NAME: &str = "shiftcal-core";

/// Identity of one logical shift. Every listing with the same start instant
/// and label is the same shift.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShiftKey {
    pub start_time: DateTime<Tz>,
    pub label: String,
}

impl ShiftKey {
    pub fn new(start_time: DateTime<Tz>, label: impl Into<String>) -> Self {
        Self {
            start_time,
            label: label.into(),
        }
    }
}

/// A shift plus every signup link that points at it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShiftRecord {
    pub key: ShiftKey,
    pub urls: BTreeSet<String>,
}

impl ShiftRecord {
    pub fn new(key: ShiftKey, urls: impl IntoIterator<Item = String>) -> Self {
        Self {
            key,
            urls: urls.into_iter().collect(),
        }
    }

    pub fn single(key: ShiftKey, url: impl Into<String>) -> Self {
        Self::new(key, [url.into()])
    }
}

/// Flat, serializable view of a record for reports and CLI output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShiftRow {
    pub start_time: String,
    pub label: String,
    pub urls: Vec<String>,
}

impl From<&ShiftRecord> for ShiftRow {
    fn from(record: &ShiftRecord) -> Self {
        Self {
            start_time: record.key.start_time.to_rfc3339(),
            label: record.key.label.clone(),
            urls: record.urls.iter().cloned().collect(),
        }
    }
}

/// Canonical set of shifts keyed by [`ShiftKey`].
///
/// Inserting a key that is already present unions the url sets, so building
/// a set is a fold that gives the same result in any order. The same merge is
/// used inside a day cell, across cells of a page and across pages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShiftSet {
    shifts: BTreeMap<ShiftKey, BTreeSet<String>>,
}

impl ShiftSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_listing(&mut self, key: ShiftKey, url: impl Into<String>) {
        self.shifts.entry(key).or_default().insert(url.into());
    }

    /// Adds a record's links. A record without links is not an available
    /// shift and is dropped, so every stored url set is non-empty.
    pub fn insert(&mut self, record: ShiftRecord) {
        if record.urls.is_empty() {
            return;
        }
        match self.shifts.entry(record.key) {
            btree_map::Entry::Occupied(mut entry) => entry.get_mut().extend(record.urls),
            btree_map::Entry::Vacant(entry) => {
                entry.insert(record.urls);
            }
        }
    }

    /// Union of two sets; associative and commutative.
    pub fn merge(self, other: ShiftSet) -> ShiftSet {
        // Fold the smaller side into the larger one.
        let (mut into, from) = if self.shifts.len() >= other.shifts.len() {
            (self, other)
        } else {
            (other, self)
        };
        for (key, urls) in from.shifts {
            into.shifts.entry(key).or_default().extend(urls);
        }
        into
    }

    pub fn get(&self, key: &ShiftKey) -> Option<&BTreeSet<String>> {
        self.shifts.get(key)
    }

    pub fn contains_key(&self, key: &ShiftKey) -> bool {
        self.shifts.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.shifts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shifts.is_empty()
    }

    /// Total number of signup links across all shifts.
    pub fn listing_count(&self) -> usize {
        self.shifts.values().map(BTreeSet::len).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ShiftKey, &BTreeSet<String>)> {
        self.shifts.iter()
    }

    pub fn records(&self) -> impl Iterator<Item = ShiftRecord> + '_ {
        self.shifts.iter().map(|(key, urls)| ShiftRecord {
            key: key.clone(),
            urls: urls.clone(),
        })
    }

    /// Drops every shift starting before `instant`.
    pub fn retain_from<Z: chrono::TimeZone>(&mut self, instant: &DateTime<Z>) {
        let cutoff = instant.naive_utc();
        self.shifts.retain(|key, _| key.start_time.naive_utc() >= cutoff);
    }
}

impl FromIterator<ShiftRecord> for ShiftSet {
    fn from_iter<I: IntoIterator<Item = ShiftRecord>>(iter: I) -> Self {
        let mut set = ShiftSet::new();
        set.extend(iter);
        set
    }
}

impl Extend<ShiftRecord> for ShiftSet {
    fn extend<I: IntoIterator<Item = ShiftRecord>>(&mut self, iter: I) {
        for record in iter {
            self.insert(record);
        }
    }
}

impl IntoIterator for ShiftSet {
    type Item = ShiftRecord;
    type IntoIter = std::iter::Map<
        btree_map::IntoIter<ShiftKey, BTreeSet<String>>,
        fn((ShiftKey, BTreeSet<String>)) -> ShiftRecord,
    >;

    fn into_iter(self) -> Self::IntoIter {
        self.shifts
            .into_iter()
            .map(into_record as fn((ShiftKey, BTreeSet<String>)) -> ShiftRecord)
    }
}

fn into_record((key, urls): (ShiftKey, BTreeSet<String>)) -> ShiftRecord {
    ShiftRecord { key, urls }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::America::New_York;

    fn key(hour: u32, label: &str) -> ShiftKey {
        ShiftKey::new(
            New_York.with_ymd_and_hms(2026, 10, 20, hour, 0, 0).single().unwrap(),
            label,
        )
    }

    #[test]
    fn same_key_listings_fold_into_one_record() {
        let mut set = ShiftSet::new();
        set.insert_listing(key(6, "Receiving"), "https://coop.test/a");
        set.insert_listing(key(6, "Receiving"), "https://coop.test/b");
        set.insert_listing(key(6, "Receiving"), "https://coop.test/a");

        assert_eq!(set.len(), 1);
        assert_eq!(set.listing_count(), 2);
        let urls: Vec<_> = set.get(&key(6, "Receiving")).unwrap().iter().cloned().collect();
        assert_eq!(urls, vec!["https://coop.test/a", "https://coop.test/b"]);
    }

    #[test]
    fn merge_unions_disjoint_url_subsets() {
        let left: ShiftSet = [ShiftRecord::single(key(9, "Checkout"), "u1")].into_iter().collect();
        let right: ShiftSet = [
            ShiftRecord::single(key(9, "Checkout"), "u2"),
            ShiftRecord::single(key(12, "Food Processing"), "u3"),
        ]
        .into_iter()
        .collect();

        let merged = left.clone().merge(right.clone());
        assert_eq!(merged, right.merge(left));
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.get(&key(9, "Checkout")).unwrap().len(), 2);
    }

    #[test]
    fn records_without_urls_are_not_shifts() {
        let set: ShiftSet = [
            ShiftRecord::new(key(6, "Office"), []),
            ShiftRecord::single(key(9, "Checkout"), "u1"),
            ShiftRecord::new(key(9, "Checkout"), []),
        ]
        .into_iter()
        .collect();

        assert_eq!(set.len(), 1);
        assert!(!set.contains_key(&key(6, "Office")));
        assert!(set.iter().all(|(_, urls)| !urls.is_empty()));
    }

    #[test]
    fn merge_is_associative() {
        let a: ShiftSet = [ShiftRecord::single(key(6, "A"), "1")].into_iter().collect();
        let b: ShiftSet = [ShiftRecord::single(key(6, "A"), "2")].into_iter().collect();
        let c: ShiftSet = [ShiftRecord::single(key(7, "B"), "3")].into_iter().collect();

        let left = a.clone().merge(b.clone()).merge(c.clone());
        let right = a.merge(b.merge(c));
        assert_eq!(left, right);
    }

    #[test]
    fn keys_compare_by_instant_across_zones() {
        let eastern = key(6, "Receiving");
        let utc = ShiftKey::new(
            chrono::Utc
                .with_ymd_and_hms(2026, 10, 20, 10, 0, 0)
                .single()
                .unwrap()
                .with_timezone(&New_York),
            "Receiving",
        );
        assert_eq!(eastern, utc);
    }

    #[test]
    fn retain_from_drops_earlier_shifts() {
        let mut set: ShiftSet = [
            ShiftRecord::single(key(6, "Early"), "1"),
            ShiftRecord::single(key(18, "Late"), "2"),
        ]
        .into_iter()
        .collect();
        set.retain_from(&key(12, "").start_time);
        assert_eq!(set.len(), 1);
        assert!(set.contains_key(&key(18, "Late")));
    }

    #[test]
    fn rows_list_urls_in_stable_order() {
        let record = ShiftRecord::new(key(6, "Receiving"), ["b".to_string(), "a".to_string()]);
        let row = ShiftRow::from(&record);
        assert_eq!(row.urls, vec!["a", "b"]);
        assert_eq!(row.start_time, "2026-10-20T06:00:00-04:00");
    }
}
