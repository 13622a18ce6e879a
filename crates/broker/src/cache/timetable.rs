//! Next-check timetable for per-collection periodic work
//!
//! Both the cache sweep and the interval check keep one. Check times that
//! fall within a minute of an already scheduled check are merged onto it so
//! nearby collections are handled in one pass.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use crate::models::CollectionId;

/// Checks closer than this are merged
const COALESCE_WINDOW_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    interval_minutes: i64,
    next: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct CollectionTimetable {
    minimum_interval_minutes: i64,
    entries: BTreeMap<CollectionId, Entry>,
}

impl CollectionTimetable {
    pub fn new(minimum_interval_minutes: u32) -> Self {
        Self {
            minimum_interval_minutes: minimum_interval_minutes as i64,
            entries: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, collection: CollectionId) -> bool {
        self.entries.contains_key(&collection)
    }

    /// Scheduled check time of a collection
    pub fn next_check(&self, collection: CollectionId) -> Option<DateTime<Utc>> {
        self.entries.get(&collection).map(|e| e.next)
    }

    /// Earliest scheduled check
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.entries.values().map(|e| e.next).min()
    }

    /// (Re)schedule a collection one interval after `now`
    pub fn schedule(&mut self, collection: CollectionId, interval_minutes: i32, now: DateTime<Utc>) {
        let interval_minutes = (interval_minutes as i64).max(self.minimum_interval_minutes).max(1);
        let next = self.coalesce(now + Duration::minutes(interval_minutes), collection);
        self.entries.insert(
            collection,
            Entry {
                interval_minutes,
                next,
            },
        );
    }

    pub fn remove(&mut self, collection: CollectionId) -> bool {
        self.entries.remove(&collection).is_some()
    }

    /// Sync the timetable with the current set of `(collection, interval)`.
    /// Unchanged entries keep their check time.
    pub fn rebuild(
        &mut self,
        wanted: impl IntoIterator<Item = (CollectionId, i32)>,
        now: DateTime<Utc>,
    ) {
        let wanted: BTreeMap<CollectionId, i32> = wanted.into_iter().collect();
        self.entries.retain(|id, _| wanted.contains_key(id));
        for (id, interval) in wanted {
            let floored = (interval as i64).max(self.minimum_interval_minutes).max(1);
            if self
                .entries
                .get(&id)
                .is_none_or(|e| e.interval_minutes != floored)
            {
                self.schedule(id, interval, now);
            }
        }
    }

    /// Collections whose check is due; each is rescheduled one interval on
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Vec<CollectionId> {
        let due: Vec<(CollectionId, i64)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.next <= now)
            .map(|(id, e)| (*id, e.interval_minutes))
            .collect();
        for (id, interval) in &due {
            self.schedule(*id, *interval as i32, now);
        }
        due.into_iter().map(|(id, _)| id).collect()
    }

    fn coalesce(&self, at: DateTime<Utc>, exclude: CollectionId) -> DateTime<Utc> {
        self.entries
            .iter()
            .filter(|(id, _)| **id != exclude)
            .map(|(_, e)| e.next)
            .filter(|next| (*next - at).num_seconds().abs() < COALESCE_WINDOW_SECS)
            .min()
            .unwrap_or(at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_minimum_interval_applies() {
        let mut table = CollectionTimetable::new(5);
        table.schedule(CollectionId(1), 1, t0());
        assert_eq!(table.next_check(CollectionId(1)), Some(t0() + Duration::minutes(5)));
    }

    #[test]
    fn test_nearby_checks_coalesce() {
        let mut table = CollectionTimetable::new(1);
        table.schedule(CollectionId(1), 10, t0());
        table.schedule(CollectionId(2), 10, t0() + Duration::seconds(30));
        assert_eq!(
            table.next_check(CollectionId(2)),
            table.next_check(CollectionId(1))
        );

        table.schedule(CollectionId(3), 10, t0() + Duration::minutes(3));
        assert_eq!(
            table.next_check(CollectionId(3)),
            Some(t0() + Duration::minutes(13))
        );
    }

    #[test]
    fn test_take_due_reschedules() {
        let mut table = CollectionTimetable::new(1);
        table.schedule(CollectionId(1), 5, t0());
        table.schedule(CollectionId(2), 60, t0());

        assert!(table.take_due(t0() + Duration::minutes(4)).is_empty());
        let now = t0() + Duration::minutes(5);
        assert_eq!(table.take_due(now), vec![CollectionId(1)]);
        assert_eq!(table.next_check(CollectionId(1)), Some(now + Duration::minutes(5)));
        assert_eq!(table.next_due(), Some(now + Duration::minutes(5)));
    }

    #[test]
    fn test_rebuild_keeps_unchanged_entries() {
        let mut table = CollectionTimetable::new(1);
        table.rebuild([(CollectionId(1), 10), (CollectionId(2), 20)], t0());
        let later = t0() + Duration::minutes(2);
        table.rebuild([(CollectionId(1), 10), (CollectionId(3), 10)], later);

        assert_eq!(table.len(), 2);
        assert!(!table.contains(CollectionId(2)));
        assert_eq!(
            table.next_check(CollectionId(1)),
            Some(t0() + Duration::minutes(10))
        );
        assert_eq!(
            table.next_check(CollectionId(3)),
            Some(later + Duration::minutes(10))
        );
    }
}
