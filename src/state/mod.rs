//! Cumulative aggregation state shared by all pipeline workers.
//!
//! Uses `DashMap` for concurrent map access, so workers touching
//! disjoint keys never block each other while updates to the same key
//! serialize on the entry lock. Every value a caller needs for
//! enrichment is computed inside the entry lock that produced it,
//! which makes each returned figure a consistent point-in-time view.

use std::collections::HashSet;

use dashmap::DashMap;

use crate::event::{DeviceType, RawEvent};

/// Per-user cumulative login history.
#[derive(Debug, Default)]
struct UserHistory {
    ips: HashSet<String>,
    locales: HashSet<String>,
}

/// Process-wide aggregates over the full event stream.
///
/// Keys are created lazily on first observation and never deleted
/// during a run. Counters and sets only grow; every mutation is
/// attributable to exactly one accepted event via [`observe`].
///
/// [`observe`]: AggregationState::observe
pub struct AggregationState {
    /// user_id -> distinct IPs and locales seen for that user.
    by_user: DashMap<String, UserHistory>,
    /// app_version -> accepted login count.
    version_logins: DashMap<String, u64>,
    /// locale -> accepted login count.
    locale_logins: DashMap<String, u64>,
    /// device_id -> distinct users seen on that device.
    device_users: DashMap<String, HashSet<String>>,
    /// device type -> accepted login count.
    device_type_logins: DashMap<DeviceType, u64>,
}

/// Point-in-time view of the aggregates relevant to one event,
/// reflecting that event's own updates and everything serialized
/// before them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserveSnapshot {
    /// Distinct IPs seen for the event's user, including this event's.
    pub distinct_ips: usize,
    /// Distinct locales seen for the event's user, including this event's.
    pub distinct_locales: usize,
    /// Accepted logins for the event's app version, including this event.
    pub version_logins: u64,
    /// Accepted logins from the event's locale, including this event.
    pub locale_logins: u64,
    /// Distinct users seen on the event's device, including this event's.
    pub device_users: usize,
    /// Device type with the highest login count so far; ties resolve to
    /// the lexicographically smallest label.
    pub most_common_device_type: DeviceType,
}

impl AggregationState {
    /// Creates empty state. All keys start as empty-set/zero.
    pub fn new() -> Self {
        Self {
            by_user: DashMap::with_capacity(256),
            version_logins: DashMap::with_capacity(16),
            locale_logins: DashMap::with_capacity(64),
            device_users: DashMap::with_capacity(256),
            device_type_logins: DashMap::with_capacity(4),
        }
    }

    /// Applies one accepted event to every aggregate and returns the
    /// resulting snapshot. This is the only mutator.
    ///
    /// `device_type` must already have passed the device filter; the
    /// raw `event.device_type` string is not consulted here.
    pub fn observe(&self, event: &RawEvent, device_type: DeviceType) -> ObserveSnapshot {
        let (distinct_ips, distinct_locales) = {
            let mut user = self.by_user.entry(event.user_id.clone()).or_default();
            user.ips.insert(event.ip.clone());
            user.locales.insert(event.locale.clone());
            (user.ips.len(), user.locales.len())
        };

        let version_logins = {
            let mut count = self
                .version_logins
                .entry(event.app_version.clone())
                .or_insert(0);
            *count += 1;
            *count
        };

        let locale_logins = {
            let mut count = self.locale_logins.entry(event.locale.clone()).or_insert(0);
            *count += 1;
            *count
        };

        let device_users = {
            let mut users = self.device_users.entry(event.device_id.clone()).or_default();
            users.insert(event.user_id.clone());
            users.len()
        };

        {
            let mut count = self.device_type_logins.entry(device_type).or_insert(0);
            *count += 1;
        }
        // The entry guard must be released before iterating the same map.
        let most_common_device_type = self
            .most_common_device_type()
            .unwrap_or(device_type);

        ObserveSnapshot {
            distinct_ips,
            distinct_locales,
            version_logins,
            locale_logins,
            device_users,
            most_common_device_type,
        }
    }

    /// Device type with the maximum login count, smallest label on ties.
    /// `None` until the first event is observed.
    fn most_common_device_type(&self) -> Option<DeviceType> {
        let mut best: Option<(DeviceType, u64)> = None;

        for entry in self.device_type_logins.iter() {
            let (device_type, count) = (*entry.key(), *entry.value());

            best = match best {
                None => Some((device_type, count)),
                Some((_, best_count)) if count > best_count => Some((device_type, count)),
                Some((best_type, best_count))
                    if count == best_count && device_type.as_str() < best_type.as_str() =>
                {
                    Some((device_type, count))
                }
                other => other,
            };
        }

        best.map(|(device_type, _)| device_type)
    }

    /// Number of distinct users observed so far.
    pub fn tracked_users(&self) -> usize {
        self.by_user.len()
    }

    /// Number of distinct devices observed so far.
    pub fn tracked_devices(&self) -> usize {
        self.device_users.len()
    }

    /// Number of distinct app versions observed so far.
    pub fn tracked_versions(&self) -> usize {
        self.version_logins.len()
    }

    /// Number of distinct locales observed so far.
    pub fn tracked_locales(&self) -> usize {
        self.locale_logins.len()
    }
}

impl Default for AggregationState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(user_id: &str, ip: &str, locale: &str, device_id: &str) -> RawEvent {
        RawEvent {
            user_id: user_id.to_string(),
            app_version: "2.3.0".to_string(),
            device_type: "Android".to_string(),
            ip: ip.to_string(),
            locale: locale.to_string(),
            device_id: device_id.to_string(),
            timestamp: "1711302636".to_string(),
        }
    }

    #[test]
    fn test_first_observation_creates_keys() {
        let state = AggregationState::new();
        let snap = state.observe(&event("u1", "1.2.3.4", "NC", "d1"), DeviceType::Android);

        assert_eq!(snap.distinct_ips, 1);
        assert_eq!(snap.distinct_locales, 1);
        assert_eq!(snap.version_logins, 1);
        assert_eq!(snap.locale_logins, 1);
        assert_eq!(snap.device_users, 1);
        assert_eq!(snap.most_common_device_type, DeviceType::Android);
    }

    #[test]
    fn test_distinct_ip_growth_per_user() {
        let state = AggregationState::new();

        state.observe(&event("u1", "1.2.3.4", "NC", "d1"), DeviceType::Android);
        let snap = state.observe(&event("u1", "5.6.7.8", "NC", "d1"), DeviceType::Android);
        assert_eq!(snap.distinct_ips, 2);

        // Repeated IP does not grow the set.
        let snap = state.observe(&event("u1", "5.6.7.8", "NC", "d1"), DeviceType::Android);
        assert_eq!(snap.distinct_ips, 2);

        // A different user has an independent IP set.
        let snap = state.observe(&event("u2", "1.2.3.4", "NC", "d2"), DeviceType::Android);
        assert_eq!(snap.distinct_ips, 1);
    }

    #[test]
    fn test_version_counter_is_sequential() {
        let state = AggregationState::new();

        for expected in 1..=5u64 {
            let snap = state.observe(
                &event(&format!("u{expected}"), "1.1.1.1", "NC", "d1"),
                DeviceType::Android,
            );
            assert_eq!(snap.version_logins, expected);
        }
    }

    #[test]
    fn test_locale_counter_independent_per_locale() {
        let state = AggregationState::new();

        let snap = state.observe(&event("u1", "1.1.1.1", "NC", "d1"), DeviceType::Android);
        assert_eq!(snap.locale_logins, 1);
        let snap = state.observe(&event("u2", "1.1.1.1", "FR", "d2"), DeviceType::Android);
        assert_eq!(snap.locale_logins, 1);
        let snap = state.observe(&event("u3", "1.1.1.1", "NC", "d3"), DeviceType::Android);
        assert_eq!(snap.locale_logins, 2);
    }

    #[test]
    fn test_device_users_tracks_distinct_users() {
        let state = AggregationState::new();

        let snap = state.observe(&event("u1", "1.1.1.1", "NC", "shared"), DeviceType::Android);
        assert_eq!(snap.device_users, 1);
        let snap = state.observe(&event("u1", "1.1.1.1", "NC", "shared"), DeviceType::Android);
        assert_eq!(snap.device_users, 1);
        let snap = state.observe(&event("u2", "1.1.1.1", "NC", "shared"), DeviceType::Android);
        assert_eq!(snap.device_users, 2);
    }

    #[test]
    fn test_distinct_locales_per_user() {
        let state = AggregationState::new();

        let snap = state.observe(&event("u1", "1.1.1.1", "NC", "d1"), DeviceType::Android);
        assert_eq!(snap.distinct_locales, 1);
        let snap = state.observe(&event("u1", "1.1.1.1", "FR", "d1"), DeviceType::Android);
        assert_eq!(snap.distinct_locales, 2);
    }

    #[test]
    fn test_most_common_device_type_tie_breaks_lexicographically() {
        let state = AggregationState::new();

        let snap = state.observe(&event("u1", "1.1.1.1", "NC", "d1"), DeviceType::Ios);
        assert_eq!(snap.most_common_device_type, DeviceType::Ios);

        // One login each: "android" < "ios" wins the tie.
        let snap = state.observe(&event("u2", "1.1.1.1", "NC", "d2"), DeviceType::Android);
        assert_eq!(snap.most_common_device_type, DeviceType::Android);

        // ios pulls ahead again.
        let snap = state.observe(&event("u3", "1.1.1.1", "NC", "d3"), DeviceType::Ios);
        assert_eq!(snap.most_common_device_type, DeviceType::Ios);
    }

    #[test]
    fn test_tracked_cardinalities() {
        let state = AggregationState::new();

        state.observe(&event("u1", "1.1.1.1", "NC", "d1"), DeviceType::Android);
        state.observe(&event("u2", "1.1.1.1", "FR", "d1"), DeviceType::Ios);
        state.observe(&event("u2", "2.2.2.2", "FR", "d2"), DeviceType::Ios);

        assert_eq!(state.tracked_users(), 2);
        assert_eq!(state.tracked_devices(), 2);
        assert_eq!(state.tracked_versions(), 1);
        assert_eq!(state.tracked_locales(), 2);
    }

    #[test]
    fn test_concurrent_observe_same_user() {
        use std::sync::Arc;
        use std::thread;

        let state = Arc::new(AggregationState::new());
        let mut handles = Vec::new();

        // 4 threads each insert 250 distinct IPs for the same user.
        for t in 0..4u32 {
            let state = Arc::clone(&state);
            handles.push(thread::spawn(move || {
                for i in 0..250u32 {
                    state.observe(
                        &event("u1", &format!("10.{t}.{}.{}", i / 256, i % 256), "NC", "d1"),
                        DeviceType::Android,
                    );
                }
            }));
        }

        for h in handles {
            h.join().expect("thread panicked");
        }

        let snap = state.observe(&event("u1", "10.0.0.0", "NC", "d1"), DeviceType::Android);
        // 1000 distinct IPs from the threads; the final observe repeats one.
        assert_eq!(snap.distinct_ips, 1000);
        assert_eq!(snap.version_logins, 1001);
    }

    #[test]
    fn test_concurrent_observe_disjoint_users() {
        use std::sync::Arc;
        use std::thread;

        let state = Arc::new(AggregationState::new());
        let mut handles = Vec::new();

        for t in 0..4u32 {
            let state = Arc::clone(&state);
            handles.push(thread::spawn(move || {
                for i in 0..250u32 {
                    state.observe(
                        &event(&format!("user-{t}"), &format!("10.{t}.0.{i}"), "NC", "d1"),
                        DeviceType::Android,
                    );
                }
            }));
        }

        for h in handles {
            h.join().expect("thread panicked");
        }

        assert_eq!(state.tracked_users(), 4);
        let snap = state.observe(&event("user-0", "10.0.0.0", "NC", "d1"), DeviceType::Android);
        assert_eq!(snap.distinct_ips, 250);
        // All four thread users shared the device.
        assert_eq!(snap.device_users, 4);
    }
}
