//! Enrichment of accepted events and the per-payload pipeline path.
//!
//! Runs one payload through decode, device filtering, timestamp
//! normalization, and state observation, then assembles the output
//! record. Rejections are typed so callers can count and log them
//! without ever letting a bad payload near the aggregates.

use crate::event::decode::{decode_event, normalize_timestamp, DecodeError};
use crate::event::{DeviceType, ProcessedEvent, RawEvent};
use crate::state::{AggregationState, ObserveSnapshot};

/// Why a payload produced no output record.
#[derive(Debug)]
pub enum Rejection {
    /// Unparseable payload or missing/empty required field.
    Malformed(DecodeError),
    /// The timestamp field is not a non-negative epoch-seconds integer.
    InvalidTimestamp(DecodeError),
    /// Valid event for a device type outside the accepted set. Not an
    /// error, but it is counted.
    FilteredOut { device_type: String },
}

impl Rejection {
    /// Stable label used for drop counters.
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::InvalidTimestamp(_) => "invalid_timestamp",
            Self::FilteredOut { .. } => "filtered_out",
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(e) | Self::InvalidTimestamp(e) => write!(f, "{e}"),
            Self::FilteredOut { device_type } => {
                write!(f, "non-mobile device type: {device_type:?}")
            }
        }
    }
}

/// Runs one payload through the full per-event pipeline against the
/// shared state: decode, filter, normalize, observe, enrich.
///
/// No state is mutated unless the event is accepted.
pub fn process_payload(
    payload: &[u8],
    state: &AggregationState,
) -> Result<ProcessedEvent, Rejection> {
    let event = decode_event(payload).map_err(Rejection::Malformed)?;

    let Some(device_type) = DeviceType::from_raw(&event.device_type) else {
        return Err(Rejection::FilteredOut {
            device_type: event.device_type,
        });
    };

    let normalized_timestamp =
        normalize_timestamp(&event.timestamp).map_err(Rejection::InvalidTimestamp)?;

    let snapshot = state.observe(&event, device_type);

    Ok(enrich(&event, device_type, normalized_timestamp, &snapshot))
}

/// Pure assembly of the output record from the event, its normalized
/// timestamp, and the aggregate snapshot taken at observation time.
pub fn enrich(
    event: &RawEvent,
    device_type: DeviceType,
    normalized_timestamp: String,
    snapshot: &ObserveSnapshot,
) -> ProcessedEvent {
    ProcessedEvent {
        user_id: event.user_id.clone(),
        app_version: event.app_version.clone(),
        total_logins_for_version: snapshot.version_logins,
        ip: event.ip.clone(),
        suspicious_login: suspicious_login(snapshot),
        logs_from_multiple_locations: logs_from_multiple_locations(snapshot),
        normalized_timestamp,
        locale: event.locale.clone(),
        total_logins_from_locale: snapshot.locale_logins,
        device_id: event.device_id.clone(),
        shared_device: shared_device(snapshot),
        device_type: device_type.as_str().to_string(),
        most_common_device_type: snapshot.most_common_device_type.as_str().to_string(),
    }
}

/// The user has logged in from more than one distinct IP.
pub fn suspicious_login(snapshot: &ObserveSnapshot) -> bool {
    snapshot.distinct_ips > 1
}

/// More than one distinct user has logged in on the device.
pub fn shared_device(snapshot: &ObserveSnapshot) -> bool {
    snapshot.device_users > 1
}

/// The user has logged in from more than one distinct locale.
pub fn logs_from_multiple_locations(snapshot: &ObserveSnapshot) -> bool {
    snapshot.distinct_locales > 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(user_id: &str, device_type: &str, ip: &str, timestamp: &str) -> Vec<u8> {
        serde_json::json!({
            "user_id": user_id,
            "app_version": "2.3.0",
            "device_type": device_type,
            "ip": ip,
            "locale": "NC",
            "device_id": "d1",
            "timestamp": timestamp,
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn test_accepted_event_is_enriched() {
        let state = AggregationState::new();
        let processed = process_payload(&payload("u1", "Android", "1.2.3.4", "1711302636"), &state)
            .expect("accepted");

        assert_eq!(processed.user_id, "u1");
        assert_eq!(processed.total_logins_for_version, 1);
        assert!(!processed.suspicious_login);
        assert!(!processed.shared_device);
        assert!(!processed.logs_from_multiple_locations);
        assert_eq!(processed.normalized_timestamp, "2024-03-24 17:50:36");
        assert_eq!(processed.device_type, "android");
        assert_eq!(processed.most_common_device_type, "android");
    }

    #[test]
    fn test_second_ip_flags_suspicious_login() {
        let state = AggregationState::new();

        process_payload(&payload("u1", "Android", "1.2.3.4", "1711302636"), &state)
            .expect("accepted");
        let processed = process_payload(&payload("u1", "Android", "5.6.7.8", "1711302636"), &state)
            .expect("accepted");

        assert!(processed.suspicious_login);
        assert_eq!(processed.total_logins_for_version, 2);
    }

    #[test]
    fn test_filtered_device_leaves_state_untouched() {
        let state = AggregationState::new();

        let err = process_payload(&payload("u1", "Desktop", "1.2.3.4", "1711302636"), &state)
            .unwrap_err();
        assert!(matches!(err, Rejection::FilteredOut { .. }));
        assert_eq!(err.reason(), "filtered_out");
        assert_eq!(state.tracked_users(), 0);

        // The next accepted event sees pristine counters.
        let processed = process_payload(&payload("u1", "ios", "1.2.3.4", "1711302636"), &state)
            .expect("accepted");
        assert_eq!(processed.total_logins_for_version, 1);
    }

    #[test]
    fn test_invalid_timestamp_leaves_state_untouched() {
        let state = AggregationState::new();

        let err = process_payload(&payload("u1", "Android", "1.2.3.4", "not-a-number"), &state)
            .unwrap_err();
        assert!(matches!(err, Rejection::InvalidTimestamp(_)));
        assert_eq!(err.reason(), "invalid_timestamp");
        assert_eq!(state.tracked_users(), 0);
    }

    #[test]
    fn test_malformed_payload_is_rejected() {
        let state = AggregationState::new();

        let err = process_payload(b"{\"user_id\": \"u1\"}", &state).unwrap_err();
        assert!(matches!(err, Rejection::Malformed(_)));
        assert_eq!(err.reason(), "malformed");
    }

    #[test]
    fn test_shared_device_flag() {
        let state = AggregationState::new();

        process_payload(&payload("u1", "Android", "1.2.3.4", "1711302636"), &state)
            .expect("accepted");
        let processed = process_payload(&payload("u2", "Android", "9.9.9.9", "1711302636"), &state)
            .expect("accepted");

        assert!(processed.shared_device);
    }
}
