//! Decoding and validation of raw topic payloads.
//!
//! Turns a byte payload into a typed [`RawEvent`] or a typed failure.
//! A payload that fails here never reaches aggregation state; the
//! caller counts and logs it and continues with the next payload.

use chrono::DateTime;
use thiserror::Error;

use super::RawEvent;

/// Errors that can occur while decoding a payload.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {source}")]
    Malformed {
        #[source]
        source: serde_json::Error,
    },

    #[error("missing or empty field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid timestamp: {raw:?}")]
    InvalidTimestamp { raw: String },
}

/// Parse a raw payload into a [`RawEvent`].
///
/// Fails when the payload is not valid JSON for the expected schema or
/// when any required field is empty. The timestamp value is validated
/// separately by [`normalize_timestamp`].
pub fn decode_event(payload: &[u8]) -> Result<RawEvent, DecodeError> {
    let event: RawEvent =
        serde_json::from_slice(payload).map_err(|source| DecodeError::Malformed { source })?;

    for (field, value) in [
        ("user_id", &event.user_id),
        ("app_version", &event.app_version),
        ("device_type", &event.device_type),
        ("ip", &event.ip),
        ("locale", &event.locale),
        ("device_id", &event.device_id),
        ("timestamp", &event.timestamp),
    ] {
        if value.is_empty() {
            return Err(DecodeError::MissingField { field });
        }
    }

    Ok(event)
}

/// Convert an epoch-seconds string to `YYYY-MM-DD HH:MM:SS` in UTC.
///
/// Fails for negative, non-numeric, or out-of-range input without any
/// side effects, so a bad timestamp never leaves partial state behind.
pub fn normalize_timestamp(raw: &str) -> Result<String, DecodeError> {
    let secs: i64 = raw.parse().map_err(|_| DecodeError::InvalidTimestamp {
        raw: raw.to_string(),
    })?;

    if secs < 0 {
        return Err(DecodeError::InvalidTimestamp {
            raw: raw.to_string(),
        });
    }

    let dt = DateTime::from_timestamp(secs, 0).ok_or_else(|| DecodeError::InvalidTimestamp {
        raw: raw.to_string(),
    })?;

    Ok(dt.format("%Y-%m-%d %H:%M:%S").to_string())
}
