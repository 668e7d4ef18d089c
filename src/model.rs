//! Shared data model (spec §3): account/instance identifiers, the
//! subscribe-lock value type, and the tagged synchronization-packet
//! envelope with per-type payload variants (§9 redesign: replace the
//! original's dynamic dict with a tagged enum that tolerates unknown
//! types).

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub type AccountId = String;

/// (accountId, instanceNumber, host) — a single server-side replica of
/// an account's session.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    pub account_id: AccountId,
    pub instance_number: u32,
    pub host: Option<String>,
}

impl InstanceKey {
    pub fn new(account_id: impl Into<AccountId>, instance_number: u32, host: Option<String>) -> Self {
        Self {
            account_id: account_id.into(),
            instance_number,
            host,
        }
    }

    /// The `accountId:instanceNumber` prefix that keys the subscription
    /// supervisor and synchronization throttler (those don't key on host).
    pub fn prefix(&self) -> InstancePrefix {
        InstancePrefix {
            account_id: self.account_id.clone(),
            instance_number: self.instance_number,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InstancePrefix {
    pub account_id: AccountId,
    pub instance_number: u32,
}

impl std::fmt::Display for InstancePrefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.account_id, self.instance_number)
    }
}

/// A client-side cooldown derived from a server rate-limit response
/// (spec §3 SubscribeLock).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubscribeLock {
    /// Pool-wide lock set on `LIMIT_ACCOUNT_SUBSCRIPTIONS_PER_USER`.
    Global {
        recommended_retry_time: SystemTime,
        locked_at_accounts: usize,
        locked_at_time: SystemTime,
    },
    /// Per-socket lock set on the `…_PER_SERVER` / `…_PER_USER_PER_SERVER` kinds.
    PerSocket {
        kind: crate::error::RateLimitKind,
        recommended_retry_time: SystemTime,
        locked_at_accounts: usize,
    },
}

/// Parses an ISO-8601 timestamp (millisecond precision, `Z` suffix) the
/// way the gateway emits them. Kept as an explicit function rather than
/// the original's regex-based heuristic (§9 redesign flag).
pub fn parse_timestamp(raw: &str) -> Option<SystemTime> {
    // Format: YYYY-MM-DDTHH:MM:SS.sssZ
    let raw = raw.strip_suffix('Z')?;
    let (date, time) = raw.split_once('T')?;
    let mut date_parts = date.split('-');
    let year: i64 = date_parts.next()?.parse().ok()?;
    let month: i64 = date_parts.next()?.parse().ok()?;
    let day: i64 = date_parts.next()?.parse().ok()?;

    let (hms, millis) = match time.split_once('.') {
        Some((hms, millis)) => (hms, millis.parse::<u64>().ok()?),
        None => (time, 0),
    };
    let mut time_parts = hms.split(':');
    let hour: i64 = time_parts.next()?.parse().ok()?;
    let minute: i64 = time_parts.next()?.parse().ok()?;
    let second: i64 = time_parts.next()?.parse().ok()?;

    let days = days_from_civil(year, month, day);
    let secs = days * 86_400 + hour * 3600 + minute * 60 + second;
    let epoch_secs = u64::try_from(secs).ok()?;
    Some(UNIX_EPOCH + Duration::new(epoch_secs, 0) + Duration::from_millis(millis))
}

/// Formats a [`SystemTime`] back into the same ISO-8601 shape
/// `parse_timestamp` accepts, so round-tripping a date field is the
/// identity transform (spec §8 round-trip law).
pub fn format_timestamp(time: SystemTime) -> String {
    let dur = time.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
    let total_secs = dur.as_secs() as i64;
    let millis = dur.subsec_millis();
    let days = total_secs.div_euclid(86_400);
    let secs_of_day = total_secs.rem_euclid(86_400);
    let (year, month, day) = civil_from_days(days);
    let hour = secs_of_day / 3600;
    let minute = (secs_of_day % 3600) / 60;
    let second = secs_of_day % 60;
    format!("{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{millis:03}Z")
}

// Howard Hinnant's civil_from_days / days_from_civil algorithm — a
// dependency-free proleptic Gregorian calendar conversion.
fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = (m + 9) % 12;
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

fn civil_from_days(z: i64) -> (i64, i64, i64) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    (if m <= 2 { y + 1 } else { y }, m, d)
}

/// Outbound RPC request envelope (§6).
#[derive(Clone, Debug, Serialize)]
pub struct RequestEnvelope {
    #[serde(rename = "accountId")]
    pub account_id: AccountId,
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(rename = "type")]
    pub request_type: String,
    pub application: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Inbound event envelope (§6): a common header plus an untyped payload
/// tail, with a dispatch-table-friendly `kind` classification.
#[derive(Clone, Debug, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(rename = "accountId")]
    pub account_id: AccountId,
    #[serde(rename = "instanceIndex", default)]
    pub instance_index: Option<u32>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(rename = "sequenceNumber", default)]
    pub sequence_number: Option<u64>,
    #[serde(rename = "synchronizationId", default)]
    pub synchronization_id: Option<String>,
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl EventEnvelope {
    pub fn instance_index(&self) -> u32 {
        self.instance_index.unwrap_or(0)
    }

    pub fn is_noop(&self) -> bool {
        self.event_type == "noop"
    }

    pub fn mark_noop(&mut self) {
        self.event_type = "noop".to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_round_trips() {
        let samples = [
            "2024-01-01T00:00:00.000Z",
            "2023-12-31T23:59:59.999Z",
            "2020-02-29T12:34:56.789Z",
            "1999-07-04T05:06:07.000Z",
        ];
        for raw in samples {
            let parsed = parse_timestamp(raw).expect("parse");
            assert_eq!(format_timestamp(parsed), raw, "round trip for {raw}");
        }
    }

    #[test]
    fn rejects_non_iso_strings() {
        assert!(parse_timestamp("not a date").is_none());
        assert!(parse_timestamp("EURUSD").is_none());
    }
}
