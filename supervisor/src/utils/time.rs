use std::time::{Duration, SystemTime};

/// Seconds since the unix epoch for `time`, saturating at zero for times
/// before the epoch.
pub fn unix_timestamp(time: SystemTime) -> i64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Inverse of [`unix_timestamp`].
pub fn system_time_from_unix(secs: i64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64)
}

/// Current wall-clock time as seconds since the unix epoch.
pub fn now_unix_timestamp() -> i64 {
    unix_timestamp(SystemTime::now())
}

/// Current wall-clock time as an RFC 3339 string, for human-facing
/// observability records.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
