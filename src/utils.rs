/// Utility functions for timestamps and formatting
use time::macros::format_description;
use time::OffsetDateTime;

/// Current host time as milliseconds since the Unix epoch
///
/// All sensor timestamps are host-side; there is no clock sync with the devices.
pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Convert epoch milliseconds into a UTC `OffsetDateTime`
///
/// Out-of-range values clamp to the Unix epoch rather than failing.
pub fn millis_to_datetime(millis: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(millis as i128 * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

/// Convert a UTC `OffsetDateTime` back into epoch milliseconds
pub fn datetime_to_millis(dt: OffsetDateTime) -> i64 {
    (dt.unix_timestamp_nanos() / 1_000_000) as i64
}

/// Format a timestamp for human-readable logging
///
/// Converts an OffsetDateTime to DD.MM.YYYY - HH:MM:SS format
/// Falls back to default string representation if formatting fails.
pub fn format_datetime(dt: &OffsetDateTime) -> String {
    let format = format_description!("[day].[month].[year] - [hour]:[minute]:[second]");
    dt.format(&format).unwrap_or_else(|_| dt.to_string())
}

/// Format epoch milliseconds as `yyyy-MM-dd HH:mm` (UTC), the CSV export date column
pub fn format_export_date(millis: i64) -> String {
    let dt = millis_to_datetime(millis);
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]");
    dt.format(&format).unwrap_or_else(|_| dt.to_string())
}

/// Format epoch milliseconds as ISO-8601 UTC with millisecond precision
///
/// Produces `yyyy-MM-ddTHH:mm:ss.SSSZ`, the form TCX readers expect.
pub fn format_iso_millis(millis: i64) -> String {
    let dt = millis_to_datetime(millis);
    let format = format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z"
    );
    dt.format(&format).unwrap_or_else(|_| dt.to_string())
}

/// Format a second count as `MM:SS` (or `H:MM:SS` past an hour) for log output
pub fn format_elapsed(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{:02}:{:02}", minutes, secs)
    }
}
