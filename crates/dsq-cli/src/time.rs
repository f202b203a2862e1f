//! Relative and absolute time range arguments
//!
//! Accepts `now`, `now-<N><unit>` with unit `s`, `m`, `h`, `d` or `w`, an
//! RFC 3339 timestamp, or epoch milliseconds.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use dsq_core::{RawTimeRange, TimeRange, LIVE_RANGE_SENTINEL};

/// Resolve one time argument against `now`
pub fn parse_time(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let input = input.trim();
    if input == LIVE_RANGE_SENTINEL {
        return Ok(now);
    }

    if let Some(offset) = input.strip_prefix("now-") {
        return Ok(now - parse_span(offset)?);
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
        return Ok(ts.with_timezone(&Utc));
    }

    let millis: i64 = input
        .parse()
        .with_context(|| format!("Invalid time '{}'", input))?;
    Utc.timestamp_millis_opt(millis)
        .single()
        .with_context(|| format!("Timestamp out of range: {}", millis))
}

fn parse_span(span: &str) -> Result<Duration> {
    let split = span
        .find(|c: char| !c.is_ascii_digit())
        .with_context(|| format!("Missing unit in '{}'", span))?;
    let (amount, unit) = span.split_at(split);
    let amount: i64 = amount
        .parse()
        .with_context(|| format!("Invalid amount in '{}'", span))?;

    Ok(match unit {
        "s" => Duration::seconds(amount),
        "m" => Duration::minutes(amount),
        "h" => Duration::hours(amount),
        "d" => Duration::days(amount),
        "w" => Duration::weeks(amount),
        other => bail!("Unknown time unit '{}'", other),
    })
}

/// Build a request range, keeping the arguments as the raw bounds
pub fn build_range(from: &str, to: &str, now: DateTime<Utc>) -> Result<TimeRange> {
    let range = TimeRange {
        from: parse_time(from, now)?,
        to: parse_time(to, now)?,
        raw: RawTimeRange {
            from: from.trim().to_string(),
            to: to.trim().to_string(),
        },
    };
    if range.from > range.to {
        bail!("Time range starts after it ends: {} > {}", from, to);
    }
    Ok(range)
}
