//! Quota header parsing for the common upstream conventions.
//!
//! | Format | limit | remaining | reset |
//! |--------|-------|-----------|-------|
//! | `OpenAi` | `x-ratelimit-limit-requests` | `x-ratelimit-remaining-requests` | `x-ratelimit-reset-requests` (`"6m0s"`) |
//! | `Anthropic` | `anthropic-ratelimit-requests-limit` | `...-remaining` | `...-reset` (RFC 3339) |
//! | `Generic` | `x-ratelimit-limit` | `x-ratelimit-remaining` | `x-ratelimit-reset` (seconds or epoch) |

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::runtime::checked_after;

/// Reset values above this are unix timestamps rather than deltas.
const EPOCH_THRESHOLD_SECS: f64 = 1_000_000_000.0;

/// Header naming convention used by an upstream.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderFormat {
    /// Try every known format in turn.
    #[default]
    Auto,
    OpenAi,
    Anthropic,
    Generic,
}

impl HeaderFormat {
    const CONCRETE: [HeaderFormat; 3] = [Self::OpenAi, Self::Anthropic, Self::Generic];

    fn names(self) -> Option<(&'static str, &'static str, &'static str)> {
        match self {
            Self::Auto => None,
            Self::OpenAi => Some((
                "x-ratelimit-limit-requests",
                "x-ratelimit-remaining-requests",
                "x-ratelimit-reset-requests",
            )),
            Self::Anthropic => Some((
                "anthropic-ratelimit-requests-limit",
                "anthropic-ratelimit-requests-remaining",
                "anthropic-ratelimit-requests-reset",
            )),
            Self::Generic => Some((
                "x-ratelimit-limit",
                "x-ratelimit-remaining",
                "x-ratelimit-reset",
            )),
        }
    }

    fn parse_reset(self, raw: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Auto => None,
            Self::OpenAi => parse_compound_duration(raw).and_then(|d| checked_after(now, d)),
            Self::Anthropic => DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|t| t.with_timezone(&Utc)),
            Self::Generic => {
                let secs: f64 = raw.parse().ok()?;
                if !secs.is_finite() || secs < 0.0 {
                    return None;
                }
                if secs > EPOCH_THRESHOLD_SECS {
                    Utc.timestamp_opt(secs as i64, 0).single()
                } else {
                    checked_after(now, Duration::from_secs_f64(secs))
                }
            }
        }
    }
}

/// Quota figures read from one response.
#[derive(Clone, Debug, PartialEq)]
pub struct QuotaHeaders {
    pub limit: u64,
    pub remaining: u64,
    pub reset_time: DateTime<Utc>,
    /// The concrete format that matched.
    pub format: HeaderFormat,
}

/// Everything useful found in a header map.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedHeaders {
    pub quota: Option<QuotaHeaders>,
    pub retry_after: Option<Duration>,
}

impl ParsedHeaders {
    pub fn is_empty(&self) -> bool {
        self.quota.is_none() && self.retry_after.is_none()
    }
}

/// Parse quota and retry-after headers. Unknown or malformed input yields an
/// empty result, never an error.
pub fn parse_headers(
    format: HeaderFormat,
    headers: &HashMap<String, String>,
    now: DateTime<Utc>,
) -> ParsedHeaders {
    let lowered: HashMap<String, &str> = headers
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.trim()))
        .collect();

    let quota = match format {
        HeaderFormat::Auto => HeaderFormat::CONCRETE
            .iter()
            .find_map(|candidate| parse_quota(*candidate, &lowered, now)),
        concrete => parse_quota(concrete, &lowered, now),
    };

    let retry_after = lowered
        .get("retry-after")
        .and_then(|raw| parse_retry_after(raw, now));

    ParsedHeaders { quota, retry_after }
}

fn parse_quota(
    format: HeaderFormat,
    headers: &HashMap<String, &str>,
    now: DateTime<Utc>,
) -> Option<QuotaHeaders> {
    let (limit_name, remaining_name, reset_name) = format.names()?;
    let limit: u64 = headers.get(limit_name)?.parse().ok()?;
    let remaining: u64 = headers.get(remaining_name)?.parse().ok()?;
    let reset_time = format.parse_reset(headers.get(reset_name)?, now)?;

    if limit == 0 {
        return None;
    }

    Some(QuotaHeaders {
        limit,
        remaining: remaining.min(limit),
        reset_time,
        format,
    })
}

/// `Retry-After` as seconds, or as an HTTP date. Waits that would end past
/// the last representable instant are rejected.
fn parse_retry_after(raw: &str, now: DateTime<Utc>) -> Option<Duration> {
    if let Ok(secs) = raw.parse::<f64>() {
        return Duration::try_from_secs_f64(secs)
            .ok()
            .filter(|wait| checked_after(now, *wait).is_some());
    }

    DateTime::parse_from_rfc2822(raw)
        .ok()
        .and_then(|at| (at.with_timezone(&Utc) - now).to_std().ok())
}

/// Parse durations like `"1s"`, `"20ms"`, `"6m0s"` or `"1h2m3.5s"`.
pub(crate) fn parse_compound_duration(raw: &str) -> Option<Duration> {
    let mut total_ms = 0.0_f64;
    let mut rest = raw.trim();
    if rest.is_empty() {
        return None;
    }

    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return None;
        }
        let value: f64 = rest[..number_len].parse().ok()?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let ms_per_unit = match &rest[..unit_len] {
            "h" => 3_600_000.0,
            "m" => 60_000.0,
            "s" => 1_000.0,
            "ms" => 1.0,
            _ => return None,
        };
        rest = &rest[unit_len..];
        total_ms += value * ms_per_unit;
    }

    if !total_ms.is_finite() || total_ms >= u64::MAX as f64 {
        return None;
    }
    Some(Duration::from_millis(total_ms.round() as u64))
}
