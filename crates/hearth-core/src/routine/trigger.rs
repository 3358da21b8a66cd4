// ── Trigger and interval parsing ──
//
// A routine's `triggers` field is a comma-separated list where each token
// is one of: an ISO-8601 datetime (contains 'T'), a local time of day
// (`HH:MM[:SS[.frac]]`), or -- when neither parses -- an action type the
// routine binds to reactively.

use chrono::{Duration, NaiveDateTime, Timelike};

/// One parsed trigger token.
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    /// Run at this local instant (past instants fire immediately).
    At(NaiveDateTime),
    /// Fire whenever a message with this action type arrives.
    Action(String),
}

/// Parse a single trigger token relative to `now`.
pub fn parse_trigger(token: &str, now: NaiveDateTime) -> Trigger {
    let token = token.trim();

    if token.contains('T') {
        // ISO datetime; scheduled exactly once, even if already past.
        return match token.parse::<NaiveDateTime>() {
            Ok(at) => Trigger::At(at),
            Err(_) => Trigger::Action(token.to_owned()),
        };
    }

    match parse_time_of_day(token, now) {
        Some(at) => Trigger::At(at),
        None => Trigger::Action(token.to_owned()),
    }
}

/// `HH:MM[:SS[.frac]]` → today at that time, or tomorrow if it has
/// already passed.
fn parse_time_of_day(token: &str, now: NaiveDateTime) -> Option<NaiveDateTime> {
    let parts: Vec<&str> = token.split(':').collect();
    if parts.len() != 2 && parts.len() != 3 {
        return None;
    }

    let hours = parts[0].trim().parse::<f64>().ok()?;
    let minutes = parts[1].trim().parse::<f64>().ok()?;
    let seconds = if parts.len() == 3 {
        parts[2].trim().parse::<f64>().ok()?
    } else {
        0.0
    };
    if hours < 0.0 || minutes < 0.0 || seconds < 0.0 {
        return None;
    }

    let micros = (seconds.fract() * 1_000_000.0).round() as u32;
    let mut at = now
        .date()
        .and_hms_micro_opt(hours as u32, minutes as u32, seconds as u32, micros)?;

    if at <= now {
        at += Duration::days(1);
    }
    Some(at)
}

/// Parse a repeat interval in `H:M:S` form.
pub fn parse_interval(spec: &str) -> Option<Duration> {
    let parts: Vec<&str> = spec.trim().split(':').collect();
    if parts.len() != 3 {
        return None;
    }
    let hours = parts[0].trim().parse::<i64>().ok()?;
    let minutes = parts[1].trim().parse::<i64>().ok()?;
    let seconds = parts[2].trim().parse::<i64>().ok()?;
    if hours < 0 || minutes < 0 || seconds < 0 {
        return None;
    }

    let total = Duration::hours(hours) + Duration::minutes(minutes) + Duration::seconds(seconds);
    (total > Duration::zero()).then_some(total)
}

/// Advance a trigger time by whole intervals until it is strictly in the
/// future. A process that slept through several intervals fires once and
/// resumes the regular cadence -- no backlog.
pub fn advance_past(mut at: NaiveDateTime, interval: Duration, now: NaiveDateTime) -> NaiveDateTime {
    at += interval;
    while at <= now {
        at += interval;
    }
    at
}
