//! Five-field cron expressions.
//!
//! Schedules are stored in the classic `minute hour day month weekday` form.
//! The `cron` crate expects a leading seconds field and numbers weekdays
//! differently, so numeric weekdays are rewritten to names before parsing.

use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Parse a five-field expression into a schedule.
pub fn parse(expr: &str) -> Result<cron::Schedule> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(Error::validation(format!(
            "Invalid cron expression '{expr}': expected 5 fields, got {}",
            fields.len()
        )));
    }

    let weekday = normalize_weekday(fields[4])
        .map_err(|reason| Error::validation(format!("Invalid cron expression '{expr}': {reason}")))?;
    let full = format!(
        "0 {} {} {} {} {}",
        fields[0], fields[1], fields[2], fields[3], weekday
    );

    cron::Schedule::from_str(&full)
        .map_err(|e| Error::validation(format!("Invalid cron expression '{expr}': {e}")))
}

/// Check an expression without keeping the schedule.
pub fn validate(expr: &str) -> Result<()> {
    parse(expr).map(|_| ())
}

fn weekday_number(token: &str) -> std::result::Result<Option<usize>, String> {
    if token.is_empty() || !token.chars().all(|c| c.is_ascii_digit()) {
        return Ok(None);
    }
    match token.parse::<usize>() {
        Ok(n) if n <= 7 => Ok(Some(n)),
        _ => Err(format!("weekday '{token}' out of range 0-7")),
    }
}

/// Rewrite numeric weekdays (0 and 7 are Sunday) to names.
///
/// Numeric ranges are expanded into lists so `5-7` keeps meaning
/// Friday through Sunday.
fn normalize_weekday(field: &str) -> std::result::Result<String, String> {
    let mut parts = Vec::new();
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step = step
                    .parse::<usize>()
                    .ok()
                    .filter(|s| *s > 0)
                    .ok_or_else(|| format!("invalid weekday step '{step}'"))?;
                (range, Some(step))
            }
            None => (part, None),
        };

        if range == "*" || range == "?" {
            parts.push(part.to_string());
            continue;
        }

        let (start, end) = match range.split_once('-') {
            Some((a, b)) => (a, Some(b)),
            None => (range, None),
        };
        let first = weekday_number(start)?;
        let last = end.map(weekday_number).transpose()?;

        let days: Vec<usize> = match (first, last) {
            (None, None) | (None, Some(None)) => {
                parts.push(part.to_ascii_uppercase());
                continue;
            }
            (Some(n), None) => match step {
                None => vec![n],
                // `n/step` runs from n through Saturday.
                Some(step) => (n..=6).step_by(step).collect(),
            },
            (Some(a), Some(Some(b))) => {
                if b < a {
                    return Err(format!("weekday range '{range}' is descending"));
                }
                (a..=b).step_by(step.unwrap_or(1)).collect()
            }
            _ => return Err(format!("cannot mix weekday names and numbers in '{range}'")),
        };
        if days.is_empty() {
            return Err(format!("weekday expression '{part}' matches no day"));
        }

        let mut names: Vec<&str> = Vec::with_capacity(days.len());
        for day in days {
            let name = WEEKDAYS[day % 7];
            if !names.contains(&name) {
                names.push(name);
            }
        }
        parts.push(names.join(","));
    }
    Ok(parts.join(","))
}

fn as_number(field: &str) -> Option<u32> {
    field.parse().ok()
}

fn every(field: &str) -> Option<u64> {
    if field == "*" {
        return Some(1);
    }
    field
        .strip_prefix("*/")
        .and_then(|n| n.parse::<u64>().ok())
        .filter(|n| *n > 0)
}

/// Approximate run interval for common shapes.
///
/// Recognizes every N minutes, every N hours, daily and weekly schedules;
/// anything else returns `None`.
pub fn estimate_interval(expr: &str) -> Option<Duration> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    let [minute, hour, day, month, weekday] = fields.as_slice() else {
        return None;
    };
    if *day != "*" || *month != "*" {
        return None;
    }

    if *weekday == "*" {
        if *hour == "*"
            && let Some(n) = every(minute)
        {
            return Some(Duration::from_secs(n * 60));
        }
        if as_number(minute).is_some() {
            if let Some(n) = every(hour) {
                return Some(Duration::from_secs(n * 3600));
            }
            if as_number(hour).is_some() {
                return Some(Duration::from_secs(24 * 3600));
            }
        }
        return None;
    }

    if as_number(minute).is_some() && as_number(hour).is_some() && !weekday.contains([',', '-', '/'])
    {
        return Some(Duration::from_secs(7 * 24 * 3600));
    }
    None
}
