//! Five-field POSIX-style cron expression parsing and matching, in the same
//! small-function-plus-inline-tests style as the rest of this crate.

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, Local, Timelike};

use crate::error::CronError;

/// One of the five fields: either unrestricted (`*`) or an explicit set of
/// allowed values. A restricted field is a non-empty `Values` set.
#[derive(Debug, Clone, PartialEq, Eq)]
enum FieldSpec {
    Star,
    Values(BTreeSet<u32>),
}

impl FieldSpec {
    fn is_restricted(&self) -> bool {
        matches!(self, FieldSpec::Values(_))
    }

    fn matches(&self, value: u32) -> bool {
        match self {
            FieldSpec::Star => true,
            FieldSpec::Values(set) => set.contains(&value),
        }
    }
}

/// A parsed five-field cron expression: minute, hour, day-of-month, month,
/// day-of-week.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minute: FieldSpec,
    hour: FieldSpec,
    dom: FieldSpec,
    month: FieldSpec,
    dow: FieldSpec,
    raw: String,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::Parse {
                expr: expr.to_string(),
                reason: format!("expected 5 fields, found {}", fields.len()),
            });
        }
        Ok(Self {
            minute: parse_field(fields[0], 0, 59, expr)?,
            hour: parse_field(fields[1], 0, 23, expr)?,
            dom: parse_field(fields[2], 1, 31, expr)?,
            month: parse_field(fields[3], 1, 12, expr)?,
            dow: parse_field(fields[4], 0, 7, expr)?,
            raw: expr.to_string(),
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// True if `now` (local time, truncated to the minute) satisfies this
    /// expression. Day-of-month and day-of-week combine with a logical OR
    /// when both are restricted, per POSIX cron convention; when at most
    /// one is restricted, an ordinary AND degenerates to the same thing
    /// since the unrestricted side is always true.
    pub fn matches(&self, now: DateTime<Local>) -> bool {
        if !self.minute.matches(now.minute()) || !self.hour.matches(now.hour()) {
            return false;
        }
        if !self.month.matches(now.month()) {
            return false;
        }

        let dom_ok = self.dom.matches(now.day());
        let dow_value = normalize_dow(now.weekday().num_days_from_sunday());
        let dow_ok = dow_matches(&self.dow, dow_value);

        if self.dom.is_restricted() && self.dow.is_restricted() {
            dom_ok || dow_ok
        } else {
            dom_ok && dow_ok
        }
    }
}

/// Cron allows day-of-week `7` as an alias for Sunday alongside `0`;
/// chrono's `num_days_from_sunday` always yields `0` for Sunday, so field
/// values of `7` are normalized to `0` at parse time (see `parse_field`)
/// and this is the identity past that point. Kept as a named step so the
/// alias isn't silently lost if the representation changes.
fn normalize_dow(days_from_sunday: u32) -> u32 {
    days_from_sunday
}

fn dow_matches(spec: &FieldSpec, value: u32) -> bool {
    spec.matches(value)
}

fn parse_field(raw: &str, min: u32, max: u32, whole_expr: &str) -> Result<FieldSpec, CronError> {
    if raw == "*" {
        return Ok(FieldSpec::Star);
    }

    let mut values = BTreeSet::new();
    for part in raw.split(',') {
        parse_part(part, min, max, whole_expr, &mut values)?;
    }
    if values.is_empty() {
        return Err(CronError::Parse {
            expr: whole_expr.to_string(),
            reason: format!("field '{}' produced no values", raw),
        });
    }
    Ok(FieldSpec::Values(values))
}

fn parse_part(
    part: &str,
    min: u32,
    max: u32,
    whole_expr: &str,
    out: &mut BTreeSet<u32>,
) -> Result<(), CronError> {
    let bad = |reason: String| CronError::Parse { expr: whole_expr.to_string(), reason };

    let (range_part, step) = match part.split_once('/') {
        Some((r, s)) => {
            let step: u32 = s
                .parse()
                .map_err(|_| bad(format!("invalid step '{}' in '{}'", s, part)))?;
            if step == 0 {
                return Err(bad(format!("step cannot be zero in '{}'", part)));
            }
            (r, step)
        }
        None => (part, 1),
    };

    let (lo, hi) = if range_part == "*" {
        (min, max)
    } else if let Some((a, b)) = range_part.split_once('-') {
        let lo: u32 = a.parse().map_err(|_| bad(format!("invalid range start '{}'", a)))?;
        let hi: u32 = b.parse().map_err(|_| bad(format!("invalid range end '{}'", b)))?;
        if lo > hi {
            return Err(bad(format!("range '{}' is inverted", range_part)));
        }
        (lo, hi)
    } else {
        let v: u32 = range_part
            .parse()
            .map_err(|_| bad(format!("invalid value '{}'", range_part)))?;
        (v, v)
    };

    if lo < min || hi > max {
        return Err(bad(format!("value out of range [{}, {}] in '{}'", min, max, part)));
    }

    let mut v = lo;
    while v <= hi {
        // Cron's day-of-week alias: `7` means Sunday, same as `0`.
        let canonical = if max == 7 && v == 7 { 0 } else { v };
        out.insert(canonical);
        v += step;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, mo, d, h, mi, 0).single().unwrap()
    }

    #[test]
    fn step_expression_fires_on_multiples_only() {
        let expr = CronExpr::parse("*/15 * * * *").unwrap();
        assert!(expr.matches(at(2026, 1, 1, 10, 0)));
        assert!(expr.matches(at(2026, 1, 1, 10, 15)));
        assert!(expr.matches(at(2026, 1, 1, 10, 30)));
        assert!(expr.matches(at(2026, 1, 1, 10, 45)));
        assert!(!expr.matches(at(2026, 1, 1, 10, 1)));
    }

    #[test]
    fn comma_list_and_range() {
        let expr = CronExpr::parse("0,30 9-17 * * *").unwrap();
        assert!(expr.matches(at(2026, 1, 1, 9, 0)));
        assert!(expr.matches(at(2026, 1, 1, 17, 30)));
        assert!(!expr.matches(at(2026, 1, 1, 18, 0)));
        assert!(!expr.matches(at(2026, 1, 1, 9, 15)));
    }

    #[test]
    fn dom_and_dow_combine_with_or_when_both_restricted() {
        // Fires on the 1st of the month OR on Mondays.
        let expr = CronExpr::parse("0 9 1 * 1").unwrap();
        // 2026-01-01 is a Thursday, but day-of-month matches.
        assert!(expr.matches(at(2026, 1, 1, 9, 0)));
        // 2026-01-05 is a Monday, day-of-month does not match but dow does.
        assert!(expr.matches(at(2026, 1, 5, 9, 0)));
        // 2026-01-06 is neither.
        assert!(!expr.matches(at(2026, 1, 6, 9, 0)));
    }

    #[test]
    fn unrestricted_dow_degenerates_to_plain_and() {
        let expr = CronExpr::parse("0 9 15 * *").unwrap();
        assert!(expr.matches(at(2026, 1, 15, 9, 0)));
        assert!(!expr.matches(at(2026, 1, 16, 9, 0)));
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert!(CronExpr::parse("* * *").is_err());
    }

    #[test]
    fn rejects_out_of_range_value() {
        assert!(CronExpr::parse("60 * * * *").is_err());
    }

    #[test]
    fn day_of_week_seven_aliases_sunday() {
        let expr = CronExpr::parse("0 0 * * 7").unwrap();
        // 2026-01-04 is a Sunday.
        assert!(expr.matches(at(2026, 1, 4, 0, 0)));
    }
}
