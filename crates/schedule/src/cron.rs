//! 5-field cron expression parser.
//!
//! Standard `minute hour day-of-month month day-of-week` form with `*`,
//! literals, `N-M` ranges, comma lists, and an optional `/step` suffix on
//! any of those. Times are evaluated in UTC at minute granularity.
//!
//! Each field compiles to a bitmask of admissible values (minute bit 0
//! through 59, day-of-week bit 0 = Sunday), so matching an instant is five
//! bit tests.

use chrono::{DateTime, Datelike, Timelike, Utc};

use beamlens_core::Error;

/// A compiled cron expression: one bit per admissible value, per field.
#[derive(Debug, Clone)]
pub struct CronExpr {
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
}

/// Value bounds and error label for one cron field.
struct FieldSpec {
    label: &'static str,
    min: u32,
    max: u32,
}

const FIELDS: [FieldSpec; 5] = [
    FieldSpec { label: "minute", min: 0, max: 59 },
    FieldSpec { label: "hour", min: 0, max: 23 },
    FieldSpec { label: "day-of-month", min: 1, max: 31 },
    FieldSpec { label: "month", min: 1, max: 12 },
    FieldSpec { label: "day-of-week", min: 0, max: 6 },
];

impl CronExpr {
    /// Compile a standard 5-field cron expression.
    pub fn parse(expr: &str) -> Result<Self, Error> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != FIELDS.len() {
            return Err(bad(format!(
                "expected 5 cron fields (minute hour dom month dow), got {}",
                fields.len()
            )));
        }

        let mut masks = [0u64; 5];
        for (mask, (text, spec)) in masks.iter_mut().zip(fields.into_iter().zip(&FIELDS)) {
            *mask = field_mask(text, spec)?;
        }
        let [minutes, hours, days_of_month, months, days_of_week] = masks;
        Ok(Self {
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
        })
    }

    /// Whether the given UTC instant is admitted by every field.
    pub fn matches(&self, dt: &DateTime<Utc>) -> bool {
        admits(self.minutes, dt.minute())
            && admits(self.hours, dt.hour())
            && admits(self.days_of_month, dt.day())
            && admits(self.months, dt.month())
            && admits(self.days_of_week, dt.weekday().num_days_from_sunday())
    }
}

fn admits(mask: u64, value: u32) -> bool {
    value < 64 && mask & (1u64 << value) != 0
}

fn bad(message: String) -> Error {
    Error::Config { message }
}

/// Compile one whitespace-delimited field: a comma list of terms, OR-ed
/// together.
fn field_mask(text: &str, spec: &FieldSpec) -> Result<u64, Error> {
    let mut mask = 0u64;
    for term in text.split(',') {
        mask |= term_mask(term.trim(), spec)?;
    }
    Ok(mask)
}

/// Compile one term: `*`, `N`, or `N-M`, any with an optional `/step`.
///
/// A stepped single value (`6/10`) counts upward from it to the field
/// maximum, matching the common cron dialect.
fn term_mask(term: &str, spec: &FieldSpec) -> Result<u64, Error> {
    let (range, step) = match term.split_once('/') {
        Some((range, step_text)) => {
            let step: u32 = step_text
                .parse()
                .map_err(|_| bad(format!("{}: bad step '{step_text}'", spec.label)))?;
            if step == 0 {
                return Err(bad(format!("{}: step must be at least 1", spec.label)));
            }
            (range, Some(step))
        }
        None => (term, None),
    };

    let (lo, hi) = if range == "*" {
        (spec.min, spec.max)
    } else if let Some((a, b)) = range.split_once('-') {
        (bounded(a, spec)?, bounded(b, spec)?)
    } else {
        let n = bounded(range, spec)?;
        match step {
            Some(_) => (n, spec.max),
            None => (n, n),
        }
    };
    if lo > hi {
        return Err(bad(format!(
            "{}: range {lo}-{hi} runs backwards",
            spec.label
        )));
    }

    let mut mask = 0u64;
    let mut value = lo;
    while value <= hi {
        mask |= 1u64 << value;
        value += step.unwrap_or(1);
    }
    Ok(mask)
}

/// Parse a number and check it against the field bounds.
fn bounded(text: &str, spec: &FieldSpec) -> Result<u32, Error> {
    let value: u32 = text
        .trim()
        .parse()
        .map_err(|_| bad(format!("{}: '{text}' is not a number", spec.label)))?;
    if value < spec.min || value > spec.max {
        return Err(bad(format!(
            "{}: {value} outside {}-{}",
            spec.label, spec.min, spec.max
        )));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        chrono::NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, 0)
            .unwrap()
            .and_utc()
    }

    #[test]
    fn wildcard_admits_every_value() {
        let expr = CronExpr::parse("* * * * *").unwrap();
        assert_eq!(expr.minutes.count_ones(), 60);
        assert_eq!(expr.hours.count_ones(), 24);
        assert_eq!(expr.days_of_month.count_ones(), 31);
        assert_eq!(expr.months.count_ones(), 12);
        assert_eq!(expr.days_of_week.count_ones(), 7);
    }

    #[test]
    fn lists_and_ranges_set_exactly_their_bits() {
        let expr = CronExpr::parse("0,15,45 8-10 * * *").unwrap();
        assert_eq!(expr.minutes, 1 | 1 << 15 | 1 << 45);
        assert_eq!(expr.hours, 1 << 8 | 1 << 9 | 1 << 10);
    }

    #[test]
    fn steps_apply_to_wildcards_and_ranges() {
        let expr = CronExpr::parse("*/20 10-14/2 * * *").unwrap();
        assert_eq!(expr.minutes, 1 | 1 << 20 | 1 << 40);
        assert_eq!(expr.hours, 1 << 10 | 1 << 12 | 1 << 14);
    }

    #[test]
    fn stepped_single_value_counts_to_field_max() {
        let expr = CronExpr::parse("6/10 * * * *").unwrap();
        assert_eq!(
            expr.minutes,
            1 << 6 | 1 << 16 | 1 << 26 | 1 << 36 | 1 << 46 | 1 << 56
        );
    }

    #[test]
    fn matches_checks_every_field() {
        // "At 17:45 on Fridays"; 2025-07-04 is a Friday
        let expr = CronExpr::parse("45 17 * * 5").unwrap();
        assert!(expr.matches(&at(2025, 7, 4, 17, 45)));
        assert!(!expr.matches(&at(2025, 7, 4, 17, 46)));
        assert!(!expr.matches(&at(2025, 7, 4, 16, 45)));
        // Saturday
        assert!(!expr.matches(&at(2025, 7, 5, 17, 45)));
    }

    #[test]
    fn day_and_month_fields_constrain_the_date() {
        let expr = CronExpr::parse("30 4 1 2 *").unwrap();
        assert!(expr.matches(&at(2026, 2, 1, 4, 30)));
        assert!(!expr.matches(&at(2026, 3, 1, 4, 30)));
        assert!(!expr.matches(&at(2026, 2, 2, 4, 30)));
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        for expr in [
            "* * * *",        // four fields
            "* * * * * *",    // six fields
            "61 * * * *",     // minute out of bounds
            "* 24 * * *",     // hour out of bounds
            "*/0 * * * *",    // zero step
            "9-3 * * * *",    // backwards range
            "abc * * * *",    // not a number
            "* * * * 7",      // day-of-week out of bounds
        ] {
            assert!(CronExpr::parse(expr).is_err(), "{expr} should be rejected");
        }
    }
}
