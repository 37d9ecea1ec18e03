use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Timelike, Utc};

use crate::error::{Result, SchedulerError};
use crate::types::{CronField, CronSpec, TriggerSpec};

/// Upper bound on the day-by-day cron search. Feb 29 on a given weekday can
/// be decades apart, so this spans four centuries.
const MAX_SEARCH_DAYS: u32 = 400 * 366;

const DAYS_IN_MONTH: [u8; 12] = [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

const WEEKDAY_NAMES: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];
const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

/// Compute the next UTC fire time for `trigger` strictly *after* `after`.
///
/// Returns `None` when the trigger is exhausted (a `Once` instant that is not
/// in the future) or when no matching cron instant exists within the search
/// horizon, which `validate` rules out at registration time.
pub fn next_fire_time(trigger: &TriggerSpec, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match trigger {
        TriggerSpec::Cron(spec) => next_cron(spec, after),

        TriggerSpec::Interval { every_secs } => {
            let step = Duration::try_seconds(i64::try_from(*every_secs).ok()?)?;
            after.checked_add_signed(step)
        }

        TriggerSpec::Once { at } => {
            if *at > after {
                Some(*at)
            } else {
                None
            }
        }
    }
}

/// Eagerly reject triggers that can never fire.
pub fn validate(trigger: &TriggerSpec, now: DateTime<Utc>) -> Result<()> {
    match trigger {
        TriggerSpec::Cron(spec) => validate_cron(spec)?,
        TriggerSpec::Interval { every_secs } => {
            if *every_secs == 0 {
                return Err(SchedulerError::UnsatisfiableTrigger(
                    "interval must be at least one second".to_string(),
                ));
            }
        }
        TriggerSpec::Once { at } => {
            if *at <= now {
                return Err(SchedulerError::UnsatisfiableTrigger(format!(
                    "run date {} is not in the future",
                    at.to_rfc3339()
                )));
            }
        }
    }

    if next_fire_time(trigger, now).is_none() {
        return Err(SchedulerError::UnsatisfiableTrigger(
            "trigger has no future fire time".to_string(),
        ));
    }
    Ok(())
}

fn next_cron(spec: &CronSpec, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    // Whole-second resolution: the first candidate is the next full second.
    let start = after.with_nanosecond(0)? + Duration::seconds(1);
    let mut date = start.date_naive();
    let mut from = Some(start.time());

    for _ in 0..MAX_SEARCH_DAYS {
        if !spec.month.matches(date.month() as u8) {
            date = first_of_next_month(date)?;
            from = None;
            continue;
        }

        let weekday = date.weekday().num_days_from_monday() as u8;
        if spec.day.matches(date.day() as u8) && spec.day_of_week.matches(weekday) {
            let (h, m, s) = from
                .map(|t| (t.hour() as u8, t.minute() as u8, t.second() as u8))
                .unwrap_or((0, 0, 0));
            if let Some(time) = first_time_from(spec, h, m, s) {
                return Some(date.and_time(time).and_utc());
            }
        }

        date = date.succ_opt()?;
        from = None;
    }
    None
}

/// Earliest time of day `>= h:m:s` matching the hour/minute/second fields.
fn first_time_from(spec: &CronSpec, h: u8, m: u8, s: u8) -> Option<NaiveTime> {
    let mut hour = spec.hour.first_from(h, 23)?;
    loop {
        let first_minute = if hour == h { m } else { 0 };
        let mut minute = spec.minute.first_from(first_minute, 59);
        while let Some(min) = minute {
            let first_second = if hour == h && min == m { s } else { 0 };
            if let Some(sec) = spec.second.first_from(first_second, 59) {
                return NaiveTime::from_hms_opt(hour as u32, min as u32, sec as u32);
            }
            minute = spec.minute.first_from(min + 1, 59);
        }
        hour = spec.hour.first_from(hour + 1, 23)?;
    }
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDate> {
    if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
    }
}

fn validate_cron(spec: &CronSpec) -> Result<()> {
    check_range("second", &spec.second, 0, 59)?;
    check_range("minute", &spec.minute, 0, 59)?;
    check_range("hour", &spec.hour, 0, 23)?;
    check_range("day", &spec.day, 1, 31)?;
    check_range("month", &spec.month, 1, 12)?;
    check_range("day_of_week", &spec.day_of_week, 0, 6)?;

    // Day and month must meet at least once. Any existing calendar date falls
    // on every weekday eventually, so day_of_week needs no joint check.
    let feasible = (1u8..=12)
        .filter(|m| spec.month.matches(*m))
        .any(|m| (1..=DAYS_IN_MONTH[(m - 1) as usize]).any(|d| spec.day.matches(d)));
    if !feasible {
        return Err(SchedulerError::UnsatisfiableTrigger(
            "day and month fields never coincide on a calendar date".to_string(),
        ));
    }
    Ok(())
}

fn check_range(name: &str, field: &CronField, min: u8, max: u8) -> Result<()> {
    if let CronField::Values(set) = field {
        if set.is_empty() {
            return Err(SchedulerError::UnsatisfiableTrigger(format!(
                "{name}: empty value set"
            )));
        }
        if let Some(bad) = set.iter().find(|v| **v < min || **v > max) {
            return Err(SchedulerError::UnsatisfiableTrigger(format!(
                "{name}: value {bad} outside {min}-{max}"
            )));
        }
    }
    Ok(())
}

/// (name, min, max, default when less significant than every given field).
/// `None` keeps the wildcard.
const CRON_FIELDS: [(&str, u8, u8, Option<u8>); 6] = [
    ("month", 1, 12, Some(1)),
    ("day", 1, 31, Some(1)),
    ("day_of_week", 0, 6, None),
    ("hour", 0, 23, Some(0)),
    ("minute", 0, 59, Some(0)),
    ("second", 0, 59, Some(0)),
];

/// Names accepted by [`cron_from_fields`].
pub const CRON_FIELD_NAMES: [&str; 6] = ["month", "day", "day_of_week", "hour", "minute", "second"];

/// Build a [`CronSpec`] from loosely typed field values, e.g. the kwargs of a
/// configured job entry.
///
/// Fields less significant than the least significant given field default to
/// their minimum; the rest default to wildcard. `{minute: 16}` is therefore
/// second 0 of minute 16 of every hour.
pub fn cron_from_fields(fields: &serde_json::Map<String, serde_json::Value>) -> Result<CronSpec> {
    let last_given = CRON_FIELDS
        .iter()
        .rposition(|(name, ..)| fields.contains_key(*name));

    let mut parsed = Vec::with_capacity(CRON_FIELDS.len());
    for (idx, (name, min, max, default)) in CRON_FIELDS.iter().enumerate() {
        let field = match fields.get(*name) {
            Some(value) => parse_field(name, value, *min, *max)?,
            None if last_given.is_some_and(|last| idx > last) => {
                default.map(CronField::only).unwrap_or(CronField::Any)
            }
            None => CronField::Any,
        };
        parsed.push(field);
    }

    let mut it = parsed.into_iter();
    let mut next = || it.next().unwrap_or(CronField::Any);
    let (month, day, day_of_week, hour, minute, second) =
        (next(), next(), next(), next(), next(), next());
    let spec = CronSpec {
        second,
        minute,
        hour,
        day,
        month,
        day_of_week,
    };
    validate_cron(&spec)?;
    Ok(spec)
}

/// Parse one field: an integer, an array of integers, or an expression
/// string such as `"*"`, `"*/15"`, `"1,15"`, `"8-17/3"`, `"mon-fri"`.
pub fn parse_field(name: &str, value: &serde_json::Value, min: u8, max: u8) -> Result<CronField> {
    let invalid = |why: String| SchedulerError::UnsatisfiableTrigger(format!("{name}: {why}"));

    match value {
        serde_json::Value::Number(n) => {
            let v = n
                .as_u64()
                .filter(|v| *v >= min as u64 && *v <= max as u64)
                .ok_or_else(|| invalid(format!("value {n} outside {min}-{max}")))?;
            Ok(CronField::only(v as u8))
        }
        serde_json::Value::Array(items) => {
            let mut values = std::collections::BTreeSet::new();
            for item in items {
                match parse_field(name, item, min, max)? {
                    CronField::Any => return Ok(CronField::Any),
                    CronField::Values(set) => values.extend(set),
                }
            }
            Ok(CronField::Values(values))
        }
        serde_json::Value::String(expr) => parse_expression(name, expr, min, max),
        other => Err(invalid(format!("unsupported value {other}"))),
    }
}

fn parse_expression(name: &str, expr: &str, min: u8, max: u8) -> Result<CronField> {
    let invalid = |why: String| SchedulerError::UnsatisfiableTrigger(format!("{name}: {why}"));
    let expr = expr.trim().to_ascii_lowercase();
    if expr == "*" {
        return Ok(CronField::Any);
    }
    if expr.is_empty() {
        return Err(invalid("empty expression".to_string()));
    }

    let mut values = std::collections::BTreeSet::new();
    for part in expr.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u8 = step
                    .trim()
                    .parse()
                    .map_err(|_| invalid(format!("bad step in {part:?}")))?;
                if step == 0 {
                    return Err(invalid(format!("zero step in {part:?}")));
                }
                (range.trim(), step)
            }
            None => (part.trim(), 1),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_atom(name, a, min)?, parse_atom(name, b, min)?)
        } else {
            let v = parse_atom(name, range, min)?;
            // `5/10` means "from 5 to the end of the range, every 10".
            if part.contains('/') {
                (v, max)
            } else {
                (v, v)
            }
        };

        if lo < min || hi > max || lo > hi {
            return Err(invalid(format!("range {part:?} outside {min}-{max}")));
        }
        values.extend((lo..=hi).step_by(step as usize));
    }
    Ok(CronField::Values(values))
}

fn parse_atom(name: &str, atom: &str, min: u8) -> Result<u8> {
    let atom = atom.trim();
    if let Ok(v) = atom.parse::<u8>() {
        return Ok(v);
    }
    let names: &[&str] = match name {
        "day_of_week" => &WEEKDAY_NAMES,
        "month" => &MONTH_NAMES,
        _ => &[],
    };
    names
        .iter()
        .position(|n| *n == atom)
        .map(|idx| idx as u8 + min)
        .ok_or_else(|| SchedulerError::UnsatisfiableTrigger(format!("{name}: cannot parse {atom:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn fields(v: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        v.as_object().unwrap().clone()
    }

    fn satisfies(spec: &CronSpec, t: DateTime<Utc>) -> bool {
        spec.second.matches(t.second() as u8)
            && spec.minute.matches(t.minute() as u8)
            && spec.hour.matches(t.hour() as u8)
            && spec.day.matches(t.day() as u8)
            && spec.month.matches(t.month() as u8)
            && spec
                .day_of_week
                .matches(t.weekday().num_days_from_monday() as u8)
    }

    #[test]
    fn minute_sixteen_fires_later_in_the_same_hour() {
        let trigger = TriggerSpec::Cron(CronSpec::at_minute(16));
        let next = next_fire_time(&trigger, utc(2024, 1, 1, 10, 0, 0)).unwrap();
        assert_eq!(next, utc(2024, 1, 1, 10, 16, 0));
    }

    #[test]
    fn exact_match_is_not_returned() {
        let trigger = TriggerSpec::Cron(CronSpec::at_minute(16));
        let next = next_fire_time(&trigger, utc(2024, 1, 1, 10, 16, 0)).unwrap();
        assert_eq!(next, utc(2024, 1, 1, 11, 16, 0));
    }

    #[test]
    fn sub_second_after_rounds_up_to_next_whole_second() {
        let trigger = TriggerSpec::Cron(CronSpec::at_minute(16));
        let after = utc(2024, 1, 1, 10, 15, 59) + Duration::milliseconds(500);
        let next = next_fire_time(&trigger, after).unwrap();
        assert_eq!(next, utc(2024, 1, 1, 10, 16, 0));
    }

    #[test]
    fn daily_rolls_over_month_and_year() {
        let trigger = TriggerSpec::Cron(CronSpec::daily(8, 30));
        let next = next_fire_time(&trigger, utc(2023, 12, 31, 9, 0, 0)).unwrap();
        assert_eq!(next, utc(2024, 1, 1, 8, 30, 0));
    }

    #[test]
    fn weekday_constraint_skips_to_monday() {
        // 2024-01-06 is a Saturday.
        let spec = CronSpec {
            day_of_week: CronField::only(0),
            ..CronSpec::daily(9, 0)
        };
        let next = next_fire_time(&TriggerSpec::Cron(spec), utc(2024, 1, 6, 12, 0, 0)).unwrap();
        assert_eq!(next, utc(2024, 1, 8, 9, 0, 0));
    }

    #[test]
    fn leap_day_waits_for_next_leap_year() {
        let spec = CronSpec {
            day: CronField::only(29),
            month: CronField::only(2),
            ..CronSpec::daily(0, 0)
        };
        let next = next_fire_time(&TriggerSpec::Cron(spec), utc(2024, 3, 1, 0, 0, 0)).unwrap();
        assert_eq!(next, utc(2028, 2, 29, 0, 0, 0));
    }

    #[test]
    fn interval_adds_duration() {
        let t = utc(2024, 1, 1, 10, 0, 0);
        let next = next_fire_time(&TriggerSpec::every_secs(30), t).unwrap();
        assert_eq!(next, t + Duration::seconds(30));
    }

    #[test]
    fn once_is_exhausted_after_its_instant() {
        let at = utc(2024, 1, 1, 10, 0, 0);
        let trigger = TriggerSpec::Once { at };
        assert_eq!(next_fire_time(&trigger, at - Duration::seconds(1)), Some(at));
        assert_eq!(next_fire_time(&trigger, at), None);
    }

    #[test]
    fn february_thirtieth_is_unsatisfiable() {
        let spec = CronSpec {
            day: CronField::values([30, 31]),
            month: CronField::only(2),
            ..CronSpec::daily(0, 0)
        };
        let err = validate(&TriggerSpec::Cron(spec), utc(2024, 1, 1, 0, 0, 0)).unwrap_err();
        assert!(matches!(err, SchedulerError::UnsatisfiableTrigger(_)));
    }

    #[test]
    fn out_of_range_and_empty_fields_are_rejected() {
        let now = utc(2024, 1, 1, 0, 0, 0);
        let bad_minute = CronSpec {
            minute: CronField::only(60),
            ..CronSpec::default()
        };
        assert!(validate(&TriggerSpec::Cron(bad_minute), now).is_err());

        let empty_hour = CronSpec {
            hour: CronField::values([]),
            ..CronSpec::default()
        };
        assert!(validate(&TriggerSpec::Cron(empty_hour), now).is_err());
    }

    #[test]
    fn zero_interval_and_past_once_are_rejected() {
        let now = utc(2024, 1, 1, 0, 0, 0);
        assert!(validate(&TriggerSpec::every_secs(0), now).is_err());
        assert!(validate(&TriggerSpec::Once { at: now }, now).is_err());
        assert!(validate(
            &TriggerSpec::Once {
                at: now + Duration::hours(1)
            },
            now
        )
        .is_ok());
    }

    #[test]
    fn next_fire_time_always_satisfies_fields() {
        let specs = [
            CronSpec::at_minute(16),
            CronSpec::daily(23, 59),
            cron_from_fields(&fields(json!({"day_of_week": "mon-fri", "hour": "8-17/3"}))).unwrap(),
            cron_from_fields(&fields(json!({"day": "1,15", "minute": "*/20"}))).unwrap(),
            cron_from_fields(&fields(json!({"month": "feb", "day": 29, "hour": 6}))).unwrap(),
            cron_from_fields(&fields(json!({"second": "*/7"}))).unwrap(),
        ];

        // Deterministic LCG over ~10 years of seconds.
        let base = utc(2020, 1, 1, 0, 0, 0);
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        for spec in &specs {
            let trigger = TriggerSpec::Cron(spec.clone());
            for _ in 0..200 {
                seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let offset = (seed >> 33) % (10 * 365 * 24 * 3600);
                let after = base + Duration::seconds(offset as i64);
                let next = next_fire_time(&trigger, after).unwrap();
                assert!(next > after, "{next} not after {after}");
                assert!(satisfies(spec, next), "{next} does not satisfy {spec:?}");
            }
        }
    }

    #[test]
    fn given_minute_defaults_second_to_zero_and_hour_to_any() {
        let spec = cron_from_fields(&fields(json!({"minute": 16}))).unwrap();
        assert_eq!(spec, CronSpec::at_minute(16));
    }

    #[test]
    fn given_hour_defaults_minute_and_second() {
        let spec = cron_from_fields(&fields(json!({"hour": 8}))).unwrap();
        assert_eq!(spec.minute, CronField::only(0));
        assert_eq!(spec.second, CronField::only(0));
        assert_eq!(spec.day, CronField::Any);
        assert_eq!(spec.day_of_week, CronField::Any);
    }

    #[test]
    fn expressions_parse() {
        assert_eq!(
            parse_field("minute", &json!("*/15"), 0, 59).unwrap(),
            CronField::values([0, 15, 30, 45])
        );
        assert_eq!(
            parse_field("day_of_week", &json!("mon-fri"), 0, 6).unwrap(),
            CronField::values([0, 1, 2, 3, 4])
        );
        assert_eq!(
            parse_field("month", &json!("jan,dec"), 1, 12).unwrap(),
            CronField::values([1, 12])
        );
        assert_eq!(
            parse_field("hour", &json!("8-17/3"), 0, 23).unwrap(),
            CronField::values([8, 11, 14, 17])
        );
        assert_eq!(
            parse_field("minute", &json!([5, 10]), 0, 59).unwrap(),
            CronField::values([5, 10])
        );
        assert_eq!(parse_field("hour", &json!("*"), 0, 23).unwrap(), CronField::Any);
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        assert!(parse_field("minute", &json!("*/0"), 0, 59).is_err());
        assert!(parse_field("minute", &json!("70"), 0, 59).is_err());
        assert!(parse_field("hour", &json!("9-3"), 0, 23).is_err());
        assert!(parse_field("day_of_week", &json!("funday"), 0, 6).is_err());
        assert!(parse_field("minute", &json!(true), 0, 59).is_err());
    }
}
