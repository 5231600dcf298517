//! Calendar-masked recurring jobs.
//!
//! Each cron entry carries a mask per calendar component: `None` means any
//! value, a set means "one of these". Sub-minute components default to `{0}`
//! so `cron("f").hour([9, 12, 18]).minute([12])` fires at 09:12:00.000,
//! 12:12:00.000 and 18:12:00.000. Weekdays count from Monday = 0.

use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Timelike, Utc};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::function::{JobContext, JobError, WorkerFunction};
use crate::utils::to_unix_ms;

/// Upper bound on scheduling steps before a mask is declared unsatisfiable
/// (about 270 years of day-steps).
const MAX_STEPS: usize = 100_000;

/// Mask over the calendar components of a fire instant.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    pub month: Option<BTreeSet<u32>>,
    pub day: Option<BTreeSet<u32>>,
    /// Monday = 0 .. Sunday = 6
    pub weekday: Option<BTreeSet<u32>>,
    pub hour: Option<BTreeSet<u32>>,
    pub minute: Option<BTreeSet<u32>>,
    pub second: BTreeSet<u32>,
    pub microsecond: BTreeSet<u32>,
}

impl Default for CronSchedule {
    fn default() -> Self {
        Self {
            month: None,
            day: None,
            weekday: None,
            hour: None,
            minute: None,
            second: BTreeSet::from([0]),
            microsecond: BTreeSet::from([0]),
        }
    }
}

impl CronSchedule {
    /// Reject values that can never match so misconfigured entries fail at
    /// worker startup instead of silently never firing.
    pub fn validate(&self) -> Result<()> {
        let check = |name: &str, mask: Option<&BTreeSet<u32>>, lo: u32, hi: u32| -> Result<()> {
            if let Some(mask) = mask {
                for &v in mask {
                    if v < lo || v > hi {
                        return Err(Error::Config(format!(
                            "cron {} value {} out of range {}..={}",
                            name, v, lo, hi
                        )));
                    }
                }
            }
            Ok(())
        };
        check("month", self.month.as_ref(), 1, 12)?;
        check("day", self.day.as_ref(), 1, 31)?;
        check("weekday", self.weekday.as_ref(), 0, 6)?;
        check("hour", self.hour.as_ref(), 0, 23)?;
        check("minute", self.minute.as_ref(), 0, 59)?;
        check("second", Some(&self.second), 0, 59)?;
        check("microsecond", Some(&self.microsecond), 0, 999_999)?;
        Ok(())
    }
}

fn mismatch(mask: &Option<BTreeSet<u32>>, value: u32) -> bool {
    match mask {
        Some(mask) => !mask.is_empty() && !mask.contains(&value),
        None => false,
    }
}

fn start_of_next_day(dt: DateTime<Utc>) -> DateTime<Utc> {
    let since_midnight = ChronoDuration::nanoseconds(dt.nanosecond() as i64)
        + ChronoDuration::seconds(dt.second() as i64)
        + ChronoDuration::minutes(dt.minute() as i64)
        + ChronoDuration::hours(dt.hour() as i64);
    dt - since_midnight + ChronoDuration::days(1)
}

fn start_of_next_hour(dt: DateTime<Utc>) -> DateTime<Utc> {
    let since_hour = ChronoDuration::nanoseconds(dt.nanosecond() as i64)
        + ChronoDuration::seconds(dt.second() as i64)
        + ChronoDuration::minutes(dt.minute() as i64);
    dt - since_hour + ChronoDuration::hours(1)
}

fn start_of_next_minute(dt: DateTime<Utc>) -> DateTime<Utc> {
    let since_minute = ChronoDuration::nanoseconds(dt.nanosecond() as i64)
        + ChronoDuration::seconds(dt.second() as i64);
    dt - since_minute + ChronoDuration::minutes(1)
}

fn start_of_next_second(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt - ChronoDuration::nanoseconds(dt.nanosecond() as i64) + ChronoDuration::seconds(1)
}

/// One scheduling step: `None` when every component matches, otherwise the
/// next candidate instant (coarsest mismatching component wins).
fn next_step(dt: DateTime<Utc>, spec: &CronSchedule) -> Option<DateTime<Utc>> {
    if mismatch(&spec.month, dt.month())
        || mismatch(&spec.day, dt.day())
        || mismatch(&spec.weekday, dt.weekday().num_days_from_monday())
    {
        return Some(start_of_next_day(dt));
    }
    if mismatch(&spec.hour, dt.hour()) {
        return Some(start_of_next_hour(dt));
    }
    if mismatch(&spec.minute, dt.minute()) {
        return Some(start_of_next_minute(dt));
    }
    if !spec.second.is_empty() && !spec.second.contains(&dt.second()) {
        return Some(start_of_next_second(dt));
    }
    let micro = dt.nanosecond() / 1000;
    if !spec.microsecond.is_empty() && !spec.microsecond.contains(&micro) {
        let target = spec
            .microsecond
            .iter()
            .copied()
            .find(|&m| m > micro)
            .unwrap_or_else(|| spec.microsecond.first().copied().unwrap_or(0) + 1_000_000);
        return Some(dt + ChronoDuration::microseconds((target - micro) as i64));
    }
    None
}

/// The smallest instant strictly greater than `preview` matching all masks.
pub fn next_cron(preview: DateTime<Utc>, spec: &CronSchedule) -> Result<DateTime<Utc>> {
    let mut dt = preview + ChronoDuration::seconds(1);
    for _ in 0..MAX_STEPS {
        match next_step(dt, spec) {
            None => return Ok(dt),
            Some(next) => dt = next,
        }
    }
    Err(Error::Config(
        "cron schedule never matches a future instant".to_string(),
    ))
}

/// A recurring job: a function plus the calendar mask it fires on.
#[derive(Debug, Clone)]
pub struct CronJob {
    pub name: String,
    pub(crate) function: WorkerFunction,
    pub schedule: CronSchedule,

    /// Deterministic per-tick identity so workers sharing a queue cannot
    /// double-schedule the same fire instant
    pub unique: bool,

    /// Also fire once immediately when the worker starts
    pub run_at_startup: bool,
}

impl CronJob {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, JobError>> + Send + 'static,
    {
        let name = name.into();
        let mut function = WorkerFunction::new(name.clone(), f);
        function.is_cron = true;
        Self {
            name,
            function,
            schedule: CronSchedule::default(),
            unique: true,
            run_at_startup: false,
        }
    }

    pub fn month(mut self, mask: impl IntoIterator<Item = u32>) -> Self {
        self.schedule.month = Some(mask.into_iter().collect());
        self
    }

    pub fn day(mut self, mask: impl IntoIterator<Item = u32>) -> Self {
        self.schedule.day = Some(mask.into_iter().collect());
        self
    }

    pub fn weekday(mut self, mask: impl IntoIterator<Item = u32>) -> Self {
        self.schedule.weekday = Some(mask.into_iter().collect());
        self
    }

    pub fn hour(mut self, mask: impl IntoIterator<Item = u32>) -> Self {
        self.schedule.hour = Some(mask.into_iter().collect());
        self
    }

    pub fn minute(mut self, mask: impl IntoIterator<Item = u32>) -> Self {
        self.schedule.minute = Some(mask.into_iter().collect());
        self
    }

    pub fn second(mut self, mask: impl IntoIterator<Item = u32>) -> Self {
        self.schedule.second = mask.into_iter().collect();
        self
    }

    pub fn microsecond(mut self, mask: impl IntoIterator<Item = u32>) -> Self {
        self.schedule.microsecond = mask.into_iter().collect();
        self
    }

    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    pub fn run_at_startup(mut self, run_at_startup: bool) -> Self {
        self.run_at_startup = run_at_startup;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.function.timeout = Some(timeout);
        self
    }

    pub fn keep_result(mut self, keep_result: Duration) -> Self {
        self.function.keep_result = Some(keep_result);
        self
    }

    pub fn keep_result_forever(mut self, keep: bool) -> Self {
        self.function.keep_result_forever = Some(keep);
        self
    }

    pub fn max_tries(mut self, max_tries: u32) -> Self {
        self.function.max_tries = Some(max_tries);
        self
    }

    /// Next fire instant strictly after `now`.
    pub fn next_run(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        next_cron(now, &self.schedule)
    }

    /// Identity used for the enqueue of one fire instant. `None` means a
    /// random identity (the `unique` flag is off).
    pub fn job_id(&self, run_at: DateTime<Utc>) -> Option<String> {
        self.unique
            .then(|| format!("cron:{}:{}", self.name, to_unix_ms(run_at)))
    }
}

/// Shorthand mirroring the registration style of plain functions.
pub fn cron<F, Fut>(name: impl Into<String>, f: F) -> CronJob
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, JobError>> + Send + 'static,
{
    CronJob::new(name, f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn schedule(hour: &[u32], minute: &[u32]) -> CronSchedule {
        CronSchedule {
            hour: Some(hour.iter().copied().collect()),
            minute: Some(minute.iter().copied().collect()),
            ..Default::default()
        }
    }

    #[test]
    fn test_next_cron_picks_next_slot_same_day() {
        // 10:00 with hours {9, 12, 18} and minute 12 -> 12:12:00.000 today
        let spec = schedule(&[9, 12, 18], &[12]);
        let next = next_cron(at(2021, 11, 16, 10, 0, 0), &spec).unwrap();
        assert_eq!(next, at(2021, 11, 16, 12, 12, 0));
    }

    #[test]
    fn test_next_cron_just_past_a_slot() {
        let spec = schedule(&[9, 12, 18], &[12]);
        let just_past = at(2021, 11, 16, 12, 12, 0) + ChronoDuration::milliseconds(1);
        let next = next_cron(just_past, &spec).unwrap();
        assert_eq!(next, at(2021, 11, 16, 18, 12, 0));
    }

    #[test]
    fn test_next_cron_rolls_to_next_day() {
        let spec = schedule(&[9, 12, 18], &[12]);
        let next = next_cron(at(2021, 11, 16, 19, 0, 0), &spec).unwrap();
        assert_eq!(next, at(2021, 11, 17, 9, 12, 0));
    }

    #[test]
    fn test_next_cron_is_strictly_greater() {
        let spec = schedule(&[12], &[12]);
        let exact = at(2021, 11, 16, 12, 12, 0);
        let next = next_cron(exact, &spec).unwrap();
        assert_eq!(next, at(2021, 11, 17, 12, 12, 0));
    }

    #[test]
    fn test_minute_only_fires_every_hour() {
        let spec = CronSchedule {
            minute: Some(BTreeSet::from([40])),
            second: BTreeSet::from([50]),
            microsecond: BTreeSet::from([0]),
            ..Default::default()
        };
        let next = next_cron(at(2021, 11, 16, 10, 41, 0), &spec).unwrap();
        assert_eq!(next, at(2021, 11, 16, 11, 40, 50));
    }

    #[test]
    fn test_weekday_mask() {
        // 2021-11-16 is a Tuesday; weekday 5 is Saturday
        let spec = CronSchedule {
            weekday: Some(BTreeSet::from([5])),
            hour: Some(BTreeSet::from([0])),
            minute: Some(BTreeSet::from([0])),
            ..Default::default()
        };
        let next = next_cron(at(2021, 11, 16, 10, 0, 0), &spec).unwrap();
        assert_eq!(next, at(2021, 11, 20, 0, 0, 0));
        assert_eq!(next.weekday().num_days_from_monday(), 5);
    }

    #[test]
    fn test_month_and_day_mask() {
        let spec = CronSchedule {
            month: Some(BTreeSet::from([1])),
            day: Some(BTreeSet::from([1])),
            hour: Some(BTreeSet::from([0])),
            minute: Some(BTreeSet::from([0])),
            ..Default::default()
        };
        let next = next_cron(at(2021, 11, 16, 10, 0, 0), &spec).unwrap();
        assert_eq!(next, at(2022, 1, 1, 0, 0, 0));
    }

    #[test]
    fn test_microsecond_mask() {
        let spec = CronSchedule {
            microsecond: BTreeSet::from([500_000]),
            second: BTreeSet::from([0]),
            minute: Some(BTreeSet::from([30])),
            ..Default::default()
        };
        let next = next_cron(at(2021, 11, 16, 10, 0, 0), &spec).unwrap();
        assert_eq!(next.minute(), 30);
        assert_eq!(next.second(), 0);
        assert_eq!(next.nanosecond(), 500_000_000);
    }

    #[test]
    fn test_unsatisfiable_schedule_errors() {
        // February never has a 30th
        let spec = CronSchedule {
            month: Some(BTreeSet::from([2])),
            day: Some(BTreeSet::from([30])),
            ..Default::default()
        };
        assert!(next_cron(at(2021, 11, 16, 0, 0, 0), &spec).is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let job = cron("tick", |_ctx| async { Ok(json!(null)) }).hour([24]);
        assert!(job.schedule.validate().is_err());

        let job = cron("tick", |_ctx| async { Ok(json!(null)) }).hour([23]).minute([59]);
        assert!(job.schedule.validate().is_ok());
    }

    #[test]
    fn test_cron_job_identity() {
        let job = cron("x100", |_ctx| async { Ok(json!(null)) }).minute([40]).second([50]);
        assert!(job.unique);
        assert!(job.function.is_cron);
        let run_at = at(2021, 11, 16, 10, 40, 50);
        assert_eq!(
            job.job_id(run_at).unwrap(),
            format!("cron:x100:{}", run_at.timestamp_millis())
        );

        let job = job.unique(false);
        assert!(job.job_id(run_at).is_none());
    }
}
