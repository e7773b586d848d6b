//! Time buckets and the fallback search over them
//!
//! Upstream files are published per ISO week, per hour or per day. When the
//! bucket for "now" is not available yet, the fetcher walks to neighbouring
//! buckets under a [`FallbackPolicy`]:
//!
//! ```text
//! Seeking(b) --ok--> Done(b)
//!     |
//!   fail: b on wrap boundary, no forward step yet --> SteppingForward(wrap(b))
//!   fail: back steps left                          --> SteppingBack(earliest - 1)
//!   fail: otherwise                                --> Failed
//! ```

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketKind {
    IsoWeek,
    Hour,
    Day,
}

/// One upstream publication period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TimeBucket {
    IsoWeek { year: i32, week: u32 },
    /// Truncated to the hour.
    Hour(DateTime<Utc>),
    Day(NaiveDate),
}

impl TimeBucket {
    /// The bucket of `kind` containing `at`.
    pub fn containing(kind: BucketKind, at: DateTime<Utc>) -> Self {
        match kind {
            BucketKind::IsoWeek => {
                let iso = at.iso_week();
                TimeBucket::IsoWeek {
                    year: iso.year(),
                    week: iso.week(),
                }
            },
            BucketKind::Hour => {
                let start = at
                    .with_minute(0)
                    .and_then(|t| t.with_second(0))
                    .and_then(|t| t.with_nanosecond(0))
                    .unwrap_or(at);
                TimeBucket::Hour(start)
            },
            BucketKind::Day => TimeBucket::Day(at.date_naive()),
        }
    }

    pub fn kind(&self) -> BucketKind {
        match self {
            TimeBucket::IsoWeek { .. } => BucketKind::IsoWeek,
            TimeBucket::Hour(_) => BucketKind::Hour,
            TimeBucket::Day(_) => BucketKind::Day,
        }
    }

    /// Start of the bucket in UTC (Monday 00:00 for ISO weeks).
    pub fn start(&self) -> DateTime<Utc> {
        match *self {
            TimeBucket::IsoWeek { year, week } => NaiveDate::from_isoywd_opt(year, week, Weekday::Mon)
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| Utc.from_utc_datetime(&dt))
                .unwrap_or_default(),
            TimeBucket::Hour(at) => at,
            TimeBucket::Day(date) => date
                .and_hms_opt(0, 0, 0)
                .map(|dt| Utc.from_utc_datetime(&dt))
                .unwrap_or_default(),
        }
    }

    /// Compact label used in staged file names.
    pub fn label(&self) -> String {
        match self {
            TimeBucket::IsoWeek { year, week } => format!("{}W{:02}", year, week),
            TimeBucket::Hour(at) => at.format("%Y%m%d%H").to_string(),
            TimeBucket::Day(date) => date.format("%Y%m%d").to_string(),
        }
    }

    pub fn previous(&self) -> Self {
        match *self {
            TimeBucket::IsoWeek { year, week } if week > 1 => TimeBucket::IsoWeek { year, week: week - 1 },
            TimeBucket::IsoWeek { year, .. } => TimeBucket::IsoWeek {
                year: year - 1,
                week: weeks_in_iso_year(year - 1),
            },
            TimeBucket::Hour(at) => TimeBucket::Hour(at - Duration::hours(1)),
            TimeBucket::Day(date) => TimeBucket::Day(date.pred_opt().unwrap_or(date)),
        }
    }

    /// Whether this bucket is the last of its enclosing period, where
    /// upstream may already publish under the next period's name.
    pub fn on_wrap_boundary(&self) -> bool {
        match self {
            TimeBucket::IsoWeek { week, .. } => *week == 53,
            TimeBucket::Hour(at) => at.hour() == 23,
            TimeBucket::Day(_) => false,
        }
    }

    /// Week 53 to week 1 of the next year; hour 23 to hour 0 of the next day.
    pub fn wrap_forward(&self) -> Option<Self> {
        match *self {
            TimeBucket::IsoWeek { year, week: 53 } => Some(TimeBucket::IsoWeek { year: year + 1, week: 1 }),
            TimeBucket::Hour(at) if at.hour() == 23 => Some(TimeBucket::Hour(at + Duration::hours(1))),
            _ => None,
        }
    }

    /// Substitute bucket fields into a location template.
    ///
    /// Placeholders: `{year}`, `{yy}`, `{month}`, `{day}`, `{hour}` (zero
    /// padded) and `{week}` (ISO week number, unpadded). For week buckets
    /// `{year}` is the ISO year.
    pub fn render(&self, template: &str) -> String {
        let (year, start) = match *self {
            TimeBucket::IsoWeek { year, .. } => (year, self.start()),
            _ => (self.start().year(), self.start()),
        };
        let week = match *self {
            TimeBucket::IsoWeek { week, .. } => week,
            _ => start.iso_week().week(),
        };

        template
            .replace("{year}", &format!("{:04}", year))
            .replace("{yy}", &format!("{:02}", year.rem_euclid(100)))
            .replace("{month}", &format!("{:02}", start.month()))
            .replace("{day}", &format!("{:02}", start.day()))
            .replace("{hour}", &format!("{:02}", start.hour()))
            .replace("{week}", &week.to_string())
    }
}

impl std::fmt::Display for TimeBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.label())
    }
}

fn weeks_in_iso_year(year: i32) -> u32 {
    if NaiveDate::from_isoywd_opt(year, 53, Weekday::Mon).is_some() {
        53
    } else {
        52
    }
}

/// How far the search may wander from the requested bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackPolicy {
    /// Maximum number of earlier buckets to try.
    pub back_steps: u32,
    /// Try the next period once when the requested bucket sits on a wrap boundary.
    pub wrap_forward: bool,
}

impl FallbackPolicy {
    /// Only the requested bucket.
    pub const EXACT: FallbackPolicy = FallbackPolicy {
        back_steps: 0,
        wrap_forward: false,
    };

    pub fn back(back_steps: u32) -> Self {
        Self {
            back_steps,
            wrap_forward: false,
        }
    }

    pub fn with_wrap_forward(mut self) -> Self {
        self.wrap_forward = true;
        self
    }
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self::back(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackState {
    Seeking(TimeBucket),
    SteppingBack(TimeBucket),
    SteppingForward(TimeBucket),
    Done(TimeBucket),
    Failed,
}

/// Explicit state machine driving the fetch attempts.
#[derive(Debug, Clone)]
pub struct FallbackSearch {
    policy: FallbackPolicy,
    state: FallbackState,
    earliest: TimeBucket,
    back_taken: u32,
    forward_taken: bool,
}

impl FallbackSearch {
    pub fn new(start: TimeBucket, policy: FallbackPolicy) -> Self {
        Self {
            policy,
            state: FallbackState::Seeking(start),
            earliest: start,
            back_taken: 0,
            forward_taken: false,
        }
    }

    pub fn state(&self) -> FallbackState {
        self.state
    }

    /// Bucket to try next, if the search is still running.
    pub fn current(&self) -> Option<TimeBucket> {
        match self.state {
            FallbackState::Seeking(b) | FallbackState::SteppingBack(b) | FallbackState::SteppingForward(b) => {
                Some(b)
            },
            FallbackState::Done(_) | FallbackState::Failed => None,
        }
    }

    pub fn succeed(&mut self) -> Option<TimeBucket> {
        let bucket = self.current()?;
        self.state = FallbackState::Done(bucket);
        Some(bucket)
    }

    /// Record a failed attempt on the current bucket and move on.
    pub fn fail(&mut self) -> FallbackState {
        let Some(current) = self.current() else {
            return self.state;
        };

        let forward = if self.policy.wrap_forward && !self.forward_taken {
            current.wrap_forward()
        } else {
            None
        };

        self.state = if let Some(next) = forward {
            self.forward_taken = true;
            FallbackState::SteppingForward(next)
        } else if self.back_taken < self.policy.back_steps {
            self.back_taken += 1;
            self.earliest = self.earliest.previous();
            FallbackState::SteppingBack(self.earliest)
        } else {
            FallbackState::Failed
        };

        self.state
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn hour(y: i32, m: u32, d: u32, h: u32) -> TimeBucket {
        TimeBucket::Hour(Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap())
    }

    #[test]
    fn test_containing_week() {
        let at = Utc.with_ymd_and_hms(2016, 1, 1, 12, 0, 0).unwrap();
        // 2016-01-01 falls in ISO week 53 of 2015
        assert_eq!(
            TimeBucket::containing(BucketKind::IsoWeek, at),
            TimeBucket::IsoWeek { year: 2015, week: 53 }
        );
    }

    #[test]
    fn test_containing_hour_truncates() {
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 17, 42, 9).unwrap();
        assert_eq!(TimeBucket::containing(BucketKind::Hour, at), hour(2024, 3, 5, 17));
    }

    #[test]
    fn test_previous_week_crosses_year() {
        assert_eq!(
            TimeBucket::IsoWeek { year: 2016, week: 1 }.previous(),
            TimeBucket::IsoWeek { year: 2015, week: 53 }
        );
        assert_eq!(
            TimeBucket::IsoWeek { year: 2017, week: 1 }.previous(),
            TimeBucket::IsoWeek { year: 2016, week: 52 }
        );
    }

    #[test]
    fn test_wrap_forward() {
        assert_eq!(
            TimeBucket::IsoWeek { year: 2015, week: 53 }.wrap_forward(),
            Some(TimeBucket::IsoWeek { year: 2016, week: 1 })
        );
        assert_eq!(hour(2024, 12, 31, 23).wrap_forward(), Some(hour(2025, 1, 1, 0)));
        assert_eq!(hour(2024, 12, 31, 22).wrap_forward(), None);
        assert!(TimeBucket::Day(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())
            .wrap_forward()
            .is_none());
    }

    #[test]
    fn test_render_templates() {
        let url = "http://maps.example.org/temperature/{year}/{month}/{day}/{hour}.tif";
        assert_eq!(
            hour(2016, 2, 3, 4).render(url),
            "http://maps.example.org/temperature/2016/02/03/04.tif"
        );
        assert_eq!(hour(2016, 2, 3, 4).render("US-{yy}{month}{day}{hour}.grib2"), "US-16020304.grib2");

        let week = TimeBucket::IsoWeek { year: 2016, week: 5 };
        assert_eq!(week.render("mmwr_{year}.asp?mmwr_week={week}"), "mmwr_2016.asp?mmwr_week=5");
    }

    #[test]
    fn test_labels() {
        assert_eq!(TimeBucket::IsoWeek { year: 2016, week: 5 }.label(), "2016W05");
        assert_eq!(hour(2016, 2, 3, 4).label(), "2016020304");
    }

    #[test]
    fn test_search_exact_fails_immediately() {
        let mut search = FallbackSearch::new(hour(2024, 1, 1, 5), FallbackPolicy::EXACT);
        assert_eq!(search.fail(), FallbackState::Failed);
        assert!(search.current().is_none());
    }

    #[test]
    fn test_search_steps_back_within_bound() {
        let mut search = FallbackSearch::new(hour(2024, 1, 1, 5), FallbackPolicy::back(2));
        assert_eq!(search.fail(), FallbackState::SteppingBack(hour(2024, 1, 1, 4)));
        assert_eq!(search.fail(), FallbackState::SteppingBack(hour(2024, 1, 1, 3)));
        assert_eq!(search.fail(), FallbackState::Failed);
    }

    #[test]
    fn test_search_forward_once_then_back() {
        let start = TimeBucket::IsoWeek { year: 2015, week: 53 };
        let mut search = FallbackSearch::new(start, FallbackPolicy::back(1).with_wrap_forward());

        assert_eq!(
            search.fail(),
            FallbackState::SteppingForward(TimeBucket::IsoWeek { year: 2016, week: 1 })
        );
        assert_eq!(
            search.fail(),
            FallbackState::SteppingBack(TimeBucket::IsoWeek { year: 2015, week: 52 })
        );
        assert_eq!(search.fail(), FallbackState::Failed);
    }

    #[test]
    fn test_search_without_wrap_policy_ignores_boundary() {
        let mut search = FallbackSearch::new(hour(2024, 1, 1, 23), FallbackPolicy::back(1));
        assert_eq!(search.fail(), FallbackState::SteppingBack(hour(2024, 1, 1, 22)));
    }

    #[test]
    fn test_search_succeed() {
        let mut search = FallbackSearch::new(hour(2024, 1, 1, 5), FallbackPolicy::back(1));
        search.fail();
        assert_eq!(search.succeed(), Some(hour(2024, 1, 1, 4)));
        assert_eq!(search.state(), FallbackState::Done(hour(2024, 1, 1, 4)));
        assert_eq!(search.succeed(), None);
    }
}
