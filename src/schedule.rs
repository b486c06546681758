use chrono::{Datelike, NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

use crate::time_util::IntervalFields;

/// Bitmask over the 7 weekdays. Empty masks are normalized to "all days
/// allowed" wherever a `WeekdaySet` is constructed from external input
/// (§3 invariant: "Weekday mask is non-empty after construction").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Weekday>", into = "Vec<Weekday>")]
pub struct WeekdaySet(u8);

const ALL_WEEKDAYS: u8 = 0b0111_1111;

impl WeekdaySet {
    pub const ALL: WeekdaySet = WeekdaySet(ALL_WEEKDAYS);

    pub fn empty() -> Self {
        WeekdaySet(0)
    }

    fn bit(day: Weekday) -> u8 {
        1 << day.num_days_from_sunday()
    }

    pub fn insert(&mut self, day: Weekday) {
        self.0 |= Self::bit(day);
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & Self::bit(day) != 0
    }

    /// Build from a list of allowed weekdays, normalizing an empty list to
    /// the full set per the §3 input-normalization rule.
    pub fn from_days(days: impl IntoIterator<Item = Weekday>) -> Self {
        let mut set = WeekdaySet::empty();
        for d in days {
            set.insert(d);
        }
        if set.0 == 0 { WeekdaySet::ALL } else { set }
    }
}

impl Default for WeekdaySet {
    fn default() -> Self {
        WeekdaySet::ALL
    }
}

impl From<Vec<Weekday>> for WeekdaySet {
    fn from(days: Vec<Weekday>) -> Self {
        WeekdaySet::from_days(days)
    }
}

impl From<WeekdaySet> for Vec<Weekday> {
    fn from(set: WeekdaySet) -> Self {
        const ORDER: [Weekday; 7] = [
            Weekday::Sun,
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
        ];
        ORDER.into_iter().filter(|d| set.contains(*d)).collect()
    }
}

/// The central scheduling value (§3). Immutable by convention except for
/// `last_run`, `end_on`, and `next_run_override`, which only the owning
/// `ScheduleTask` mutates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Schedule {
    #[serde(default)]
    pub weeks: i64,
    #[serde(default)]
    pub days: i64,
    #[serde(default)]
    pub hours: i64,
    #[serde(default)]
    pub minutes: i64,
    #[serde(default)]
    pub seconds: f64,
    #[serde(default)]
    pub milliseconds: i64,
    #[serde(default)]
    pub microseconds: i64,

    #[serde(default)]
    pub weekdays: WeekdaySet,

    #[serde(default)]
    pub at: Option<NaiveTime>,

    #[serde(default = "default_start_on")]
    pub start_on: NaiveDateTime,
    #[serde(default)]
    pub end_on: Option<NaiveDateTime>,
    #[serde(default)]
    pub last_run: Option<NaiveDateTime>,

    #[serde(default)]
    pub repeat: bool,

    #[serde(default, rename = "next_run")]
    pub next_run_override: Option<NaiveDateTime>,
}

fn default_start_on() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

impl Default for Schedule {
    fn default() -> Self {
        Schedule {
            weeks: 0,
            days: 0,
            hours: 0,
            minutes: 0,
            seconds: 0.0,
            milliseconds: 0,
            microseconds: 0,
            weekdays: WeekdaySet::ALL,
            at: None,
            start_on: default_start_on(),
            end_on: None,
            last_run: None,
            repeat: false,
            next_run_override: None,
        }
    }
}

impl Schedule {
    /// The summed interval duration from the 7 interval fields (§3 "Derived").
    pub fn interval(&self) -> chrono::Duration {
        IntervalFields {
            weeks: self.weeks,
            days: self.days,
            hours: self.hours,
            minutes: self.minutes,
            seconds: self.seconds,
            milliseconds: self.milliseconds,
            microseconds: self.microseconds,
        }
        .to_duration()
    }

    /// §4.1: whether `now` has reached or passed `end_on`. Resolved
    /// inclusive (`now >= end_on`) per the Open Question in spec §9 —
    /// see DESIGN.md.
    pub fn past_end(&self, now: NaiveDateTime) -> bool {
        matches!(self.end_on, Some(end) if now >= end)
    }

    fn is_allowed_weekday(&self, dt: NaiveDateTime) -> bool {
        self.weekdays.contains(dt.weekday())
    }

    /// Overwrite `dt`'s time-of-day with `at` if set, keeping the same
    /// calendar date — the `make_at` behavior from the original
    /// implementation, preserved verbatim per spec §9's Open Question
    /// ("at" combined with sub-day intervals).
    fn make_at(&self, dt: NaiveDateTime) -> NaiveDateTime {
        match self.at {
            Some(at) => dt.date().and_time(at),
            None => dt,
        }
    }

    /// §4.1 `next_fire`: pure computation of the next firing time, or
    /// `None` if the schedule has no further firings.
    pub fn next_fire(&mut self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        // Step 1
        if self.past_end(now) {
            return None;
        }
        // Step 2
        if let Some(override_run) = self.next_run_override {
            return Some(override_run);
        }
        // Step 3 + 4
        let basis = self.last_run.unwrap_or(self.start_on);
        let mut candidate = basis + self.interval();
        // Step 5
        candidate = self.make_at(candidate);

        // Step 6: weekday roll-forward, defensive 7-day guard.
        let mut rolled = 0;
        while !self.is_allowed_weekday(candidate) {
            candidate += chrono::Duration::days(1);
            candidate = self.make_at(candidate);
            rolled += 1;
            if rolled > 7 {
                self.end_on = Some(basis);
                return None;
            }
        }

        Some(candidate)
    }

    /// §4.1 related operation: seconds to wait, `-1` if there is no next
    /// firing, `0` if the firing time has already passed.
    pub fn run_in(&mut self, now: NaiveDateTime) -> i64 {
        match self.next_fire(now) {
            None => -1,
            Some(next) if now > next => 0,
            Some(next) => (next - now).num_seconds().max(0),
        }
    }

    pub fn can_run(&mut self, now: NaiveDateTime) -> bool {
        self.run_in(now) == 0
    }

    /// §4.1 `reschedule`: advances bookkeeping after a firing.
    pub fn reschedule(&mut self, now: NaiveDateTime) {
        self.last_run = Some(now);
        self.next_run_override = None;
        if !self.repeat {
            self.end_on = Some(now);
        }
    }
}
