//! Calendar-month billing periods.
//!
//! Every component derives period boundaries from [`current_period`], so a
//! charge, a status read and a batch initialization all agree on the same
//! `[start, end)` range for a given instant.

use serde::{Deserialize, Serialize};
use time::{Date, Duration, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

/// Half-open UTC range `[start, end)` covering one calendar month.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Period {
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
}

impl Period {
    pub fn contains(&self, at: OffsetDateTime) -> bool {
        self.start <= at && at < self.end
    }

    pub fn start_ms(&self) -> i64 {
        to_millis(self.start)
    }

    pub fn end_ms(&self) -> i64 {
        to_millis(self.end)
    }

    /// The month immediately before this one.
    pub fn previous(&self) -> Period {
        current_period(self.start - Duration::nanoseconds(1))
    }

    /// The month immediately after this one.
    pub fn next(&self) -> Period {
        current_period(self.end)
    }
}

/// Returns the UTC calendar month containing `now`.
pub fn current_period(now: OffsetDateTime) -> Period {
    let date = now.to_offset(UtcOffset::UTC).date();
    let first = first_of_month(date);
    // 31 days past the 1st always lands in the following month.
    let next_first = first_of_month(first + Duration::days(31));
    Period {
        start: midnight_utc(first),
        end: midnight_utc(next_first),
    }
}

fn first_of_month(date: Date) -> Date {
    date - Duration::days(i64::from(date.day()) - 1)
}

fn midnight_utc(date: Date) -> OffsetDateTime {
    PrimitiveDateTime::new(date, Time::MIDNIGHT).assume_utc()
}

pub fn to_millis(at: OffsetDateTime) -> i64 {
    let millis = at.unix_timestamp_nanos() / 1_000_000;
    i64::try_from(millis).unwrap_or(if millis < 0 { i64::MIN } else { i64::MAX })
}

pub fn from_millis(ms: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}
