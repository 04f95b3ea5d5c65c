use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const MAX_SEQUENCE: u8 = 99;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CrawlIdError {
    #[error("crawl id must be 10 digits (YYYYMMDDNN), got {0:?}")]
    Malformed(String),

    #[error("invalid date in crawl id {0:?}")]
    InvalidDate(String),

    #[error("sequence must be within 1..=99, got {0}")]
    SequenceOutOfRange(u32),

    #[error("sequence for {0} reached 99")]
    SequenceExhausted(NaiveDate),
}

/// Run identifier: a calendar date plus a per-day sequence.
///
/// Rendered as `YYYYMMDDNN`. Ordering is by date, then sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct CrawlId {
    date: NaiveDate,
    sequence: u8,
}

impl CrawlId {
    pub fn new(date: NaiveDate, sequence: u8) -> Result<Self, CrawlIdError> {
        if sequence == 0 || sequence > MAX_SEQUENCE {
            return Err(CrawlIdError::SequenceOutOfRange(sequence as u32));
        }
        Ok(Self { date, sequence })
    }

    pub fn first_of(date: NaiveDate) -> Self {
        Self { date, sequence: 1 }
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    /// The id that follows `self` for a run started on `today`.
    ///
    /// A stored id dated after `today` (clock skew between processes) is
    /// incremented rather than restarted so ids never go backwards.
    pub fn next_for(&self, today: NaiveDate) -> Result<Self, CrawlIdError> {
        if self.date < today {
            return Ok(Self::first_of(today));
        }
        if self.sequence >= MAX_SEQUENCE {
            return Err(CrawlIdError::SequenceExhausted(self.date));
        }
        Ok(Self {
            date: self.date,
            sequence: self.sequence + 1,
        })
    }

    /// `YYYYMMDD`
    pub fn date_tag(&self) -> String {
        date_tag(self.date)
    }

    /// Two-digit sequence used to name list partitions.
    pub fn suffix(&self) -> String {
        format!("{:02}", self.sequence)
    }

    pub fn as_i64(&self) -> i64 {
        let d = self.date;
        (d.year() as i64) * 1_000_000 + (d.month() as i64) * 10_000 + (d.day() as i64) * 100
            + self.sequence as i64
    }

    pub fn from_i64(v: i64) -> Result<Self, CrawlIdError> {
        if !(1_000_000_000..=9_999_999_999).contains(&v) {
            return Err(CrawlIdError::Malformed(v.to_string()));
        }
        let sequence = (v % 100) as u32;
        let ymd = v / 100;
        let date = NaiveDate::from_ymd_opt(
            (ymd / 10_000) as i32,
            ((ymd / 100) % 100) as u32,
            (ymd % 100) as u32,
        )
        .ok_or_else(|| CrawlIdError::InvalidDate(v.to_string()))?;
        if sequence == 0 || sequence > MAX_SEQUENCE as u32 {
            return Err(CrawlIdError::SequenceOutOfRange(sequence));
        }
        Ok(Self {
            date,
            sequence: sequence as u8,
        })
    }
}

pub fn date_tag(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

impl fmt::Display for CrawlId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:02}", self.date_tag(), self.sequence)
    }
}

impl FromStr for CrawlId {
    type Err = CrawlIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != 10 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CrawlIdError::Malformed(s.to_string()));
        }
        let v: i64 = s
            .parse()
            .map_err(|_| CrawlIdError::Malformed(s.to_string()))?;
        Self::from_i64(v)
    }
}

impl TryFrom<i64> for CrawlId {
    type Error = CrawlIdError;

    fn try_from(v: i64) -> Result<Self, Self::Error> {
        Self::from_i64(v)
    }
}

impl From<CrawlId> for i64 {
    fn from(id: CrawlId) -> Self {
        id.as_i64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn formats_as_date_plus_two_digit_sequence() {
        let id = CrawlId::new(d(2026, 10, 14), 3).unwrap();
        assert_eq!(id.to_string(), "2026101403");
        assert_eq!(id.as_i64(), 2026101403);
        assert_eq!(id.suffix(), "03");
        assert_eq!(id.date_tag(), "20261014");
    }

    #[test]
    fn parses_what_it_prints() {
        let id: CrawlId = "2026010199".parse().unwrap();
        assert_eq!(id.date(), d(2026, 1, 1));
        assert_eq!(id.sequence(), 99);
        assert_eq!(CrawlId::from_i64(id.as_i64()).unwrap(), id);
    }

    #[test]
    fn rejects_bad_input() {
        assert!("20261014".parse::<CrawlId>().is_err());
        assert!("2026101400".parse::<CrawlId>().is_err());
        assert!("2026133101".parse::<CrawlId>().is_err());
        assert!("20261o1401".parse::<CrawlId>().is_err());
    }

    #[test]
    fn orders_by_date_then_sequence() {
        let a = CrawlId::new(d(2026, 10, 13), 99).unwrap();
        let b = CrawlId::new(d(2026, 10, 14), 1).unwrap();
        let c = CrawlId::new(d(2026, 10, 14), 2).unwrap();
        assert!(a < b && b < c);
        assert!(a.as_i64() < b.as_i64() && b.as_i64() < c.as_i64());
    }

    #[test]
    fn next_restarts_on_new_day_and_increments_same_day() {
        let today = d(2026, 10, 14);
        let yesterday = CrawlId::new(d(2026, 10, 13), 7).unwrap();
        assert_eq!(yesterday.next_for(today).unwrap().to_string(), "2026101401");

        let same = CrawlId::new(today, 7).unwrap();
        assert_eq!(same.next_for(today).unwrap().to_string(), "2026101408");
    }

    #[test]
    fn next_never_goes_backwards_under_skew() {
        let ahead = CrawlId::new(d(2026, 10, 15), 2).unwrap();
        let next = ahead.next_for(d(2026, 10, 14)).unwrap();
        assert!(next > ahead);
    }

    #[test]
    fn sequence_ceiling_is_an_error() {
        let last = CrawlId::new(d(2026, 10, 14), 99).unwrap();
        assert!(matches!(
            last.next_for(d(2026, 10, 14)),
            Err(CrawlIdError::SequenceExhausted(_))
        ));
    }

    #[test]
    fn serializes_as_number() {
        let id = CrawlId::new(d(2026, 10, 14), 1).unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "2026101401");
        let back: CrawlId = serde_json::from_str("2026101401").unwrap();
        assert_eq!(back, id);
    }
}
