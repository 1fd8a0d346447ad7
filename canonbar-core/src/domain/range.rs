use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid day range: start {start} is after end {end}")]
pub struct RangeError {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Inclusive range of UTC days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DayRange {
    start: NaiveDate,
    end: NaiveDate,
}

impl DayRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, RangeError> {
        if start > end {
            return Err(RangeError { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn single(day: NaiveDate) -> Self {
        Self {
            start: day,
            end: day,
        }
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        self.start <= day && day <= self.end
    }

    pub fn len(&self) -> usize {
        (self.end - self.start).num_days() as usize + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d <= end)
    }

    /// Split into consecutive sub-ranges of at most `max_days` days.
    pub fn chunks(&self, max_days: usize) -> Vec<DayRange> {
        let max_days = max_days.max(1) as u64;
        let mut out = Vec::new();
        let mut cursor = self.start;
        while cursor <= self.end {
            let chunk_end = cursor
                .checked_add_days(Days::new(max_days - 1))
                .map_or(self.end, |d| d.min(self.end));
            out.push(DayRange {
                start: cursor,
                end: chunk_end,
            });
            match chunk_end.succ_opt() {
                Some(next) => cursor = next,
                None => break,
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn rejects_inverted_range() {
        assert!(DayRange::new(d("2024-01-05"), d("2024-01-01")).is_err());
    }

    #[test]
    fn iterates_inclusive_days() {
        let range = DayRange::new(d("2024-02-27"), d("2024-03-01")).unwrap();
        let days: Vec<_> = range.days().collect();
        assert_eq!(days.len(), 4); // leap year
        assert_eq!(range.len(), 4);
        assert_eq!(days[2], d("2024-02-29"));
    }

    #[test]
    fn chunks_cover_range_without_overlap() {
        let range = DayRange::new(d("2024-01-01"), d("2024-01-10")).unwrap();
        let chunks = range.chunks(4);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].end(), d("2024-01-04"));
        assert_eq!(chunks[1].start(), d("2024-01-05"));
        assert_eq!(chunks[2].end(), d("2024-01-10"));
        assert_eq!(chunks.iter().map(DayRange::len).sum::<usize>(), 10);
    }
}
