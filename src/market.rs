use chrono::{Datelike, NaiveDate, TimeDelta, Weekday};

/// Known global market holidays: New Year's Day and Christmas.
pub fn is_market_holiday(d: NaiveDate) -> bool {
    matches!((d.month(), d.day()), (1, 1) | (12, 25))
}

/// Trading days in `[start, end]`, skipping Saturdays and `today`.
///
/// Sundays stay in: they carry the Sunday-evening market open. The current
/// day is skipped because its archive blobs are still being written.
pub fn trading_days(start: NaiveDate, end: NaiveDate, today: NaiveDate) -> Vec<NaiveDate> {
    let mut days = Vec::new();
    let mut current = start;
    while current <= end {
        if current.weekday() != Weekday::Sat && current != today {
            days.push(current);
        }
        current += TimeDelta::days(1);
    }
    days
}
