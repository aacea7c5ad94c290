use std::fmt;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use csv::ReaderBuilder;

const DATETIME_FORMAT: &str = "%d.%m.%Y %H:%M:%S";

/// Outcome of the post-write integrity scan. Informational only: validation
/// never fails the job.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub file: PathBuf,
    pub symbol: String,
    pub total_rows: u64,
    pub first_ts: Option<NaiveDateTime>,
    pub last_ts: Option<NaiveDateTime>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub out_of_order: u64,
    pub duplicate_ts: u64,
    pub bad_ohlc: u64,
    pub nonpositive_prices: u64,
    pub unparseable_rows: u64,
    pub issues: Vec<String>,
    pub valid: bool,
}

impl ValidationReport {
    fn new(file: &Path, symbol: &str) -> Self {
        Self {
            file: file.to_path_buf(),
            symbol: symbol.to_string(),
            total_rows: 0,
            first_ts: None,
            last_ts: None,
            min_price: None,
            max_price: None,
            out_of_order: 0,
            duplicate_ts: 0,
            bad_ohlc: 0,
            nonpositive_prices: 0,
            unparseable_rows: 0,
            issues: Vec::new(),
            valid: true,
        }
    }

    fn track_price(&mut self, low: f64, high: f64) {
        self.min_price = Some(self.min_price.map_or(low, |m| m.min(low)));
        self.max_price = Some(self.max_price.map_or(high, |m| m.max(high)));
    }
}

fn parse_row_ts(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, "%d.%m.%Y %H:%M:%S%.3f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, DATETIME_FORMAT))
        .ok()
}

/// Stream over the emitted file and tally integrity problems.
///
/// Rows are checked for chronological order, duplicate timestamps, OHLC
/// consistency (`low <= open,close <= high`), positive prices and
/// parseability. Duplicate timestamps are an error for candles (the
/// cross-day merge should have removed them) but only informational for
/// ticks, which can legitimately share a millisecond.
pub fn validate_output(path: &Path, symbol: &str, is_candle: bool, has_header: bool) -> ValidationReport {
    let mut report = ValidationReport::new(path, symbol);

    let reader = ReaderBuilder::new()
        .has_headers(has_header)
        .flexible(true)
        .from_path(path);
    let mut reader = match reader {
        Ok(r) => r,
        Err(e) => {
            report.issues.push(format!("cannot open file: {e}"));
            report.valid = false;
            return report;
        }
    };

    let mut prev_ts: Option<NaiveDateTime> = None;
    for record in reader.records() {
        let record = match record {
            Ok(r) => r,
            Err(_) => {
                report.total_rows += 1;
                report.unparseable_rows += 1;
                continue;
            }
        };
        if record.is_empty() || (record.len() == 1 && record[0].is_empty()) {
            continue;
        }
        report.total_rows += 1;

        let expected_fields = if is_candle { 6 } else { 5 };
        let ts = record.get(0).and_then(parse_row_ts);
        let (Some(ts), true) = (ts, record.len() == expected_fields) else {
            report.unparseable_rows += 1;
            continue;
        };

        if report.first_ts.is_none() {
            report.first_ts = Some(ts);
        }
        report.last_ts = Some(ts);
        if let Some(prev) = prev_ts {
            if ts < prev {
                report.out_of_order += 1;
            } else if ts == prev {
                report.duplicate_ts += 1;
            }
        }
        prev_ts = Some(ts);

        let mut fields = [0.0f64; 4];
        let mut parsed = true;
        for (i, field) in fields.iter_mut().enumerate() {
            match record[i + 1].parse::<f64>() {
                Ok(v) => *field = v,
                Err(_) => {
                    parsed = false;
                    break;
                }
            }
        }
        if !parsed {
            report.unparseable_rows += 1;
            continue;
        }

        if is_candle {
            let [open, high, low, close] = fields;
            report.track_price(low, high);
            if open.min(close).min(low).min(high) <= 0.0 {
                report.nonpositive_prices += 1;
            }
            if !(high >= open && high >= close && high >= low && low <= open && low <= close) {
                report.bad_ohlc += 1;
            }
        } else {
            let [ask, bid, ..] = fields;
            report.track_price(bid.min(ask), ask.max(bid));
            if ask <= 0.0 || bid <= 0.0 {
                report.nonpositive_prices += 1;
            }
        }
    }

    if report.total_rows == 0 {
        report.issues.push("file is empty".to_string());
        report.valid = false;
    }
    if report.out_of_order > 0 {
        report
            .issues
            .push(format!("{} rows out of order", report.out_of_order));
        report.valid = false;
    }
    if report.duplicate_ts > 0 {
        let msg = format!("{} duplicate timestamps", report.duplicate_ts);
        if is_candle {
            report.issues.push(msg);
            report.valid = false;
        } else {
            report.issues.push(format!("{msg} (ticks, informational)"));
        }
    }
    if report.nonpositive_prices > 0 {
        report.issues.push(format!(
            "{} rows with zero or negative prices",
            report.nonpositive_prices
        ));
        report.valid = false;
    }
    if report.bad_ohlc > 0 {
        report
            .issues
            .push(format!("{} rows with inconsistent OHLC", report.bad_ohlc));
        report.valid = false;
    }
    if report.unparseable_rows > 0 {
        report
            .issues
            .push(format!("{} unparseable rows", report.unparseable_rows));
        report.valid = false;
    }

    report
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:=<60}", "")?;
        writeln!(f, "  Validation report: {}", self.symbol)?;
        writeln!(f, "{:=<60}", "")?;
        writeln!(f, "  File:       {}", self.file.display())?;
        writeln!(f, "  Total rows: {}", self.total_rows)?;
        if let (Some(first), Some(last)) = (self.first_ts, self.last_ts) {
            writeln!(f, "  Date range: {first} -> {last}")?;
        }
        if let (Some(min), Some(max)) = (self.min_price, self.max_price) {
            writeln!(f, "  Prices:     {min:.5} - {max:.5}")?;
        }
        writeln!(
            f,
            "  Status:     {}",
            if self.valid { "VALID" } else { "ISSUES FOUND" }
        )?;
        if self.issues.is_empty() {
            writeln!(f, "  - no issues found")?;
        }
        for issue in &self.issues {
            writeln!(f, "  - {issue}")?;
        }
        write!(f, "{:=<60}", "")
    }
}
