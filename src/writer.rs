use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc};
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use tempfile::NamedTempFile;

use crate::aggregate::{CandleMerger, aggregate_day};
use crate::codec::{Candle, Tick};
use crate::config::{PriceSide, TimeFrame, VolumeKind};

const DATETIME_FORMAT: &str = "%d.%m.%Y %H:%M:%S";

pub const TICK_HEADER: [&str; 5] = ["time", "ask", "bid", "ask_volume", "bid_volume"];
pub const CANDLE_HEADER: [&str; 6] = ["time", "open", "high", "low", "close", "volume"];

/// Per-symbol spill directory holding headerless per-day partials.
///
/// The name is deterministic so an interrupted run's partials are found again
/// on resume. The directory is removed only after a successful final merge;
/// every other exit path leaves it in place.
#[derive(Debug)]
struct SpillDir {
    path: PathBuf,
    merged: bool,
}

impl SpillDir {
    fn open(output_dir: &Path, symbol: &str) -> Result<Self> {
        let path = output_dir.join(format!(".partial-{symbol}"));
        fs::create_dir_all(&path)
            .with_context(|| format!("create spill dir {}", path.display()))?;
        Ok(Self {
            path,
            merged: false,
        })
    }
}

impl Drop for SpillDir {
    fn drop(&mut self) {
        if self.merged {
            let _ = fs::remove_dir_all(&self.path);
        }
    }
}

fn format_price(p: f64) -> String {
    format!("{p:.5}")
}

fn format_candle_ts(ts: DateTime<Utc>) -> String {
    ts.format(DATETIME_FORMAT).to_string()
}

/// Tick timestamps carry a `.mmm` suffix when the millisecond part is set.
fn format_tick_ts(ts: DateTime<Utc>) -> String {
    let mut s = ts.format(DATETIME_FORMAT).to_string();
    let ms = ts.timestamp_subsec_millis();
    if ms != 0 {
        s.push_str(&format!(".{ms:03}"));
    }
    s
}

fn parse_candle_row(rec: &StringRecord) -> Result<Candle> {
    if rec.len() < 6 {
        bail!("candle row has {} fields, expected 6", rec.len());
    }
    let ts = NaiveDateTime::parse_from_str(&rec[0], DATETIME_FORMAT)
        .with_context(|| format!("bad timestamp: {}", &rec[0]))?
        .and_utc();
    Ok(Candle {
        ts,
        open: rec[1].parse()?,
        high: rec[2].parse()?,
        low: rec[3].parse()?,
        close: rec[4].parse()?,
        volume: rec[5].parse()?,
    })
}

/// Streaming CSV assembly: spill one partial per completed day, then merge
/// the partials in date order into the final output file. Memory stays
/// constant no matter how long the range is.
#[derive(Debug)]
pub struct CsvDumper {
    symbol: String,
    timeframe: TimeFrame,
    start: NaiveDate,
    end: NaiveDate,
    output_dir: PathBuf,
    header: bool,
    price_side: PriceSide,
    volume_kind: VolumeKind,
    spill: SpillDir,
}

impl CsvDumper {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: &str,
        timeframe: TimeFrame,
        start: NaiveDate,
        end: NaiveDate,
        output_dir: &Path,
        header: bool,
        price_side: PriceSide,
        volume_kind: VolumeKind,
    ) -> Result<Self> {
        fs::create_dir_all(output_dir)
            .with_context(|| format!("create output dir {}", output_dir.display()))?;
        Ok(Self {
            symbol: symbol.to_string(),
            timeframe,
            start,
            end,
            output_dir: output_dir.to_path_buf(),
            header,
            price_side,
            volume_kind,
            spill: SpillDir::open(output_dir, symbol)?,
        })
    }

    /// `SYMBOL-YYYY_MM_DD-YYYY_MM_DD.csv`, start and end inclusive.
    pub fn output_path(&self) -> PathBuf {
        self.output_dir.join(format!(
            "{}-{:04}_{:02}_{:02}-{:04}_{:02}_{:02}.csv",
            self.symbol,
            self.start.year(),
            self.start.month(),
            self.start.day(),
            self.end.year(),
            self.end.month(),
            self.end.day(),
        ))
    }

    fn header_fields(&self) -> &'static [&'static str] {
        if self.timeframe.is_tick() {
            &TICK_HEADER
        } else {
            &CANDLE_HEADER
        }
    }

    /// Tick and TICKS volumes are integral; everything else gets 2 decimals.
    fn format_volume(&self, v: f64) -> String {
        match self.volume_kind {
            VolumeKind::Ticks => format!("{v:.0}"),
            _ => format!("{v:.2}"),
        }
    }

    fn partial_path(&self, day: NaiveDate) -> PathBuf {
        self.spill
            .path
            .join(format!("{:08}.part", day.num_days_from_ce()))
    }

    fn write_candle_record<W: Write>(&self, wtr: &mut csv::Writer<W>, c: &Candle) -> Result<()> {
        wtr.write_record([
            format_candle_ts(c.ts),
            format_price(c.open),
            format_price(c.high),
            format_price(c.low),
            format_price(c.close),
            self.format_volume(c.volume),
        ])?;
        Ok(())
    }

    /// Spill one completed day. Ticks must already be in ascending order.
    pub fn append_day(&self, day: NaiveDate, ticks: &[Tick]) -> Result<()> {
        if ticks.is_empty() {
            return Ok(());
        }
        let path = self.partial_path(day);
        let mut wtr = WriterBuilder::new()
            .has_headers(false)
            .from_path(&path)
            .with_context(|| format!("create partial {}", path.display()))?;

        if self.timeframe.is_tick() {
            for t in ticks {
                wtr.write_record([
                    format_tick_ts(t.ts),
                    format_price(t.ask),
                    format_price(t.bid),
                    t.ask_vol.to_string(),
                    t.bid_vol.to_string(),
                ])?;
            }
        } else {
            let candles = aggregate_day(
                ticks,
                self.timeframe.seconds(),
                self.price_side,
                self.volume_kind,
            );
            for c in &candles {
                self.write_candle_record(&mut wtr, c)?;
            }
        }
        wtr.flush()?;
        Ok(())
    }

    /// Spill the archive's pre-computed candles as a single partial.
    pub fn append_native(&self, candles: &[Candle]) -> Result<()> {
        if candles.is_empty() {
            return Ok(());
        }
        let path = self.spill.path.join("native.part");
        let mut wtr = WriterBuilder::new()
            .has_headers(false)
            .from_path(&path)
            .with_context(|| format!("create partial {}", path.display()))?;
        for c in candles {
            wtr.write_record([
                format_candle_ts(c.ts),
                format_price(c.open),
                format_price(c.high),
                format_price(c.low),
                format_price(c.close),
                format!("{:.2}", c.volume),
            ])?;
        }
        wtr.flush()?;
        Ok(())
    }

    /// Merge all partials into the final output file, written atomically.
    ///
    /// Tick partials concatenate byte-for-byte (dates are disjoint, so the
    /// stream is already globally sorted); candle partials run through the
    /// cross-day merger so a period spanning midnight collapses to one row.
    /// With `retain_partials` the spill directory survives for a later
    /// resume; otherwise it is removed.
    pub fn dump(mut self, retain_partials: bool) -> Result<PathBuf> {
        let final_path = self.output_path();

        let mut parts: Vec<PathBuf> = fs::read_dir(&self.spill.path)
            .with_context(|| format!("read spill dir {}", self.spill.path.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "part"))
            .collect();
        parts.sort();

        let mut tmp = NamedTempFile::new_in(&self.output_dir)?;
        {
            let file = tmp.as_file_mut();
            if self.header {
                writeln!(file, "{}", self.header_fields().join(","))?;
            }
            if self.timeframe.is_tick() {
                for part in &parts {
                    let mut f = File::open(part)
                        .with_context(|| format!("open partial {}", part.display()))?;
                    io::copy(&mut f, file)?;
                }
            } else {
                let mut merger = CandleMerger::new();
                let mut wtr = WriterBuilder::new().has_headers(false).from_writer(file);
                for part in &parts {
                    let mut rdr = ReaderBuilder::new()
                        .has_headers(false)
                        .from_path(part)
                        .with_context(|| format!("open partial {}", part.display()))?;
                    for rec in rdr.records() {
                        let row = parse_candle_row(&rec?)
                            .with_context(|| format!("malformed row in {}", part.display()))?;
                        if let Some(done) = merger.feed(row) {
                            self.write_candle_record(&mut wtr, &done)?;
                        }
                    }
                }
                if let Some(last) = merger.flush() {
                    self.write_candle_record(&mut wtr, &last)?;
                }
                wtr.flush()?;
            }
        }
        tmp.persist(&final_path)
            .with_context(|| format!("persist output {}", final_path.display()))?;

        if !retain_partials {
            self.spill.merged = true;
        }
        Ok(final_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use tempfile::TempDir;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn tick(ts: DateTime<Utc>, price: f64, vol: u64) -> Tick {
        Tick {
            ts,
            ask: price,
            bid: price,
            ask_vol: vol,
            bid_vol: vol,
        }
    }

    fn dumper(dir: &Path, timeframe: TimeFrame, header: bool) -> CsvDumper {
        CsvDumper::new(
            "EURUSD",
            timeframe,
            date(2024, 1, 15),
            date(2024, 1, 16),
            dir,
            header,
            PriceSide::Bid,
            VolumeKind::Total,
        )
        .unwrap()
    }

    #[test]
    fn tick_rows_keep_millisecond_precision() {
        let dir = TempDir::new().unwrap();
        let d = dumper(dir.path(), TimeFrame::Tick, true);
        let ts = date(2024, 1, 15).and_hms_opt(12, 0, 0).unwrap().and_utc()
            + TimeDelta::milliseconds(1);
        d.append_day(
            date(2024, 1, 15),
            &[Tick {
                ts,
                ask: 1.10028,
                bid: 1.10025,
                ask_vol: 750_000,
                bid_vol: 1_120_000,
            }],
        )
        .unwrap();
        let path = d.dump(false).unwrap();

        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "EURUSD-2024_01_15-2024_01_16.csv"
        );
        let content = fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next().unwrap(), "time,ask,bid,ask_volume,bid_volume");
        assert_eq!(
            lines.next().unwrap(),
            "15.01.2024 12:00:00.001,1.10028,1.10025,750000,1120000"
        );
        assert!(lines.next().is_none());
    }

    #[test]
    fn whole_second_ticks_omit_the_fraction() {
        let dir = TempDir::new().unwrap();
        let d = dumper(dir.path(), TimeFrame::Tick, false);
        let ts = date(2024, 1, 15).and_hms_opt(8, 30, 45).unwrap().and_utc();
        d.append_day(date(2024, 1, 15), &[tick(ts, 1.0, 1)]).unwrap();
        let path = d.dump(false).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("15.01.2024 08:30:45,"));
    }

    #[test]
    fn midnight_spanning_candle_merges_in_dump() {
        let dir = TempDir::new().unwrap();
        let d = CsvDumper::new(
            "EURUSD",
            TimeFrame::Custom(7 * 3600),
            date(2023, 1, 1),
            date(2023, 1, 2),
            dir.path(),
            true,
            PriceSide::Bid,
            VolumeKind::Total,
        )
        .unwrap();

        let d1 = date(2023, 1, 1).and_hms_opt(21, 0, 0).unwrap().and_utc();
        let ticks1: Vec<Tick> = (0..60)
            .map(|i| tick(d1 + TimeDelta::seconds(i), 1.0, 1))
            .collect();
        let d2 = date(2023, 1, 2).and_hms_opt(0, 0, 0).unwrap().and_utc();
        let ticks2: Vec<Tick> = (0..60)
            .map(|i| tick(d2 + TimeDelta::seconds(i), 1.0, 1))
            .collect();

        d.append_day(date(2023, 1, 1), &ticks1).unwrap();
        d.append_day(date(2023, 1, 2), &ticks2).unwrap();
        let path = d.dump(false).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "time,open,high,low,close,volume");
        assert_eq!(
            lines[1],
            "01.01.2023 21:00:00,1.00000,1.00000,1.00000,1.00000,240.00"
        );
    }

    #[test]
    fn partials_survive_without_dump_and_merge_on_resume() {
        let dir = TempDir::new().unwrap();
        let base = date(2024, 1, 15).and_hms_opt(10, 0, 0).unwrap().and_utc();
        {
            let d = dumper(dir.path(), TimeFrame::Tick, false);
            d.append_day(date(2024, 1, 15), &[tick(base, 1.1, 1)]).unwrap();
            // Dropped without dump: a crashed run.
        }
        let spill = dir.path().join(".partial-EURUSD");
        assert!(spill.exists());

        let d = dumper(dir.path(), TimeFrame::Tick, false);
        d.append_day(
            date(2024, 1, 16),
            &[tick(base + TimeDelta::days(1), 1.2, 1)],
        )
        .unwrap();
        let path = d.dump(false).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("15.01.2024"));
        assert!(lines[1].starts_with("16.01.2024"));
        assert!(!spill.exists());
    }

    #[test]
    fn retained_partials_allow_a_later_resume() {
        let dir = TempDir::new().unwrap();
        let d = dumper(dir.path(), TimeFrame::Tick, false);
        let ts = date(2024, 1, 15).and_hms_opt(9, 0, 0).unwrap().and_utc();
        d.append_day(date(2024, 1, 15), &[tick(ts, 1.0, 1)]).unwrap();
        d.dump(true).unwrap();
        assert!(dir.path().join(".partial-EURUSD").exists());
    }

    #[test]
    fn ticks_volume_kind_writes_integral_candle_volume() {
        let dir = TempDir::new().unwrap();
        let d = CsvDumper::new(
            "EURUSD",
            TimeFrame::M1,
            date(2024, 1, 15),
            date(2024, 1, 15),
            dir.path(),
            false,
            PriceSide::Bid,
            VolumeKind::Ticks,
        )
        .unwrap();
        let base = date(2024, 1, 15).and_hms_opt(7, 0, 0).unwrap().and_utc();
        let ticks: Vec<Tick> = (0..3)
            .map(|i| tick(base + TimeDelta::seconds(i), 1.5, 9))
            .collect();
        d.append_day(date(2024, 1, 15), &ticks).unwrap();
        let path = d.dump(false).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(
            content.trim_end(),
            "15.01.2024 07:00:00,1.50000,1.50000,1.50000,1.50000,3"
        );
    }
}
