use chrono::{DateTime, Utc};

use crate::codec::{Candle, Tick};
use crate::config::{PriceSide, VolumeKind};

/// The tick price feeding candle OHLC, per configured quote side.
pub fn select_price(tick: &Tick, side: PriceSide) -> f64 {
    match side {
        PriceSide::Bid => tick.bid,
        PriceSide::Ask => tick.ask,
        PriceSide::Mid => (tick.ask + tick.bid) / 2.0,
    }
}

/// The tick volume contribution, per configured volume kind.
pub fn select_volume(tick: &Tick, kind: VolumeKind) -> f64 {
    match kind {
        VolumeKind::Total => (tick.ask_vol + tick.bid_vol) as f64,
        VolumeKind::Bid => tick.bid_vol as f64,
        VolumeKind::Ask => tick.ask_vol as f64,
        VolumeKind::Ticks => 1.0,
    }
}

#[derive(Debug, Clone)]
struct Bucket {
    key: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

/// Streaming tick-to-candle fold for one trading day.
///
/// Ticks must arrive in ascending timestamp order. Buckets are aligned to
/// `floor(epoch_seconds / period) * period`; gaps between consecutive
/// non-empty buckets are filled with zero-OHLC candles so emitted timestamps
/// advance by exactly one period.
#[derive(Debug)]
pub struct CandleBuilder {
    period: i64,
    price_side: PriceSide,
    volume_kind: VolumeKind,
    bucket: Option<Bucket>,
}

impl CandleBuilder {
    pub fn new(period_secs: u32, price_side: PriceSide, volume_kind: VolumeKind) -> Self {
        assert!(period_secs > 0, "candle period must be positive");
        Self {
            period: i64::from(period_secs),
            price_side,
            volume_kind,
            bucket: None,
        }
    }

    pub fn push(&mut self, tick: &Tick, out: &mut Vec<Candle>) {
        let ts_s = tick.ts.timestamp();
        let key = ts_s - ts_s.rem_euclid(self.period);
        let price = select_price(tick, self.price_side);
        let volume = select_volume(tick, self.volume_kind);

        match &mut self.bucket {
            Some(bucket) if bucket.key == key => {
                bucket.high = bucket.high.max(price);
                bucket.low = bucket.low.min(price);
                bucket.close = price;
                bucket.volume += volume;
            }
            Some(bucket) => {
                let prev_key = bucket.key;
                out.push(Self::emit(bucket));
                for gap_key in (prev_key + self.period..key).step_by(self.period as usize) {
                    out.push(Self::empty(gap_key));
                }
                self.bucket = Some(Bucket {
                    key,
                    open: price,
                    high: price,
                    low: price,
                    close: price,
                    volume,
                });
            }
            None => {
                self.bucket = Some(Bucket {
                    key,
                    open: price,
                    high: price,
                    low: price,
                    close: price,
                    volume,
                });
            }
        }
    }

    /// Flush the final open bucket at end-of-day.
    pub fn finish(mut self, out: &mut Vec<Candle>) {
        if let Some(bucket) = self.bucket.take() {
            out.push(Self::emit(&bucket));
        }
    }

    fn emit(bucket: &Bucket) -> Candle {
        Candle {
            ts: key_to_ts(bucket.key),
            open: bucket.open,
            high: bucket.high,
            low: bucket.low,
            close: bucket.close,
            volume: bucket.volume,
        }
    }

    fn empty(key: i64) -> Candle {
        Candle {
            ts: key_to_ts(key),
            open: 0.0,
            high: 0.0,
            low: 0.0,
            close: 0.0,
            volume: 0.0,
        }
    }
}

fn key_to_ts(key: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(key, 0).expect("bucket key within datetime range")
}

/// Aggregate one day's sorted ticks into candles.
pub fn aggregate_day(
    ticks: &[Tick],
    period_secs: u32,
    price_side: PriceSide,
    volume_kind: VolumeKind,
) -> Vec<Candle> {
    let mut out = Vec::new();
    let mut builder = CandleBuilder::new(period_secs, price_side, volume_kind);
    for tick in ticks {
        builder.push(tick, &mut out);
    }
    builder.finish(&mut out);
    out
}

/// One-row-lookahead merge of a chronologically sorted candle stream.
///
/// Periods longer than an hour can span midnight, so per-day aggregation
/// produces two fragments sharing a timestamp on consecutive days. Feeding
/// the sorted stream through here folds those fragments into one candle:
/// open from the first, close from the last, extremes and volume combined.
#[derive(Debug, Default)]
pub struct CandleMerger {
    buffered: Option<Candle>,
}

impl CandleMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next row; returns a candle once it is known to be complete.
    pub fn feed(&mut self, row: Candle) -> Option<Candle> {
        match self.buffered.take() {
            None => {
                self.buffered = Some(row);
                None
            }
            Some(prev) if prev.ts == row.ts => {
                self.buffered = Some(Candle {
                    ts: prev.ts,
                    open: prev.open,
                    high: prev.high.max(row.high),
                    low: prev.low.min(row.low),
                    close: row.close,
                    volume: prev.volume + row.volume,
                });
                None
            }
            Some(prev) => {
                self.buffered = Some(row);
                Some(prev)
            }
        }
    }

    /// Release the last buffered row, if any.
    pub fn flush(&mut self) -> Option<Candle> {
        self.buffered.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeDelta};

    fn tick_at(ts: DateTime<Utc>, price: f64, vol: u64) -> Tick {
        Tick {
            ts,
            ask: price,
            bid: price,
            ask_vol: vol,
            bid_vol: vol,
        }
    }

    fn day_start(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc()
    }

    #[test]
    fn price_side_selection() {
        let tick = Tick {
            ts: day_start(2024, 1, 2),
            ask: 1.2,
            bid: 1.0,
            ask_vol: 3,
            bid_vol: 5,
        };
        assert_eq!(select_price(&tick, PriceSide::Bid), 1.0);
        assert_eq!(select_price(&tick, PriceSide::Ask), 1.2);
        assert_eq!(select_price(&tick, PriceSide::Mid), 1.1);
        assert_eq!(select_volume(&tick, VolumeKind::Total), 8.0);
        assert_eq!(select_volume(&tick, VolumeKind::Bid), 5.0);
        assert_eq!(select_volume(&tick, VolumeKind::Ask), 3.0);
        assert_eq!(select_volume(&tick, VolumeKind::Ticks), 1.0);
    }

    #[test]
    fn ohlc_tracks_extremes_within_bucket() {
        let base = day_start(2024, 3, 4);
        let prices = [1.10, 1.15, 1.05, 1.12];
        let ticks: Vec<Tick> = prices
            .iter()
            .enumerate()
            .map(|(i, p)| tick_at(base + TimeDelta::seconds(i as i64), *p, 1))
            .collect();

        let candles = aggregate_day(&ticks, 60, PriceSide::Bid, VolumeKind::Total);
        assert_eq!(candles.len(), 1);
        let c = &candles[0];
        assert_eq!(c.ts, base);
        assert_eq!(c.open, 1.10);
        assert_eq!(c.high, 1.15);
        assert_eq!(c.low, 1.05);
        assert_eq!(c.close, 1.12);
        assert_eq!(c.volume, 8.0);
        assert!(c.low <= c.open && c.open <= c.high);
        assert!(c.low <= c.close && c.close <= c.high);
    }

    #[test]
    fn gaps_are_filled_with_empty_candles() {
        let base = day_start(2024, 3, 4);
        let ticks = vec![
            tick_at(base, 1.0, 1),
            tick_at(base + TimeDelta::seconds(185), 1.2, 1),
        ];

        let candles = aggregate_day(&ticks, 60, PriceSide::Bid, VolumeKind::Ticks);
        assert_eq!(candles.len(), 4);
        for pair in candles.windows(2) {
            assert_eq!((pair[1].ts - pair[0].ts).num_seconds(), 60);
        }
        assert_eq!(candles[1].open, 0.0);
        assert_eq!(candles[1].volume, 0.0);
        assert_eq!(candles[2].volume, 0.0);
        assert_eq!(candles[3].open, 1.2);
    }

    #[test]
    fn aggregation_is_idempotent_over_its_own_output() {
        let base = day_start(2024, 3, 4);
        let mut seed = 0x2545_F491u64;
        let mut ticks = Vec::new();
        for i in 0..500 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let price = 1.0 + (seed % 1000) as f64 / 10_000.0;
            ticks.push(tick_at(base + TimeDelta::seconds(i * 7), price, 1));
        }
        let first = aggregate_day(&ticks, 300, PriceSide::Bid, VolumeKind::Ticks);

        // Re-aggregate the candle opens/closes as degenerate ticks.
        let degenerate: Vec<Tick> = first
            .iter()
            .filter(|c| c.volume > 0.0)
            .flat_map(|c| {
                [
                    tick_at(c.ts, c.open, 1),
                    tick_at(c.ts + TimeDelta::seconds(1), c.high, 1),
                    tick_at(c.ts + TimeDelta::seconds(2), c.low, 1),
                    tick_at(c.ts + TimeDelta::seconds(3), c.close, 1),
                ]
            })
            .collect();
        let second = aggregate_day(&degenerate, 300, PriceSide::Bid, VolumeKind::Total);

        let non_empty: Vec<&Candle> = first.iter().filter(|c| c.volume > 0.0).collect();
        let merged: Vec<&Candle> = second.iter().filter(|c| c.volume > 0.0).collect();
        assert_eq!(non_empty.len(), merged.len());
        for (a, b) in non_empty.iter().zip(&merged) {
            assert_eq!(a.ts, b.ts);
            assert_eq!(a.open, b.open);
            assert_eq!(a.high, b.high);
            assert_eq!(a.low, b.low);
            assert_eq!(a.close, b.close);
        }
    }

    #[test]
    fn midnight_spanning_candle_merges_to_one_row() {
        // 7h candles: 21:00 on day one and 00:00 on day two share a bucket.
        let period = 7 * 3600;
        let d1 = day_start(2023, 1, 1) + TimeDelta::hours(21);
        let d2 = day_start(2023, 1, 2);

        let day1: Vec<Tick> = (0..60)
            .map(|i| tick_at(d1 + TimeDelta::seconds(i), 1.0, 1))
            .collect();
        let day2: Vec<Tick> = (0..60)
            .map(|i| tick_at(d2 + TimeDelta::seconds(i), 1.0, 1))
            .collect();

        let mut rows = aggregate_day(&day1, period, PriceSide::Bid, VolumeKind::Total);
        rows.extend(aggregate_day(&day2, period, PriceSide::Bid, VolumeKind::Total));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].ts, rows[1].ts);

        let mut merger = CandleMerger::new();
        let mut merged = Vec::new();
        for row in rows {
            if let Some(done) = merger.feed(row) {
                merged.push(done);
            }
        }
        merged.extend(merger.flush());

        assert_eq!(merged.len(), 1);
        let c = &merged[0];
        assert_eq!(c.ts, d1);
        assert_eq!(c.open, 1.0);
        assert_eq!(c.high, 1.0);
        assert_eq!(c.low, 1.0);
        assert_eq!(c.close, 1.0);
        assert_eq!(c.volume, 240.0);
    }

    #[test]
    fn merger_passes_distinct_timestamps_through() {
        let base = day_start(2024, 5, 6);
        let a = Candle {
            ts: base,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10.0,
        };
        let b = Candle {
            ts: base + TimeDelta::hours(1),
            open: 1.5,
            high: 1.6,
            low: 1.4,
            close: 1.6,
            volume: 5.0,
        };

        let mut merger = CandleMerger::new();
        assert!(merger.feed(a.clone()).is_none());
        assert_eq!(merger.feed(b.clone()), Some(a));
        assert_eq!(merger.flush(), Some(b));
        assert_eq!(merger.flush(), None);
    }
}
