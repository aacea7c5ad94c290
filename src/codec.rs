use std::io::Cursor;

use byteorder::{BigEndian, ByteOrder};
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use thiserror::Error;
use tracing::debug;

use crate::config::VOLUME_MULTIPLIER;

/// One recorded quote update, millisecond resolution, UTC.
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub ts: DateTime<Utc>,
    pub ask: f64,
    pub bid: f64,
    /// Integer volume units (raw float scaled by 1e6 and rounded).
    pub ask_vol: u64,
    pub bid_vol: u64,
}

/// One OHLCV candle; `ts` is aligned to the period boundary, UTC.
#[derive(Debug, Clone, PartialEq)]
pub struct Candle {
    pub ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

pub const TICK_RECORD_SIZE: usize = 20;
pub const CANDLE_RECORD_SIZE: usize = 24;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("not a decodable LZMA stream: {0}")]
    Lzma(String),
}

/// Decompress a bi5 blob, tolerating the archive's concatenated-stream quirk.
///
/// The archive occasionally appends a second LZMA stream (or trailing
/// garbage) after the first. Streams are decoded in sequence; once at least
/// one has decoded, an undecodable remainder is dropped.
pub fn decompress_lzma(data: &[u8]) -> Result<Vec<u8>, DecodeError> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    let mut cursor = Cursor::new(data);
    let mut decoded_any = false;

    loop {
        let before = cursor.position();
        match lzma_rs::lzma_decompress(&mut cursor, &mut out) {
            Ok(()) => decoded_any = true,
            Err(e) if decoded_any => {
                debug!("dropping {} trailing bytes: {e}", data.len() as u64 - before);
                break;
            }
            Err(e) => return Err(DecodeError::Lzma(e.to_string())),
        }
        if cursor.position() >= data.len() as u64 || cursor.position() == before {
            break;
        }
    }
    Ok(out)
}

/// Raw 20-byte tick record: time offset from the start of the hour.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawTick {
    pub time_ms: u32,
    pub ask_raw: u32,
    pub bid_raw: u32,
    pub ask_vol: f32,
    pub bid_vol: f32,
}

/// Parse a decompressed tick buffer. A trailing fragment shorter than one
/// record is discarded.
pub fn parse_ticks(buf: &[u8]) -> Vec<RawTick> {
    let remainder = buf.len() % TICK_RECORD_SIZE;
    if remainder != 0 {
        debug!("tick buffer has {remainder} trailing bytes, discarding");
    }
    buf.chunks_exact(TICK_RECORD_SIZE)
        .map(|rec| RawTick {
            time_ms: BigEndian::read_u32(&rec[0..4]),
            ask_raw: BigEndian::read_u32(&rec[4..8]),
            bid_raw: BigEndian::read_u32(&rec[8..12]),
            ask_vol: BigEndian::read_f32(&rec[12..16]),
            bid_vol: BigEndian::read_f32(&rec[16..20]),
        })
        .collect()
}

/// Resolve raw hour-relative records to absolute UTC ticks.
///
/// `time_ms` offsets are relative to the start of the HOUR, not the day.
pub fn normalize_ticks(date: NaiveDate, hour: u32, point: f64, raws: &[RawTick]) -> Vec<Tick> {
    let hour_start = date
        .and_hms_opt(hour, 0, 0)
        .expect("hour in 0..24")
        .and_utc();
    raws.iter()
        .map(|r| Tick {
            ts: hour_start + TimeDelta::milliseconds(i64::from(r.time_ms)),
            ask: f64::from(r.ask_raw) / point,
            bid: f64::from(r.bid_raw) / point,
            ask_vol: scale_volume(r.ask_vol),
            bid_vol: scale_volume(r.bid_vol),
        })
        .collect()
}

fn scale_volume(raw: f32) -> u64 {
    (f64::from(raw) * VOLUME_MULTIPLIER).round().max(0.0) as u64
}

/// Parse a decompressed native candle buffer.
///
/// 24 bytes per record, big-endian: time offset (seconds from `base`), then
/// open, close, low, high as packed integers, then an f32 volume. Volume is
/// kept as the archive reports it, rounded to 2 decimals.
pub fn parse_candles(buf: &[u8], base: DateTime<Utc>, point: f64) -> Vec<Candle> {
    let remainder = buf.len() % CANDLE_RECORD_SIZE;
    if remainder != 0 {
        debug!("candle buffer has {remainder} trailing bytes, discarding");
    }
    buf.chunks_exact(CANDLE_RECORD_SIZE)
        .map(|rec| Candle {
            ts: base + TimeDelta::seconds(i64::from(BigEndian::read_u32(&rec[0..4]))),
            open: f64::from(BigEndian::read_u32(&rec[4..8])) / point,
            close: f64::from(BigEndian::read_u32(&rec[8..12])) / point,
            low: f64::from(BigEndian::read_u32(&rec[12..16])) / point,
            high: f64::from(BigEndian::read_u32(&rec[16..20])) / point,
            volume: (f64::from(BigEndian::read_f32(&rec[20..24])) * 100.0).round() / 100.0,
        })
        .collect()
}
