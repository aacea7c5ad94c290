use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use futures::future;
use reqwest::Client;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::warn;

use crate::codec::{self, Candle};
use crate::config::{FetchSettings, NativePeriod, PriceSide, point_value};
use crate::fetch::{self, FetchError};
use crate::market;

/// One native candle blob to download: its URL and the instant the blob's
/// second offsets are relative to.
#[derive(Debug, Clone, PartialEq)]
pub struct CandleSource {
    pub base: DateTime<Utc>,
    pub url: String,
}

fn day_base(date: NaiveDate) -> DateTime<Utc> {
    date.and_hms_opt(0, 0, 0).expect("midnight").and_utc()
}

/// Blob locations covering `[start, end]` for the given period.
///
/// Minute candles come one blob per trading day, subject to the same
/// trading-day and holiday calendar as tick downloads; hour candles one per
/// month, day candles one per year. Months in the URL are 0-indexed, like
/// ticks.
pub fn candle_sources(
    base_url: &str,
    symbol: &str,
    period: NativePeriod,
    side: PriceSide,
    start: NaiveDate,
    end: NaiveDate,
    today: NaiveDate,
) -> Vec<CandleSource> {
    let side = side.segment();
    match period {
        NativePeriod::M1 => market::trading_days(start, end, today)
            .into_iter()
            .filter(|d| !market::is_market_holiday(*d))
            .map(|d| CandleSource {
                base: day_base(d),
                url: format!(
                    "{base_url}/{symbol}/{:04}/{:02}/{:02}/{side}_candles_min_1.bi5",
                    d.year(),
                    d.month0(),
                    d.day()
                ),
            })
            .collect(),
        NativePeriod::H1 => {
            let mut sources = Vec::new();
            let mut current = start.with_day(1).expect("day 1");
            let last = end.with_day(1).expect("day 1");
            while current <= last {
                sources.push(CandleSource {
                    base: day_base(current),
                    url: format!(
                        "{base_url}/{symbol}/{:04}/{:02}/{side}_candles_hour_1.bi5",
                        current.year(),
                        current.month0()
                    ),
                });
                current = current + Months::new(1);
            }
            sources
        }
        NativePeriod::D1 => (start.year()..=end.year())
            .map(|year| CandleSource {
                base: day_base(NaiveDate::from_ymd_opt(year, 1, 1).expect("jan 1")),
                url: format!("{base_url}/{symbol}/{year:04}/{side}_candles_day_1.bi5"),
            })
            .collect(),
    }
}

/// Keep candles inside `[start 00:00:00, end 23:59:59]`, sorted ascending.
pub fn clamp_to_range(mut candles: Vec<Candle>, start: NaiveDate, end: NaiveDate) -> Vec<Candle> {
    let lo = day_base(start);
    let hi = day_base(end) + chrono::TimeDelta::seconds(86_399);
    candles.retain(|c| c.ts >= lo && c.ts <= hi);
    candles.sort_by_key(|c| c.ts);
    candles
}

/// Download and decode the archive's pre-computed candles for the range.
///
/// Blobs cover whole days/months/years, so the decoded set is clamped to the
/// requested range afterwards. Undecodable blobs lose that period only.
#[allow(clippy::too_many_arguments)]
pub async fn fetch_native_candles(
    client: &Client,
    settings: &FetchSettings,
    symbol: &str,
    period: NativePeriod,
    side: PriceSide,
    start: NaiveDate,
    end: NaiveDate,
    permits: Arc<Semaphore>,
    cancel: Arc<AtomicBool>,
) -> Result<Vec<Candle>, FetchError> {
    let today = Utc::now().date_naive();
    let sources = candle_sources(&settings.base_url, symbol, period, side, start, end, today);
    let point = point_value(symbol);

    let mut handles = Vec::with_capacity(sources.len());
    for source in sources {
        let task_client = client.clone();
        let task_settings = settings.clone();
        let task_permits = permits.clone();
        let task_cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            let _permit = task_permits.acquire_owned().await.unwrap();
            let body =
                fetch::fetch_blob(&task_client, &task_settings, &source.url, &task_cancel).await?;
            Ok::<_, FetchError>((source, body))
        }));
        if !settings.request_delay.is_zero() {
            sleep(settings.request_delay).await;
        }
    }

    let mut candles = Vec::new();
    let mut throttled = None;
    for joined in future::join_all(handles).await {
        match joined {
            Ok(Ok((_, body))) if body.is_empty() => {}
            Ok(Ok((source, body))) => match codec::decompress_lzma(&body) {
                Ok(raw) => candles.extend(codec::parse_candles(&raw, source.base, point)),
                Err(e) => warn!("{symbol}: undecodable candle blob {}, skipping ({e})", source.url),
            },
            Ok(Err(e)) => throttled = Some(e),
            Err(e) => warn!("{symbol}: candle task failed: {e}"),
        }
    }
    if let Some(e) = throttled {
        return Err(e);
    }
    Ok(clamp_to_range(candles, start, end))
}
