use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use chrono::{Datelike, NaiveDate};
use futures::future;
use reqwest::Client;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::warn;

use crate::codec::{self, Tick};
use crate::config::FetchSettings;
use crate::fetch::{self, FetchError};

/// Hourly tick blob URL. The archive's month segment is 0-indexed
/// (January = `00`, December = `11`).
pub fn tick_url(base: &str, symbol: &str, date: NaiveDate, hour: u32) -> String {
    format!(
        "{base}/{symbol}/{:04}/{:02}/{:02}/{hour:02}h_ticks.bi5",
        date.year(),
        date.month0(),
        date.day()
    )
}

/// Download all 24 hourly blobs for one trading day.
///
/// Hours fan out as tasks gated by `permits` (the global per-host cap), with
/// a small delay between submissions to stay under the origin's burst
/// detection. Results come back sorted by hour. Only a throttling signal
/// escapes; every other per-hour failure has already degraded to empty bytes.
pub async fn fetch_day(
    client: &Client,
    settings: &FetchSettings,
    symbol: &str,
    date: NaiveDate,
    permits: Arc<Semaphore>,
    cancel: Arc<AtomicBool>,
) -> Result<Vec<(u32, Vec<u8>)>, FetchError> {
    let mut handles = Vec::with_capacity(24);
    for hour in 0..24u32 {
        let url = tick_url(&settings.base_url, symbol, date, hour);
        let task_client = client.clone();
        let task_settings = settings.clone();
        let task_permits = permits.clone();
        let task_cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            let _permit = task_permits.acquire_owned().await.unwrap();
            let body = fetch::fetch_blob(&task_client, &task_settings, &url, &task_cancel).await?;
            Ok::<_, FetchError>((hour, body))
        }));
        if !settings.request_delay.is_zero() {
            sleep(settings.request_delay).await;
        }
    }

    let mut blobs = Vec::with_capacity(24);
    let mut throttled = None;
    for joined in future::join_all(handles).await {
        match joined {
            Ok(Ok(pair)) => blobs.push(pair),
            Ok(Err(e)) => throttled = Some(e),
            Err(e) => warn!("{symbol} {date}: hour task failed: {e}"),
        }
    }
    if let Some(e) = throttled {
        return Err(e);
    }
    blobs.sort_by_key(|(hour, _)| *hour);
    Ok(blobs)
}

/// Decode a day's hourly blobs into one ascending tick sequence.
///
/// An undecodable blob loses that hour only; the day still completes.
pub fn decode_day(
    symbol: &str,
    date: NaiveDate,
    blobs: &[(u32, Vec<u8>)],
    point: f64,
) -> Vec<Tick> {
    let mut ticks = Vec::new();
    for (hour, blob) in blobs {
        if blob.is_empty() {
            continue;
        }
        match codec::decompress_lzma(blob) {
            Ok(raw) => {
                let raws = codec::parse_ticks(&raw);
                ticks.extend(codec::normalize_ticks(date, *hour, point, &raws));
            }
            Err(e) => {
                warn!("{symbol} {date} hour {hour:02}: undecodable blob, skipping ({e})");
            }
        }
    }
    ticks.sort_by_key(|t| t.ts);
    ticks
}
