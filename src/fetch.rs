use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use reqwest::{Client, StatusCode, header};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::FetchSettings;

/// The archive serves 503 to bare library agents; present a browser.
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
const REFERER: &str = "https://www.dukascopy.com/swiss/english/marketwatch/historical/";

/// Statuses worth an exponential backoff before the next attempt.
const TRANSIENT_STATUSES: [u16; 4] = [500, 502, 503, 504];

/// Extra jitter added to the per-request timeout so parallel retries do not
/// realign into bursts.
const TIMEOUT_JITTER_MS: u64 = 5_000;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("persistent throttling by origin ({hits_503} of {attempts} attempts hit 503)")]
    Throttled { hits_503: u32, attempts: u32 },
}

/// Build the shared HTTP client: browser-like headers, keep-alive pool capped
/// at the hourly fan-out width, short connect timeout.
pub fn build_client(settings: &FetchSettings) -> Result<Client> {
    let mut headers = header::HeaderMap::new();
    headers.insert(header::USER_AGENT, header::HeaderValue::from_static(USER_AGENT));
    headers.insert(header::REFERER, header::HeaderValue::from_static(REFERER));
    headers.insert(
        header::ACCEPT_ENCODING,
        header::HeaderValue::from_static("gzip, deflate, br"),
    );
    let client = Client::builder()
        .default_headers(headers)
        .gzip(true)
        .brotli(true)
        .deflate(true)
        .connect_timeout(settings.connect_timeout)
        .pool_max_idle_per_host(settings.hourly_concurrency)
        .build()?;
    Ok(client)
}

/// Fetch one blob with the full retry policy.
///
/// Returns the body on 200, empty bytes on 404 (a missing hour is normal) or
/// on retry exhaustion, so an isolated lost hour never aborts a day. The only
/// error that escapes is [`FetchError::Throttled`], raised when exhaustion
/// was dominated by 503 responses.
pub async fn fetch_blob(
    client: &Client,
    settings: &FetchSettings,
    url: &str,
    cancel: &AtomicBool,
) -> Result<Vec<u8>, FetchError> {
    let mut hits_503 = 0u32;
    let mut last_error = String::new();

    for attempt in 0..settings.attempts {
        if cancel.load(Ordering::Acquire) {
            return Ok(Vec::new());
        }
        let timeout = settings.http_timeout
            + Duration::from_millis(rand::thread_rng().gen_range(0..TIMEOUT_JITTER_MS));

        match client.get(url).timeout(timeout).send().await {
            Ok(resp) if resp.status() == StatusCode::OK => match resp.bytes().await {
                Ok(body) => return Ok(body.to_vec()),
                Err(e) => {
                    last_error = e.to_string();
                    sleep(exp_backoff(settings, attempt)).await;
                }
            },
            Ok(resp) if resp.status() == StatusCode::NOT_FOUND => return Ok(Vec::new()),
            Ok(resp) if TRANSIENT_STATUSES.contains(&resp.status().as_u16()) => {
                if resp.status() == StatusCode::SERVICE_UNAVAILABLE {
                    hits_503 += 1;
                }
                last_error = format!("HTTP {}", resp.status().as_u16());
                sleep(exp_backoff(settings, attempt)).await;
            }
            Ok(resp) => {
                last_error = format!("HTTP {}", resp.status().as_u16());
                sleep(linear_backoff(settings, attempt)).await;
            }
            Err(e) => {
                // Timeouts and connection resets back off like a 5xx.
                last_error = e.to_string();
                sleep(exp_backoff(settings, attempt)).await;
            }
        }
        debug!("retrying {url} (attempt {}): {last_error}", attempt + 1);
    }

    if hits_503 * 2 > settings.attempts {
        return Err(FetchError::Throttled {
            hits_503,
            attempts: settings.attempts,
        });
    }
    warn!(
        "skipped {url} after {} attempts ({last_error})",
        settings.attempts
    );
    Ok(Vec::new())
}

/// `min(base * 2^attempt + U(0.5, 2.0), max)` for 5xx and transport faults.
fn exp_backoff(settings: &FetchSettings, attempt: u32) -> Duration {
    let base = settings.retry_base.as_secs_f64();
    let jitter: f64 = rand::thread_rng().gen_range(0.5..2.0);
    let delay = base * f64::from(1u32 << attempt.min(16)) + jitter;
    Duration::from_secs_f64(delay.min(settings.retry_max.as_secs_f64()))
}

/// `base * (attempt + 1) + U(0, 1)` for unexpected statuses.
fn linear_backoff(settings: &FetchSettings, attempt: u32) -> Duration {
    let base = settings.retry_base.as_secs_f64();
    let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
    let delay = base * f64::from(attempt + 1) + jitter;
    Duration::from_secs_f64(delay.min(settings.retry_max.as_secs_f64()))
}
