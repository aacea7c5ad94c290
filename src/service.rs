use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{NaiveDate, Utc};
use reqwest::Client;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::candles;
use crate::config::{
    DataSource, DownloadConfig, FetchSettings, NativePeriod, PriceSide, point_value,
};
use crate::day;
use crate::fetch::{self, FetchError};
use crate::market;
use crate::resume;
use crate::validate::{self, ValidationReport};
use crate::writer::CsvDumper;

/// Pause between submission bursts: after every `threads` day submissions.
const STAGGER_DELAY: Duration = Duration::from_millis(500);

/// Resume state is persisted after this many completed days.
const RESUME_SAVE_EVERY: usize = 5;

/// How long the circuit stays open after a throttling signal.
const CIRCUIT_RESET: Duration = Duration::from_secs(60);

/// The core's only coupling to a UI: four notifications, invokable from any
/// worker. Implementations handle their own thread-safety.
pub trait ProgressObserver: Send + Sync {
    fn on_start(&self, symbol: &str, total_days: usize);
    fn on_update(&self, symbol: &str, done: usize, total: usize, success: bool);
    fn on_finish(&self, symbol: &str, output: &Path);
    fn on_error(&self, symbol: &str, error: &anyhow::Error);
}

/// Short-circuits new work while the origin is throttling us.
#[derive(Debug, Default)]
struct CircuitBreaker {
    open: AtomicBool,
    reset_at_ms: AtomicU64,
}

impl CircuitBreaker {
    /// Open the circuit; returns true for the call that actually opened it.
    fn trip(&self) -> bool {
        let reset_at = Utc::now().timestamp_millis() as u64 + CIRCUIT_RESET.as_millis() as u64;
        self.reset_at_ms.store(reset_at, Ordering::Release);
        !self.open.swap(true, Ordering::AcqRel)
    }

    /// Whether new work may proceed; the first check past the reset deadline
    /// tentatively closes the circuit.
    fn allows(&self) -> bool {
        if !self.open.load(Ordering::Acquire) {
            return true;
        }
        if Utc::now().timestamp_millis() as u64 >= self.reset_at_ms.load(Ordering::Acquire) {
            self.open.store(false, Ordering::Release);
            return true;
        }
        false
    }
}

/// Finished symbol: where the merged file landed plus its integrity scan.
#[derive(Debug)]
pub struct SymbolResult {
    pub symbol: String,
    pub output: PathBuf,
    pub validation: ValidationReport,
}

/// Drives the whole pipeline: enumerates (symbol, day) work, fans days out
/// across workers, reacts to throttling and cancellation, and hands each
/// day's ticks to the spill writer.
pub struct DownloaderService {
    config: DownloadConfig,
    client: Client,
    observer: Arc<dyn ProgressObserver>,
    cancel: Arc<AtomicBool>,
    breaker: Arc<CircuitBreaker>,
    /// Global per-host connection cap shared by every day in flight, so one
    /// symbol's fan-out cannot starve another's.
    host_permits: Arc<Semaphore>,
}

impl DownloaderService {
    pub fn new(config: DownloadConfig, observer: Arc<dyn ProgressObserver>) -> Result<Self> {
        config.validate()?;
        let client = fetch::build_client(&config.fetch)?;
        let host_permits = Arc::new(Semaphore::new(config.fetch.hourly_concurrency));
        Ok(Self {
            config,
            client,
            observer,
            cancel: Arc::new(AtomicBool::new(false)),
            breaker: Arc::new(CircuitBreaker::default()),
            host_permits,
        })
    }

    /// Shared cancellation flag; set it (e.g. from a signal handler) to stop.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Which data source actually serves this run.
    fn native_period(&self) -> Result<Option<NativePeriod>> {
        match self.config.data_source {
            DataSource::Tick => Ok(None),
            DataSource::Native => {
                let Some(period) = self.config.timeframe.native() else {
                    bail!(
                        "native candles are not available for {}; use M1, H1 or D1",
                        self.config.timeframe
                    );
                };
                if self.config.price_side == PriceSide::Mid {
                    bail!("native candles are published per quote side; use BID or ASK");
                }
                Ok(Some(period))
            }
            DataSource::Auto => Ok(self
                .config
                .timeframe
                .native()
                .filter(|_| self.config.price_side != PriceSide::Mid)),
        }
    }

    /// Process every configured symbol; per-symbol failures are reported to
    /// the observer and do not abort the rest.
    pub async fn run(&self) -> Result<Vec<SymbolResult>> {
        let native = self.native_period()?;
        let today = Utc::now().date_naive();
        let all_days = market::trading_days(self.config.start, self.config.end, today);
        if all_days.is_empty() {
            info!("no trading days in the requested range");
            return Ok(Vec::new());
        }

        let mut results = Vec::new();
        for symbol in &self.config.symbols {
            if self.is_cancelled() {
                break;
            }
            let outcome = match native {
                Some(period) => self.run_native(symbol, period, all_days.len()).await,
                None => self.run_ticks(symbol, &all_days).await,
            };
            match outcome {
                Ok(Some(result)) => results.push(result),
                Ok(None) => {}
                Err(e) => {
                    error!("{symbol}: {e:#}");
                    self.observer.on_error(symbol, &e);
                }
            }
        }
        Ok(results)
    }

    async fn run_native(
        &self,
        symbol: &str,
        period: NativePeriod,
        total_days: usize,
    ) -> Result<Option<SymbolResult>> {
        let config = &self.config;
        self.observer.on_start(symbol, total_days);

        let dumper = CsvDumper::new(
            symbol,
            config.timeframe,
            config.start,
            config.end,
            &config.output_dir,
            config.header,
            config.price_side,
            config.volume_kind,
        )?;

        let candles = candles::fetch_native_candles(
            &self.client,
            &config.fetch,
            symbol,
            period,
            config.price_side,
            config.start,
            config.end,
            self.host_permits.clone(),
            self.cancel.clone(),
        )
        .await
        .map_err(|e| anyhow!(e))?;
        info!("{symbol}: received {} native candles", candles.len());

        dumper.append_native(&candles)?;
        let path = dumper.dump(false)?;
        self.observer.on_update(symbol, total_days, total_days, true);
        self.observer.on_finish(symbol, &path);

        let validation = validate::validate_output(&path, symbol, true, config.header);
        Ok(Some(SymbolResult {
            symbol: symbol.to_string(),
            output: path,
            validation,
        }))
    }

    async fn run_ticks(
        &self,
        symbol: &str,
        all_days: &[NaiveDate],
    ) -> Result<Option<SymbolResult>> {
        let config = &self.config;

        let mut pending: Vec<NaiveDate> = all_days.to_vec();
        let mut completed: Vec<NaiveDate> = Vec::new();
        if config.resume {
            let done = resume::load(&config.output_dir, symbol);
            if !done.is_empty() {
                pending.retain(|d| !done.contains(d));
                completed = all_days
                    .iter()
                    .copied()
                    .filter(|d| done.contains(d))
                    .collect();
                info!("{symbol}: resuming, {} days already done", completed.len());
            }
        }

        let holidays = pending
            .iter()
            .filter(|d| market::is_market_holiday(**d))
            .count();
        if holidays > 0 {
            info!("{symbol}: skipping {holidays} market holidays");
        }
        pending.retain(|d| !market::is_market_holiday(*d));

        if pending.is_empty() {
            info!("{symbol}: nothing left to download");
            return Ok(None);
        }

        self.observer.on_start(symbol, pending.len());

        let dumper = Arc::new(CsvDumper::new(
            symbol,
            config.timeframe,
            config.start,
            config.end,
            &config.output_dir,
            config.header,
            config.price_side,
            config.volume_kind,
        )?);
        let point = point_value(symbol);
        let workers = Arc::new(Semaphore::new(config.threads));
        let write_failed = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::with_capacity(pending.len());
        for (i, &date) in pending.iter().enumerate() {
            if self.is_cancelled() {
                break;
            }
            if i > 0 && i % config.threads == 0 {
                sleep(STAGGER_DELAY).await;
            }
            let permit = workers.clone().acquire_owned().await?;
            let client = self.client.clone();
            let settings = config.fetch.clone();
            let sym = symbol.to_string();
            let task_dumper = dumper.clone();
            let task_cancel = self.cancel.clone();
            let task_breaker = self.breaker.clone();
            let task_permits = self.host_permits.clone();
            let task_failed = write_failed.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let ok = process_day(
                    &client,
                    &settings,
                    &sym,
                    date,
                    point,
                    &task_dumper,
                    task_permits,
                    task_cancel,
                    task_breaker,
                    task_failed,
                )
                .await;
                (date, ok)
            }));
        }

        let total = pending.len();
        let mut done = 0usize;
        for handle in handles {
            let (date, ok) = handle.await?;
            done += 1;
            if ok {
                completed.push(date);
                if completed.len() % RESUME_SAVE_EVERY == 0
                    && let Err(e) = resume::save(&config.output_dir, symbol, &completed, all_days)
                {
                    warn!("{symbol}: could not persist resume state: {e:#}");
                }
            }
            self.observer.on_update(symbol, done, total, ok);
        }

        if write_failed.load(Ordering::Acquire) {
            if let Err(e) = resume::save(&config.output_dir, symbol, &completed, all_days) {
                warn!("{symbol}: could not persist resume state: {e:#}");
            }
            bail!("spill write failure; partials kept for --resume");
        }

        let cancelled = self.is_cancelled();
        if cancelled {
            if let Err(e) = resume::save(&config.output_dir, symbol, &completed, all_days) {
                warn!("{symbol}: could not persist resume state: {e:#}");
            }
            info!("{symbol}: cancelled, merging the days that finished");
        }

        let dumper = Arc::into_inner(dumper).context("spill writer still in use")?;
        let path = dumper.dump(cancelled)?;
        self.observer.on_finish(symbol, &path);
        if !cancelled {
            resume::clear(&config.output_dir, symbol)?;
        }

        let validation =
            validate::validate_output(&path, symbol, !config.timeframe.is_tick(), config.header);
        Ok(Some(SymbolResult {
            symbol: symbol.to_string(),
            output: path,
            validation,
        }))
    }
}

/// One work item: fetch a day, decode it, spill it. Returns completion.
///
/// Throttling trips the breaker instead of failing the job; while the
/// breaker is open, work items finish immediately as failures so they show
/// up again on the next resume.
#[allow(clippy::too_many_arguments)]
async fn process_day(
    client: &Client,
    settings: &FetchSettings,
    symbol: &str,
    date: NaiveDate,
    point: f64,
    dumper: &CsvDumper,
    host_permits: Arc<Semaphore>,
    cancel: Arc<AtomicBool>,
    breaker: Arc<CircuitBreaker>,
    write_failed: Arc<AtomicBool>,
) -> bool {
    if cancel.load(Ordering::Acquire) || write_failed.load(Ordering::Acquire) {
        return false;
    }
    if !breaker.allows() {
        return false;
    }

    let blobs = match day::fetch_day(client, settings, symbol, date, host_permits, cancel).await {
        Ok(blobs) => blobs,
        Err(e @ FetchError::Throttled { .. }) => {
            if breaker.trip() {
                warn!("{symbol}: {e}; backing off for {}s", CIRCUIT_RESET.as_secs());
            }
            return false;
        }
    };

    let ticks = day::decode_day(symbol, date, &blobs, point);
    match dumper.append_day(date, &ticks) {
        Ok(()) => true,
        Err(e) => {
            error!("{symbol} {date}: spill write failed: {e:#}");
            write_failed.store(true, Ordering::Release);
            false
        }
    }
}
