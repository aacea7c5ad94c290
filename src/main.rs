use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use clap::Parser;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use tickdl::DownloadArgs;
use tickdl::service::{DownloaderService, ProgressObserver};

/// Terminal observer: one progress bar per symbol.
struct CliObserver {
    bars: MultiProgress,
    active: Mutex<HashMap<String, ProgressBar>>,
    style: ProgressStyle,
}

impl CliObserver {
    fn new() -> Self {
        Self {
            bars: MultiProgress::new(),
            active: Mutex::new(HashMap::new()),
            style: ProgressStyle::default_bar()
                .template("{prefix:>8} [{bar:30.cyan/blue}] {pos}/{len} days {msg}")
                .expect("valid progress template")
                .progress_chars("=>-"),
        }
    }
}

impl ProgressObserver for CliObserver {
    fn on_start(&self, symbol: &str, total_days: usize) {
        let pb = self.bars.add(ProgressBar::new(total_days as u64));
        pb.set_style(self.style.clone());
        pb.set_prefix(symbol.to_string());
        self.active.lock().unwrap().insert(symbol.to_string(), pb);
    }

    fn on_update(&self, symbol: &str, done: usize, _total: usize, success: bool) {
        if let Some(pb) = self.active.lock().unwrap().get(symbol) {
            pb.set_position(done as u64);
            if !success {
                pb.set_message("(some days failed)");
            }
        }
    }

    fn on_finish(&self, symbol: &str, output: &Path) {
        if let Some(pb) = self.active.lock().unwrap().remove(symbol) {
            pb.finish_with_message(format!("-> {}", output.display()));
        }
    }

    fn on_error(&self, symbol: &str, error: &anyhow::Error) {
        if let Some(pb) = self.active.lock().unwrap().remove(symbol) {
            pb.abandon_with_message(format!("failed: {error:#}"));
        } else {
            eprintln!("{symbol}: {error:#}");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let args = DownloadArgs::parse();
    let config = args.into_config()?;

    println!("  Symbols:    {}", config.symbols.join(", "));
    println!("  Date range: {} to {}", config.start, config.end);
    println!("  Timeframe:  {}", config.timeframe);
    println!("  Threads:    {}", config.threads);

    let observer = Arc::new(CliObserver::new());
    let service = DownloaderService::new(config, observer)?;

    let cancel = service.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ninterrupt received, finishing in-flight days...");
            cancel.store(true, Ordering::Release);
        }
    });

    let results = service.run().await?;
    for result in &results {
        println!("{}", result.validation);
    }

    if service.is_cancelled() {
        bail!("download interrupted; rerun with --resume to continue");
    }
    Ok(())
}
