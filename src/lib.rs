pub mod aggregate;
pub mod candles;
pub mod codec;
pub mod config;
pub mod day;
pub mod fetch;
pub mod market;
pub mod resume;
pub mod service;
pub mod validate;
pub mod writer;

use std::path::PathBuf;

use anyhow::Result;
use chrono::NaiveDate;
use clap::Parser;

use config::{DataSource, DownloadConfig, FetchSettings, PriceSide, TimeFrame, VolumeKind};

/// CLI args
#[derive(Parser, Debug, Clone)]
#[command(
    version,
    about = "Dukascopy historical tick/candle CSV downloader with resume"
)]
pub struct DownloadArgs {
    /// Instrument symbols, e.g. EURUSD GBPUSD
    #[arg(required = true)]
    pub symbols: Vec<String>,

    /// Start date (inclusive), format YYYY-MM-DD
    #[arg(short = 's', long)]
    pub start: NaiveDate,

    /// End date (inclusive), format YYYY-MM-DD
    #[arg(short = 'e', long)]
    pub end: NaiveDate,

    /// Timeframe: TICK, S1, S10, S30, M1..M30, H1, H4, D1, or CUSTOM with --custom-tf
    #[arg(short = 't', long, default_value = "TICK")]
    pub timeframe: String,

    /// Custom period for -t CUSTOM: seconds (120) or suffixed (30s, 5m, 2h, 1d)
    #[arg(long)]
    pub custom_tf: Option<String>,

    /// Parallel day workers (1-30)
    #[arg(long, default_value_t = config::DEFAULT_THREADS)]
    pub threads: usize,

    /// Data source; auto picks native candle blobs when the period allows it
    #[arg(long, value_enum, ignore_case = true, default_value = "auto")]
    pub source: DataSource,

    /// Quote side used for candle prices
    #[arg(long, value_enum, ignore_case = true, default_value = "BID")]
    pub price_type: PriceSide,

    /// Volume aggregated into candle rows
    #[arg(long, value_enum, ignore_case = true, default_value = "TOTAL")]
    pub volume_type: VolumeKind,

    /// Omit the CSV header row
    #[arg(long)]
    pub no_header: bool,

    /// Resume a previously interrupted download
    #[arg(long)]
    pub resume: bool,

    /// Output directory
    #[arg(short = 'o', long, default_value = ".")]
    pub output: PathBuf,
}

impl DownloadArgs {
    /// Resolve the argument surface into the immutable run configuration.
    pub fn into_config(self) -> Result<DownloadConfig> {
        let timeframe = TimeFrame::parse(&self.timeframe, self.custom_tf.as_deref())?;
        let config = DownloadConfig {
            symbols: self.symbols.iter().map(|s| s.to_uppercase()).collect(),
            start: self.start,
            end: self.end,
            timeframe,
            threads: self.threads,
            data_source: self.source,
            price_side: self.price_type,
            volume_kind: self.volume_type,
            header: !self.no_header,
            resume: self.resume,
            output_dir: self.output,
            fetch: FetchSettings::from_env(),
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_resolve_with_defaults() {
        let args = DownloadArgs::parse_from([
            "tickdl", "eurusd", "-s", "2024-01-01", "-e", "2024-01-31",
        ]);
        let config = args.into_config().unwrap();
        assert_eq!(config.symbols, vec!["EURUSD"]);
        assert_eq!(config.timeframe, TimeFrame::Tick);
        assert_eq!(config.threads, 5);
        assert!(config.header);
        assert!(!config.resume);
        assert_eq!(config.data_source, DataSource::Auto);
    }

    #[test]
    fn custom_timeframe_flows_through() {
        let args = DownloadArgs::parse_from([
            "tickdl",
            "EURUSD",
            "-s",
            "2024-01-01",
            "-e",
            "2024-01-02",
            "-t",
            "custom",
            "--custom-tf",
            "7h",
            "--volume-type",
            "ticks",
            "--no-header",
        ]);
        let config = args.into_config().unwrap();
        assert_eq!(config.timeframe, TimeFrame::Custom(25200));
        assert_eq!(config.volume_kind, VolumeKind::Ticks);
        assert!(!config.header);
    }

    #[test]
    fn inverted_range_is_rejected() {
        let args = DownloadArgs::parse_from([
            "tickdl", "EURUSD", "-s", "2024-02-01", "-e", "2024-01-01",
        ]);
        assert!(args.into_config().is_err());
    }
}
