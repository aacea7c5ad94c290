use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use clap::ValueEnum;

pub const DEFAULT_THREADS: usize = 5;
pub const MAX_THREADS: usize = 30;

/// Default integer divisor for packed archive prices.
pub const DEFAULT_POINT_VALUE: f64 = 100_000.0;

/// Precious metals and the rouble pair are quoted with 3 decimal places.
const SPECIAL_POINT_SYMBOLS: [&str; 7] = [
    "usdrub", "xagusd", "xauusd", "xaugbp", "xaueur", "xageur", "xaggbp",
];

/// Divisor used to convert the archive's packed integer prices for `symbol`.
pub fn point_value(symbol: &str) -> f64 {
    let lower = symbol.to_lowercase();
    if SPECIAL_POINT_SYMBOLS.contains(&lower.as_str()) {
        1_000.0
    } else {
        DEFAULT_POINT_VALUE
    }
}

/// Tick volumes arrive as fractional millions; emitted as integer units.
pub const VOLUME_MULTIPLIER: f64 = 1_000_000.0;

/// Requested output resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeFrame {
    Tick,
    S1,
    S10,
    S30,
    M1,
    M2,
    M3,
    M4,
    M5,
    M10,
    M15,
    M30,
    H1,
    H4,
    D1,
    Custom(u32),
}

/// Periods the archive serves as pre-computed candle blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativePeriod {
    M1,
    H1,
    D1,
}

impl TimeFrame {
    /// Parse the CLI timeframe name; `CUSTOM` takes its period from `custom`.
    pub fn parse(name: &str, custom: Option<&str>) -> Result<Self> {
        let tf = match name.to_uppercase().as_str() {
            "TICK" => Self::Tick,
            "S1" => Self::S1,
            "S10" => Self::S10,
            "S30" => Self::S30,
            "M1" => Self::M1,
            "M2" => Self::M2,
            "M3" => Self::M3,
            "M4" => Self::M4,
            "M5" => Self::M5,
            "M10" => Self::M10,
            "M15" => Self::M15,
            "M30" => Self::M30,
            "H1" => Self::H1,
            "H4" => Self::H4,
            "D1" => Self::D1,
            "CUSTOM" => {
                let spec = custom.context("--custom-tf is required when using -t CUSTOM")?;
                Self::Custom(parse_custom_period(spec)?)
            }
            other => bail!("unknown timeframe: {other}"),
        };
        Ok(tf)
    }

    /// Candle period in seconds; zero for tick output.
    pub fn seconds(self) -> u32 {
        match self {
            Self::Tick => 0,
            Self::S1 => 1,
            Self::S10 => 10,
            Self::S30 => 30,
            Self::M1 => 60,
            Self::M2 => 120,
            Self::M3 => 180,
            Self::M4 => 240,
            Self::M5 => 300,
            Self::M10 => 600,
            Self::M15 => 900,
            Self::M30 => 1800,
            Self::H1 => 3600,
            Self::H4 => 14400,
            Self::D1 => 86400,
            Self::Custom(secs) => secs,
        }
    }

    pub fn is_tick(self) -> bool {
        self == Self::Tick
    }

    /// The pre-computed candle period serving this timeframe, if any.
    pub fn native(self) -> Option<NativePeriod> {
        match self {
            Self::M1 => Some(NativePeriod::M1),
            Self::H1 => Some(NativePeriod::H1),
            Self::D1 => Some(NativePeriod::D1),
            _ => None,
        }
    }
}

impl std::fmt::Display for TimeFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Custom(secs) => write!(f, "CUSTOM({secs}s)"),
            Self::Tick => write!(f, "TICK"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Parse a custom period: plain seconds (`120`) or suffixed (`30s`, `5m`, `2h`, `1d`).
pub fn parse_custom_period(spec: &str) -> Result<u32> {
    let spec = spec.trim().to_lowercase();
    let (digits, unit) = match spec.chars().last() {
        Some(c @ ('s' | 'm' | 'h' | 'd')) => (&spec[..spec.len() - 1], c),
        _ => (spec.as_str(), 's'),
    };
    let n: u32 = digits
        .parse()
        .with_context(|| format!("invalid custom timeframe: {spec}"))?;
    if n == 0 {
        bail!("custom timeframe must be positive");
    }
    let secs = match unit {
        's' => n,
        'm' => n * 60,
        'h' => n * 3600,
        _ => n * 86400,
    };
    Ok(secs)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DataSource {
    Auto,
    Tick,
    Native,
}

/// Which quote side feeds candle OHLC prices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "UPPER")]
pub enum PriceSide {
    Bid,
    Ask,
    Mid,
}

impl PriceSide {
    /// Archive path segment for native candle URLs.
    pub fn segment(self) -> &'static str {
        match self {
            Self::Bid => "BID",
            Self::Ask => "ASK",
            Self::Mid => "MID",
        }
    }
}

/// Which volume is summed into candle rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "UPPER")]
pub enum VolumeKind {
    Total,
    Bid,
    Ask,
    Ticks,
}

/// HTTP tuning knobs; overridable from the environment.
#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub base_url: String,
    pub attempts: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub request_delay: Duration,
    pub http_timeout: Duration,
    pub connect_timeout: Duration,
    pub hourly_concurrency: usize,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            base_url: "https://www.dukascopy.com/datafeed".to_string(),
            attempts: 10,
            retry_base: Duration::from_secs(1),
            retry_max: Duration::from_secs(30),
            request_delay: Duration::from_millis(100),
            http_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            hourly_concurrency: 8,
        }
    }
}

impl FetchSettings {
    /// Defaults with `TICKDL_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Ok(v) = env::var("TICKDL_BASE_URL") {
            settings.base_url = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = env_parse("TICKDL_ATTEMPTS") {
            settings.attempts = v;
        }
        if let Some(v) = env_parse("TICKDL_RETRY_BASE_MS") {
            settings.retry_base = Duration::from_millis(v);
        }
        if let Some(v) = env_parse("TICKDL_RETRY_MAX_MS") {
            settings.retry_max = Duration::from_millis(v);
        }
        if let Some(v) = env_parse("TICKDL_REQUEST_DELAY_MS") {
            settings.request_delay = Duration::from_millis(v);
        }
        if let Some(v) = env_parse("TICKDL_HTTP_TIMEOUT_S") {
            settings.http_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<usize>("TICKDL_HOURLY_CONCURRENCY") {
            settings.hourly_concurrency = v.max(1);
        }
        settings
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Immutable run configuration, resolved once from the CLI surface.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub symbols: Vec<String>,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub timeframe: TimeFrame,
    pub threads: usize,
    pub data_source: DataSource,
    pub price_side: PriceSide,
    pub volume_kind: VolumeKind,
    pub header: bool,
    pub resume: bool,
    pub output_dir: PathBuf,
    pub fetch: FetchSettings,
}

impl DownloadConfig {
    /// Reject configurations the pipeline cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            bail!("at least one symbol is required");
        }
        for s in &self.symbols {
            if s.is_empty() || !s.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()) {
                bail!("invalid symbol format: {s}");
            }
        }
        if self.start > self.end {
            bail!("start date must be before or equal to end date");
        }
        if self.threads == 0 || self.threads > MAX_THREADS {
            bail!("threads must be between 1 and {MAX_THREADS}");
        }
        Ok(())
    }
}
