// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : report_rpc — concurrent signal/PnL report server over TCP RPC
Module  : <module_name>.rs
Version : 0.5.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
Email   : kukuhtw@gmail.com
WhatsApp: https://wa.me/628129893706
LinkedIn: https://id.linkedin.com/in/kukuhtw
License : MIT (see LICENSE)

Summary : Serves price, mean-reversion band signal and realized PnL per
          tracked ticker to remote clients over a length-prefixed JSON RPC,
          keeps one lock-guarded CSV report, refreshes it from a pluggable
          price source, and exposes Prometheus metrics.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use clap::{Parser, ValueEnum};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Sampling frequency of the price grid. Only the vendor intervals are allowed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Frequency { M1, M5, M15, M30, M60 }

impl Frequency {
    pub fn minutes(&self) -> u32 {
        match self {
            Frequency::M1 => 1,
            Frequency::M5 => 5,
            Frequency::M15 => 15,
            Frequency::M30 => 30,
            Frequency::M60 => 60,
        }
    }

    pub fn step(&self) -> ChronoDuration { ChronoDuration::minutes(self.minutes() as i64) }

    /// Trailing 24h window in samples: 24 * (60 / freq).
    pub fn window_len(&self) -> usize { 24 * (60 / self.minutes() as usize) }

    /// Label dipakai vendor (Yahoo chart API): "1m", "5m", ...
    pub fn vendor_interval(&self) -> &'static str {
        match self {
            Frequency::M1 => "1m",
            Frequency::M5 => "5m",
            Frequency::M15 => "15m",
            Frequency::M30 => "30m",
            Frequency::M60 => "60m",
        }
    }
}

impl TryFrom<u32> for Frequency {
    type Error = String;
    fn try_from(m: u32) -> Result<Self, Self::Error> {
        match m {
            1 => Ok(Frequency::M1),
            5 => Ok(Frequency::M5),
            15 => Ok(Frequency::M15),
            30 => Ok(Frequency::M30),
            60 => Ok(Frequency::M60),
            other => Err(format!("unsupported frequency {other}m (allowed: 1, 5, 15, 30, 60)")),
        }
    }
}

impl From<Frequency> for u32 {
    fn from(f: Frequency) -> u32 { f.minutes() }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}m", self.minutes()) }
}

fn parse_frequency(s: &str) -> Result<Frequency, String> {
    let m: u32 = s.trim().trim_end_matches('m').parse().map_err(|_| format!("bad frequency: {s}"))?;
    Frequency::try_from(m)
}

/// Sumber harga historis
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum SourceMode {
    Mock,
    Yahoo,
    /// Harga dari file CSV (datetime,ticker,price), lihat --replay-path
    Replay,
}

impl SourceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceMode::Mock => "mock",
            SourceMode::Yahoo => "yahoo",
            SourceMode::Replay => "replay",
        }
    }
}

#[derive(Clone, Debug, Parser)]
#[command(name = "report_rpc", version, about = "Signal/PnL report server over TCP RPC")]
pub struct Args {
    // listen
    #[arg(long, env = "RPC_HOST", default_value = "0.0.0.0")]
    pub host: String,
    #[arg(long, env = "RPC_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    // tickers awal (comma separated): AAPL,MSFT
    #[arg(long, env = "TICKERS", value_delimiter = ',')]
    pub tickers: Vec<String>,

    /// Sampling frequency in minutes (1, 5, 15, 30, 60)
    #[arg(long, env = "FREQUENCY_MIN", default_value = "1", value_parser = parse_frequency)]
    pub frequency: Frequency,

    #[arg(long, env = "REPORT_PATH", default_value = "data/report.csv")]
    pub report_path: PathBuf,

    #[arg(long, env = "PRICE_SOURCE", value_enum, default_value_t = SourceMode::Mock)]
    pub source: SourceMode,

    /// Price file for `--source replay` (columns datetime,ticker,price; a report file works too)
    #[arg(long, env = "REPLAY_PATH", required_if_eq("source", "replay"))]
    pub replay_path: Option<PathBuf>,

    /// History requested on (re)construction, in days
    #[arg(long, env = "LOOKBACK_DAYS", default_value_t = 7)]
    pub lookback_days: u32,

    #[arg(long, env = "FETCH_TIMEOUT_SECS", default_value_t = 30)]
    pub fetch_timeout_secs: u64,

    #[arg(long, env = "MAX_FRAME_BYTES", default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    pub max_frame_bytes: usize,

    /// Serve Prometheus metrics on this port (disabled when unset)
    #[arg(long, env = "METRICS_PORT")]
    pub metrics_port: Option<u16>,
}

impl Args {
    pub fn listen_addr(&self) -> String { format!("{}:{}", self.host, self.port) }

    pub fn lookback(&self) -> ChronoDuration { ChronoDuration::days(self.lookback_days as i64) }

    pub fn fetch_timeout(&self) -> Duration { Duration::from_secs(self.fetch_timeout_secs) }
}

/// Normalise a ticker list: trim, upper-case, drop empties and duplicates.
pub fn normalize_tickers<I, S>(raw: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for t in raw {
        let t = t.as_ref().trim().to_ascii_uppercase();
        if !t.is_empty() && !out.contains(&t) {
            out.push(t);
        }
    }
    out
}

pub fn load() -> Args {
    // Pastikan .env dibaca (agar TICKERS, RPC_PORT, dll ter-load)
    let _ = dotenv();
    let mut args = Args::parse();
    args.tickers = normalize_tickers(&args.tickers);
    args
}
