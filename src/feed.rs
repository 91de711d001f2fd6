// ===============================
// src/feed.rs
// ===============================
//
// Price history adapters (data-fetch collaborator):
// - MockSource     : deterministic synthetic prices, only for the last `history` window
// - YahooSource    : Yahoo Finance chart API (REST, read-only)
// - InMemorySource : fixed pre-loaded series; `--source replay` loads one from CSV
//
// Notes:
// - Fetch failure of one ticker is logged and that ticker is omitted; an empty
//   PriceHistory means "no data for that window".
// - Timeouts are applied by the caller (service), not here.
//
use std::f64::consts::PI;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{Args, Frequency, SourceMode};
use crate::domain::{PriceHistory, PricePoint};
use crate::metrics::FETCH_FAILURES;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("vendor error for {ticker}: {reason}")]
    Vendor { ticker: String, reason: String },
    #[error("replay file {path}: {reason}")]
    Replay { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub tickers: Vec<String>,
    pub frequency: Frequency,
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

#[async_trait]
pub trait PriceSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch(&self, req: &FetchRequest) -> Result<PriceHistory, FetchError>;
}

pub fn build_source(args: &Args) -> Result<Arc<dyn PriceSource>, FetchError> {
    Ok(match args.source {
        SourceMode::Mock => Arc::new(MockSource::new(args.lookback())),
        SourceMode::Yahoo => Arc::new(YahooSource::new()),
        SourceMode::Replay => {
            let path = args.replay_path.as_deref().ok_or_else(|| FetchError::Replay {
                path: PathBuf::new(),
                reason: "--replay-path is required with --source replay".into(),
            })?;
            Arc::new(InMemorySource::from_csv(path)?)
        }
    })
}

// -----------------------------------------------------------------------------
// MOCK
//   Harga = base * (1 + gelombang harian + noise), noise di-seed dari (ticker, slot)
//   sehingga harga pada timestamp yang sama selalu identik antar fetch.
// -----------------------------------------------------------------------------
pub struct MockSource {
    history: Duration,
}

impl MockSource {
    pub fn new(history: Duration) -> Self { Self { history } }

    fn price_at(seed: u64, base: f64, ts: DateTime<Utc>) -> f64 {
        let minute = ts.timestamp().div_euclid(60);
        let mut rng = StdRng::seed_from_u64(seed ^ (minute as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let wave = 0.02 * (2.0 * PI * (minute % 1440) as f64 / 1440.0).sin();
        let mut noise: f64 = rng.gen_range(-0.004..0.004);
        // sesekali lonjakan supaya band tertembus
        if rng.gen_bool(0.01) {
            noise += rng.gen_range(-0.03..0.03);
        }
        (base * (1.0 + wave + noise) * 100.0).round() / 100.0
    }
}

fn ticker_seed(ticker: &str) -> u64 {
    // FNV-1a: stabil lintas proses/versi
    ticker.bytes().fold(0xcbf2_9ce4_8422_2325u64, |h, b| (h ^ b as u64).wrapping_mul(0x0100_0000_01b3))
}

#[async_trait]
impl PriceSource for MockSource {
    fn name(&self) -> &'static str { "mock" }

    async fn fetch(&self, req: &FetchRequest) -> Result<PriceHistory, FetchError> {
        let step = req.frequency.step();
        let step_secs = step.num_seconds();
        let oldest = Utc::now() - self.history;
        let since = req.since.max(oldest);

        let mut out = PriceHistory::new();
        if since > req.until {
            debug!(since = %req.since, "mock: window older than available history");
            return Ok(out);
        }
        let first = since.timestamp().div_euclid(step_secs) * step_secs;
        let Some(start) = DateTime::from_timestamp(first, 0) else { return Ok(out) };

        for ticker in &req.tickers {
            let seed = ticker_seed(ticker);
            let base = 50.0 + (seed % 450) as f64;
            let mut points = Vec::new();
            let mut t = start;
            while t <= req.until {
                if t >= since {
                    points.push(PricePoint { ts: t, price: Self::price_at(seed, base, t) });
                }
                t += step;
            }
            if !points.is_empty() {
                out.insert(ticker.clone(), points);
            }
        }
        Ok(out)
    }
}

// -----------------------------------------------------------------------------
// YAHOO FINANCE (chart API)
//   GET /v8/finance/chart/{ticker}?period1=..&period2=..&interval=1m&includePrePost=true
// -----------------------------------------------------------------------------
const YAHOO_BASE: &str = "https://query1.finance.yahoo.com/v8/finance/chart";

#[derive(Debug, Deserialize)]
struct ChartEnvelope { chart: Chart }

#[derive(Debug, Deserialize)]
struct Chart {
    result: Option<Vec<ChartResult>>,
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct Indicators { quote: Vec<Quote> }

#[derive(Debug, Deserialize)]
struct Quote {
    #[serde(default)]
    close: Vec<Option<f64>>,
}

pub struct YahooSource {
    http: reqwest::Client,
    base: String,
}

impl YahooSource {
    pub fn new() -> Self { Self::with_base(YAHOO_BASE) }

    pub fn with_base(base: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .user_agent("Mozilla/5.0 (report_rpc)")
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { http, base: base.into() }
    }

    async fn fetch_one(&self, ticker: &str, req: &FetchRequest) -> Result<Vec<PricePoint>, FetchError> {
        let url = format!("{}/{}", self.base.trim_end_matches('/'), ticker);
        let period1 = req.since.timestamp().to_string();
        let period2 = req.until.timestamp().to_string();
        let rsp = self
            .http
            .get(url)
            .query(&[
                ("period1", period1.as_str()),
                ("period2", period2.as_str()),
                ("interval", req.frequency.vendor_interval()),
                ("includePrePost", "true"),
            ])
            .send()
            .await?;

        if !rsp.status().is_success() {
            let code = rsp.status();
            let body = rsp.text().await.unwrap_or_default();
            return Err(FetchError::Vendor { ticker: ticker.to_string(), reason: format!("{code}: {body}") });
        }
        let env = rsp.json::<ChartEnvelope>().await?;
        parse_chart(ticker, env)
    }
}

impl Default for YahooSource {
    fn default() -> Self { Self::new() }
}

fn parse_chart(ticker: &str, env: ChartEnvelope) -> Result<Vec<PricePoint>, FetchError> {
    let vendor = |reason: String| FetchError::Vendor { ticker: ticker.to_string(), reason };
    if let Some(err) = env.chart.error.filter(|e| !e.is_null()) {
        return Err(vendor(err.to_string()));
    }
    let result = env.chart.result.and_then(|mut r| r.pop()).ok_or_else(|| vendor("empty result".into()))?;
    let closes = result.indicators.quote.into_iter().next().map(|q| q.close).unwrap_or_default();

    // close bisa null (menit tanpa trade) -> dilewati, nanti di-ffill oleh pipeline
    Ok(result
        .timestamp
        .iter()
        .zip(closes)
        .filter_map(|(&ts, close)| {
            let price = close.filter(|p| p.is_finite())?;
            DateTime::from_timestamp(ts, 0).map(|ts| PricePoint { ts, price })
        })
        .collect())
}

#[async_trait]
impl PriceSource for YahooSource {
    fn name(&self) -> &'static str { "yahoo" }

    async fn fetch(&self, req: &FetchRequest) -> Result<PriceHistory, FetchError> {
        let mut out = PriceHistory::new();
        for ticker in &req.tickers {
            match self.fetch_one(ticker, req).await {
                Ok(points) if !points.is_empty() => {
                    out.insert(ticker.clone(), points);
                }
                Ok(_) => debug!(%ticker, "yahoo: no points in window"),
                Err(e) => {
                    FETCH_FAILURES.with_label_values(&["yahoo"]).inc();
                    warn!(%ticker, error = %e, "yahoo: fetch failed, ticker skipped");
                }
            }
        }
        Ok(out)
    }
}

// -----------------------------------------------------------------------------
// IN-MEMORY (replay)
//   CSV: datetime (RFC3339),ticker,price; kolom lain diabaikan, jadi file report
//   lama bisa diputar ulang sebagai sumber harga.
// -----------------------------------------------------------------------------
#[derive(Debug, Deserialize)]
struct ReplayRow {
    datetime: String,
    ticker: String,
    price: f64,
}

#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    series: PriceHistory,
}

impl InMemorySource {
    pub fn new(series: PriceHistory) -> Self { Self { series } }

    pub fn from_csv(path: &Path) -> Result<Self, FetchError> {
        let replay = |reason: String| FetchError::Replay { path: path.to_path_buf(), reason };
        let mut reader = csv::Reader::from_path(path).map_err(|e| replay(e.to_string()))?;
        let mut series = PriceHistory::new();
        for (i, rec) in reader.deserialize::<ReplayRow>().enumerate() {
            let rec = rec.map_err(|e| replay(e.to_string()))?;
            let ts = DateTime::parse_from_rfc3339(&rec.datetime)
                .map_err(|e| replay(format!("line {}: {e}", i + 2)))?
                .with_timezone(&Utc);
            let ticker = rec.ticker.trim().to_ascii_uppercase();
            series.entry(ticker).or_insert_with(Vec::new).push(PricePoint { ts, price: rec.price });
        }
        for points in series.values_mut() {
            points.sort_by_key(|p| p.ts);
        }
        debug!(path = %path.display(), tickers = series.len(), "replay: series loaded");
        Ok(Self { series })
    }
}

#[async_trait]
impl PriceSource for InMemorySource {
    fn name(&self) -> &'static str { "memory" }

    async fn fetch(&self, req: &FetchRequest) -> Result<PriceHistory, FetchError> {
        let mut out = PriceHistory::new();
        for ticker in &req.tickers {
            let Some(points) = self.series.get(ticker) else { continue };
            let window: Vec<PricePoint> =
                points.iter().filter(|p| p.ts >= req.since && p.ts <= req.until).copied().collect();
            if !window.is_empty() {
                out.insert(ticker.clone(), window);
            }
        }
        Ok(out)
    }
}
