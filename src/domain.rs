// ===============================
// src/domain.rs
// ===============================
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Posisi yang diputuskan strategi pada satu titik: short / flat / long.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i8", try_from = "i8")]
pub enum Signal { Short, Flat, Long }

impl Signal {
    pub fn sign(&self) -> i8 { match self { Signal::Short => -1, Signal::Flat => 0, Signal::Long => 1 } }
}

impl From<Signal> for i8 {
    fn from(s: Signal) -> i8 { s.sign() }
}

impl TryFrom<i8> for Signal {
    type Error = String;
    fn try_from(v: i8) -> Result<Self, Self::Error> {
        match v {
            -1 => Ok(Signal::Short),
            0 => Ok(Signal::Flat),
            1 => Ok(Signal::Long),
            other => Err(format!("signal must be -1, 0 or 1, got {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint { pub ts: DateTime<Utc>, pub price: f64 }

/// Raw vendor output: ticker -> ordered price points.
pub type PriceHistory = BTreeMap<String, Vec<PricePoint>>;

/// One row of the persisted report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRow {
    pub timestamp: DateTime<Utc>,
    pub ticker: String,
    pub price: f64,
    pub signal: Option<Signal>,
    pub pnl: Option<f64>,
}

// ---- RPC reply payloads (shared by server and client) ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerQuote { pub price: f64, pub signal: Option<Signal> }

/// `get_data` answer: harga & sinyal semua ticker pada timestamp floor-match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSnapshot {
    pub timestamp: DateTime<Utc>,
    pub quotes: BTreeMap<String, TickerQuote>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickerChange { pub ticker: String, pub changed: bool, pub rows: usize }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconstructSummary { pub tickers: Vec<String>, pub rows: usize }
