// ===============================
// src/store.rs
// ===============================
//
// Report store: satu file CSV, dibaca & ditulis utuh (wholesale).
// - Kolom: datetime,ticker,price,signal,pnl (signal/pnl kosong = unset).
// - Tulis ke file sementara lalu rename -> pembaca tidak pernah melihat tabel setengah jadi.
// - Otomatis membuat parent directory jika belum ada.
// - File belum ada = tabel kosong.
//
// Store ini TIDAK mengunci dirinya sendiri; pemanggil (service) memegang lock
// untuk seluruh urutan read -> compute -> write.
//
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::domain::{ReportRow, Signal};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("report io error on {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("report csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("invalid report row {line}: {reason}")]
    InvalidRow { line: usize, reason: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct CsvRow {
    datetime: String,
    ticker: String,
    price: f64,
    signal: Option<i8>,
    pnl: Option<f64>,
}

/// In-memory snapshot of the whole report, ordered by (timestamp, ticker).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportTable {
    rows: Vec<ReportRow>,
}

impl ReportTable {
    pub fn from_rows(mut rows: Vec<ReportRow>) -> Self {
        rows.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.ticker.cmp(&b.ticker)));
        Self { rows }
    }

    pub fn rows(&self) -> &[ReportRow] { &self.rows }
    pub fn len(&self) -> usize { self.rows.len() }
    pub fn is_empty(&self) -> bool { self.rows.is_empty() }

    pub fn tickers(&self) -> BTreeSet<String> { self.rows.iter().map(|r| r.ticker.clone()).collect() }

    pub fn earliest(&self) -> Option<DateTime<Utc>> { self.rows.first().map(|r| r.timestamp) }

    pub fn rows_for<'a>(&'a self, ticker: &'a str) -> impl Iterator<Item = &'a ReportRow> + 'a {
        self.rows.iter().filter(move |r| r.ticker == ticker)
    }

    /// Latest stored timestamp not after `at`.
    pub fn floor_timestamp(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let idx = self.rows.partition_point(|r| r.timestamp <= at);
        idx.checked_sub(1).map(|i| self.rows[i].timestamp)
    }

    pub fn rows_at(&self, ts: DateTime<Utc>) -> &[ReportRow] {
        let lo = self.rows.partition_point(|r| r.timestamp < ts);
        let hi = self.rows.partition_point(|r| r.timestamp <= ts);
        &self.rows[lo..hi]
    }

    /// Union with rows of tickers not yet present; existing tickers are untouched.
    pub fn merged_with(&self, incoming: Vec<ReportRow>) -> Self {
        let present = self.tickers();
        let mut rows = self.rows.clone();
        rows.extend(incoming.into_iter().filter(|r| !present.contains(&r.ticker)));
        Self::from_rows(rows)
    }

    pub fn without_ticker(&self, ticker: &str) -> Self {
        Self { rows: self.rows.iter().filter(|r| r.ticker != ticker).cloned().collect() }
    }

    pub fn retain_tickers(&self, keep: &BTreeSet<String>) -> Self {
        Self { rows: self.rows.iter().filter(|r| keep.contains(&r.ticker)).cloned().collect() }
    }
}

#[derive(Debug, Clone)]
pub struct ReportStore {
    path: PathBuf,
}

impl ReportStore {
    pub fn new(path: impl Into<PathBuf>) -> Self { Self { path: path.into() } }

    pub fn path(&self) -> &Path { &self.path }

    pub async fn read(&self) -> Result<ReportTable, StoreError> {
        let bytes = match fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "report: no file yet, empty table");
                return Ok(ReportTable::default());
            }
            Err(source) => return Err(StoreError::Io { path: self.path.clone(), source }),
        };
        decode_table(&bytes)
    }

    pub async fn write(&self, table: &ReportTable) -> Result<(), StoreError> {
        let bytes = encode_table(table)?;
        let io_err = |source| StoreError::Io { path: self.path.clone(), source };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(io_err)?;
            }
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        // isi harus sudah di disk sebelum rename menggantikan file lama
        let mut f = fs::File::create(&tmp).await.map_err(io_err)?;
        f.write_all(&bytes).await.map_err(io_err)?;
        f.sync_all().await.map_err(io_err)?;
        drop(f);
        fs::rename(&tmp, &self.path).await.map_err(io_err)?;
        info!(path = %self.path.display(), rows = table.len(), "report: written");
        Ok(())
    }
}

fn encode_table(table: &ReportTable) -> Result<Vec<u8>, StoreError> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    for r in table.rows() {
        wtr.serialize(CsvRow {
            datetime: r.timestamp.to_rfc3339(),
            ticker: r.ticker.clone(),
            price: r.price,
            signal: r.signal.map(|s| s.sign()),
            pnl: r.pnl,
        })?;
    }
    // header tetap ditulis walau tabel kosong
    if table.is_empty() {
        wtr.write_record(["datetime", "ticker", "price", "signal", "pnl"])?;
    }
    wtr.into_inner().map_err(|e| StoreError::Csv(e.into_error().into()))
}

fn decode_table(bytes: &[u8]) -> Result<ReportTable, StoreError> {
    let mut reader = csv::Reader::from_reader(bytes);
    let mut rows = Vec::new();
    for (i, result) in reader.deserialize::<CsvRow>().enumerate() {
        let line = i + 2;
        let rec = result?;
        let timestamp = DateTime::parse_from_rfc3339(&rec.datetime)
            .map_err(|e| StoreError::InvalidRow { line, reason: format!("datetime: {e}") })?
            .with_timezone(&Utc);
        let signal = rec
            .signal
            .map(Signal::try_from)
            .transpose()
            .map_err(|reason| StoreError::InvalidRow { line, reason })?;
        rows.push(ReportRow { timestamp, ticker: rec.ticker, price: rec.price, signal, pnl: rec.pnl });
    }
    Ok(ReportTable::from_rows(rows))
}
