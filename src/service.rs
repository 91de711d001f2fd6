// ===============================
// src/service.rs
// ===============================
//
// Domain server: tracked tickers + report store di balik SATU lock.
//
// Aturan lock:
// - add / delete / reconstruct memegang lock untuk seluruh read -> fetch -> compute -> write.
// - get_data: baca snapshot di bawah lock lalu lepas; jalur refresh (fallback) ambil lock lagi
//   dan cek ulang sebelum fetch.
// - Fetch dibatasi timeout; timeout = transaksi batal, tidak ada write.
// - Tracked set baru diubah SETELAH write berhasil, jadi error apa pun meninggalkan state lama.
//
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::analytics::build_rows;
use crate::config::{Args, Frequency};
use crate::domain::{DataSnapshot, ReconstructSummary, ReportRow, TickerChange, TickerQuote};
use crate::feed::{FetchRequest, PriceSource};
use crate::metrics::{FETCH_FAILURES, REFRESHES, REPORT_ROWS, TRACKED_TICKERS};
use crate::rpc_server::HandlerError;
use crate::store::{ReportStore, ReportTable};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub frequency: Frequency,
    pub lookback: ChronoDuration,
    pub fetch_timeout: Duration,
}

impl ServiceConfig {
    pub fn from_args(args: &Args) -> Self {
        Self { frequency: args.frequency, lookback: args.lookback(), fetch_timeout: args.fetch_timeout() }
    }

    /// Span of the rolling window, i.e. warm-up needed before the first signal.
    pub fn window_span(&self) -> ChronoDuration { self.frequency.step() * self.frequency.window_len() as i32 }
}

struct ReportState {
    tracked: BTreeSet<String>,
    store: ReportStore,
}

pub struct ReportService {
    cfg: ServiceConfig,
    source: Arc<dyn PriceSource>,
    state: Mutex<ReportState>,
    clock: Clock,
}

impl ReportService {
    pub fn new(cfg: ServiceConfig, source: Arc<dyn PriceSource>, store: ReportStore) -> Self {
        Self {
            cfg,
            source,
            state: Mutex::new(ReportState { tracked: BTreeSet::new(), store }),
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    fn now(&self) -> DateTime<Utc> { (self.clock)() }

    /// Startup: configured tickers -> full reconstruction; none -> adopt what the report holds.
    pub async fn bootstrap(&self, configured: &[String]) -> Result<ReconstructSummary, HandlerError> {
        if configured.is_empty() {
            let mut st = self.state.lock().await;
            let table = st.store.read().await?;
            st.tracked = table.tickers();
            publish(&st.tracked, table.len());
            info!(tickers = ?st.tracked, rows = table.len(), "bootstrap: adopted persisted report");
            return Ok(ReconstructSummary { tickers: st.tracked.iter().cloned().collect(), rows: table.len() });
        }
        let mut st = self.state.lock().await;
        let wanted: BTreeSet<String> = configured.iter().cloned().collect();
        match self.rebuild(&mut st, wanted).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                // tetap konsisten dengan isi file
                let persisted = st.store.read().await.map(|t| t.tickers()).unwrap_or_default();
                st.tracked = persisted;
                warn!(error = %e, tickers = ?st.tracked, "bootstrap: reconstruction failed, keeping persisted report");
                Err(e)
            }
        }
    }

    pub async fn list_tickers(&self) -> Vec<String> { self.state.lock().await.tracked.iter().cloned().collect() }

    /// Price and signal of every tracked ticker at the latest stored timestamp
    /// not after `at`; `None` when no data exists for that time.
    pub async fn get_data(&self, at: DateTime<Utc>) -> Result<Option<DataSnapshot>, HandlerError> {
        let (table, tracked) = {
            let st = self.state.lock().await;
            (st.store.read().await?, st.tracked.clone())
        };
        if let Some(ts) = table.floor_timestamp(at) {
            return Ok(Some(snapshot(&table, ts, &tracked)));
        }

        // ---- refresh + retry sekali (serial terhadap mutator lain) ----
        let st = self.state.lock().await;
        let table = st.store.read().await?;
        if let Some(ts) = table.floor_timestamp(at) {
            return Ok(Some(snapshot(&table, ts, &st.tracked)));
        }
        if st.tracked.is_empty() {
            return Ok(None);
        }

        REFRESHES.with_label_values(&["get_data"]).inc();
        let tickers: Vec<String> = st.tracked.iter().cloned().collect();
        info!(%at, ?tickers, "get_data: requested time predates report, refreshing");
        let rows = self.fetch_rows(&tickers, at - self.cfg.window_span(), self.now()).await?;
        if rows.is_empty() {
            info!(%at, "get_data: no data available for that time");
            return Ok(None);
        }

        let fresh = ReportTable::from_rows(rows).merged_with(table.rows().to_vec()).retain_tickers(&st.tracked);
        st.store.write(&fresh).await?;
        publish(&st.tracked, fresh.len());

        Ok(fresh.floor_timestamp(at).map(|ts| snapshot(&fresh, ts, &st.tracked)))
    }

    pub async fn add_ticker(&self, ticker: &str) -> Result<TickerChange, HandlerError> {
        let ticker = normalize_ticker(ticker)?;
        let mut st = self.state.lock().await;
        let table = st.store.read().await?;
        if st.tracked.contains(&ticker) {
            let rows = table.rows_for(&ticker).count();
            return Ok(TickerChange { ticker, changed: false, rows });
        }

        let until = self.now();
        let since = table.earliest().unwrap_or(until - self.cfg.lookback);
        let rows = self.fetch_rows(std::slice::from_ref(&ticker), since, until).await?;
        if rows.is_empty() {
            warn!(%ticker, "add_ticker: no price data, ticker not tracked");
            return Ok(TickerChange { ticker, changed: false, rows: 0 });
        }

        let added = rows.len();
        let next = table.without_ticker(&ticker).merged_with(rows);
        st.store.write(&next).await?;
        st.tracked.insert(ticker.clone());
        publish(&st.tracked, next.len());
        info!(%ticker, rows = added, "ticker added");
        Ok(TickerChange { ticker, changed: true, rows: added })
    }

    pub async fn delete_ticker(&self, ticker: &str) -> Result<TickerChange, HandlerError> {
        let ticker = normalize_ticker(ticker)?;
        let mut st = self.state.lock().await;
        if !st.tracked.contains(&ticker) {
            return Ok(TickerChange { ticker, changed: false, rows: 0 });
        }

        let table = st.store.read().await?;
        let next = table.without_ticker(&ticker);
        let removed = table.len() - next.len();
        st.store.write(&next).await?;
        st.tracked.remove(&ticker);
        publish(&st.tracked, next.len());
        info!(%ticker, rows = removed, "ticker deleted");
        Ok(TickerChange { ticker, changed: true, rows: removed })
    }

    /// Recompute every tracked ticker and overwrite the whole report. A ticker
    /// the source returns nothing for keeps its previous rows; a ticker left
    /// without any row stops being tracked.
    pub async fn reconstruct_reports(&self) -> Result<ReconstructSummary, HandlerError> {
        let mut st = self.state.lock().await;
        let wanted = st.tracked.clone();
        self.rebuild(&mut st, wanted).await
    }

    /// Caller holds the lock. `tracked` is replaced only after the write succeeds.
    async fn rebuild(&self, st: &mut ReportState, wanted: BTreeSet<String>) -> Result<ReconstructSummary, HandlerError> {
        REFRESHES.with_label_values(&["reconstruct"]).inc();

        let tickers: Vec<String> = wanted.iter().cloned().collect();
        let until = self.now();
        let rows = if tickers.is_empty() {
            Vec::new()
        } else {
            self.fetch_rows(&tickers, until - self.cfg.lookback, until).await?
        };

        let previous = st.store.read().await?;
        let next = ReportTable::from_rows(rows).merged_with(previous.rows().to_vec()).retain_tickers(&wanted);
        let kept = next.tickers();
        let dropped: Vec<&String> = wanted.difference(&kept).collect();
        if !dropped.is_empty() {
            warn!(?dropped, "reconstruct: no price data, tickers no longer tracked");
        }
        st.store.write(&next).await?;
        st.tracked = kept;
        publish(&st.tracked, next.len());
        info!(tickers = ?st.tracked, rows = next.len(), "report reconstructed");
        Ok(ReconstructSummary { tickers: st.tracked.iter().cloned().collect(), rows: next.len() })
    }

    /// Fetch (bounded by the configured timeout) and run the pipeline.
    /// Source errors count as "no data"; a timeout aborts the caller's transaction.
    async fn fetch_rows(
        &self,
        tickers: &[String],
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<ReportRow>, HandlerError> {
        let req = FetchRequest { tickers: tickers.to_vec(), frequency: self.cfg.frequency, since, until };
        let history = match timeout(self.cfg.fetch_timeout, self.source.fetch(&req)).await {
            Ok(Ok(h)) => h,
            Ok(Err(e)) => {
                FETCH_FAILURES.with_label_values(&[self.source.name()]).inc();
                warn!(source = self.source.name(), error = %e, "fetch failed, treated as no data");
                return Ok(Vec::new());
            }
            Err(_) => {
                FETCH_FAILURES.with_label_values(&[self.source.name()]).inc();
                warn!(source = self.source.name(), timeout = ?self.cfg.fetch_timeout, "fetch timed out, aborting");
                return Err(HandlerError::FetchTimeout(self.cfg.fetch_timeout));
            }
        };
        let wanted: BTreeSet<&str> = tickers.iter().map(String::as_str).collect();
        let history = history.into_iter().filter(|(t, _)| wanted.contains(t.as_str())).collect();
        Ok(build_rows(&history, self.cfg.frequency))
    }
}

fn normalize_ticker(raw: &str) -> Result<String, HandlerError> {
    let t = raw.trim().to_ascii_uppercase();
    if t.is_empty() || t.chars().any(|c| c.is_whitespace() || c == ',') {
        return Err(HandlerError::BadArguments(format!("invalid ticker `{raw}`")));
    }
    Ok(t)
}

fn snapshot(table: &ReportTable, ts: DateTime<Utc>, tracked: &BTreeSet<String>) -> DataSnapshot {
    let quotes: BTreeMap<String, TickerQuote> = table
        .rows_at(ts)
        .iter()
        .filter(|r| tracked.contains(&r.ticker))
        .map(|r| (r.ticker.clone(), TickerQuote { price: r.price, signal: r.signal }))
        .collect();
    DataSnapshot { timestamp: ts, quotes }
}

fn publish(tracked: &BTreeSet<String>, rows: usize) {
    TRACKED_TICKERS.set(tracked.len() as i64);
    REPORT_ROWS.set(rows as i64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PriceHistory, PricePoint, Signal};
    use crate::feed::FetchError;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::f64::consts::PI;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Source whose data can be swapped mid-test; counts calls.
    #[derive(Default)]
    struct ScriptedSource {
        series: std::sync::Mutex<PriceHistory>,
        calls: AtomicUsize,
        delay: Option<Duration>,
    }

    impl ScriptedSource {
        fn with(series: PriceHistory) -> Arc<Self> {
            Arc::new(Self { series: std::sync::Mutex::new(series), ..Default::default() })
        }
        fn calls(&self) -> usize { self.calls.load(Ordering::SeqCst) }
        fn clear(&self) { self.series.lock().unwrap().clear(); }
        fn replace(&self, series: PriceHistory) { *self.series.lock().unwrap() = series; }
    }

    #[async_trait]
    impl PriceSource for ScriptedSource {
        fn name(&self) -> &'static str { "scripted" }

        async fn fetch(&self, req: &FetchRequest) -> Result<PriceHistory, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(d) = self.delay {
                tokio::time::sleep(d).await;
            }
            let series = self.series.lock().unwrap().clone();
            Ok(series
                .into_iter()
                .filter(|(t, _)| req.tickers.contains(t))
                .map(|(t, pts)| (t, pts.into_iter().filter(|p| p.ts >= req.since && p.ts <= req.until).collect::<Vec<_>>()))
                .filter(|(_, pts)| !pts.is_empty())
                .collect())
        }
    }

    fn t0() -> DateTime<Utc> { Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap() }

    fn minutes(n: usize, offset: f64, spike_from: Option<usize>) -> Vec<PricePoint> {
        (0..n)
            .map(|i| {
                let mut price = offset + (i as f64 * 2.0 * PI / 60.0).sin();
                if spike_from.is_some_and(|s| i >= s) {
                    price += 10.0;
                }
                PricePoint { ts: t0() + ChronoDuration::minutes(i as i64), price }
            })
            .collect()
    }

    fn history(entries: &[(&str, Vec<PricePoint>)]) -> PriceHistory {
        entries.iter().map(|(t, p)| (t.to_string(), p.clone())).collect()
    }

    fn service(source: Arc<dyn PriceSource>, dir: &tempfile::TempDir, lookback: ChronoDuration) -> ReportService {
        let cfg = ServiceConfig { frequency: Frequency::M1, lookback, fetch_timeout: Duration::from_secs(5) };
        ReportService::new(cfg, source, ReportStore::new(dir.path().join("report.csv")))
            .with_clock(|| t0() + ChronoDuration::minutes(1499))
    }

    async fn stored(svc: &ReportService) -> ReportTable {
        let st = svc.state.lock().await;
        st.store.read().await.unwrap()
    }

    #[tokio::test]
    async fn spike_after_window_reports_long() {
        let dir = tempfile::tempdir().unwrap();
        let src = ScriptedSource::with(history(&[("AAPL", minutes(1500, 100.0, Some(1400)))]));
        let svc = service(src, &dir, ChronoDuration::days(2));
        let summary = svc.bootstrap(&["AAPL".to_string()]).await.unwrap();
        assert_eq!(summary.rows, 1500);

        let snap = svc.get_data(t0() + ChronoDuration::minutes(1450)).await.unwrap().unwrap();
        assert_eq!(snap.timestamp, t0() + ChronoDuration::minutes(1450));
        assert_eq!(snap.quotes["AAPL"].signal, Some(Signal::Long));

        // sebelum window penuh: sinyal belum ada
        let early = svc.get_data(t0() + ChronoDuration::seconds(90)).await.unwrap().unwrap();
        assert_eq!(early.timestamp, t0() + ChronoDuration::minutes(1));
        assert_eq!(early.quotes["AAPL"].signal, None);
    }

    #[tokio::test]
    async fn too_old_without_vendor_data_is_no_data_and_table_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let src = ScriptedSource::with(history(&[("AAPL", minutes(1500, 100.0, None))]));
        let svc = service(src.clone(), &dir, ChronoDuration::days(2));
        svc.bootstrap(&["AAPL".to_string()]).await.unwrap();
        let before = stored(&svc).await;

        src.clear();
        let got = svc.get_data(t0() - ChronoDuration::days(1)).await.unwrap();
        assert_eq!(got, None);
        assert_eq!(stored(&svc).await, before);
    }

    #[tokio::test]
    async fn too_old_request_refreshes_back_in_time() {
        let dir = tempfile::tempdir().unwrap();
        let src = ScriptedSource::with(history(&[("AAPL", minutes(1500, 100.0, None))]));
        // lookback 2 jam: report awal hanya berisi ekor seri
        let svc = service(src.clone(), &dir, ChronoDuration::hours(2));
        svc.bootstrap(&["AAPL".to_string()]).await.unwrap();
        let first = stored(&svc).await.earliest().unwrap();
        assert!(first > t0() + ChronoDuration::minutes(600));

        let at = t0() + ChronoDuration::minutes(100);
        let snap = svc.get_data(at).await.unwrap().unwrap();
        assert_eq!(snap.timestamp, at);
        assert_eq!(src.calls(), 2);
        assert_eq!(stored(&svc).await.earliest(), Some(t0()));
    }

    #[tokio::test]
    async fn add_ticker_merges_without_touching_others_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let src = ScriptedSource::with(history(&[
            ("AAPL", minutes(1500, 100.0, None)),
            ("MSFT", minutes(1500, 300.0, None)),
        ]));
        let svc = service(src.clone(), &dir, ChronoDuration::days(2));
        svc.bootstrap(&["AAPL".to_string()]).await.unwrap();
        let before = stored(&svc).await;

        let change = svc.add_ticker("msft").await.unwrap();
        assert_eq!(change, TickerChange { ticker: "MSFT".into(), changed: true, rows: 1500 });
        assert_eq!(svc.list_tickers().await, vec!["AAPL", "MSFT"]);

        let after = stored(&svc).await;
        assert_eq!(after.rows_for("MSFT").count(), 1500);
        assert!(after.rows_for("AAPL").eq(before.rows_for("AAPL")));

        let calls = src.calls();
        let again = svc.add_ticker("MSFT").await.unwrap();
        assert!(!again.changed);
        assert_eq!(src.calls(), calls);
        assert_eq!(stored(&svc).await, after);
    }

    #[tokio::test]
    async fn add_ticker_without_data_is_not_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let src = ScriptedSource::with(history(&[("AAPL", minutes(100, 100.0, None))]));
        let svc = service(src, &dir, ChronoDuration::days(2));
        svc.bootstrap(&["AAPL".to_string()]).await.unwrap();

        let change = svc.add_ticker("ZZZZ").await.unwrap();
        assert!(!change.changed);
        assert_eq!(svc.list_tickers().await, vec!["AAPL"]);
        assert!(svc.add_ticker("  ").await.is_err());
    }

    #[tokio::test]
    async fn delete_ticker_removes_rows_and_quotes() {
        let dir = tempfile::tempdir().unwrap();
        let src = ScriptedSource::with(history(&[
            ("AAPL", minutes(200, 100.0, None)),
            ("MSFT", minutes(200, 300.0, None)),
        ]));
        let svc = service(src, &dir, ChronoDuration::days(2));
        svc.bootstrap(&["AAPL".to_string(), "MSFT".to_string()]).await.unwrap();

        let change = svc.delete_ticker("MSFT").await.unwrap();
        assert_eq!(change, TickerChange { ticker: "MSFT".into(), changed: true, rows: 200 });
        assert_eq!(stored(&svc).await.rows_for("MSFT").count(), 0);
        assert_eq!(svc.list_tickers().await, vec!["AAPL"]);

        let snap = svc.get_data(t0() + ChronoDuration::minutes(150)).await.unwrap().unwrap();
        assert!(!snap.quotes.contains_key("MSFT"));
        assert!(snap.quotes.contains_key("AAPL"));

        assert!(!svc.delete_ticker("MSFT").await.unwrap().changed);
    }

    #[tokio::test]
    async fn fetch_timeout_aborts_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let src = Arc::new(ScriptedSource {
            series: std::sync::Mutex::new(history(&[("MSFT", minutes(10, 300.0, None))])),
            calls: AtomicUsize::new(0),
            delay: Some(Duration::from_secs(5)),
        });
        let cfg = ServiceConfig {
            frequency: Frequency::M1,
            lookback: ChronoDuration::days(2),
            fetch_timeout: Duration::from_millis(50),
        };
        let svc = ReportService::new(cfg, src, ReportStore::new(dir.path().join("report.csv")))
            .with_clock(|| t0() + ChronoDuration::minutes(1499));

        let err = svc.add_ticker("MSFT").await.unwrap_err();
        assert!(matches!(err, HandlerError::FetchTimeout(_)));
        assert!(svc.list_tickers().await.is_empty());
        assert!(!dir.path().join("report.csv").exists());
    }

    #[tokio::test]
    async fn bootstrap_without_config_adopts_persisted_tickers() {
        let dir = tempfile::tempdir().unwrap();
        let src = ScriptedSource::with(history(&[("AAPL", minutes(50, 100.0, None))]));
        let svc = service(src.clone(), &dir, ChronoDuration::days(2));
        svc.bootstrap(&["AAPL".to_string()]).await.unwrap();

        let restarted = service(src, &dir, ChronoDuration::days(2));
        let summary = restarted.bootstrap(&[]).await.unwrap();
        assert_eq!(summary, ReconstructSummary { tickers: vec!["AAPL".into()], rows: 50 });
        assert_eq!(restarted.list_tickers().await, vec!["AAPL"]);
    }

    #[tokio::test]
    async fn configured_ticker_without_data_is_not_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let src = ScriptedSource::with(history(&[("AAPL", minutes(100, 100.0, None))]));
        let svc = service(src, &dir, ChronoDuration::days(2));

        let summary = svc.bootstrap(&["AAPL".to_string(), "ZZZZ".to_string()]).await.unwrap();
        assert_eq!(summary, ReconstructSummary { tickers: vec!["AAPL".into()], rows: 100 });
        assert_eq!(svc.list_tickers().await, vec!["AAPL"]);

        svc.reconstruct_reports().await.unwrap();
        let table = stored(&svc).await;
        assert_eq!(table.tickers().into_iter().collect::<Vec<_>>(), svc.list_tickers().await);
    }

    #[tokio::test]
    async fn bootstrap_timeout_falls_back_to_persisted_tickers() {
        let dir = tempfile::tempdir().unwrap();
        let fast = ScriptedSource::with(history(&[("AAPL", minutes(50, 100.0, None))]));
        service(fast, &dir, ChronoDuration::days(2)).bootstrap(&["AAPL".to_string()]).await.unwrap();

        let slow = Arc::new(ScriptedSource {
            series: std::sync::Mutex::new(history(&[("MSFT", minutes(50, 300.0, None))])),
            calls: AtomicUsize::new(0),
            delay: Some(Duration::from_secs(5)),
        });
        let cfg = ServiceConfig {
            frequency: Frequency::M1,
            lookback: ChronoDuration::days(2),
            fetch_timeout: Duration::from_millis(50),
        };
        let svc = ReportService::new(cfg, slow, ReportStore::new(dir.path().join("report.csv")))
            .with_clock(|| t0() + ChronoDuration::minutes(1499));

        let err = svc.bootstrap(&["AAPL".to_string(), "MSFT".to_string()]).await.unwrap_err();
        assert!(matches!(err, HandlerError::FetchTimeout(_)));
        assert_eq!(svc.list_tickers().await, vec!["AAPL"]);
        assert_eq!(stored(&svc).await.rows_for("AAPL").count(), 50);
    }

    #[tokio::test]
    async fn reconstruct_keeps_silent_tickers_and_drops_untracked_rows() {
        let dir = tempfile::tempdir().unwrap();
        // sisa ticker lama di file yang tidak dikonfigurasi lagi
        let leftover: Vec<ReportRow> = minutes(10, 5.0, None)
            .into_iter()
            .map(|p| ReportRow { timestamp: p.ts, ticker: "OLD".into(), price: p.price, signal: None, pnl: None })
            .collect();
        ReportStore::new(dir.path().join("report.csv")).write(&ReportTable::from_rows(leftover)).await.unwrap();

        let src = ScriptedSource::with(history(&[
            ("AAPL", minutes(200, 100.0, None)),
            ("MSFT", minutes(200, 300.0, None)),
        ]));
        let svc = service(src.clone(), &dir, ChronoDuration::days(2));
        svc.bootstrap(&["AAPL".to_string(), "MSFT".to_string()]).await.unwrap();
        let before = stored(&svc).await;
        assert_eq!(before.rows_for("OLD").count(), 0);

        // MSFT tidak lagi dikirim vendor, AAPL berubah harga
        src.replace(history(&[("AAPL", minutes(200, 200.0, None))]));
        let summary = svc.reconstruct_reports().await.unwrap();
        assert_eq!(summary.tickers, vec!["AAPL", "MSFT"]);

        let after = stored(&svc).await;
        assert!(after.rows_for("MSFT").eq(before.rows_for("MSFT")));
        assert_eq!(after.rows_for("AAPL").count(), 200);
        assert!(after.rows_for("AAPL").all(|r| r.price > 150.0));
        assert_eq!(svc.list_tickers().await, vec!["AAPL", "MSFT"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_mutations_keep_table_and_tracked_set_in_sync() {
        let dir = tempfile::tempdir().unwrap();
        let names: Vec<String> = (0..8).map(|i| format!("T{i}")).collect();
        let entries: Vec<(&str, Vec<PricePoint>)> =
            names.iter().enumerate().map(|(i, n)| (n.as_str(), minutes(60, 10.0 * (i + 1) as f64, None))).collect();
        let src = ScriptedSource::with(history(&entries));
        let svc = Arc::new(service(src, &dir, ChronoDuration::days(2)));

        let mut tasks = tokio::task::JoinSet::new();
        for (i, name) in names.iter().cloned().enumerate() {
            let svc = svc.clone();
            tasks.spawn(async move {
                for _ in 0..3 {
                    svc.add_ticker(&name).await.unwrap();
                    svc.delete_ticker(&name).await.unwrap();
                }
                if i % 2 == 0 {
                    svc.add_ticker(&name).await.unwrap();
                }
                if i == 3 {
                    svc.reconstruct_reports().await.unwrap();
                }
            });
        }
        while let Some(done) = tasks.join_next().await {
            done.unwrap();
        }

        let expected: Vec<String> = names.iter().enumerate().filter(|(i, _)| i % 2 == 0).map(|(_, n)| n.clone()).collect();
        assert_eq!(svc.list_tickers().await, expected);
        let table = stored(&svc).await;
        assert_eq!(table.tickers().into_iter().collect::<Vec<_>>(), expected);
        for name in &expected {
            assert_eq!(table.rows_for(name).count(), 60);
        }
    }
}
