// ===============================
// src/api.rs
// ===============================
//
// Permukaan RPC: nama method -> ReportService.
//
//   get_data(time_spec)          -> DataSnapshot | null
//   add_ticker(ticker)           -> TickerChange
//   delete_ticker(ticker)        -> TickerChange
//   reconstruct_reports()        -> ReconstructSummary
//   list_tickers()               -> [ticker]
//   ping()                       -> "pong"
//
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::rpc_server::{HandlerError, Params, Registry};
use crate::service::ReportService;

pub fn registry(service: Arc<ReportService>) -> Registry {
    let mut r = Registry::new();

    let svc = service.clone();
    r.register("get_data", move |p: Params| {
        let svc = svc.clone();
        async move {
            p.accept_only(&["time_spec"])?;
            let at = parse_time_spec(&p.get::<String>(0, "time_spec")?)?;
            svc.get_data(at).await
        }
    });

    let svc = service.clone();
    r.register("add_ticker", move |p: Params| {
        let svc = svc.clone();
        async move {
            p.accept_only(&["ticker"])?;
            svc.add_ticker(&p.get::<String>(0, "ticker")?).await
        }
    });

    let svc = service.clone();
    r.register("delete_ticker", move |p: Params| {
        let svc = svc.clone();
        async move {
            p.accept_only(&["ticker"])?;
            svc.delete_ticker(&p.get::<String>(0, "ticker")?).await
        }
    });

    let svc = service.clone();
    r.register("reconstruct_reports", move |p: Params| {
        let svc = svc.clone();
        async move {
            p.accept_only(&[])?;
            svc.reconstruct_reports().await
        }
    });

    let svc = service;
    r.register("list_tickers", move |p: Params| {
        let svc = svc.clone();
        async move {
            p.accept_only(&[])?;
            Ok::<_, HandlerError>(svc.list_tickers().await)
        }
    });

    r.register("ping", |p: Params| async move {
        p.accept_only(&[])?;
        Ok::<_, HandlerError>("pong")
    });

    r
}

/// Accepts RFC3339, `YYYY-MM-DD-HH:MM`, `YYYY-MM-DD HH:MM[:SS]` and `YYYY-MM-DD`.
/// Forms without an offset are read as UTC.
pub fn parse_time_spec(raw: &str) -> Result<DateTime<Utc>, HandlerError> {
    let s = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d-%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(naive.and_utc());
        }
    }
    if let Some(naive) = NaiveDate::parse_from_str(s, "%Y-%m-%d").ok().and_then(|d| d.and_hms_opt(0, 0, 0)) {
        return Ok(naive.and_utc());
    }
    Err(HandlerError::BadArguments(format!("unrecognized time_spec `{raw}`")))
}
