// ===============================
// src/main.rs
// ===============================
/*
 # jalankan server (mock source) + metrics
 TICKERS=AAPL,MSFT METRICS_PORT=9898 cargo run --bin report_rpc

 # dari terminal lain
 cargo run --bin report_client -- get-data 2024-03-04-09:30
 curl -s localhost:9898/metrics | egrep '^(rpc_requests_total|report_rows|report_tracked_tickers)'
*/
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
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use report_rpc::{api, config, feed, metrics, rpc_server::RpcServer, service, store::ReportStore};

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Load config ----
    let args = config::load();

    // ---- Metrics ----
    metrics::init();
    if let Some(port) = args.metrics_port {
        metrics::serve_metrics(port);
    }

    // ---- Human-friendly startup info + export config to metrics ----
    info!(
        listen = %args.listen_addr(),
        tickers = ?args.tickers,
        frequency = %args.frequency,
        source = args.source.as_str(),
        report = %args.report_path.display(),
        lookback_days = args.lookback_days,
        fetch_timeout_secs = args.fetch_timeout_secs,
        "startup config"
    );
    metrics::CONFIG_FREQUENCY_MIN.set(args.frequency.minutes() as i64);
    metrics::CONFIG_SOURCE.with_label_values(&[args.source.as_str()]).set(1);

    // ---- Domain server ----
    let source = match feed::build_source(&args) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "cannot build price source");
            std::process::exit(1);
        }
    };
    let svc = Arc::new(service::ReportService::new(
        service::ServiceConfig::from_args(&args),
        source,
        ReportStore::new(args.report_path.clone()),
    ));
    match svc.bootstrap(&args.tickers).await {
        Ok(summary) => info!(tickers = ?summary.tickers, rows = summary.rows, "report ready"),
        // server tetap jalan; client bisa memanggil reconstruct_reports nanti
        Err(e) => error!(error = %e, "initial report construction failed"),
    }

    // ---- RPC server ----
    let server = match RpcServer::bind(&args.listen_addr(), api::registry(svc), args.max_frame_bytes).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "cannot start rpc server");
            std::process::exit(1);
        }
    };

    // Ctrl-C pertama: graceful (tunggu koneksi aktif). Ctrl-C kedua: keluar paksa.
    let (stop_tx, mut stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested, waiting for open connections (Ctrl-C again to force)");
            let _ = stop_tx.send(true);
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("forced exit");
            std::process::exit(130);
        }
    });

    let shutdown = async move {
        let _ = stop_rx.wait_for(|stop| *stop).await;
    };
    if let Err(e) = server.run_until(shutdown).await {
        error!(error = %e, "rpc server failed");
        std::process::exit(1);
    }
    info!("bye");
}
