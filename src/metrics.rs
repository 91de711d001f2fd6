// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use tracing::{error, info};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- RPC transport --------
pub static RPC_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("rpc_requests_total", "rpc requests (labels: method, outcome)"),
        &["method", "outcome"],
    )
    .unwrap()
});

// bucket dalam milidetik (default prometheus dalam detik)
const LATENCY_BUCKETS_MS: [f64; 14] =
    [0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0, 30000.0];

pub static RPC_LATENCY_MS: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("rpc_latency_ms", "dispatch latency (ms)").buckets(LATENCY_BUCKETS_MS.to_vec()),
    )
    .unwrap()
});

pub static CONNECTIONS_OPEN: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("rpc_connections_open", "open client connections").unwrap());

pub static PROTOCOL_DROPS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("rpc_protocol_drops_total", "connections dropped on malformed frames").unwrap()
});

// -------- Report --------
pub static REPORT_ROWS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("report_rows", "rows in the persisted report").unwrap());

pub static TRACKED_TICKERS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("report_tracked_tickers", "tracked tickers").unwrap());

pub static REFRESHES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("report_refreshes_total", "report recomputations (label: kind)"),
        &["kind"],
    )
    .unwrap()
});

pub static FETCH_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("price_fetch_failures_total", "failed price fetches (label: source)"),
        &["source"],
    )
    .unwrap()
});

// ---- Config visibility ----
pub static CONFIG_FREQUENCY_MIN: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("config_frequency_minutes", "sampling frequency").unwrap());

pub static CONFIG_SOURCE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_price_source", "price source (label: source)"), &["source"])
        .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(RPC_REQUESTS.clone())),
        REGISTRY.register(Box::new(RPC_LATENCY_MS.clone())),
        REGISTRY.register(Box::new(CONNECTIONS_OPEN.clone())),
        REGISTRY.register(Box::new(PROTOCOL_DROPS.clone())),
        REGISTRY.register(Box::new(REPORT_ROWS.clone())),
        REGISTRY.register(Box::new(TRACKED_TICKERS.clone())),
        REGISTRY.register(Box::new(REFRESHES.clone())),
        REGISTRY.register(Box::new(FETCH_FAILURES.clone())),
        REGISTRY.register(Box::new(CONFIG_FREQUENCY_MIN.clone())),
        REGISTRY.register(Box::new(CONFIG_SOURCE.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics): tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    // Read a bit to consume headers (no full parse)
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Run the metrics server in a dedicated OS thread (keeps Tokio runtime clean)
pub fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                error!(%addr, error = %e, "metrics bind failed");
                return;
            }
        };
        info!(%addr, "metrics listening");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => error!(error = %e, "metrics accept error"),
            }
        }
    });
}
