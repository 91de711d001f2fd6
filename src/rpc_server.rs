// ===============================
// src/rpc_server.rs
// ===============================
//
// TCP RPC server:
// - satu task tokio per koneksi (tidak ada antrean global)
// - per koneksi: AWAITING_FRAME -> DISPATCHING -> RESPONDING -> AWAITING_FRAME ...
// - frame rusak / socket putus  -> koneksi ditutup tanpa respon
// - method tak dikenal / handler gagal / panic -> respon {"err": ...}, koneksi tetap hidup
// - shutdown: berhenti accept; koneksi yang sedang menunggu frame ditutup,
//   request yang sedang di-dispatch tetap diselesaikan dan dijawab dulu
//
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap as HashMap;
use futures_util::future::{BoxFuture, FutureExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::{BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::codec::{decode_request, encode_response, read_frame, write_frame, ProtocolError, Request, Response};
use crate::metrics::{CONNECTIONS_OPEN, PROTOCOL_DROPS, RPC_LATENCY_MS, RPC_REQUESTS};
use crate::store::StoreError;

/// Failure of one remote call. Its `Display` text is the wire error payload.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("method not found: {0}")]
    MethodNotFound(String),
    #[error("bad arguments: {0}")]
    BadArguments(String),
    #[error("price fetch timed out after {0:?}, nothing written")]
    FetchTimeout(Duration),
    #[error("report store error: {0}")]
    Store(#[from] StoreError),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: std::io::Error },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Positional + keyword arguments of one call.
#[derive(Debug, Clone, Default)]
pub struct Params {
    args: Vec<Value>,
    kwargs: Map<String, Value>,
}

impl Params {
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>) -> Self { Self { args, kwargs } }

    /// Argument at position `pos`, or keyword `name`; giving both is an error.
    pub fn get<T: DeserializeOwned>(&self, pos: usize, name: &str) -> Result<T, HandlerError> {
        let raw = match (self.args.get(pos), self.kwargs.get(name)) {
            (Some(_), Some(_)) => {
                return Err(HandlerError::BadArguments(format!("`{name}` given both positionally and by keyword")))
            }
            (Some(v), None) | (None, Some(v)) => v.clone(),
            (None, None) => return Err(HandlerError::BadArguments(format!("missing argument `{name}`"))),
        };
        serde_json::from_value(raw).map_err(|e| HandlerError::BadArguments(format!("`{name}`: {e}")))
    }

    /// Reject unexpected arguments.
    pub fn accept_only(&self, names: &[&str]) -> Result<(), HandlerError> {
        if self.args.len() > names.len() {
            return Err(HandlerError::BadArguments(format!(
                "expected at most {} positional argument(s), got {}",
                names.len(),
                self.args.len()
            )));
        }
        if let Some(k) = self.kwargs.keys().find(|k| !names.contains(&k.as_str())) {
            return Err(HandlerError::BadArguments(format!("unexpected keyword `{k}`")));
        }
        Ok(())
    }
}

type Handler = Arc<dyn Fn(Params) -> BoxFuture<'static, Result<Value, HandlerError>> + Send + Sync>;

/// Name -> handler table, built once before the server starts.
#[derive(Clone, Default)]
pub struct Registry {
    handlers: HashMap<String, Handler>,
}

impl Registry {
    pub fn new() -> Self { Self::default() }

    pub fn register<F, Fut, T>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, HandlerError>> + Send + 'static,
        T: Serialize + 'static,
    {
        let handler: Handler = Arc::new(move |params| {
            f(params)
                .map(|res| {
                    res.and_then(|v| serde_json::to_value(v).map_err(|e| HandlerError::Internal(e.to_string())))
                })
                .boxed()
        });
        self.handlers.insert(name.to_string(), handler);
        self
    }

    pub fn methods(&self) -> Vec<&str> {
        let mut m: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        m.sort_unstable();
        m
    }

    /// Run one request to completion; every failure becomes an error response.
    pub async fn dispatch(&self, req: Request) -> Response {
        let started = Instant::now();
        let Request { method, args, kwargs } = req;

        let result = match self.handlers.get(&method) {
            None => Err(HandlerError::MethodNotFound(method.clone())),
            Some(h) => {
                let fut = h(Params::new(args, kwargs));
                match AssertUnwindSafe(fut).catch_unwind().await {
                    Ok(res) => res,
                    Err(_) => Err(HandlerError::Internal(format!("handler `{method}` panicked"))),
                }
            }
        };

        let ms = started.elapsed().as_secs_f64() * 1000.0;
        RPC_LATENCY_MS.observe(ms);
        // label method hanya untuk yang terdaftar, supaya kardinalitas metrics terbatas
        let label = if self.handlers.contains_key(&method) { method.as_str() } else { "unknown" };
        match result {
            Ok(v) => {
                RPC_REQUESTS.with_label_values(&[label, "ok"]).inc();
                debug!(%method, ms, "dispatch ok");
                Response::Ok(v)
            }
            Err(e) => {
                RPC_REQUESTS.with_label_values(&[label, "error"]).inc();
                warn!(%method, ms, error = %e, "dispatch failed");
                Response::Err(e.to_string())
            }
        }
    }
}

pub struct RpcServer {
    listener: TcpListener,
    registry: Arc<Registry>,
    max_frame: usize,
}

impl RpcServer {
    pub async fn bind(addr: &str, registry: Registry, max_frame: usize) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr: addr.to_string(), source })?;
        info!(%addr, methods = ?registry.methods(), "rpc server bound");
        Ok(Self { listener, registry: Arc::new(registry), max_frame })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> { Ok(self.listener.local_addr()?) }

    /// Accept until `shutdown` resolves. Idle connections are then closed and
    /// requests already being dispatched are answered before returning.
    pub async fn run_until<S>(self, shutdown: S) -> Result<(), ServerError>
    where
        S: Future<Output = ()>,
    {
        let RpcServer { listener, registry, max_frame } = self;
        let mut workers: JoinSet<()> = JoinSet::new();
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("rpc server: stop accepting new connections");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        workers.spawn(handle_connection(stream, peer, registry.clone(), max_frame, stop_rx.clone()));
                    }
                    Err(e) => {
                        // mis. EMFILE: jangan matikan server, tunggu sebentar
                        error!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(done) = workers.join_next(), if !workers.is_empty() => reap(done),
            }
        }

        drop(listener);
        let _ = stop_tx.send(true);
        if !workers.is_empty() {
            info!(in_flight = workers.len(), "rpc server: draining connections");
        }
        while let Some(done) = workers.join_next().await {
            reap(done);
        }
        info!("rpc server: stopped");
        Ok(())
    }
}

fn reap(done: Result<(), tokio::task::JoinError>) {
    if let Err(e) = done {
        error!(error = %e, "connection worker crashed");
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<Registry>,
    max_frame: usize,
    mut stop: watch::Receiver<bool>,
) {
    info!(%peer, "connection accepted");
    CONNECTIONS_OPEN.inc();
    let _ = stream.set_nodelay(true);
    let (rd, wr) = stream.into_split();
    let mut rd = BufReader::new(rd);
    let mut wr = BufWriter::new(wr);
    let mut served: u64 = 0;

    loop {
        // hanya AWAITING_FRAME yang bisa diputus shutdown; dispatch di bawah selalu selesai
        let frame = tokio::select! {
            biased;
            _ = stop.wait_for(|s| *s) => {
                debug!(%peer, "shutdown: closing idle connection");
                break;
            }
            frame = read_frame(&mut rd, max_frame) => frame,
        };
        let body = match frame {
            Ok(b) => b,
            Err(ProtocolError::Closed) => break,
            Err(e) => {
                log_drop(peer, &e);
                break;
            }
        };
        let req = match decode_request(&body) {
            Ok(r) => r,
            Err(e) => {
                log_drop(peer, &e);
                break;
            }
        };
        debug!(%peer, method = %req.method, args = req.args.len(), "request");

        let resp = registry.dispatch(req).await;
        let bytes = match encode_response(&resp) {
            Ok(b) => b,
            Err(e) => {
                error!(%peer, error = %e, "response encode failed");
                break;
            }
        };
        if let Err(e) = write_frame(&mut wr, &bytes).await {
            warn!(%peer, error = %e, "write failed, closing");
            break;
        }
        served += 1;
    }

    CONNECTIONS_OPEN.dec();
    info!(%peer, served, "connection closed");
}

fn log_drop(peer: SocketAddr, e: &ProtocolError) {
    match e {
        ProtocolError::Io(_) => warn!(%peer, error = %e, "connection reset"),
        _ => {
            PROTOCOL_DROPS.inc();
            warn!(%peer, error = %e, "protocol error, dropping connection");
        }
    }
}
