// ===============================
// src/rpc_client.rs
// ===============================
//
// Client RPC: satu koneksi persisten, satu request in-flight (tanpa pipelining,
// dijamin oleh &mut self). Nama method dinamis; helper bertipe di bawah hanya
// pembungkus tipis di atas `call`.
//
// Koneksi gagal di tengah call -> socket dibuang; call berikutnya wajib connect() lagi.
//
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::io::{BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::codec::{decode_response, encode_request, read_frame, write_frame, ProtocolError, Request};
use crate::config::DEFAULT_MAX_FRAME_BYTES;
use crate::domain::{DataSnapshot, ReconstructSummary, TickerChange};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,
    #[error("connection failed: {0}")]
    Connection(#[from] ProtocolError),
    #[error("server error: {0}")]
    Remote(String),
    #[error("unexpected reply: {0}")]
    Decode(#[from] serde_json::Error),
}

struct Conn {
    rd: BufReader<OwnedReadHalf>,
    wr: BufWriter<OwnedWriteHalf>,
}

pub struct RpcClient {
    addr: String,
    max_frame: usize,
    conn: Option<Conn>,
}

impl RpcClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into(), max_frame: DEFAULT_MAX_FRAME_BYTES, conn: None }
    }

    pub fn addr(&self) -> &str { &self.addr }

    pub fn is_connected(&self) -> bool { self.conn.is_some() }

    pub async fn connect(&mut self) -> Result<(), ClientError> {
        if self.conn.is_some() {
            return Ok(());
        }
        let stream = TcpStream::connect(&self.addr).await.map_err(|e| ClientError::Connection(e.into()))?;
        let _ = stream.set_nodelay(true);
        let (rd, wr) = stream.into_split();
        self.conn = Some(Conn { rd: BufReader::new(rd), wr: BufWriter::new(wr) });
        info!(addr = %self.addr, "rpc client connected");
        Ok(())
    }

    /// Idempotent.
    pub fn disconnect(&mut self) {
        if self.conn.take().is_some() {
            info!(addr = %self.addr, "rpc client disconnected");
        }
    }

    /// Invoke `method` remotely and wait for its single reply.
    pub async fn call(&mut self, method: &str, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<Value, ClientError> {
        let max_frame = self.max_frame;
        let conn = self.conn.as_mut().ok_or(ClientError::NotConnected)?;
        let body = encode_request(&Request::new(method, args, kwargs))?;
        debug!(%method, "rpc call");

        let reply = async {
            write_frame(&mut conn.wr, &body).await?;
            let frame = read_frame(&mut conn.rd, max_frame).await?;
            decode_response(&frame)
        }
        .await;

        match reply {
            Ok(resp) => resp.into_result().map_err(ClientError::Remote),
            Err(e) => {
                warn!(%method, error = %e, "rpc call failed, dropping connection");
                self.conn = None;
                Err(ClientError::Connection(e))
            }
        }
    }

    async fn call_as<T: DeserializeOwned>(&mut self, method: &str, args: Vec<Value>) -> Result<T, ClientError> {
        let v = self.call(method, args, Map::new()).await?;
        Ok(serde_json::from_value(v)?)
    }

    /// `None` means the server has no data for that time.
    pub async fn get_data(&mut self, at: DateTime<Utc>) -> Result<Option<DataSnapshot>, ClientError> {
        self.call_as("get_data", vec![json!(at.to_rfc3339())]).await
    }

    pub async fn add_ticker(&mut self, ticker: &str) -> Result<TickerChange, ClientError> {
        self.call_as("add_ticker", vec![json!(ticker)]).await
    }

    pub async fn delete_ticker(&mut self, ticker: &str) -> Result<TickerChange, ClientError> {
        self.call_as("delete_ticker", vec![json!(ticker)]).await
    }

    pub async fn reconstruct_reports(&mut self) -> Result<ReconstructSummary, ClientError> {
        self.call_as("reconstruct_reports", vec![]).await
    }

    pub async fn list_tickers(&mut self) -> Result<Vec<String>, ClientError> {
        self.call_as("list_tickers", vec![]).await
    }

    pub async fn ping(&mut self) -> Result<String, ClientError> { self.call_as("ping", vec![]).await }
}
