// ===============================
// src/codec.rs
// ===============================
//
// Framing RPC: setiap pesan = panjang u32 big-endian + body JSON UTF-8.
//   [len: 4 byte BE][body: len byte]
// Reader selalu loop sampai satu frame utuh terkumpul (read_exact), dan
// menolak len > max_frame sebelum buffer dialokasikan.
//
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const LEN_PREFIX: usize = 4;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("connection closed by peer")]
    Closed,
    #[error("connection closed mid-frame")]
    Truncated,
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A remote call: method name, positional and keyword arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl Request {
    pub fn new(method: impl Into<String>, args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self { method: method.into(), args, kwargs }
    }
}

/// Exactly one per request: `{"ok": value}` or `{"err": "message"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Ok(Value),
    Err(String),
}

impl Response {
    pub fn into_result(self) -> Result<Value, String> {
        match self {
            Response::Ok(v) => Ok(v),
            Response::Err(e) => Err(e),
        }
    }
}

pub fn encode_request(req: &Request) -> Result<Vec<u8>, ProtocolError> { Ok(serde_json::to_vec(req)?) }

pub fn decode_request(body: &[u8]) -> Result<Request, ProtocolError> { Ok(serde_json::from_slice(body)?) }

pub fn encode_response(resp: &Response) -> Result<Vec<u8>, ProtocolError> { Ok(serde_json::to_vec(resp)?) }

pub fn decode_response(body: &[u8]) -> Result<Response, ProtocolError> { Ok(serde_json::from_slice(body)?) }

/// Read one complete frame body. EOF before the first prefix byte is `Closed`;
/// EOF anywhere later is `Truncated`.
pub async fn read_frame<R>(reader: &mut R, max_frame: usize) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    // EOF hanya "bersih" kalau belum ada satu byte pun dari frame ini
    let mut len_buf = [0u8; LEN_PREFIX];
    let mut filled = 0;
    while filled < LEN_PREFIX {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            return Err(if filled == 0 { ProtocolError::Closed } else { ProtocolError::Truncated });
        }
        filled += n;
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_frame {
        return Err(ProtocolError::FrameTooLarge { len, max: max_frame });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => ProtocolError::Truncated,
        _ => ProtocolError::Io(e),
    })?;
    Ok(body)
}

pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(body.len())
        .map_err(|_| ProtocolError::FrameTooLarge { len: body.len(), max: u32::MAX as usize })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}
