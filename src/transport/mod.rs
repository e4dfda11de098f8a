//! Data-plane streaming transport.
//!
//! Two wire shapes share one abstraction. Token-gated path: u32 BE token
//! length + token bytes, then a u32 BE length-prefixed JSON status reply,
//! then the raw stream. Direct path (trusted host-to-host): u32 BE
//! operation code + u32 BE metadata length, then JSON metadata, then the
//! raw stream. All integers big-endian; streams terminate at connection
//! half-close in the appropriate direction.
//!
//! Handlers are generic over the stream so every path runs against
//! in-memory duplex pipes in tests. Malformed headers abort the connection
//! before any subprocess is started.

pub mod listener;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};

use crate::error::{Result, ZmigrateError};
use crate::token::{Operation, TokenManager, TransferFlags};
use crate::zfs::{command, CommandRunner, ReceiveSpec, SendSpec, TransferProcess};

pub const OP_SEND: u32 = 1;
pub const OP_RECEIVE: u32 = 2;

/// Tokens are 32 hex chars; anything near this cap is garbage.
pub const MAX_TOKEN_LEN: u32 = 128;
pub const MAX_META_LEN: u32 = 64 * 1024;

/// Fixed copy buffer bounding memory regardless of transfer size.
pub const COPY_BUF_SIZE: usize = 256 * 1024;

/// Direct-path transfer metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferMeta {
    pub dataset: String,
    #[serde(default)]
    pub snapshot: Option<String>,
    #[serde(default)]
    pub flags: TransferFlags,
}

/// Writes a u32 BE length-prefixed JSON frame.
pub async fn write_json_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    value: &serde_json::Value,
) -> Result<()> {
    let payload = serde_json::to_vec(value)
        .map_err(|e| ZmigrateError::TransferFailed(format!("encode frame: {e}")))?;
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads a u32 BE length-prefixed JSON frame.
pub async fn read_json_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<serde_json::Value> {
    let len = reader.read_u32().await?;
    if len > MAX_META_LEN {
        return Err(ZmigrateError::TransferFailed(format!(
            "frame length {len} exceeds cap"
        )));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    serde_json::from_slice(&payload)
        .map_err(|e| ZmigrateError::TransferFailed(format!("frame is not valid JSON: {e}")))
}

/// Copies until EOF through a fixed buffer. `deadline` aborts the stream
/// when a gating credential expires mid-transfer.
pub async fn copy_stream<R, W>(
    reader: &mut R,
    writer: &mut W,
    deadline: Option<DateTime<Utc>>,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut total: u64 = 0;
    loop {
        // The read is bounded by the remaining credential lifetime so an
        // idle connection still aborts when the token expires.
        let n = match deadline {
            Some(at) => {
                let remaining = (at - Utc::now())
                    .to_std()
                    .unwrap_or(std::time::Duration::ZERO);
                if remaining.is_zero() {
                    return Err(ZmigrateError::TokenInvalid(
                        "credential expired mid-transfer".into(),
                    ));
                }
                match tokio::time::timeout(remaining, reader.read(&mut buf)).await {
                    Ok(read) => read?,
                    Err(_) => {
                        return Err(ZmigrateError::TokenInvalid(
                            "credential expired mid-transfer".into(),
                        ))
                    }
                }
            }
            None => reader.read(&mut buf).await?,
        };
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    writer.flush().await?;
    Ok(total)
}

/// Serves one token-gated connection.
pub async fn serve_token_gated<S>(
    mut stream: S,
    tokens: &TokenManager,
    runner: Arc<dyn CommandRunner>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let token_len = stream.read_u32().await?;
    if token_len == 0 || token_len > MAX_TOKEN_LEN {
        let reply = json!({"status": "failed", "error": "invalid token length"});
        let _ = write_json_frame(&mut stream, &reply).await;
        return Err(ZmigrateError::TokenInvalid("invalid token length".into()));
    }

    let mut token_bytes = vec![0u8; token_len as usize];
    stream.read_exact(&mut token_bytes).await?;
    let token_id = match String::from_utf8(token_bytes) {
        Ok(t) => t,
        Err(_) => {
            let reply = json!({"status": "failed", "error": "token is not UTF-8"});
            let _ = write_json_frame(&mut stream, &reply).await;
            return Err(ZmigrateError::TokenInvalid("token is not UTF-8".into()));
        }
    };

    let claims = match tokens.validate(&token_id).await {
        Ok(claims) => claims,
        Err(e) => {
            let reply = json!({"status": "failed", "error": e.to_string()});
            let _ = write_json_frame(&mut stream, &reply).await;
            return Err(e);
        }
    };

    info!(
        operation = claims.operation.as_str(),
        dataset = %claims.dataset,
        owner = %claims.owner,
        "Token-gated transfer authorized"
    );

    let reply = json!({
        "status": "started",
        "operation": claims.operation.as_str(),
        "dataset": claims.dataset,
        "snapshot": claims.snapshot,
    });
    write_json_frame(&mut stream, &reply).await?;

    let meta = TransferMeta {
        dataset: claims.dataset.clone(),
        snapshot: claims.snapshot.clone(),
        flags: claims.flags.clone(),
    };
    run_transfer(
        &mut stream,
        claims.operation,
        &meta,
        runner,
        Some(claims.expires_at),
    )
    .await
}

/// Serves one direct (trusted host-to-host) connection.
pub async fn serve_direct<S>(mut stream: S, runner: Arc<dyn CommandRunner>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let op_code = stream.read_u32().await?;
    let operation = match op_code {
        OP_SEND => Operation::Send,
        OP_RECEIVE => Operation::Receive,
        other => {
            warn!(op_code = other, "Unsupported operation code, aborting");
            return Err(ZmigrateError::TransferFailed(format!(
                "unsupported operation code {other}"
            )));
        }
    };

    let meta_len = stream.read_u32().await?;
    if meta_len == 0 || meta_len > MAX_META_LEN {
        return Err(ZmigrateError::TransferFailed(format!(
            "metadata length {meta_len} out of range"
        )));
    }
    let mut meta_bytes = vec![0u8; meta_len as usize];
    stream.read_exact(&mut meta_bytes).await?;
    let meta: TransferMeta = serde_json::from_slice(&meta_bytes)
        .map_err(|e| ZmigrateError::TransferFailed(format!("metadata is not valid JSON: {e}")))?;

    info!(
        operation = operation.as_str(),
        dataset = %meta.dataset,
        "Direct transfer accepted"
    );
    run_transfer(&mut stream, operation, &meta, runner, None).await
}

/// Streams between the socket and a freshly spawned transfer process.
async fn run_transfer<S>(
    stream: &mut S,
    operation: Operation,
    meta: &TransferMeta,
    runner: Arc<dyn CommandRunner>,
    deadline: Option<DateTime<Utc>>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut process = spawn_for(operation, meta, runner).await?;

    let copied = match operation {
        Operation::Send => {
            let mut stdout = process.stdout.take().ok_or_else(|| {
                ZmigrateError::TransferFailed("send process has no stdout".into())
            })?;
            copy_stream(&mut stdout, stream, deadline).await
        }
        Operation::Receive => {
            let mut stdin = process.stdin.take().ok_or_else(|| {
                ZmigrateError::ReceiveFailed("receive process has no stdin".into())
            })?;
            let copied = copy_stream(stream, &mut stdin, deadline).await;
            // Half-close: EOF on stdin lets zfs receive finalize.
            if let Ok(bytes) = copied {
                stdin.shutdown().await?;
                drop(stdin);
                Ok(bytes)
            } else {
                copied
            }
        }
    };

    match copied {
        Ok(bytes) => {
            let out = process.handle.wait().await?;
            if !out.success() {
                let msg = format!(
                    "zfs {} exited {}: {}",
                    operation.as_str(),
                    out.code,
                    out.stderr.trim()
                );
                return Err(match operation {
                    Operation::Send => ZmigrateError::TransferFailed(msg),
                    Operation::Receive => ZmigrateError::ReceiveFailed(msg),
                });
            }
            info!(operation = operation.as_str(), bytes, "Transfer stream complete");
            Ok(())
        }
        Err(e) => {
            process.handle.terminate().await;
            Err(e)
        }
    }
}

async fn spawn_for(
    operation: Operation,
    meta: &TransferMeta,
    runner: Arc<dyn CommandRunner>,
) -> Result<TransferProcess> {
    match operation {
        Operation::Send => {
            let snapshot = meta.snapshot.clone().ok_or_else(|| {
                ZmigrateError::Validation("send requires a snapshot".into())
            })?;
            let spec = SendSpec {
                dataset: meta.dataset.clone(),
                snapshot,
                from_snapshot: meta.flags.from_snapshot.clone(),
                recursive: meta.flags.recursive,
                raw: meta.flags.raw,
                compressed: meta.flags.compressed,
                resume_token: None,
            };
            runner.spawn(&command::send(&spec), false).await
        }
        Operation::Receive => {
            let spec = ReceiveSpec {
                dataset: meta.dataset.clone(),
                force: meta.flags.force,
                resumable: meta.flags.resumable,
            };
            runner.spawn(&command::receive(&spec), true).await
        }
    }
}

/// A bidirectional byte stream usable as a data path.
pub trait DataStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> DataStream for T {}

/// Connection factory for remote data paths; tests swap in in-memory
/// duplex pipes.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &str) -> Result<Box<dyn DataStream>>;
}

/// Connects to the remote daemon's data socket over TCP.
pub struct TcpConnector {
    pub port: u16,
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, host: &str) -> Result<Box<dyn DataStream>> {
        let stream = tokio::net::TcpStream::connect((host, self.port))
            .await
            .map_err(|e| ZmigrateError::TransferFailed(format!("connect to {host}: {e}")))?;
        Ok(Box::new(stream))
    }
}

/// Client side of the token-gated handshake. Returns once the server
/// acknowledged the stream may begin.
pub async fn handshake_token<S>(stream: &mut S, token: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let token_bytes = token.as_bytes();
    let mut buf = BytesMut::with_capacity(4 + token_bytes.len());
    buf.put_u32(token_bytes.len() as u32);
    buf.put_slice(token_bytes);
    stream.write_all(&buf).await?;
    stream.flush().await?;

    let reply = read_json_frame(stream).await?;
    match reply.get("status").and_then(|s| s.as_str()) {
        Some("started") => Ok(()),
        _ => {
            let error = reply
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("unknown server error");
            Err(ZmigrateError::TokenInvalid(format!(
                "server rejected token: {error}"
            )))
        }
    }
}

/// Client side of the direct handshake: 8-byte header plus JSON metadata.
pub async fn handshake_direct<S>(
    stream: &mut S,
    operation: Operation,
    meta: &TransferMeta,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(meta)
        .map_err(|e| ZmigrateError::TransferFailed(format!("encode metadata: {e}")))?;
    let op_code = match operation {
        Operation::Send => OP_SEND,
        Operation::Receive => OP_RECEIVE,
    };
    let mut buf = BytesMut::with_capacity(8 + payload.len());
    buf.put_u32(op_code);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}
