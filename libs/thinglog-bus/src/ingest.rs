//! TCP ingest: newline-delimited JSON frames published onto the bus.
//!
//! One frame per line:
//! `{"entityID":"urn:zone1:thing2","messageType":"event","sender":"sensor-7","payload":{...}}`
//!
//! A string `payload` is published as its raw bytes, any other JSON value
//! in its serialized form.

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use thinglog_api::{ApiError, Delivery};

use crate::{BusError, MessageBus};

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Listen address, `host:port`.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Longest accepted line in bytes (0 = unlimited).
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            listen: default_listen(),
            max_line_length: default_max_line_length(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_listen() -> String {
    "127.0.0.1:9300".to_string()
}

fn default_max_line_length() -> usize {
    1024 * 1024
}

#[derive(Deserialize)]
struct IngestFrame {
    #[serde(rename = "entityID", alias = "thingID")]
    entity_id: String,
    #[serde(rename = "messageType", alias = "msgType", default = "default_message_type")]
    message_type: String,
    #[serde(default)]
    sender: String,
    #[serde(default)]
    payload: serde_json::Value,
}

fn default_message_type() -> String {
    "event".to_string()
}

/// Decode one frame (without its trailing newline).
pub fn parse_frame(line: &[u8]) -> Result<Delivery, ApiError> {
    let frame: IngestFrame = serde_json::from_slice(line)?;
    if frame.entity_id.is_empty() {
        return Err(ApiError::format_err("frame without entityID"));
    }
    let payload = match frame.payload {
        serde_json::Value::Null => Vec::new(),
        serde_json::Value::String(text) => text.into_bytes(),
        other => serde_json::to_vec(&other)?,
    };
    Ok(Delivery::new(frame.entity_id, frame.message_type, payload, frame.sender))
}

/// Outcome of reading one line.
enum Line {
    Frame(Vec<u8>),
    TooLong(usize),
    Eof,
}

/// Read up to the next `\n`, never buffering more than `max` bytes.
/// An oversized line is consumed and reported, not returned.
async fn read_line<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    max: usize,
) -> std::io::Result<Line> {
    let mut buf = Vec::new();
    let limit = if max == 0 { u64::MAX } else { max as u64 + 1 };
    let n = (&mut *reader).take(limit).read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(Line::Eof);
    }

    if buf.last() != Some(&b'\n') && max > 0 && buf.len() > max {
        // discard the remainder of the oversized line
        let mut skipped = buf.len();
        loop {
            buf.clear();
            let n = (&mut *reader).take(max as u64).read_until(b'\n', &mut buf).await?;
            skipped += n;
            if n == 0 || buf.last() == Some(&b'\n') {
                break;
            }
        }
        return Ok(Line::TooLong(skipped));
    }

    if buf.last() == Some(&b'\n') {
        buf.pop();
    }
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    if max > 0 && buf.len() > max {
        return Ok(Line::TooLong(buf.len()));
    }
    Ok(Line::Frame(buf))
}

async fn handle_connection<R: AsyncRead + Unpin>(
    stream: R,
    peer: String,
    bus: MessageBus,
    max_line_length: usize,
    token: CancellationToken,
) {
    let mut reader = BufReader::new(stream);
    loop {
        let line = tokio::select! {
            _ = token.cancelled() => break,
            line = read_line(&mut reader, max_line_length) => line,
        };
        match line {
            Ok(Line::Frame(bytes)) if bytes.is_empty() => continue,
            Ok(Line::Frame(bytes)) => match parse_frame(&bytes) {
                Ok(delivery) => {
                    tracing::debug!(%peer, entity = %delivery.entity_id, "ingest frame");
                    bus.publish(delivery).await;
                }
                Err(e) => tracing::warn!(%peer, error = %e, "dropping malformed frame"),
            },
            Ok(Line::TooLong(len)) => {
                tracing::warn!(%peer, len, max = max_line_length, "dropping oversized frame");
            }
            Ok(Line::Eof) => break,
            Err(e) => {
                tracing::warn!(%peer, error = %e, "ingest read error");
                break;
            }
        }
    }
    tracing::info!(%peer, "ingest connection closed");
}

/// Bind the ingest listener.
pub async fn bind(config: &IngestConfig) -> Result<TcpListener, BusError> {
    let listener = TcpListener::bind(&config.listen)
        .await
        .map_err(|source| BusError::Bind { addr: config.listen.clone(), source })?;
    tracing::info!(addr = %config.listen, "ingest listening");
    Ok(listener)
}

/// Accept connections until `token` is cancelled; each connection is read
/// by its own task and publishes onto `bus`.
pub fn spawn_ingest(
    listener: TcpListener,
    bus: MessageBus,
    max_line_length: usize,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    tracing::info!(peer = %addr, "ingest client connected");
                    tokio::spawn(handle_connection::<TcpStream>(
                        stream,
                        addr.to_string(),
                        bus.clone(),
                        max_line_length,
                        token.clone(),
                    ));
                }
                Err(e) => {
                    tracing::error!(error = %e, "ingest accept error");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
        tracing::info!("ingest stopped");
    })
}
