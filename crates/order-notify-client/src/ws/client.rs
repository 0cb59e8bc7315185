/*
[INPUT]:  Client configuration (endpoint, namespace) and optional scope id
[OUTPUT]: Transport sessions backed by a WebSocket connection
[POS]:    WebSocket layer - wire framing and socket reader/writer tasks
[UPDATE]: When changing framing or connection logic
*/

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::Result;
use crate::transport::{Transport, TransportSession};

use super::message::{ControlMessage, InboundFrame};

const PARSE_FAIL_LOG_LIMIT: usize = 3;
const MESSAGE_SAMPLE_LIMIT: usize = 3;
const RAW_LOG_MAX_BYTES: usize = 1024;

static PARSE_FAIL_LOG_COUNT: AtomicUsize = AtomicUsize::new(0);
static MESSAGE_SAMPLE_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Transport that frames every message as JSON `{"event", "data"}` over a WebSocket
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    config: ClientConfig,
}

impl WebSocketTransport {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn encode(message: &ControlMessage) -> Result<WsMessage> {
        let text = serde_json::to_string(message)?;
        Ok(WsMessage::Text(text.into()))
    }

    fn parse_message(message: WsMessage) -> Option<InboundFrame> {
        let text: String = match message {
            WsMessage::Text(text) => text.to_string(),
            WsMessage::Binary(bytes) => String::from_utf8(bytes.to_vec()).ok()?,
            _ => return None,
        };

        match serde_json::from_str::<InboundFrame>(&text) {
            Ok(frame) => {
                log_message_sample_once(&frame);
                Some(frame)
            }
            Err(err) => {
                log_parse_fail_once(&err, &text);
                None
            }
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, scope_id: Option<&str>) -> Result<TransportSession> {
        let url = self.config.session_url(scope_id)?;
        info!(url = %url, "connecting to order notification endpoint");

        let (ws_stream, _response) = connect_async(url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ControlMessage>();
        let (inbound_tx, inbound_rx) = mpsc::channel::<InboundFrame>(self.config.channel_capacity);
        let closed = CancellationToken::new();

        // Writer and reader run apart so a full inbound queue never stalls control frames.
        let writer_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = writer_closed.cancelled() => {
                        let _ = write.send(WsMessage::Close(None)).await;
                        break;
                    }
                    outbound = outbound_rx.recv() => {
                        let Some(message) = outbound else {
                            let _ = write.send(WsMessage::Close(None)).await;
                            break;
                        };
                        let frame = match Self::encode(&message) {
                            Ok(frame) => frame,
                            Err(err) => {
                                warn!(error = %err, action = message.action(), "control message encode failed");
                                continue;
                            }
                        };
                        if let Err(err) = write.send(frame).await {
                            debug!(error = %err, "notification socket write failed");
                            break;
                        }
                    }
                }
            }
            writer_closed.cancel();
        });

        let reader_closed = closed;
        tokio::spawn(async move {
            loop {
                let incoming = tokio::select! {
                    biased;
                    _ = reader_closed.cancelled() => break,
                    incoming = read.next() => incoming,
                };
                match incoming {
                    Some(Ok(WsMessage::Close(frame))) => {
                        debug!(?frame, "server closed notification socket");
                        break;
                    }
                    Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {}
                    Some(Ok(message)) => {
                        let Some(frame) = Self::parse_message(message) else {
                            continue;
                        };
                        tokio::select! {
                            biased;
                            _ = reader_closed.cancelled() => break,
                            sent = inbound_tx.send(frame) => {
                                if sent.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Err(err)) => {
                        debug!(error = %err, "notification socket read failed");
                        break;
                    }
                    None => break,
                }
            }
            reader_closed.cancel();
        });

        Ok(TransportSession::new(outbound_tx, inbound_rx))
    }
}

fn log_message_sample_once(frame: &InboundFrame) {
    let count = MESSAGE_SAMPLE_COUNT.fetch_add(1, Ordering::Relaxed);
    if count < MESSAGE_SAMPLE_LIMIT {
        info!(
            sample_index = count + 1,
            sample_limit = MESSAGE_SAMPLE_LIMIT,
            event = %frame.event,
            "ws message sample"
        );
    }
}

fn log_parse_fail_once(err: &serde_json::Error, raw: &str) {
    let count = PARSE_FAIL_LOG_COUNT.fetch_add(1, Ordering::Relaxed);
    if count < PARSE_FAIL_LOG_LIMIT {
        info!(
            sample_index = count + 1,
            sample_limit = PARSE_FAIL_LOG_LIMIT,
            error = %err,
            bytes = raw.len(),
            "ws message parse failed"
        );
        let preview = truncate_for_log(raw, RAW_LOG_MAX_BYTES);
        debug!(
            sample_index = count + 1,
            sample_limit = PARSE_FAIL_LOG_LIMIT,
            error = %err,
            message = %preview,
            "ws message parse failed"
        );
    }
}

fn truncate_for_log(value: &str, max_len: usize) -> String {
    if value.len() <= max_len {
        return value.to_string();
    }
    let mut end = max_len;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = String::with_capacity(end + 3);
    out.push_str(&value[..end]);
    out.push_str("...");
    out
}
