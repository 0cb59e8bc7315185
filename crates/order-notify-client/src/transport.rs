/*
[INPUT]:  Session URL parameters (optional scope id)
[OUTPUT]: One live session: outbound control sink + inbound frame stream
[POS]:    Transport boundary - seam between the multiplexer and the wire
[UPDATE]: When changing how sessions are opened or how events are bound
*/

use std::collections::HashSet;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use crate::error::{NotifyError, Result};
use crate::ws::{ControlMessage, InboundFrame};

/// Opens physical connections to the notification endpoint.
///
/// Implementations resolve once the handshake succeeded and fail with
/// [`NotifyError::Connection`] (or any other error) otherwise. The returned
/// session ends when its inbound stream yields `None`.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self, scope_id: Option<&str>) -> Result<TransportSession>;
}

/// A single physical connection.
///
/// Event bindings belong to the session: a new session starts with none and
/// only forwards frames whose event name was bound with [`TransportSession::on`].
/// The outbound side is unbounded so sending a control message never waits on
/// the socket while inbound frames are queued behind it.
#[derive(Debug)]
pub struct TransportSession {
    id: Uuid,
    outbound: mpsc::UnboundedSender<ControlMessage>,
    inbound: mpsc::Receiver<InboundFrame>,
    bound: HashSet<String>,
}

impl TransportSession {
    pub fn new(
        outbound: mpsc::UnboundedSender<ControlMessage>,
        inbound: mpsc::Receiver<InboundFrame>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            outbound,
            inbound,
            bound: HashSet::new(),
        }
    }

    /// Session id used for log correlation
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Bind an event name; returns `false` if it was already bound
    pub fn on(&mut self, event: &str) -> bool {
        self.bound.insert(event.to_string())
    }

    pub fn is_bound(&self, event: &str) -> bool {
        self.bound.contains(event)
    }

    pub fn bound_count(&self) -> usize {
        self.bound.len()
    }

    /// Queue a control message for the server
    pub fn emit(&self, message: ControlMessage) -> Result<()> {
        self.outbound
            .send(message)
            .map_err(|_| NotifyError::TransportDropped {
                reason: "outbound channel closed".to_string(),
            })
    }

    /// Next frame for a bound event; `None` once the connection is gone
    pub async fn next_frame(&mut self) -> Option<InboundFrame> {
        loop {
            let frame = self.inbound.recv().await?;
            if self.bound.contains(&frame.event) {
                return Some(frame);
            }
            trace!(session_id = %self.id, event = %frame.event, "frame for unbound event skipped");
        }
    }
}
