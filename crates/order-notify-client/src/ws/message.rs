/*
[INPUT]:  Raw `{event, data}` frames from a transport session
[OUTPUT]: Typed control messages and inbound order events
[POS]:    WebSocket layer - message parsing and validation
[UPDATE]: When adding new event kinds or changing the wire format
*/

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event name of the server diagnostic channel
pub const ERROR_EVENT: &str = "error";

const ORDER_ID_FIELD: &str = "orderId";

/// Outbound declaration of interest sent to the server
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum ControlMessage {
    Subscribe {
        #[serde(rename = "orderId")]
        order_id: String,
    },
    Unsubscribe {
        #[serde(rename = "orderId")]
        order_id: String,
    },
}

impl ControlMessage {
    pub fn order_id(&self) -> &str {
        match self {
            ControlMessage::Subscribe { order_id } | ControlMessage::Unsubscribe { order_id } => {
                order_id
            }
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            ControlMessage::Subscribe { .. } => "subscribe",
            ControlMessage::Unsubscribe { .. } => "unsubscribe",
        }
    }
}

/// One frame as delivered by a transport session, before routing
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct InboundFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl InboundFrame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// Order-scoped inbound event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderEventKind {
    Updated,
    Accepted,
    Rejected,
    Progress,
}

impl OrderEventKind {
    pub const ALL: [OrderEventKind; 4] = [
        OrderEventKind::Updated,
        OrderEventKind::Accepted,
        OrderEventKind::Rejected,
        OrderEventKind::Progress,
    ];

    /// Wire event name, e.g. `order:updated`
    pub fn event_name(self) -> &'static str {
        match self {
            OrderEventKind::Updated => "order:updated",
            OrderEventKind::Accepted => "order:accepted",
            OrderEventKind::Rejected => "order:rejected",
            OrderEventKind::Progress => "order:progress",
        }
    }

    pub fn from_event_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.event_name() == name)
    }
}

impl fmt::Display for OrderEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_name())
    }
}

/// A server-pushed change in the status of one order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderEvent {
    pub kind: OrderEventKind,
    pub order_id: String,
    /// Every field of the frame payload, forwarded verbatim
    pub payload: Map<String, Value>,
    pub received_at: DateTime<Utc>,
}

impl OrderEvent {
    /// Look up one payload field
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }
}

/// A routed inbound event
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Order(OrderEvent),
    Error(Value),
}

/// Why a frame could not be turned into an [`InboundEvent`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameRejection {
    UnknownEvent,
    PayloadNotObject,
    MissingOrderId,
}

impl fmt::Display for FrameRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameRejection::UnknownEvent => f.write_str("unknown event"),
            FrameRejection::PayloadNotObject => f.write_str("payload is not an object"),
            FrameRejection::MissingOrderId => f.write_str("payload has no orderId"),
        }
    }
}

impl TryFrom<InboundFrame> for InboundEvent {
    type Error = FrameRejection;

    fn try_from(frame: InboundFrame) -> Result<Self, FrameRejection> {
        if frame.event == ERROR_EVENT {
            return Ok(InboundEvent::Error(frame.data));
        }

        let kind =
            OrderEventKind::from_event_name(&frame.event).ok_or(FrameRejection::UnknownEvent)?;
        let Value::Object(payload) = frame.data else {
            return Err(FrameRejection::PayloadNotObject);
        };
        let order_id = match payload.get(ORDER_ID_FIELD) {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => return Err(FrameRejection::MissingOrderId),
        };

        Ok(InboundEvent::Order(OrderEvent {
            kind,
            order_id,
            payload,
            received_at: Utc::now(),
        }))
    }
}

/// Every event name a session must bind for routing
pub fn routed_event_names() -> impl Iterator<Item = &'static str> {
    OrderEventKind::ALL
        .into_iter()
        .map(OrderEventKind::event_name)
        .chain(std::iter::once(ERROR_EVENT))
}
