/*
[INPUT]:  Endpoint configuration and raw socket frames
[OUTPUT]: WebSocket transport sessions and typed order messages
[POS]:    WebSocket layer - real-time order event stream
[UPDATE]: When adding new event kinds or changing connection logic
*/

pub mod client;
pub mod message;

pub use client::WebSocketTransport;
pub use message::{
    routed_event_names, ControlMessage, FrameRejection, InboundEvent, InboundFrame, OrderEvent,
    OrderEventKind, ERROR_EVENT,
};
