/*
[INPUT]:  Crate modules and public type definitions
[OUTPUT]: Public order notification client surface
[POS]:    Crate root - module wiring
[UPDATE]: When public modules or exports change
*/

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod registry;
pub mod retry;
pub mod router;
pub mod transport;
pub mod ws;

pub use client::{ClientBuilder, ClientStatus, OrderNotifyClient};
pub use config::{ClientConfig, RetryConfig};
pub use connection::{ConnectionManager, ConnectionState};
pub use error::{NotifyError, Result};
pub use registry::{
    InterestSink,
    ListenerId,
    ListenerResult,
    OrderListener,
    Subscription,
    SubscriptionRegistry,
};
pub use retry::RetryPolicy;
pub use router::{DiagnosticSink, EventRouter, LogDiagnostics, RouteOutcome};
pub use transport::{Transport, TransportSession};

// Re-export commonly used types from ws
pub use ws::{
    ControlMessage,
    InboundEvent,
    InboundFrame,
    OrderEvent,
    OrderEventKind,
    WebSocketTransport,
};
