/*
[INPUT]:  Frames from the live transport session
[OUTPUT]: Registry dispatches for order events, diagnostics for `error`
[POS]:    Routing layer - between transport session and subscription registry
[UPDATE]: When adding event kinds or changing the diagnostic path
*/

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::registry::SubscriptionRegistry;
use crate::transport::TransportSession;
use crate::ws::{routed_event_names, FrameRejection, InboundEvent, InboundFrame};

const REJECT_LOG_LIMIT: usize = 5;

static REJECT_LOG_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Receives server `error` events, which belong to no subscription
pub trait DiagnosticSink: Send + Sync {
    fn report(&self, payload: &Value);
}

/// Default sink: log at warn level
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDiagnostics;

impl DiagnosticSink for LogDiagnostics {
    fn report(&self, payload: &Value) {
        warn!(payload = %payload, "notification server reported an error");
    }
}

/// What happened to one routed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered { order_id: String, listeners: usize },
    Diagnostic,
    Rejected(FrameRejection),
}

#[derive(Clone)]
pub struct EventRouter {
    registry: SubscriptionRegistry,
    diagnostics: Arc<dyn DiagnosticSink>,
}

impl EventRouter {
    pub fn new(registry: SubscriptionRegistry, diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            registry,
            diagnostics,
        }
    }

    /// Bind every routed event name on a fresh session.
    ///
    /// Must run once per physical connection; a new session has no bindings.
    pub fn bind(&self, session: &mut TransportSession) -> usize {
        let bound = routed_event_names()
            .filter(|event| session.on(event))
            .count();
        debug!(session_id = %session.id(), bound, "event router bound to session");
        bound
    }

    pub fn route(&self, frame: InboundFrame) -> RouteOutcome {
        let event_name = frame.event.clone();
        match InboundEvent::try_from(frame) {
            Ok(InboundEvent::Order(event)) => {
                let listeners = self.registry.dispatch(&event.order_id, &event);
                RouteOutcome::Delivered {
                    order_id: event.order_id,
                    listeners,
                }
            }
            Ok(InboundEvent::Error(payload)) => {
                self.diagnostics.report(&payload);
                RouteOutcome::Diagnostic
            }
            Err(rejection) => {
                log_rejection_once(&event_name, &rejection);
                RouteOutcome::Rejected(rejection)
            }
        }
    }
}

impl fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRouter")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

fn log_rejection_once(event: &str, rejection: &FrameRejection) {
    let count = REJECT_LOG_COUNT.fetch_add(1, Ordering::Relaxed);
    if count < REJECT_LOG_LIMIT {
        info!(
            sample_index = count + 1,
            sample_limit = REJECT_LOG_LIMIT,
            event,
            reason = %rejection,
            "inbound frame dropped"
        );
    } else {
        debug!(event, reason = %rejection, "inbound frame dropped");
    }
}
