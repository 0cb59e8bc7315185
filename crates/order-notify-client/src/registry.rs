/*
[INPUT]:  subscribe/unsubscribe calls and routed order events
[OUTPUT]: Listener invocations + interest transitions (0→1, 1→0) per order id
[POS]:    Subscription layer - ref-counted listener bookkeeping
[UPDATE]: When changing listener identity, fault isolation or transition reporting
*/

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::error::NotifyError;
use crate::ws::OrderEvent;

/// Outcome of a single listener invocation
pub type ListenerResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Receives order events for the ids it is subscribed to.
///
/// Closures of the shape `Fn(&OrderEvent) -> ListenerResult` implement this
/// trait directly.
pub trait OrderListener: Send + Sync {
    fn handle_event(&self, event: &OrderEvent) -> ListenerResult;
}

impl<F> OrderListener for F
where
    F: Fn(&OrderEvent) -> ListenerResult + Send + Sync,
{
    fn handle_event(&self, event: &OrderEvent) -> ListenerResult {
        self(event)
    }
}

/// Identity of one registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Told about interest transitions for an order id.
///
/// Called while the registry lock is held so transitions arrive in the same
/// order the map changed; implementations must not block or re-enter the
/// registry.
pub trait InterestSink: Send + Sync {
    fn interest_added(&self, order_id: &str);
    fn interest_withdrawn(&self, order_id: &str);
}

struct OrderSubscription {
    listeners: Vec<(ListenerId, Arc<dyn OrderListener>)>,
}

struct RegistryInner {
    orders: Mutex<HashMap<String, OrderSubscription>>,
    next_listener_id: AtomicU64,
    sink: Arc<dyn InterestSink>,
}

/// Map of order id to listener set.
///
/// An order id is present exactly while it has at least one listener.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new(sink: Arc<dyn InterestSink>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                orders: Mutex::new(HashMap::new()),
                next_listener_id: AtomicU64::new(1),
                sink,
            }),
        }
    }

    fn orders(&self) -> MutexGuard<'_, HashMap<String, OrderSubscription>> {
        // Listeners never run under this lock, so a poisoned map is still consistent.
        self.inner
            .orders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `listener` for `order_id` and return its unsubscribe handle
    pub fn subscribe(
        &self,
        order_id: impl Into<String>,
        listener: Arc<dyn OrderListener>,
    ) -> Subscription {
        let order_id = order_id.into();
        let listener_id = ListenerId(self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed));

        {
            let mut orders = self.orders();
            let first = !orders.contains_key(&order_id);
            orders
                .entry(order_id.clone())
                .or_insert_with(|| OrderSubscription {
                    listeners: Vec::new(),
                })
                .listeners
                .push((listener_id, listener));

            if first {
                debug!(order_id = %order_id, %listener_id, "first listener; interest added");
                self.inner.sink.interest_added(&order_id);
            } else {
                debug!(order_id = %order_id, %listener_id, "listener added");
            }
        }

        Subscription {
            registry: self.clone(),
            order_id,
            listener_id,
            active: AtomicBool::new(true),
        }
    }

    /// Remove one listener; returns whether it was registered
    fn remove(&self, order_id: &str, listener_id: ListenerId) -> bool {
        let mut orders = self.orders();
        let Some(subscription) = orders.get_mut(order_id) else {
            return false;
        };
        let before = subscription.listeners.len();
        subscription.listeners.retain(|(id, _)| *id != listener_id);
        if subscription.listeners.len() == before {
            return false;
        }

        if subscription.listeners.is_empty() {
            orders.remove(order_id);
            debug!(order_id, %listener_id, "last listener removed; interest withdrawn");
            self.inner.sink.interest_withdrawn(order_id);
        } else {
            debug!(order_id, %listener_id, "listener removed");
        }
        true
    }

    /// Invoke every listener of `order_id` with `event`.
    ///
    /// Returns how many listeners ran. Faulting listeners are logged and stay
    /// registered; they never stop their siblings.
    pub fn dispatch(&self, order_id: &str, event: &OrderEvent) -> usize {
        let listeners: Vec<(ListenerId, Arc<dyn OrderListener>)> = {
            let orders = self.orders();
            match orders.get(order_id) {
                Some(subscription) => subscription.listeners.clone(),
                None => {
                    debug!(order_id, kind = %event.kind, "no listeners; event dropped");
                    return 0;
                }
            }
        };

        for (listener_id, listener) in &listeners {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| listener.handle_event(event)));
            let message = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err.to_string(),
                Err(payload) => panic_message(payload.as_ref()),
            };
            let fault = NotifyError::ListenerFault {
                order_id: order_id.to_string(),
                listener_id: listener_id.get(),
                message,
            };
            warn!(order_id, %listener_id, kind = %event.kind, error = %fault, "listener fault isolated");
        }

        listeners.len()
    }

    /// Order ids that currently have listeners
    pub fn order_ids(&self) -> Vec<String> {
        self.orders().keys().cloned().collect()
    }

    pub fn contains(&self, order_id: &str) -> bool {
        self.orders().contains_key(order_id)
    }

    pub fn listener_count(&self, order_id: &str) -> usize {
        self.orders()
            .get(order_id)
            .map_or(0, |subscription| subscription.listeners.len())
    }

    /// Number of order ids with listeners
    pub fn len(&self) -> usize {
        self.orders().len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders().is_empty()
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("order_ids", &self.len())
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}

/// Handle returned by `subscribe`; removes exactly its own listener.
///
/// Dropping the handle leaves the listener registered.
#[must_use = "the listener stays registered until unsubscribe() is called"]
pub struct Subscription {
    registry: SubscriptionRegistry,
    order_id: String,
    listener_id: ListenerId,
    active: AtomicBool,
}

impl Subscription {
    pub fn order_id(&self) -> &str {
        &self.order_id
    }

    pub fn listener_id(&self) -> ListenerId {
        self.listener_id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Remove the listener. Only the first call has an effect; returns
    /// whether this call removed it.
    pub fn unsubscribe(&self) -> bool {
        if !self.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.registry.remove(&self.order_id, self.listener_id)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("order_id", &self.order_id)
            .field("listener_id", &self.listener_id)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::OrderEventKind;
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct RecordingSink {
        transitions: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.transitions.lock().unwrap())
        }
    }

    impl InterestSink for RecordingSink {
        fn interest_added(&self, order_id: &str) {
            self.transitions.lock().unwrap().push(format!("+{order_id}"));
        }

        fn interest_withdrawn(&self, order_id: &str) {
            self.transitions.lock().unwrap().push(format!("-{order_id}"));
        }
    }

    fn registry() -> (SubscriptionRegistry, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        (SubscriptionRegistry::new(sink.clone()), sink)
    }

    fn event(order_id: &str) -> OrderEvent {
        OrderEvent {
            kind: OrderEventKind::Updated,
            order_id: order_id.to_string(),
            payload: serde_json::Map::new(),
            received_at: Utc::now(),
        }
    }

    fn counter() -> (Arc<AtomicUsize>, Arc<dyn OrderListener>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let listener = move |_: &OrderEvent| -> ListenerResult {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        };
        (count, Arc::new(listener))
    }

    #[test]
    fn transitions_only_on_first_and_last_listener() {
        let (registry, sink) = registry();
        let (a_count, a) = counter();
        let (b_count, b) = counter();

        let sub_a = registry.subscribe("order-1", a);
        let sub_b = registry.subscribe("order-1", b);
        assert_eq!(sink.take(), vec!["+order-1"]);
        assert_eq!(registry.listener_count("order-1"), 2);

        assert!(sub_a.unsubscribe());
        assert!(sink.take().is_empty());
        assert!(registry.contains("order-1"));

        assert!(sub_b.unsubscribe());
        assert_eq!(sink.take(), vec!["-order-1"]);
        assert!(!registry.contains("order-1"));
        assert!(registry.is_empty());

        assert_eq!(registry.dispatch("order-1", &event("order-1")), 0);
        assert_eq!(a_count.load(Ordering::SeqCst), 0);
        assert_eq!(b_count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let (registry, sink) = registry();
        let (_, a) = counter();
        let (_, b) = counter();
        let sub_a = registry.subscribe("order-1", a);
        let _sub_b = registry.subscribe("order-1", b);
        sink.take();

        assert!(sub_a.unsubscribe());
        assert!(!sub_a.unsubscribe());
        assert!(!sub_a.is_active());
        assert_eq!(registry.listener_count("order-1"), 1);
        assert!(sink.take().is_empty());
    }

    #[test]
    fn same_closure_twice_is_two_listeners() {
        let (registry, _sink) = registry();
        let (count, listener) = counter();
        let first = registry.subscribe("order-1", listener.clone());
        let _second = registry.subscribe("order-1", listener);
        assert_ne!(first.listener_id(), _second.listener_id());

        assert_eq!(registry.dispatch("order-1", &event("order-1")), 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);

        first.unsubscribe();
        registry.dispatch("order-1", &event("order-1"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn faulting_listeners_do_not_block_siblings() {
        let (registry, _sink) = registry();
        let failing = |_: &OrderEvent| -> ListenerResult { Err("listener rejected event".into()) };
        let panicking = |_: &OrderEvent| -> ListenerResult { panic!("listener exploded") };
        let (count, healthy) = counter();

        let _f = registry.subscribe("order-1", Arc::new(failing));
        let _p = registry.subscribe("order-1", Arc::new(panicking));
        let _h = registry.subscribe("order-1", healthy);

        assert_eq!(registry.dispatch("order-1", &event("order-1")), 3);
        assert_eq!(registry.dispatch("order-1", &event("order-1")), 3);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(registry.listener_count("order-1"), 3);
    }

    #[test]
    fn dispatch_is_scoped_to_order_id() {
        let (registry, sink) = registry();
        let (one, l1) = counter();
        let (two, l2) = counter();
        let _s1 = registry.subscribe("order-1", l1);
        let _s2 = registry.subscribe("order-2", l2);
        assert_eq!(sink.take(), vec!["+order-1", "+order-2"]);

        registry.dispatch("order-2", &event("order-2"));
        assert_eq!(one.load(Ordering::SeqCst), 0);
        assert_eq!(two.load(Ordering::SeqCst), 1);

        let mut ids = registry.order_ids();
        ids.sort();
        assert_eq!(ids, vec!["order-1", "order-2"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn listener_may_unsubscribe_itself_during_dispatch() {
        let (registry, sink) = registry();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let slot_in_listener = slot.clone();
        let listener = move |_: &OrderEvent| -> ListenerResult {
            if let Some(sub) = slot_in_listener.lock().unwrap().as_ref() {
                sub.unsubscribe();
            }
            Ok(())
        };
        let sub = registry.subscribe("order-1", Arc::new(listener));
        *slot.lock().unwrap() = Some(sub);

        assert_eq!(registry.dispatch("order-1", &event("order-1")), 1);
        assert!(!registry.contains("order-1"));
        assert_eq!(sink.take(), vec!["+order-1", "-order-1"]);
    }

    #[test]
    fn resubscribe_after_withdrawal_reports_again() {
        let (registry, sink) = registry();
        let (_, a) = counter();
        registry.subscribe("order-1", a.clone()).unsubscribe();
        let _again = registry.subscribe("order-1", a);
        assert_eq!(sink.take(), vec!["+order-1", "-order-1", "+order-1"]);
    }
}
