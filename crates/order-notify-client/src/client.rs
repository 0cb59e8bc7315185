/*
[INPUT]:  Client configuration, optional custom transport and diagnostic sink
[OUTPUT]: Public connect/subscribe/disconnect surface + process-wide instance
[POS]:    Client facade - composes connection manager, registry and router
[UPDATE]: When changing the public surface or the global lifecycle
*/

use std::fmt;
use std::sync::{Arc, OnceLock};

use tokio::sync::watch;

use crate::config::{ClientConfig, RetryConfig};
use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::{NotifyError, Result};
use crate::registry::{OrderListener, Subscription, SubscriptionRegistry};
use crate::router::{DiagnosticSink, LogDiagnostics};
use crate::transport::Transport;
use crate::ws::WebSocketTransport;

static GLOBAL: OnceLock<OrderNotifyClient> = OnceLock::new();

/// Caller-facing lifecycle of the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Uninitialized,
    Connecting,
    Ready,
    Reconnecting,
    Failed,
}

impl From<&ConnectionState> for ClientStatus {
    fn from(state: &ConnectionState) -> Self {
        match state {
            ConnectionState::Disconnected => ClientStatus::Uninitialized,
            ConnectionState::Connecting => ClientStatus::Connecting,
            ConnectionState::Connected => ClientStatus::Ready,
            ConnectionState::Reconnecting { .. } => ClientStatus::Reconnecting,
            ConnectionState::Failed => ClientStatus::Failed,
        }
    }
}

/// Live order-status notifications over one multiplexed connection.
///
/// # Examples
///
/// ```rust,no_run
/// use order_notify_client::{ListenerResult, OrderEvent, OrderNotifyClient};
///
/// # async fn example() -> order_notify_client::Result<()> {
/// let client = OrderNotifyClient::global();
/// client.connect(Some("restaurant-1")).await?;
///
/// let subscription = client.subscribe_to_order("order-42", |event: &OrderEvent| -> ListenerResult {
///     println!("{} {:?}", event.kind, event.field("status"));
///     Ok(())
/// });
///
/// // later
/// subscription.unsubscribe();
/// client.disconnect().await;
/// # Ok(())
/// # }
/// ```
pub struct OrderNotifyClient {
    manager: ConnectionManager,
}

impl OrderNotifyClient {
    /// Create a client that talks WebSocket to `config.endpoint`
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    /// The process-wide client.
    ///
    /// Created with default configuration on first access unless
    /// [`install_global`](Self::install_global) ran earlier. It lives for the rest
    /// of the process; `disconnect` returns it to `Uninitialized` without
    /// dropping registered listeners. Its worker runs on the Tokio runtime of
    /// the first `connect` call.
    pub fn global() -> &'static OrderNotifyClient {
        GLOBAL.get_or_init(|| {
            let config = ClientConfig::default();
            let transport = Arc::new(WebSocketTransport::new(config.clone()));
            OrderNotifyClient {
                manager: ConnectionManager::new(config, transport, Arc::new(LogDiagnostics)),
            }
        })
    }

    /// Install a configured client as the process-wide instance.
    ///
    /// Fails with [`NotifyError::AlreadyInstalled`] once `global` has been
    /// accessed or another client was installed.
    pub fn install_global(client: OrderNotifyClient) -> Result<&'static OrderNotifyClient> {
        GLOBAL
            .set(client)
            .map_err(|_| NotifyError::AlreadyInstalled)?;
        Ok(Self::global())
    }

    /// Connect to the notification endpoint, optionally scoped (e.g. to one
    /// restaurant). A no-op returning the existing outcome while connecting or
    /// connected.
    pub async fn connect(&self, scope_id: Option<&str>) -> Result<()> {
        self.manager.connect(scope_id).await
    }

    /// Start receiving events for `order_id`.
    ///
    /// Works in any state; interest recorded while disconnected is announced
    /// on the next successful connect.
    pub fn subscribe_to_order<L>(&self, order_id: impl Into<String>, listener: L) -> Subscription
    where
        L: OrderListener + 'static,
    {
        self.manager.registry().subscribe(order_id, Arc::new(listener))
    }

    /// Like [`subscribe_to_order`](Self::subscribe_to_order) for a listener
    /// shared between several orders.
    pub fn subscribe_shared(
        &self,
        order_id: impl Into<String>,
        listener: Arc<dyn OrderListener>,
    ) -> Subscription {
        self.manager.registry().subscribe(order_id, listener)
    }

    pub async fn disconnect(&self) {
        self.manager.disconnect().await;
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    pub fn status(&self) -> ClientStatus {
        ClientStatus::from(&self.manager.state())
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Subscribe to connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.manager.subscribe_state()
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        self.manager.registry()
    }
}

impl fmt::Debug for OrderNotifyClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderNotifyClient")
            .field("manager", &self.manager)
            .finish()
    }
}

/// Builder for [`OrderNotifyClient`]
pub struct ClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    diagnostics: Arc<dyn DiagnosticSink>,
}

impl ClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            transport: None,
            diagnostics: Arc::new(LogDiagnostics),
        }
    }

    /// Replace the WebSocket transport
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    /// Where server `error` events go; defaults to logging
    pub fn diagnostics(mut self, diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn build(self) -> Result<OrderNotifyClient> {
        self.config.validate()?;
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(WebSocketTransport::new(self.config.clone())),
        };
        Ok(OrderNotifyClient {
            manager: ConnectionManager::new(self.config, transport, self.diagnostics),
        })
    }
}
