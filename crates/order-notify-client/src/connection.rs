/*
[INPUT]:  connect/disconnect requests, registry interest transitions, transport sessions
[OUTPUT]: Connection state notifications + subscribe/unsubscribe control messages
[POS]:    Connection layer - single physical connection lifecycle and reconnection
[UPDATE]: When changing the state machine, retry accounting or resubscription
*/

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{NotifyError, Result};
use crate::registry::{InterestSink, SubscriptionRegistry};
use crate::retry::RetryPolicy;
use crate::router::{DiagnosticSink, EventRouter};
use crate::transport::{Transport, TransportSession};
use crate::ws::ControlMessage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Failed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            ConnectionState::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug)]
enum Command {
    Connect {
        scope_id: Option<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    InterestAdded(String),
    InterestWithdrawn(String),
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

/// Feeds registry transitions into the worker queue, preserving their order
#[derive(Debug, Clone)]
struct CommandSink {
    tx: mpsc::UnboundedSender<Command>,
}

impl InterestSink for CommandSink {
    fn interest_added(&self, order_id: &str) {
        let _ = self.tx.send(Command::InterestAdded(order_id.to_string()));
    }

    fn interest_withdrawn(&self, order_id: &str) {
        let _ = self.tx.send(Command::InterestWithdrawn(order_id.to_string()));
    }
}

#[derive(Debug, Default)]
struct WorkerSlot {
    cmd_rx: Option<mpsc::UnboundedReceiver<Command>>,
    handle: Option<JoinHandle<()>>,
}

/// Owns the one physical connection to the notification endpoint.
///
/// All state changes, control messages and listener dispatches happen on a
/// single worker task, started lazily on the first `connect`.
pub struct ConnectionManager {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    registry: SubscriptionRegistry,
    router: EventRouter,
    state: watch::Sender<ConnectionState>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    worker: Mutex<WorkerSlot>,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let registry = SubscriptionRegistry::new(Arc::new(CommandSink { tx: cmd_tx.clone() }));
        let router = EventRouter::new(registry.clone(), diagnostics);
        let (state, _rx) = watch::channel(ConnectionState::Disconnected);

        Self {
            config,
            transport,
            registry,
            router,
            state,
            cmd_tx,
            worker: Mutex::new(WorkerSlot {
                cmd_rx: Some(cmd_rx),
                handle: None,
            }),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.borrow().is_connected()
    }

    /// Subscribe to connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Open the connection, or join the attempt already in flight.
    ///
    /// Resolves `Ok` once a session is established. Fails with
    /// [`NotifyError::Connection`] if the first attempt fails, or
    /// [`NotifyError::RetryExhausted`] when joining a reconnection that gives up.
    pub async fn connect(&self, scope_id: Option<&str>) -> Result<()> {
        self.start_worker_if_needed()?;

        let (reply, outcome) = oneshot::channel();
        self.cmd_tx
            .send(Command::Connect {
                scope_id: scope_id.map(str::to_string),
                reply,
            })
            .map_err(|_| NotifyError::WorkerStopped)?;
        outcome.await.map_err(|_| NotifyError::WorkerStopped)?
    }

    /// Tear down the transport and return to `Disconnected`.
    ///
    /// Registered listeners are kept and re-announced by the next `connect`.
    pub async fn disconnect(&self) {
        let started = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handle
            .is_some();
        if !started {
            return;
        }

        let (reply, done) = oneshot::channel();
        if self.cmd_tx.send(Command::Disconnect { reply }).is_ok() {
            let _ = done.await;
        }
    }

    /// Stop the worker for good.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn start_worker_if_needed(&self) -> Result<()> {
        let mut slot = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.handle.is_some() {
            return Ok(());
        }

        if tokio::runtime::Handle::try_current().is_err() {
            return Err(NotifyError::Config(
                "connect must be called from within a Tokio runtime".to_string(),
            ));
        }

        let Some(cmd_rx) = slot.cmd_rx.take() else {
            return Err(NotifyError::WorkerStopped);
        };

        let worker = ConnectionWorker {
            transport: self.transport.clone(),
            registry: self.registry.clone(),
            router: self.router.clone(),
            retry: RetryPolicy::new(self.config.retry.clone()),
            connect_timeout: self.config.connect_timeout,
            state: self.state.clone(),
            cmd_rx,
            shutdown: self.shutdown.clone(),
            scope_id: None,
            waiters: Vec::new(),
            announced: HashSet::new(),
        };
        slot.handle = Some(tokio::spawn(worker.run()));
        Ok(())
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &*self.state.borrow())
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

enum Step {
    Idle,
    Open,
    Backoff(Duration),
    Stream(TransportSession),
    Shutdown,
}

struct ConnectionWorker {
    transport: Arc<dyn Transport>,
    registry: SubscriptionRegistry,
    router: EventRouter,
    retry: RetryPolicy,
    connect_timeout: Duration,
    state: watch::Sender<ConnectionState>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    shutdown: CancellationToken,
    scope_id: Option<String>,
    waiters: Vec<oneshot::Sender<Result<()>>>,
    /// Order ids announced with `subscribe` on the current session
    announced: HashSet<String>,
}

impl ConnectionWorker {
    async fn run(mut self) {
        let mut step = Step::Idle;
        loop {
            step = match step {
                Step::Idle => self.idle().await,
                Step::Open => self.open().await,
                Step::Backoff(delay) => self.backoff(delay).await,
                Step::Stream(session) => self.stream(session).await,
                Step::Shutdown => break,
            };
        }

        debug!("connection worker stopped");
        self.resolve_waiters(|| Err(NotifyError::WorkerStopped));
        self.set_state(ConnectionState::Disconnected);
    }

    fn current(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!(from = %current, to = %next, "connection state changed");
            *current = next;
            true
        });
    }

    fn resolve_waiters(&mut self, outcome: impl Fn() -> Result<()>) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(outcome());
        }
    }

    /// Commands that behave the same in every phase. Returns the next step
    /// when the command ends the current phase.
    fn on_command(&mut self, cmd: Option<Command>) -> Option<Step> {
        match cmd {
            Some(Command::Connect { scope_id, reply }) => match self.current() {
                ConnectionState::Connected => {
                    let _ = reply.send(Ok(()));
                    None
                }
                ConnectionState::Connecting | ConnectionState::Reconnecting { .. } => {
                    self.waiters.push(reply);
                    None
                }
                ConnectionState::Disconnected | ConnectionState::Failed => {
                    self.scope_id = scope_id;
                    self.retry.reset();
                    self.waiters.push(reply);
                    self.set_state(ConnectionState::Connecting);
                    Some(Step::Open)
                }
            },
            // Outside a live session there is nothing to announce; the flush
            // on the next connect reads the registry directly.
            Some(Command::InterestAdded(_)) | Some(Command::InterestWithdrawn(_)) => None,
            Some(Command::Disconnect { reply }) => {
                self.resolve_waiters(|| Err(NotifyError::Disconnected));
                self.announced.clear();
                self.set_state(ConnectionState::Disconnected);
                info!("order notification connection closed by caller");
                let _ = reply.send(());
                Some(Step::Idle)
            }
            None => Some(Step::Shutdown),
        }
    }

    async fn idle(&mut self) -> Step {
        loop {
            let cmd = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Step::Shutdown,
                cmd = self.cmd_rx.recv() => cmd,
            };
            if let Some(step) = self.on_command(cmd) {
                return step;
            }
        }
    }

    async fn open(&mut self) -> Step {
        let transport = self.transport.clone();
        let scope_id = self.scope_id.clone();
        let connect_timeout = self.connect_timeout;
        let attempt = async move {
            match tokio::time::timeout(connect_timeout, transport.open(scope_id.as_deref())).await
            {
                Ok(result) => result,
                Err(_) => Err(NotifyError::connection(format!(
                    "timed out after {connect_timeout:?}"
                ))),
            }
        };
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Step::Shutdown,
                cmd = self.cmd_rx.recv() => {
                    if let Some(step) = self.on_command(cmd) {
                        return step;
                    }
                }
                result = &mut attempt => {
                    return match result {
                        Ok(session) => self.on_connected(session),
                        Err(err) => self.on_open_failed(err),
                    };
                }
            }
        }
    }

    fn on_open_failed(&mut self, err: NotifyError) -> Step {
        if self.current() == ConnectionState::Connecting {
            let message = match err {
                NotifyError::Connection { message } => message,
                other => other.to_string(),
            };
            warn!(error = %message, "initial connect failed");
            self.set_state(ConnectionState::Failed);
            self.resolve_waiters(|| Err(NotifyError::connection(message.clone())));
            return Step::Idle;
        }

        if !err.is_retryable() {
            let message = err.to_string();
            warn!(error = %message, "reconnect failed with a non-retryable error; giving up");
            return self.give_up(|| Err(NotifyError::connection(message.clone())));
        }

        warn!(
            attempt = self.retry.attempts(),
            max_attempts = self.retry.max_attempts(),
            error = %err,
            "reconnect attempt failed"
        );
        self.schedule_reconnect()
    }

    fn schedule_reconnect(&mut self) -> Step {
        match self.retry.next_delay() {
            Some(delay) => {
                let attempt = self.retry.attempts();
                self.set_state(ConnectionState::Reconnecting { attempt });
                info!(attempt, max_attempts = self.retry.max_attempts(), ?delay, "reconnect scheduled");
                Step::Backoff(delay)
            }
            None => {
                let attempts = self.retry.attempts();
                warn!(attempts, "reconnection attempts exhausted; giving up");
                self.give_up(|| Err(NotifyError::RetryExhausted { attempts }))
            }
        }
    }

    fn give_up(&mut self, outcome: impl Fn() -> Result<()>) -> Step {
        self.set_state(ConnectionState::Failed);
        self.resolve_waiters(outcome);
        Step::Idle
    }

    async fn backoff(&mut self, delay: Duration) -> Step {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Step::Shutdown,
                cmd = self.cmd_rx.recv() => {
                    if let Some(step) = self.on_command(cmd) {
                        return step;
                    }
                }
                _ = &mut sleep => return Step::Open,
            }
        }
    }

    fn on_connected(&mut self, mut session: TransportSession) -> Step {
        let session_id = session.id();
        self.retry.reset();
        self.router.bind(&mut session);
        self.announced.clear();
        self.set_state(ConnectionState::Connected);
        self.resolve_waiters(|| Ok(()));

        for order_id in self.registry.order_ids() {
            if let Err(err) = self.announce(&session, order_id) {
                return self.on_session_lost(err);
            }
        }

        info!(
            %session_id,
            subscriptions = self.announced.len(),
            "connected to order notification endpoint"
        );
        Step::Stream(session)
    }

    fn announce(&mut self, session: &TransportSession, order_id: String) -> Result<()> {
        if !self.announced.insert(order_id.clone()) {
            return Ok(());
        }
        debug!(session_id = %session.id(), order_id = %order_id, "sending subscribe");
        session.emit(ControlMessage::Subscribe { order_id })
    }

    fn withdraw(&mut self, session: &TransportSession, order_id: String) -> Result<()> {
        if !self.announced.remove(&order_id) {
            return Ok(());
        }
        debug!(session_id = %session.id(), order_id = %order_id, "sending unsubscribe");
        session.emit(ControlMessage::Unsubscribe { order_id })
    }

    fn on_session_lost(&mut self, reason: NotifyError) -> Step {
        warn!(error = %reason, "order notification transport dropped");
        self.announced.clear();
        self.schedule_reconnect()
    }

    async fn stream(&mut self, mut session: TransportSession) -> Step {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Step::Shutdown,
                cmd = self.cmd_rx.recv() => {
                    let sent = match cmd {
                        Some(Command::InterestAdded(order_id)) => self.announce(&session, order_id),
                        Some(Command::InterestWithdrawn(order_id)) => {
                            self.withdraw(&session, order_id)
                        }
                        other => match self.on_command(other) {
                            Some(step) => return step,
                            None => Ok(()),
                        },
                    };
                    if let Err(err) = sent {
                        return self.on_session_lost(err);
                    }
                }
                frame = session.next_frame() => {
                    match frame {
                        Some(frame) => {
                            self.router.route(frame);
                        }
                        None => {
                            return self.on_session_lost(NotifyError::TransportDropped {
                                reason: "inbound stream ended".to_string(),
                            });
                        }
                    }
                }
            }
        }
    }
}
