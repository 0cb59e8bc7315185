/*
[INPUT]:  Test scenarios needing a scripted notification server
[OUTPUT]: Mock transport, server-side session handles and listener helpers
[POS]:    Test infrastructure - shared across all test modules
[UPDATE]: When adding new test patterns or fixtures
*/

//! Common test utilities for order-notify-client tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use order_notify_client::{
    ClientConfig, ConnectionState, ControlMessage, InboundFrame, ListenerResult, NotifyError,
    OrderEvent, OrderListener, OrderNotifyClient, Result, RetryConfig, Transport,
    TransportSession,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(2);
pub const QUIET: Duration = Duration::from_millis(150);

/// An `open` call waiting for the test to accept or refuse it
pub struct OpenRequest {
    pub scope_id: Option<String>,
    reply: oneshot::Sender<Result<TransportSession>>,
}

impl OpenRequest {
    /// Complete the handshake and return the server end of the session
    pub fn accept(self) -> ServerSide {
        let (controls_tx, controls_rx) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = mpsc::channel(64);
        let _ = self
            .reply
            .send(Ok(TransportSession::new(controls_tx, frames_rx)));
        ServerSide {
            frames: frames_tx,
            controls: controls_rx,
        }
    }

    pub fn refuse(self) {
        let _ = self
            .reply
            .send(Err(NotifyError::connection("refused by mock server")));
    }

    /// Answer the open with a specific error
    pub fn fail(self, err: NotifyError) {
        let _ = self.reply.send(Err(err));
    }
}

/// Transport whose every `open` is decided by the test
pub struct MockTransport {
    requests: mpsc::UnboundedSender<OpenRequest>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, scope_id: Option<&str>) -> Result<TransportSession> {
        let (reply, decision) = oneshot::channel();
        self.requests
            .send(OpenRequest {
                scope_id: scope_id.map(str::to_string),
                reply,
            })
            .map_err(|_| NotifyError::connection("mock server gone"))?;
        decision
            .await
            .map_err(|_| NotifyError::connection("open request abandoned"))?
    }
}

/// Test-side handle receiving open requests
pub struct MockServer {
    requests: mpsc::UnboundedReceiver<OpenRequest>,
}

impl MockServer {
    pub async fn next_open(&mut self) -> OpenRequest {
        timeout(WAIT, self.requests.recv())
            .await
            .expect("timed out waiting for an open request")
            .expect("mock transport dropped")
    }

    pub async fn expect_no_open(&mut self) {
        if let Ok(Some(request)) = timeout(QUIET, self.requests.recv()).await {
            panic!("unexpected open request (scope {:?})", request.scope_id);
        }
    }
}

pub fn mock_transport() -> (Arc<MockTransport>, MockServer) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Arc::new(MockTransport { requests: tx }),
        MockServer { requests: rx },
    )
}

/// Server end of one accepted session
pub struct ServerSide {
    frames: mpsc::Sender<InboundFrame>,
    controls: mpsc::UnboundedReceiver<ControlMessage>,
}

impl ServerSide {
    pub async fn push(&self, event: &str, data: serde_json::Value) {
        self.frames
            .send(InboundFrame::new(event, data))
            .await
            .expect("client side of session closed");
    }

    pub async fn next_control(&mut self) -> ControlMessage {
        timeout(WAIT, self.controls.recv())
            .await
            .expect("timed out waiting for a control message")
            .expect("client closed the session")
    }

    /// Collect `n` control messages in arrival order
    pub async fn controls(&mut self, n: usize) -> Vec<ControlMessage> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.next_control().await);
        }
        out
    }

    pub async fn expect_no_control(&mut self) {
        if let Ok(Some(message)) = timeout(QUIET, self.controls.recv()).await {
            panic!("unexpected control message: {message:?}");
        }
    }

    /// Resolves once the client dropped its end of the session
    pub async fn closed_by_client(&mut self) {
        timeout(WAIT, async {
            while self.controls.recv().await.is_some() {}
        })
        .await
        .expect("client did not close the session");
    }
}

pub fn subscribe(order_id: &str) -> ControlMessage {
    ControlMessage::Subscribe {
        order_id: order_id.to_string(),
    }
}

pub fn unsubscribe(order_id: &str) -> ControlMessage {
    ControlMessage::Unsubscribe {
        order_id: order_id.to_string(),
    }
}

/// Millisecond-scale backoff so reconnection tests run fast
pub fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        jitter: 0.0,
    }
}

pub fn test_client(transport: Arc<MockTransport>, retry: RetryConfig) -> OrderNotifyClient {
    OrderNotifyClient::builder(ClientConfig::default())
        .transport(transport)
        .retry(retry)
        .build()
        .expect("valid test config")
}

/// Connect `client`, accepting the open request on the mock server
pub async fn connect(client: &OrderNotifyClient, server: &mut MockServer) -> ServerSide {
    let (result, session) = tokio::join!(client.connect(Some("restaurant-1")), async {
        server.next_open().await.accept()
    });
    result.expect("connect succeeds");
    session
}

/// Listener forwarding every event into a channel
pub fn channel_listener() -> (impl OrderListener, mpsc::UnboundedReceiver<OrderEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let listener = move |event: &OrderEvent| -> ListenerResult {
        let _ = tx.send(event.clone());
        Ok(())
    };
    (listener, rx)
}

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<OrderEvent>) -> OrderEvent {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("listener channel closed")
}

pub async fn wait_for_state(
    rx: &mut watch::Receiver<ConnectionState>,
    predicate: impl FnMut(&ConnectionState) -> bool,
) -> ConnectionState {
    timeout(WAIT, rx.wait_for(predicate))
        .await
        .expect("timed out waiting for connection state")
        .expect("connection manager dropped")
        .clone()
}
