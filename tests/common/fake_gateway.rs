//! Scripted stand-in for the real gateway session.
//!
//! Each simulated node gets its own `FakeGateway`; all of them report into one shared
//! [`ConnectionTracker`] so tests can assert how many nodes were ever connected at once.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use botrelay_core::gateway::{
    GatewayCommand, GatewayConnection, GatewayError, GatewayResult, PlatformMessage, RawEvent,
    SessionEvent, SessionIdentity,
};

#[derive(Debug, Default)]
pub struct ConnectionTracker {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl ConnectionTracker {
    fn opened(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn closed(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously connected gateways seen so far
    pub fn max_concurrent(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct FakeGateway {
    name: String,
    tracker: Arc<ConnectionTracker>,
    connected: AtomicBool,
    connects: AtomicUsize,
    sent: Mutex<Vec<GatewayCommand>>,
    send_failure: Mutex<Option<GatewayError>>,
    events: mpsc::Sender<SessionEvent>,
}

impl FakeGateway {
    pub fn new(
        name: impl Into<String>,
        tracker: Arc<ConnectionTracker>,
    ) -> (Arc<Self>, mpsc::Receiver<SessionEvent>) {
        let (events, receiver) = mpsc::channel(64);
        let gateway = Arc::new(Self {
            name: name.into(),
            tracker,
            connected: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            send_failure: Mutex::new(None),
            events,
        });
        (gateway, receiver)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sent_commands(&self) -> Vec<GatewayCommand> {
        self.sent.lock().clone()
    }

    pub fn is_connected_now(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Make every following send fail with `error` until cleared with `None`
    pub fn fail_sends_with(&self, error: Option<GatewayError>) {
        *self.send_failure.lock() = error;
    }

    /// Deliver a platform message as if it arrived over the socket
    pub async fn emit_create(&self, message: PlatformMessage) {
        self.emit(SessionEvent::Raw(RawEvent::MessageCreate(message))).await;
    }

    pub async fn emit_update(&self, message: PlatformMessage) {
        self.emit(SessionEvent::Raw(RawEvent::MessageUpdate(message))).await;
    }

    pub async fn emit(&self, event: SessionEvent) {
        self.events
            .send(event)
            .await
            .expect("orchestrator event pump is gone");
    }
}

#[async_trait]
impl GatewayConnection for FakeGateway {
    async fn connect(&self) -> GatewayResult<()> {
        if !self.connected.swap(true, Ordering::SeqCst) {
            self.tracker.opened();
            self.connects.fetch_add(1, Ordering::SeqCst);
            let _ = self
                .events
                .try_send(SessionEvent::SessionReady(SessionIdentity {
                    session_id: format!("session-{}", self.name),
                    user_id: None,
                    username: Some(self.name.clone()),
                }));
        }
        Ok(())
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.tracker.closed();
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_ready(&self) -> bool {
        self.is_connected()
    }

    async fn send_command(&self, command: &GatewayCommand) -> GatewayResult<()> {
        if !self.is_ready() {
            return Err(GatewayError::NotReady);
        }
        if let Some(error) = self.send_failure.lock().clone() {
            return Err(error);
        }
        self.sent.lock().push(command.clone());
        Ok(())
    }
}
