//! # Gateway Session
//!
//! Owns the single websocket to the platform gateway. A connection task runs the
//! handshake (hello, identify, ready), keeps heartbeats flowing and forwards decoded
//! dispatches as [`SessionEvent`]s. Any failure (close, stream error, zombie
//! heartbeat, reconnect request) leads to a full reconnect with exponential backoff;
//! sessions are never resumed.
//!
//! Events leave the socket loop through an unbounded queue drained by a separate
//! forwarder task, so a slow consumer never delays heartbeats.

use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, instrument, warn};

use super::errors::{GatewayError, GatewayResult};
use super::events::{SessionEvent, SessionIdentity};
use super::frames::{GatewayFrame, IdentifyInfo};
use super::interactions::InteractionClient;
use super::protocol::{GatewayProtocol, ProtocolAction};
use super::traits::{GatewayCommand, GatewayConnection};
use crate::config::{GatewayConfig, SendConfig};
use crate::logging::log_gateway_operation;
use crate::resilience::ExponentialBackoff;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

const DRIVER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct SessionSettings {
    gateway_url: String,
    identify: IdentifyInfo,
    backoff_min: Duration,
    backoff_max: Duration,
}

#[derive(Debug, Default)]
struct SessionState {
    identity: RwLock<Option<SessionIdentity>>,
    socket_open: AtomicBool,
}

#[derive(Debug)]
struct Driver {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

#[derive(Debug)]
pub struct GatewaySession {
    settings: SessionSettings,
    interactions: InteractionClient,
    events: mpsc::Sender<SessionEvent>,
    state: Arc<SessionState>,
    driver: Mutex<Option<Driver>>,
}

impl GatewaySession {
    /// Build a session that reports on `events`. Nothing connects until [`connect`].
    ///
    /// [`connect`]: GatewayConnection::connect
    pub fn new(
        config: &GatewayConfig,
        send: &SendConfig,
        events: mpsc::Sender<SessionEvent>,
    ) -> GatewayResult<Self> {
        config
            .validate_credentials()
            .map_err(|e| GatewayError::Configuration {
                message: e.to_string(),
            })?;

        Ok(Self {
            settings: SessionSettings {
                gateway_url: config.gateway_url.clone(),
                identify: IdentifyInfo {
                    token: config.user_token.clone(),
                    intents: config.intents,
                },
                backoff_min: config.reconnect_backoff_min(),
                backoff_max: config.reconnect_backoff_max(),
            },
            interactions: InteractionClient::new(config, send)?,
            events,
            state: Arc::new(SessionState::default()),
            driver: Mutex::new(None),
        })
    }

    pub fn interactions(&self) -> &InteractionClient {
        &self.interactions
    }

    pub fn identity(&self) -> Option<SessionIdentity> {
        self.state.identity.read().clone()
    }

    /// Whether the websocket itself is currently open
    pub fn is_socket_open(&self) -> bool {
        self.state.socket_open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GatewayConnection for GatewaySession {
    #[instrument(skip(self))]
    async fn connect(&self) -> GatewayResult<()> {
        let mut driver = self.driver.lock().await;
        if driver.as_ref().is_some_and(|d| !d.handle.is_finished()) {
            debug!("GATEWAY: Connection task already running");
            return Ok(());
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_session(
            self.settings.clone(),
            Arc::clone(&self.state),
            self.events.clone(),
            shutdown_rx,
        ));
        *driver = Some(Driver {
            shutdown: shutdown_tx,
            handle,
        });

        log_gateway_operation("connect", "local", "started", Some(&self.settings.gateway_url));
        Ok(())
    }

    #[instrument(skip(self))]
    async fn disconnect(&self) {
        let Some(driver) = self.driver.lock().await.take() else {
            return;
        };

        // Receiver may already be gone if the task ended
        let _ = driver.shutdown.send(true);
        let mut handle = driver.handle;
        if tokio::time::timeout(DRIVER_STOP_TIMEOUT, &mut handle).await.is_err() {
            warn!("⚠️ GATEWAY: Connection task did not stop in time, aborting");
            handle.abort();
        }

        *self.state.identity.write() = None;
        self.state.socket_open.store(false, Ordering::SeqCst);
        log_gateway_operation("disconnect", "local", "stopped", None);
    }

    fn is_connected(&self) -> bool {
        self.driver
            .try_lock()
            .map(|driver| driver.as_ref().is_some_and(|d| !d.handle.is_finished()))
            // Someone is mid-connect or mid-disconnect
            .unwrap_or(true)
    }

    fn is_ready(&self) -> bool {
        self.state.identity.read().is_some()
    }

    async fn send_command(&self, command: &GatewayCommand) -> GatewayResult<()> {
        let session_id = self
            .state
            .identity
            .read()
            .as_ref()
            .map(|identity| identity.session_id.clone())
            .ok_or(GatewayError::NotReady)?;
        self.interactions.send(&session_id, command).await
    }
}

/// Resolves once shutdown is requested; a dropped sender counts as a request
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn next_heartbeat(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Pump queued events into the consumer's bounded channel, preserving order.
/// Ends once the queue is closed and drained or the consumer goes away.
fn spawn_event_forwarder(events: mpsc::Sender<SessionEvent>) -> mpsc::UnboundedSender<SessionEvent> {
    let (outbox, mut queued) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = queued.recv().await {
            if events.send(event).await.is_err() {
                error!("❌ GATEWAY: Session event receiver dropped");
                break;
            }
        }
    });
    outbox
}

async fn run_session(
    settings: SessionSettings,
    state: Arc<SessionState>,
    events: mpsc::Sender<SessionEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let events = spawn_event_forwarder(events);
    let mut backoff = ExponentialBackoff::new(settings.backoff_min, settings.backoff_max);

    loop {
        let connected = tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            result = connect_async(settings.gateway_url.as_str()) => result,
        };

        let reason = match connected {
            Ok((socket, _response)) => {
                info!("🌐 GATEWAY: Websocket connected");
                state.socket_open.store(true, Ordering::SeqCst);
                let outcome =
                    run_connection(socket, &settings, &state, &events, &mut shutdown).await;
                state.socket_open.store(false, Ordering::SeqCst);
                *state.identity.write() = None;
                if outcome.reached_ready {
                    backoff.reset();
                }
                outcome.reason
            }
            Err(e) => format!("connect failed: {e}"),
        };

        let stopping = *shutdown.borrow();
        let _ = events.send(SessionEvent::Disconnected {
            reason: reason.clone(),
        });
        if stopping {
            break;
        }

        let delay = backoff.next_delay();
        warn!(
            reason = %reason,
            retry_in_ms = delay.as_millis() as u64,
            "🔄 GATEWAY: Disconnected, reconnecting"
        );
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    debug!("GATEWAY: Connection task stopped");
}

struct ConnectionOutcome {
    reason: String,
    reached_ready: bool,
}

async fn run_connection(
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    settings: &SessionSettings,
    state: &SessionState,
    events: &mpsc::UnboundedSender<SessionEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> ConnectionOutcome {
    let (mut sink, mut stream) = socket.split();
    let mut protocol = GatewayProtocol::new(settings.identify.clone());
    let mut heartbeat: Option<Interval> = None;
    let mut reached_ready = false;

    let reason = loop {
        let actions = tokio::select! {
            _ = wait_for_shutdown(shutdown) => {
                let _ = sink.send(WsMessage::Close(None)).await;
                break "shutdown requested".to_string();
            }
            _ = next_heartbeat(&mut heartbeat) => vec![protocol.heartbeat_tick()],
            message = stream.next() => match message {
                Some(Ok(WsMessage::Text(text))) => match GatewayFrame::parse(&text) {
                    Ok(frame) => protocol.handle_frame(frame),
                    Err(e) => {
                        warn!(error = %e, "⚠️ GATEWAY: Dropping malformed frame");
                        Vec::new()
                    }
                },
                Some(Ok(WsMessage::Ping(payload))) => {
                    if let Err(e) = sink.send(WsMessage::Pong(payload)).await {
                        break format!("pong failed: {e}");
                    }
                    Vec::new()
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    break match frame {
                        Some(frame) => format!("closed by server ({}): {}", u16::from(frame.code), frame.reason),
                        None => "closed by server".to_string(),
                    };
                }
                Some(Ok(_)) => Vec::new(),
                Some(Err(e)) => break format!("websocket error: {e}"),
                None => break "stream ended".to_string(),
            },
        };

        match execute_actions(actions, &mut sink, &mut heartbeat, state, events).await {
            Ok(ready) => reached_ready |= ready,
            Err(reason) => break reason,
        }
    };

    ConnectionOutcome {
        reason,
        reached_ready,
    }
}

/// Apply protocol actions; `Err` carries the reason to drop the connection
async fn execute_actions(
    actions: Vec<ProtocolAction>,
    sink: &mut WsSink,
    heartbeat: &mut Option<Interval>,
    state: &SessionState,
    events: &mpsc::UnboundedSender<SessionEvent>,
) -> Result<bool, String> {
    let mut became_ready = false;

    for action in actions {
        match action {
            ProtocolAction::Send(frame) => {
                let text = frame
                    .to_json()
                    .map_err(|e| format!("frame encoding failed: {e}"))?;
                sink.send(WsMessage::Text(text))
                    .await
                    .map_err(|e| format!("send failed: {e}"))?;
            }
            ProtocolAction::StartHeartbeat(period) => {
                let mut interval = interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                *heartbeat = Some(interval);
            }
            ProtocolAction::Ready(identity) => {
                info!(
                    session_id = %identity.session_id,
                    username = identity.username.as_deref().unwrap_or("unknown"),
                    "✅ GATEWAY: Session ready"
                );
                *state.identity.write() = Some(identity.clone());
                became_ready = true;
                // A closed queue means the forwarder already logged the dropped receiver
                let _ = events.send(SessionEvent::SessionReady(identity));
            }
            ProtocolAction::Dispatch(event) => {
                let _ = events.send(SessionEvent::Raw(event));
            }
            ProtocolAction::Reconnect { reason } => return Err(reason),
        }
    }

    Ok(became_ready)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str) -> GatewayConfig {
        GatewayConfig {
            user_token: "token".into(),
            guild_id: "G1".into(),
            channel_id: "C1".into(),
            gateway_url: url.into(),
            reconnect_backoff_min_ms: 10,
            reconnect_backoff_max_ms: 20,
            ..GatewayConfig::default()
        }
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let (tx, _rx) = mpsc::channel(8);
        let result = GatewaySession::new(&GatewayConfig::default(), &SendConfig::default(), tx);
        assert!(matches!(result, Err(GatewayError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_send_before_ready_fails() {
        let (tx, _rx) = mpsc::channel(8);
        let session = GatewaySession::new(&config("ws://127.0.0.1:9"), &SendConfig::default(), tx).unwrap();
        let err = session
            .send_command(&GatewayCommand::Imagine {
                nonce: "J1".into(),
                prompt: "fox".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::NotReady);
        assert!(!session.is_ready());
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_unreachable_gateway_reports_disconnects_until_stopped() {
        let (tx, mut rx) = mpsc::channel(8);
        // Port 9 (discard) is closed on test hosts, so every attempt is refused
        let session = GatewaySession::new(&config("ws://127.0.0.1:9"), &SendConfig::default(), tx).unwrap();
        session.connect().await.unwrap();
        session.connect().await.unwrap();
        assert!(session.is_connected());

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert!(matches!(first, Some(SessionEvent::Disconnected { .. })));
        let second = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert!(matches!(second, Some(SessionEvent::Disconnected { .. })));

        session.disconnect().await;
        assert!(!session.is_connected());
        assert!(!session.is_socket_open());
    }
}
