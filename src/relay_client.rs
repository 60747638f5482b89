//! Reconnecting WebSocket client for one side of a relay pairing.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::{BridgeError, Result};
use crate::protocol::{Envelope, Role};

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(90);
const INBOUND_CHANNEL_DEPTH: usize = 256;
const CLOSE_GRACE: Duration = Duration::from_secs(2);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct RelayClientOptions {
    pub server_url: String,
    pub session_id: String,
    pub token: String,
    pub role: Role,
    pub max_attempts: u32,
    pub reconnect_delay: Duration,
    /// Add up to a quarter of `reconnect_delay` at random to each retry.
    pub jitter: bool,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

impl RelayClientOptions {
    pub fn new(
        server_url: impl Into<String>,
        session_id: impl Into<String>,
        token: impl Into<String>,
        role: Role,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            session_id: session_id.into(),
            token: token.into(),
            role,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            jitter: true,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn url(&self) -> String {
        build_ws_url(&self.server_url, &self.session_id, &self.token, self.role)
    }
}

/// `<server>/ws/<session>?token=<secret>&type=<role>` with http(s) schemes
/// mapped to ws(s).
pub fn build_ws_url(server_url: &str, session_id: &str, token: &str, role: Role) -> String {
    let base = server_url.trim().trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        format!("ws://{base}")
    };
    format!(
        "{base}/ws/{}?token={}&type={}",
        urlencoding::encode(session_id),
        urlencoding::encode(token),
        role.as_str()
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

pub type StateReceiver = broadcast::Receiver<ConnectionState>;

struct Shared {
    state: Mutex<ConnectionState>,
    state_tx: broadcast::Sender<ConnectionState>,
    max_attempts: AtomicU32,
    last_error: Mutex<Option<(bool, String)>>,
}

impl Shared {
    fn publish(&self, state: ConnectionState) {
        *self.state.lock() = state;
        debug!(target = "cc_bridge::relay_client", state = ?state, "relay state");
        let _ = self.state_tx.send(state);
    }

    fn record_error(&self, error: &BridgeError) {
        *self.last_error.lock() = Some((error.is_auth_rejection(), error.to_string()));
    }

    fn failure(&self, fallback: &str) -> BridgeError {
        match self.last_error.lock().clone() {
            Some((true, detail)) => BridgeError::Unauthorized(detail),
            Some((false, detail)) => BridgeError::Transport(detail),
            None => BridgeError::Transport(fallback.to_string()),
        }
    }
}

struct DriverParts {
    outbound_rx: mpsc::UnboundedReceiver<String>,
    inbound_tx: mpsc::Sender<Envelope>,
    shutdown_rx: watch::Receiver<bool>,
}

pub struct RelayClient {
    options: RelayClientOptions,
    shared: Arc<Shared>,
    outbound_tx: mpsc::UnboundedSender<String>,
    shutdown_tx: watch::Sender<bool>,
    parts: Mutex<Option<DriverParts>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl RelayClient {
    /// Build a client; the receiver yields every inbound envelope except
    /// heartbeats.
    pub fn new(options: RelayClientOptions) -> (Self, mpsc::Receiver<Envelope>) {
        let (state_tx, _) = broadcast::channel(64);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            state: Mutex::new(ConnectionState::Disconnected),
            state_tx,
            max_attempts: AtomicU32::new(options.max_attempts),
            last_error: Mutex::new(None),
        });

        let client = Self {
            options,
            shared,
            outbound_tx,
            shutdown_tx,
            parts: Mutex::new(Some(DriverParts {
                outbound_rx,
                inbound_tx,
                shutdown_rx,
            })),
            driver: Mutex::new(None),
        };
        (client, inbound_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    pub fn subscribe_state(&self) -> StateReceiver {
        self.shared.state_tx.subscribe()
    }

    pub fn options(&self) -> &RelayClientOptions {
        &self.options
    }

    /// Spawn the connection driver. Calling twice is a no-op.
    pub fn start(&self) {
        let Some(parts) = self.parts.lock().take() else {
            warn!(target = "cc_bridge::relay_client", "relay client already started");
            return;
        };
        let handle = tokio::spawn(drive(self.options.clone(), self.shared.clone(), parts));
        *self.driver.lock() = Some(handle);
    }

    /// Resolve on the first successful connection. A failed first attempt,
    /// exhaustion or the timeout are all errors.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let mut states = self.subscribe_state();
        let verdict = |state: ConnectionState| -> Option<Result<()>> {
            match state {
                ConnectionState::Connected => Some(Ok(())),
                ConnectionState::Reconnecting { .. } | ConnectionState::Failed => {
                    Some(Err(self.shared.failure("relay connection failed")))
                }
                ConnectionState::Connecting | ConnectionState::Disconnected => None,
            }
        };
        if let Some(result) = verdict(self.state()) {
            return result;
        }

        let wait = async {
            loop {
                match states.recv().await {
                    Ok(state) => {
                        if let Some(result) = verdict(state) {
                            return result;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if let Some(result) = verdict(self.state()) {
                            return result;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(BridgeError::Transport("relay client stopped".to_string()));
                    }
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            BridgeError::Transport(format!(
                "no relay connection within {}s",
                timeout.as_secs_f32()
            ))
        })?
    }

    /// Send an envelope if connected. Nothing is queued while the socket is
    /// down.
    pub fn send(&self, envelope: &Envelope) {
        if self.state() != ConnectionState::Connected {
            debug!(
                target = "cc_bridge::relay_client",
                kind = envelope.type_name(),
                "not connected, dropping outbound envelope"
            );
            return;
        }
        match envelope.to_json() {
            Ok(json) => {
                let _ = self.outbound_tx.send(json);
            }
            Err(error) => {
                warn!(target = "cc_bridge::relay_client", error = %error, "failed to encode envelope");
            }
        }
    }

    /// Stop for good. Retries are disabled before the driver is signalled so
    /// a pending reconnect cannot race the shutdown.
    pub async fn close(&self) {
        self.shared.max_attempts.store(0, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
        let handle = self.driver.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(CLOSE_GRACE, handle).await.is_err() {
                warn!(target = "cc_bridge::relay_client", "relay driver did not stop in time");
            }
        }
    }
}

async fn closing(shutdown_rx: &mut watch::Receiver<bool>) {
    // A dropped sender means the client is gone; treat that as closing too.
    let _ = shutdown_rx.wait_for(|closed| *closed).await;
}

fn retry_delay(options: &RelayClientOptions) -> Duration {
    if !options.jitter {
        return options.reconnect_delay;
    }
    let spread = options.reconnect_delay.as_millis() as u64 / 4;
    let extra = if spread == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=spread)
    };
    options.reconnect_delay + Duration::from_millis(extra)
}

async fn drive(options: RelayClientOptions, shared: Arc<Shared>, parts: DriverParts) {
    let DriverParts {
        mut outbound_rx,
        inbound_tx,
        mut shutdown_rx,
    } = parts;
    let url = options.url();
    let mut attempt = 0u32;
    shared.publish(ConnectionState::Connecting);

    loop {
        let connected = tokio::select! {
            result = connect_async(url.as_str()) => result,
            _ = closing(&mut shutdown_rx) => break,
        };

        match connected {
            Ok((stream, _)) => {
                attempt = 0;
                // Envelopes sent before a previous socket died are stale.
                while outbound_rx.try_recv().is_ok() {}
                shared.publish(ConnectionState::Connected);
                info!(
                    target = "cc_bridge::relay_client",
                    session_id = %options.session_id,
                    role = %options.role,
                    "relay connected"
                );
                let closed_by_us = run_connection(
                    stream,
                    &options,
                    &shared,
                    &mut outbound_rx,
                    &inbound_tx,
                    &mut shutdown_rx,
                )
                .await;
                if closed_by_us {
                    break;
                }
            }
            Err(error) => {
                let error = BridgeError::from(error);
                shared.record_error(&error);
                if error.is_auth_rejection() {
                    warn!(target = "cc_bridge::relay_client", "relay rejected the session token");
                } else {
                    warn!(target = "cc_bridge::relay_client", error = %error, "relay connect failed");
                }
            }
        }

        if *shutdown_rx.borrow() {
            break;
        }
        if attempt >= shared.max_attempts.load(Ordering::SeqCst) {
            shared.publish(ConnectionState::Failed);
            warn!(
                target = "cc_bridge::relay_client",
                attempts = attempt,
                "giving up on relay connection"
            );
            return;
        }
        attempt += 1;
        shared.publish(ConnectionState::Reconnecting { attempt });

        tokio::select! {
            _ = tokio::time::sleep(retry_delay(&options)) => {}
            _ = closing(&mut shutdown_rx) => break,
        }
    }

    shared.publish(ConnectionState::Disconnected);
}

/// Hand an envelope to the session without stalling the socket loop, so
/// heartbeats and shutdown keep running while the consumer is busy.
fn deliver_inbound(inbound_tx: &mpsc::Sender<Envelope>, envelope: Envelope) -> bool {
    match inbound_tx.try_send(envelope) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!(target = "cc_bridge::relay_client", "inbound queue full, dropping envelope");
            false
        }
        Err(TrySendError::Closed(_)) => {
            debug!(target = "cc_bridge::relay_client", "inbound receiver dropped");
            false
        }
    }
}

/// Pump one socket until it dies or shutdown is requested. Returns `true`
/// when the close was ours.
async fn run_connection(
    stream: WsStream,
    options: &RelayClientOptions,
    shared: &Shared,
    outbound_rx: &mut mpsc::UnboundedReceiver<String>,
    inbound_tx: &mpsc::Sender<Envelope>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> bool {
    let (mut write, mut read) = stream.split();
    let mut heartbeat = tokio::time::interval_at(
        Instant::now() + options.heartbeat_interval,
        options.heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_inbound = Instant::now();

    loop {
        tokio::select! {
            _ = closing(shutdown_rx) => {
                let _ = write.send(Message::Close(None)).await;
                return true;
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        last_inbound = Instant::now();
                        match Envelope::decode(&text) {
                            Ok(Some(Envelope::Ping {})) => {
                                let pong = serde_json::json!({ "type": "pong" }).to_string();
                                if let Err(error) = write.send(Message::Text(pong)).await {
                                    shared.record_error(&BridgeError::from(error));
                                    return false;
                                }
                            }
                            Ok(Some(Envelope::Pong {})) => {}
                            Ok(Some(envelope)) => {
                                if matches!(envelope, Envelope::Paired {}) {
                                    info!(target = "cc_bridge::relay_client", "peer paired");
                                }
                                deliver_inbound(inbound_tx, envelope);
                            }
                            Ok(None) => {
                                debug!(target = "cc_bridge::relay_client", "ignoring unknown envelope type");
                            }
                            Err(error) => {
                                warn!(target = "cc_bridge::relay_client", error = %error, "dropping inbound frame");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(target = "cc_bridge::relay_client", "relay closed the connection");
                        return false;
                    }
                    Some(Ok(_)) => {
                        last_inbound = Instant::now();
                    }
                    Some(Err(error)) => {
                        let error = BridgeError::from(error);
                        warn!(target = "cc_bridge::relay_client", error = %error, "relay socket error");
                        shared.record_error(&error);
                        return false;
                    }
                }
            }
            Some(json) = outbound_rx.recv() => {
                if let Err(error) = write.send(Message::Text(json)).await {
                    shared.record_error(&BridgeError::from(error));
                    return false;
                }
            }
            _ = heartbeat.tick() => {
                let ping = serde_json::json!({ "type": "ping" }).to_string();
                if let Err(error) = write.send(Message::Text(ping)).await {
                    shared.record_error(&BridgeError::from(error));
                    return false;
                }
            }
            _ = tokio::time::sleep_until(last_inbound + options.heartbeat_timeout) => {
                warn!(target = "cc_bridge::relay_client", "relay heartbeat timed out");
                shared.record_error(&BridgeError::Transport("heartbeat timed out".to_string()));
                return false;
            }
        }
    }
}
