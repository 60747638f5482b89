//! Relay that pairs one agent side with its viewers.
//!
//! Every session is owned by a single actor task. Socket tasks never touch
//! session state directly; they post commands to the actor's mailbox, so
//! authorisation, attachment and routing for one session are strictly
//! serialised while different sessions proceed independently.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{BridgeError, Result};
use crate::protocol::{Envelope, Role};

pub type ConnectionId = Uuid;

/// Stable actor name for a session id.
pub fn actor_id_for(session_id: &str) -> String {
    let digest = Sha256::digest(session_id.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRejection {
    MissingToken,
    TokenMismatch,
    /// A viewer arrived before any agent side pinned a secret.
    SessionNotReady,
}

impl AuthRejection {
    fn reason(self) -> &'static str {
        match self {
            Self::MissingToken => "Missing token",
            Self::TokenMismatch => "Invalid token",
            Self::SessionNotReady => "Session not ready",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorSnapshot {
    pub session_id: String,
    pub secret_pinned: bool,
    pub agent_side: usize,
    pub viewer_side: usize,
}

/// Sessions with no open sockets are evicted after this long.
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(600);

/// One relayed WebSocket payload. Text and binary frames pass through
/// untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    fn into_message(self) -> Message {
        match self {
            Self::Text(text) => Message::Text(text.into()),
            Self::Binary(data) => Message::Binary(data.into()),
        }
    }
}

type FrameSender = mpsc::UnboundedSender<Frame>;
type ActorMap = Mutex<HashMap<String, SessionActorHandle>>;

enum ActorCommand {
    Authorize {
        role: Role,
        token: Option<String>,
        reply: oneshot::Sender<std::result::Result<(), AuthRejection>>,
    },
    Attach {
        id: ConnectionId,
        role: Role,
        tx: FrameSender,
    },
    Inbound {
        id: ConnectionId,
        role: Role,
        frame: Frame,
    },
    Detach {
        id: ConnectionId,
        role: Role,
    },
    Snapshot {
        reply: oneshot::Sender<ActorSnapshot>,
    },
}

struct SessionActor {
    session_id: String,
    key: String,
    epoch: Uuid,
    hub: Weak<ActorMap>,
    idle_ttl: Duration,
    secret: Option<String>,
    connections: HashMap<ConnectionId, (Role, FrameSender)>,
}

impl SessionActor {
    async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<ActorCommand>) {
        loop {
            let next = if self.connections.is_empty() {
                match tokio::time::timeout(self.idle_ttl, mailbox.recv()).await {
                    Ok(next) => next,
                    Err(_) => {
                        debug!(target = "cc_bridge::relay", session_id = %self.session_id, "idle session evicted");
                        break;
                    }
                }
            } else {
                mailbox.recv().await
            };
            let Some(command) = next else { break };
            self.handle(command);
            if self.secret.is_none() && self.connections.is_empty() {
                break;
            }
        }
        self.retire();
        // Anything still queued was sent to a retired actor; dropping it
        // fails the pending replies so callers can look the session up again.
        mailbox.close();
        debug!(target = "cc_bridge::relay", session_id = %self.session_id, "session actor stopped");
    }

    fn retire(&self) {
        let Some(actors) = self.hub.upgrade() else {
            return;
        };
        let mut actors = actors.lock();
        if actors
            .get(&self.key)
            .is_some_and(|handle| handle.epoch == self.epoch)
        {
            actors.remove(&self.key);
        }
    }

    fn handle(&mut self, command: ActorCommand) {
        match command {
            ActorCommand::Authorize { role, token, reply } => {
                let _ = reply.send(self.authorize(role, token));
            }
            ActorCommand::Attach { id, role, tx } => {
                self.connections.insert(id, (role, tx));
                info!(
                    target = "cc_bridge::relay",
                    session_id = %self.session_id,
                    role = %role,
                    connection = %id,
                    "connection attached"
                );
                if role == Role::ViewerSide {
                    self.send_to_role(Role::AgentSide, &Envelope::Paired {});
                }
            }
            ActorCommand::Inbound { id, role, frame } => {
                if matches!(&frame, Frame::Text(text) if is_ping(text)) {
                    if let Some((_, tx)) = self.connections.get(&id) {
                        let _ = tx.send(Frame::text(r#"{"type":"pong"}"#));
                    }
                }
                self.forward(role.opposite(), &frame);
            }
            ActorCommand::Detach { id, role } => {
                if self.connections.remove(&id).is_some() {
                    info!(
                        target = "cc_bridge::relay",
                        session_id = %self.session_id,
                        role = %role,
                        connection = %id,
                        "connection detached"
                    );
                    self.send_to_role(role.opposite(), &role.disconnect_envelope());
                }
            }
            ActorCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn authorize(
        &mut self,
        role: Role,
        token: Option<String>,
    ) -> std::result::Result<(), AuthRejection> {
        let token = token.filter(|token| !token.is_empty());
        let pinned = self.secret.clone();
        match (role, token, pinned.as_deref()) {
            (Role::AgentSide, None, _) => Err(AuthRejection::MissingToken),
            (Role::AgentSide, Some(token), None) => {
                info!(target = "cc_bridge::relay", session_id = %self.session_id, "session secret pinned");
                self.secret = Some(token);
                Ok(())
            }
            (_, Some(token), Some(secret)) if token == secret => Ok(()),
            (Role::ViewerSide, _, None) => Err(AuthRejection::SessionNotReady),
            (_, None, Some(_)) => Err(AuthRejection::MissingToken),
            (_, Some(_), Some(_)) => Err(AuthRejection::TokenMismatch),
        }
    }

    fn forward(&self, to: Role, frame: &Frame) {
        for (peer_role, tx) in self.connections.values() {
            if *peer_role == to {
                let _ = tx.send(frame.clone());
            }
        }
    }

    fn send_to_role(&self, to: Role, envelope: &Envelope) {
        match envelope.to_json() {
            Ok(json) => self.forward(to, &Frame::Text(json)),
            Err(error) => warn!(target = "cc_bridge::relay", error = %error, "failed to encode notice"),
        }
    }

    fn snapshot(&self) -> ActorSnapshot {
        let count = |role: Role| {
            self.connections
                .values()
                .filter(|(peer_role, _)| *peer_role == role)
                .count()
        };
        ActorSnapshot {
            session_id: self.session_id.clone(),
            secret_pinned: self.secret.is_some(),
            agent_side: count(Role::AgentSide),
            viewer_side: count(Role::ViewerSide),
        }
    }
}

fn is_ping(text: &str) -> bool {
    serde_json::from_str::<Value>(text)
        .ok()
        .is_some_and(|value| value.get("type").and_then(Value::as_str) == Some("ping"))
}

/// Mailbox of one session actor.
#[derive(Clone)]
pub struct SessionActorHandle {
    tx: mpsc::UnboundedSender<ActorCommand>,
    epoch: Uuid,
}

impl SessionActorHandle {
    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// `None` when the actor retired before answering.
    async fn try_authorize(
        &self,
        role: Role,
        token: Option<String>,
    ) -> Option<std::result::Result<(), AuthRejection>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ActorCommand::Authorize { role, token, reply })
            .ok()?;
        rx.await.ok()
    }

    pub async fn authorize(
        &self,
        role: Role,
        token: Option<String>,
    ) -> std::result::Result<(), AuthRejection> {
        self.try_authorize(role, token)
            .await
            .unwrap_or(Err(AuthRejection::SessionNotReady))
    }

    fn attach(&self, id: ConnectionId, role: Role, tx: FrameSender) {
        let _ = self.tx.send(ActorCommand::Attach { id, role, tx });
    }

    fn inbound(&self, id: ConnectionId, role: Role, frame: Frame) {
        let _ = self.tx.send(ActorCommand::Inbound { id, role, frame });
    }

    fn detach(&self, id: ConnectionId, role: Role) {
        let _ = self.tx.send(ActorCommand::Detach { id, role });
    }

    pub async fn snapshot(&self) -> Option<ActorSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(ActorCommand::Snapshot { reply }).ok()?;
        rx.await.ok()
    }
}

/// Registry of session actors keyed by [`actor_id_for`]. Actors remove
/// themselves once they hold nothing worth keeping.
#[derive(Clone)]
pub struct RelayHub {
    actors: Arc<ActorMap>,
    idle_ttl: Duration,
}

impl Default for RelayHub {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayHub {
    pub fn new() -> Self {
        Self::with_idle_ttl(DEFAULT_IDLE_TTL)
    }

    pub fn with_idle_ttl(idle_ttl: Duration) -> Self {
        Self {
            actors: Arc::new(Mutex::new(HashMap::new())),
            idle_ttl,
        }
    }

    /// Resolve the actor for a session, spawning it on first use.
    fn actor(&self, session_id: &str) -> SessionActorHandle {
        let key = actor_id_for(session_id);
        let mut actors = self.actors.lock();
        if let Some(handle) = actors.get(&key).filter(|handle| !handle.is_closed()) {
            return handle.clone();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SessionActorHandle {
            tx,
            epoch: Uuid::new_v4(),
        };
        let actor = SessionActor {
            session_id: session_id.to_string(),
            key: key.clone(),
            epoch: handle.epoch,
            hub: Arc::downgrade(&self.actors),
            idle_ttl: self.idle_ttl,
            secret: None,
            connections: HashMap::new(),
        };
        tokio::spawn(actor.run(rx));
        actors.insert(key, handle.clone());
        handle
    }

    /// The live actor for a session, never spawning one.
    pub fn lookup(&self, session_id: &str) -> Option<SessionActorHandle> {
        self.actors
            .lock()
            .get(&actor_id_for(session_id))
            .filter(|handle| !handle.is_closed())
            .cloned()
    }

    /// Authorise a connection and return the actor it attaches to. Only an
    /// agent side with a token may bring a session into existence.
    pub async fn admit(
        &self,
        session_id: &str,
        role: Role,
        token: Option<String>,
    ) -> std::result::Result<SessionActorHandle, AuthRejection> {
        let token = token.filter(|token| !token.is_empty());
        if role == Role::AgentSide && token.is_none() {
            return Err(AuthRejection::MissingToken);
        }
        for _ in 0..ADMIT_ATTEMPTS {
            let actor = match role {
                Role::AgentSide => self.actor(session_id),
                Role::ViewerSide => self
                    .lookup(session_id)
                    .ok_or(AuthRejection::SessionNotReady)?,
            };
            if let Some(outcome) = actor.try_authorize(role, token.clone()).await {
                return outcome.map(|()| actor);
            }
        }
        Err(AuthRejection::SessionNotReady)
    }

    pub fn session_count(&self) -> usize {
        self.actors.lock().len()
    }
}

/// A lookup can race an actor retiring; a fresh lookup resolves it.
const ADMIT_ATTEMPTS: usize = 3;

// ---------------------------------------------------------------------------
// HTTP surface
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct ConnectQuery {
    token: Option<String>,
    #[serde(rename = "type")]
    role: Option<String>,
}

pub fn relay_router(hub: RelayHub) -> axum::Router {
    use axum::{routing, Router};

    Router::new()
        .route("/", routing::get(relay_banner))
        .route("/health", routing::get(relay_health))
        .route("/ws/{session_id}", routing::get(relay_ws))
        .with_state(hub)
}

async fn relay_banner() -> &'static str {
    concat!("cc-bridge relay ", env!("CARGO_PKG_VERSION"))
}

async fn relay_health() -> &'static str {
    "OK"
}

async fn relay_ws(
    ws: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    axum::extract::Path(session_id): axum::extract::Path<String>,
    axum::extract::Query(query): axum::extract::Query<ConnectQuery>,
    axum::extract::State(hub): axum::extract::State<RelayHub>,
) -> Response {
    let Ok(ws) = ws else {
        return (StatusCode::UPGRADE_REQUIRED, "Expected WebSocket").into_response();
    };
    let Some(role) = query.role.as_deref().and_then(Role::from_query) else {
        return (StatusCode::BAD_REQUEST, "Invalid client type").into_response();
    };

    let actor = match hub.admit(&session_id, role, query.token).await {
        Ok(actor) => actor,
        Err(rejection) => {
            warn!(
                target = "cc_bridge::relay",
                session_id = %session_id,
                role = %role,
                reason = rejection.reason(),
                "rejecting connection"
            );
            return (StatusCode::UNAUTHORIZED, rejection.reason()).into_response();
        }
    };

    ws.on_upgrade(move |socket| run_socket(socket, actor, role))
}

async fn run_socket(socket: WebSocket, actor: SessionActorHandle, role: Role) {
    let id = Uuid::new_v4();
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    actor.attach(id, role, tx);

    // The actor only ever pushes into the channel, so a slow socket stalls
    // its own writer and nothing else.
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(frame.into_message()).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => actor.inbound(id, role, Frame::text(text.as_str())),
            Ok(Message::Binary(data)) => actor.inbound(id, role, Frame::Binary(data.to_vec())),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(error) => {
                debug!(target = "cc_bridge::relay", error = %error, "socket read failed");
                break;
            }
        }
    }
    actor.detach(id, role);
}

/// Bind the relay and serve it in the background.
pub async fn serve_relay(addr: SocketAddr, hub: RelayHub) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|error| BridgeError::Resource(format!("relay address {addr} unavailable: {error}")))?;
    let local = listener
        .local_addr()
        .map_err(|error| BridgeError::Resource(error.to_string()))?;
    let router = relay_router(hub);
    let handle = tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, router).await {
            tracing::error!(target = "cc_bridge::relay", error = %error, "relay stopped");
        }
    });
    info!(target = "cc_bridge::relay", addr = %local, "relay listening");
    Ok((local, handle))
}
