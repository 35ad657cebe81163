//! Per-connection sync protocol handler.
//!
//! ```text
//! Connecting ──► Authenticating ──► Joined ──► Relaying ──► Closed
//!     │                │
//!     │ bad handshake  │ bad token / no access
//!     ▼                ▼
//!  HTTP 400/401    AccessDenied + close (no session touched)
//! ```
//!
//! Each connection is one sequential task. Inbound frames are handed to the
//! session; outbound frames come from the session's broadcast group in the
//! order the session applied them. Membership is owned by a guard, so the
//! client leaves its session exactly once however the task ends.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::auth::{AccessPolicy, CredentialVerifier, Identity};
use crate::broadcast::{ClientId, Envelope};
use crate::crdt::{CrdtDocument, YrsDocument};
use crate::error::CollabError;
use crate::protocol::{Handshake, MessageType, ProtocolError, SyncMessage};
use crate::registry::SessionRegistry;
use crate::server::ServerStats;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionPhase {
    Connecting,
    Authenticating,
    Joined,
    Relaying,
    Closed,
}

/// Everything a connection task needs from the server.
pub struct ConnectionContext<D: CrdtDocument = YrsDocument> {
    pub registry: Arc<SessionRegistry<D>>,
    pub verifier: Arc<dyn CredentialVerifier>,
    pub policy: Arc<dyn AccessPolicy>,
    pub stats: Arc<RwLock<ServerStats>>,
    pub initial_sync_timeout: Duration,
    pub max_protocol_violations: u32,
}

enum Flow {
    Continue,
    Close,
}

/// Serve one WebSocket connection from upgrade to close.
pub async fn handle_connection<S, D>(
    stream: S,
    addr: SocketAddr,
    ctx: Arc<ConnectionContext<D>>,
) -> Result<(), CollabError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    D: CrdtDocument,
{
    let mut phase = ConnectionPhase::Connecting;

    let mut handshake = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        match Handshake::from_request(request) {
            Ok(parsed) => {
                handshake = Some(parsed);
                Ok(response)
            }
            Err(e) => {
                log::warn!("Refusing upgrade from {addr}: {e}");
                Err(reject(&e))
            }
        }
    };
    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            ctx.stats.write().await.rejected_connections += 1;
            return Err(e.into());
        }
    };
    let Some(handshake) = handshake else {
        return Err(ProtocolError::MissingDocumentId.into());
    };

    {
        let mut s = ctx.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }
    let result = serve(ws, addr, &ctx, handshake, &mut phase).await;
    advance(addr, &mut phase, ConnectionPhase::Closed);
    ctx.stats.write().await.active_connections -= 1;
    result
}

async fn serve<S, D>(
    ws: WebSocketStream<S>,
    addr: SocketAddr,
    ctx: &Arc<ConnectionContext<D>>,
    handshake: Handshake,
    phase: &mut ConnectionPhase,
) -> Result<(), CollabError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    D: CrdtDocument,
{
    let (sink, mut stream) = ws.split();
    let mut conn = Connection {
        sink,
        addr,
        violations: 0,
        max_violations: ctx.max_protocol_violations,
        stats: Arc::clone(&ctx.stats),
    };

    advance(addr, phase, ConnectionPhase::Authenticating);
    let identity = match authorize(ctx, &handshake).await {
        Ok(identity) => identity,
        Err(e) => {
            log::warn!("Denied {addr} access to document {}: {e}", handshake.document_id);
            ctx.stats.write().await.rejected_connections += 1;
            let reason = match e {
                CollabError::Auth(_) => "authentication failed",
                _ => "access denied",
            };
            conn.send(&SyncMessage::access_denied(reason)).await?;
            conn.close(CloseCode::Policy, reason).await;
            return Ok(());
        }
    };

    // A client that already holds state opens with SyncStep1; wait briefly
    // for it so the join can answer with a diff instead of the full state.
    let mut client_vector = None;
    let mut pending = None;
    match tokio::time::timeout(ctx.initial_sync_timeout, stream.next()).await {
        Ok(Some(Ok(Message::Binary(data)))) => match SyncMessage::decode(&data) {
            Ok(msg) if msg.msg_type == MessageType::SyncStep1 => client_vector = Some(msg.payload),
            _ => pending = Some(Message::Binary(data)),
        },
        Ok(Some(Ok(Message::Close(_)))) | Ok(None) => return Ok(()),
        Ok(Some(Ok(other))) => pending = Some(other),
        Ok(Some(Err(e))) => return Err(e.into()),
        Err(_) => {}
    }

    let user_id = identity.user_id.clone();
    let (session, joined) = match ctx
        .registry
        .join(&handshake.document_id, identity, client_vector.as_deref())
        .await
    {
        Ok(joined) => joined,
        Err(e) => {
            conn.close(CloseCode::Error, "document unavailable").await;
            return Err(e);
        }
    };
    advance(addr, phase, ConnectionPhase::Joined);
    log::info!("{addr} ({user_id}) joined document {}", handshake.document_id);

    let membership = Membership {
        registry: Arc::clone(&ctx.registry),
        session: Arc::clone(&session),
        client_id: joined.client_id,
        left: false,
    };

    let result: Result<(), CollabError> = async {
        conn.send(&SyncMessage::sync_step2(joined.initial_sync)).await?;
        conn.send(&SyncMessage::sync_step1(joined.state_vector)).await?;

        if let Some(first) = pending {
            if let Flow::Close = conn.on_frame(&session, joined.client_id, first).await? {
                return Ok(());
            }
        }

        advance(addr, phase, ConnectionPhase::Relaying);
        conn.relay(&session, joined.client_id, &mut stream, joined.receiver)
            .await
    }
    .await;

    membership.leave().await;
    result
}

async fn authorize<D: CrdtDocument>(
    ctx: &ConnectionContext<D>,
    handshake: &Handshake,
) -> Result<Identity, CollabError> {
    let identity = ctx.verifier.verify(&handshake.token)?;

    let policy = Arc::clone(&ctx.policy);
    let document_id = handshake.document_id.clone();
    let candidate = identity.clone();
    let allowed = tokio::task::spawn_blocking(move || policy.can_access(&candidate, &document_id))
        .await
        .unwrap_or(false);

    if allowed {
        Ok(identity)
    } else {
        Err(CollabError::AccessDenied {
            document_id: handshake.document_id.clone(),
            user_id: identity.user_id,
        })
    }
}

/// HTTP response refusing a non-conformant upgrade.
fn reject(error: &ProtocolError) -> ErrorResponse {
    let status = match error {
        ProtocolError::MissingToken => StatusCode::UNAUTHORIZED,
        _ => StatusCode::BAD_REQUEST,
    };
    let mut response = ErrorResponse::new(Some(error.to_string()));
    *response.status_mut() = status;
    response
}

fn advance(addr: SocketAddr, phase: &mut ConnectionPhase, next: ConnectionPhase) {
    debug_assert!(next > *phase, "connection phases only move forward");
    log::trace!("{addr}: {phase:?} -> {next:?}");
    *phase = next;
}

/// Write half of a connection plus its violation budget.
struct Connection<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
    addr: SocketAddr,
    violations: u32,
    max_violations: u32,
    stats: Arc<RwLock<ServerStats>>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn relay<D: CrdtDocument>(
        &mut self,
        session: &Arc<Session<D>>,
        client_id: ClientId,
        stream: &mut SplitStream<WebSocketStream<S>>,
        mut receiver: broadcast::Receiver<Arc<Envelope>>,
    ) -> Result<(), CollabError> {
        loop {
            tokio::select! {
                incoming = stream.next() => match incoming {
                    Some(Ok(message)) => {
                        if let Flow::Close = self.on_frame(session, client_id, message).await? {
                            return Ok(());
                        }
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        log::info!("Connection closed from {}", self.addr);
                        return Ok(());
                    }
                },

                outgoing = receiver.recv() => match outgoing {
                    Ok(envelope) => {
                        // Never echo a client's own frames back to it
                        if envelope.is_from(client_id) {
                            continue;
                        }
                        self.sink.send(Message::Binary(envelope.frame.clone().into())).await?;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("{} lagged by {skipped} frames, resyncing", self.addr);
                        session.record_dropped(skipped);
                        let state = session.encode_state().await;
                        self.send(&SyncMessage::sync_step2(state)).await?;
                    }
                    Err(RecvError::Closed) => return Ok(()),
                },
            }
        }
    }

    async fn on_frame<D: CrdtDocument>(
        &mut self,
        session: &Arc<Session<D>>,
        client_id: ClientId,
        message: Message,
    ) -> Result<Flow, CollabError> {
        match message {
            Message::Binary(data) => {
                self.stats.write().await.total_messages += 1;
                match SyncMessage::decode(&data) {
                    Ok(msg) => self.on_sync_message(session, client_id, msg).await,
                    Err(e) => self.violation(&e.to_string()).await,
                }
            }
            Message::Text(_) => self.violation("text frame").await,
            Message::Ping(data) => {
                self.sink.send(Message::Pong(data)).await?;
                Ok(Flow::Continue)
            }
            Message::Close(_) => {
                log::info!("Connection closed from {}", self.addr);
                Ok(Flow::Close)
            }
            Message::Pong(_) | Message::Frame(_) => Ok(Flow::Continue),
        }
    }

    async fn on_sync_message<D: CrdtDocument>(
        &mut self,
        session: &Arc<Session<D>>,
        client_id: ClientId,
        msg: SyncMessage,
    ) -> Result<Flow, CollabError> {
        match msg.msg_type {
            MessageType::SyncStep1 => match session.diff_since(&msg.payload).await {
                Ok(diff) => self.send(&SyncMessage::sync_step2(diff)).await?,
                Err(e) => return self.violation(&e.to_string()).await,
            },
            MessageType::SyncStep2 | MessageType::Update => {
                if let Err(e) = session.apply_update(client_id, &msg.payload).await {
                    log::warn!("Rejected update from {} on {}: {e}", self.addr, session.document_id());
                    self.send(&SyncMessage::update_rejected(&e.to_string())).await?;
                }
            }
            MessageType::Awareness => {
                session.relay_awareness(client_id, &msg.payload)?;
            }
            MessageType::Ping => self.send(&SyncMessage::pong()).await?,
            MessageType::Pong => {}
            MessageType::UpdateRejected | MessageType::AccessDenied => {
                return self.violation("server-only message type").await;
            }
        }
        Ok(Flow::Continue)
    }

    /// Drop the offending frame; close once the budget is spent.
    async fn violation(&mut self, detail: &str) -> Result<Flow, CollabError> {
        self.violations += 1;
        log::warn!(
            "Protocol violation from {} ({}/{}): {detail}",
            self.addr,
            self.violations,
            self.max_violations
        );
        if self.violations >= self.max_violations {
            self.close(CloseCode::Protocol, "too many malformed messages").await;
            return Ok(Flow::Close);
        }
        Ok(Flow::Continue)
    }

    async fn send(&mut self, msg: &SyncMessage) -> Result<(), CollabError> {
        self.sink.send(Message::Binary(msg.encode()?.into())).await?;
        Ok(())
    }

    /// Best-effort close; the peer may already be gone.
    async fn close(&mut self, code: CloseCode, reason: &str) {
        let frame = CloseFrame {
            code,
            reason: reason.to_owned().into(),
        };
        if let Err(e) = self.sink.send(Message::Close(Some(frame))).await {
            log::debug!("Close to {} not delivered: {e}", self.addr);
        }
    }
}

/// A client's place in a session. Leaving consumes the guard; a guard
/// dropped without leaving (cancelled task) schedules the leave instead.
struct Membership<D: CrdtDocument> {
    registry: Arc<SessionRegistry<D>>,
    session: Arc<Session<D>>,
    client_id: ClientId,
    left: bool,
}

impl<D: CrdtDocument> Membership<D> {
    async fn leave(mut self) {
        self.registry.leave(&self.session, self.client_id).await;
        self.left = true;
    }
}

impl<D: CrdtDocument> Drop for Membership<D> {
    fn drop(&mut self) {
        if self.left {
            return;
        }
        let registry = Arc::clone(&self.registry);
        let session = Arc::clone(&self.session);
        let client_id = self.client_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { registry.leave(&session, client_id).await });
            }
            Err(_) => log::error!("Client {client_id} dropped outside a runtime, membership leaked"),
        }
    }
}
