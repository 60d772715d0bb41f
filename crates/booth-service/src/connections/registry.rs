//! `ConnectionRegistry` - the per-instance owner of every realtime connection.
//!
//! One actor task owns the connection table and processes, in order:
//!
//! - transport events from the realtime endpoint (frames, closes)
//! - messages from the cluster bus, routed through [`route`]
//! - local timers (auth window, grace period, guest recount) posted back
//!   into its own mailbox
//!
//! Because everything runs on the one task, a resumed connection's backlog
//! is always flushed before any live traffic reaches it.
//!
//! # Lifecycle
//!
//! 1. Spawned at startup; reconstructs Lost connections for participants
//!    this instance still owns
//! 2. Runs until its `CancellationToken` fires
//! 3. On shutdown cancels all connection timers and closes transports

use super::actions::{commands, route, Delivery};
use super::messages::{
    OutboundFrame, RegistryMessage, RegistryStatus, TransportEvent, KEEPALIVE_FRAME,
};
use super::state::{Connection, ConnectionState, Lost, Transition};
use crate::auth::TokenAuthRegistry;
use crate::booth::BoothScheduler;
use crate::bus::{BusMessage, EventBus, ServerAction, WireMessage};
use crate::config::Tuning;
use crate::directory::{Permission, UserDirectory};
use crate::errors::{AuthTokenError, BoothError};
use crate::observability::metrics::{
    record_bus_message, record_lost_message_buffered, set_connections_active,
};
use crate::store::{keys, OwnerGuard, StateStore, StoreOp};
use crate::waitlist::WaitlistQueue;
use common::types::ConnectionId;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the registry mailbox.
const REGISTRY_CHANNEL_BUFFER: usize = 1000;

/// Longest chat message kept, in characters.
pub const CHAT_MAX_LENGTH: usize = 300;

/// Commands accepted from authenticated clients.
mod inbound {
    pub const SEND_CHAT: &str = "sendChat";
    pub const VOTE: &str = "vote";
    pub const FAVORITE: &str = "favorite";
    pub const LOGOUT: &str = "logout";
}

/// Durable record of a Lost connection, so another instance can resume it
/// and a restarted one can rebuild it.
#[derive(Debug, Serialize, Deserialize)]
struct LostMarker {
    instance: String,
    #[serde(rename = "lostAt")]
    lost_at: i64,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Everything the registry needs from the rest of the service.
pub struct RegistryContext {
    pub instance_id: String,
    pub tuning: Tuning,
    pub store: Arc<dyn StateStore>,
    pub bus: Arc<dyn EventBus>,
    pub directory: Arc<dyn UserDirectory>,
    pub auth: TokenAuthRegistry,
    pub booth: Arc<BoothScheduler>,
    pub waitlist: Arc<WaitlistQueue>,
}

/// Handle to the `ConnectionRegistry` actor.
#[derive(Debug, Clone)]
pub struct ConnectionRegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
}

impl ConnectionRegistryHandle {
    /// Spawn the registry actor.
    ///
    /// The bus subscription is taken before this returns.
    #[must_use]
    pub fn spawn(context: RegistryContext, cancel_token: CancellationToken) -> Self {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);
        let bus_rx = context.bus.subscribe();

        let actor = ConnectionRegistry {
            ctx: context,
            receiver,
            mailbox: sender.clone(),
            bus_rx,
            bus_open: true,
            cancel_token: cancel_token.clone(),
            connections: HashMap::new(),
            users: HashMap::new(),
            recount_scheduled: false,
        };
        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
        }
    }

    async fn send(&self, message: RegistryMessage) -> Result<(), BoothError> {
        self.sender
            .send(message)
            .await
            .map_err(|e| BoothError::Internal(format!("channel send failed: {e}")))
    }

    /// Register a new transport. It starts as a Guest.
    ///
    /// Returns the connection ID and the frames to write to the transport.
    pub async fn open_transport(
        &self,
    ) -> Result<(ConnectionId, mpsc::UnboundedReceiver<OutboundFrame>), BoothError> {
        let (outbound, frames) = mpsc::unbounded_channel();
        let (tx, rx) = oneshot::channel();
        self.send(RegistryMessage::OpenTransport {
            outbound,
            respond_to: tx,
        })
        .await?;

        let connection_id = rx
            .await
            .map_err(|e| BoothError::Internal(format!("response receive failed: {e}")))?;
        Ok((connection_id, frames))
    }

    /// Report a frame or close from a transport.
    pub async fn transport_event(
        &self,
        connection_id: ConnectionId,
        event: TransportEvent,
    ) -> Result<(), BoothError> {
        self.send(RegistryMessage::Transport {
            connection_id,
            event,
        })
        .await
    }

    /// Send to every live connection on this instance.
    pub async fn broadcast(&self, message: WireMessage) -> Result<(), BoothError> {
        self.send(RegistryMessage::Broadcast { message }).await
    }

    /// Send to one participant, buffering if their connection is Lost.
    pub async fn send_to(&self, user_id: &str, message: WireMessage) -> Result<(), BoothError> {
        self.send(RegistryMessage::SendTo {
            user_id: user_id.to_string(),
            message,
        })
        .await
    }

    pub async fn status(&self) -> Result<RegistryStatus, BoothError> {
        let (tx, rx) = oneshot::channel();
        self.send(RegistryMessage::GetStatus { respond_to: tx })
            .await?;
        rx.await
            .map_err(|e| BoothError::Internal(format!("response receive failed: {e}")))
    }

    /// State of the participant's connection on this instance.
    pub async fn lookup_user(&self, user_id: &str) -> Result<Option<ConnectionState>, BoothError> {
        let (tx, rx) = oneshot::channel();
        self.send(RegistryMessage::LookupUser {
            user_id: user_id.to_string(),
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|e| BoothError::Internal(format!("response receive failed: {e}")))
    }

    /// True once the actor has been told to stop.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

struct ConnectionRegistry {
    ctx: RegistryContext,
    receiver: mpsc::Receiver<RegistryMessage>,
    /// Own mailbox, for timers.
    mailbox: mpsc::Sender<RegistryMessage>,
    bus_rx: broadcast::Receiver<BusMessage>,
    bus_open: bool,
    cancel_token: CancellationToken,
    connections: HashMap<ConnectionId, Connection>,
    /// Participant to their Authenticated or Lost connection.
    users: HashMap<String, ConnectionId>,
    recount_scheduled: bool,
}

impl ConnectionRegistry {
    #[instrument(skip_all, name = "booth.registry", fields(instance_id = %self.ctx.instance_id))]
    async fn run(mut self) {
        if let Err(e) = self.reconcile_lost_sessions().await {
            error!(target: "booth.registry", error = %e, "Failed to restore lost sessions");
        }
        self.update_gauges();

        let mut ping = tokio::time::interval(self.ctx.tuning.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping.tick().await;

        info!(target: "booth.registry", "ConnectionRegistry started");

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(target: "booth.registry", "ConnectionRegistry received cancellation signal");
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => self.handle_message(message).await,
                        None => break,
                    }
                }

                msg = self.bus_rx.recv(), if self.bus_open => {
                    self.handle_bus(msg).await;
                }

                _ = ping.tick() => {
                    self.ping_idle();
                    // Keeps this instance's guest count from expiring.
                    self.schedule_recount();
                }
            }
        }

        self.shutdown().await;
        info!(target: "booth.registry", "ConnectionRegistry stopped");
    }

    async fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::OpenTransport {
                outbound,
                respond_to,
            } => {
                let connection_id = self.open(outbound);
                let _ = respond_to.send(connection_id);
            }
            RegistryMessage::Transport {
                connection_id,
                event: TransportEvent::Frame(frame),
            } => self.handle_frame(connection_id, frame).await,
            RegistryMessage::Transport {
                connection_id,
                event: TransportEvent::Closed,
            } => {
                if let Some(transition) = self.connections.get(&connection_id).map(Connection::on_closed) {
                    self.apply(connection_id, transition).await;
                }
            }
            RegistryMessage::Broadcast { message } => self.broadcast_local(&message).await,
            RegistryMessage::SendTo { user_id, message } => {
                self.send_to_user(&user_id, &message).await;
            }
            RegistryMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.status());
            }
            RegistryMessage::LookupUser {
                user_id,
                respond_to,
            } => {
                let state = self
                    .users
                    .get(&user_id)
                    .and_then(|id| self.connections.get(id))
                    .map(Connection::state);
                let _ = respond_to.send(state);
            }
            RegistryMessage::AuthWindowElapsed { connection_id } => {
                if matches!(self.connections.get(&connection_id), Some(Connection::Guest(_))) {
                    debug!(
                        target: "booth.registry",
                        connection_id = %connection_id,
                        "Guest did not authenticate in time"
                    );
                    self.send_error(
                        connection_id,
                        &BoothError::AuthToken(AuthTokenError::WindowElapsed),
                    );
                    self.close_transport(connection_id);
                    self.apply(connection_id, Transition::Remove { offline: false })
                        .await;
                }
            }
            RegistryMessage::GraceExpired { connection_id } => {
                let Some(Connection::Lost(lost)) = self.connections.get(&connection_id) else {
                    return;
                };
                let user_id = lost.user_id.clone();
                let offline = match self.ctx.store.hash_get(keys::SESSION_OWNERS, &user_id).await {
                    Ok(owner) => owner.as_deref() == Some(self.ctx.instance_id.as_str()),
                    Err(e) => {
                        warn!(target: "booth.registry", user_id = %user_id, error = %e, "Failed to read session owner");
                        true
                    }
                };
                if !offline {
                    debug!(target: "booth.registry", user_id = %user_id, "Grace expired for a session owned elsewhere");
                }
                self.apply(connection_id, Transition::Remove { offline }).await;
            }
            RegistryMessage::RecountGuests => self.recount_guests().await,
        }
    }

    // ------------------------------------------------------------------
    // Connection table
    // ------------------------------------------------------------------

    fn open(&mut self, outbound: mpsc::UnboundedSender<OutboundFrame>) -> ConnectionId {
        let connection_id = ConnectionId::new();
        let connection = Connection::guest(outbound);
        if let Connection::Guest(guest) = &connection {
            self.post_after(
                guest.window.clone(),
                self.ctx.tuning.auth_window,
                RegistryMessage::AuthWindowElapsed { connection_id },
            );
        }
        self.connections.insert(connection_id, connection);

        debug!(target: "booth.registry", connection_id = %connection_id, "Transport opened");
        self.update_gauges();
        self.schedule_recount();
        connection_id
    }

    /// Post `message` to the mailbox after `after`, unless `cancel` fires.
    fn post_after(&self, cancel: CancellationToken, after: Duration, message: RegistryMessage) {
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(after) => {
                    let _ = mailbox.send(message).await;
                }
            }
        });
    }

    async fn apply(&mut self, connection_id: ConnectionId, transition: Transition) {
        match transition {
            Transition::Stay => {}
            Transition::Promote { user_id } => {
                if let Err(e) = self.promote(connection_id, user_id).await {
                    error!(
                        target: "booth.registry",
                        connection_id = %connection_id,
                        error = %e,
                        "Failed to complete authentication"
                    );
                }
            }
            Transition::Lose => self.lose(connection_id).await,
            Transition::Remove { offline } => self.remove(connection_id, offline).await,
        }
        self.update_gauges();
    }

    async fn remove(&mut self, connection_id: ConnectionId, offline: bool) {
        let Some(connection) = self.connections.remove(&connection_id) else {
            return;
        };
        connection.cancel_timers();

        let Some(user_id) = connection.user_id().map(str::to_string) else {
            debug!(target: "booth.registry", connection_id = %connection_id, "Guest removed");
            self.schedule_recount();
            return;
        };
        if self.users.get(&user_id) == Some(&connection_id) {
            self.users.remove(&user_id);
        }

        if offline {
            info!(target: "booth.registry", user_id = %user_id, "Participant offline");
            if let Err(e) = self.take_offline(&user_id).await {
                error!(
                    target: "booth.registry",
                    user_id = %user_id,
                    error = %e,
                    "Failed to take participant offline"
                );
            }
        }
    }

    /// Clear shared presence, then leave the waitlist and the booth.
    async fn take_offline(&self, user_id: &str) -> Result<(), BoothError> {
        self.ctx
            .store
            .atomic(vec![
                StoreOp::SetRemove {
                    key: keys::ONLINE_USERS.to_string(),
                    member: user_id.to_string(),
                },
                StoreOp::HashDel {
                    key: keys::SESSION_OWNERS.to_string(),
                    field: user_id.to_string(),
                },
                StoreOp::Del {
                    key: keys::lost_marker(user_id),
                },
                StoreOp::Del {
                    key: keys::lost_queue(user_id),
                },
            ])
            .await?;
        self.ctx
            .bus
            .publish_action(ServerAction::UserLeave {
                user_id: user_id.to_string(),
            })
            .await?;
        self.ctx.waitlist.leave_if_queued(user_id).await?;
        match self.ctx.booth.skip_if_current(user_id).await {
            Ok(_) | Err(BoothError::AdvanceInProgress) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn lose(&mut self, connection_id: ConnectionId) {
        let Some(connection) = self.connections.remove(&connection_id) else {
            return;
        };
        let grace = self.cancel_token.child_token();
        let connection = connection.into_lost(grace.clone());
        let Some(user_id) = connection.user_id().map(str::to_string) else {
            return;
        };
        self.connections.insert(connection_id, connection);

        let grace_period = self.ctx.tuning.grace_period;
        if let Err(e) = self.write_lost_marker(&user_id, now_ms(), grace_period).await {
            warn!(target: "booth.registry", user_id = %user_id, error = %e, "Failed to persist lost session");
        }
        self.post_after(
            grace,
            grace_period,
            RegistryMessage::GraceExpired { connection_id },
        );

        info!(
            target: "booth.registry",
            user_id = %user_id,
            grace_secs = grace_period.as_secs(),
            "Connection lost, holding session"
        );
    }

    async fn write_lost_marker(
        &self,
        user_id: &str,
        lost_at: i64,
        ttl: Duration,
    ) -> Result<(), BoothError> {
        let marker = serde_json::to_string(&LostMarker {
            instance: self.ctx.instance_id.clone(),
            lost_at,
        })?;
        self.ctx
            .store
            .atomic(vec![
                StoreOp::Set {
                    key: keys::lost_marker(user_id),
                    value: marker,
                    ttl: Some(ttl.max(Duration::from_millis(1))),
                },
                StoreOp::HashSet {
                    key: keys::SESSION_OWNERS.to_string(),
                    field: user_id.to_string(),
                    value: self.ctx.instance_id.clone(),
                },
            ])
            .await
    }

    // ------------------------------------------------------------------
    // Inbound frames
    // ------------------------------------------------------------------

    async fn handle_frame(&mut self, connection_id: ConnectionId, frame: String) {
        let Some(connection) = self.connections.get_mut(&connection_id) else {
            return;
        };
        if let Connection::Authenticated(auth) = connection {
            auth.last_activity = Instant::now();
        }
        if frame == KEEPALIVE_FRAME {
            return;
        }

        let user_id = match connection {
            Connection::Guest(_) => None,
            Connection::Authenticated(auth) => Some(auth.user_id.clone()),
            Connection::Lost(_) => return,
        };

        match user_id {
            Some(user_id) => self.handle_command(connection_id, &user_id, &frame).await,
            None => {
                let transition = self.authenticate(connection_id, frame.trim()).await;
                self.apply(connection_id, transition).await;
            }
        }
    }

    async fn authenticate(&self, connection_id: ConnectionId, token: &str) -> Transition {
        match self.redeem(connection_id, token).await {
            Ok(user_id) => Transition::Promote { user_id },
            Err(e) => {
                debug!(
                    target: "booth.registry",
                    connection_id = %connection_id,
                    error = %e,
                    "Authentication failed"
                );
                self.send_error(connection_id, &e);
                if matches!(e, BoothError::AuthToken(AuthTokenError::WindowElapsed)) {
                    self.close_transport(connection_id);
                    Transition::Remove { offline: false }
                } else {
                    Transition::Stay
                }
            }
        }
    }

    async fn redeem(&self, connection_id: ConnectionId, token: &str) -> Result<String, BoothError> {
        let within_window = self
            .connections
            .get(&connection_id)
            .is_some_and(|c| c.within_auth_window(self.ctx.tuning.auth_window));
        if !within_window {
            return Err(AuthTokenError::WindowElapsed.into());
        }

        let user_id = self.ctx.auth.get_token_user(token).await?;
        let Some(user) = self.ctx.directory.get_user(&user_id).await? else {
            return Err(AuthTokenError::NotFound.into());
        };
        if user.banned {
            return Err(AuthTokenError::Banned.into());
        }
        Ok(user_id)
    }

    /// Guest to Authenticated, resuming any Lost session of the participant.
    #[instrument(skip_all, fields(user_id = %user_id))]
    async fn promote(&mut self, connection_id: ConnectionId, user_id: String) -> Result<(), BoothError> {
        let Some(connection) = self.connections.remove(&connection_id) else {
            return Ok(());
        };
        let connection = connection.promote(user_id.clone());

        let mut resumed_locally = false;
        if let Some(previous_id) = self.users.insert(user_id.clone(), connection_id) {
            if let Some(previous) = self.connections.remove(&previous_id) {
                previous.cancel_timers();
                // A second live transport replaces the first.
                if let Some(outbound) = previous.outbound() {
                    let _ = outbound.send(OutboundFrame::Close);
                }
                resumed_locally = true;
            }
        }
        self.connections.insert(connection_id, connection);
        self.schedule_recount();

        self.send_message(
            connection_id,
            &WireMessage::new(commands::AUTHENTICATED, json!({ "userID": user_id })),
        );

        // Claim the session before reading its backlog so a previous owner's
        // guarded buffering stops before the drain.
        self.ctx
            .store
            .atomic(vec![
                StoreOp::SetAdd {
                    key: keys::ONLINE_USERS.to_string(),
                    member: user_id.clone(),
                },
                StoreOp::HashSet {
                    key: keys::SESSION_OWNERS.to_string(),
                    field: user_id.clone(),
                    value: self.ctx.instance_id.clone(),
                },
            ])
            .await?;

        let marker = self.ctx.store.get_del(&keys::lost_marker(&user_id)).await?;
        let resumed_remotely = marker.is_some() && !resumed_locally;

        let backlog = self.ctx.store.list_drain(&keys::lost_queue(&user_id)).await?;
        if !backlog.is_empty() {
            debug!(
                target: "booth.registry",
                user_id = %user_id,
                count = backlog.len(),
                "Flushing buffered messages"
            );
        }
        for frame in backlog {
            self.send_frame(connection_id, frame);
        }

        if resumed_remotely {
            self.ctx
                .bus
                .publish_action(ServerAction::SessionResumed {
                    user_id: user_id.clone(),
                    instance_id: self.ctx.instance_id.clone(),
                })
                .await?;
        }
        if resumed_locally || resumed_remotely {
            info!(target: "booth.registry", user_id = %user_id, "Session resumed");
        } else {
            self.ctx
                .bus
                .publish_action(ServerAction::UserJoin {
                    user_id: user_id.clone(),
                })
                .await?;
            info!(target: "booth.registry", user_id = %user_id, "Participant authenticated");
        }
        Ok(())
    }

    async fn handle_command(&mut self, connection_id: ConnectionId, user_id: &str, frame: &str) {
        let message: WireMessage = match serde_json::from_str(frame) {
            Ok(message) => message,
            Err(e) => {
                debug!(target: "booth.registry", error = %e, "Ignoring undecodable frame");
                return;
            }
        };

        let result = match message.command.as_str() {
            inbound::SEND_CHAT => self.send_chat(user_id, &message.data).await,
            inbound::VOTE => self.vote(user_id, &message.data).await,
            inbound::FAVORITE => self.ctx.booth.favorite(user_id).await.map(|_| ()),
            inbound::LOGOUT => {
                self.close_transport(connection_id);
                self.apply(connection_id, Transition::Remove { offline: true })
                    .await;
                Ok(())
            }
            other => {
                debug!(target: "booth.registry", command = %other, "Ignoring unknown command");
                Ok(())
            }
        };

        if let Err(e) = result {
            self.send_error(connection_id, &e);
        }
    }

    async fn send_chat(&self, user_id: &str, data: &serde_json::Value) -> Result<(), BoothError> {
        let Some(text) = data.as_str() else {
            return Err(BoothError::Validation("Chat message must be text".to_string()));
        };
        if self.ctx.directory.is_muted(user_id).await? {
            return Err(BoothError::PermissionDenied("You are muted".to_string()));
        }
        if !self.ctx.directory.can(user_id, Permission::ChatSend).await? {
            return Err(BoothError::PermissionDenied(
                "You cannot send chat messages".to_string(),
            ));
        }

        let message: String = text.trim().chars().take(CHAT_MAX_LENGTH).collect();
        if message.is_empty() {
            return Ok(());
        }

        self.ctx
            .bus
            .publish_action(ServerAction::ChatMessage {
                id: uuid::Uuid::new_v4().to_string(),
                user_id: user_id.to_string(),
                message,
                timestamp: now_ms(),
            })
            .await
    }

    async fn vote(&self, user_id: &str, data: &serde_json::Value) -> Result<(), BoothError> {
        let direction = data
            .as_i64()
            .and_then(|d| i8::try_from(d).ok())
            .ok_or_else(|| BoothError::Validation("Vote must be 1 or -1".to_string()))?;
        self.ctx.booth.vote(user_id, direction).await.map(|_| ())
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    fn send_frame(&self, connection_id: ConnectionId, frame: String) {
        if let Some(outbound) = self.connections.get(&connection_id).and_then(Connection::outbound) {
            // A closed transport reports Closed on its own.
            let _ = outbound.send(OutboundFrame::Text(frame));
        }
    }

    fn send_message(&self, connection_id: ConnectionId, message: &WireMessage) {
        match message.to_frame() {
            Ok(frame) => self.send_frame(connection_id, frame),
            Err(e) => warn!(target: "booth.registry", error = %e, "Failed to encode message"),
        }
    }

    fn send_error(&self, connection_id: ConnectionId, error: &BoothError) {
        self.send_message(
            connection_id,
            &WireMessage::new(commands::ERROR, json!(error.client_message())),
        );
    }

    fn close_transport(&self, connection_id: ConnectionId) {
        if let Some(outbound) = self.connections.get(&connection_id).and_then(Connection::outbound) {
            let _ = outbound.send(OutboundFrame::Close);
        }
    }

    /// Send to every local connection. Lost participants get the frame
    /// queued for their resume.
    async fn broadcast_local(&mut self, message: &WireMessage) {
        let frame = match message.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(target: "booth.registry", error = %e, "Failed to encode broadcast");
                return;
            }
        };
        let mut lost = Vec::new();
        for connection in self.connections.values() {
            match connection {
                Connection::Lost(l) => lost.push(l.user_id.clone()),
                live => {
                    if let Some(outbound) = live.outbound() {
                        let _ = outbound.send(OutboundFrame::Text(frame.clone()));
                    }
                }
            }
        }
        for user_id in lost {
            self.buffer_for_lost(&user_id, &frame).await;
        }
    }

    async fn send_to_user(&mut self, user_id: &str, message: &WireMessage) {
        let Some(connection_id) = self.users.get(user_id).copied() else {
            return;
        };
        match self.connections.get(&connection_id).map(Connection::state) {
            Some(ConnectionState::Authenticated) => self.send_message(connection_id, message),
            Some(ConnectionState::Lost) => match message.to_frame() {
                Ok(frame) => self.buffer_for_lost(user_id, &frame).await,
                Err(e) => warn!(target: "booth.registry", error = %e, "Failed to encode message"),
            },
            Some(ConnectionState::Guest) | None => {}
        }
    }

    /// Queue `frame` for a Lost participant while this instance still owns
    /// the session. Once another instance has claimed it, the local Lost
    /// connection is dropped without taking the participant offline.
    async fn buffer_for_lost(&mut self, user_id: &str, frame: &str) {
        let marker_key = keys::lost_marker(user_id);
        let guard = OwnerGuard {
            owners_key: keys::SESSION_OWNERS,
            user_id,
            owner: &self.ctx.instance_id,
            marker_key: &marker_key,
        };
        let pushed = self
            .ctx
            .store
            .list_push_capped(
                &keys::lost_queue(user_id),
                frame,
                self.ctx.tuning.lost_queue_capacity,
                self.ctx.tuning.grace_period,
                &guard,
            )
            .await;

        match pushed {
            Ok(true) => {
                record_lost_message_buffered();
                debug!(target: "booth.registry", user_id = %user_id, "Buffered for lost connection");
            }
            Ok(false) => self.release_lost(user_id).await,
            Err(e) => {
                warn!(target: "booth.registry", user_id = %user_id, error = %e, "Failed to buffer message");
            }
        }
    }

    /// Forget a local Lost connection whose session moved elsewhere.
    async fn release_lost(&mut self, user_id: &str) {
        let Some(connection_id) = self.users.get(user_id).copied() else {
            return;
        };
        if matches!(self.connections.get(&connection_id), Some(Connection::Lost(_))) {
            debug!(target: "booth.registry", user_id = %user_id, "Lost session no longer owned here");
            self.apply(connection_id, Transition::Remove { offline: false })
                .await;
        }
    }

    fn ping_idle(&self) {
        let idle_threshold = self.ctx.tuning.idle_threshold();
        for connection in self.connections.values() {
            if let Connection::Authenticated(auth) = connection {
                if auth.last_activity.elapsed() >= idle_threshold {
                    let _ = auth
                        .outbound
                        .send(OutboundFrame::Text(KEEPALIVE_FRAME.to_string()));
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Bus
    // ------------------------------------------------------------------

    async fn handle_bus(&mut self, received: Result<BusMessage, RecvError>) {
        match received {
            Ok(message) => {
                record_bus_message(message.channel());
                match message {
                    BusMessage::Broadcast(wire) => self.broadcast_local(&wire).await,
                    BusMessage::Action(action) => {
                        for delivery in route(action) {
                            self.deliver(delivery).await;
                        }
                    }
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(target: "booth.registry", skipped, "Bus receiver lagged, messages dropped");
            }
            Err(RecvError::Closed) => {
                warn!(target: "booth.registry", "Bus closed");
                self.bus_open = false;
            }
        }
    }

    async fn deliver(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Broadcast(message) => self.broadcast_local(&message).await,
            Delivery::SendTo { user_id, message } => self.send_to_user(&user_id, &message).await,
            Delivery::Ban { user_id } => self.ban_local(&user_id).await,
            Delivery::SessionResumed {
                user_id,
                instance_id,
            } => {
                if instance_id == self.ctx.instance_id {
                    return;
                }
                let Some(connection_id) = self.users.get(&user_id).copied() else {
                    return;
                };
                if matches!(self.connections.get(&connection_id), Some(Connection::Lost(_))) {
                    debug!(
                        target: "booth.registry",
                        user_id = %user_id,
                        resumed_on = %instance_id,
                        "Lost session resumed elsewhere"
                    );
                    self.apply(connection_id, Transition::Remove { offline: false })
                        .await;
                }
            }
        }
    }

    async fn ban_local(&mut self, user_id: &str) {
        let Some(connection_id) = self.users.get(user_id).copied() else {
            return;
        };
        let transition = match self.connections.get_mut(&connection_id) {
            Some(Connection::Authenticated(auth)) => {
                auth.banned = true;
                let _ = auth.outbound.send(OutboundFrame::Close);
                Transition::Remove { offline: true }
            }
            Some(Connection::Lost(_)) => Transition::Remove { offline: true },
            Some(Connection::Guest(_)) | None => Transition::Stay,
        };
        info!(target: "booth.registry", user_id = %user_id, "Closing banned participant");
        self.apply(connection_id, transition).await;
    }

    // ------------------------------------------------------------------
    // Guests and gauges
    // ------------------------------------------------------------------

    fn status(&self) -> RegistryStatus {
        let mut status = RegistryStatus::default();
        for connection in self.connections.values() {
            match connection.state() {
                ConnectionState::Guest => status.guests += 1,
                ConnectionState::Authenticated => status.authenticated += 1,
                ConnectionState::Lost => status.lost += 1,
            }
        }
        status
    }

    fn update_gauges(&self) {
        let status = self.status();
        set_connections_active(ConnectionState::Guest.as_str(), status.guests);
        set_connections_active(ConnectionState::Authenticated.as_str(), status.authenticated);
        set_connections_active(ConnectionState::Lost.as_str(), status.lost);
    }

    fn schedule_recount(&mut self) {
        if self.recount_scheduled {
            return;
        }
        self.recount_scheduled = true;
        self.post_after(
            self.cancel_token.child_token(),
            self.ctx.tuning.guest_recount_debounce,
            RegistryMessage::RecountGuests,
        );
    }

    /// Publish the cluster-wide guest total if it changed.
    async fn recount_guests(&mut self) {
        self.recount_scheduled = false;
        let local = self.status().guests;

        match self.swap_guest_total(local).await {
            Ok(Some(total)) => {
                if let Err(e) = self
                    .ctx
                    .bus
                    .publish_action(ServerAction::GuestCount { count: total })
                    .await
                {
                    warn!(target: "booth.registry", error = %e, "Failed to publish guest count");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(target: "booth.registry", error = %e, "Guest recount failed"),
        }
    }

    /// Report `local`, sum every live instance and store the total.
    ///
    /// Each instance's count expires unless refreshed, so a crashed instance
    /// ages out of the sum. Returns the total only when it replaced a
    /// different stored value, which keeps one publish per change across
    /// the cluster.
    async fn swap_guest_total(&self, local: usize) -> Result<Option<u64>, BoothError> {
        let store = &self.ctx.store;
        store
            .atomic(vec![
                StoreOp::Set {
                    key: keys::guest_count(&self.ctx.instance_id),
                    value: local.to_string(),
                    ttl: Some(self.ctx.tuning.guest_count_ttl()),
                },
                StoreOp::SetAdd {
                    key: keys::GUEST_INSTANCES.to_string(),
                    member: self.ctx.instance_id.clone(),
                },
            ])
            .await?;

        let mut total = 0u64;
        for instance_id in store.set_members(keys::GUEST_INSTANCES).await? {
            match store.get(&keys::guest_count(&instance_id)).await? {
                Some(count) => total = total.saturating_add(count.parse::<u64>().unwrap_or(0)),
                None => {
                    debug!(target: "booth.registry", instance_id = %instance_id, "Pruning expired guest count");
                    store.set_remove(keys::GUEST_INSTANCES, &instance_id).await?;
                }
            }
        }

        let rendered = total.to_string();
        let previous = store.get_set(keys::GUEST_TOTAL, &rendered).await?;
        Ok((previous.as_deref() != Some(rendered.as_str())).then_some(total))
    }

    // ------------------------------------------------------------------
    // Boot and shutdown
    // ------------------------------------------------------------------

    /// Rebuild Lost connections for participants still online and owned by
    /// this instance (or by nobody), with whatever grace time they had left.
    async fn reconcile_lost_sessions(&mut self) -> Result<(), BoothError> {
        let online = self.ctx.store.set_members(keys::ONLINE_USERS).await?;
        let owners = self.ctx.store.hash_get_all(keys::SESSION_OWNERS).await?;
        let grace_period = self.ctx.tuning.grace_period;
        let now = now_ms();
        let mut restored = 0usize;

        for user_id in online {
            if self.users.contains_key(&user_id) {
                continue;
            }
            if owners
                .get(&user_id)
                .is_some_and(|owner| *owner != self.ctx.instance_id)
            {
                continue;
            }

            let marker = self
                .ctx
                .store
                .get(&keys::lost_marker(&user_id))
                .await?
                .and_then(|raw| serde_json::from_str::<LostMarker>(&raw).ok());
            let lost_at = marker.map_or(now, |m| m.lost_at.min(now));
            let elapsed = Duration::from_millis(u64::try_from(now - lost_at).unwrap_or(0));
            let remaining = grace_period.saturating_sub(elapsed);

            self.write_lost_marker(&user_id, lost_at, remaining).await?;

            let connection_id = ConnectionId::new();
            let grace = self.cancel_token.child_token();
            self.connections.insert(
                connection_id,
                Connection::Lost(Lost {
                    user_id: user_id.clone(),
                    grace: grace.clone(),
                }),
            );
            self.users.insert(user_id.clone(), connection_id);
            self.post_after(
                grace,
                remaining,
                RegistryMessage::GraceExpired { connection_id },
            );
            restored += 1;
        }

        if restored > 0 {
            info!(target: "booth.registry", restored, "Restored lost sessions");
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        for connection in self.connections.values() {
            connection.cancel_timers();
            if let Some(outbound) = connection.outbound() {
                let _ = outbound.send(OutboundFrame::Close);
            }
        }
        let cleared = self
            .ctx
            .store
            .atomic(vec![
                StoreOp::Del {
                    key: keys::guest_count(&self.ctx.instance_id),
                },
                StoreOp::SetRemove {
                    key: keys::GUEST_INSTANCES.to_string(),
                    member: self.ctx.instance_id.clone(),
                },
            ])
            .await;
        if let Err(e) = cleared {
            warn!(target: "booth.registry", error = %e, "Failed to clear guest count");
        }
    }
}
