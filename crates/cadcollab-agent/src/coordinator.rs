//! Per-project session coordinator.
//!
//! One task owns the [`Session`] of a project. Client messages, fan-out
//! envelopes and timer ticks are all handled on that task, one at a time,
//! so session state is never shared. Client commands arrive on a bounded
//! queue and are processed in arrival order; a full queue rejects the
//! message with `unavailable` instead of blocking the connection.

use cadcollab_core::{
    Authenticator, Clock, CollabError, Conflict, ConnectionId, CursorPosition, Departure,
    DocumentStore, EntityKey, EntityType, Expiry, LockDecision, LockKind, MergeOutcome, Operation,
    OperationRequest, OperationType, Permission, ProjectSnapshot, ResolutionPlan, Session,
    SessionPersistence, SessionSettings, SessionState, Submission, UserProfile,
};
use cadcollab_fanout::FanOut;
use cadcollab_proto::{Audience, ClientMessage, Comment, Envelope, ReleaseReason, ServerEvent};
use std::collections::HashMap;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use uuid::Uuid;

/// Outbound events of one client connection.
pub type EventSink = mpsc::UnboundedSender<ServerEvent>;

/// Everything a coordinator talks to besides its clients.
#[derive(Clone)]
pub struct Services {
    /// Auth and project access
    pub auth: Arc<dyn Authenticator>,
    /// Authoritative document state
    pub store: Arc<dyn DocumentStore>,
    /// Session snapshot sink
    pub persistence: Arc<dyn SessionPersistence>,
    /// Cross-process relay
    pub fanout: Arc<dyn FanOut>,
    /// Time source
    pub clock: Arc<dyn Clock>,
    /// Origin stamped on published envelopes
    pub node_id: Uuid,
    /// Tunables for new sessions
    pub settings: SessionSettings,
}

enum Command {
    Join {
        connection: ConnectionId,
        profile: UserProfile,
        sink: EventSink,
        reply: oneshot::Sender<Uuid>,
    },
    Leave {
        connection: ConnectionId,
    },
    Client {
        connection: ConnectionId,
        message: ClientMessage,
    },
    State {
        reply: oneshot::Sender<SessionState>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle onto a running coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    project_id: String,
    commands: mpsc::Sender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Join { connection, .. } => write!(f, "Join({connection})"),
            Command::Leave { connection } => write!(f, "Leave({connection})"),
            Command::Client { connection, message } => {
                write!(f, "Client({connection}, {})", message.kind())
            }
            Command::State { .. } => f.write_str("State"),
            Command::Shutdown { .. } => f.write_str("Shutdown"),
        }
    }
}

fn gone(project_id: &str) -> CollabError {
    CollabError::Unavailable(format!("coordinator for {project_id} stopped"))
}

impl CoordinatorHandle {
    /// Project served by the coordinator.
    #[must_use]
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Whether the coordinator task has exited.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Attach an authenticated connection. Returns the session id once the
    /// `session_joined` event was queued on `sink`.
    ///
    /// # Errors
    ///
    /// Returns [`CollabError::Unavailable`] if the coordinator stopped.
    pub async fn join(
        &self,
        connection: ConnectionId,
        profile: UserProfile,
        sink: EventSink,
    ) -> Result<Uuid, CollabError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Join {
                connection,
                profile,
                sink,
                reply,
            })
            .await
            .map_err(|_| gone(&self.project_id))?;
        rx.await.map_err(|_| gone(&self.project_id))
    }

    /// Queue a client message.
    ///
    /// # Errors
    ///
    /// Returns [`CollabError::Unavailable`] if the queue is full or the
    /// coordinator stopped.
    pub fn submit(&self, connection: ConnectionId, message: ClientMessage) -> Result<(), CollabError> {
        self.commands
            .try_send(Command::Client {
                connection,
                message,
            })
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => {
                    CollabError::Unavailable("operation queue is full".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => gone(&self.project_id),
            })
    }

    /// Detach a connection.
    pub async fn leave(&self, connection: ConnectionId) {
        if self.commands.send(Command::Leave { connection }).await.is_err() {
            tracing::debug!(project_id = %self.project_id, %connection, "Leave after coordinator stopped");
        }
    }

    /// Snapshot of the session state.
    ///
    /// # Errors
    ///
    /// Returns [`CollabError::Unavailable`] if the coordinator stopped.
    pub async fn state(&self) -> Result<SessionState, CollabError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::State { reply })
            .await
            .map_err(|_| gone(&self.project_id))?;
        rx.await.map_err(|_| gone(&self.project_id))
    }

    /// Persist state and stop the coordinator.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// Load a project and start its coordinator.
///
/// # Errors
///
/// Returns an error if the document store cannot load the project.
pub async fn spawn(project_id: &str, services: Services) -> Result<CoordinatorHandle, CollabError> {
    let mut project = services.store.load_project(project_id).await?;
    project.project_id = project_id.to_string();

    let remote = match services.fanout.subscribe(project_id).await {
        Ok(rx) => Some(rx),
        Err(err) => {
            tracing::warn!(project_id, error = %err, "Fan-out subscribe failed, serving locally only");
            None
        }
    };

    let (tx, rx) = mpsc::channel(services.settings.queue_capacity.max(1));
    let coordinator = Coordinator::new(project, services);
    tracing::info!(
        project_id,
        session_id = %coordinator.session.id(),
        "Coordinator started"
    );
    tokio::spawn(coordinator.run(rx, remote));

    Ok(CoordinatorHandle {
        project_id: project_id.to_string(),
        commands: tx,
    })
}

struct Coordinator {
    session: Session,
    services: Services,
    sinks: HashMap<ConnectionId, EventSink>,
    saved_revision: u64,
}

impl Coordinator {
    fn new(project: ProjectSnapshot, services: Services) -> Self {
        let saved_revision = project.revision;
        let session = Session::new(project, services.settings.clone(), services.clock.now_ms());
        Self {
            session,
            services,
            sinks: HashMap::new(),
            saved_revision,
        }
    }

    fn now(&self) -> u64 {
        self.services.clock.now_ms()
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut remote: Option<mpsc::UnboundedReceiver<Envelope>>,
    ) {
        let heartbeat = Duration::from_millis(self.session.settings().heartbeat_interval_ms.max(1));
        let autosave = Duration::from_millis(self.session.settings().autosave_interval_ms.max(1));
        let mut sweep = interval_at(Instant::now() + heartbeat, heartbeat);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut save = interval_at(Instant::now() + autosave, autosave);
        save.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut shutdown_reply = None;

        loop {
            let timer = sleep_until(self.session.next_deadline(), self.now());

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        shutdown_reply = Some(reply);
                        break;
                    }
                    Some(command) => self.handle(command).await,
                    None => break,
                },

                envelope = next_remote(&mut remote) => match envelope {
                    Some(envelope) => self.apply_remote(envelope),
                    None => {
                        tracing::warn!(project_id = %self.session.project_id(), "Fan-out closed, serving locally only");
                        remote = None;
                    }
                },

                () = timer => self.fire_timers().await,

                _ = sweep.tick() => self.sweep().await,

                _ = save.tick() => self.autosave().await,
            }
        }

        self.autosave().await;
        if let Err(err) = self.services.fanout.unsubscribe(self.session.project_id()).await {
            tracing::warn!(error = %err, "Fan-out unsubscribe failed");
        }
        tracing::info!(project_id = %self.session.project_id(), "Coordinator stopped");

        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Join {
                connection,
                profile,
                sink,
                reply,
            } => {
                self.join(connection, profile, sink).await;
                let _ = reply.send(self.session.id());
            }
            Command::Leave { connection } => self.leave(connection).await,
            Command::Client {
                connection,
                message,
            } => self.handle_client(connection, message).await,
            Command::State { reply } => {
                let _ = reply.send(self.session.state());
            }
            Command::Shutdown { .. } => {}
        }
    }

    // ---- delivery ---------------------------------------------------------

    fn reply(&self, connection: ConnectionId, event: ServerEvent) {
        if let Some(sink) = self.sinks.get(&connection) {
            if sink.send(event).is_err() {
                tracing::debug!(%connection, "Connection closed before delivery");
            }
        }
    }

    fn deliver(&self, audience: &Audience, event: &ServerEvent) {
        let connections: Vec<ConnectionId> = match audience {
            Audience::Session => self.sinks.keys().copied().collect(),
            Audience::Users(users) => users
                .iter()
                .flat_map(|user| self.session.connections_of(user))
                .collect(),
        };
        for connection in connections {
            self.reply(connection, event.clone());
        }
    }

    /// Deliver locally and publish to the other processes.
    async fn broadcast(&self, audience: Audience, event: ServerEvent) {
        self.deliver(&audience, &event);

        let envelope = Envelope::new(
            self.services.node_id,
            self.session.project_id(),
            audience,
            event,
            self.now(),
        );
        if let Err(err) = self.services.fanout.publish(&envelope).await {
            let err = CollabError::Transport(err.to_string());
            tracing::warn!(
                project_id = %envelope.project_id,
                event = envelope.event.kind(),
                error = %err,
                "Fan-out publish failed"
            );
        }
    }

    // ---- membership -------------------------------------------------------

    async fn join(&mut self, connection: ConnectionId, profile: UserProfile, sink: EventSink) {
        let now = self.now();
        let joined = self.session.join(connection, profile, now);
        self.sinks.insert(connection, sink);

        self.reply(
            connection,
            ServerEvent::SessionJoined {
                session_id: self.session.id(),
                project_id: self.session.project_id().to_string(),
                user: joined.user.clone(),
                users: self.session.users(),
                locks: self.session.locks(),
                history: self.session.history(),
                conflicts: self.session.open_conflicts(),
            },
        );

        if joined.newly_online {
            self.broadcast(Audience::Session, ServerEvent::UserJoined { user: joined.user })
                .await;
        }
    }

    async fn leave(&mut self, connection: ConnectionId) {
        self.sinks.remove(&connection);
        let now = self.now();
        if let Some(departure) = self.session.leave(connection, now) {
            self.announce_departure(departure).await;
        }
    }

    async fn sweep(&mut self) {
        let now = self.now();
        for departure in self.session.sweep(now) {
            self.announce_departure(departure).await;
        }
    }

    async fn announce_departure(&mut self, departure: Departure) {
        // Dropping the sink ends the gateway's write half, which closes the socket.
        for connection in &departure.connections {
            self.sinks.remove(connection);
        }
        for lock in departure.released {
            self.broadcast(
                Audience::Session,
                ServerEvent::LockReleased {
                    lock,
                    reason: ReleaseReason::Disconnected,
                },
            )
            .await;
        }
        if departure.went_offline {
            self.broadcast(
                Audience::Session,
                ServerEvent::UserLeft {
                    user_id: departure.user_id,
                },
            )
            .await;
        }
    }

    // ---- client messages --------------------------------------------------

    async fn handle_client(&mut self, connection: ConnectionId, message: ClientMessage) {
        let Some(user_id) = self.session.member_for(connection).map(|u| u.id.clone()) else {
            tracing::debug!(%connection, kind = message.kind(), "Message from detached connection");
            return;
        };
        let now = self.now();
        self.session.heartbeat(&user_id, now);
        tracing::debug!(%connection, user_id, kind = message.kind(), "Client message");

        let result = match message {
            ClientMessage::Authenticate { .. } => Err(CollabError::InvalidRequest(
                "connection is already authenticated".to_string(),
            )),
            ClientMessage::Heartbeat => Ok(()),
            ClientMessage::CursorMove { position } => {
                match self.session.update_cursor(&user_id, position.clone(), now) {
                    Ok(()) => {
                        self.broadcast(
                            Audience::Session,
                            ServerEvent::CursorMoved { user_id, position },
                        )
                        .await;
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            }
            ClientMessage::SelectionChange { selection } => {
                match self.session.update_selection(&user_id, selection.clone(), now) {
                    Ok(()) => {
                        self.broadcast(
                            Audience::Session,
                            ServerEvent::SelectionChanged { user_id, selection },
                        )
                        .await;
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            }
            ClientMessage::ComponentOperation { operation } => {
                self.submit(connection, &user_id, operation, false, now).await
            }
            ClientMessage::DrawingOperation { operation } => {
                self.submit(connection, &user_id, operation, true, now).await
            }
            ClientMessage::LockRequest { entity, kind } => {
                self.request_lock(connection, &user_id, entity, kind, now)
                    .await
            }
            ClientMessage::LockRelease { entity } => {
                self.release_lock(&user_id, &entity, now).await
            }
            ClientMessage::CommentAdd {
                entity,
                text,
                position,
            } => self.comment(&user_id, entity, text, position, now).await,
            ClientMessage::ConflictResolve {
                conflict_id,
                resolution,
                final_state,
            } => match self
                .session
                .plan_resolution(conflict_id, resolution, &user_id, final_state)
            {
                Ok(plan) => {
                    self.resolve(plan, Some(connection)).await;
                    Ok(())
                }
                Err(err) => Err(err),
            },
        };

        if let Err(err) = result {
            tracing::debug!(%connection, code = err.code(), error = %err, "Request rejected");
            self.reply(connection, ServerEvent::error(&err, None));
        }
    }

    async fn submit(
        &mut self,
        connection: ConnectionId,
        user_id: &str,
        request: OperationRequest,
        drawing_channel: bool,
        now: u64,
    ) -> Result<(), CollabError> {
        let is_drawing = request.target.entity_type == EntityType::Drawing;
        if is_drawing != drawing_channel {
            return Err(CollabError::InvalidRequest(format!(
                "{} cannot be changed through a {} operation",
                request.target,
                if drawing_channel { "drawing" } else { "component" }
            )));
        }

        match self.session.submit(user_id, request, now)? {
            Submission::Blocked { error, conflict } => {
                let operation_id = conflict.operations.first().map(|op| op.id);
                self.reply(connection, ServerEvent::error(&error, operation_id));
                self.announce_conflict(conflict).await;
            }
            Submission::Accepted {
                operation,
                conflicts,
            } => {
                self.apply(connection, operation).await;
                for (conflict, _) in conflicts {
                    self.announce_conflict(conflict).await;
                }
            }
        }
        Ok(())
    }

    async fn apply(&mut self, connection: ConnectionId, mut operation: Operation) {
        let project_id = self.session.project_id().to_string();
        match self
            .services
            .store
            .apply_operation(&project_id, &operation)
            .await
        {
            Ok(()) => {
                self.session.mark_applied(operation.id, &operation.target);
                operation.applied = true;
                let (operation_id, sequence) = (operation.id, operation.sequence);
                self.broadcast(Audience::Session, ServerEvent::operation(operation))
                    .await;
                self.reply(
                    connection,
                    ServerEvent::OperationAcknowledged {
                        operation_id,
                        sequence,
                    },
                );
            }
            Err(err) => {
                let err = CollabError::from(err);
                tracing::warn!(
                    project_id,
                    operation_id = %operation.id,
                    entity = %operation.target,
                    error = %err,
                    "Document store did not apply operation"
                );
                self.reply(connection, ServerEvent::error(&err, Some(operation.id)));
            }
        }
    }

    async fn announce_conflict(&self, conflict: Conflict) {
        let audience = Audience::Users(conflict.users.iter().cloned().collect());
        self.broadcast(audience, ServerEvent::ConflictDetected { conflict })
            .await;
    }

    async fn request_lock(
        &mut self,
        connection: ConnectionId,
        user_id: &str,
        entity: EntityKey,
        kind: LockKind,
        now: u64,
    ) -> Result<(), CollabError> {
        match self.session.request_lock(user_id, &entity, kind, now)? {
            LockDecision::Granted { lock, renewed } => {
                tracing::info!(
                    entity = %lock.entity,
                    lock_id = %lock.id,
                    holder = %lock.holder,
                    renewed,
                    "Lock granted"
                );
                self.broadcast(Audience::Session, ServerEvent::LockAcquired { lock, renewed })
                    .await;
            }
            LockDecision::Denied(denial) => {
                self.reply(
                    connection,
                    ServerEvent::LockDenied {
                        entity: denial.entity,
                        reason: denial.reason,
                        holder: denial.holder,
                    },
                );
            }
        }
        Ok(())
    }

    async fn release_lock(
        &mut self,
        user_id: &str,
        entity: &EntityKey,
        now: u64,
    ) -> Result<(), CollabError> {
        let lock = self.session.release_lock(user_id, entity, now).ok_or_else(|| {
            CollabError::InvalidRequest(format!("{user_id} holds no lock on {entity}"))
        })?;
        tracing::info!(entity = %lock.entity, lock_id = %lock.id, "Lock released");
        self.broadcast(
            Audience::Session,
            ServerEvent::LockReleased {
                lock,
                reason: ReleaseReason::Explicit,
            },
        )
        .await;
        Ok(())
    }

    async fn comment(
        &mut self,
        user_id: &str,
        entity: EntityKey,
        text: String,
        position: Option<CursorPosition>,
        now: u64,
    ) -> Result<(), CollabError> {
        self.session.authorize(user_id, Permission::Comment)?;
        if text.trim().is_empty() {
            return Err(CollabError::InvalidRequest("comment text is empty".to_string()));
        }

        let comment = Comment {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            entity,
            text,
            position,
            created_at_ms: now,
        };
        self.broadcast(Audience::Session, ServerEvent::CommentAdded { comment })
            .await;
        Ok(())
    }

    // ---- conflicts --------------------------------------------------------

    /// Carry out a resolution plan. `origin` is the deciding connection, if a
    /// user decided.
    async fn resolve(&mut self, mut plan: ResolutionPlan, origin: Option<ConnectionId>) {
        let project_id = self.session.project_id().to_string();

        if plan.needs_merge() {
            let operations = self.session.conflict_operations(plan.conflict_id);
            let merged = match self
                .services
                .store
                .merge_operations(&project_id, &operations)
                .await
            {
                Ok(MergeOutcome::Merged(state)) => Some(state),
                Ok(MergeOutcome::Unsupported) => {
                    tracing::info!(conflict_id = %plan.conflict_id, "Merge unsupported, accepting theirs");
                    None
                }
                Err(err) => {
                    tracing::warn!(conflict_id = %plan.conflict_id, error = %err, "Merge failed, accepting theirs");
                    None
                }
            };
            match merged {
                Some(state) => plan.final_state = Some(state),
                None => match self.session.degrade_merge(&plan) {
                    Some(fallback) => plan = fallback,
                    None => return,
                },
            }
        }

        let now = self.now();
        if let Some(state) = plan.final_state.clone() {
            let operation = Operation::accept(
                OperationRequest {
                    op_type: OperationType::Update,
                    target: plan.entity.clone(),
                    payload: state,
                    base_version: None,
                },
                self.session.id(),
                &plan.resolver,
                now,
            );
            if let Err(err) = self
                .services
                .store
                .apply_operation(&project_id, &operation)
                .await
            {
                let err = CollabError::from(err);
                tracing::warn!(
                    conflict_id = %plan.conflict_id,
                    error = %err,
                    "Document store did not apply resolution"
                );
                if plan.automatic {
                    self.session.postpone_conflict(plan.conflict_id, now);
                } else if let Some(connection) = origin {
                    self.reply(connection, ServerEvent::error(&err, None));
                }
                return;
            }
            self.session.bump_version(&plan.entity);
        }

        let entity = plan.entity.clone();
        let Some(conflict) = self.session.complete_resolution(plan, now) else {
            return;
        };
        let Some(resolution) = conflict.resolution else {
            return;
        };
        self.broadcast(
            Audience::Session,
            ServerEvent::ConflictResolved {
                conflict_id: conflict.id,
                entity,
                resolution,
            },
        )
        .await;
    }

    // ---- timers -----------------------------------------------------------

    async fn fire_timers(&mut self) {
        let now = self.now();
        for expiry in self.session.fire_due(now) {
            match expiry {
                Expiry::Lock { lock, replica } => {
                    let event = ServerEvent::LockReleased {
                        lock,
                        reason: ReleaseReason::Expired,
                    };
                    if replica {
                        self.deliver(&Audience::Session, &event);
                    } else {
                        self.broadcast(Audience::Session, event).await;
                    }
                }
                Expiry::Conflict(plan) => self.resolve(plan, None).await,
            }
        }
    }

    async fn autosave(&mut self) {
        let project_id = self.session.project_id().to_string();

        if self.session.has_unflushed() {
            let state = self.session.state();
            let sequence = self.session.last_sequence();
            match self.services.persistence.persist_session_state(&state).await {
                Ok(()) => {
                    self.session.mark_flushed(sequence);
                    tracing::debug!(project_id, sequence, "Session state persisted");
                }
                Err(err) => {
                    let err = CollabError::from(err);
                    tracing::warn!(project_id, error = %err, "Auto-save failed, retrying next interval");
                }
            }
        }

        if self.session.revision() > self.saved_revision {
            let snapshot = self.session.project_snapshot();
            match self.services.store.save_project(&snapshot).await {
                Ok(()) => self.saved_revision = snapshot.revision,
                Err(err) => {
                    tracing::warn!(project_id, error = %err, "Project checkpoint failed");
                }
            }
        }
    }

    // ---- replication ------------------------------------------------------

    /// Mirror an event published by another process and pass it on to the
    /// local connections it concerns.
    fn apply_remote(&mut self, envelope: Envelope) {
        let Envelope {
            origin,
            project_id,
            audience,
            event,
            ..
        } = envelope;
        if origin == self.services.node_id || project_id != self.session.project_id() {
            return;
        }
        let now = self.now();
        tracing::debug!(%origin, event = event.kind(), "Remote event");

        let event = match event {
            ServerEvent::UserJoined { user } => {
                self.session.apply_remote_join(user.clone());
                Some(ServerEvent::UserJoined { user })
            }
            ServerEvent::UserLeft { user_id } => self
                .session
                .apply_remote_leave(&user_id)
                .then_some(ServerEvent::UserLeft { user_id }),
            ServerEvent::CursorMoved { user_id, position } => {
                self.session
                    .apply_remote_cursor(&user_id, position.clone(), now);
                Some(ServerEvent::CursorMoved { user_id, position })
            }
            ServerEvent::SelectionChanged { user_id, selection } => {
                self.session
                    .apply_remote_selection(&user_id, selection.clone(), now);
                Some(ServerEvent::SelectionChanged { user_id, selection })
            }
            ServerEvent::ComponentOperation { operation }
            | ServerEvent::DrawingOperation { operation } => {
                let operation = self.session.apply_remote_operation(operation);
                Some(ServerEvent::operation(operation))
            }
            ServerEvent::LockAcquired { lock, renewed } => {
                self.session.apply_remote_lock(lock.clone());
                Some(ServerEvent::LockAcquired { lock, renewed })
            }
            ServerEvent::LockReleased { lock, reason } => self
                .session
                .apply_remote_release(&lock)
                .then_some(ServerEvent::LockReleased { lock, reason }),
            ServerEvent::ConflictDetected { conflict } => {
                self.session.apply_remote_conflict(conflict.clone());
                Some(ServerEvent::ConflictDetected { conflict })
            }
            ServerEvent::ConflictResolved {
                conflict_id,
                entity,
                resolution,
            } => {
                self.session.apply_remote_resolution(conflict_id);
                Some(ServerEvent::ConflictResolved {
                    conflict_id,
                    entity,
                    resolution,
                })
            }
            event @ ServerEvent::CommentAdded { .. } => Some(event),
            direct => {
                tracing::debug!(event = direct.kind(), "Ignoring direct event from fan-out");
                None
            }
        };

        if let Some(event) = event {
            self.deliver(&audience, &event);
        }
    }
}

async fn next_remote(remote: &mut Option<mpsc::UnboundedReceiver<Envelope>>) -> Option<Envelope> {
    match remote {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn sleep_until(deadline_ms: Option<u64>, now_ms: u64) {
    match deadline_ms {
        Some(deadline) => {
            tokio::time::sleep(Duration::from_millis(deadline.saturating_sub(now_ms))).await;
        }
        None => pending().await,
    }
}
