//! Per-user clearing workflow.
//!
//! `/start` creates a session, `/clear` arms it, a forwarded channel message
//! supplies the boundary, and after authorization a deletion run is spawned in
//! the background. `/stop` cancels. All transitions for one user happen under
//! that user's store lock; the run itself only takes the lock again for cleanup.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::{
    audit::{AuditEvent, AuditLogger},
    auth::{AuthDecision, AuthorizationGate},
    channel::ChannelService,
    domain::{ChatId, MessageId, UserId},
    engine::{DeletionEngine, EngineConfig, ProgressSink, RunOutcome, RunProgress, RunResult},
    messaging::{
        port::Messenger,
        types::{Command, CommandKind, ForwardOrigin, IncomingEvent, MessageEvent},
    },
    session_store::{RunBinding, Session, SessionState, SessionStore},
};

pub const WELCOME: &str = "Welcome! I can help you clear messages in your channels.\n\n\
To start clearing messages:\n\
1. Use /clear to begin\n\
2. Forward a message from the channel where you want to clear messages\n\
3. I will delete all messages before the forwarded message\n\n\
Use /stop to cancel the clearing process at any time.";
pub const ALREADY_ACTIVE: &str = "You already have an active session. Use /stop to end it first.";
pub const START_FIRST: &str = "Please use /start first to initialize a session.";
pub const ALREADY_CLEARING: &str =
    "A clearing session is already in progress. Use /stop to cancel it first.";
pub const FORWARD_PROMPT: &str = "Please forward a message from the channel where you want to clear messages. I will delete all messages before that point.";
pub const NO_SESSION: &str = "No active session found. Use /start to begin.";
pub const NOTHING_TO_STOP: &str = "No clearing session is in progress.";
pub const STOPPED: &str = "Clearing process stopped.";
pub const NOT_A_FORWARD: &str =
    "Please forward a message from the channel where you want to clear messages.";
pub const NOT_A_CHANNEL: &str =
    "Please forward a message from a channel, not a private chat or group.";
pub const RUN_IN_PROGRESS: &str =
    "Messages are already being cleared. Use /stop to cancel the current run.";
pub const STILL_STOPPING: &str =
    "The previous clearing run is still stopping. Forward the message again in a moment.";
pub const DENIED: &str =
    "You must be an administrator or owner in the channel to clear messages.";
pub const AUTH_FAILED: &str = "Could not verify your permissions in that channel. Make sure I am an administrator there with permission to delete messages.";
pub const STARTING: &str = "Starting to clear messages...";
pub const CRASHED: &str = "An error occurred while clearing messages. Please try again.";

pub fn progress_text(p: RunProgress) -> String {
    format!(
        "Progress: deleted {} messages, skipped {} messages...",
        p.deleted, p.skipped
    )
}

pub fn summary_text(r: &RunResult) -> String {
    match r.outcome {
        RunOutcome::Completed => format!(
            "Finished: successfully deleted {} messages, skipped {} messages.",
            r.deleted, r.skipped
        ),
        RunOutcome::Cancelled => format!(
            "Stopped: deleted {} messages, skipped {} messages before cancelling.",
            r.deleted, r.skipped
        ),
        RunOutcome::AbortedTooManyFailures => format!(
            "Stopping: too many consecutive messages could not be deleted. \
This might be because the messages are too old or I lack permission.\n\
Deleted {} messages, skipped {} messages.",
            r.deleted, r.skipped
        ),
    }
}

/// Everything a spawned run needs to report back and clean up.
#[derive(Clone, Debug)]
struct RunContext {
    run_id: u64,
    user_id: UserId,
    chat_id: ChatId,
    channel_id: ChatId,
    boundary: MessageId,
    cancel: CancellationToken,
}

/// Sends progress updates to the user's chat.
struct ReplyProgress {
    messenger: Arc<dyn Messenger>,
    chat_id: ChatId,
}

#[async_trait]
impl ProgressSink for ReplyProgress {
    async fn on_progress(&self, progress: RunProgress) {
        reply(&*self.messenger, self.chat_id, &progress_text(progress)).await;
    }
}

pub struct SessionOrchestrator {
    store: Arc<SessionStore>,
    gate: AuthorizationGate,
    engine: DeletionEngine,
    messenger: Arc<dyn Messenger>,
    audit: Option<Arc<AuditLogger>>,
    next_run_id: AtomicU64,
    runs: TaskTracker,
}

impl SessionOrchestrator {
    pub fn new(
        store: Arc<SessionStore>,
        channels: Arc<dyn ChannelService>,
        messenger: Arc<dyn Messenger>,
        engine: EngineConfig,
    ) -> Self {
        Self {
            store,
            gate: AuthorizationGate::new(channels.clone()),
            engine: DeletionEngine::new(channels, engine),
            messenger,
            audit: None,
            next_run_id: AtomicU64::new(1),
            runs: TaskTracker::new(),
        }
    }

    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub async fn handle(&self, event: IncomingEvent) {
        match event {
            IncomingEvent::Command(Command {
                chat_id,
                user_id,
                kind,
            }) => match kind {
                CommandKind::Start => self.start(user_id, chat_id).await,
                CommandKind::Clear => self.clear(user_id, chat_id).await,
                CommandKind::Stop => self.stop(user_id, chat_id).await,
            },
            IncomingEvent::Message(msg) => self.on_message(msg).await,
        }
    }

    pub async fn start(&self, user_id: UserId, chat_id: ChatId) {
        let _guard = self.store.lock_user(user_id).await;
        if self.store.get(user_id).await.is_some() {
            self.reply(chat_id, ALREADY_ACTIVE).await;
            return;
        }
        self.store.set(Session::new(user_id, chat_id)).await;
        info!(user_id = user_id.0, "session created");
        self.reply(chat_id, WELCOME).await;
    }

    pub async fn clear(&self, user_id: UserId, chat_id: ChatId) {
        let _guard = self.store.lock_user(user_id).await;
        let Some(mut session) = self.store.get(user_id).await else {
            self.reply(chat_id, START_FIRST).await;
            return;
        };
        if session.state != SessionState::Idle {
            self.reply(chat_id, ALREADY_CLEARING).await;
            return;
        }

        session.state = SessionState::AwaitingBoundary;
        session.chat_id = chat_id;
        session.touch();
        self.store.set(session).await;
        debug!(user_id = user_id.0, "awaiting boundary message");
        self.reply(chat_id, FORWARD_PROMPT).await;
    }

    pub async fn stop(&self, user_id: UserId, chat_id: ChatId) {
        let _guard = self.store.lock_user(user_id).await;
        let Some(mut session) = self.store.get(user_id).await else {
            self.reply(chat_id, NO_SESSION).await;
            return;
        };
        if session.state == SessionState::Idle {
            self.reply(chat_id, NOTHING_TO_STOP).await;
            return;
        }

        let was_clearing = session.state == SessionState::Clearing;
        session.reset();
        session.touch();
        self.store.set(session).await;
        info!(user_id = user_id.0, was_clearing, "clearing stopped by user");
        self.reply(chat_id, STOPPED).await;
    }

    pub async fn on_message(&self, msg: MessageEvent) {
        let user_id = msg.user_id;
        let chat_id = msg.chat_id;
        let _guard = self.store.lock_user(user_id).await;

        let Some(mut session) = self.store.get(user_id).await else {
            return;
        };
        match session.state {
            SessionState::Idle => return,
            SessionState::Clearing => {
                self.reply(chat_id, RUN_IN_PROGRESS).await;
                return;
            }
            SessionState::AwaitingBoundary => {}
        }

        session.touch();
        self.store.set(session.clone()).await;

        let (channel_id, boundary) = match msg.forward {
            None => {
                self.reply(chat_id, NOT_A_FORWARD).await;
                return;
            }
            Some(ForwardOrigin::NotChannel) => {
                self.reply(chat_id, NOT_A_CHANNEL).await;
                return;
            }
            Some(ForwardOrigin::Channel {
                channel_id,
                message_id,
            }) => (channel_id, message_id),
        };

        if session.run.is_some() {
            self.reply(chat_id, STILL_STOPPING).await;
            return;
        }

        match self.gate.authorize(user_id, channel_id).await {
            Ok(AuthDecision::Authorized) => {
                self.audit(AuditEvent::auth(user_id, channel_id, true));
            }
            Ok(AuthDecision::Denied) => {
                info!(
                    user_id = user_id.0,
                    channel_id = channel_id.0,
                    "not allowed to clear channel"
                );
                self.store.delete(user_id).await;
                self.audit(AuditEvent::auth(user_id, channel_id, false));
                self.reply(chat_id, DENIED).await;
                return;
            }
            Err(e) => {
                warn!(
                    user_id = user_id.0,
                    channel_id = channel_id.0,
                    error = %e,
                    "authorization lookup failed"
                );
                self.store.delete(user_id).await;
                self.audit(AuditEvent::auth_error(user_id, channel_id, &e.to_string()));
                self.reply(chat_id, AUTH_FAILED).await;
                return;
            }
        }

        let ctx = RunContext {
            run_id: self.next_run_id.fetch_add(1, Ordering::SeqCst),
            user_id,
            chat_id,
            channel_id,
            boundary,
            cancel: CancellationToken::new(),
        };
        session.chat_id = chat_id;
        session.begin_clearing(
            channel_id,
            boundary,
            RunBinding {
                run_id: ctx.run_id,
                cancel: ctx.cancel.clone(),
            },
        );
        self.store.set(session).await;

        info!(
            user_id = user_id.0,
            channel_id = channel_id.0,
            boundary = boundary.0,
            run_id = ctx.run_id,
            "clearing started"
        );
        self.audit(AuditEvent::run_started(
            user_id, channel_id, boundary, ctx.run_id,
        ));
        self.reply(chat_id, STARTING).await;
        self.spawn_run(ctx);
    }

    /// Cancel every bound run and wait up to `grace` for them to report
    /// their partial counts and clean up. Returns `false` if some run was
    /// still winding down when the grace period ran out.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let n = self.store.cancel_all_runs().await;
        if n > 0 {
            info!(runs = n, "cancelled active runs for shutdown");
        }
        self.runs.close();
        match tokio::time::timeout(grace, self.runs.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(pending = self.runs.len(), "runs still stopping after grace period");
                false
            }
        }
    }

    /// Periodically drop sessions that sat idle past the configured timeout.
    pub fn spawn_idle_sweeper(
        &self,
        idle_timeout: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let store = self.store.clone();
        let every = (idle_timeout / 4).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        let n = store.purge_expired().await;
                        if n > 0 {
                            debug!(expired = n, "purged idle sessions");
                        }
                    }
                }
            }
        })
    }

    fn spawn_run(&self, ctx: RunContext) {
        let worker = {
            let engine = self.engine.clone();
            let sink = ReplyProgress {
                messenger: self.messenger.clone(),
                chat_id: ctx.chat_id,
            };
            let ctx = ctx.clone();
            tokio::spawn(async move {
                engine
                    .run(ctx.channel_id, ctx.boundary, &ctx.cancel, &sink)
                    .await
            })
        };

        let store = self.store.clone();
        let messenger = self.messenger.clone();
        let audit = self.audit.clone();
        self.runs.spawn(async move {
            let joined = worker.await;
            finish_run(&store, &*messenger, audit.as_deref(), &ctx, joined).await;
        });
    }

    fn audit(&self, event: AuditEvent) {
        if let Some(audit) = &self.audit {
            write_audit(audit, event);
        }
    }

    async fn reply(&self, chat_id: ChatId, text: &str) {
        reply(&*self.messenger, chat_id, text).await;
    }
}

async fn finish_run(
    store: &SessionStore,
    messenger: &dyn Messenger,
    audit: Option<&AuditLogger>,
    ctx: &RunContext,
    joined: Result<RunResult, JoinError>,
) {
    release_run(store, ctx.user_id, ctx.run_id).await;

    let text = match joined {
        Ok(result) => {
            if let Some(audit) = audit {
                write_audit(
                    audit,
                    AuditEvent::run_finished(ctx.user_id, ctx.channel_id, ctx.run_id, &result),
                );
            }
            summary_text(&result)
        }
        Err(e) => {
            error!(
                user_id = ctx.user_id.0,
                channel_id = ctx.channel_id.0,
                run_id = ctx.run_id,
                error = %e,
                "deletion run crashed"
            );
            if let Some(audit) = audit {
                write_audit(
                    audit,
                    AuditEvent::run_crashed(ctx.user_id, ctx.channel_id, ctx.run_id, &e.to_string()),
                );
            }
            CRASHED.to_string()
        }
    };
    reply(messenger, ctx.chat_id, &text).await;
}

/// Detach a finished run from its session.
///
/// The session is removed unless the user already re-armed it with `/clear`,
/// in which case only the binding is dropped. Sessions bound to another run
/// are left alone.
async fn release_run(store: &SessionStore, user_id: UserId, run_id: u64) {
    let _guard = store.lock_user(user_id).await;
    let Some(mut session) = store.get(user_id).await else {
        return;
    };
    if session.run.as_ref().map(|r| r.run_id) != Some(run_id) {
        return;
    }

    if session.state == SessionState::AwaitingBoundary {
        session.run = None;
        session.touch();
        store.set(session).await;
    } else {
        store.delete(user_id).await;
    }
}

async fn reply(messenger: &dyn Messenger, chat_id: ChatId, text: &str) {
    if let Err(e) = messenger.send_text(chat_id, text).await {
        warn!(chat_id = chat_id.0, error = %e, "failed to send reply");
    }
}

fn write_audit(audit: &AuditLogger, event: AuditEvent) {
    if let Err(e) = audit.write(event) {
        warn!(path = %audit.path().display(), error = %e, "audit write failed");
    }
}
