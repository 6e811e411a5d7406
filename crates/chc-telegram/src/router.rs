use std::{sync::Arc, time::Duration};

use anyhow::Context;
use teloxide::{
    dispatching::{Dispatcher, ShutdownToken},
    dptree,
    prelude::*,
    types::BotCommand,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use chc_core::{
    audit::AuditLogger,
    channel::ChannelService,
    config::Config,
    messaging::{
        port::Messenger,
        throttled::{ThrottleConfig, ThrottledMessenger},
    },
    orchestrator::SessionOrchestrator,
    session_store::SessionStore,
};

use crate::{channel::TelegramChannelService, handlers, TelegramMessenger};

/// How long cancelled runs get to post their summaries on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SessionOrchestrator>,
    /// Shared throttled outbound path, also used for replies outside the workflow.
    pub messenger: Arc<dyn Messenger>,
}

pub fn build_bot(cfg: &Config) -> anyhow::Result<Bot> {
    let bot = Bot::new(cfg.telegram_bot_token.clone());
    let Some(api_url) = cfg.telegram_api_url.as_deref() else {
        return Ok(bot);
    };
    let url = reqwest::Url::parse(api_url)
        .with_context(|| format!("invalid TELEGRAM_API_URL: {api_url}"))?;
    Ok(bot.set_api_url(url))
}

pub async fn run_polling(cfg: Arc<Config>) -> anyhow::Result<()> {
    let bot = build_bot(&cfg)?;

    // Fail fast on a bad token or unreachable API server.
    let me = bot
        .get_me()
        .await
        .context("failed to connect to Telegram (check TELEGRAM_BOT_TOKEN)")?;
    info!(username = %me.username(), "bot connected");

    let commands = vec![
        BotCommand::new("start", "Initialize a session"),
        BotCommand::new("clear", "Clear messages before a forwarded channel message"),
        BotCommand::new("stop", "Cancel the clearing process"),
    ];
    if let Err(e) = bot.set_my_commands(commands).await {
        warn!(error = %e, "failed to register bot commands");
    }

    // Every reply, including progress from concurrent runs, shares the throttle.
    let raw_messenger: Arc<dyn Messenger> = Arc::new(TelegramMessenger::new(bot.clone()));
    let messenger: Arc<dyn Messenger> = Arc::new(ThrottledMessenger::new(
        raw_messenger,
        ThrottleConfig::default(),
    ));
    let channels: Arc<dyn ChannelService> = Arc::new(TelegramChannelService::new(bot.clone()));

    let orchestrator = Arc::new(
        SessionOrchestrator::new(
            Arc::new(SessionStore::new(cfg.session_idle_timeout)),
            channels,
            messenger.clone(),
            cfg.engine(),
        )
        .with_audit(Arc::new(AuditLogger::new(
            cfg.audit_log_path.clone(),
            cfg.audit_log_json,
        ))),
    );

    let shutdown = CancellationToken::new();
    let sweeper = cfg
        .session_idle_timeout
        .map(|idle| orchestrator.spawn_idle_sweeper(idle, shutdown.clone()));

    let state = Arc::new(AppState {
        orchestrator: orchestrator.clone(),
        messenger,
    });

    let handler =
        dptree::entry().branch(Update::filter_message().endpoint(handlers::handle_message));

    let mut dispatcher = Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build();
    spawn_sigterm_listener(dispatcher.shutdown_token());

    info!(
        delete_delay_ms = cfg.delete_delay.as_millis() as u64,
        max_consecutive_failures = cfg.max_consecutive_failures,
        "polling for updates"
    );
    dispatcher.dispatch().await;

    shutdown.cancel();
    if let Some(sweeper) = sweeper {
        let _ = sweeper.await;
    }
    if !orchestrator.shutdown(SHUTDOWN_GRACE).await {
        warn!("exiting before every run reported back");
    }
    info!("bot stopped");
    Ok(())
}

#[cfg(unix)]
fn spawn_sigterm_listener(token: ShutdownToken) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                return;
            }
        };
        term.recv().await;
        info!("SIGTERM received, shutting down");
        if let Ok(done) = token.shutdown() {
            done.await;
        }
    });
}

#[cfg(not(unix))]
fn spawn_sigterm_listener(_token: ShutdownToken) {}
