use anyhow::{Context, Result, bail};
use clap::Parser;
use lib_hostlink::collaborators::{Scene, ScriptTextSender, TextSender};
use lib_hostlink::moderation::{ModerationAction, ModerationExecutor, ModerationTarget, ScriptStateProbe};
use std::sync::Arc;
use tokio::signal;

mod hostlink_logic;
use hostlink_logic::config::{Cli, Command, Settings};
use hostlink_logic::{config, logger, monitor, state};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let settings = config::load_settings(cli.config)?;
    logger::setup_logging(&settings.log_dir, &settings.log_level)?;
    match &settings.source {
        Some(path) => log::info!("Configuration loaded from {}", path.display()),
        None => log::info!("No config file found. Using defaults and environment/CLI variables."),
    }

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(settings).await,
        Command::Moderate { channel, member, action } => {
            let target = match member {
                Some(member) => ModerationTarget::member(channel, member),
                None => ModerationTarget::channel(channel),
            };
            moderate(settings, target, action.into()).await
        }
        Command::Say { to, text, p2p } => {
            let scene = if p2p { Scene::P2p } else { Scene::Team };
            say(settings, scene, &to, &text).await
        }
    }
}

async fn run(settings: Settings) -> Result<()> {
    let app_state = state::AppState::new(settings.hostlink);
    app_state.connect().await.context("initial connection to the host failed")?;
    app_state.prepare_session().await;
    app_state.start_pollers()?;

    let printer = app_state.pipeline.subscribe_handler("log", |message| {
        log::info!(
            "[{}] {} {:?}: {}",
            message.channel,
            message.sender_name,
            message.direction,
            message.body
        );
    });

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let monitor_handle = tokio::spawn(monitor::run(app_state.clone(), shutdown_tx.subscribe()));

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = wait_for_terminate() => {
            log::info!("SIGTERM received, initiating shutdown.");
        }
    }

    // Send shutdown signal to all components
    let _ = shutdown_tx.send(());
    let _ = monitor_handle.await;

    app_state.shutdown();
    printer.abort();

    let stats = app_state.pipeline.stats();
    log::info!(
        "Shutdown complete. published={} duplicates={} dropped={} demoted={}",
        stats.published,
        stats.duplicates,
        stats.dropped,
        stats.demoted
    );
    Ok(())
}

async fn wait_for_terminate() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term_signal) => {
                term_signal.recv().await;
            }
            Err(e) => {
                log::warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        // On non-unix platforms, just wait forever.
        std::future::pending::<()>().await;
    }
}

async fn moderate(settings: Settings, target: ModerationTarget, action: ModerationAction) -> Result<()> {
    let app_state = state::AppState::new(settings.hostlink);
    app_state.connect().await.context("connection to the host failed")?;

    let channel = Arc::clone(app_state.correlator());
    let probe = ScriptStateProbe::new(Arc::clone(&channel));
    let executor = ModerationExecutor::new(channel, probe, app_state.config.moderation_config());

    log::info!("Applying {} to {}", action, target);
    let outcome = executor.execute(target, action).await;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    app_state.shutdown();

    if !outcome.success {
        bail!("moderation failed: {}", outcome.message);
    }
    Ok(())
}

async fn say(settings: Settings, scene: Scene, to: &str, text: &str) -> Result<()> {
    let app_state = state::AppState::new(settings.hostlink);
    app_state.connect().await.context("connection to the host failed")?;

    let sender = ScriptTextSender::new(Arc::clone(app_state.correlator()));
    let result = sender.send_text(scene, to, text).await;
    app_state.shutdown();

    result.with_context(|| format!("sending to {} failed", to))?;
    log::info!("Sent {} char(s) to {}", text.chars().count(), to);
    Ok(())
}
