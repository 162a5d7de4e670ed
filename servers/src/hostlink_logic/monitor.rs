use crate::hostlink_logic::state::AppState;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::sleep;

/// Watches connection state and, when `reconnectAttempts` is non-zero, makes
/// that many reconnect attempts after each loss, spaced by the fixed delay.
pub async fn run(app_state: AppState, mut shutdown: broadcast::Receiver<()>) {
    let mut state_rx = app_state.manager.subscribe_state();
    let attempts = app_state.config.connection.reconnect_attempts;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => {
                log::info!("Monitor service received shutdown signal.");
                break;
            }
            changed = state_rx.recv() => match changed {
                Ok(true) => log::debug!("Connection is up"),
                Ok(false) if attempts == 0 => {
                    log::warn!("Connection to host lost; reconnect is disabled");
                }
                Ok(false) => {
                    if !recover(&app_state, attempts, &mut shutdown).await {
                        log::error!("Giving up on the host after {} reconnect attempt(s)", attempts);
                    }
                }
                Err(RecvError::Lagged(skipped)) => log::debug!("Monitor skipped {} state change(s)", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    }
}

// Returns true once a reconnect succeeds; false when attempts run out or
// shutdown arrives.
async fn recover(app_state: &AppState, attempts: u32, shutdown: &mut broadcast::Receiver<()>) -> bool {
    let delay = app_state.config.reconnect_delay();
    for attempt in 1..=attempts {
        tokio::select! {
            biased;
            _ = shutdown.recv() => return false,
            _ = sleep(delay) => {}
        }
        log::info!("Reconnect attempt {}/{}", attempt, attempts);
        match app_state.reconnect().await {
            Ok(()) => {
                app_state.prepare_session().await;
                return true;
            }
            Err(e) => log::warn!("Reconnect attempt {}/{} failed: {}", attempt, attempts, e),
        }
    }
    false
}
