//! # Moderation Executor
//!
//! Carries out one moderation action against the host's rate-limited team API.
//!
//! ## Flow
//! 1. Read the current state; if it already matches the desired end state,
//!    report a confirmed success without issuing anything.
//! 2. Walk the candidate operations in order. Each one gets the full backoff
//!    schedule: a rate-limited reply waits out the next delay and resends the
//!    same end state. Moving to the next candidate happens only when the host
//!    says the operation does not exist. Running out of schedule, or any other
//!    error, ends the call as failed.
//! 3. After success, poll the state a few times. If the desired state never
//!    shows up, the outcome is still a success but flagged `unconfirmed`.

use std::sync::Arc;
use std::time::Duration;

use crate::core::correlator::{CommandChannel, CommandMode};
use crate::error::BridgeError;
use crate::moderation::backoff::BackoffSchedule;
use crate::moderation::probe::StateProbe;
use crate::moderation::request::{
    HostOperation, MemberState, ModerationAction, ModerationOutcome, ModerationRequest, ModerationTarget,
};

/// Executor settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModerationConfig {
    /// Waits between rate-limited attempts; its length is the attempt budget.
    pub schedule: BackoffSchedule,
    /// State reads after a successful operation.
    pub confirm_attempts: u32,
    /// Wait before each confirmation read.
    pub confirm_delay: Duration,
    /// Read the state before issuing and skip work already done.
    pub precheck: bool,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            schedule: BackoffSchedule::default(),
            confirm_attempts: 3,
            confirm_delay: Duration::from_millis(300),
            precheck: true,
        }
    }
}

/// # Moderation Executor
pub struct ModerationExecutor<C, P> {
    channel: Arc<C>,
    probe: P,
    config: ModerationConfig,
}

impl<C: CommandChannel, P: StateProbe> ModerationExecutor<C, P> {
    /// Creates an executor issuing operations through `channel` and reading
    /// state through `probe`.
    pub fn new(channel: Arc<C>, probe: P, config: ModerationConfig) -> Self {
        Self { channel, probe, config }
    }

    /// Settings in use.
    pub fn config(&self) -> &ModerationConfig {
        &self.config
    }

    /// # Execute
    ///
    /// Applies `action` to `target`. Never returns an error; failures are
    /// reported in the outcome.
    pub async fn execute(&self, target: ModerationTarget, action: ModerationAction) -> ModerationOutcome {
        let mut request = ModerationRequest::new(target, action);

        let candidates = match HostOperation::candidates(&request.target, action) {
            Ok(candidates) => candidates,
            Err(e) => return failed(&request, e.to_string()),
        };

        if self.config.precheck {
            match self.probe.read_state(&request.target).await {
                Ok(state) if state == request.desired_state => {
                    log::info!("{} {}: already in place", action, request.target);
                    return ModerationOutcome {
                        success: true,
                        final_state: Some(state),
                        unconfirmed: false,
                        attempts: 0,
                        message: "already applied".to_string(),
                    };
                }
                Ok(_) => {}
                Err(e) => log::debug!("Precheck for {} failed, issuing anyway: {}", request.target, e),
            }
        }

        for operation in candidates {
            match self.run_schedule(operation, &mut request).await {
                Ok(()) => return self.confirm(&request, operation).await,
                Err(BridgeError::Unavailable(reason)) => {
                    log::warn!("{} unavailable on host ({}); trying next operation", operation, reason);
                    request.last_error = Some(BridgeError::Unavailable(reason));
                }
                Err(e) => {
                    log::error!("{} {} failed after {} attempt(s): {}", action, request.target, request.attempts, e);
                    let message = e.to_string();
                    request.last_error = Some(e);
                    return failed(&request, message);
                }
            }
        }

        let message = request
            .last_error
            .as_ref()
            .map_or_else(|| "no operation available".to_string(), ToString::to_string);
        failed(&request, message)
    }

    /// Issues `operation` until it succeeds, hits a non-rate-limit error, or
    /// the schedule runs out.
    async fn run_schedule(&self, operation: HostOperation, request: &mut ModerationRequest) -> Result<(), BridgeError> {
        let script = operation.script(&request.target, request.action);
        let mut last = None;
        for (attempt, delay) in self.config.schedule.iter().enumerate() {
            if !delay.is_zero() {
                log::info!("Rate limited; waiting {:?} before attempt {}", delay, attempt + 1);
                tokio::time::sleep(delay).await;
            }
            request.attempts += 1;
            let result = match self.channel.evaluate(&script, CommandMode::AwaitAsync).await {
                Ok(value) => operation.interpret(&value),
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    log::info!(
                        "{} {} accepted via {} (attempt {})",
                        request.action,
                        request.target,
                        operation,
                        attempt + 1
                    );
                    return Ok(());
                }
                Err(e) if e.is_rate_limited() => {
                    log::warn!("{} rate limited: {}", operation, e);
                    request.last_error = Some(e.clone());
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or_else(|| BridgeError::InvalidRequest("empty backoff schedule".to_string())))
    }

    async fn confirm(&self, request: &ModerationRequest, operation: HostOperation) -> ModerationOutcome {
        let mut observed: Option<MemberState> = None;
        for _ in 0..self.config.confirm_attempts {
            tokio::time::sleep(self.config.confirm_delay).await;
            match self.probe.read_state(&request.target).await {
                Ok(state) => {
                    observed = Some(state);
                    if state == request.desired_state {
                        return ModerationOutcome {
                            success: true,
                            final_state: Some(state),
                            unconfirmed: false,
                            attempts: request.attempts,
                            message: format!("{} via {}", request.action, operation),
                        };
                    }
                }
                Err(e) => log::debug!("Confirmation read for {} failed: {}", request.target, e),
            }
        }
        log::warn!(
            "{} {} reported success but state never read back as {:?}",
            request.action,
            request.target,
            request.desired_state
        );
        ModerationOutcome {
            success: true,
            final_state: observed,
            unconfirmed: true,
            attempts: request.attempts,
            message: format!("{} via {} (unconfirmed)", request.action, operation),
        }
    }
}

fn failed(request: &ModerationRequest, message: String) -> ModerationOutcome {
    ModerationOutcome {
        success: false,
        final_state: None,
        unconfirmed: false,
        attempts: request.attempts,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeResult;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::future::Future;
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Replies to each operation with the next scripted result.
    struct ScriptedHost {
        replies: Mutex<VecDeque<Value>>,
        issued: Mutex<Vec<String>>,
    }

    impl ScriptedHost {
        fn new(replies: Vec<Value>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                issued: Mutex::new(Vec::new()),
            })
        }

        fn issued(&self) -> Vec<String> {
            self.issued.lock().unwrap().clone()
        }
    }

    impl CommandChannel for ScriptedHost {
        fn call(&self, _method: &str, params: Value, _mode: CommandMode) -> impl Future<Output = BridgeResult<Value>> + Send {
            let expression = params["expression"].as_str().unwrap_or_default().to_string();
            let function = ["muteTeamAll", "updateTeam", "updateMuteStateInTeam", "removeTeamMembers"]
                .into_iter()
                .find(|f| expression.contains(&format!("window.nim.{f}(")))
                .unwrap_or("?");
            self.issued.lock().unwrap().push(function.to_string());
            let reply = self.replies.lock().unwrap().pop_front().unwrap_or(json!({"success": true}));
            let value = json!({"result": {"type": "string", "value": reply.to_string()}});
            async move { Ok(value) }
        }
    }

    /// Returns the scripted states in order, then repeats the last one.
    struct ScriptedState {
        states: Mutex<VecDeque<MemberState>>,
        reads: Mutex<u32>,
    }

    impl ScriptedState {
        fn new(states: Vec<MemberState>) -> Self {
            Self {
                states: Mutex::new(states.into()),
                reads: Mutex::new(0),
            }
        }
    }

    impl StateProbe for ScriptedState {
        fn read_state(&self, _target: &ModerationTarget) -> impl Future<Output = BridgeResult<MemberState>> + Send {
            *self.reads.lock().unwrap() += 1;
            let mut states = self.states.lock().unwrap();
            let state = if states.len() > 1 { states.pop_front() } else { states.front().copied() };
            async move { state.ok_or_else(|| BridgeError::Decode("no state".to_string())) }
        }
    }

    fn rate_limited() -> Value {
        json!({"success": false, "error": "操作频率过快", "code": 416})
    }

    fn no_confirm_delay() -> ModerationConfig {
        ModerationConfig {
            confirm_delay: Duration::ZERO,
            ..ModerationConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_rate_limits_then_succeeds() {
        let host = ScriptedHost::new(vec![rate_limited(), rate_limited(), json!({"success": true})]);
        let probe = ScriptedState::new(vec![MemberState::Unmuted, MemberState::Muted]);
        let executor = ModerationExecutor::new(Arc::clone(&host), probe, no_confirm_delay());

        let start = Instant::now();
        let outcome = executor.execute(ModerationTarget::member("t1", "u1"), ModerationAction::Mute).await;

        assert!(outcome.success);
        assert!(!outcome.unconfirmed);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.final_state, Some(MemberState::Muted));
        // Two rate limits: waited 1 s and 3 s.
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausting_the_schedule_fails_after_its_length() {
        let host = ScriptedHost::new((0..8).map(|_| rate_limited()).collect());
        let probe = ScriptedState::new(vec![MemberState::Unmuted]);
        let executor = ModerationExecutor::new(Arc::clone(&host), probe, no_confirm_delay());

        let start = Instant::now();
        let outcome = executor.execute(ModerationTarget::channel("t1"), ModerationAction::Mute).await;

        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 5);
        assert_eq!(start.elapsed(), Duration::from_secs(20));
        // Rate-limit exhaustion never falls through to the next operation.
        assert!(host.issued().iter().all(|f| f == "muteTeamAll"));
    }

    #[tokio::test(start_paused = true)]
    async fn success_without_observed_state_is_unconfirmed() {
        let host = ScriptedHost::new(vec![json!({"success": true})]);
        let probe = ScriptedState::new(vec![MemberState::Unmuted]);
        let executor = ModerationExecutor::new(Arc::clone(&host), probe, ModerationConfig::default());

        let outcome = executor.execute(ModerationTarget::member("t1", "u9"), ModerationAction::Mute).await;

        assert!(outcome.success);
        assert!(outcome.unconfirmed);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.final_state, Some(MemberState::Unmuted));
        // One precheck plus three confirmation reads.
        assert_eq!(*executor.probe.reads.lock().unwrap(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn already_applied_issues_nothing() {
        let host = ScriptedHost::new(Vec::new());
        let probe = ScriptedState::new(vec![MemberState::Muted]);
        let executor = ModerationExecutor::new(Arc::clone(&host), probe, ModerationConfig::default());

        let outcome = executor.execute(ModerationTarget::channel("t1"), ModerationAction::Mute).await;

        assert!(outcome.success);
        assert!(!outcome.unconfirmed);
        assert_eq!(outcome.attempts, 0);
        assert!(host.issued().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_operation_falls_back_to_next_candidate() {
        let host = ScriptedHost::new(vec![
            json!({"unavailable": true, "error": "muteTeamAll not available"}),
            json!({"success": true}),
        ]);
        let probe = ScriptedState::new(vec![MemberState::Muted, MemberState::Unmuted]);
        let executor = ModerationExecutor::new(Arc::clone(&host), probe, no_confirm_delay());

        let outcome = executor.execute(ModerationTarget::channel("t1"), ModerationAction::Unmute).await;

        assert!(outcome.success);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(host.issued(), ["muteTeamAll", "updateTeam"]);
    }

    #[tokio::test(start_paused = true)]
    async fn generic_errors_fail_immediately() {
        let host = ScriptedHost::new(vec![json!({"success": false, "error": "no permission", "code": 802})]);
        let probe = ScriptedState::new(vec![MemberState::Unmuted]);
        let executor = ModerationExecutor::new(Arc::clone(&host), probe, no_confirm_delay());

        let start = Instant::now();
        let outcome = executor.execute(ModerationTarget::channel("t1"), ModerationAction::Mute).await;

        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.message.contains("no permission"));
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(host.issued(), ["muteTeamAll"]);
    }

    #[tokio::test]
    async fn remove_without_member_is_rejected() {
        let host = ScriptedHost::new(Vec::new());
        let executor = ModerationExecutor::new(host, ScriptedState::new(vec![MemberState::Unmuted]), no_confirm_delay());
        let outcome = executor.execute(ModerationTarget::channel("t1"), ModerationAction::Remove).await;
        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 0);
    }
}
