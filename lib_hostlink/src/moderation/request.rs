//! # Moderation Requests
//!
//! What to change (target and action), how the host can be asked to change it
//! (an ordered list of candidate operations), and what the caller gets back.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BridgeError, BridgeResult, RemoteError};

/// State-changing action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ModerationAction {
    /// Silence a member, or the whole channel.
    Mute,
    /// Lift a mute.
    Unmute,
    /// Remove a member from the channel.
    Remove,
}

impl ModerationAction {
    /// End state the action should produce.
    pub fn desired_state(self) -> MemberState {
        match self {
            ModerationAction::Mute => MemberState::Muted,
            ModerationAction::Unmute => MemberState::Unmuted,
            ModerationAction::Remove => MemberState::Absent,
        }
    }
}

impl fmt::Display for ModerationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ModerationAction::Mute => "mute",
            ModerationAction::Unmute => "unmute",
            ModerationAction::Remove => "remove",
        };
        f.write_str(label)
    }
}

/// A channel, or one member of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModerationTarget {
    /// Team id.
    pub channel: String,
    /// Member account; `None` addresses the whole channel.
    pub member: Option<String>,
}

impl ModerationTarget {
    /// The whole channel.
    pub fn channel(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            member: None,
        }
    }

    /// One member of `channel`.
    pub fn member(channel: impl Into<String>, member: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            member: Some(member.into()),
        }
    }
}

impl fmt::Display for ModerationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.member {
            Some(member) => write!(f, "{}/{}", self.channel, member),
            None => write!(f, "{}/*", self.channel),
        }
    }
}

/// Observable moderation state of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MemberState {
    /// Muted (member) or mute-all on (channel).
    Muted,
    /// Free to speak.
    Unmuted,
    /// Not a member of the channel.
    Absent,
}

/// One host-side way of carrying out an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOperation {
    /// `nim.muteTeamAll({teamId, mute})`.
    MuteTeamAll,
    /// `nim.updateTeam({teamId, muteType})`, 2 = all muted, 0 = none.
    UpdateTeamMuteType,
    /// `nim.updateMuteStateInTeam({teamId, account, mute})`.
    UpdateMuteStateInTeam,
    /// `nim.removeTeamMembers({teamId, accounts})`.
    RemoveTeamMembers,
}

impl HostOperation {
    /// Host function name.
    pub fn function_name(self) -> &'static str {
        match self {
            HostOperation::MuteTeamAll => "muteTeamAll",
            HostOperation::UpdateTeamMuteType => "updateTeam",
            HostOperation::UpdateMuteStateInTeam => "updateMuteStateInTeam",
            HostOperation::RemoveTeamMembers => "removeTeamMembers",
        }
    }

    /// Operations able to perform `action` on `target`, in preference order.
    pub fn candidates(target: &ModerationTarget, action: ModerationAction) -> BridgeResult<Vec<HostOperation>> {
        match (action, target.member.is_some()) {
            (ModerationAction::Mute | ModerationAction::Unmute, false) => {
                Ok(vec![HostOperation::MuteTeamAll, HostOperation::UpdateTeamMuteType])
            }
            (ModerationAction::Mute | ModerationAction::Unmute, true) => Ok(vec![HostOperation::UpdateMuteStateInTeam]),
            (ModerationAction::Remove, true) => Ok(vec![HostOperation::RemoveTeamMembers]),
            (ModerationAction::Remove, false) => Err(BridgeError::InvalidRequest(format!(
                "remove needs a member, got whole channel {}",
                target.channel
            ))),
        }
    }

    /// Script that performs the operation and resolves to
    /// `{success}`, `{success: false, error, code}` or `{unavailable: true}`.
    pub fn script(self, target: &ModerationTarget, action: ModerationAction) -> String {
        let team = Value::String(target.channel.clone());
        let account = Value::String(target.member.clone().unwrap_or_default());
        let mute = action == ModerationAction::Mute;
        let args = match self {
            HostOperation::MuteTeamAll => format!("teamId: {team}, mute: {mute}"),
            HostOperation::UpdateTeamMuteType => {
                format!("teamId: {team}, muteType: {}", if mute { 2 } else { 0 })
            }
            HostOperation::UpdateMuteStateInTeam => format!("teamId: {team}, account: {account}, mute: {mute}"),
            HostOperation::RemoveTeamMembers => format!("teamId: {team}, accounts: [{account}]"),
        };
        let function = self.function_name();
        format!(
            r#"(async function() {{
    if (!window.nim || typeof window.nim.{function} !== 'function') {{
        return JSON.stringify({{ unavailable: true, error: '{function} not available' }});
    }}
    var outcome = await new Promise(function(resolve) {{
        try {{
            window.nim.{function}({{
                {args},
                done: function(err) {{
                    if (err) resolve({{ success: false, error: err.message || String(err), code: err.code || null }});
                    else resolve({{ success: true }});
                }}
            }});
        }} catch (e) {{
            resolve({{ success: false, error: e.message }});
        }}
        setTimeout(function() {{ resolve({{ success: false, error: 'Timeout' }}); }}, 8000);
    }});
    return JSON.stringify(outcome);
}})()"#
        )
    }

    /// Reads an operation script's result.
    pub fn interpret(self, result: &Value) -> BridgeResult<()> {
        if result.get("success").and_then(Value::as_bool) == Some(true) {
            return Ok(());
        }
        let message = result
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("operation failed")
            .to_string();
        if result.get("unavailable").and_then(Value::as_bool) == Some(true) {
            return Err(BridgeError::Unavailable(message));
        }
        let code = result.get("code").and_then(Value::as_i64);
        Err(BridgeError::from_remote(RemoteError::new(message, code)))
    }
}

impl fmt::Display for HostOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.function_name())
    }
}

/// Bookkeeping for one `execute` call.
#[derive(Debug, Clone)]
pub struct ModerationRequest {
    /// What is being changed.
    pub target: ModerationTarget,
    /// How.
    pub action: ModerationAction,
    /// Operations issued so far, across all candidates.
    pub attempts: u32,
    /// Most recent failure.
    pub last_error: Option<BridgeError>,
    /// State that counts as done.
    pub desired_state: MemberState,
}

impl ModerationRequest {
    /// Starts tracking `action` on `target`.
    pub fn new(target: ModerationTarget, action: ModerationAction) -> Self {
        Self {
            desired_state: action.desired_state(),
            target,
            action,
            attempts: 0,
            last_error: None,
        }
    }
}

/// Result of one `execute` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModerationOutcome {
    /// The host accepted the change (or it was already in place).
    pub success: bool,
    /// Last state read back from the host, if any read succeeded.
    pub final_state: Option<MemberState>,
    /// Success was reported but the desired state was never observed.
    pub unconfirmed: bool,
    /// Operations issued.
    pub attempts: u32,
    /// Human-readable summary.
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn candidates_follow_target_shape() {
        let all = ModerationTarget::channel("t1");
        let one = ModerationTarget::member("t1", "u1");
        assert_eq!(
            HostOperation::candidates(&all, ModerationAction::Mute).unwrap(),
            [HostOperation::MuteTeamAll, HostOperation::UpdateTeamMuteType]
        );
        assert_eq!(
            HostOperation::candidates(&one, ModerationAction::Unmute).unwrap(),
            [HostOperation::UpdateMuteStateInTeam]
        );
        assert!(matches!(
            HostOperation::candidates(&all, ModerationAction::Remove),
            Err(BridgeError::InvalidRequest(_))
        ));
    }

    #[test]
    fn results_are_classified() {
        let op = HostOperation::MuteTeamAll;
        assert!(op.interpret(&json!({"success": true})).is_ok());
        assert!(op.interpret(&json!({"success": false, "error": "x", "code": 416})).unwrap_err().is_rate_limited());
        assert!(op.interpret(&json!({"success": false, "error": "操作频率过快"})).unwrap_err().is_rate_limited());
        assert!(matches!(
            op.interpret(&json!({"unavailable": true, "error": "gone"})),
            Err(BridgeError::Unavailable(_))
        ));
        assert!(matches!(
            op.interpret(&json!({"success": false, "error": "no permission", "code": 802})),
            Err(BridgeError::Remote(_))
        ));
    }

    #[test]
    fn scripts_embed_quoted_arguments() {
        let target = ModerationTarget::member("t'1", "u\"2");
        let script = HostOperation::UpdateMuteStateInTeam.script(&target, ModerationAction::Mute);
        assert!(script.contains(r#"teamId: "t'1""#));
        assert!(script.contains(r#"account: "u\"2""#));
        assert!(script.contains("mute: true"));

        let team = HostOperation::UpdateTeamMuteType.script(&ModerationTarget::channel("9"), ModerationAction::Unmute);
        assert!(team.contains("muteType: 0"));
    }
}
