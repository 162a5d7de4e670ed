//! # State Probes
//!
//! Reads the host's authoritative moderation state, used before issuing (to
//! skip work already done) and after (to confirm it took effect).

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use crate::core::correlator::{CommandChannel, CommandMode};
use crate::error::{BridgeError, BridgeResult};
use crate::moderation::request::{MemberState, ModerationTarget};

/// Reads the current state of a target.
pub trait StateProbe: Send + Sync {
    /// One read.
    fn read_state(&self, target: &ModerationTarget) -> impl Future<Output = BridgeResult<MemberState>> + Send;
}

/// # Script State Probe
///
/// Asks the host's team API through `Runtime.evaluate`.
pub struct ScriptStateProbe<C> {
    channel: Arc<C>,
}

impl<C: CommandChannel> ScriptStateProbe<C> {
    /// Creates a probe issuing reads through `channel`.
    pub fn new(channel: Arc<C>) -> Self {
        Self { channel }
    }
}

impl<C: CommandChannel> StateProbe for ScriptStateProbe<C> {
    fn read_state(&self, target: &ModerationTarget) -> impl Future<Output = BridgeResult<MemberState>> + Send {
        let script = state_script(target);
        async move {
            let value = self.channel.evaluate(&script, CommandMode::AwaitAsync).await?;
            parse_state(&value)
        }
    }
}

/// Script resolving to `{state: "muted" | "unmuted" | "absent"}` or `{error}`.
pub fn state_script(target: &ModerationTarget) -> String {
    let team = Value::String(target.channel.clone());
    match &target.member {
        None => format!(
            r#"(async function() {{
    if (!window.nim || typeof window.nim.getTeam !== 'function') {{
        return JSON.stringify({{ error: 'getTeam not available' }});
    }}
    var team = await new Promise(function(resolve) {{
        window.nim.getTeam({{ teamId: {team}, sync: true, done: function(err, obj) {{ resolve(err ? null : obj); }} }});
        setTimeout(function() {{ resolve(null); }}, 8000);
    }});
    if (!team) {{ return JSON.stringify({{ error: 'team not found' }}); }}
    var muted;
    if (team.muteType !== undefined && team.muteType !== null) {{
        muted = Number(team.muteType) === 2;
    }} else if (team.muteAll !== undefined && team.muteAll !== null) {{
        muted = team.muteAll === true || team.muteAll === 1 || team.muteAll === '1';
    }} else {{
        muted = team.mute === true || team.mute === 1 || team.mute === '1';
    }}
    return JSON.stringify({{ state: muted ? 'muted' : 'unmuted' }});
}})()"#
        ),
        Some(member) => {
            let account = Value::String(member.clone());
            format!(
                r#"(async function() {{
    if (!window.nim || typeof window.nim.getTeamMembers !== 'function') {{
        return JSON.stringify({{ error: 'getTeamMembers not available' }});
    }}
    var members = await new Promise(function(resolve) {{
        window.nim.getTeamMembers({{ teamId: {team}, done: function(err, obj) {{ resolve(err ? null : (obj.members || [])); }} }});
        setTimeout(function() {{ resolve(null); }}, 8000);
    }});
    if (!members) {{ return JSON.stringify({{ error: 'member list unavailable' }}); }}
    var me = members.find(function(m) {{ return m.account === {account}; }});
    if (!me) {{ return JSON.stringify({{ state: 'absent' }}); }}
    return JSON.stringify({{ state: me.mute ? 'muted' : 'unmuted' }});
}})()"#
            )
        }
    }
}

/// Reads a state script's result.
pub fn parse_state(value: &Value) -> BridgeResult<MemberState> {
    match value.get("state").and_then(Value::as_str) {
        Some("muted") => Ok(MemberState::Muted),
        Some("unmuted") => Ok(MemberState::Unmuted),
        Some("absent") => Ok(MemberState::Absent),
        Some(other) => Err(BridgeError::Decode(format!("unknown state '{other}'"))),
        None => {
            let reason = value.get("error").and_then(Value::as_str).unwrap_or("no state in reply");
            Err(BridgeError::Decode(reason.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn state_replies_parse() {
        assert_eq!(parse_state(&json!({"state": "muted"})).unwrap(), MemberState::Muted);
        assert_eq!(parse_state(&json!({"state": "absent"})).unwrap(), MemberState::Absent);
        assert!(matches!(parse_state(&json!({"error": "team not found"})), Err(BridgeError::Decode(_))));
        assert!(parse_state(&json!({"state": "banned"})).is_err());
    }

    #[test]
    fn script_shape_depends_on_target() {
        assert!(state_script(&ModerationTarget::channel("5")).contains("getTeam("));
        let member = state_script(&ModerationTarget::member("5", "u7"));
        assert!(member.contains("getTeamMembers"));
        assert!(member.contains("\"u7\""));
    }
}
