//! # Collaborators
//!
//! Narrow interfaces to the parts of the system that live outside this crate:
//! key-value settings, outbound chat text, and discovery of the connection
//! target. Each comes with a small stock implementation.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;

use crate::core::correlator::{CommandChannel, CommandMode};
use crate::error::{BridgeError, BridgeResult};

/// Persistent string settings.
pub trait SettingsStore: Send + Sync {
    /// Value for `key`, if set.
    fn get(&self, key: &str) -> Option<String>;
    /// Stores `value` under `key`.
    fn set(&self, key: &str, value: &str) -> BridgeResult<()>;
}

/// In-process [`SettingsStore`].
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemorySettingsStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) -> BridgeResult<()> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Conversation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scene {
    /// Group conversation.
    Team,
    /// One-to-one conversation.
    P2p,
}

impl Scene {
    fn as_str(self) -> &'static str {
        match self {
            Scene::Team => "team",
            Scene::P2p => "p2p",
        }
    }
}

/// Sends chat text into a conversation.
pub trait TextSender: Send + Sync {
    /// Sends `text` to `to`.
    fn send_text(&self, scene: Scene, to: &str, text: &str) -> impl Future<Output = BridgeResult<()>> + Send;
}

/// # Script Text Sender
///
/// Sends text through the host's `nim.sendText`.
pub struct ScriptTextSender<C> {
    channel: Arc<C>,
}

impl<C: CommandChannel> ScriptTextSender<C> {
    /// Creates a sender issuing commands through `channel`.
    pub fn new(channel: Arc<C>) -> Self {
        Self { channel }
    }
}

impl<C: CommandChannel> TextSender for ScriptTextSender<C> {
    fn send_text(&self, scene: Scene, to: &str, text: &str) -> impl Future<Output = BridgeResult<()>> + Send {
        let script = send_text_script(scene, to, text);
        async move {
            let reply = self.channel.evaluate(&script, CommandMode::AwaitAsync).await?;
            if reply.get("success").and_then(Value::as_bool) == Some(true) {
                return Ok(());
            }
            let message = reply.get("error").and_then(Value::as_str).unwrap_or("send failed");
            let code = reply.get("code").and_then(Value::as_i64);
            Err(BridgeError::from_remote(crate::error::RemoteError::new(message, code)))
        }
    }
}

fn send_text_script(scene: Scene, to: &str, text: &str) -> String {
    let scene = Value::String(scene.as_str().to_string());
    let to = Value::String(to.to_string());
    let text = Value::String(text.to_string());
    format!(
        r#"(async function() {{
    if (!window.nim || typeof window.nim.sendText !== 'function') {{
        return JSON.stringify({{ success: false, error: 'sendText not available' }});
    }}
    var outcome = await new Promise(function(resolve) {{
        window.nim.sendText({{
            scene: {scene},
            to: {to},
            text: {text},
            done: function(err, msg) {{
                if (err) resolve({{ success: false, error: err.message || String(err), code: err.code || null }});
                else resolve({{ success: true, idClient: msg && msg.idClient }});
            }}
        }});
        setTimeout(function() {{ resolve({{ success: false, error: 'Timeout' }}); }}, 10000);
    }});
    return JSON.stringify(outcome);
}})()"#
    )
}

/// Supplies the connection target string.
pub trait TargetSupplier: Send + Sync {
    /// Current target, e.g. `ws://127.0.0.1:9222/devtools/page/<id>`.
    fn target(&self) -> BridgeResult<String>;
}

/// A fixed target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticTarget(pub String);

impl TargetSupplier for StaticTarget {
    fn target(&self) -> BridgeResult<String> {
        if self.0.trim().is_empty() {
            return Err(BridgeError::Config("no connection target configured".to_string()));
        }
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo {
        reply: Value,
        last: Mutex<Option<String>>,
    }

    impl CommandChannel for Echo {
        fn call(&self, _method: &str, params: Value, _mode: CommandMode) -> impl Future<Output = BridgeResult<Value>> + Send {
            *self.last.lock().unwrap() = params["expression"].as_str().map(str::to_string);
            let value = json!({"result": {"type": "string", "value": self.reply.to_string()}});
            async move { Ok(value) }
        }
    }

    #[test]
    fn memory_store_round_trip() {
        let store = MemorySettingsStore::new();
        assert_eq!(store.get("odds"), None);
        store.set("odds", "1.95").unwrap();
        assert_eq!(store.get("odds").as_deref(), Some("1.95"));
    }

    #[tokio::test]
    async fn text_sender_reports_host_errors() {
        let ok = Arc::new(Echo {
            reply: json!({"success": true}),
            last: Mutex::new(None),
        });
        ScriptTextSender::new(Arc::clone(&ok)).send_text(Scene::Team, "42", "开奖: 7").await.unwrap();
        let script = ok.last.lock().unwrap().clone().unwrap();
        assert!(script.contains("\"开奖: 7\""));
        assert!(script.contains("scene: \"team\""));

        let limited = Arc::new(Echo {
            reply: json!({"success": false, "error": "freq", "code": 416}),
            last: Mutex::new(None),
        });
        let err = ScriptTextSender::new(limited).send_text(Scene::P2p, "u1", "hi").await.unwrap_err();
        assert!(err.is_rate_limited());
    }

    #[test]
    fn static_target_rejects_blank() {
        assert!(StaticTarget("ws://h/p".to_string()).target().is_ok());
        assert!(matches!(StaticTarget(" ".to_string()).target(), Err(BridgeError::Config(_))));
    }
}
