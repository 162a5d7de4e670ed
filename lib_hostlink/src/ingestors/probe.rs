//! # Capture Probes
//!
//! A probe is what one poll cycle runs. The stock [`ScriptProbe`] evaluates a
//! read-only script on the host through a [`CommandChannel`] and returns the
//! records it produced. Anything else that can yield records on demand (test
//! doubles, alternative capture paths) implements [`CaptureProbe`] directly.
//!
//! The scripts below are the host-side half of the capture paths: the store
//! scan, the rendered-view scrape, and the hook that pushes live messages
//! through a page binding.

use std::future::Future;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::core::correlator::{CommandChannel, CommandMode};
use crate::core::demux::DemuxConfig;
use crate::error::BridgeResult;
use crate::ingestors::normalizer::split_records;

/// Produces the raw records for one poll cycle.
pub trait CaptureProbe: Send + Sync + 'static {
    /// Runs one cycle. Errors are logged by the poller; the next tick retries.
    fn poll(&self) -> impl Future<Output = BridgeResult<Vec<Value>>> + Send;
}

/// # Script Probe
///
/// Evaluates `script` and splits the returned value into records.
pub struct ScriptProbe<C> {
    channel: Arc<C>,
    script: String,
    mode: CommandMode,
}

impl<C: CommandChannel + 'static> ScriptProbe<C> {
    /// Wraps a script. Use [`CommandMode::AwaitAsync`] for scripts that return
    /// a promise.
    pub fn new(channel: Arc<C>, script: impl Into<String>, mode: CommandMode) -> Self {
        Self {
            channel,
            script: script.into(),
            mode,
        }
    }

    /// Local-store scan of `channel_id`.
    pub fn structured_scan(channel: Arc<C>, channel_id: &str, limit: usize) -> Self {
        Self::new(channel, structured_scan_script(channel_id, limit), CommandMode::AwaitAsync)
    }

    /// Scrape of the chat view currently on screen.
    pub fn rendered_scan(channel: Arc<C>) -> Self {
        Self::new(channel, rendered_scan_script(), CommandMode::Sync)
    }
}

impl<C: CommandChannel + 'static> CaptureProbe for ScriptProbe<C> {
    fn poll(&self) -> impl Future<Output = BridgeResult<Vec<Value>>> + Send {
        async move {
            let value = self.channel.evaluate(&self.script, self.mode).await?;
            Ok(split_records(value))
        }
    }
}

/// Reads the newest `limit` messages of a team from the host's local store.
pub fn structured_scan_script(channel_id: &str, limit: usize) -> String {
    let to = Value::String(channel_id.to_string());
    format!(
        r#"(async function() {{
    if (!window.nim || typeof window.nim.getLocalMsgs !== 'function') {{
        return JSON.stringify({{ msgs: [] }});
    }}
    var msgs = await new Promise(function(resolve) {{
        window.nim.getLocalMsgs({{
            scene: 'team',
            to: {to},
            limit: {limit},
            done: function(err, obj) {{ resolve(err ? [] : (obj.msgs || [])); }}
        }});
        setTimeout(function() {{ resolve([]); }}, 10000);
    }});
    return JSON.stringify({{ msgs: msgs.map(function(m) {{
        return {{
            idClient: m.idClient, idServer: m.idServer, from: m.from, fromNick: m.fromNick,
            to: m.to, sessionId: m.sessionId, scene: m.scene, type: m.type, text: m.text,
            content: m.content, attach: m.attach, custom: m.custom, time: m.time, flow: m.flow
        }};
    }}) }});
}})()"#
    )
}

/// Scrapes the message bubbles of the chat view on screen.
pub fn rendered_scan_script() -> String {
    r#"(function() {
    var channel = null;
    try {
        var session = window.nim && window.nim.currSession;
        channel = session ? (session.id || session.to || null) : null;
    } catch (e) {}
    function attr(el, names) {
        for (var i = 0; i < names.length; i++) {
            var holder = el.closest('[' + names[i] + ']');
            if (holder) { return holder.getAttribute(names[i]); }
        }
        return null;
    }
    function trimmed(node) { return node ? (node.innerText || '').trim() : ''; }
    var messages = [];
    document.querySelectorAll('.msg-item, [class*="message"]').forEach(function(el, index) {
        var whole = trimmed(el);
        if (!whole || whole.length >= 2000) { return; }
        var className = el.className || '';
        var isSent = className.includes('self-msg') || className.includes('self') || className.includes('right');
        var nick = el.getAttribute('data-nick') || trimmed(el.querySelector('[class*="name"], [class*="nick"]')) || null;
        var text = trimmed(el.querySelector('[class*="content"], [class*="text"], [class*="bubble"]'));
        if (!text) {
            var lines = whole.split('\n').map(function(l) { return l.trim(); }).filter(Boolean);
            if (nick && lines.length > 1 && lines[0] === nick) { lines.shift(); }
            text = lines.join('\n');
        }
        if (!text) { return; }
        messages.push({
            text: text.substring(0, 1000),
            sender: nick || (isSent ? 'self' : 'peer'),
            senderId: attr(el, ['data-from', 'data-account', 'data-id', 'data-userid']),
            time: Number(attr(el, ['data-time'])) || null,
            channel: channel,
            isSent: isSent,
            index: index
        });
    });
    return JSON.stringify(messages);
})()"#
        .to_string()
}

/// Hooks the host's message callbacks so every received message is passed to
/// the page binding named in `config`. Installing twice is harmless.
pub fn push_hook_script(config: &DemuxConfig) -> String {
    let binding = Value::String(config.binding_name.clone());
    let marker = Value::String(config.console_marker.clone());
    format!(
        r#"(function() {{
    if (!window.nim || !window.nim.options) {{ return 'NO_HOST'; }}
    if (window.__hostlinkHooked) {{ return 'ALREADY'; }}
    var bindingName = {binding};
    var marker = {marker};
    function emit(msg) {{
        var payload = JSON.stringify(msg);
        if (typeof window[bindingName] === 'function') {{
            window[bindingName](payload);
        }} else {{
            console.log(marker + ' ' + payload);
        }}
    }}
    var opts = window.nim.options;
    var origOnmsg = opts.onmsg;
    opts.onmsg = function(msg) {{
        try {{ emit(msg); }} catch (e) {{}}
        if (typeof origOnmsg === 'function') {{ return origOnmsg.apply(this, arguments); }}
    }};
    var origOnmsgs = opts.onmsgs;
    opts.onmsgs = function(msgs) {{
        try {{ emit({{ msgs: msgs }}); }} catch (e) {{}}
        if (typeof origOnmsgs === 'function') {{ return origOnmsgs.apply(this, arguments); }}
    }};
    window.__hostlinkHooked = true;
    return 'HOOKED';
}})()"#
    )
}

/// Enables runtime events, registers the push binding and installs the hook.
/// Returns the hook script's status string.
pub async fn install_push_hook<C: CommandChannel>(channel: &C, config: &DemuxConfig) -> BridgeResult<String> {
    channel.call("Runtime.enable", json!({}), CommandMode::Sync).await?;
    channel
        .call("Runtime.addBinding", json!({"name": config.binding_name}), CommandMode::Sync)
        .await?;
    let status = channel.evaluate(&push_hook_script(config), CommandMode::Sync).await?;
    let status = status.as_str().unwrap_or("UNKNOWN").to_string();
    log::info!("Push hook install: {}", status);
    Ok(status)
}
