//! # Command Correlator
//!
//! Turns the host's fire-and-forget socket into request/response calls.
//!
//! Every outbound command gets an id from a strictly increasing counter and a
//! [`PendingCommand`] entry in an id-keyed table. The receive loop hands reply
//! frames to [`Correlator::resolve`], which removes the entry and fulfils the
//! caller's one-shot slot. The caller waits on that slot with its own timeout,
//! so a slow command never holds up any other.
//!
//! ## Invariants
//! - At most one entry per id; ids are never reused for the lifetime of the
//!   correlator, across reconnects included.
//! - Each command resolves exactly once: reply, timeout, or connection loss.
//! - The entry is gone after resolution. A drop guard also removes it when the
//!   caller's future is cancelled mid-wait, so the table cannot leak.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

use crate::core::frame::CommandFrame;
use crate::error::{BridgeError, BridgeResult, RemoteError};
use crate::utils::truncate_chars;

/// Method used to run script expressions inside the host.
pub const EVALUATE_METHOD: &str = "Runtime.evaluate";

/// How the host executes a command, which decides its timeout budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandMode {
    /// Completes synchronously on the host; short budget.
    Sync,
    /// Kicks off asynchronous work on the host (a promise); long budget.
    AwaitAsync,
}

/// Timeout budgets for the two command modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelatorConfig {
    /// Budget for [`CommandMode::Sync`] commands.
    pub sync_timeout: Duration,
    /// Budget for [`CommandMode::AwaitAsync`] commands.
    pub async_timeout: Duration,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            sync_timeout: Duration::from_secs(15),
            async_timeout: Duration::from_secs(90),
        }
    }
}

impl CorrelatorConfig {
    /// Returns the budget that applies to `mode`.
    pub fn timeout_for(&self, mode: CommandMode) -> Duration {
        match mode {
            CommandMode::Sync => self.sync_timeout,
            CommandMode::AwaitAsync => self.async_timeout,
        }
    }
}

/// One command awaiting its reply.
#[derive(Debug)]
pub struct PendingCommand {
    /// Method name, for diagnostics.
    pub method: String,
    /// When the command was registered.
    pub issued_at: Instant,
    /// Budget the caller is waiting with.
    pub timeout: Duration,
    slot: oneshot::Sender<BridgeResult<Value>>,
}

type PendingTable = Mutex<HashMap<u64, PendingCommand>>;

/// Removes the entry for `id` when the waiting future goes away.
struct PendingGuard<'a> {
    pending: &'a PendingTable,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// # Command Channel
///
/// The seam between request issuers (pollers, the moderation executor, the text
/// sender) and the correlator. Tests substitute scripted implementations.
pub trait CommandChannel: Send + Sync {
    /// Issues one command and waits for its resolution.
    fn call(&self, method: &str, params: Value, mode: CommandMode) -> impl Future<Output = BridgeResult<Value>> + Send;

    /// Runs a script expression on the host and returns its by-value result.
    fn evaluate(&self, expression: &str, mode: CommandMode) -> impl Future<Output = BridgeResult<Value>> + Send {
        let params = evaluation_params(expression, mode);
        async move { unwrap_evaluation(self.call(EVALUATE_METHOD, params, mode).await?) }
    }
}

/// Builds `Runtime.evaluate` parameters.
pub fn evaluation_params(expression: &str, mode: CommandMode) -> Value {
    json!({
        "expression": expression,
        "returnByValue": true,
        "awaitPromise": mode == CommandMode::AwaitAsync,
    })
}

/// Extracts `result.value` from an evaluation reply.
///
/// A thrown script exception comes back as a successful reply carrying
/// `exceptionDetails`; it is surfaced as a remote error here. String values that
/// hold a JSON document (scripts usually end in `JSON.stringify`) are parsed.
pub fn unwrap_evaluation(reply: Value) -> BridgeResult<Value> {
    if let Some(details) = reply.get("exceptionDetails") {
        let message = details
            .pointer("/exception/description")
            .and_then(Value::as_str)
            .or_else(|| details.get("text").and_then(Value::as_str))
            .unwrap_or("script threw")
            .to_string();
        return Err(BridgeError::Remote(RemoteError::new(message, None)));
    }
    let value = reply.pointer("/result/value").cloned().unwrap_or(Value::Null);
    Ok(decode_script_value(value))
}

/// Parses string values that contain a JSON object or array; leaves others as-is.
pub fn decode_script_value(value: Value) -> Value {
    if let Value::String(text) = &value {
        let trimmed = text.trim_start();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            if let Ok(parsed) = serde_json::from_str::<Value>(text) {
                return parsed;
            }
        }
    }
    value
}

/// # Correlator
pub struct Correlator {
    config: CorrelatorConfig,
    next_id: AtomicU64,
    pending: PendingTable,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl Correlator {
    /// Creates a detached correlator; commands fail with `NotConnected` until
    /// [`Correlator::attach`] is called.
    pub fn new(config: CorrelatorConfig) -> Self {
        Self {
            config,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            outbound: Mutex::new(None),
        }
    }

    /// Timeout configuration in use.
    pub fn config(&self) -> CorrelatorConfig {
        self.config
    }

    /// Routes subsequent commands into `sender` (the connection's writer queue).
    pub fn attach(&self, sender: mpsc::UnboundedSender<String>) {
        *self.lock_outbound() = Some(sender);
    }

    /// Stops accepting commands. Already pending ones keep waiting until
    /// [`Correlator::fail_all`] or their timeout resolves them.
    pub fn detach(&self) {
        self.lock_outbound().take();
    }

    /// True while a writer queue is attached.
    pub fn is_attached(&self) -> bool {
        self.lock_outbound().is_some()
    }

    /// Number of commands awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    /// True if `id` is awaiting a reply.
    pub fn is_pending(&self, id: u64) -> bool {
        self.lock_pending().contains_key(&id)
    }

    /// Sends a command with the budget that belongs to `mode`.
    pub async fn send(&self, method: &str, params: Value, mode: CommandMode) -> BridgeResult<Value> {
        self.send_with_timeout(method, params, self.config.timeout_for(mode)).await
    }

    /// Sends a command and waits at most `timeout` for its reply.
    pub async fn send_with_timeout(&self, method: &str, params: Value, timeout: Duration) -> BridgeResult<Value> {
        let outbound = self.lock_outbound().clone().ok_or(BridgeError::NotConnected)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let text = CommandFrame {
            id,
            method: method.to_string(),
            params,
        }
        .to_text()?;

        let (slot, mut rx) = oneshot::channel();
        self.lock_pending().insert(
            id,
            PendingCommand {
                method: method.to_string(),
                issued_at: Instant::now(),
                timeout,
                slot,
            },
        );
        let _guard = PendingGuard { pending: &self.pending, id };

        log::trace!("-> #{} {}", id, truncate_chars(&text, 200));
        if outbound.send(text).is_err() {
            log::warn!("Writer queue closed while sending #{} ({})", id, method);
            return Err(BridgeError::ConnectionLost);
        }

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(BridgeError::ConnectionLost),
            Err(_) => {
                let abandoned = self.lock_pending().remove(&id).is_some();
                if abandoned {
                    log::warn!("Command #{} ({}) timed out after {:?}", id, method, timeout);
                    Err(BridgeError::CommandTimeout {
                        id,
                        method: method.to_string(),
                        after: timeout,
                    })
                } else {
                    // Resolved in the instant between the deadline and the removal.
                    rx.try_recv().unwrap_or(Err(BridgeError::ConnectionLost))
                }
            }
        }
    }

    /// Delivers a reply. Returns false when no command with `id` is pending
    /// (already timed out, or never sent by us).
    pub fn resolve(&self, id: u64, outcome: Result<Value, RemoteError>) -> bool {
        let Some(entry) = self.lock_pending().remove(&id) else {
            return false;
        };
        log::trace!(
            "<- #{} {} resolved in {:?}",
            id,
            entry.method,
            entry.issued_at.elapsed()
        );
        let _ = entry.slot.send(outcome.map_err(BridgeError::from_remote));
        true
    }

    /// Fails every pending command with `error` and empties the table.
    pub fn fail_all(&self, error: BridgeError) -> usize {
        let drained: Vec<(u64, PendingCommand)> = self.lock_pending().drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            log::debug!("Failing #{} ({}): {}", id, entry.method, error);
            let _ = entry.slot.send(Err(error.clone()));
        }
        count
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<u64, PendingCommand>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_outbound(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<String>>> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CommandChannel for Correlator {
    fn call(&self, method: &str, params: Value, mode: CommandMode) -> impl Future<Output = BridgeResult<Value>> + Send {
        self.send(method, params, mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn attached() -> (Arc<Correlator>, mpsc::UnboundedReceiver<String>) {
        let correlator = Arc::new(Correlator::new(CorrelatorConfig {
            sync_timeout: Duration::from_millis(200),
            async_timeout: Duration::from_secs(2),
        }));
        let (tx, rx) = mpsc::unbounded_channel();
        correlator.attach(tx);
        (correlator, rx)
    }

    fn sent_id(text: &str) -> u64 {
        let v: Value = serde_json::from_str(text).unwrap();
        v["id"].as_u64().unwrap()
    }

    #[tokio::test]
    async fn not_connected_fails_fast_without_registering() {
        let correlator = Correlator::new(CorrelatorConfig::default());
        let err = correlator.send("Page.reload", json!({}), CommandMode::Sync).await.unwrap_err();
        assert!(matches!(err, BridgeError::NotConnected));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn out_of_order_replies_match_by_id() {
        let (correlator, mut wire) = attached();

        let c1 = Arc::clone(&correlator);
        let first = tokio::spawn(async move { c1.send("A", json!({}), CommandMode::AwaitAsync).await });
        let c2 = Arc::clone(&correlator);
        let second = tokio::spawn(async move { c2.send("B", json!({}), CommandMode::AwaitAsync).await });

        let f1 = wire.recv().await.unwrap();
        let f2 = wire.recv().await.unwrap();
        let (id1, id2) = (sent_id(&f1), sent_id(&f2));
        assert_ne!(id1, id2);

        // Answer in reverse order; each reply carries its own id as the result.
        assert!(correlator.resolve(id2, Ok(json!(id2))));
        assert!(correlator.resolve(id1, Ok(json!(id1))));

        let mut results = vec![first.await.unwrap().unwrap(), second.await.unwrap().unwrap()];
        results.sort_by_key(|v| v.as_u64());
        let mut expected = vec![json!(id1), json!(id2)];
        expected.sort_by_key(|v| v.as_u64());
        assert_eq!(results, expected);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn ids_strictly_increase() {
        let (correlator, mut wire) = attached();
        let mut last = 0;
        for _ in 0..5 {
            let c = Arc::clone(&correlator);
            let handle = tokio::spawn(async move { c.send("X", json!({}), CommandMode::Sync).await });
            let id = sent_id(&wire.recv().await.unwrap());
            assert!(id > last);
            last = id;
            correlator.resolve(id, Ok(Value::Null));
            handle.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn timeout_removes_entry_and_late_reply_is_unmatched() {
        let (correlator, mut wire) = attached();
        let err = {
            let c = Arc::clone(&correlator);
            let handle = tokio::spawn(async move { c.send("Slow", json!({}), CommandMode::Sync).await });
            let _ = wire.recv().await.unwrap();
            handle.await.unwrap().unwrap_err()
        };
        let BridgeError::CommandTimeout { id, .. } = err else {
            panic!("expected timeout, got {err:?}");
        };
        assert_eq!(correlator.pending_count(), 0);
        assert!(!correlator.resolve(id, Ok(Value::Null)));
    }

    #[tokio::test]
    async fn remote_errors_are_classified() {
        let (correlator, mut wire) = attached();
        let c = Arc::clone(&correlator);
        let handle = tokio::spawn(async move { c.send("Mute", json!({}), CommandMode::Sync).await });
        let id = sent_id(&wire.recv().await.unwrap());
        correlator.resolve(id, Err(RemoteError::new("too frequent", Some(416))));
        assert!(handle.await.unwrap().unwrap_err().is_rate_limited());
    }

    #[tokio::test]
    async fn fail_all_resolves_every_pending_command() {
        let (correlator, mut wire) = attached();
        let mut handles = Vec::new();
        for i in 0..4 {
            let c = Arc::clone(&correlator);
            handles.push(tokio::spawn(async move {
                c.send(&format!("M{i}"), json!({}), CommandMode::AwaitAsync).await
            }));
            let _ = wire.recv().await.unwrap();
        }
        assert_eq!(correlator.pending_count(), 4);

        correlator.detach();
        assert_eq!(correlator.fail_all(BridgeError::ConnectionLost), 4);
        for handle in handles {
            assert!(matches!(handle.await.unwrap(), Err(BridgeError::ConnectionLost)));
        }
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn cancelled_caller_does_not_leak_entry() {
        let (correlator, mut wire) = attached();
        let c = Arc::clone(&correlator);
        let handle = tokio::spawn(async move { c.send("Hang", json!({}), CommandMode::AwaitAsync).await });
        let _ = wire.recv().await.unwrap();
        assert_eq!(correlator.pending_count(), 1);
        handle.abort();
        let _ = handle.await;
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn closed_writer_reports_connection_lost() {
        let (correlator, wire) = attached();
        drop(wire);
        let err = correlator.send("X", json!({}), CommandMode::Sync).await.unwrap_err();
        assert!(matches!(err, BridgeError::ConnectionLost));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn evaluation_unwraps_value_and_exceptions() {
        let ok = unwrap_evaluation(json!({"result": {"type": "string", "value": "[1,2]"}})).unwrap();
        assert_eq!(ok, json!([1, 2]));

        let plain = unwrap_evaluation(json!({"result": {"type": "string", "value": "SUCCESS"}})).unwrap();
        assert_eq!(plain, json!("SUCCESS"));

        let thrown = unwrap_evaluation(json!({
            "result": {"type": "object"},
            "exceptionDetails": {"text": "Uncaught", "exception": {"description": "ReferenceError: nim is not defined"}}
        }))
        .unwrap_err();
        assert!(matches!(thrown, BridgeError::Remote(r) if r.message.contains("ReferenceError")));
    }

    #[test]
    fn evaluation_params_follow_mode() {
        assert_eq!(evaluation_params("1", CommandMode::Sync)["awaitPromise"], json!(false));
        assert_eq!(evaluation_params("1", CommandMode::AwaitAsync)["awaitPromise"], json!(true));
    }
}
