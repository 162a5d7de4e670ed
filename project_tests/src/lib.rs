//! # Fake Host
//!
//! A local WebSocket server standing in for the host application's debugging
//! socket. Each command frame is recorded and answered by a caller-supplied
//! responder; tests can also push unsolicited frames and drop the connection.
//! Connections are served one at a time, so a reconnect lands on the same host.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};

/// Produces the full reply frame for a command, or `None` to stay silent.
pub type Responder = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

enum Control {
    Send(String),
    Close,
}

/// # Fake Host
pub struct FakeHost {
    url: String,
    commands: Mutex<mpsc::UnboundedReceiver<Value>>,
    control: mpsc::UnboundedSender<Control>,
    connections: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl FakeHost {
    /// Binds an ephemeral port and starts serving.
    pub async fn start(responder: Responder) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake host");
        let addr = listener.local_addr().expect("fake host address");
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let connections = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&connections);
        let task = tokio::spawn(async move {
            let mut control_rx = control_rx;
            while let Ok((stream, _)) = listener.accept().await {
                let ws = match accept_async(stream).await {
                    Ok(ws) => ws,
                    Err(e) => {
                        log::warn!("Fake host handshake failed: {}", e);
                        continue;
                    }
                };
                counter.fetch_add(1, Ordering::SeqCst);
                serve(ws, &responder, &commands_tx, &mut control_rx).await;
            }
        });

        Self {
            url: format!("ws://{addr}/devtools/page/FAKE"),
            commands: Mutex::new(commands_rx),
            control: control_tx,
            connections,
            task,
        }
    }

    /// A host that never answers.
    pub async fn silent() -> Self {
        Self::start(Arc::new(|_| None)).await
    }

    /// Target URL to connect to.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Sends an unsolicited frame on the current connection.
    pub fn push(&self, frame: Value) {
        let _ = self.control.send(Control::Send(frame.to_string()));
    }

    /// Closes the current connection from the host side.
    pub fn drop_connection(&self) {
        let _ = self.control.send(Control::Close);
    }

    /// Next command the host received; panics after five seconds.
    pub async fn next_command(&self) -> Value {
        let mut commands = self.commands.lock().await;
        tokio::time::timeout(Duration::from_secs(5), commands.recv())
            .await
            .expect("no command within 5s")
            .expect("fake host stopped")
    }
}

impl Drop for FakeHost {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    ws: WebSocketStream<TcpStream>,
    responder: &Responder,
    commands: &mpsc::UnboundedSender<Value>,
    control: &mut mpsc::UnboundedReceiver<Control>,
) {
    let (mut write, mut read) = ws.split();
    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let Ok(command) = serde_json::from_str::<Value>(text.as_str()) else { continue };
                    let reply = responder(&command);
                    let _ = commands.send(command);
                    if let Some(reply) = reply {
                        if write.send(Message::Text(reply.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            ctl = control.recv() => match ctl {
                Some(Control::Send(text)) => {
                    if write.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(Control::Close) | None => {
                    let _ = write.close().await;
                    break;
                }
            },
        }
    }
}

/// Command id of a recorded frame.
pub fn command_id(command: &Value) -> u64 {
    command["id"].as_u64().expect("command without id")
}

/// Script text of a `Runtime.evaluate` command, if it is one.
pub fn expression(command: &Value) -> Option<&str> {
    if command["method"] != "Runtime.evaluate" {
        return None;
    }
    command.pointer("/params/expression").and_then(Value::as_str)
}

/// Successful reply carrying `result`.
pub fn reply(command: &Value, result: Value) -> Value {
    json!({"id": command_id(command), "result": result})
}

/// Evaluation reply whose script returned `value` through `JSON.stringify`.
pub fn script_reply(command: &Value, value: &Value) -> Value {
    reply(command, json!({"result": {"type": "string", "value": value.to_string()}}))
}

/// Error reply.
pub fn error_reply(command: &Value, message: &str, code: i64) -> Value {
    json!({"id": command_id(command), "error": {"message": message, "code": code}})
}

/// `Runtime.bindingCalled` event carrying `payload` as a JSON string.
pub fn binding_event(binding: &str, payload: &Value) -> Value {
    json!({
        "method": "Runtime.bindingCalled",
        "params": {"name": binding, "payload": payload.to_string(), "executionContextId": 1}
    })
}

/// Polls `check` every 10 ms until it holds; panics after five seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met within 5s");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
