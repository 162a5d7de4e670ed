use std::sync::Arc;
use std::time::Duration;

use lib_hostlink::connections::{ConnectionConfig, ConnectionManager};
use lib_hostlink::core::{Correlator, CorrelatorConfig, DemuxConfig, Demultiplexer};
use lib_hostlink::ingestors::{
    CanonicalMessage, CaptureSource, Direction, IngestionPipeline, PipelineConfig, install_push_hook,
};
use project_tests::{FakeHost, binding_event, eventually, expression, reply, script_reply};
use serde_json::{Value, json};
use tokio::sync::mpsc;

struct Stack {
    manager: Arc<ConnectionManager>,
    pipeline: Arc<IngestionPipeline>,
}

async fn stack(host: &FakeHost, config: PipelineConfig) -> Stack {
    let correlator = Arc::new(Correlator::new(CorrelatorConfig::default()));
    let demux = Arc::new(Demultiplexer::new(DemuxConfig::default(), Arc::clone(&correlator)));
    let pipeline = IngestionPipeline::new(config, Arc::clone(&correlator));
    demux.set_push_sink(pipeline.push_sender());
    let manager = ConnectionManager::new(ConnectionConfig::default(), correlator, demux);
    manager.connect(host.url()).await.unwrap();
    Stack { manager, pipeline }
}

async fn next_message(rx: &mut mpsc::UnboundedReceiver<Arc<CanonicalMessage>>) -> Arc<CanonicalMessage> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no message within 5s")
        .expect("dispatcher closed")
}

fn team_text(from: &str, text: &str, time: i64) -> Value {
    json!({
        "idClient": format!("{from}-{time}"),
        "sessionId": "team-777",
        "from": from,
        "fromNick": format!("nick-{from}"),
        "to": "777",
        "type": "text",
        "text": text,
        "time": time,
        "flow": "in",
    })
}

#[tokio::test]
async fn push_hook_installs_in_order() {
    let host = FakeHost::start(Arc::new(|cmd: &Value| match expression(cmd) {
        Some(_) => Some(script_reply(cmd, &json!("HOOKED"))),
        None => Some(reply(cmd, json!({}))),
    }))
    .await;
    let stack = stack(&host, PipelineConfig::default()).await;

    let status = install_push_hook(stack.manager.correlator().as_ref(), stack.manager.demux().config())
        .await
        .unwrap();
    assert_eq!(status, "HOOKED");

    assert_eq!(host.next_command().await["method"], "Runtime.enable");
    let binding = host.next_command().await;
    assert_eq!(binding["method"], "Runtime.addBinding");
    assert_eq!(binding["params"]["name"], DemuxConfig::default().binding_name);
    let hook = host.next_command().await;
    assert!(expression(&hook).unwrap().contains("onmsg"));
    stack.manager.disconnect();
}

#[tokio::test]
async fn binding_push_reaches_subscribers_once() {
    let host = FakeHost::silent().await;
    let stack = stack(&host, PipelineConfig::default()).await;
    let mut rx = stack.pipeline.subscribe("test");
    stack
        .pipeline
        .start_polling(CaptureSource::Push, Duration::from_millis(20))
        .unwrap();

    let binding = DemuxConfig::default().binding_name;
    let batch = json!([team_text("u1", "hello 开奖", 1_700_000_000_000_i64)]);
    host.push(binding_event(&binding, &batch));

    let message = next_message(&mut rx).await;
    assert_eq!(message.channel, "777");
    assert_eq!(message.sender, "u1");
    assert_eq!(message.sender_name, "nick-u1");
    assert_eq!(message.body, "hello 开奖");
    assert_eq!(message.direction, Direction::Incoming);
    assert_eq!(message.source, CaptureSource::Push);

    // Same message redelivered by the host, plus a new one.
    host.push(binding_event(&binding, &batch));
    host.push(binding_event(&binding, &json!(team_text("u2", "second", 1_700_000_005_000_i64))));
    let second = next_message(&mut rx).await;
    assert_eq!(second.body, "second");

    let pipeline = Arc::clone(&stack.pipeline);
    eventually(|| pipeline.stats().duplicates == 1).await;
    assert_eq!(stack.pipeline.stats().published, 2);
    assert_eq!(stack.manager.demux().stats().pushed, 3);

    stack.pipeline.shutdown();
    stack.manager.disconnect();
}

#[tokio::test]
async fn foreign_bindings_are_ignored() {
    let host = FakeHost::silent().await;
    let stack = stack(&host, PipelineConfig::default()).await;

    host.push(binding_event("someoneElse", &json!([team_text("u1", "x", 1)])));
    host.push(json!({"method": "Page.loadEventFired", "params": {}}));
    let demux = Arc::clone(stack.manager.demux());
    eventually(|| demux.stats().ignored == 2).await;
    assert_eq!(demux.stats().pushed, 0);
    stack.manager.disconnect();
}

/// What the chat-view scrape yields for a bubble without account or time attributes.
fn bare_bubble(text: &str) -> Value {
    json!({ "text": text, "sender": "peer", "senderId": null, "channel": "team-777",
            "time": null, "isSent": false, "index": 0 })
}

#[tokio::test]
async fn structured_scan_suppresses_the_rendered_copy() {
    // The structured scan and the rendered scrape both see the same message;
    // only the structured copy is published.
    let record = team_text("u9", "same message", 1_700_000_100_000_i64);
    let rendered = json!([bare_bubble("same message")]);
    let host = FakeHost::start(Arc::new(move |cmd: &Value| {
        let script = expression(cmd)?;
        if script.contains("getLocalMsgs") {
            Some(script_reply(cmd, &json!({"msgs": [record.clone()]})))
        } else {
            Some(script_reply(cmd, &rendered))
        }
    }))
    .await;
    let config = PipelineConfig {
        scan_channel: Some("777".to_string()),
        fallback_grace: Duration::from_millis(300),
        ..PipelineConfig::default()
    };
    let stack = stack(&host, config).await;
    let mut rx = stack.pipeline.subscribe("test");

    stack
        .pipeline
        .start_polling(CaptureSource::RenderedScan, Duration::from_millis(50))
        .unwrap();
    stack
        .pipeline
        .start_polling(CaptureSource::StructuredScan, Duration::from_millis(50))
        .unwrap();

    let message = next_message(&mut rx).await;
    assert_eq!(message.source, CaptureSource::StructuredScan);
    assert_eq!(message.body, "same message");

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(rx.try_recv().is_err());
    let stats = stack.pipeline.stats();
    assert_eq!(stats.published, 1);
    assert!(stats.fallback_suppressed + stats.duplicates >= 1);

    stack.pipeline.shutdown();
    stack.manager.disconnect();
}

#[tokio::test]
async fn repeated_scrapes_of_one_bubble_publish_once() {
    let host = FakeHost::start(Arc::new(|cmd: &Value| {
        expression(cmd)?;
        Some(script_reply(cmd, &json!([bare_bubble("押大 100"), bare_bubble("押小 50")])))
    }))
    .await;
    let config = PipelineConfig {
        fallback_grace: Duration::from_millis(100),
        ..PipelineConfig::default()
    };
    let stack = stack(&host, config).await;
    let mut rx = stack.pipeline.subscribe("test");

    stack
        .pipeline
        .start_polling(CaptureSource::RenderedScan, Duration::from_millis(40))
        .unwrap();

    let first = next_message(&mut rx).await;
    let second = next_message(&mut rx).await;
    assert_eq!((first.body.as_str(), second.body.as_str()), ("押大 100", "押小 50"));
    assert_eq!(first.channel, "777");
    assert_eq!(first.sender_name, "peer");

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(rx.try_recv().is_err());
    let stats = stack.pipeline.stats();
    assert_eq!(stats.published, 2);
    assert!(stats.duplicates >= 2);

    stack.pipeline.shutdown();
    stack.manager.disconnect();
}
