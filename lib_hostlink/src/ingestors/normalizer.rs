//! # Normalizer
//!
//! Tolerant decoding of raw records into [`CanonicalMessage`]s.
//!
//! Structured records (push hook, local-store scan) follow the host's message
//! object: `{idClient, from, fromNick, to, sessionId, scene, type, text,
//! content, attach, custom, time, flow}`. Rendered records come from scraping
//! the chat view: `{text, sender, senderId, isSent, channel, time}`.
//!
//! Every decoded message gets a dedup key derived from its content, so the same
//! event seen by two sources collapses to one key:
//!
//! `sha256("{time bucket}|{channel}|{sender id}|{first N chars of body}")`
//! truncated to 32 hex chars.
//!
//! A scraped record only gets that key when it carries both a real account id
//! and its own timestamp. Otherwise it is keyed by channel and body prefix
//! alone (the content key), so re-scraping the same bubble on a later tick
//! yields the same key whatever the clock says.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::error::{BridgeError, BridgeResult};
use crate::ingestors::capture::{CanonicalMessage, CaptureSource, Direction, MessageKind, RawCapture};
use crate::utils::{datetime_from_epoch, sha256_hex};

/// Bytes of binary header in front of the text of a type-100 custom envelope.
const ENVELOPE_HEADER_LEN: usize = 16;
/// Hex characters kept from the SHA-256 digest.
const DEDUP_KEY_LEN: usize = 32;
/// Sender labels the chat view shows when a bubble carries no account id.
const PLACEHOLDER_SENDERS: [&str; 4] = ["self", "peer", "我", "未知"];

/// Tuning for key derivation and channel fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizerConfig {
    /// Width of the time bucket in the dedup key.
    pub bucket_secs: i64,
    /// Body characters that take part in the dedup key.
    pub key_prefix_chars: usize,
    /// Channel assumed for rendered records that do not name one.
    pub default_channel: Option<String>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            bucket_secs: 60,
            key_prefix_chars: 32,
            default_channel: None,
        }
    }
}

/// Result of decoding one capture.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Ready to deduplicate and publish.
    Message(CanonicalMessage),
    /// Structured decoding failed but the record carries a rendered form; it
    /// must go through the text-scrape path instead.
    Demoted(RawCapture),
    /// Nothing usable.
    Dropped(String),
}

/// # Normalizer
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    config: NormalizerConfig,
}

impl Normalizer {
    /// Creates a normalizer.
    pub fn new(config: NormalizerConfig) -> Self {
        Self { config }
    }

    /// Settings in use.
    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    /// Decodes one capture according to its source.
    pub fn decode(&self, capture: &RawCapture) -> Decoded {
        if is_empty_payload(&capture.raw_payload) {
            return Decoded::Dropped("empty capture".to_string());
        }
        match capture.source {
            CaptureSource::Push | CaptureSource::StructuredScan => match self.decode_structured(capture) {
                Ok(message) => Decoded::Message(message),
                Err(e) => match rendered_form(&capture.raw_payload) {
                    Some(rendered) => {
                        log::debug!("Demoting {} capture to the text path: {}", capture.source, e);
                        Decoded::Demoted(RawCapture {
                            source: CaptureSource::RenderedScan,
                            raw_payload: rendered,
                            captured_at: capture.captured_at,
                        })
                    }
                    None => Decoded::Dropped(e.to_string()),
                },
            },
            CaptureSource::RenderedScan => match self.decode_rendered(capture) {
                Ok(message) => Decoded::Message(message),
                Err(e) => Decoded::Dropped(e.to_string()),
            },
        }
    }

    /// Dedup key for a message's identifying fields.
    pub fn dedup_key(&self, sent_at: DateTime<Utc>, channel: &str, sender: &str, body: &str) -> String {
        let bucket = sent_at.timestamp().div_euclid(self.config.bucket_secs.max(1));
        let prefix = self.body_prefix(body);
        sha256_hex(&format!("{bucket}|{channel}|{sender}|{prefix}"), DEDUP_KEY_LEN)
    }

    /// Time- and sender-independent key: channel plus body prefix. Scraped
    /// records lacking an account id or a timestamp are keyed by it, and the
    /// pipeline uses it to match scrapes against messages already published.
    pub fn content_key(&self, channel: &str, body: &str) -> String {
        let prefix = self.body_prefix(body);
        sha256_hex(&format!("*|{channel}|*|{prefix}"), DEDUP_KEY_LEN)
    }

    fn body_prefix(&self, body: &str) -> String {
        body.trim().chars().take(self.config.key_prefix_chars).collect()
    }

    fn decode_structured(&self, capture: &RawCapture) -> BridgeResult<CanonicalMessage> {
        let record = capture
            .raw_payload
            .as_object()
            .ok_or_else(|| BridgeError::Decode("structured record is not an object".to_string()))?;

        let sender = string_field(record, &["from"])
            .ok_or_else(|| BridgeError::Decode("record has no sender".to_string()))?;
        let channel = structured_channel(record)
            .ok_or_else(|| BridgeError::Decode("record has no channel".to_string()))?;
        let body = structured_body(record)
            .ok_or_else(|| BridgeError::Decode(format!("no decodable body from {sender}")))?;

        let kind = match record.get("type") {
            None => MessageKind::Text,
            Some(Value::Number(n)) if n.as_i64() == Some(100) => MessageKind::Structured,
            Some(Value::String(t)) => match t.as_str() {
                "text" => MessageKind::Text,
                "notification" | "tip" => MessageKind::System,
                _ => MessageKind::Structured,
            },
            Some(_) => MessageKind::Structured,
        };

        let outgoing = record.get("flow").and_then(Value::as_str) == Some("out")
            || record.get("isSelf").and_then(Value::as_bool) == Some(true);

        let sent_at = record
            .get("time")
            .and_then(value_as_i64)
            .and_then(datetime_from_epoch)
            .unwrap_or(capture.captured_at);

        let sender_name = string_field(record, &["fromNick"]).unwrap_or_else(|| sender.clone());

        Ok(CanonicalMessage {
            dedup_key: self.dedup_key(sent_at, &channel, &sender, &body),
            channel,
            sender,
            sender_name,
            direction: if outgoing { Direction::Outgoing } else { Direction::Incoming },
            kind,
            body,
            sent_at,
            captured_at: capture.captured_at,
            source: capture.source,
        })
    }

    fn decode_rendered(&self, capture: &RawCapture) -> BridgeResult<CanonicalMessage> {
        let record = capture
            .raw_payload
            .as_object()
            .ok_or_else(|| BridgeError::Decode("rendered record is not an object".to_string()))?;

        let body = string_field(record, &["text"])
            .ok_or_else(|| BridgeError::Decode("rendered record has no text".to_string()))?;
        let sender_id = string_field(record, &["senderId"]).filter(|id| !is_placeholder_sender(id));
        let sender = sender_id
            .clone()
            .or_else(|| string_field(record, &["sender"]))
            .ok_or_else(|| BridgeError::Decode("rendered record has no sender".to_string()))?;
        let channel = string_field(record, &["channel"])
            .map(|c| strip_session_prefix(&c).to_string())
            .or_else(|| self.config.default_channel.clone())
            .ok_or_else(|| BridgeError::Decode("rendered record has no channel".to_string()))?;

        let stamped = record.get("time").and_then(value_as_i64).and_then(datetime_from_epoch);
        let dedup_key = match (&sender_id, stamped) {
            (Some(id), Some(sent_at)) => self.dedup_key(sent_at, &channel, id, &body),
            _ => self.content_key(&channel, &body),
        };
        let sent_at = stamped.unwrap_or(capture.captured_at);
        let outgoing = record.get("isSent").and_then(Value::as_bool).unwrap_or(false);
        let sender_name = string_field(record, &["sender"]).unwrap_or_else(|| sender.clone());

        Ok(CanonicalMessage {
            dedup_key,
            channel,
            sender,
            sender_name,
            direction: if outgoing { Direction::Outgoing } else { Direction::Incoming },
            kind: MessageKind::Text,
            body,
            sent_at,
            captured_at: capture.captured_at,
            source: capture.source,
        })
    }
}

/// Splits a payload into individual records.
///
/// Accepts a single record, an array of records, an object wrapping the array
/// in `msgs` or `messages`, or any of those serialized into a string.
pub fn split_records(payload: Value) -> Vec<Value> {
    match payload {
        Value::Array(items) => items.into_iter().filter(|v| !is_empty_payload(v)).collect(),
        Value::Object(mut map) => {
            for key in ["msgs", "messages"] {
                if let Some(Value::Array(items)) = map.remove(key) {
                    return items.into_iter().filter(|v| !is_empty_payload(v)).collect();
                }
            }
            if map.is_empty() { Vec::new() } else { vec![Value::Object(map)] }
        }
        Value::String(text) => match serde_json::from_str::<Value>(&text) {
            Ok(parsed @ (Value::Array(_) | Value::Object(_))) => split_records(parsed),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

/// Text carried by a type-100 custom envelope.
///
/// `attach.b` is URL-safe base64 over a fixed binary header followed by UTF-8
/// text. Only printable ASCII and CJK characters are kept from the tail.
pub fn decode_custom_envelope(encoded: &str) -> Option<String> {
    // Some builds emit the standard alphabet; fold it into the URL-safe one.
    let cleaned = encoded.trim().trim_end_matches('=').replace('+', "-").replace('/', "_");
    let bytes = URL_SAFE_NO_PAD.decode(cleaned).ok()?;
    let tail = bytes.get(ENVELOPE_HEADER_LEN..)?;
    let text: String = String::from_utf8_lossy(tail)
        .chars()
        .filter(|c| is_printable_ascii(*c) || is_cjk(*c))
        .collect();
    let text = text.trim().to_string();
    if text.is_empty() { None } else { Some(text) }
}

fn is_printable_ascii(c: char) -> bool {
    (' '..='~').contains(&c)
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}'
        | '\u{3400}'..='\u{4DBF}'
        | '\u{3000}'..='\u{303F}'
        | '\u{FF00}'..='\u{FFEF}')
}

fn is_empty_payload(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn structured_channel(record: &Map<String, Value>) -> Option<String> {
    string_field(record, &["sessionId", "target"])
        .map(|s| strip_session_prefix(&s).to_string())
        .or_else(|| string_field(record, &["to"]))
}

fn strip_session_prefix(session: &str) -> &str {
    session
        .strip_prefix("team-")
        .or_else(|| session.strip_prefix("p2p-"))
        .unwrap_or(session)
}

fn structured_body(record: &Map<String, Value>) -> Option<String> {
    if let Some(text) = string_field(record, &["text", "content"]) {
        return Some(text);
    }
    let attach = match record.get("attach") {
        Some(Value::String(raw)) => serde_json::from_str::<Value>(raw).ok(),
        Some(other) => Some(other.clone()),
        None => None,
    };
    if let Some(decoded) = attach
        .as_ref()
        .and_then(|a| a.get("b"))
        .and_then(Value::as_str)
        .and_then(decode_custom_envelope)
    {
        return Some(decoded);
    }
    let custom = match record.get("custom") {
        Some(Value::String(raw)) => serde_json::from_str::<Value>(raw).ok(),
        Some(other) => Some(other.clone()),
        None => None,
    };
    custom
        .as_ref()
        .and_then(|c| c.get("content"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// A rendered-form record embedded in a structured one, if any.
fn rendered_form(payload: &Value) -> Option<Value> {
    let record = payload.as_object()?;
    if let Some(rendered @ Value::Object(_)) = record.get("rendered") {
        return Some(rendered.clone());
    }
    let text = string_field(record, &["displayText"])?;
    let mut rendered = Map::new();
    rendered.insert("text".to_string(), Value::String(text));
    if let Some(sender) = string_field(record, &["from"]) {
        rendered.insert("senderId".to_string(), Value::String(sender));
    }
    if let Some(nick) = string_field(record, &["fromNick"]) {
        rendered.insert("sender".to_string(), Value::String(nick));
    }
    if let Some(channel) = structured_channel(record) {
        rendered.insert("channel".to_string(), Value::String(channel));
    }
    if let Some(time) = record.get("time") {
        rendered.insert("time".to_string(), time.clone());
    }
    if record.get("flow").and_then(Value::as_str) == Some("out") {
        rendered.insert("isSent".to_string(), Value::Bool(true));
    }
    Some(Value::Object(rendered))
}

/// First non-blank string (or number, stringified) among `keys`.
fn string_field(record: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match record.get(*key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn is_placeholder_sender(label: &str) -> bool {
    PLACEHOLDER_SENDERS.contains(&label)
}

fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
