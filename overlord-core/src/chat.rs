//! Chat adapter: outbound posting port plus the inbound event model.
//!
//! Outbound goes through [`ChatPort`] so the orchestrator never knows which
//! platform is behind it. [`SlackChat`] talks to the Slack Web API
//! (`chat.postMessage` returns the `ts` we use as the thread ref;
//! `conversations.replies` reads a thread back). Post failures are logged
//! and swallowed; a lost notification must never take down a worker.
//!
//! Inbound events arrive through the reporter endpoint's webhook route and
//! are normalised into [`ChatEvent`] before the orchestrator sees them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

/// A single human-authored message in a thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub user: String,
    pub text: String,
}

/// Outbound chat operations.
#[async_trait]
pub trait ChatPort: Send + Sync {
    /// Post a message, optionally into a thread. Returns the platform's
    /// thread ref for the new message, or `None` when posting failed
    /// (failure is logged by the implementation, never raised).
    async fn post(&self, text: &str, thread_ref: Option<&str>) -> Option<String>;

    /// Post a clarification request for a blocked minion and return the
    /// thread ref humans will reply under.
    async fn post_question(
        &self,
        minion_id: &str,
        issue_number: u64,
        text: &str,
        timeout_minutes: u64,
    ) -> Option<String> {
        let body = format!(
            "Minion `{minion_id}` needs input on #{issue_number}:\n\
             > {text}\n\
             Reply in this thread within {timeout_minutes} minutes.",
        );
        self.post(&body, None).await
    }

    /// Human-authored replies under a thread, oldest first.
    async fn thread_history(&self, thread_ref: &str) -> Vec<ChatMessage>;
}

/// Inbound chat events, already normalised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// A message in some channel. Only honoured in the configured channel.
    ChannelMessage {
        channel: String,
        user: String,
        text: String,
        from_bot: bool,
    },
    /// The bot was mentioned; honoured anywhere.
    Mention {
        user: String,
        text: String,
        from_bot: bool,
    },
    /// A reply whose parent thread may match a pending question.
    ThreadReply {
        thread_ref: String,
        user: String,
        text: String,
        from_bot: bool,
    },
}

/// Normalise an Events-API style `event_callback` payload.
///
/// Returns `None` for event shapes the Overlord has no use for.
pub fn chat_event_from_payload(payload: &Value) -> Option<ChatEvent> {
    let event = payload.get("event")?;
    let text = event.get("text")?.as_str()?.trim().to_string();
    let user = event
        .get("user")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let from_bot = event.get("bot_id").is_some()
        || event.get("subtype").and_then(Value::as_str) == Some("bot_message");

    match event.get("type").and_then(Value::as_str)? {
        "app_mention" => Some(ChatEvent::Mention {
            user,
            text: strip_mention(&text),
            from_bot,
        }),
        "message" => {
            let ts = event.get("ts").and_then(Value::as_str);
            let thread_ts = event.get("thread_ts").and_then(Value::as_str);
            match thread_ts {
                // A reply inside a thread (parent ts differs from our own).
                Some(parent) if Some(parent) != ts => Some(ChatEvent::ThreadReply {
                    thread_ref: parent.to_string(),
                    user,
                    text,
                    from_bot,
                }),
                _ => Some(ChatEvent::ChannelMessage {
                    channel: event
                        .get("channel")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    user,
                    text,
                    from_bot,
                }),
            }
        }
        _ => None,
    }
}

/// Drop a leading `<@U123>` mention token.
fn strip_mention(text: &str) -> String {
    let trimmed = text.trim_start();
    if trimmed.starts_with("<@") {
        if let Some(end) = trimmed.find('>') {
            return trimmed[end + 1..].trim().to_string();
        }
    }
    trimmed.to_string()
}

/// Slack Web API adapter.
pub struct SlackChat {
    client: reqwest::Client,
    api_base: String,
    bot_token: String,
    channel: String,
}

impl SlackChat {
    pub fn new(bot_token: impl Into<String>, channel: impl Into<String>) -> Self {
        Self::with_api_base("https://slack.com/api", bot_token, channel)
    }

    /// Point the adapter at a different API base (test servers).
    pub fn with_api_base(
        api_base: impl Into<String>,
        bot_token: impl Into<String>,
        channel: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_base: api_base.into(),
            bot_token: bot_token.into(),
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl ChatPort for SlackChat {
    async fn post(&self, text: &str, thread_ref: Option<&str>) -> Option<String> {
        let mut body = json!({ "channel": self.channel, "text": text });
        if let Some(ts) = thread_ref {
            body["thread_ts"] = json!(ts);
        }

        let sent = self
            .client
            .post(format!("{}/chat.postMessage", self.api_base))
            .bearer_auth(&self.bot_token)
            .json(&body)
            .send()
            .await;

        let value: Value = match sent {
            Ok(resp) => match resp.json().await {
                Ok(v) => v,
                Err(e) => {
                    warn!("chat post returned unreadable body: {e}");
                    return None;
                }
            },
            Err(e) => {
                warn!("chat post failed: {e}");
                return None;
            }
        };

        if value.get("ok").and_then(Value::as_bool) != Some(true) {
            warn!(
                "chat post rejected: {}",
                value.get("error").and_then(serde_json::Value::as_str).unwrap_or("?")
            );
            return None;
        }
        value
            .get("ts")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    async fn thread_history(&self, thread_ref: &str) -> Vec<ChatMessage> {
        let sent = self
            .client
            .get(format!("{}/conversations.replies", self.api_base))
            .bearer_auth(&self.bot_token)
            .query(&[("channel", self.channel.as_str()), ("ts", thread_ref)])
            .send()
            .await;

        let value: Value = match sent {
            Ok(resp) => match resp.json().await {
                Ok(v) => v,
                Err(e) => {
                    warn!("thread history unreadable: {e}");
                    return Vec::new();
                }
            },
            Err(e) => {
                warn!("thread history fetch failed: {e}");
                return Vec::new();
            }
        };

        let Some(messages) = value.get("messages").and_then(Value::as_array) else {
            return Vec::new();
        };
        messages
            .iter()
            .filter(|m| m.get("ts").and_then(Value::as_str) != Some(thread_ref))
            .filter(|m| m.get("bot_id").is_none())
            .filter_map(|m| {
                Some(ChatMessage {
                    user: m.get("user")?.as_str()?.to_string(),
                    text: m.get("text")?.as_str()?.to_string(),
                })
            })
            .collect()
    }
}

/// Chat disabled: posts nothing, returns no thread refs.
pub struct NoopChat;

#[async_trait]
impl ChatPort for NoopChat {
    async fn post(&self, text: &str, _thread_ref: Option<&str>) -> Option<String> {
        debug!("chat disabled, dropping message: {}", text.lines().next().unwrap_or(""));
        None
    }

    async fn thread_history(&self, _thread_ref: &str) -> Vec<ChatMessage> {
        Vec::new()
    }
}

/// In-memory chat double for tests and stub mode: records every post and
/// hands out deterministic thread refs.
#[derive(Default)]
pub struct StubChat {
    posts: Mutex<Vec<PostedMessage>>,
    next_ts: AtomicU64,
    histories: Mutex<HashMap<String, Vec<ChatMessage>>>,
}

/// One recorded outbound post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedMessage {
    pub text: String,
    pub thread_ref: Option<String>,
}

impl StubChat {
    pub fn new() -> Self {
        Self::default()
    }

    /// All posts recorded so far.
    pub fn posts(&self) -> Vec<PostedMessage> {
        self.posts.lock().expect("stub chat lock").clone()
    }

    /// Preload replies returned by `thread_history` for a thread.
    pub fn set_thread_history(&self, thread_ref: &str, messages: Vec<ChatMessage>) {
        self.histories
            .lock()
            .expect("stub chat lock")
            .insert(thread_ref.to_string(), messages);
    }
}

#[async_trait]
impl ChatPort for StubChat {
    async fn post(&self, text: &str, thread_ref: Option<&str>) -> Option<String> {
        self.posts.lock().expect("stub chat lock").push(PostedMessage {
            text: text.to_string(),
            thread_ref: thread_ref.map(str::to_string),
        });
        let n = self.next_ts.fetch_add(1, Ordering::SeqCst);
        Some(format!("ts-{n}"))
    }

    async fn thread_history(&self, thread_ref: &str) -> Vec<ChatMessage> {
        self.histories
            .lock()
            .expect("stub chat lock")
            .get(thread_ref)
            .cloned()
            .unwrap_or_default()
    }
}
