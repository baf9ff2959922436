//! Streaming client for the external agent runtime
//!
//! One exchange opens one socket, sends one prompt and collects streamed
//! `response` chunks until the runtime signals completion. The runtime gives
//! no reliable end-of-turn signal, so completion is also inferred from
//! inactivity, with an absolute ceiling on top.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, instrument, warn};
use triad_core::config::AgentConfig;
use triad_core::{Result, ToolDispatcher, TriadError};
use uuid::Uuid;

use crate::allowlist::ToolAllowlist;
use crate::events::{
    is_prompt_too_large, InboundEvent, InboundFrame, OutboundMessage, ToolResponseFrame,
    PROMPT_TOO_LARGE_ADVISORY,
};

/// How an exchange ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeEnd {
    Completed,
    Cancelled,
    Closed,
    Inactive,
    MaxWait,
    PromptTooLarge,
    RemoteError,
    SocketError,
}

/// Per-base-session single-flight guard
///
/// Each base session name owns one async mutex; an exchange holds it for its
/// whole lifetime and bumps the generation counter. A slot nobody holds or
/// waits on is dropped when its exchange ends, so the generation counts
/// exchanges since the base was last idle.
#[derive(Default)]
struct SessionGuard {
    slots: std::sync::Mutex<HashMap<String, Arc<Mutex<u64>>>>,
}

impl SessionGuard {
    fn with_slots<R>(&self, f: impl FnOnce(&mut HashMap<String, Arc<Mutex<u64>>>) -> R) -> R {
        match self.slots.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Wait for `base`'s slot and bump its generation
    async fn acquire(&self, base: &str) -> SlotLease<'_> {
        let slot = self.with_slots(|slots| slots.entry(base.to_string()).or_default().clone());
        let mut held = slot.clone().lock_owned().await;
        *held += 1;
        SlotLease {
            sessions: self,
            base: base.to_string(),
            slot,
            held: Some(held),
        }
    }

    /// Drop `base`'s slot if the caller's handle is the only one left
    fn release(&self, base: &str, slot: &Arc<Mutex<u64>>) {
        self.with_slots(|slots| {
            let idle = slots.get(base).is_some_and(|current| {
                Arc::ptr_eq(current, slot) && Arc::strong_count(slot) == 2 && slot.try_lock().is_ok()
            });
            if idle {
                slots.remove(base);
            }
        });
    }

    fn len(&self) -> usize {
        self.with_slots(|slots| slots.len())
    }
}

/// One exchange's hold on a session slot, released on drop
struct SlotLease<'a> {
    sessions: &'a SessionGuard,
    base: String,
    slot: Arc<Mutex<u64>>,
    held: Option<OwnedMutexGuard<u64>>,
}

impl SlotLease<'_> {
    fn generation(&self) -> u64 {
        self.held.as_deref().copied().unwrap_or_default()
    }
}

impl Drop for SlotLease<'_> {
    fn drop(&mut self) {
        // Unlock first so the slot reads as idle
        self.held.take();
        self.sessions.release(&self.base, &self.slot);
    }
}

/// Client for the agent runtime's streaming socket
pub struct AgentTransport {
    config: AgentConfig,
    url: String,
    allowlist: ToolAllowlist,
    dispatcher: Option<Arc<dyn ToolDispatcher>>,
    sessions: SessionGuard,
}

impl AgentTransport {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            url: ws_url(&config.url),
            allowlist: ToolAllowlist::from_config(&config),
            config,
            dispatcher: None,
            sessions: SessionGuard::default(),
        }
    }

    /// Attach a dispatcher used for allowed tools when dispatch is enabled
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn ToolDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Run one exchange under the configured base session name
    pub async fn exchange(&self, prompt: &str) -> Result<Option<String>> {
        let base = self.config.session_base.clone();
        self.exchange_in(&base, prompt).await
    }

    /// Run one exchange under `base`
    ///
    /// Returns the collected text (`None` when nothing was collected or the
    /// runtime reported an error). Inactivity and the absolute ceiling resolve
    /// with whatever was collected. Only a failure to connect is an `Err`.
    pub async fn exchange_in(&self, base: &str, prompt: &str) -> Result<Option<String>> {
        let lease = self.sessions.acquire(base).await;

        let session_id = format!(
            "{}_{}_{}",
            base,
            chrono::Utc::now().timestamp_millis(),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let (end, text) = self
            .run_exchange(&session_id, lease.generation(), prompt)
            .await?;
        debug!(session_id = %session_id, ?end, "Exchange finished");
        Ok(text)
    }

    #[instrument(skip(self, prompt), fields(url = %self.url))]
    async fn run_exchange(
        &self,
        session_id: &str,
        generation: u64,
        prompt: &str,
    ) -> Result<(ExchangeEnd, Option<String>)> {
        let connect = tokio_tungstenite::connect_async(self.url.as_str());
        let (ws, _) = tokio::time::timeout(self.config.max_inactivity(), connect)
            .await
            .map_err(|_| TriadError::Transport(format!("connect to {} timed out", self.url)))?
            .map_err(|e| TriadError::Transport(format!("connect to {} failed: {}", self.url, e)))?;
        info!(session_id = %session_id, generation, "Agent session connected");

        let (mut write, mut read) = ws.split();

        let content = truncate_prompt(prompt, self.config.max_prompt_chars);
        let payload = serde_json::to_string(&OutboundMessage::new(
            content,
            session_id.to_string(),
        ))?;
        if let Err(e) = write.send(Message::Text(payload)).await {
            warn!(session_id = %session_id, "Failed to send prompt: {}", e);
            return Ok((ExchangeEnd::SocketError, None));
        }

        let started = Instant::now();
        let mut last_activity = Instant::now();
        let mut collected = String::new();
        let mut poll = tokio::time::interval(self.config.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let end = loop {
            tokio::select! {
                frame = read.next() => {
                    let message = match frame {
                        None => break ExchangeEnd::Closed,
                        Some(Err(e)) => {
                            warn!(session_id = %session_id, "Agent socket error: {}", e);
                            break ExchangeEnd::SocketError;
                        }
                        Some(Ok(message)) => message,
                    };
                    last_activity = Instant::now();

                    let text = match message {
                        Message::Text(text) => text,
                        Message::Binary(bytes) => match String::from_utf8(bytes) {
                            Ok(text) => text,
                            Err(_) => continue,
                        },
                        Message::Close(_) => break ExchangeEnd::Closed,
                        _ => continue,
                    };

                    let Some(frame) = InboundFrame::parse(&text) else {
                        debug!(session_id = %session_id, "Ignoring non-JSON frame");
                        continue;
                    };
                    if let Some(other) = frame.session_id.as_deref() {
                        if other != session_id {
                            debug!(session_id = %session_id, other, "Ignoring frame for another session");
                            continue;
                        }
                    }

                    match frame.event {
                        InboundEvent::Response { content } => collected.push_str(&content),
                        InboundEvent::ToolRequest { tool_name, tool_call_id, arguments } => {
                            let reply = self.answer_tool_request(&tool_name, tool_call_id, arguments).await;
                            let body = serde_json::to_string(&reply)?;
                            if let Err(e) = write.send(Message::Text(body)).await {
                                warn!(session_id = %session_id, "Failed to send tool response: {}", e);
                                break ExchangeEnd::SocketError;
                            }
                            last_activity = Instant::now();
                        }
                        InboundEvent::ToolResponse { tool_call_id } => {
                            debug!(session_id = %session_id, ?tool_call_id, "Tool response echoed");
                        }
                        InboundEvent::Complete => break ExchangeEnd::Completed,
                        InboundEvent::Cancelled => break ExchangeEnd::Cancelled,
                        InboundEvent::Error { message } => {
                            warn!(session_id = %session_id, "Agent reported error: {}", message);
                            if is_prompt_too_large(&message) {
                                break ExchangeEnd::PromptTooLarge;
                            }
                            break ExchangeEnd::RemoteError;
                        }
                        InboundEvent::Unknown { kind } => {
                            debug!(session_id = %session_id, kind = %kind, "Ignoring unknown event");
                        }
                    }
                }
                _ = poll.tick() => {
                    if last_activity.elapsed() > self.config.max_inactivity() {
                        warn!(
                            session_id = %session_id,
                            idle_secs = last_activity.elapsed().as_secs(),
                            "No activity, closing agent session"
                        );
                        break ExchangeEnd::Inactive;
                    }
                    if started.elapsed() > self.config.max_wait() {
                        warn!(
                            session_id = %session_id,
                            max_wait_secs = self.config.max_wait().as_secs(),
                            "Max wait exceeded, closing agent session"
                        );
                        break ExchangeEnd::MaxWait;
                    }
                }
            }
        };

        // Best effort; the peer may already be gone.
        let _ = tokio::time::timeout(Duration::from_secs(1), write.close()).await;

        let text = match end {
            ExchangeEnd::PromptTooLarge => Some(PROMPT_TOO_LARGE_ADVISORY.to_string()),
            ExchangeEnd::RemoteError | ExchangeEnd::SocketError => None,
            _ => {
                let trimmed = collected.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
        };
        info!(
            session_id = %session_id,
            ?end,
            chars = text.as_ref().map(|t| t.len()).unwrap_or(0),
            "Agent session closed"
        );
        Ok((end, text))
    }

    async fn answer_tool_request(
        &self,
        tool_name: &str,
        tool_call_id: String,
        arguments: Value,
    ) -> ToolResponseFrame {
        if !self.allowlist.is_allowed(tool_name) {
            warn!(tool = %tool_name, "Agent requested a tool outside the allowlist");
            return ToolResponseFrame::new(
                tool_call_id,
                format!(
                    "Tool {} is not available. Available: computercontroller, developer, playwright browser tools.",
                    tool_name
                ),
                false,
            );
        }

        match (&self.dispatcher, self.config.dispatch_allowed_tools) {
            (Some(dispatcher), true) => match dispatcher.dispatch(tool_name, arguments).await {
                Ok(Value::String(text)) => ToolResponseFrame::new(tool_call_id, text, true),
                Ok(value) => ToolResponseFrame::new(tool_call_id, value.to_string(), true),
                Err(e) => ToolResponseFrame::new(tool_call_id, e.to_string(), false),
            },
            _ => {
                debug!(tool = %tool_name, "Acknowledging allowed tool request");
                ToolResponseFrame::new(tool_call_id, "Tool executed successfully", true)
            }
        }
    }
}

/// Cap `prompt` at `max_chars`, marking the cut with `...`
pub fn truncate_prompt(prompt: &str, max_chars: usize) -> String {
    if prompt.chars().count() <= max_chars {
        return prompt.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let mut truncated: String = prompt.chars().take(keep).collect();
    truncated.push_str("...");
    truncated
}

/// Socket URL of the runtime: ws(s) scheme, `/ws` when no path is given
pub fn ws_url(base: &str) -> String {
    let base = base.trim();
    let (scheme, rest) = match base.split_once("://") {
        Some(("https", rest)) | Some(("wss", rest)) => ("wss", rest),
        Some((_, rest)) => ("ws", rest),
        None => ("ws", base),
    };
    match rest.split_once('/') {
        Some((_, path)) if !path.trim_matches('/').is_empty() => format!("{}://{}", scheme, rest),
        _ => format!("{}://{}/ws", scheme, rest.trim_end_matches('/')),
    }
}
