//! The inbound message decision tree
//!
//! Every visitor `user_message` runs the same ordered pipeline: persist,
//! feed the dashboard, reopen concluded sessions, handle the conclusion
//! chips, gate on human intent, suppress the AI while an agent holds
//! the session, answer from the canned table, close out ending phrases,
//! filter disallowed content, and only then call the model. Each step
//! commits its side effects before returning; the dispatcher is also
//! the error boundary, so nothing below it ever disconnects a visitor.

use crate::config::Config;
use crate::db::{
    Database, DbError, NewAccuracyRecord, NewMessage, NewNotification, ResponseType, Sender,
    SessionPatch, SessionStatus,
};
use crate::events::ServerEvent;
use crate::fetch::ByteFetcher;
use crate::hub::{Hub, ADMIN_FEED, ROOM_ADMIN};
use crate::llm::{clamp_ai_text, enforce_word_limit, GenerateRequest, Generator};
use crate::matcher::{normalize, Matcher};
use crate::notify::Notifier;
use crate::presence::{PresenceRegistry, Visitor};
use crate::redact::redact_pii;
use crate::session::AssignmentCache;
use crate::spool::{Job, Spool};
use chrono::{DateTime, Datelike, Local, SecondsFormat, Timelike, Utc, Weekday};
use serde_json::Map;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

// Fixed visitor-facing strings; no raw error text ever reaches a visitor.
const CONCLUSION_QUESTION: &str = "Is there anything else I can help you with?";
const CONCLUSION_FINAL: &str = "Thank you for chatting with us. Have a great day!";
const CONTINUE_PROMPT: &str = "No problem! Go ahead and ask your next question.";
const AGENT_BUTTON_PROMPT: &str = "Click the button below to talk to an agent.";
const OFF_HOURS_MESSAGE: &str = "Our agents are available Monday to Friday, 9am to 5pm. \
    Leave your contact details and we will get back to you during business hours.";
const CONTENT_REJECTION: &str = "I can't help with that topic here. Please keep the \
    conversation related to our products and services.";
const AI_UNAVAILABLE: &str = "I'm temporarily unavailable. Please try again in a moment, \
    or ask to talk to an agent.";
const GENERIC_ERROR: &str = "Something went wrong on our side. Please try again.";
const AGENT_CONFIRMATION: &str = "Got it. An agent will join this chat shortly.";

pub const OPTION_CONCLUDE: &str = "Thank you for helping";
pub const OPTION_CONTINUE: &str = "Want to ask more";

const AI_CONFIDENCE: f64 = 0.9;

const BLOCKED_KEYWORDS: &[&str] = &[
    "porn", "porno", "nude", "naked", "nsfw", "xxx", "erotic", "sex", "sexual", "sexy",
];

/// Mon-Fri, 09:00-17:00, process-local time.
pub fn within_business_hours(now: DateTime<Local>) -> bool {
    !matches!(now.weekday(), Weekday::Sat | Weekday::Sun) && (9..17).contains(&now.hour())
}

fn contains_blocked_keyword(normalized: &str) -> bool {
    normalized
        .split_whitespace()
        .any(|token| BLOCKED_KEYWORDS.contains(&token))
}

type Clock = Arc<dyn Fn() -> DateTime<Local> + Send + Sync>;

pub struct Dispatcher {
    db: Database,
    hub: Arc<Hub>,
    presence: Arc<PresenceRegistry>,
    cache: Arc<AssignmentCache>,
    matcher: Arc<Matcher>,
    generator: Option<Arc<dyn Generator>>,
    fetcher: Arc<dyn ByteFetcher>,
    spool: Spool,
    notifier: Arc<Notifier>,
    redact_pii: bool,
    clock: Clock,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        hub: Arc<Hub>,
        presence: Arc<PresenceRegistry>,
        cache: Arc<AssignmentCache>,
        matcher: Arc<Matcher>,
        generator: Option<Arc<dyn Generator>>,
        fetcher: Arc<dyn ByteFetcher>,
        spool: Spool,
        notifier: Arc<Notifier>,
        config: &Config,
    ) -> Self {
        Self {
            db,
            hub,
            presence,
            cache,
            matcher,
            generator,
            fetcher,
            spool,
            notifier,
            redact_pii: config.redact_pii,
            clock: Arc::new(Local::now),
        }
    }

    /// Pin the business-hours clock (tests).
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    // ==================== visitor lifecycle ====================

    pub fn handle_visitor_join(&self, conn_id: &str, url: &str) {
        self.presence.add_visitor(Visitor {
            connection_id: conn_id.to_string(),
            url: url.to_string(),
            online_at: Utc::now(),
            status: Some("browsing".to_string()),
            session_id: None,
        });
        self.broadcast_visitors();
    }

    pub fn handle_visitor_leave(&self, conn_id: &str) {
        if self.presence.remove_visitor(conn_id).is_some() {
            self.broadcast_visitors();
        }
    }

    pub fn broadcast_visitors(&self) {
        self.hub.emit_room(
            ADMIN_FEED,
            &ServerEvent::LiveVisitorsUpdate(self.presence.snapshot_visitors()),
        );
    }

    pub fn handle_start_session(
        &self,
        conn_id: &str,
        session_id: &str,
        user_meta: &Map<String, serde_json::Value>,
    ) {
        if session_id.trim().is_empty() {
            self.hub.emit_to(
                conn_id,
                &ServerEvent::SessionError {
                    message: "A session id is required".to_string(),
                },
            );
            return;
        }

        if let Err(e) = self.db.ensure_session(session_id, user_meta) {
            tracing::warn!(session_id, error = %e, "Failed to ensure session");
        }
        self.hub.join(conn_id, session_id);

        if self.presence.update_visitor(conn_id, |v| {
            v.status = Some("chatting".to_string());
            v.session_id = Some(session_id.to_string());
        }) {
            self.broadcast_visitors();
        }

        self.hub.emit_to(
            conn_id,
            &ServerEvent::SessionStarted {
                session_id: session_id.to_string(),
            },
        );

        let welcome = self.db.welcome_message();
        self.hub.emit_to(
            conn_id,
            &ServerEvent::BotMessage {
                session_id: session_id.to_string(),
                text: welcome.clone(),
                confidence: 1.0,
                msg_type: Some("welcome".to_string()),
                show_agent_button: None,
                options: None,
                model: None,
            },
        );
        self.spool.push(Job::Message(
            NewMessage::new(session_id, Sender::Bot, &welcome)
                .with_confidence(1.0)
                .with_type("welcome"),
        ));
    }

    pub fn handle_join_session(&self, conn_id: &str, session_id: &str) {
        self.hub.join(conn_id, session_id);
    }

    pub fn handle_request_agent(&self, session_id: &str) {
        let event = ServerEvent::bot_message(session_id, AGENT_CONFIRMATION, 1.0);
        self.hub.emit_room(session_id, &event);
        self.spool.push(Job::Message(
            NewMessage::new(session_id, Sender::Bot, AGENT_CONFIRMATION).with_confidence(1.0),
        ));
        self.notifier.notify(
            NewNotification::new(
                "request_agent",
                "Agent requested",
                &format!("A visitor asked for an agent in session {session_id}"),
            )
            .for_session(session_id),
        );
    }

    pub fn handle_request_human(&self, session_id: &str, reason: &str) {
        self.hub.emit_room(
            ADMIN_FEED,
            &ServerEvent::AdminRingSound {
                session_id: session_id.to_string(),
                reason: reason.to_string(),
            },
        );
    }

    pub fn handle_session_timeout(&self, session_id: &str) {
        self.notifier.notify(
            NewNotification::new(
                "session_timeout_warning",
                "Session timing out",
                &format!("Session {session_id} is about to time out"),
            )
            .for_session(session_id),
        );
        self.hub.emit_room(
            ROOM_ADMIN,
            &ServerEvent::SessionTimeoutWarning {
                session_id: session_id.to_string(),
            },
        );
    }

    // ==================== the decision tree ====================

    pub async fn handle_user_message(
        &self,
        conn_id: &str,
        session_id: &str,
        text: &str,
        msg_type: Option<&str>,
        attachment_url: Option<&str>,
    ) {
        // Step 1: validate
        let trimmed = text.trim();
        if session_id.trim().is_empty() || trimmed.is_empty() {
            self.hub.emit_to(
                conn_id,
                &ServerEvent::SessionError {
                    message: "Session id and message text are required".to_string(),
                },
            );
            return;
        }

        // A reconnecting widget may send before re-joining the room
        self.hub.join(conn_id, session_id);

        if let Err(e) = self
            .dispatch(session_id, trimmed, msg_type, attachment_url)
            .await
        {
            if e.is_not_found() {
                self.hub.emit_to(
                    conn_id,
                    &ServerEvent::Error {
                        message: "Session not found".to_string(),
                    },
                );
            } else {
                tracing::error!(session_id, error = %e, "Dispatch failed");
                self.send_bot_reply(
                    session_id,
                    GENERIC_ERROR,
                    0.0,
                    Some("error"),
                    ResponseType::Stub,
                    0,
                    0,
                    None,
                );
            }
        }
    }

    async fn dispatch(
        &self,
        session_id: &str,
        text: &str,
        msg_type: Option<&str>,
        attachment_url: Option<&str>,
    ) -> Result<(), DbError> {
        let started = Instant::now();

        // Step 2: persist the user message, always. Failure must not
        // stop the dashboard broadcast.
        let mut session = self.db.ensure_session(session_id, &Map::new())?;
        let mut inbound = NewMessage::new(session_id, Sender::User, text)
            .with_attachment(attachment_url.map(String::from));
        if let Some(t) = msg_type {
            inbound = inbound.with_type(t);
        }
        let user_msg = match self.db.append_message(&inbound) {
            Ok(m) => Some(m),
            Err(e) => {
                tracing::warn!(session_id, error = %e, "Failed to persist user message");
                None
            }
        };

        // Step 3: dashboard feed (notification sounds)
        self.hub.emit_room(
            ADMIN_FEED,
            &ServerEvent::UserMessageForAgent {
                session_id: session_id.to_string(),
                text: text.to_string(),
                ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            },
        );

        // Step 4: a message into a concluded session reopens it
        let was_concluded = session.conversation_concluded();
        if was_concluded {
            let mut patch = SessionPatch::default()
                .meta("conversationConcluded", serde_json::json!(false))
                .touch();
            if session.status == SessionStatus::Closed {
                patch = patch.status(SessionStatus::Active).assign(None);
            }
            match self.db.update_session(session_id, &patch) {
                Ok(updated) => session = updated,
                Err(e) => tracing::warn!(session_id, error = %e, "Failed to reopen session"),
            }
            self.cache.invalidate(session_id);
        }

        // Step 5: conclusion chips outrank every other classifier
        let normalized = normalize(text);
        if normalized == normalize(OPTION_CONCLUDE) {
            self.conclude_session(session_id);
            return Ok(());
        }
        if normalized == normalize(OPTION_CONTINUE) {
            if was_concluded || session.conversation_concluded() {
                self.send_bot_reply(
                    session_id,
                    CONTINUE_PROMPT,
                    1.0,
                    Some("continue_prompt"),
                    ResponseType::Stub,
                    started.elapsed().as_millis() as i64,
                    0,
                    None,
                );
                return Ok(());
            }
        }

        // Step 6: human intent is hard-gated; nothing else may answer
        if self.matcher.is_human_intent(text) {
            if within_business_hours((self.clock)()) {
                self.hub.emit_room(
                    session_id,
                    &ServerEvent::BotMessage {
                        session_id: session_id.to_string(),
                        text: AGENT_BUTTON_PROMPT.to_string(),
                        confidence: 1.0,
                        msg_type: Some("agent_prompt".to_string()),
                        show_agent_button: Some(true),
                        options: None,
                        model: None,
                    },
                );
                self.spool.push(Job::Message(
                    NewMessage::new(session_id, Sender::Bot, AGENT_BUTTON_PROMPT)
                        .with_confidence(1.0)
                        .with_type("agent_prompt"),
                ));
                self.record_accuracy(
                    session_id,
                    AGENT_BUTTON_PROMPT,
                    1.0,
                    started.elapsed().as_millis() as i64,
                    0,
                    ResponseType::Stub,
                    Some("agent_prompt".to_string()),
                );
            } else {
                self.send_bot_reply(
                    session_id,
                    OFF_HOURS_MESSAGE,
                    1.0,
                    Some("off_hours"),
                    ResponseType::Stub,
                    started.elapsed().as_millis() as i64,
                    0,
                    None,
                );
                self.hub.emit_room(
                    session_id,
                    &ServerEvent::OfflineForm {
                        session_id: session_id.to_string(),
                    },
                );
            }
            return Ok(());
        }

        // Step 7: an assigned agent suppresses the AI entirely
        let assignment = match self.cache.get(session_id) {
            Some(a) => a,
            None => self.cache.warm(&session),
        };
        if assignment.ai_paused {
            self.hub.emit_room(
                session_id,
                &ServerEvent::UserMessage {
                    session_id: session_id.to_string(),
                    text: text.to_string(),
                    sender: "user".to_string(),
                },
            );
            if let Some(agent_id) = &assignment.agent_id {
                if let Some(agent_conn) = self.presence.agent_connection(agent_id) {
                    self.hub.emit_to(
                        &agent_conn,
                        &ServerEvent::UserMessageForAgent {
                            session_id: session_id.to_string(),
                            text: text.to_string(),
                            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                        },
                    );
                }
            }
            return Ok(());
        }

        // Step 8: vision branch
        if msg_type == Some("image") {
            if let Some(url) = attachment_url {
                self.vision_turn(session_id, text, url, started).await;
                return Ok(());
            }
        }

        // Step 9: preloaded replies answer without touching the model
        if let Some(reply) = self.matcher.preloaded_reply(text) {
            let reply = reply.to_string();
            self.hub.emit_room(
                session_id,
                &ServerEvent::BotMessage {
                    session_id: session_id.to_string(),
                    text: reply.clone(),
                    confidence: 1.0,
                    msg_type: Some("preloaded".to_string()),
                    show_agent_button: None,
                    options: None,
                    model: None,
                },
            );
            self.spool.push(Job::Message(
                NewMessage::new(session_id, Sender::Bot, &reply)
                    .with_confidence(1.0)
                    .with_type("preloaded"),
            ));
            self.record_accuracy(
                session_id,
                &reply,
                1.0,
                started.elapsed().as_millis() as i64,
                0,
                ResponseType::Preloaded,
                None,
            );
            return Ok(());
        }

        // Step 10: ending phrases get the conclusion question
        if self.matcher.is_ending_phrase(text) {
            if let Err(e) = self.db.append_message(
                &NewMessage::new(session_id, Sender::Bot, CONCLUSION_QUESTION)
                    .with_confidence(1.0)
                    .with_type("conclusion_question"),
            ) {
                tracing::warn!(session_id, error = %e, "Failed to persist conclusion question");
            }
            self.hub.emit_room(
                session_id,
                &ServerEvent::BotMessage {
                    session_id: session_id.to_string(),
                    text: CONCLUSION_QUESTION.to_string(),
                    confidence: 1.0,
                    msg_type: Some("conclusion_question".to_string()),
                    show_agent_button: None,
                    options: Some(vec![
                        OPTION_CONCLUDE.to_string(),
                        OPTION_CONTINUE.to_string(),
                    ]),
                    model: None,
                },
            );
            return Ok(());
        }

        // Step 11: content filter
        if contains_blocked_keyword(&normalized) {
            if let Err(e) = self.db.append_message(
                &NewMessage::new(session_id, Sender::Bot, CONTENT_REJECTION)
                    .with_confidence(1.0)
                    .filtered(),
            ) {
                tracing::warn!(session_id, error = %e, "Failed to persist rejection");
            }
            self.hub
                .emit_room(session_id, &ServerEvent::bot_message(session_id, CONTENT_REJECTION, 1.0));
            self.record_accuracy(
                session_id,
                CONTENT_REJECTION,
                1.0,
                started.elapsed().as_millis() as i64,
                0,
                ResponseType::Stub,
                Some("content_filter".to_string()),
            );
            return Ok(());
        }

        // Steps 12/13: the AI path with its own failure boundary
        self.ai_turn(session_id, text, user_msg.as_ref().map(|m| m.id.as_str()), started)
            .await;
        Ok(())
    }

    // ==================== conclusion ====================

    fn conclude_session(&self, session_id: &str) {
        if let Err(e) = self.db.append_message(
            &NewMessage::new(session_id, Sender::Bot, CONCLUSION_FINAL)
                .with_confidence(1.0)
                .with_type("conclusion_final"),
        ) {
            tracing::warn!(session_id, error = %e, "Failed to persist conclusion");
        }

        if let Err(e) = self.db.update_session(
            session_id,
            &SessionPatch::default()
                .status(SessionStatus::Closed)
                .meta("conversationConcluded", serde_json::json!(true))
                .touch(),
        ) {
            tracing::warn!(session_id, error = %e, "Failed to close session");
        }
        self.cache.invalidate(session_id);

        self.hub.emit_room(
            session_id,
            &ServerEvent::BotMessage {
                session_id: session_id.to_string(),
                text: CONCLUSION_FINAL.to_string(),
                confidence: 1.0,
                msg_type: Some("conclusion_final".to_string()),
                show_agent_button: None,
                options: None,
                model: None,
            },
        );
        self.hub.emit_room(
            session_id,
            &ServerEvent::ConversationClosed {
                session_id: session_id.to_string(),
            },
        );
    }

    // ==================== AI ====================

    fn build_prompt(&self, session_id: &str, user_text: &str, exclude_id: Option<&str>) -> String {
        let limit = self.db.context_limit();
        let history = self
            .db
            .recent_dialogue(session_id, limit, exclude_id)
            .unwrap_or_else(|e| {
                tracing::warn!(session_id, error = %e, "Failed to load dialogue window");
                Vec::new()
            });

        let mut prompt = String::new();
        for message in &history {
            let label = match message.sender {
                Sender::User => "User",
                Sender::Bot => "You (Assistant)",
                Sender::Agent => "Agent",
                Sender::Internal => continue,
            };
            prompt.push_str(label);
            prompt.push_str(": ");
            prompt.push_str(&message.text);
            prompt.push('\n');
        }
        prompt.push_str("User: ");
        prompt.push_str(user_text);
        prompt.push_str("\nYou (Assistant):");
        prompt
    }

    async fn ai_turn(
        &self,
        session_id: &str,
        text: &str,
        exclude_id: Option<&str>,
        started: Instant,
    ) {
        let Some(generator) = self.generator.clone() else {
            self.ai_fallback(session_id, started);
            return;
        };

        let request = GenerateRequest::new(self.db.system_prompt(), self.build_prompt(session_id, text, exclude_id));

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let hub = self.hub.clone();
        let stream_session = session_id.to_string();
        let forwarder = tokio::spawn(async move {
            while let Some(partial) = rx.recv().await {
                hub.emit_room(
                    &stream_session,
                    &ServerEvent::BotStream {
                        session_id: stream_session.clone(),
                        text: partial,
                    },
                );
            }
        });

        let result = generator.generate(&request, Some(tx)).await;
        let _ = forwarder.await;

        match result {
            Ok(generated) => {
                if let Some(reason) = &generated.block_reason {
                    tracing::warn!(session_id, reason = %reason, "Provider flagged the reply");
                }
                let latency = started.elapsed().as_millis() as i64;
                let reply = enforce_word_limit(&clamp_ai_text(&generated.text));
                self.send_bot_reply(
                    session_id,
                    &reply,
                    AI_CONFIDENCE,
                    None,
                    ResponseType::Ai,
                    latency,
                    generated.tokens,
                    Some(generated.model),
                );
            }
            Err(e) => {
                tracing::warn!(session_id, error = %e, "AI generation failed");
                self.ai_fallback(session_id, started);
            }
        }
    }

    async fn vision_turn(
        &self,
        session_id: &str,
        text: &str,
        attachment_url: &str,
        started: Instant,
    ) {
        let Some(generator) = self.generator.clone() else {
            self.ai_fallback(session_id, started);
            return;
        };

        let fetched = self.fetcher.fetch(attachment_url).await;
        let outcome = match fetched {
            Ok((bytes, mime)) => {
                let prompt = format!("{}\n\n{}", self.db.image_analysis_prompt(), text);
                generator.generate_with_image(&prompt, &bytes, &mime).await
            }
            Err(e) => {
                tracing::warn!(session_id, error = %e, "Attachment fetch failed");
                self.ai_fallback(session_id, started);
                return;
            }
        };

        match outcome {
            Ok(generated) => {
                let latency = started.elapsed().as_millis() as i64;
                let reply = enforce_word_limit(&clamp_ai_text(&generated.text));
                self.send_bot_reply(
                    session_id,
                    &reply,
                    AI_CONFIDENCE,
                    Some("vision"),
                    ResponseType::Vision,
                    latency,
                    generated.tokens,
                    Some(generated.model),
                );
            }
            Err(e) => {
                tracing::warn!(session_id, error = %e, "Vision generation failed");
                self.ai_fallback(session_id, started);
            }
        }
    }

    fn ai_fallback(&self, session_id: &str, started: Instant) {
        self.send_bot_reply(
            session_id,
            AI_UNAVAILABLE,
            0.0,
            Some("fallback"),
            ResponseType::Fallback,
            started.elapsed().as_millis() as i64,
            0,
            None,
        );
    }

    // ==================== shared effects ====================

    /// Persist (best effort) then emit one bot turn, and record its
    /// accuracy row.
    #[allow(clippy::too_many_arguments)]
    fn send_bot_reply(
        &self,
        session_id: &str,
        text: &str,
        confidence: f64,
        msg_type: Option<&str>,
        response_type: ResponseType,
        latency_ms: i64,
        tokens: i64,
        model: Option<String>,
    ) {
        let stored_text = if self.redact_pii {
            redact_pii(text)
        } else {
            text.to_string()
        };

        let mut record = NewMessage::new(session_id, Sender::Bot, &stored_text)
            .with_confidence(confidence);
        if let Some(t) = msg_type {
            record = record.with_type(t);
        }
        if let Err(e) = self.db.append_message(&record) {
            tracing::warn!(session_id, error = %e, "Failed to persist bot message");
        }

        self.hub.emit_room(
            session_id,
            &ServerEvent::BotMessage {
                session_id: session_id.to_string(),
                text: text.to_string(),
                confidence,
                msg_type: msg_type.map(String::from),
                show_agent_button: None,
                options: None,
                model: model.clone(),
            },
        );

        self.record_accuracy(
            session_id,
            &stored_text,
            confidence,
            latency_ms,
            tokens,
            response_type,
            model.map(|m| format!("model={m}")),
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn record_accuracy(
        &self,
        session_id: &str,
        text: &str,
        confidence: f64,
        latency_ms: i64,
        tokens: i64,
        response_type: ResponseType,
        metadata: Option<String>,
    ) {
        let stored_text = if self.redact_pii {
            redact_pii(text)
        } else {
            text.to_string()
        };
        self.spool.push(Job::Accuracy(NewAccuracyRecord {
            session_id: session_id.to_string(),
            text: stored_text,
            confidence,
            latency_ms,
            tokens,
            response_type,
            metadata,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Frame;
    use crate::llm::Generated;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct MockGenerator {
        reply: String,
        fail: bool,
        calls: AtomicUsize,
        last_prompt: StdMutex<String>,
    }

    impl MockGenerator {
        fn ok(reply: &str) -> Self {
            Self {
                reply: reply.to_string(),
                fail: false,
                calls: AtomicUsize::new(0),
                last_prompt: StdMutex::new(String::new()),
            }
        }

        fn failing() -> Self {
            let mut g = Self::ok("");
            g.fail = true;
            g
        }
    }

    #[async_trait]
    impl Generator for MockGenerator {
        async fn generate(
            &self,
            req: &GenerateRequest,
            partials: Option<mpsc::UnboundedSender<String>>,
        ) -> Result<Generated, crate::llm::LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_prompt.lock().unwrap() = req.prompt.clone();
            if self.fail {
                return Err(crate::llm::LlmError::server_error("provider down"));
            }
            if let Some(tx) = partials {
                let mut sofar = String::new();
                for word in self.reply.split_whitespace() {
                    if !sofar.is_empty() {
                        sofar.push(' ');
                    }
                    sofar.push_str(word);
                    let _ = tx.send(sofar.clone());
                }
            }
            Ok(Generated {
                text: self.reply.clone(),
                model: "gemini-2.0-flash".to_string(),
                tokens: 7,
                block_reason: None,
            })
        }

        async fn generate_with_image(
            &self,
            _prompt: &str,
            _image: &[u8],
            _mime: &str,
        ) -> Result<Generated, crate::llm::LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(crate::llm::LlmError::server_error("provider down"));
            }
            Ok(Generated {
                text: "a screenshot of the billing page".to_string(),
                model: "gemini-2.0-flash".to_string(),
                tokens: 6,
                block_reason: None,
            })
        }
    }

    struct StubFetcher;

    #[async_trait]
    impl ByteFetcher for StubFetcher {
        async fn fetch(&self, _url: &str) -> Result<(Vec<u8>, String), crate::fetch::FetchError> {
            Ok((vec![0xFF, 0xD8], "image/jpeg".to_string()))
        }
    }

    struct Harness {
        db: Database,
        hub: Arc<Hub>,
        presence: Arc<PresenceRegistry>,
        cache: Arc<AssignmentCache>,
        spool: Spool,
        generator: Arc<MockGenerator>,
        dispatcher: Dispatcher,
    }

    fn harness() -> Harness {
        harness_with(MockGenerator::ok("Sure, our basic plan starts at ten dollars a month."), Config::default())
    }

    fn harness_with(generator: MockGenerator, config: Config) -> Harness {
        let db = Database::open_in_memory().unwrap();
        let hub = Arc::new(Hub::new());
        let presence = Arc::new(PresenceRegistry::new(Duration::from_secs(5)));
        let cache = Arc::new(AssignmentCache::new());
        let spool = Spool::start(db.clone());
        let notifier = Arc::new(Notifier::new(db.clone(), hub.clone()));
        let generator = Arc::new(generator);
        let dispatcher = Dispatcher::new(
            db.clone(),
            hub.clone(),
            presence.clone(),
            cache.clone(),
            Arc::new(Matcher::default()),
            Some(generator.clone()),
            Arc::new(StubFetcher),
            spool.clone(),
            notifier,
            &config,
        );
        Harness {
            db,
            hub,
            presence,
            cache,
            spool,
            generator,
            dispatcher,
        }
    }

    fn wednesday_morning() -> Clock {
        Arc::new(|| Local.with_ymd_and_hms(2025, 3, 5, 10, 0, 0).unwrap())
    }

    fn sunday_noon() -> Clock {
        Arc::new(|| Local.with_ymd_and_hms(2025, 3, 9, 12, 0, 0).unwrap())
    }

    fn connect(hub: &Hub, id: &str) -> mpsc::UnboundedReceiver<Frame> {
        let (tx, rx) = mpsc::unbounded_channel();
        hub.connect(id, tx);
        rx
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let Frame::Text(text) = frame {
                out.push(serde_json::from_str(&text).unwrap());
            }
        }
        out
    }

    fn named<'a>(events: &'a [Value], name: &str) -> Vec<&'a Value> {
        events.iter().filter(|e| e["event"] == name).collect()
    }

    #[test]
    fn business_hours_boundaries() {
        let wed_9 = Local.with_ymd_and_hms(2025, 3, 5, 9, 0, 0).unwrap();
        let wed_8_59 = Local.with_ymd_and_hms(2025, 3, 5, 8, 59, 0).unwrap();
        let wed_16_59 = Local.with_ymd_and_hms(2025, 3, 5, 16, 59, 0).unwrap();
        let wed_17 = Local.with_ymd_and_hms(2025, 3, 5, 17, 0, 0).unwrap();
        let sat = Local.with_ymd_and_hms(2025, 3, 8, 12, 0, 0).unwrap();
        assert!(within_business_hours(wed_9));
        assert!(!within_business_hours(wed_8_59));
        assert!(within_business_hours(wed_16_59));
        assert!(!within_business_hours(wed_17));
        assert!(!within_business_hours(sat));
    }

    #[tokio::test]
    async fn validation_rejects_empty_text() {
        let h = harness();
        let mut rx = connect(&h.hub, "v1");

        h.dispatcher.handle_user_message("v1", "s1", "   ", None, None).await;

        let events = drain(&mut rx);
        assert_eq!(named(&events, "session_error").len(), 1);
        assert!(h.db.get_session("s1").is_err());
    }

    #[tokio::test]
    async fn preloaded_greeting_scenario() {
        let h = harness();
        let mut rx = connect(&h.hub, "v1");

        h.dispatcher.handle_user_message("v1", "s1", "Hello!", None, None).await;

        let events = drain(&mut rx);
        let bots = named(&events, "bot_message");
        assert_eq!(bots.len(), 1);
        assert!(bots[0]["data"]["text"]
            .as_str()
            .unwrap()
            .starts_with("Hi! I'm your AI Assistant"));
        assert_eq!(bots[0]["data"]["type"], "preloaded");
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 0);

        h.spool.drain_now(&h.db);
        let messages = h.db.list_messages("s1", 10, true).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].sender, Sender::User);
        assert_eq!(messages[1].sender, Sender::Bot);
        assert_eq!(h.db.count_accuracy_records("s1", "preloaded"), 1);
    }

    #[tokio::test]
    async fn human_intent_in_hours_is_hard_gated() {
        let h = harness();
        let dispatcher = h.dispatcher.with_clock(wednesday_morning());
        let mut rx = connect(&h.hub, "v1");

        dispatcher
            .handle_user_message("v1", "s1", "I want to talk to a human", None, None)
            .await;

        let events = drain(&mut rx);
        let bots = named(&events, "bot_message");
        assert_eq!(bots.len(), 1);
        assert_eq!(bots[0]["data"]["text"], AGENT_BUTTON_PROMPT);
        assert_eq!(bots[0]["data"]["showAgentButton"], true);
        assert!(named(&events, "bot_stream").is_empty());
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn human_intent_off_hours_offers_form() {
        let h = harness();
        let dispatcher = h.dispatcher.with_clock(sunday_noon());
        let mut rx = connect(&h.hub, "v1");

        dispatcher
            .handle_user_message("v1", "s1", "can I speak with someone", None, None)
            .await;

        let events = drain(&mut rx);
        let bots = named(&events, "bot_message");
        assert_eq!(bots.len(), 1);
        assert_eq!(bots[0]["data"]["text"], OFF_HOURS_MESSAGE);
        assert_eq!(named(&events, "offline_form").len(), 1);
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn assigned_agent_suppresses_ai() {
        let h = harness();
        h.db.create_session("s1", &Map::new()).unwrap();
        h.db
            .update_session(
                "s1",
                &SessionPatch::default()
                    .status(SessionStatus::AgentAssigned)
                    .assign(Some("a1")),
            )
            .unwrap();
        h.presence.register_agent("a1", "agent-conn", "u1");
        let mut agent_rx = connect(&h.hub, "agent-conn");
        let mut visitor_rx = connect(&h.hub, "v1");

        h.dispatcher
            .handle_user_message("v1", "s1", "still there?", None, None)
            .await;

        let visitor_events = drain(&mut visitor_rx);
        assert_eq!(named(&visitor_events, "user_message").len(), 1);
        assert!(named(&visitor_events, "bot_message").is_empty());
        assert!(named(&visitor_events, "bot_stream").is_empty());

        let agent_events = drain(&mut agent_rx);
        let forwarded = named(&agent_events, "user_message_for_agent");
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0]["data"]["text"], "still there?");

        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 0);

        // The dispatch warmed the assignment cache on the way through
        let cached = h.cache.get("s1").expect("warmed");
        assert!(cached.ai_paused);
        assert_eq!(cached.agent_id.as_deref(), Some("a1"));
    }

    #[tokio::test]
    async fn conclusion_round_trip() {
        let h = harness();
        let mut rx = connect(&h.hub, "v1");

        h.dispatcher.handle_user_message("v1", "s1", "bye", None, None).await;
        let events = drain(&mut rx);
        let question = named(&events, "bot_message");
        assert_eq!(question.len(), 1);
        assert_eq!(question[0]["data"]["type"], "conclusion_question");
        assert_eq!(
            question[0]["data"]["options"],
            serde_json::json!([OPTION_CONCLUDE, OPTION_CONTINUE])
        );

        h.dispatcher
            .handle_user_message("v1", "s1", OPTION_CONCLUDE, None, None)
            .await;
        let events = drain(&mut rx);
        let finals = named(&events, "bot_message");
        assert_eq!(finals.len(), 1);
        assert_eq!(finals[0]["data"]["type"], "conclusion_final");
        assert_eq!(named(&events, "conversation_closed").len(), 1);

        let session = h.db.get_session("s1").unwrap();
        assert_eq!(session.status, SessionStatus::Closed);
        assert!(session.conversation_concluded());

        // Any later message reopens the session
        h.dispatcher
            .handle_user_message("v1", "s1", "what are your prices", None, None)
            .await;
        let session = h.db.get_session("s1").unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert!(!session.conversation_concluded());
        let messages = h.db.list_messages("s1", 20, true).unwrap();
        assert!(messages.iter().any(|m| m.text == "what are your prices"));
    }

    #[tokio::test]
    async fn want_to_ask_more_after_conclusion() {
        let h = harness();
        let mut rx = connect(&h.hub, "v1");

        h.dispatcher
            .handle_user_message("v1", "s1", OPTION_CONCLUDE, None, None)
            .await;
        drain(&mut rx);

        h.dispatcher
            .handle_user_message("v1", "s1", OPTION_CONTINUE, None, None)
            .await;
        let events = drain(&mut rx);
        let bots = named(&events, "bot_message");
        assert_eq!(bots.len(), 1);
        assert_eq!(bots[0]["data"]["text"], CONTINUE_PROMPT);
        assert!(!h.db.get_session("s1").unwrap().conversation_concluded());
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ai_path_streams_and_truncates() {
        let long_reply = (0..45).map(|i| format!("word{i}")).collect::<Vec<_>>().join(" ");
        let h = harness_with(MockGenerator::ok(&long_reply), Config::default());
        let mut rx = connect(&h.hub, "v1");

        h.dispatcher
            .handle_user_message("v1", "s1", "how do refunds work for annual plans", None, None)
            .await;

        let events = drain(&mut rx);
        assert!(!named(&events, "bot_stream").is_empty());
        let bots = named(&events, "bot_message");
        assert_eq!(bots.len(), 1);
        let text = bots[0]["data"]["text"].as_str().unwrap();
        assert!(text.split_whitespace().count() <= 30);
        assert!(text.ends_with("..."));
        assert_eq!(bots[0]["data"]["model"], "gemini-2.0-flash");

        h.spool.drain_now(&h.db);
        let messages = h.db.list_messages("s1", 10, true).unwrap();
        let bot_msg = messages.iter().find(|m| m.sender == Sender::Bot).unwrap();
        assert!(bot_msg.text.split_whitespace().count() <= 30);
        assert_eq!(h.db.count_accuracy_records("s1", "ai"), 1);
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ai_failure_emits_fallback() {
        let h = harness_with(MockGenerator::failing(), Config::default());
        let mut rx = connect(&h.hub, "v1");

        h.dispatcher
            .handle_user_message("v1", "s1", "how do I export my data", None, None)
            .await;

        let events = drain(&mut rx);
        let bots = named(&events, "bot_message");
        assert_eq!(bots.len(), 1);
        assert_eq!(bots[0]["data"]["text"], AI_UNAVAILABLE);
        assert_eq!(bots[0]["data"]["confidence"], 0.0);

        h.spool.drain_now(&h.db);
        assert_eq!(h.db.count_accuracy_records("s1", "fallback"), 1);
    }

    #[tokio::test]
    async fn content_filter_rejects() {
        let h = harness();
        let mut rx = connect(&h.hub, "v1");

        h.dispatcher
            .handle_user_message("v1", "s1", "show me porn", None, None)
            .await;

        let events = drain(&mut rx);
        let bots = named(&events, "bot_message");
        assert_eq!(bots.len(), 1);
        assert_eq!(bots[0]["data"]["text"], CONTENT_REJECTION);
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 0);

        let messages = h.db.list_messages("s1", 10, true).unwrap();
        let rejection = messages.iter().find(|m| m.sender == Sender::Bot).unwrap();
        assert!(rejection.filtered);
    }

    #[tokio::test]
    async fn vision_branch_answers_from_image() {
        let h = harness();
        let mut rx = connect(&h.hub, "v1");

        h.dispatcher
            .handle_user_message(
                "v1",
                "s1",
                "what is wrong on this page",
                Some("image"),
                Some("https://cdn.example/shot.png"),
            )
            .await;

        let events = drain(&mut rx);
        let bots = named(&events, "bot_message");
        assert_eq!(bots.len(), 1);
        assert_eq!(bots[0]["data"]["type"], "vision");

        h.spool.drain_now(&h.db);
        assert_eq!(h.db.count_accuracy_records("s1", "vision"), 1);
    }

    #[tokio::test]
    async fn prompt_window_excludes_internal_notes() {
        let h = harness();
        h.db.create_session("s1", &Map::new()).unwrap();
        h.db
            .append_message(&NewMessage::new("s1", Sender::User, "earlier question"))
            .unwrap();
        h.db
            .append_message(&NewMessage::new("s1", Sender::Internal, "secret agent note"))
            .unwrap();

        let mut rx = connect(&h.hub, "v1");
        h.dispatcher
            .handle_user_message("v1", "s1", "and a follow up question", None, None)
            .await;
        drain(&mut rx);

        let prompt = h.generator.last_prompt.lock().unwrap().clone();
        assert!(prompt.contains("User: earlier question"));
        assert!(!prompt.contains("secret agent note"));
        // The current turn appears once, as the trailing user line
        assert_eq!(prompt.matches("and a follow up question").count(), 1);
    }

    #[tokio::test]
    async fn pii_is_redacted_from_stored_text_only() {
        let mut config = Config::default();
        config.redact_pii = true;
        let h = harness_with(
            MockGenerator::ok("Sure, email us at billing@example.com for help."),
            config,
        );
        let mut rx = connect(&h.hub, "v1");

        h.dispatcher
            .handle_user_message("v1", "s1", "who do I email about billing", None, None)
            .await;

        let events = drain(&mut rx);
        let bots = named(&events, "bot_message");
        assert!(bots[0]["data"]["text"].as_str().unwrap().contains("billing@example.com"));

        let messages = h.db.list_messages("s1", 10, true).unwrap();
        let bot_msg = messages.iter().find(|m| m.sender == Sender::Bot).unwrap();
        assert!(bot_msg.text.contains("[redacted-email]"));
        assert!(!bot_msg.text.contains("billing@example.com"));
    }

    #[tokio::test]
    async fn start_session_sends_welcome() {
        let h = harness();
        let mut rx = connect(&h.hub, "v1");

        h.dispatcher.handle_start_session("v1", "s1", &Map::new());

        let events = drain(&mut rx);
        assert_eq!(named(&events, "session_started").len(), 1);
        let bots = named(&events, "bot_message");
        assert_eq!(bots.len(), 1);
        assert_eq!(bots[0]["data"]["type"], "welcome");
        assert!(h.db.get_session("s1").is_ok());

        // Idempotent re-start keeps the same session
        h.dispatcher.handle_start_session("v1", "s1", &Map::new());
        assert!(h.db.get_session("s1").is_ok());
    }

    #[tokio::test]
    async fn request_agent_rings_and_notifies() {
        let h = harness();
        h.db.create_session("s1", &Map::new()).unwrap();
        let mut visitor_rx = connect(&h.hub, "v1");
        h.hub.join("v1", "s1");
        let mut admin_rx = connect(&h.hub, "d1");
        h.hub.join("d1", crate::hub::ROOM_ADMIN);

        h.dispatcher.handle_request_agent("s1");

        let visitor_events = drain(&mut visitor_rx);
        assert_eq!(named(&visitor_events, "bot_message").len(), 1);
        let admin_events = drain(&mut admin_rx);
        assert_eq!(named(&admin_events, "new_notification").len(), 1);
    }

    #[tokio::test]
    async fn visitor_join_updates_dashboard() {
        let h = harness();
        let mut feed_rx = connect(&h.hub, "d1");
        h.hub.join("d1", ADMIN_FEED);

        let (tx, _visitor_rx) = mpsc::unbounded_channel();
        h.hub.connect("v1", tx);
        h.dispatcher.handle_visitor_join("v1", "/pricing");

        let events = drain(&mut feed_rx);
        let updates = named(&events, "live_visitors_update");
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0]["data"][0]["url"], "/pricing");
        assert_eq!(updates[0]["data"][0]["status"], "browsing");

        h.dispatcher.handle_visitor_leave("v1");
        let events = drain(&mut feed_rx);
        let updates = named(&events, "live_visitors_update");
        assert_eq!(updates.len(), 1);
        assert!(updates[0]["data"].as_array().unwrap().is_empty());
    }
}
