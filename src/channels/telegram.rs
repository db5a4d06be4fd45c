//! Telegram channel over the Bot API.
//!
//! Long-polls `getUpdates` with capped exponential backoff, normalizes
//! inbound media into text markers, and renders outbound markdown as
//! Telegram HTML with a plain-text fallback per chunk.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;

use crate::channels::markdown::{
    contains_code, markdown_to_html, split_message, strip_markdown, truncate_str,
};
use crate::channels::media::{SpeechSynthesizer, TextExtractor, Transcriber};
use crate::channels::{Channel, IncomingMessage, MessageStream, OutgoingResponse};
use crate::error::ChannelError;
use crate::workspace::{ScratchFile, Workspace};

const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;
const LONG_POLL_TIMEOUT_SECS: u64 = 30;
const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(2);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(300);
const THINKING_TEXT: &str = "Thinking... 💭";
const THINKING_TIMEOUT: Duration = Duration::from_secs(300);
const TRANSCRIBE_TIMEOUT: Duration = Duration::from_secs(30);
const PDF_TEXT_LIMIT: usize = 15_000;
const VOICE_REPLY_MAX_CHARS: usize = 300;

/// Per-chat session state: the pending thinking indicator and whether the
/// last inbound turn was voice.
#[derive(Default)]
struct ChatState {
    thinking_msg_id: Option<i64>,
    thinking_cancel: Option<CancellationToken>,
    voice_pending: bool,
}

#[derive(Clone)]
pub struct TelegramChannel {
    bot_token: String,
    allowed_users: Vec<String>,
    client: reqwest::Client,
    workspace: Workspace,
    chats: Arc<DashMap<i64, ChatState>>,
    transcriber: Option<Arc<dyn Transcriber>>,
    synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
    pdf_extractor: Option<Arc<dyn TextExtractor>>,
    models: Vec<String>,
    active_model: Arc<RwLock<String>>,
    shutdown_token: CancellationToken,
}

impl TelegramChannel {
    pub fn new(
        bot_token: String,
        allowed_users: Vec<String>,
        workspace: Workspace,
        active_model: Arc<RwLock<String>>,
    ) -> Self {
        Self {
            bot_token,
            allowed_users,
            client: reqwest::Client::new(),
            workspace,
            chats: Arc::new(DashMap::new()),
            transcriber: None,
            synthesizer: None,
            pdf_extractor: None,
            models: Vec::new(),
            active_model,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Models offered by the `/model` menu.
    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = models;
        self
    }

    pub fn with_transcriber(mut self, transcriber: Arc<dyn Transcriber>) -> Self {
        self.transcriber = Some(transcriber);
        self
    }

    pub fn with_synthesizer(mut self, synthesizer: Arc<dyn SpeechSynthesizer>) -> Self {
        self.synthesizer = Some(synthesizer);
        self
    }

    pub fn with_pdf_extractor(mut self, extractor: Arc<dyn TextExtractor>) -> Self {
        self.pdf_extractor = Some(extractor);
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{method}", self.bot_token)
    }

    /// POST a Bot API method, returning the `result` payload.
    async fn call_api(&self, method: &str, body: Value) -> Result<Value, ChannelError> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::Http(e.to_string()))?;
        let status = resp.status();
        let payload: Value = resp
            .json()
            .await
            .map_err(|e| ChannelError::Http(e.to_string()))?;

        let ok = payload.get("ok").and_then(Value::as_bool).unwrap_or(false);
        if !status.is_success() || !ok {
            let description = payload
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(ChannelError::SendFailed {
                name: "telegram".into(),
                reason: format!("{method}: {description}"),
            });
        }
        Ok(payload.get("result").cloned().unwrap_or(Value::Null))
    }

    // ── Outbound ────────────────────────────────────────────────────

    /// Deliver a response to a chat: retire the thinking indicator, then
    /// try media, then voice (when gated in), then chunked HTML text.
    pub async fn deliver(
        &self,
        chat_id: i64,
        response: OutgoingResponse,
    ) -> Result<(), ChannelError> {
        self.clear_thinking_indicator(chat_id).await;

        if !response.media.is_empty() {
            let caption =
                (!response.content.is_empty()).then(|| markdown_to_html(&response.content));
            let mut all_sent = true;
            for (i, url) in response.media.iter().enumerate() {
                // Caption rides on the first attachment only.
                let caption = if i == 0 { caption.as_deref() } else { None };
                let result = if is_image_url(url) {
                    self.send_photo_by_url(chat_id, url, caption).await
                } else {
                    self.send_document_by_url(chat_id, url, caption).await
                };
                if let Err(err) = result {
                    tracing::error!("Failed to send media, falling back to text: {err}");
                    all_sent = false;
                    break;
                }
            }
            if all_sent {
                return Ok(());
            }
        }

        // Voice replies only answer voice input, and only for short
        // code-free responses.
        let voice_reply = self
            .chats
            .get_mut(&chat_id)
            .map(|mut state| std::mem::take(&mut state.voice_pending))
            .unwrap_or(false);
        if voice_reply && let Some(synthesizer) = &self.synthesizer {
            let plain = strip_markdown(&response.content);
            if !plain.is_empty()
                && plain.len() <= VOICE_REPLY_MAX_CHARS
                && !contains_code(&response.content)
            {
                match self
                    .send_voice_reply(synthesizer.as_ref(), chat_id, &plain)
                    .await
                {
                    Ok(()) => return Ok(()),
                    Err(err) => {
                        tracing::error!("Voice reply failed, falling back to text: {err}");
                    }
                }
            }
        }

        if response.content.trim().is_empty() {
            tracing::debug!("Skipping empty response for chat {chat_id}");
            return Ok(());
        }

        let html = markdown_to_html(&response.content);
        for chunk in split_message(&html, TELEGRAM_MAX_MESSAGE_LENGTH) {
            self.send_chunk(chat_id, &chunk).await?;
        }
        Ok(())
    }

    /// Send one chunk as HTML, retrying as plain text if Telegram rejects
    /// the markup.
    async fn send_chunk(&self, chat_id: i64, text: &str) -> Result<(), ChannelError> {
        let body = json!({"chat_id": chat_id, "text": text, "parse_mode": "HTML"});
        if let Err(err) = self.call_api("sendMessage", body).await {
            tracing::warn!("HTML send failed, falling back to plain text: {err}");
            self.call_api("sendMessage", json!({"chat_id": chat_id, "text": text}))
                .await?;
        }
        Ok(())
    }

    /// Send plain text without markup, returning the new message id.
    async fn send_plain_message(&self, chat_id: i64, text: &str) -> Result<i64, ChannelError> {
        let result = self
            .call_api("sendMessage", json!({"chat_id": chat_id, "text": text}))
            .await?;
        result
            .get("message_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| ChannelError::SendFailed {
                name: "telegram".into(),
                reason: "sendMessage result had no message_id".into(),
            })
    }

    async fn send_photo_by_url(
        &self,
        chat_id: i64,
        url: &str,
        caption: Option<&str>,
    ) -> Result<(), ChannelError> {
        let mut body = json!({"chat_id": chat_id, "photo": url});
        if let Some(caption) = caption {
            body["caption"] = json!(caption);
            body["parse_mode"] = json!("HTML");
        }
        self.call_api("sendPhoto", body).await.map(|_| ())
    }

    async fn send_document_by_url(
        &self,
        chat_id: i64,
        url: &str,
        caption: Option<&str>,
    ) -> Result<(), ChannelError> {
        let mut body = json!({"chat_id": chat_id, "document": url});
        if let Some(caption) = caption {
            body["caption"] = json!(caption);
            body["parse_mode"] = json!("HTML");
        }
        self.call_api("sendDocument", body).await.map(|_| ())
    }

    async fn send_voice_reply(
        &self,
        synthesizer: &dyn SpeechSynthesizer,
        chat_id: i64,
        plain: &str,
    ) -> Result<(), ChannelError> {
        let ogg = ScratchFile::new(self.workspace.scratch_path("ogg"));
        synthesizer.synthesize(plain, ogg.path()).await?;
        self.send_voice_note(chat_id, ogg.path()).await
    }

    async fn send_voice_note(&self, chat_id: i64, path: &Path) -> Result<(), ChannelError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "telegram".into(),
                reason: format!("reading voice file: {e}"),
            })?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("voice.ogg")
            .to_string();

        let form = reqwest::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .part(
                "voice",
                reqwest::multipart::Part::bytes(bytes).file_name(file_name),
            );

        let resp = self
            .client
            .post(self.api_url("sendVoice"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| ChannelError::Http(e.to_string()))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(ChannelError::SendFailed {
                name: "telegram".into(),
                reason: format!("sendVoice returned {status}: {body}"),
            })
        }
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), ChannelError> {
        self.call_api(
            "deleteMessage",
            json!({"chat_id": chat_id, "message_id": message_id}),
        )
        .await
        .map(|_| ())
    }

    async fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
    ) -> Result<(), ChannelError> {
        self.call_api(
            "editMessageText",
            json!({"chat_id": chat_id, "message_id": message_id, "text": text}),
        )
        .await
        .map(|_| ())
    }

    async fn answer_callback_query(&self, query_id: &str, text: &str) -> Result<(), ChannelError> {
        self.call_api(
            "answerCallbackQuery",
            json!({"callback_query_id": query_id, "text": text}),
        )
        .await
        .map(|_| ())
    }

    async fn send_chat_action(&self, chat_id: i64, action: &str) -> Result<(), ChannelError> {
        self.call_api(
            "sendChatAction",
            json!({"chat_id": chat_id, "action": action}),
        )
        .await
        .map(|_| ())
    }

    async fn send_model_menu(&self, chat_id: i64) {
        let active = self.active_model.read().await.clone();
        let models: &[String] = if self.models.is_empty() {
            std::slice::from_ref(&active)
        } else {
            &self.models
        };
        let body = json!({
            "chat_id": chat_id,
            "text": "Choose a model:",
            "reply_markup": build_model_keyboard(models, &active),
        });
        if let Err(err) = self.call_api("sendMessage", body).await {
            tracing::error!("Failed to send model menu: {err}");
        }
    }

    // ── Thinking indicator ──────────────────────────────────────────

    /// Cancel any previous indicator for this chat and post a fresh one.
    /// A watchdog deletes the placeholder if no reply retires it in time.
    async fn replace_thinking_indicator(&self, chat_id: i64) {
        let previous = self
            .chats
            .get_mut(&chat_id)
            .and_then(|mut state| state.thinking_cancel.take());
        if let Some(token) = previous {
            token.cancel();
        }

        let message_id = match self.send_plain_message(chat_id, THINKING_TEXT).await {
            Ok(id) => id,
            Err(err) => {
                tracing::warn!("Failed to send thinking indicator: {err}");
                return;
            }
        };

        let token = CancellationToken::new();
        {
            let mut state = self.chats.entry(chat_id).or_default();
            state.thinking_msg_id = Some(message_id);
            state.thinking_cancel = Some(token.clone());
        }

        let chan = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(THINKING_TIMEOUT) => {
                    let stale = chan.chats.get_mut(&chat_id).and_then(|mut state| {
                        if state.thinking_msg_id == Some(message_id) {
                            state.thinking_cancel = None;
                            state.thinking_msg_id.take()
                        } else {
                            None
                        }
                    });
                    if let Some(id) = stale {
                        let _ = chan.delete_message(chat_id, id).await;
                    }
                }
            }
        });
    }

    /// Retire the indicator: cancel the watchdog and delete the placeholder.
    async fn clear_thinking_indicator(&self, chat_id: i64) {
        let (token, message_id) = match self.chats.get_mut(&chat_id) {
            Some(mut state) => (state.thinking_cancel.take(), state.thinking_msg_id.take()),
            None => (None, None),
        };
        if let Some(token) = token {
            token.cancel();
        }
        if let Some(message_id) = message_id
            && let Err(err) = self.delete_message(chat_id, message_id).await
        {
            tracing::debug!("Failed to delete thinking placeholder: {err}");
        }
    }

    // ── Inbound ─────────────────────────────────────────────────────

    async fn poll_updates(self, tx: mpsc::UnboundedSender<IncomingMessage>) {
        let mut offset: i64 = 0;
        let mut retry_delay = RECONNECT_BASE_DELAY;

        loop {
            let request = self
                .client
                .post(self.api_url("getUpdates"))
                .timeout(Duration::from_secs(LONG_POLL_TIMEOUT_SECS + 10))
                .json(&json!({
                    "timeout": LONG_POLL_TIMEOUT_SECS,
                    "offset": offset,
                    "allowed_updates": ["message", "callback_query"],
                }))
                .send();

            let response = tokio::select! {
                _ = self.shutdown_token.cancelled() => break,
                resp = request => resp,
            };

            let payload = match response {
                Ok(resp) => match resp.json::<Value>().await {
                    Ok(payload) => payload,
                    Err(err) => {
                        if !self.backoff_wait(&mut retry_delay, &err.to_string()).await {
                            break;
                        }
                        continue;
                    }
                },
                Err(err) => {
                    if !self.backoff_wait(&mut retry_delay, &err.to_string()).await {
                        break;
                    }
                    continue;
                }
            };

            if !payload.get("ok").and_then(Value::as_bool).unwrap_or(false) {
                let description = payload
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string();
                if !self.backoff_wait(&mut retry_delay, &description).await {
                    break;
                }
                continue;
            }

            // Connected again; reset the backoff.
            retry_delay = RECONNECT_BASE_DELAY;

            let Some(updates) = payload.get("result").and_then(Value::as_array) else {
                continue;
            };
            for update in updates {
                if let Some(update_id) = update.get("update_id").and_then(Value::as_i64) {
                    offset = offset.max(update_id + 1);
                }
                if let Some(message) = update.get("message") {
                    self.handle_message(message, &tx).await;
                } else if let Some(query) = update.get("callback_query") {
                    self.handle_callback_query(query, &tx).await;
                }
            }
        }

        tracing::info!("Telegram polling stopped");
    }

    /// Wait out the current backoff delay, doubling it for next time.
    /// Returns false if shutdown was signalled during the wait.
    async fn backoff_wait(&self, delay: &mut Duration, reason: &str) -> bool {
        tracing::warn!(
            "Telegram polling error, retrying in {}s: {reason}",
            delay.as_secs()
        );
        let wait = *delay;
        *delay = next_retry_delay(*delay);
        tokio::select! {
            _ = self.shutdown_token.cancelled() => false,
            _ = tokio::time::sleep(wait) => true,
        }
    }

    async fn handle_message(&self, message: &Value, tx: &mpsc::UnboundedSender<IncomingMessage>) {
        let Some(user) = message.get("from") else {
            return;
        };
        let Some((sender_id, user_id, username)) = sender_identity(user) else {
            return;
        };

        // Allowlist check comes before any downloads.
        if !is_user_allowed(
            &self.allowed_users,
            [user_id.as_str(), username.as_str(), sender_id.as_str()],
        ) {
            tracing::warn!(
                "Ignoring message from unauthorized user: id={user_id}, username={username}"
            );
            return;
        }

        let Some(chat_id) = message
            .get("chat")
            .and_then(|c| c.get("id"))
            .and_then(Value::as_i64)
        else {
            return;
        };

        let text = message
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if text.trim() == "/model" {
            self.send_model_menu(chat_id).await;
            return;
        }

        let mut content = String::new();
        let mut media: Vec<String> = Vec::new();
        // Guards remove downloaded files when this handler returns.
        let mut scratch: Vec<ScratchFile> = Vec::new();

        if !text.is_empty() {
            content.push_str(text);
        }
        if let Some(caption) = message.get("caption").and_then(Value::as_str)
            && !caption.is_empty()
        {
            push_fragment(&mut content, caption);
        }

        // Largest photo size is last in the array.
        if let Some(sizes) = message.get("photo").and_then(Value::as_array)
            && let Some(file_id) = sizes
                .last()
                .and_then(|p| p.get("file_id"))
                .and_then(Value::as_str)
        {
            match self.download_file(file_id, "jpg").await {
                Ok(file) => {
                    // Inline as base64 so the image outlives scratch cleanup.
                    match tokio::fs::read(file.path()).await {
                        Ok(bytes) => media
                            .push(format!("data:image/jpeg;base64,{}", BASE64.encode(&bytes))),
                        Err(err) => tracing::warn!("Failed to read downloaded photo: {err}"),
                    }
                    push_fragment(&mut content, "[image: photo]");
                    scratch.push(file);
                }
                Err(err) => tracing::warn!("Failed to download photo: {err}"),
            }
        }

        // A voice or audio turn makes the reply eligible for voice too.
        let voice_input = message.get("voice").is_some() || message.get("audio").is_some();
        self.chats.entry(chat_id).or_default().voice_pending = voice_input;

        if let Some(file_id) = message
            .get("voice")
            .and_then(|v| v.get("file_id"))
            .and_then(Value::as_str)
        {
            match self.download_file(file_id, "ogg").await {
                Ok(file) => {
                    let marker = self.transcribe_voice(file.path()).await;
                    media.push(file.path().display().to_string());
                    push_fragment(&mut content, &marker);
                    scratch.push(file);
                }
                Err(err) => tracing::warn!("Failed to download voice note: {err}"),
            }
        }

        if let Some(file_id) = message
            .get("audio")
            .and_then(|a| a.get("file_id"))
            .and_then(Value::as_str)
        {
            match self.download_file(file_id, "mp3").await {
                Ok(file) => {
                    media.push(file.path().display().to_string());
                    push_fragment(&mut content, "[audio]");
                    scratch.push(file);
                }
                Err(err) => tracing::warn!("Failed to download audio: {err}"),
            }
        }

        if let Some(document) = message.get("document")
            && let Some(file_id) = document.get("file_id").and_then(Value::as_str)
        {
            let file_name = document
                .get("file_name")
                .and_then(Value::as_str)
                .unwrap_or("document");
            let mime = document
                .get("mime_type")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let extension = file_name
                .rsplit_once('.')
                .map(|(_, ext)| ext)
                .unwrap_or("bin");
            match self.download_file(file_id, extension).await {
                Ok(file) => {
                    if mime == "application/pdf" || file_name.to_lowercase().ends_with(".pdf") {
                        let fragment = self.extract_pdf(file.path(), file_name).await;
                        push_fragment(&mut content, &fragment);
                    } else {
                        media.push(file.path().display().to_string());
                        push_fragment(&mut content, &format!("[file: {file_name}]"));
                    }
                    scratch.push(file);
                }
                Err(err) => tracing::warn!("Failed to download document: {err}"),
            }
        }

        if content.is_empty() {
            content = "[empty message]".to_string();
        }

        if let Err(err) = self.send_chat_action(chat_id, "typing").await {
            tracing::debug!("Failed to send typing action: {err}");
        }

        self.replace_thinking_indicator(chat_id).await;

        let is_group = message
            .get("chat")
            .and_then(|c| c.get("type"))
            .and_then(Value::as_str)
            != Some("private");
        let incoming = IncomingMessage::new("telegram", &sender_id, &content)
            .with_media(media)
            .with_metadata(json!({
                "chat_id": chat_id.to_string(),
                "message_id": message.get("message_id").and_then(Value::as_i64),
                "username": username,
                "is_group": is_group,
            }));

        if tx.send(incoming).is_err() {
            tracing::info!("Telegram listener channel closed");
        }
    }

    async fn handle_callback_query(
        &self,
        query: &Value,
        tx: &mpsc::UnboundedSender<IncomingMessage>,
    ) {
        let Some(data) = query.get("data").and_then(Value::as_str) else {
            return;
        };
        let Some(model) = data.strip_prefix("model:") else {
            return;
        };

        let Some(user) = query.get("from") else {
            return;
        };
        let Some((sender_id, user_id, username)) = sender_identity(user) else {
            return;
        };
        if !is_user_allowed(
            &self.allowed_users,
            [user_id.as_str(), username.as_str(), sender_id.as_str()],
        ) {
            return;
        }

        // Dismiss the spinner on the button.
        if let Some(query_id) = query.get("id").and_then(Value::as_str) {
            let _ = self
                .answer_callback_query(query_id, &format!("Switching to {model}..."))
                .await;
        }

        // Rewrite the menu message to show the selection.
        let menu = query.get("message");
        let chat_id = menu
            .and_then(|m| m.get("chat"))
            .and_then(|c| c.get("id"))
            .and_then(Value::as_i64);
        let message_id = menu
            .and_then(|m| m.get("message_id"))
            .and_then(Value::as_i64);
        if let (Some(chat_id), Some(message_id)) = (chat_id, message_id) {
            let _ = self
                .edit_message_text(chat_id, message_id, &format!("✅ Model: {model}"))
                .await;
        }

        // Republish as a /model command for the agent to apply.
        let chat_id_str = chat_id.map(|id| id.to_string()).unwrap_or_default();
        let incoming = IncomingMessage::new("telegram", &sender_id, &format!("/model {model}"))
            .with_metadata(json!({"chat_id": chat_id_str, "username": username}));
        if tx.send(incoming).is_err() {
            tracing::info!("Telegram listener channel closed");
        }
    }

    async fn transcribe_voice(&self, path: &Path) -> String {
        let Some(transcriber) = &self.transcriber else {
            return "[voice]".to_string();
        };
        match tokio::time::timeout(TRANSCRIBE_TIMEOUT, transcriber.transcribe(path)).await {
            Ok(Ok(text)) => {
                tracing::info!("Voice note transcribed: {} chars", text.len());
                format!("[voice transcription: {text}]")
            }
            Ok(Err(err)) => {
                tracing::error!("Voice transcription failed: {err}");
                "[voice (transcription failed)]".to_string()
            }
            Err(_) => {
                tracing::error!("Voice transcription timed out");
                "[voice (transcription failed)]".to_string()
            }
        }
    }

    async fn extract_pdf(&self, path: &Path, file_name: &str) -> String {
        let text = match &self.pdf_extractor {
            Some(extractor) => match extractor.extract(path).await {
                Ok(text) => text,
                Err(err) => {
                    tracing::error!("PDF text extraction failed: {err}");
                    String::new()
                }
            },
            None => String::new(),
        };

        if text.is_empty() {
            return format!("[PDF: {file_name} - text extraction failed]");
        }
        let text = if text.len() > PDF_TEXT_LIMIT {
            format!(
                "{}\n\n[... text truncated, PDF too long ...]",
                truncate_str(&text, PDF_TEXT_LIMIT)
            )
        } else {
            text
        };
        format!("[PDF: {file_name}]\n{text}")
    }

    /// Fetch a file from the Bot API onto scratch storage.
    async fn download_file(
        &self,
        file_id: &str,
        extension: &str,
    ) -> Result<ScratchFile, ChannelError> {
        let result = self.call_api("getFile", json!({"file_id": file_id})).await?;
        let file_path = result
            .get("file_path")
            .and_then(Value::as_str)
            .ok_or_else(|| ChannelError::DownloadFailed {
                name: "telegram".into(),
                reason: "getFile returned no file_path".into(),
            })?;

        let url = format!(
            "https://api.telegram.org/file/bot{}/{file_path}",
            self.bot_token
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ChannelError::DownloadFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;
        if !resp.status().is_success() {
            return Err(ChannelError::DownloadFailed {
                name: "telegram".into(),
                reason: format!("file download returned {}", resp.status()),
            });
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ChannelError::DownloadFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        let file = ScratchFile::new(self.workspace.scratch_path(extension));
        tokio::fs::write(file.path(), &bytes)
            .await
            .map_err(|e| ChannelError::DownloadFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;
        Ok(file)
    }
}

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn start(&self) -> Result<MessageStream, ChannelError> {
        tracing::info!("Starting Telegram channel (long polling)");

        let (tx, rx) = mpsc::unbounded_channel();
        let chan = self.clone();
        tokio::spawn(async move {
            chan.poll_updates(tx).await;
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        });
        Ok(Box::pin(stream))
    }

    async fn respond(
        &self,
        msg: &IncomingMessage,
        response: OutgoingResponse,
    ) -> Result<(), ChannelError> {
        let chat_id = msg.chat_id().ok_or_else(|| ChannelError::SendFailed {
            name: "telegram".into(),
            reason: "No chat_id in message metadata".into(),
        })?;
        let chat_id = parse_chat_id(chat_id)?;
        self.deliver(chat_id, response).await
    }

    async fn health_check(&self) -> Result<(), ChannelError> {
        let resp = self
            .client
            .get(self.api_url("getMe"))
            .send()
            .await
            .map_err(|e| ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: format!("getMe returned {}", resp.status()),
            })
        }
    }

    async fn shutdown(&self) -> Result<(), ChannelError> {
        self.shutdown_token.cancel();
        tracing::info!("Telegram channel shutting down");
        Ok(())
    }
}

#[async_trait]
impl crate::council::CouncilPoster for TelegramChannel {
    async fn post_turn(&self, chat_id: i64, html: &str, plain: &str) -> Result<(), ChannelError> {
        let attempt = self
            .call_api(
                "sendMessage",
                json!({
                    "chat_id": chat_id,
                    "text": html,
                    "parse_mode": "HTML",
                }),
            )
            .await;

        match attempt {
            Ok(_) => Ok(()),
            Err(err) => {
                tracing::warn!("HTML council post rejected, retrying as plain text: {err}");
                self.call_api(
                    "sendMessage",
                    json!({
                        "chat_id": chat_id,
                        "text": plain,
                    }),
                )
                .await
                .map(|_| ())
            }
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Check if any identity matches the allowed users list. `*` allows
/// everyone.
fn is_user_allowed<'a>(
    allowed_users: &[String],
    identities: impl IntoIterator<Item = &'a str>,
) -> bool {
    let ids: Vec<&str> = identities.into_iter().collect();
    allowed_users
        .iter()
        .any(|u| u == "*" || ids.contains(&u.as_str()))
}

/// Composite sender identity: `"{id}|{username}"` when a username exists,
/// the bare id otherwise. Returns (sender_id, user_id, username).
fn sender_identity(user: &Value) -> Option<(String, String, String)> {
    let user_id = user.get("id").and_then(Value::as_i64)?.to_string();
    let username = user
        .get("username")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let sender_id = if username.is_empty() {
        user_id.clone()
    } else {
        format!("{user_id}|{username}")
    };
    Some((sender_id, user_id, username))
}

fn parse_chat_id(raw: &str) -> Result<i64, ChannelError> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| ChannelError::InvalidChatId(raw.to_string()))
}

fn is_image_url(url: &str) -> bool {
    if url.starts_with("data:image/") {
        return true;
    }
    let lower = url.to_lowercase();
    [".jpg", ".jpeg", ".png", ".gif", ".webp"]
        .iter()
        .any(|ext| lower.ends_with(ext) || lower.contains(&format!("{ext}?")))
}

/// Append a fragment to the content body, separated by a newline.
fn push_fragment(content: &mut String, fragment: &str) {
    if !content.is_empty() {
        content.push('\n');
    }
    content.push_str(fragment);
}

/// Inline keyboard for the model menu: two buttons per row, active model
/// marked with a check.
fn build_model_keyboard(models: &[String], active: &str) -> Value {
    let buttons: Vec<Value> = models
        .iter()
        .map(|m| {
            let label = if m == active {
                format!("✅ {m}")
            } else {
                m.clone()
            };
            json!({"text": label, "callback_data": format!("model:{m}")})
        })
        .collect();
    let rows: Vec<Value> = buttons
        .chunks(2)
        .map(|row| Value::Array(row.to_vec()))
        .collect();
    json!({"inline_keyboard": rows})
}

fn next_retry_delay(current: Duration) -> Duration {
    current.saturating_mul(2).min(RECONNECT_MAX_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_cap() {
        let mut delay = RECONNECT_BASE_DELAY;
        let mut seen = Vec::new();
        for _ in 0..10 {
            seen.push(delay.as_secs());
            delay = next_retry_delay(delay);
        }
        assert_eq!(seen, vec![2, 4, 8, 16, 32, 64, 128, 256, 300, 300]);
    }

    #[test]
    fn allowlist_matches_any_identity() {
        let allowed = vec!["ada".to_string(), "42".to_string()];
        assert!(is_user_allowed(&allowed, ["99", "ada", "99|ada"]));
        assert!(is_user_allowed(&allowed, ["42", "", "42"]));
        assert!(!is_user_allowed(&allowed, ["99", "bob", "99|bob"]));
    }

    #[test]
    fn allowlist_wildcard_allows_everyone() {
        let allowed = vec!["*".to_string()];
        assert!(is_user_allowed(&allowed, ["99", "anyone", "99|anyone"]));
    }

    #[test]
    fn empty_allowlist_denies() {
        assert!(!is_user_allowed(&[], ["42", "ada", "42|ada"]));
    }

    #[test]
    fn sender_identity_includes_username_when_present() {
        let user = json!({"id": 42, "username": "ada"});
        let (sender_id, user_id, username) = sender_identity(&user).unwrap();
        assert_eq!(sender_id, "42|ada");
        assert_eq!(user_id, "42");
        assert_eq!(username, "ada");
    }

    #[test]
    fn sender_identity_bare_id_without_username() {
        let user = json!({"id": 42});
        let (sender_id, _, username) = sender_identity(&user).unwrap();
        assert_eq!(sender_id, "42");
        assert!(username.is_empty());
    }

    #[test]
    fn sender_identity_requires_numeric_id() {
        assert!(sender_identity(&json!({"username": "ada"})).is_none());
    }

    #[test]
    fn chat_ids_parse_including_groups() {
        assert_eq!(parse_chat_id("123456").unwrap(), 123456);
        assert_eq!(parse_chat_id("-1001234").unwrap(), -1001234);
        assert!(matches!(
            parse_chat_id("not-a-chat"),
            Err(ChannelError::InvalidChatId(_))
        ));
    }

    #[test]
    fn image_urls_detected() {
        assert!(is_image_url("data:image/jpeg;base64,AAAA"));
        assert!(is_image_url("https://example.com/cat.png"));
        assert!(is_image_url("https://example.com/CAT.JPG"));
        assert!(is_image_url("https://example.com/photo.webp?width=640"));
        assert!(!is_image_url("https://example.com/report.pdf"));
        assert!(!is_image_url("https://example.com/page"));
    }

    #[test]
    fn fragments_joined_with_newline() {
        let mut content = String::new();
        push_fragment(&mut content, "hello");
        assert_eq!(content, "hello");
        push_fragment(&mut content, "[image: photo]");
        assert_eq!(content, "hello\n[image: photo]");
    }

    #[test]
    fn model_keyboard_marks_active_and_pairs_rows() {
        let models = vec![
            "gpt-4o".to_string(),
            "gpt-4o-mini".to_string(),
            "o3".to_string(),
        ];
        let keyboard = build_model_keyboard(&models, "gpt-4o-mini");
        let rows = keyboard["inline_keyboard"].as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].as_array().unwrap().len(), 2);
        assert_eq!(rows[1].as_array().unwrap().len(), 1);
        assert_eq!(rows[0][0]["text"], "gpt-4o");
        assert_eq!(rows[0][1]["text"], "✅ gpt-4o-mini");
        assert_eq!(rows[0][1]["callback_data"], "model:gpt-4o-mini");
    }

    #[test]
    fn voice_flag_consumed_once() {
        let chats: DashMap<i64, ChatState> = DashMap::new();
        chats.entry(7).or_default().voice_pending = true;

        let take = |chats: &DashMap<i64, ChatState>| {
            chats
                .get_mut(&7)
                .map(|mut s| std::mem::take(&mut s.voice_pending))
                .unwrap_or(false)
        };
        assert!(take(&chats));
        assert!(!take(&chats));
    }
}
