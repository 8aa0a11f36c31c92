//! Telegram Bot API transport: the `Messenger` implementation plus the
//! long-polling update loop feeding the dispatcher.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use futures_util::stream;
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};
use tokio::io::AsyncReadExt;
use tracing::Instrument;

use crate::dispatch::{Dispatcher, IncomingMessage};
use crate::messenger::{ChatTarget, MessageId, Messenger, OutgoingDocument, ProgressFn};
use crate::support::format_error_chain;

const POLL_TIMEOUT_SECS: u64 = 50;
const UPLOAD_CHUNK_BYTES: usize = 256 * 1024;

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: MessageId,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<TgMessage>,
}

#[derive(Debug, Deserialize)]
struct TgMessage {
    message_id: MessageId,
    chat: TgChat,
    from: Option<TgUser>,
    text: Option<String>,
    message_thread_id: Option<i64>,
    reply_to_message: Option<Box<TgReplyRef>>,
}

#[derive(Debug, Deserialize)]
struct TgChat {
    id: i64,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct TgUser {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TgReplyRef {
    message_id: MessageId,
}

impl TgMessage {
    fn into_incoming(self) -> Option<IncomingMessage> {
        let text = self.text?;
        let reply_context = self
            .message_thread_id
            .or(self.reply_to_message.map(|r| r.message_id));
        Some(IncomingMessage {
            chat_id: self.chat.id,
            message_id: self.message_id,
            sender_id: self.from.map(|u| u.id),
            is_private: self.chat.kind == "private",
            reply_context,
            text,
        })
    }
}

/// Numeric ids go out as numbers, `@channel` names as strings.
fn chat_value(chat: &ChatTarget) -> Value {
    match chat.0.parse::<i64>() {
        Ok(id) => json!(id),
        Err(_) => json!(chat.0),
    }
}

fn reply_parameters(reply_to: Option<MessageId>) -> Option<Value> {
    reply_to.map(|id| json!({ "message_id": id, "allow_sending_without_reply": true }))
}

fn unwrap_response<T>(method: &str, resp: ApiResponse<T>) -> anyhow::Result<T> {
    if !resp.ok {
        anyhow::bail!(
            "{method} failed ({}): {}",
            resp.error_code.unwrap_or_default(),
            resp.description.unwrap_or_else(|| "no description".to_string())
        );
    }
    resp.result
        .with_context(|| format!("{method}: ok response without result"))
}

#[derive(Clone)]
pub struct TelegramClient {
    http: reqwest::Client,
    base: String,
}

impl TelegramClient {
    pub fn new(http: reqwest::Client, api_url: &str, token: &str) -> Self {
        Self {
            http,
            base: format!("{}/bot{token}", api_url.trim_end_matches('/')),
        }
    }

    fn url(&self, method: &str) -> String {
        format!("{}/{method}", self.base)
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: Value) -> anyhow::Result<T> {
        let resp = self
            .http
            .post(self.url(method))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("{method}: request"))?;
        let parsed: ApiResponse<T> = resp
            .json()
            .await
            .with_context(|| format!("{method}: decode response"))?;
        unwrap_response(method, parsed)
    }

    async fn get_updates(&self, offset: i64) -> anyhow::Result<Vec<Update>> {
        let resp = self
            .http
            .post(self.url("getUpdates"))
            .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 10))
            .json(&json!({
                "offset": offset,
                "timeout": POLL_TIMEOUT_SECS,
                "allowed_updates": ["message"],
            }))
            .send()
            .await
            .context("getUpdates: request")?;
        let parsed: ApiResponse<Vec<Update>> =
            resp.json().await.context("getUpdates: decode response")?;
        unwrap_response("getUpdates", parsed)
    }
}

#[async_trait::async_trait]
impl Messenger for TelegramClient {
    async fn send_text(
        &self,
        chat: &ChatTarget,
        text: &str,
        reply_to: Option<MessageId>,
    ) -> anyhow::Result<MessageId> {
        let mut body = json!({ "chat_id": chat_value(chat), "text": text });
        if let Some(rp) = reply_parameters(reply_to) {
            body["reply_parameters"] = rp;
        }
        let sent: SentMessage = self.call("sendMessage", body).await?;
        Ok(sent.message_id)
    }

    async fn edit_text(
        &self,
        chat: &ChatTarget,
        message_id: MessageId,
        text: &str,
    ) -> anyhow::Result<()> {
        let body = json!({ "chat_id": chat_value(chat), "message_id": message_id, "text": text });
        match self.call::<Value>("editMessageText", body).await {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("message is not modified") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn delete_message(&self, chat: &ChatTarget, message_id: MessageId) -> anyhow::Result<()> {
        let body = json!({ "chat_id": chat_value(chat), "message_id": message_id });
        self.call::<bool>("deleteMessage", body).await?;
        Ok(())
    }

    async fn send_document(
        &self,
        chat: &ChatTarget,
        reply_to: Option<MessageId>,
        document: OutgoingDocument,
        on_progress: ProgressFn,
    ) -> anyhow::Result<MessageId> {
        let file = tokio::fs::File::open(&document.path)
            .await
            .with_context(|| format!("open {}", document.path.display()))?;
        let total = file
            .metadata()
            .await
            .with_context(|| format!("stat {}", document.path.display()))?
            .len();

        // Progress is the share of the file handed to the transport so far.
        let chunks = stream::unfold((file, 0u64), move |(mut file, sent)| {
            let on_progress = on_progress.clone();
            async move {
                let mut buf = vec![0u8; UPLOAD_CHUNK_BYTES];
                match file.read(&mut buf).await {
                    Ok(0) => None,
                    Ok(n) => {
                        buf.truncate(n);
                        let sent = sent + n as u64;
                        if total > 0 {
                            on_progress(sent as f64 / total as f64);
                        }
                        Some((Ok::<_, std::io::Error>(buf), (file, sent)))
                    }
                    Err(e) => Some((Err(e), (file, sent))),
                }
            }
        });

        let doc_part = reqwest::multipart::Part::stream_with_length(
            reqwest::Body::wrap_stream(chunks),
            total,
        )
        .file_name(document.file_name.clone())
        .mime_str("application/octet-stream")?;

        let mut form = reqwest::multipart::Form::new()
            .text("chat_id", chat.0.clone())
            .text("caption", document.caption)
            .text("parse_mode", "HTML")
            .part("document", doc_part);
        if let Some(rp) = reply_parameters(reply_to) {
            form = form.text("reply_parameters", rp.to_string());
        }
        if let Some(button) = &document.button {
            let markup = json!({ "inline_keyboard": [[{ "text": button.text, "url": button.url }]] });
            form = form.text("reply_markup", markup.to_string());
        }
        if let Some(thumb) = document.thumbnail {
            let part = reqwest::multipart::Part::bytes(thumb.jpeg)
                .file_name("thumbnail.jpg")
                .mime_str("image/jpeg")?;
            form = form.part("thumbnail", part);
        }

        tracing::info!(chat = %chat, file = %document.file_name, bytes = total, "uploading document");
        let resp = self
            .http
            .post(self.url("sendDocument"))
            .multipart(form)
            .send()
            .await
            .context("sendDocument: request")?;
        let parsed: ApiResponse<SentMessage> =
            resp.json().await.context("sendDocument: decode response")?;
        Ok(unwrap_response("sendDocument", parsed)?.message_id)
    }

    async fn copy_message(
        &self,
        from_chat: &ChatTarget,
        message_id: MessageId,
        to_chat: &ChatTarget,
        reply_to: Option<MessageId>,
    ) -> anyhow::Result<MessageId> {
        let mut body = json!({
            "chat_id": chat_value(to_chat),
            "from_chat_id": chat_value(from_chat),
            "message_id": message_id,
        });
        if let Some(rp) = reply_parameters(reply_to) {
            body["reply_parameters"] = rp;
        }
        let sent: SentMessage = self.call("copyMessage", body).await?;
        Ok(sent.message_id)
    }
}

/// Long-polls for messages and hands them to the dispatcher in arrival order.
/// Transport errors back off and retry; this only returns when cancelled.
pub async fn run_update_loop(client: TelegramClient, dispatcher: Arc<Dispatcher>) {
    let span = tracing::info_span!("updates");
    async move {
        let mut offset = 0i64;
        let mut backoff = Duration::from_millis(500);
        loop {
            let updates = match client.get_updates(offset).await {
                Ok(v) => {
                    backoff = Duration::from_millis(500);
                    v
                }
                Err(e) => {
                    tracing::warn!(error = %format_error_chain(&e), "polling updates failed");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(30));
                    continue;
                }
            };

            for update in updates {
                offset = offset.max(update.update_id + 1);
                let Some(msg) = update.message.and_then(TgMessage::into_incoming) else {
                    continue;
                };
                if let Err(e) = dispatcher.handle(msg).await {
                    tracing::warn!(error = %format_error_chain(&e), "handling message failed");
                }
            }
        }
    }
    .instrument(span)
    .await
}
