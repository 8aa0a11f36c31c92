use std::{fmt, path::PathBuf, sync::Arc};

pub type MessageId = i64;

/// A conversation the transport can address: numeric chat id or `@name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChatTarget(pub String);

impl From<i64> for ChatTarget {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

impl From<&str> for ChatTarget {
    fn from(value: &str) -> Self {
        Self(value.trim().to_string())
    }
}

impl fmt::Display for ChatTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Called with the completed fraction (0.0..=1.0), possibly very often.
pub type ProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlButton {
    pub text: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thumbnail {
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct OutgoingDocument {
    pub path: PathBuf,
    pub file_name: String,
    /// HTML-formatted caption.
    pub caption: String,
    pub button: Option<UrlButton>,
    pub thumbnail: Option<Thumbnail>,
}

#[async_trait::async_trait]
pub trait Messenger: Send + Sync {
    async fn send_text(
        &self,
        chat: &ChatTarget,
        text: &str,
        reply_to: Option<MessageId>,
    ) -> anyhow::Result<MessageId>;

    async fn edit_text(
        &self,
        chat: &ChatTarget,
        message_id: MessageId,
        text: &str,
    ) -> anyhow::Result<()>;

    async fn delete_message(&self, chat: &ChatTarget, message_id: MessageId)
    -> anyhow::Result<()>;

    async fn send_document(
        &self,
        chat: &ChatTarget,
        reply_to: Option<MessageId>,
        document: OutgoingDocument,
        on_progress: ProgressFn,
    ) -> anyhow::Result<MessageId>;

    /// Re-sends an earlier message (an already uploaded artifact) elsewhere.
    async fn copy_message(
        &self,
        from_chat: &ChatTarget,
        message_id: MessageId,
        to_chat: &ChatTarget,
        reply_to: Option<MessageId>,
    ) -> anyhow::Result<MessageId>;
}
