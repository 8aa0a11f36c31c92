//! In-memory stand-ins for the transport, the store and thumbnailing.

use std::{
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use relay_job::{AppRecord, ItemId};

use crate::messenger::{
    ChatTarget, MessageId, Messenger, OutgoingDocument, ProgressFn, Thumbnail, UrlButton,
};
use crate::store::AppStore;
use crate::thumbnail::ThumbnailSource;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Send {
        chat: ChatTarget,
        text: String,
        reply_to: Option<MessageId>,
        id: MessageId,
    },
    Edit {
        chat: ChatTarget,
        id: MessageId,
        text: String,
    },
    Delete {
        chat: ChatTarget,
        id: MessageId,
    },
    Document {
        chat: ChatTarget,
        reply_to: Option<MessageId>,
        file_name: String,
        caption: String,
        button: Option<UrlButton>,
        has_thumbnail: bool,
        id: Option<MessageId>,
    },
    Copy {
        from_chat: ChatTarget,
        message_id: MessageId,
        to_chat: ChatTarget,
        reply_to: Option<MessageId>,
    },
}

#[derive(Default)]
pub struct FakeMessenger {
    calls: Mutex<Vec<Call>>,
    next_id: AtomicI64,
    progress: Vec<(Duration, f64)>,
    document_delay: Option<Duration>,
    fail_documents: bool,
    fail_copies: bool,
}

impl FakeMessenger {
    /// `send_document` sleeps then reports each fraction, in order.
    pub fn with_progress(mut self, script: Vec<(Duration, f64)>) -> Self {
        self.progress = script;
        self
    }

    pub fn with_document_delay(mut self, delay: Duration) -> Self {
        self.document_delay = Some(delay);
        self
    }

    pub fn failing_documents(mut self) -> Self {
        self.fail_documents = true;
        self
    }

    pub fn failing_copies(mut self) -> Self {
        self.fail_copies = true;
        self
    }

    fn id(&self) -> MessageId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn push(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Send { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn sent_ids(&self) -> Vec<MessageId> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Send { id, .. } => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn edits_of(&self, message_id: MessageId) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Edit { id, text, .. } if id == message_id => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn all_edit_texts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Edit { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn deleted(&self) -> Vec<MessageId> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Delete { id, .. } => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn was_deleted(&self, message_id: MessageId) -> bool {
        self.deleted().contains(&message_id)
    }

    pub fn documents(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Document { .. }))
            .collect()
    }

    pub fn copies(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Copy { .. }))
            .collect()
    }
}

#[async_trait::async_trait]
impl Messenger for FakeMessenger {
    async fn send_text(
        &self,
        chat: &ChatTarget,
        text: &str,
        reply_to: Option<MessageId>,
    ) -> anyhow::Result<MessageId> {
        let id = self.id();
        self.push(Call::Send {
            chat: chat.clone(),
            text: text.to_string(),
            reply_to,
            id,
        });
        Ok(id)
    }

    async fn edit_text(
        &self,
        chat: &ChatTarget,
        message_id: MessageId,
        text: &str,
    ) -> anyhow::Result<()> {
        self.push(Call::Edit {
            chat: chat.clone(),
            id: message_id,
            text: text.to_string(),
        });
        Ok(())
    }

    async fn delete_message(&self, chat: &ChatTarget, message_id: MessageId) -> anyhow::Result<()> {
        self.push(Call::Delete {
            chat: chat.clone(),
            id: message_id,
        });
        Ok(())
    }

    async fn send_document(
        &self,
        chat: &ChatTarget,
        reply_to: Option<MessageId>,
        document: OutgoingDocument,
        on_progress: ProgressFn,
    ) -> anyhow::Result<MessageId> {
        for (delay, fraction) in &self.progress {
            tokio::time::sleep(*delay).await;
            on_progress(*fraction);
        }
        if let Some(delay) = self.document_delay {
            tokio::time::sleep(delay).await;
        }

        let id = (!self.fail_documents).then(|| self.id());
        self.push(Call::Document {
            chat: chat.clone(),
            reply_to,
            file_name: document.file_name,
            caption: document.caption,
            button: document.button,
            has_thumbnail: document.thumbnail.is_some(),
            id,
        });
        id.ok_or_else(|| anyhow::anyhow!("upload rejected"))
    }

    async fn copy_message(
        &self,
        from_chat: &ChatTarget,
        message_id: MessageId,
        to_chat: &ChatTarget,
        reply_to: Option<MessageId>,
    ) -> anyhow::Result<MessageId> {
        self.push(Call::Copy {
            from_chat: from_chat.clone(),
            message_id,
            to_chat: to_chat.clone(),
            reply_to,
        });
        if self.fail_copies {
            anyhow::bail!("message to copy not found");
        }
        Ok(self.id())
    }
}

/// Records in insertion order; the last one per item is the latest.
#[derive(Default)]
pub struct FakeStore {
    records: Mutex<Vec<AppRecord>>,
    fail_lookups: AtomicBool,
    closes: AtomicUsize,
}

impl FakeStore {
    pub fn with_records(records: Vec<AppRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            ..Self::default()
        }
    }

    pub fn failing_lookups(self) -> Self {
        self.fail_lookups.store(true, Ordering::Relaxed);
        self
    }

    pub fn insert(&self, record: AppRecord) {
        self.records.lock().unwrap().push(record);
    }

    pub fn latest(&self, item_id: &ItemId) -> Option<AppRecord> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| &r.item_id == item_id)
            .cloned()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl AppStore for FakeStore {
    async fn find_latest(&self, item_id: &ItemId) -> anyhow::Result<Option<AppRecord>> {
        if self.fail_lookups.load(Ordering::Relaxed) {
            anyhow::bail!("connection refused");
        }
        Ok(self.latest(item_id))
    }

    async fn delete_latest(&self, item_id: &ItemId) -> anyhow::Result<bool> {
        let mut records = self.records.lock().unwrap();
        match records.iter().rposition(|r| &r.item_id == item_id) {
            Some(idx) => {
                records.remove(idx);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_file_id(&self, item_id: &ItemId, file_id: MessageId) -> anyhow::Result<()> {
        let mut records = self.records.lock().unwrap();
        if let Some(r) = records.iter_mut().rev().find(|r| &r.item_id == item_id) {
            r.file_id = Some(file_id);
        }
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct FakeThumbnails {
    fail: bool,
}

impl FakeThumbnails {
    pub fn ok() -> Self {
        Self { fail: false }
    }

    pub fn failing() -> Self {
        Self { fail: true }
    }
}

#[async_trait::async_trait]
impl ThumbnailSource for FakeThumbnails {
    async fn thumbnail(&self, _artwork_url: &str) -> anyhow::Result<Thumbnail> {
        if self.fail {
            anyhow::bail!("artwork unreachable");
        }
        Ok(Thumbnail {
            jpeg: vec![0xFF, 0xD8, 0xFF, 0xD9],
            width: 150,
            height: 150,
        })
    }
}

pub fn sample_record(item_id: &str) -> AppRecord {
    AppRecord {
        item_id: ItemId(item_id.to_string()),
        file_id: None,
        bundle_id: format!("com.example.app{item_id}"),
        filename: format!("App{item_id}_1.0.ipa"),
        track_name: "App".to_string(),
        version: "1.0".to_string(),
        release_notes: "Fixes".to_string(),
        release_date: None,
        store_url: format!("https://apps.apple.com/us/app/x/id{item_id}"),
        artwork_url: "https://example.com/art.png".to_string(),
        chat_id: "-100".to_string(),
        topic_id: None,
    }
}
