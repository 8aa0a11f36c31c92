//! Routes inbound chat messages: access checks, then one of the closed set of
//! commands.

use std::sync::Arc;

use relay_job::{Job, JobOrigin};

use crate::cleanup::{ArtifactLayout, clear_dir};
use crate::command::{Command, ParsedRequest, parse_command};
use crate::config::AccessConfig;
use crate::error::JobError;
use crate::messenger::{ChatTarget, MessageId, Messenger};
use crate::runner::{Admission, JobRunner};
use crate::store::AppStore;
use crate::support::format_error_chain;

pub const INVALID_URL_TEXT: &str = "❌ Invalid App Store URL.";
pub const DUPLICATE_TEXT: &str = "⌛ That app is already in the queue. Please wait...";
pub const QUEUED_TEXT: &str = "⏳ Your request has been added to the queue. Please wait...";
pub const REBOOT_DONE_TEXT: &str = "Done";

fn full_text(capacity: usize) -> String {
    format!("⌛ Maximum request limit of {capacity} reached. Please try again later.")
}

/// Transport-neutral view of an inbound text message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub chat_id: i64,
    pub message_id: MessageId,
    pub sender_id: Option<i64>,
    pub is_private: bool,
    /// Message (or forum topic) this one replies to.
    pub reply_context: Option<i64>,
    pub text: String,
}

impl AccessConfig {
    pub fn is_admin(&self, sender: Option<i64>) -> bool {
        sender.is_some_and(|s| self.admin_ids.contains(&s))
    }

    pub fn allows(&self, msg: &IncomingMessage) -> bool {
        if msg.is_private {
            return self.is_admin(msg.sender_id);
        }
        let Some(idx) = self.chat_ids.iter().position(|c| *c == msg.chat_id) else {
            return false;
        };
        match self.topic_ids.get(idx).copied().unwrap_or(0) {
            0 => true,
            topic => msg.reply_context == Some(topic),
        }
    }
}

pub struct Dispatcher {
    runner: JobRunner,
    messenger: Arc<dyn Messenger>,
    store: Arc<dyn AppStore>,
    layout: ArtifactLayout,
    access: AccessConfig,
    capacity: usize,
}

impl Dispatcher {
    pub fn new(
        runner: JobRunner,
        messenger: Arc<dyn Messenger>,
        store: Arc<dyn AppStore>,
        layout: ArtifactLayout,
        access: AccessConfig,
        capacity: usize,
    ) -> Self {
        Self {
            runner,
            messenger,
            store,
            layout,
            access,
            capacity,
        }
    }

    pub async fn handle(&self, msg: IncomingMessage) -> anyhow::Result<()> {
        if !self.access.allows(&msg) {
            tracing::debug!(chat_id = msg.chat_id, sender_id = ?msg.sender_id, "message from unauthorised source ignored");
            return Ok(());
        }

        match parse_command(&msg.text) {
            Command::Request(parsed) => self.request(&msg, parsed).await,
            Command::Reboot if self.access.is_admin(msg.sender_id) => self.reboot(&msg).await,
            Command::Delete(parsed) if self.access.is_admin(msg.sender_id) => {
                self.delete(&msg, parsed).await
            }
            Command::Reboot | Command::Delete(_) => {
                tracing::warn!(sender_id = ?msg.sender_id, "admin command from non-admin ignored");
                Ok(())
            }
            Command::Unrecognized => Ok(()),
        }
    }

    async fn reply(&self, msg: &IncomingMessage, text: &str) -> anyhow::Result<()> {
        self.messenger
            .send_text(&ChatTarget::from(msg.chat_id), text, Some(msg.message_id))
            .await?;
        Ok(())
    }

    async fn request(&self, msg: &IncomingMessage, parsed: ParsedRequest) -> anyhow::Result<()> {
        let req = match parsed {
            Ok(r) => r,
            Err(reason) => {
                let err = JobError::from(reason);
                tracing::info!(error = %err, "request rejected");
                return self.reply(msg, INVALID_URL_TEXT).await;
            }
        };

        let job = Job::new(
            req.item_id,
            req.region,
            JobOrigin {
                chat_id: msg.chat_id,
                message_id: msg.message_id,
                reply_context: msg.reply_context,
                sender_id: msg.sender_id,
            },
        );
        match self.runner.submit(job) {
            Admission::Started => Ok(()),
            Admission::Queued { .. } => self.reply(msg, QUEUED_TEXT).await,
            Admission::Duplicate => self.reply(msg, DUPLICATE_TEXT).await,
            Admission::Full => self.reply(msg, &full_text(self.capacity)).await,
        }
    }

    async fn reboot(&self, msg: &IncomingMessage) -> anyhow::Result<()> {
        tracing::warn!(sender_id = ?msg.sender_id, "reboot requested");
        self.store.close().await;
        let decrypted = clear_dir(&self.layout.decrypted_dir()).await;
        let encrypted = clear_dir(&self.layout.encrypted_dir()).await;
        tracing::info!(
            decrypted = decrypted.removed,
            encrypted = encrypted.removed,
            "artifact directories cleared"
        );
        self.reply(msg, REBOOT_DONE_TEXT).await
    }

    async fn delete(&self, msg: &IncomingMessage, parsed: ParsedRequest) -> anyhow::Result<()> {
        let req = match parsed {
            Ok(r) => r,
            Err(_) => return self.reply(msg, INVALID_URL_TEXT).await,
        };

        let deleted = match self.store.delete_latest(&req.item_id).await {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(item_id = %req.item_id, error = %format_error_chain(&e), "delete failed");
                false
            }
        };
        let text = if deleted {
            format!("✅ Deleted app with trackId: {}", req.item_id)
        } else {
            format!("❌ Failed to delete app with trackId: {}", req.item_id)
        };
        self.reply(msg, &text).await
    }
}
