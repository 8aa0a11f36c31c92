//! Delivers a decrypted artifact and keeps a status message updated with the
//! transfer percentage, at most once per progress window.

use std::{sync::Arc, time::Duration};

use relay_job::AppRecord;

use crate::cleanup::ArtifactLayout;
use crate::error::JobError;
use crate::messenger::{ChatTarget, MessageId, Messenger, OutgoingDocument, ProgressFn, UrlButton};
use crate::store::AppStore;
use crate::support::{format_error_chain, truncate_chars, with_optional_timeout};
use crate::thumbnail::ThumbnailSource;
use crate::throttle::{Throttle, fraction_to_percent};

const CAPTION_MAX_CHARS: usize = 500;
const CAPTION_TITLE: &str = "Release Notes";
const STORE_BUTTON_TEXT: &str = "iTunes";

/// Where the artifact goes and what it replies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub target: ChatTarget,
    pub reply_to: Option<MessageId>,
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

/// Title, `{date} · {version}`, then the notes. Length is capped on the plain
/// text before markup is added.
pub fn caption_html(record: &AppRecord) -> String {
    let subtitle = match record.release_date {
        Some(d) => format!("{} · {}", d.format("%Y-%m-%d"), record.version),
        None => record.version.clone(),
    };
    let plain = format!("{CAPTION_TITLE}\n{subtitle}\n{}", record.release_notes);
    let plain = truncate_chars(&plain, CAPTION_MAX_CHARS);
    let body = plain
        .strip_prefix(CAPTION_TITLE)
        .unwrap_or(plain.as_str());
    format!("<b>{CAPTION_TITLE}</b>{}", escape_html(body))
}

pub fn document_file_name(record: &AppRecord) -> String {
    format!("{} {}.ipa", record.track_name, record.version)
}

fn progress_text(record: &AppRecord, percent: u32) -> String {
    format!("Uploading {} - {percent}%", record.display_name())
}

fn failed_text(record: &AppRecord) -> String {
    format!("Uploading {} has failed", record.display_name())
}

#[derive(Clone)]
pub struct Uploader {
    messenger: Arc<dyn Messenger>,
    store: Arc<dyn AppStore>,
    thumbnails: Arc<dyn ThumbnailSource>,
    layout: ArtifactLayout,
    progress_window: Duration,
    timeout: Option<Duration>,
}

impl Uploader {
    pub fn new(
        messenger: Arc<dyn Messenger>,
        store: Arc<dyn AppStore>,
        thumbnails: Arc<dyn ThumbnailSource>,
        layout: ArtifactLayout,
        progress_window: Duration,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            messenger,
            store,
            thumbnails,
            layout,
            progress_window,
            timeout,
        }
    }

    /// Returns the id of the delivered document message.
    pub async fn upload(&self, record: &AppRecord, dest: &Delivery) -> Result<MessageId, JobError> {
        let incomplete = || JobError::IncompleteRecord {
            item_id: record.item_id.clone(),
        };
        if !record.is_deliverable() {
            return Err(incomplete());
        }
        let path = self
            .layout
            .decrypted_path(record.filename.trim())
            .ok_or_else(incomplete)?;

        let status = self
            .messenger
            .send_text(&dest.target, &progress_text(record, 0), dest.reply_to)
            .await
            .map_err(JobError::Messaging)?;

        let thumbnail = match self.thumbnails.thumbnail(&record.artwork_url).await {
            Ok(t) => Some(t),
            Err(e) => {
                tracing::warn!(item_id = %record.item_id, error = %format_error_chain(&e), "thumbnail unavailable");
                None
            }
        };

        let document = OutgoingDocument {
            path,
            file_name: document_file_name(record),
            caption: caption_html(record),
            button: Some(UrlButton {
                text: STORE_BUTTON_TEXT.to_string(),
                url: record.store_url.clone(),
            }),
            thumbnail,
        };

        let on_progress = self.progress_reporter(record, &dest.target, status);
        let sent = with_optional_timeout(
            self.timeout,
            self.messenger
                .send_document(&dest.target, dest.reply_to, document, on_progress),
        )
        .await
        .map_err(anyhow::Error::new)
        .and_then(|r| r);

        match sent {
            Ok(message_id) => {
                tracing::info!(item_id = %record.item_id, message_id, "artifact uploaded");
                if let Err(e) = self.store.set_file_id(&record.item_id, message_id).await {
                    tracing::error!(
                        item_id = %record.item_id,
                        error = %format_error_chain(&e),
                        "failed to record uploaded file id"
                    );
                }
                if let Err(e) = self.messenger.delete_message(&dest.target, status).await {
                    tracing::debug!(error = %format_error_chain(&e), "failed to delete status message");
                }
                Ok(message_id)
            }
            Err(e) => {
                tracing::error!(item_id = %record.item_id, error = %format_error_chain(&e), "upload failed");
                if let Err(edit) = self
                    .messenger
                    .edit_text(&dest.target, status, &failed_text(record))
                    .await
                {
                    tracing::warn!(error = %format_error_chain(&edit), "failed to report upload failure");
                }
                match self.store.delete_latest(&record.item_id).await {
                    Ok(_) => {}
                    Err(del) => {
                        tracing::warn!(error = %format_error_chain(&del), "failed to drop record after upload failure")
                    }
                }
                Err(JobError::TransferFailed {
                    item_id: record.item_id.clone(),
                    source: e,
                })
            }
        }
    }

    fn progress_reporter(&self, record: &AppRecord, chat: &ChatTarget, status: MessageId) -> ProgressFn {
        let throttle = Throttle::new(self.progress_window, 0);
        let messenger = self.messenger.clone();
        let chat = chat.clone();
        let record = record.clone();

        Arc::new(move |fraction: f64| {
            let messenger = messenger.clone();
            let chat = chat.clone();
            let text_for = {
                let record = record.clone();
                move |p: u32| progress_text(&record, p)
            };
            throttle.offer(fraction_to_percent(fraction), move |percent| async move {
                // The status may already be gone once the transfer finishes.
                if let Err(e) = messenger.edit_text(&chat, status, &text_for(percent)).await {
                    tracing::debug!(error = %format_error_chain(&e), "progress edit skipped");
                }
            });
        })
    }
}
