use std::{panic::AssertUnwindSafe, sync::Arc};

use futures_util::FutureExt;
use relay_job::{AppRecord, Job};

use crate::acquisition::{AcquisitionRequest, Acquirer};
use crate::cleanup::{ArtifactLayout, CleanupTarget, remove_job_artifacts};
use crate::error::JobError;
use crate::messenger::{ChatTarget, Messenger};
use crate::runner::JobHandler;
use crate::store::AppStore;
use crate::upload::{Delivery, Uploader};

/// One job end to end: lookup, acquire if needed, deliver, clean up.
pub struct DeliveryPipeline {
    store: Arc<dyn AppStore>,
    acquirer: Arc<dyn Acquirer>,
    uploader: Uploader,
    messenger: Arc<dyn Messenger>,
    layout: ArtifactLayout,
}

fn requester(job: &Job) -> ChatTarget {
    ChatTarget::from(job.origin.chat_id)
}

/// Uploads go to the record's chat. A reply to the request only makes sense
/// in the chat it was sent from; elsewhere the record's topic is used.
fn delivery_for(record: &AppRecord, job: &Job) -> Delivery {
    let origin = requester(job);
    let target = match record.chat_id.trim() {
        "" => origin.clone(),
        chat => ChatTarget::from(chat),
    };
    let reply_to = if target == origin {
        Some(job.origin.message_id)
    } else {
        record
            .topic_id
            .as_deref()
            .and_then(|t| t.trim().parse::<i64>().ok())
            .filter(|t| *t != 0)
    };
    Delivery { target, reply_to }
}

fn acquisition_for(job: &Job) -> AcquisitionRequest {
    AcquisitionRequest {
        item_id: job.item_id.clone(),
        region: job.region.clone(),
        target: requester(job),
        reply_to: Some(job.origin.message_id),
        reply_context: job.origin.reply_context,
    }
}

impl DeliveryPipeline {
    pub fn new(
        store: Arc<dyn AppStore>,
        acquirer: Arc<dyn Acquirer>,
        uploader: Uploader,
        messenger: Arc<dyn Messenger>,
        layout: ArtifactLayout,
    ) -> Self {
        Self {
            store,
            acquirer,
            uploader,
            messenger,
            layout,
        }
    }

    /// `found` is filled with whatever record the job got hold of, so cleanup
    /// can run whatever the outcome.
    async fn deliver(&self, job: &Job, found: &mut Option<AppRecord>) -> Result<(), JobError> {
        let existing = self
            .store
            .find_latest(&job.item_id)
            .await
            .map_err(JobError::PersistenceUnavailable)?;

        let record = match existing {
            Some(r) => {
                *found = Some(r.clone());
                if r.uploaded_file_id().is_some() {
                    return self.resend(job, &r).await;
                }
                tracing::info!("record exists without upload, delivering directly");
                r
            }
            None => {
                tracing::info!("no record, acquiring");
                let acquired = self.acquirer.acquire(&acquisition_for(job)).await;
                let after = self.store.find_latest(&job.item_id).await;
                if let Err(e) = acquired {
                    if let Ok(Some(r)) = after {
                        *found = Some(r);
                    }
                    return Err(e);
                }
                let r = after
                    .map_err(JobError::PersistenceUnavailable)?
                    .ok_or_else(|| JobError::RecordMissing {
                        item_id: job.item_id.clone(),
                    })?;
                *found = Some(r.clone());
                r
            }
        };

        self.uploader
            .upload(&record, &delivery_for(&record, job))
            .await
            .map(|_| ())
    }

    async fn resend(&self, job: &Job, record: &AppRecord) -> Result<(), JobError> {
        let Some(file_id) = record.uploaded_file_id() else {
            return Ok(());
        };
        tracing::info!(file_id, "artifact already uploaded, re-sending");
        self.messenger
            .copy_message(
                &ChatTarget::from(record.chat_id.as_str()),
                file_id,
                &requester(job),
                Some(job.origin.message_id),
            )
            .await
            .map_err(JobError::Messaging)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl JobHandler for DeliveryPipeline {
    async fn run(&self, job: Job) -> Result<(), JobError> {
        let mut found = None;
        let result = AssertUnwindSafe(self.deliver(&job, &mut found))
            .catch_unwind()
            .await;
        if let Some(record) = &found {
            remove_job_artifacts(&self.layout, &CleanupTarget::from(record)).await;
        }
        match result {
            Ok(outcome) => outcome,
            // Cleanup done; the runner reports the panic.
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}
