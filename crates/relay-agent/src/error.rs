use relay_job::ItemId;

/// Everything that can end a job early. None of these escape the runner;
/// they are logged and the job still goes through cleanup and `complete()`.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] crate::command::RejectReason),

    #[error("acquisition failed for {item_id} (exit code {exit_code:?})")]
    AcquisitionFailed {
        item_id: ItemId,
        exit_code: Option<i32>,
    },

    #[error("transfer failed for {item_id}")]
    TransferFailed {
        item_id: ItemId,
        #[source]
        source: anyhow::Error,
    },

    #[error("persistence unavailable")]
    PersistenceUnavailable(#[source] anyhow::Error),

    #[error("no record for {item_id} after acquisition")]
    RecordMissing { item_id: ItemId },

    #[error("record for {item_id} is missing upload fields")]
    IncompleteRecord { item_id: ItemId },

    #[error("messaging transport error")]
    Messaging(#[source] anyhow::Error),
}
