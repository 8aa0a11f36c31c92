//! Drives the external acquisition tool for one job.
//!
//! The tool's stdout is read in raw chunks. When a chunk carries a progress
//! marker anywhere, its first line is appended to the transcript shown to the
//! requester. Success is decided solely by the
//! sentinel appearing in that transcript; the exit code is only logged.
//!
//! NOTE: chunk boundaries are not line boundaries. A burst of several lines in
//! one read surfaces only the first, and a line split across two reads may be
//! truncated or lost. This matches how the tool has always been monitored.

use std::{process::Stdio, sync::Arc, time::Duration};

use relay_job::{ItemId, RegionCode};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, BufReader},
    process::Command,
    sync::{mpsc, oneshot},
};

use crate::config::ToolConfig;
use crate::error::JobError;
use crate::messenger::{ChatTarget, MessageId, Messenger};
use crate::support::{format_error_chain, with_optional_timeout};

pub const PLACEHOLDER_TEXT: &str = "♻️ Initializing bot...";

const READ_CHUNK_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct Transcript {
    markers: Vec<String>,
    text: String,
}

impl Transcript {
    pub fn new(markers: Vec<String>) -> Self {
        Self {
            markers,
            text: String::new(),
        }
    }

    /// Returns the surfaced line when the chunk extended the transcript.
    pub fn observe_chunk(&mut self, chunk: &str) -> Option<String> {
        let line = chunk.split('\n').next().unwrap_or_default().trim();
        if line.is_empty() || !self.markers.iter().any(|m| chunk.contains(m.as_str())) {
            return None;
        }
        self.text.push_str(line);
        self.text.push('\n');
        Some(line.to_string())
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.text.contains(needle)
    }
}

#[derive(Debug, Clone)]
pub struct AcquisitionRequest {
    pub item_id: ItemId,
    pub region: RegionCode,
    /// Chat the tool reports to and the placeholder is posted in.
    pub target: ChatTarget,
    /// Request message the placeholder replies to.
    pub reply_to: Option<MessageId>,
    /// Passed through to the tool as its last argument.
    pub reply_context: Option<i64>,
}

impl AcquisitionRequest {
    fn tool_args(&self) -> [String; 4] {
        [
            self.item_id.0.clone(),
            self.region.0.clone(),
            self.target.0.clone(),
            self.reply_context
                .map(|v| v.to_string())
                .unwrap_or_default(),
        ]
    }
}

/// Output of a running tool: raw stdout chunks, then the exit code.
struct ToolOutput {
    chunks: mpsc::Receiver<String>,
    exit: oneshot::Receiver<Option<i32>>,
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // The tool must not outlive the agent.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

fn spawn_tool(tool: &ToolConfig, req: &AcquisitionRequest) -> std::io::Result<ToolOutput> {
    let mut cmd = Command::new(&tool.command);
    cmd.args(&tool.leading_args)
        .args(req.tool_args())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &tool.cwd {
        cmd.current_dir(cwd);
    }

    #[cfg(unix)]
    {
        unsafe {
            cmd.pre_exec(|| {
                set_parent_death_signal()?;
                Ok(())
            });
        }
    }

    tracing::info!(
        command = %tool.command,
        args = ?tool.leading_args,
        item_id = %req.item_id,
        region = %req.region,
        target = %req.target,
        "spawning acquisition tool"
    );
    let mut child = cmd.spawn()?;

    if let Some(err) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(err).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!("[stderr] {line}");
            }
        });
    }

    let (chunk_tx, chunk_rx) = mpsc::channel::<String>(64);
    let (mut exit_tx, exit_rx) = oneshot::channel();
    let stdout = child.stdout.take();

    // This task owns the child. If the consumer goes away (timeout), the
    // child is killed when dropped here, also once stdout has closed.
    tokio::spawn(async move {
        if let Some(mut out) = stdout {
            let mut buf = vec![0u8; READ_CHUNK_BYTES];
            loop {
                let read = tokio::select! {
                    r = out.read(&mut buf) => r,
                    _ = chunk_tx.closed() => return,
                };
                let n = match read {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        tracing::warn!(error = %e, "reading tool stdout failed");
                        break;
                    }
                };
                let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                if chunk_tx.send(chunk).await.is_err() {
                    return;
                }
            }
        }
        drop(chunk_tx);

        let waited = tokio::select! {
            r = child.wait() => r,
            _ = exit_tx.closed() => return,
        };
        let code = match waited {
            Ok(status) => status.code(),
            Err(e) => {
                tracing::warn!(error = %e, "waiting for tool failed");
                None
            }
        };
        let _ = exit_tx.send(code);
    });

    Ok(ToolOutput {
        chunks: chunk_rx,
        exit: exit_rx,
    })
}

/// Produces the artifact and its record for a job.
#[async_trait::async_trait]
pub trait Acquirer: Send + Sync {
    async fn acquire(&self, req: &AcquisitionRequest) -> Result<(), JobError>;
}

#[derive(Clone)]
pub struct AcquisitionMonitor {
    tool: ToolConfig,
    messenger: Arc<dyn Messenger>,
    timeout: Option<Duration>,
}

impl AcquisitionMonitor {
    pub fn new(tool: ToolConfig, messenger: Arc<dyn Messenger>, timeout: Option<Duration>) -> Self {
        Self {
            tool,
            messenger,
            timeout,
        }
    }

    pub async fn run(&self, req: &AcquisitionRequest) -> Result<(), JobError> {
        let placeholder = self
            .messenger
            .send_text(&req.target, PLACEHOLDER_TEXT, req.reply_to)
            .await
            .map_err(JobError::Messaging)?;

        let failed = |exit_code| JobError::AcquisitionFailed {
            item_id: req.item_id.clone(),
            exit_code,
        };

        let (transcript, exit_code) =
            match with_optional_timeout(self.timeout, self.stream(req, placeholder)).await {
                Ok(Ok(v)) => v,
                Ok(Err(e)) => {
                    tracing::error!(item_id = %req.item_id, error = %e, "failed to start acquisition tool");
                    return Err(failed(None));
                }
                Err(e) => {
                    tracing::error!(item_id = %req.item_id, error = %e, "acquisition tool timed out");
                    return Err(failed(None));
                }
            };

        if !transcript.contains(&self.tool.success_sentinel) {
            tracing::error!(
                item_id = %req.item_id,
                exit_code = ?exit_code,
                transcript = %transcript.text(),
                "acquisition tool finished without hand-off sentinel"
            );
            return Err(failed(exit_code));
        }

        tracing::info!(item_id = %req.item_id, exit_code = ?exit_code, "acquisition succeeded");
        if let Err(e) = self.messenger.delete_message(&req.target, placeholder).await {
            tracing::warn!(error = %format_error_chain(&e), "failed to delete placeholder");
        }
        Ok(())
    }

    async fn stream(
        &self,
        req: &AcquisitionRequest,
        placeholder: MessageId,
    ) -> std::io::Result<(Transcript, Option<i32>)> {
        let mut out = spawn_tool(&self.tool, req)?;
        let mut transcript = Transcript::new(self.tool.progress_markers.clone());

        while let Some(chunk) = out.chunks.recv().await {
            tracing::debug!("[stdout] {}", chunk.trim_end());
            if transcript.observe_chunk(&chunk).is_none() {
                continue;
            }
            if let Err(e) = self
                .messenger
                .edit_text(&req.target, placeholder, transcript.text())
                .await
            {
                tracing::warn!(error = %format_error_chain(&e), "failed to update progress message");
            }
        }

        let exit_code = out.exit.await.ok().flatten();
        Ok((transcript, exit_code))
    }
}

#[async_trait::async_trait]
impl Acquirer for AcquisitionMonitor {
    async fn acquire(&self, req: &AcquisitionRequest) -> Result<(), JobError> {
        self.run(req).await
    }
}
