use std::{path::PathBuf, time::Duration};

use anyhow::Context;

use crate::support::{non_empty, parse_list, parse_u64};

const DEFAULT_TELEGRAM_API_URL: &str = "https://api.telegram.org";
const DEFAULT_ARTIFACT_ROOT: &str = "./ipa-files";
const DEFAULT_TOOL_COMMAND: &str = "yarn";
const DEFAULT_TOOL_ARGS: &str = "up";
const DEFAULT_SUCCESS_SENTINEL: &str = "Starting IPA upload";
const DEFAULT_QUEUE_CAPACITY: usize = 5;
const DEFAULT_PROGRESS_WINDOW_MS: u64 = 3000;

/// Status lines from the acquisition tool are prefixed with one of these.
const DEFAULT_PROGRESS_MARKERS: &[&str] = &[
    "♻️", "⏳", "⌛", "🔍", "📥", "📤", "🔓", "🔐", "📦", "🚀", "✅", "❌", "⚠️",
];

#[derive(Debug, Clone)]
pub struct ToolConfig {
    pub command: String,
    pub leading_args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub success_sentinel: String,
    pub progress_markers: Vec<String>,
}

/// Both default to `None`: a hung tool or transfer blocks the queue, same as
/// it always has. Set the env vars to opt in.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timeouts {
    pub tool: Option<Duration>,
    pub upload: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct AccessConfig {
    pub admin_ids: Vec<i64>,
    pub chat_ids: Vec<i64>,
    /// Parallel to `chat_ids`; 0 means "any topic".
    pub topic_ids: Vec<i64>,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub telegram_token: String,
    pub telegram_api_url: String,
    pub database_url: String,
    pub artifact_root: PathBuf,
    pub queue_capacity: usize,
    pub progress_window: Duration,
    pub tool: ToolConfig,
    pub timeouts: Timeouts,
    pub access: AccessConfig,
    pub log_dir: Option<PathBuf>,
}

fn parse_ids(name: &str, raw: Option<String>) -> anyhow::Result<Vec<i64>> {
    parse_list(raw)
        .into_iter()
        .map(|v| {
            v.parse::<i64>()
                .with_context(|| format!("{name}: invalid id {v:?}"))
        })
        .collect()
}

impl AgentConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(get: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let telegram_token = non_empty(get("RELAY_TELEGRAM_BOT_TOKEN"))
            .context("RELAY_TELEGRAM_BOT_TOKEN is required")?;
        let database_url =
            non_empty(get("RELAY_DATABASE_URL")).context("RELAY_DATABASE_URL is required")?;

        let telegram_api_url = non_empty(get("RELAY_TELEGRAM_API_URL"))
            .unwrap_or_else(|| DEFAULT_TELEGRAM_API_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let artifact_root = non_empty(get("RELAY_ARTIFACT_ROOT"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ARTIFACT_ROOT));

        let queue_capacity = parse_u64(get("RELAY_QUEUE_CAPACITY"))
            .map(|v| v.clamp(1, 100) as usize)
            .unwrap_or(DEFAULT_QUEUE_CAPACITY);

        let progress_window = Duration::from_millis(
            parse_u64(get("RELAY_PROGRESS_WINDOW_MS"))
                .map(|v| v.clamp(250, 60_000))
                .unwrap_or(DEFAULT_PROGRESS_WINDOW_MS),
        );

        let leading_args = match get("RELAY_TOOL_ARGS") {
            Some(v) => v.split_whitespace().map(str::to_string).collect(),
            None => vec![DEFAULT_TOOL_ARGS.to_string()],
        };
        let mut progress_markers = parse_list(get("RELAY_PROGRESS_MARKERS"));
        if progress_markers.is_empty() {
            progress_markers = DEFAULT_PROGRESS_MARKERS
                .iter()
                .map(|s| s.to_string())
                .collect();
        }
        let tool = ToolConfig {
            command: non_empty(get("RELAY_TOOL_COMMAND"))
                .unwrap_or_else(|| DEFAULT_TOOL_COMMAND.to_string()),
            leading_args,
            cwd: non_empty(get("RELAY_TOOL_CWD")).map(PathBuf::from),
            success_sentinel: non_empty(get("RELAY_SUCCESS_SENTINEL"))
                .unwrap_or_else(|| DEFAULT_SUCCESS_SENTINEL.to_string()),
            progress_markers,
        };

        let timeouts = Timeouts {
            tool: parse_u64(get("RELAY_TOOL_TIMEOUT_SEC"))
                .filter(|v| *v > 0)
                .map(Duration::from_secs),
            upload: parse_u64(get("RELAY_UPLOAD_TIMEOUT_SEC"))
                .filter(|v| *v > 0)
                .map(Duration::from_secs),
        };

        let access = AccessConfig {
            admin_ids: parse_ids("RELAY_ADMIN_IDS", get("RELAY_ADMIN_IDS"))?,
            chat_ids: parse_ids("RELAY_CHAT_IDS", get("RELAY_CHAT_IDS"))?,
            topic_ids: parse_ids("RELAY_TOPIC_IDS", get("RELAY_TOPIC_IDS"))?,
        };

        Ok(Self {
            telegram_token,
            telegram_api_url,
            database_url,
            artifact_root,
            queue_capacity,
            progress_window,
            tool,
            timeouts,
            access,
            log_dir: non_empty(get("RELAY_LOG_DIR")).map(PathBuf::from),
        })
    }
}
