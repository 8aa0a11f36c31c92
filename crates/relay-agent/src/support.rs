use std::{future::Future, time::Duration};

pub(crate) fn parse_u64(raw: Option<String>) -> Option<u64> {
    raw.and_then(|v| v.trim().parse::<u64>().ok())
}

pub(crate) fn parse_list(raw: Option<String>) -> Vec<String> {
    raw.map(|v| {
        v.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

pub(crate) fn non_empty(raw: Option<String>) -> Option<String> {
    raw.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

pub(crate) fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

#[derive(Debug, thiserror::Error)]
#[error("timed out after {}ms", .0.as_millis())]
pub(crate) struct TimedOut(pub Duration);

/// `None` waits forever. Every long-running await in a job goes through here
/// so the timeout policy has exactly one switch.
pub(crate) async fn with_optional_timeout<F, T>(
    limit: Option<Duration>,
    fut: F,
) -> Result<T, TimedOut>
where
    F: Future<Output = T>,
{
    match limit {
        None => Ok(fut.await),
        Some(d) => tokio::time::timeout(d, fut).await.map_err(|_| TimedOut(d)),
    }
}

/// Cuts on a char boundary and appends `...` when something was dropped.
pub(crate) fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        None => s.to_string(),
        Some((end, _)) => format!("{}...", &s[..end]),
    }
}
