//! Line-oriented broadcast input (`--broadcast-stdin`).

use botlink_server::Broadcaster;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// What a forwarding run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardStats {
    pub broadcast: usize,
    pub skipped: usize,
}

/// Broadcast every line of `reader` that holds a JSON object, until EOF.
///
/// Blank lines are ignored; other non-object lines are skipped with a
/// warning. A read error ends the run.
pub async fn forward_lines<R>(reader: R, broadcaster: &Broadcaster) -> anyhow::Result<ForwardStats>
where
    R: AsyncBufRead + Unpin,
{
    let mut stats = ForwardStats::default();
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(message @ Value::Object(_)) => {
                let report = broadcaster.broadcast(&message).await?;
                tracing::debug!(
                    attempted = report.attempted,
                    delivered = report.delivered,
                    "forwarded input line"
                );
                stats.broadcast += 1;
            }
            Ok(_) => {
                tracing::warn!("skipping input line: not a JSON object");
                stats.skipped += 1;
            }
            Err(e) => {
                tracing::warn!(error = %e, "skipping input line: invalid JSON");
                stats.skipped += 1;
            }
        }
    }
    Ok(stats)
}

/// [`forward_lines`] as a background task: the outcome is logged, since
/// nothing awaits it.
pub async fn run_forwarder<R>(reader: R, broadcaster: Broadcaster)
where
    R: AsyncBufRead + Unpin,
{
    match forward_lines(reader, &broadcaster).await {
        Ok(stats) => tracing::info!(
            broadcast = stats.broadcast,
            skipped = stats.skipped,
            "broadcast input closed"
        ),
        Err(e) => tracing::error!(error = %format!("{e:#}"), "broadcast input failed, no longer forwarding"),
    }
}
