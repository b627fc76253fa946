//! Post-session processing.
//!
//! Builds the session report and handles exports after a session completes.

use crate::model::{SessionReport, TransportKind};
use crate::orchestrator::SessionOutcome;
use anyhow::{Context, Result};
use std::path::Path;

/// Summarise a finished session.
pub(crate) fn build_report(outcome: &SessionOutcome, transport: TransportKind) -> SessionReport {
    let stats = &outcome.stats;
    SessionReport {
        timestamp_utc: time::OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_else(|_| "now".into()),
        transport,
        drags: stats.drags,
        syncs_started: stats.started,
        syncs_completed: stats.completed,
        syncs_superseded: stats.superseded,
        syncs_failed: stats.failed,
        rtt_ms: stats.rtt_ms.clone(),
        last_response: stats.last_response.clone(),
        board: outcome.board.clone(),
    }
}

/// Write the report as pretty JSON, creating parent directories as needed.
pub(crate) fn export_json(path: &Path, report: &SessionReport) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
