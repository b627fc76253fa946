//! Text summary builder for CLI output.
//!
//! Formats the board and session statistics as human-readable lines.

use crate::metrics;
use crate::model::{Board, SessionReport};

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

/// Render a board, one container per block.
pub(crate) fn board_lines(board: &Board) -> Vec<String> {
    let mut lines = Vec::new();
    if board.containers.is_empty() {
        lines.push("(empty board)".to_string());
        return lines;
    }
    for container in &board.containers {
        let count = container.items.len();
        lines.push(format!(
            "[{}] {} ({} {})",
            container.id,
            container.title,
            count,
            if count == 1 { "item" } else { "items" }
        ));
        if !container.description.trim().is_empty() {
            lines.push(format!("    {}", container.description));
        }
        for (idx, item) in container.items.iter().enumerate() {
            lines.push(format!("  {idx:>2}. {} ({})", item.title, item.id));
        }
    }
    lines
}

/// Build a text summary of a finished session.
pub(crate) fn build_text_summary(report: &SessionReport) -> TextSummary {
    let mut lines = board_lines(&report.board);
    lines.push(String::new());
    lines.push(format!(
        "Drags: {}  Syncs: {} started, {} completed, {} superseded, {} failed",
        report.drags,
        report.syncs_started,
        report.syncs_completed,
        report.syncs_superseded,
        report.syncs_failed
    ));
    if let Some(ratio) = metrics::superseded_ratio(report.syncs_started, report.syncs_superseded) {
        lines.push(format!("Superseded: {:.0}%", ratio * 100.0));
    }
    if let Some((mean, median, p25, p75)) = metrics::compute_rtt_metrics(&report.rtt_ms) {
        lines.push(format!(
            "Round trip: avg {:.1} ms med {:.1} p25 {:.1} p75 {:.1}",
            mean, median, p25, p75
        ));
    }
    if let Some(resp) = report.last_response.as_deref() {
        if !resp.trim().is_empty() {
            lines.push(format!("Last response: {}", resp.trim()));
        }
    }
    TextSummary { lines }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Container, Item, TransportKind};

    #[test]
    fn summary_lists_items_in_order_and_stats() {
        let report = SessionReport {
            timestamp_utc: "2026-01-01T00:00:00Z".into(),
            transport: TransportKind::Rest,
            drags: 2,
            syncs_started: 2,
            syncs_completed: 1,
            syncs_superseded: 1,
            syncs_failed: 0,
            rtt_ms: vec![10.0, 30.0],
            last_response: Some("ok".into()),
            board: Board {
                containers: vec![Container {
                    id: "container-1".into(),
                    title: "Todo".into(),
                    description: String::new(),
                    position: 0,
                    items: vec![Item {
                        id: "item-1".into(),
                        title: "First".into(),
                        position: 0,
                    }],
                }],
            },
        };
        let summary = build_text_summary(&report);
        assert_eq!(summary.lines[0], "[container-1] Todo (1 item)");
        assert_eq!(summary.lines[1], "   0. First (item-1)");
        assert!(summary.lines.iter().any(|l| l == "Superseded: 50%"));
        assert!(summary.lines.iter().any(|l| l.starts_with("Round trip: avg 20.0 ms")));
        assert!(summary.lines.iter().any(|l| l == "Last response: ok"));
    }

    #[test]
    fn item_count_is_pluralised() {
        let container = |id: &str, n: usize| Container {
            id: id.into(),
            title: "Col".into(),
            description: String::new(),
            position: 0,
            items: (0..n)
                .map(|position| Item {
                    id: format!("item-{id}-{position}"),
                    title: "x".into(),
                    position,
                })
                .collect(),
        };
        let board = Board {
            containers: vec![container("a", 0), container("b", 1), container("c", 2)],
        };
        let headers: Vec<String> = board_lines(&board)
            .into_iter()
            .filter(|l| l.starts_with('['))
            .collect();
        assert_eq!(
            headers,
            vec!["[a] Col (0 items)", "[b] Col (1 item)", "[c] Col (2 items)"]
        );
    }

    #[test]
    fn empty_board_has_placeholder() {
        assert_eq!(board_lines(&Board::default()), vec!["(empty board)".to_string()]);
    }
}
