//! Human-readable and JSON rendering of entry status.
use crate::state::{ExitSummary, State, StatusReport};

const GREEN_BOLD: &str = "\x1b[1;32m";
const RED_BOLD: &str = "\x1b[1;31m";
const YELLOW_BOLD: &str = "\x1b[1;33m";
const RESET: &str = "\x1b[0m";

/// Formats a duration in milliseconds as a compact uptime label.
pub fn format_uptime(uptime_ms: u64) -> String {
    let total_seconds = uptime_ms / 1_000;
    match total_seconds {
        0..=59 => format!("{total_seconds}s"),
        60..=3_599 => format!("{}m {}s", total_seconds / 60, total_seconds % 60),
        3_600..=86_399 => format!("{}h {}m", total_seconds / 3_600, (total_seconds % 3_600) / 60),
        _ => format!("{}d {}h", total_seconds / 86_400, (total_seconds % 86_400) / 3_600),
    }
}

fn describe_exit(exit: &ExitSummary) -> String {
    match (exit.code, exit.signal, exit.error.as_deref()) {
        (Some(code), _, _) => format!("exit code {code}"),
        (None, Some(signal), _) => format!("signal {signal}"),
        (None, None, Some(error)) => error.to_string(),
        _ => "unknown reason".to_string(),
    }
}

fn state_color(state: State) -> &'static str {
    match state {
        State::Running | State::Starting => GREEN_BOLD,
        State::Crashed => RED_BOLD,
        State::Restarting | State::Exited => YELLOW_BOLD,
        State::Pending | State::Stopped => "",
    }
}

/// Renders one report as a status block.
pub fn render_report(report: &StatusReport, color: bool) -> String {
    let (on, off) = match state_color(report.state) {
        "" => ("", ""),
        code if color => (code, RESET),
        _ => ("", ""),
    };

    let mut lines = vec![format!("● {} - {on}{}{off}", report.name, report.state)];
    if let Some(pid) = report.pid {
        lines.push(format!(" Main PID: {pid}"));
    }
    if let Some(started_at) = report.started_at
        && report.state.is_live()
    {
        let uptime = report.uptime_ms.map(format_uptime).unwrap_or_default();
        lines.push(format!(
            "   Active: since {}; {uptime}",
            started_at.format("%Y-%m-%d %H:%M:%S")
        ));
    }
    lines.push(format!(" Restarts: {}", report.restarts));
    if let Some(exit) = &report.last_exit {
        lines.push(format!("Last exit: {}", describe_exit(exit)));
    }
    if let Some(failure) = &report.failure {
        lines.push(format!("   Failed: {failure}"));
    }
    lines.join("\n")
}

/// Renders every report, separated by blank lines.
pub fn render_reports(reports: &[StatusReport], color: bool) -> String {
    if reports.is_empty() {
        return "No entries configured".to_string();
    }
    reports
        .iter()
        .map(|report| render_report(report, color))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Renders reports as pretty-printed JSON.
pub fn render_json(reports: &[StatusReport]) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(reports)
}
