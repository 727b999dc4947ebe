use crate::error::CliError;
use model::{
    core::time::DisplayTimezone,
    journal::{JournalRecord, ProcessState},
};
use serde::Serialize;
use std::fmt::Write;

pub fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{json}");
    Ok(())
}

#[derive(Serialize)]
pub struct StatusView<'a> {
    pub process: &'a str,
    pub state: Option<&'a ProcessState>,
    pub recent: &'a [JournalRecord],
}

/// Plain-text status: the process state followed by its latest records,
/// newest first. Instants are shown in `tz`.
pub fn render_status(view: &StatusView<'_>, tz: DisplayTimezone) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Journal status for process '{}':", view.process);
    let _ = writeln!(out, "-----------------------------");

    match view.state {
        Some(state) => {
            let status = state
                .last_status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "n/a".to_string());
            let _ = writeln!(out, "{:<16} {}", "Last status", status);
            let _ = writeln!(out, "{:<16} {}", "Healthy", state.healthy);
            let _ = writeln!(out, "{:<16} {}", "Watermark", tz.format_opt(state.last_ok_end.as_ref()));
            let _ = writeln!(out, "{:<16} {}", "Last started", tz.format_opt(state.last_started_at.as_ref()));
            let _ = writeln!(out, "{:<16} {}", "Last heartbeat", tz.format_opt(state.last_heartbeat.as_ref()));
            if let Some(message) = &state.last_error_message {
                let component = state.last_error_component.as_deref().unwrap_or("unknown");
                let _ = writeln!(
                    out,
                    "{:<16} {} [{}] {}",
                    "Last error",
                    tz.format_opt(state.last_error_at.as_ref()),
                    component,
                    message
                );
            }
        }
        None => {
            let _ = writeln!(out, "No state recorded yet");
        }
    }

    if view.recent.is_empty() {
        return out;
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "{:<8} {:<8} {:<31} {:<31} {}", "ID", "STATUS", "FROM", "TO", "ROWS");
    for record in view.recent {
        let (from, to) = match record.window() {
            Some(window) => (tz.format(&window.from), tz.format(&window.to)),
            None => ("n/a".to_string(), "n/a".to_string()),
        };
        let rows = record
            .details
            .extensions
            .get("rows_written")
            .map(|v| v.to_string())
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(
            out,
            "{:<8} {:<8} {:<31} {:<31} {}",
            record.id,
            record.status.as_str(),
            from,
            to,
            rows
        );
    }
    out
}
