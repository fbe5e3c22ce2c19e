//! Colored terminal rendering of run events and listings.

use std::io::{self, Write};

use owo_colors::OwoColorize;

use crate::collector::FetchStatus;
use crate::events::{EventDetail, LogLevel, NodeStatus, PipelineEvent};
use crate::knowledge::{AnalysisView, ChangeLogEntry, Significance};
use crate::pipeline::{Dossier, RunSummary};

/// Maximum length for truncated display strings.
const DEFAULT_MAX_LEN: usize = 120;

/// Truncate a string to at most `max_len` characters, adding an ellipsis.
#[must_use]
pub fn truncate(s: &str, max_len: usize, raw_mode: bool) -> String {
    if raw_mode || s.chars().count() <= max_len {
        return s.to_string();
    }
    if max_len <= 3 {
        return "...".to_string();
    }
    let head: String = s.chars().take(max_len - 3).collect();
    format!("{head}...")
}

/// Plain (uncolored) one-line description of an event.
#[must_use]
pub fn describe_event(event: &PipelineEvent, raw_mode: bool) -> String {
    let body = match &event.detail {
        EventDetail::RunStarted {
            entity,
            run_number,
            directive,
        } => format!("run #{run_number} for {entity} ({})", directive.as_str()),
        EventDetail::NodeStarted { message } => message.clone().unwrap_or_else(|| "started".into()),
        EventDetail::ToolResult(call) => match &call.error {
            Some(error) => format!("{} {} ({error})", call.source_id, call.fetch_status.as_str()),
            None => format!("{} {}", call.source_id, call.fetch_status.as_str()),
        },
        EventDetail::AgentLog { message, .. } => message.clone(),
        EventDetail::NodeCompleted {
            status,
            summary,
            reason,
        } => {
            let text = summary.as_deref().or(reason.as_deref()).unwrap_or("");
            format!("{} {text}", node_status_label(*status))
        }
        EventDetail::DeltaDetected(delta) => format!(
            "{} {} {}: {}",
            delta.significance.as_str(),
            delta.trend_direction.as_str(),
            delta.category,
            delta.change
        ),
        EventDetail::VerificationFlag {
            category,
            source_id,
            fetch_status,
            error,
        } => {
            let mut text = format!("{category} via {source_id} {}", fetch_status.as_str());
            if let Some(error) = error {
                text.push_str(&format!(" ({error})"));
            }
            text
        }
        EventDetail::RunCompleted { summary, .. } => summary.clone(),
        EventDetail::RunFailed { error } => error.clone(),
    };
    truncate(body.trim_end(), DEFAULT_MAX_LEN, raw_mode)
}

fn node_status_label(status: NodeStatus) -> &'static str {
    match status {
        NodeStatus::Pending => "pending",
        NodeStatus::Running => "running",
        NodeStatus::Completed => "completed",
        NodeStatus::Skipped => "skipped",
        NodeStatus::Failed => "failed",
    }
}

/// Print one event as it arrives.
pub fn print_event(event: &PipelineEvent, raw_mode: bool) {
    let ts = event.timestamp.format("%H:%M:%S%.3f").to_string();
    let text = describe_event(event, raw_mode);
    let node = format!("{:<22}", event.node);
    let tag = format!("[{}]", event.event_type().to_uppercase());

    match &event.detail {
        EventDetail::RunStarted { .. } | EventDetail::RunCompleted { .. } => {
            println!("{} {} {}", ts.dimmed(), tag.blue().bold(), text.bold());
        }
        EventDetail::RunFailed { .. } => {
            println!("{} {} {}", ts.dimmed(), tag.red().bold(), text.red());
        }
        EventDetail::ToolResult(call) if call.fetch_status == FetchStatus::Verified => {
            println!("{} {} {} {}", ts.dimmed(), tag.green(), node.cyan(), text);
        }
        EventDetail::ToolResult(_) | EventDetail::VerificationFlag { .. } => {
            println!("{} {} {} {}", ts.dimmed(), tag.yellow(), node.cyan(), text);
        }
        EventDetail::AgentLog { level, .. } => {
            let line = match level {
                LogLevel::Info => text.dimmed().to_string(),
                LogLevel::Warn => text.yellow().to_string(),
                LogLevel::Error => text.red().to_string(),
            };
            println!("{} {} {} {line}", ts.dimmed(), tag.dimmed(), node.cyan());
        }
        EventDetail::DeltaDetected(delta) => {
            let line = match delta.significance {
                Significance::High => text.magenta().bold().to_string(),
                Significance::Medium => text.yellow().to_string(),
                Significance::Low | Significance::Noise => text.dimmed().to_string(),
            };
            println!("{} {} {} {line}", ts.dimmed(), tag.magenta(), node.cyan());
        }
        EventDetail::NodeCompleted { status, .. } => {
            let tag = match status {
                NodeStatus::Failed => tag.red().to_string(),
                NodeStatus::Skipped => tag.dimmed().to_string(),
                _ => tag.green().to_string(),
            };
            println!("{} {tag} {} {text}", ts.dimmed(), node.cyan());
        }
        EventDetail::NodeStarted { .. } => {
            println!("{} {} {} {}", ts.dimmed(), tag.dimmed(), node.cyan(), text.dimmed());
        }
    }
    let _ = io::stdout().flush();
}

/// Print a run listing.
pub fn print_runs(runs: &[RunSummary]) {
    if runs.is_empty() {
        println!("{}", "No runs recorded".dimmed());
        return;
    }
    for run in runs {
        let status = run.status.as_str();
        let status = if run.error.is_some() {
            status.red().to_string()
        } else {
            status.green().to_string()
        };
        println!(
            "{} {} #{} {} {} deltas={} high={}",
            run.started_at.format("%Y-%m-%d %H:%M").to_string().dimmed(),
            run.run_id.to_string().dimmed(),
            run.run_number,
            run.entity.bold(),
            status,
            run.delta_count,
            run.high_delta_count
        );
        if let Some(error) = &run.error {
            println!("    {}", error.red());
        }
    }
    let _ = io::stdout().flush();
}

/// Print the latest-result projection of an entity.
pub fn print_analysis(view: &AnalysisView, raw_mode: bool) {
    println!(
        "{} {} (runs: {}, last scanned {})",
        "[ENTITY]".blue().bold(),
        view.entity.bold(),
        view.total_runs,
        view.last_scanned_at.format("%Y-%m-%d %H:%M")
    );
    for (category, value) in &view.values {
        println!(
            "  {:<28} {}",
            category.cyan(),
            truncate(&value.display(), DEFAULT_MAX_LEN, raw_mode)
        );
    }
    if !view.pulse.is_empty() {
        println!("{}", "[PULSE]".magenta().bold());
        for entry in &view.pulse {
            println!(
                "  {} {}",
                entry.timestamp.format("%Y-%m-%d").to_string().dimmed(),
                truncate(&entry.event, DEFAULT_MAX_LEN, raw_mode)
            );
        }
    }
    if let Some(evaluation) = &view.evaluation {
        println!("{} {}", "[EVALUATION]".green().bold(), evaluation.summary);
    }
    let _ = io::stdout().flush();
}

/// Print an entity's change log, newest last.
pub fn print_change_log(entries: &[ChangeLogEntry]) {
    if entries.is_empty() {
        println!("{}", "No changes recorded".dimmed());
        return;
    }
    for entry in entries {
        let delta = &entry.delta;
        println!(
            "{} {} {} {} {}",
            entry.recorded_at.format("%Y-%m-%d %H:%M").to_string().dimmed(),
            format!("#{}", entry.run_number).cyan(),
            delta.significance.as_str().magenta(),
            delta.category.bold(),
            delta.change
        );
    }
    let _ = io::stdout().flush();
}

/// Print a generated dossier as pretty JSON.
pub fn print_dossier(dossier: &Dossier) {
    match serde_json::to_string_pretty(dossier) {
        Ok(json) => println!("{json}"),
        Err(e) => print_error(&format!("Failed to render dossier: {e}")),
    }
    let _ = io::stdout().flush();
}

/// Print an error message.
pub fn print_error(message: &str) {
    eprintln!("{} {}", "[ERROR]".red().bold(), message);
}
