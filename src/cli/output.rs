//! CLI output formatting

use crate::{
    core::{FailurePolicy, PipelineExecution, PipelineStatus, StageStatus},
    execution::{ExecutionEvent, ExecutionGraph},
};
use console::Emoji;
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "!");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "- ");

/// Format a stage status for display
pub fn format_stage_status(status: StageStatus) -> String {
    match status {
        StageStatus::Pending => style("PENDING").dim().to_string(),
        StageStatus::Running => style("RUNNING").yellow().to_string(),
        StageStatus::Success => style("SUCCESS").green().to_string(),
        StageStatus::Failed => style("FAILED").red().to_string(),
        StageStatus::Skipped => style("SKIPPED").dim().to_string(),
    }
}

/// Format a pipeline status for display
pub fn format_status(status: PipelineStatus) -> String {
    match status {
        PipelineStatus::Running => style("RUNNING").yellow().to_string(),
        PipelineStatus::Completed => style("COMPLETED").green().to_string(),
        PipelineStatus::Failed => style("FAILED").red().to_string(),
        PipelineStatus::Partial => style("PARTIAL").yellow().to_string(),
    }
}

/// Format an execution event for display
///
/// Returns `None` for activity events unless `stream` is set.
pub fn format_execution_event(event: &ExecutionEvent, stream: bool) -> Option<String> {
    let line = match event {
        ExecutionEvent::PipelineStarted {
            execution_id,
            pipeline_name,
            groups,
        } => format!(
            "{} Starting pipeline {} ({}) in {} group(s)",
            ROCKET,
            style(pipeline_name).bold(),
            style(&execution_id.to_string()[..8]).dim(),
            groups
        ),
        ExecutionEvent::GroupStarted { index, stages } => format!(
            "{} Group {}: {}",
            INFO,
            style(index + 1).bold(),
            style(stages.join(", ")).dim()
        ),
        ExecutionEvent::StageStarted {
            stage,
            attempt,
            max_retries,
        } => {
            if *attempt > 0 {
                format!(
                    "{} {} (retry {}/{})",
                    SPINNER,
                    style(stage).cyan(),
                    style(attempt).dim(),
                    style(max_retries).dim()
                )
            } else {
                format!("{} {}", SPINNER, style(stage).cyan())
            }
        }
        ExecutionEvent::StageActivity { stage, text } => {
            if !stream {
                return None;
            }
            format!("   {} {}", style(format!("[{}]", stage)).dim(), text)
        }
        ExecutionEvent::StageRetrying {
            stage,
            attempt,
            delay,
            error,
        } => format!(
            "{} {} attempt {} failed: {} (retrying in {})",
            WARN,
            style(stage).yellow(),
            attempt + 1,
            style(error).dim(),
            format_duration(*delay)
        ),
        ExecutionEvent::StageCompleted { stage } => format!("{} {}", CHECK, style(stage).green()),
        ExecutionEvent::StageFailed {
            stage,
            error,
            policy,
        } => {
            let note = match policy {
                FailurePolicy::Stop => "",
                FailurePolicy::Continue => " (continuing)",
                FailurePolicy::Warn => " (warning only)",
            };
            format!(
                "{} {}: {}{}",
                CROSS,
                style(stage).red(),
                style(error).dim(),
                note
            )
        }
        ExecutionEvent::StageSkipped { stage, reason } => {
            format!("{} {} ({})", SKIP, style(stage).dim(), reason)
        }
        ExecutionEvent::GroupFinished { failed, .. } if failed.is_empty() => return None,
        ExecutionEvent::GroupFinished { index, failed, .. } => format!(
            "{} Group {} finished with {} failure(s): {}",
            WARN,
            index + 1,
            failed.len(),
            style(failed.join(", ")).red()
        ),
        ExecutionEvent::PipelineFinished {
            execution_id,
            status,
        } => format!(
            "{} Pipeline ({}) {}",
            INFO,
            style(&execution_id.to_string()[..8]).dim(),
            format_status(*status)
        ),
    };

    Some(line)
}

/// One line per stage with its final status
pub fn format_summary(state: &PipelineExecution) -> String {
    let mut lines = Vec::with_capacity(state.stages.len() + 1);
    lines.push(format!(
        "{} {} succeeded, {} failed, {} skipped",
        INFO,
        style(state.count(StageStatus::Success)).green(),
        style(state.count(StageStatus::Failed)).red(),
        style(state.count(StageStatus::Skipped)).dim()
    ));

    for stage in &state.stages {
        let mut line = format!(
            "  {:<20} {}",
            stage.stage_name,
            format_stage_status(stage.status)
        );
        if let Some(ms) = stage.duration_ms {
            line.push_str(&format!(" {}", style(format_duration(Duration::from_millis(ms))).dim()));
        }
        if stage.retry_attempt > 0 {
            line.push_str(&format!(" {}", style(format!("after {} retries", stage.retry_attempt)).dim()));
        }
        lines.push(line);
    }

    lines.join("\n")
}

/// Execution groups, one per line
pub fn format_groups(graph: &ExecutionGraph) -> String {
    graph
        .groups
        .iter()
        .map(|group| {
            format!(
                "  {} {}",
                style(format!("{}.", group.index + 1)).bold(),
                group.stage_names().join(", ")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs == 0 {
        format!("{}ms", duration.as_millis())
    } else if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

/// Format stage output with truncation
pub fn format_output(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();

    if lines.len() <= max_lines {
        output.to_string()
    } else {
        let truncated = lines[..max_lines].join("\n");
        format!(
            "{}\n{}... ({} more lines)",
            truncated,
            style("[truncated]").dim(),
            lines.len() - max_lines
        )
    }
}
