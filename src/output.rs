use std::io::{self, Write};

use serde::Serialize;

use crate::pipeline::{TaskReport, TaskState};
use crate::runner::RunSummary;

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_run(summary: &RunSummary) -> io::Result<()> {
        Self::print_json(summary)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

pub struct TextOutput;

impl TextOutput {
    pub fn print_run(summary: &RunSummary) -> io::Result<()> {
        let mut stdout = io::stdout();
        for report in &summary.tasks {
            writeln!(stdout, "{}", task_line(report))?;
        }
        writeln!(
            stdout,
            "{} task(s) completed, {} failed",
            summary.completed(),
            summary.failed()
        )?;
        Ok(())
    }
}

pub fn task_line(report: &TaskReport) -> String {
    match (&report.state, &report.archive, &report.error) {
        (TaskState::Done, Some(archive), _) => {
            let processed = report
                .projection
                .map(|stats| stats.lines_processed)
                .unwrap_or(0);
            let note = if archive.metadata_included {
                ""
            } else {
                " (no metadata)"
            };
            format!(
                "{}: {} record(s) -> {}{note}",
                report.task, processed, archive.path
            )
        }
        (TaskState::Done, None, _) => format!("{}: done, no archive built", report.task),
        (_, _, Some(error)) => format!("{}: {} ({error})", report.task, report.state),
        (_, _, None) => format!("{}: {}", report.task, report.state),
    }
}
