use std::io::IsTerminal;
use std::time::Duration;

use console::style;
use tabled::{
    Table, Tabled,
    settings::{Padding, Style, object::Columns},
};

use crate::coordinator::{RunOutcome, RunResult};

#[derive(Tabled)]
struct ResultRow {
    #[tabled(rename = "BACKEND")]
    backend: String,
    #[tabled(rename = "OUTCOME")]
    outcome: String,
    #[tabled(rename = "EXIT")]
    exit_code: String,
    #[tabled(rename = "ELAPSED")]
    elapsed: String,
    #[tabled(rename = "DETAIL")]
    detail: String,
}

pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs < 60.0 {
        format!("{:.1}s", secs)
    } else {
        let whole = elapsed.as_secs();
        format!("{}m{:02}s", whole / 60, whole % 60)
    }
}

fn format_outcome(result: &RunResult, color: bool) -> String {
    let label = result.outcome.label();
    let styled = match &result.outcome {
        RunOutcome::Completed if result.exit_code == Some(0) => style(label).green(),
        RunOutcome::Completed => style(label).yellow(),
        RunOutcome::TimedOut | RunOutcome::TransportError(_) => style(label).yellow(),
        RunOutcome::Cancelled => style(label).dim(),
        RunOutcome::CredentialError(_) | RunOutcome::LaunchFailed(_) => style(label).red(),
    };
    styled.force_styling(color).to_string()
}

/// Render the comparison table. Unknown exit codes show as `-`.
pub fn render(results: &[RunResult], color: bool) -> String {
    let rows: Vec<ResultRow> = results
        .iter()
        .map(|r| ResultRow {
            backend: r.backend.clone(),
            outcome: format_outcome(r, color),
            exit_code: r
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string()),
            elapsed: format_elapsed(r.elapsed),
            detail: r.outcome.detail().unwrap_or("").to_string(),
        })
        .collect();

    let mut table = Table::new(rows);
    table
        .with(Style::blank())
        .modify(Columns::new(0..5), Padding::new(0, 1, 0, 0));
    table.to_string()
}

pub fn print(results: &[RunResult]) {
    println!("{}", render(results, std::io::stdout().is_terminal()));
}
