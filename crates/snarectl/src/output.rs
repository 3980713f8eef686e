//! Output formatting - plain ASCII terminal output

use owo_colors::OwoColorize;
use snare_common::{ActualState, DesiredState, EventLevel, EventRecord};

use crate::commands::StatusRow;

pub fn success(message: &str) {
    println!("[OK] {}", message.green());
}

pub fn info(message: &str) {
    println!("[INFO] {}", message);
}

pub fn warning(message: &str) {
    println!("[WARNING] {}", message.yellow());
}

pub fn error(message: &str) {
    eprintln!("[ERROR] {}", message.red());
}

fn actual_cell(actual: ActualState) -> String {
    let padded = format!("{:<10}", actual.as_str());
    match actual {
        ActualState::Running => padded.green().to_string(),
        ActualState::Stopped => padded.yellow().to_string(),
        ActualState::Starting => padded.cyan().to_string(),
        ActualState::Error => padded.red().to_string(),
        ActualState::Unknown => padded.dimmed().to_string(),
    }
}

fn desired_cell(desired: DesiredState) -> String {
    let padded = format!("{:<10}", desired.as_str());
    match desired {
        DesiredState::Running => padded.green().to_string(),
        DesiredState::Stopped => padded.yellow().to_string(),
    }
}

/// Render `status` as a fixed-width table
pub fn status_table(rows: &[StatusRow]) {
    println!(
        "{}",
        format!("{:<8}{:<10}{:<10}{:<10}", "DECOY", "ENABLED", "DESIRED", "ACTUAL").bold()
    );
    for row in rows {
        let enabled = if row.enabled {
            format!("{:<10}", "yes")
        } else {
            format!("{:<10}", "no").dimmed().to_string()
        };
        let mut line = format!(
            "{:<8}{}{}{}",
            row.decoy.as_str(),
            enabled,
            desired_cell(row.desired),
            actual_cell(row.actual)
        );
        if row.diverged() {
            line.push_str(&format!(" {}", "(converging)".dimmed()));
        }
        println!("{}", line.trim_end());
    }
}

pub fn event_line(record: &EventRecord) {
    let level = format!("{:<7}", record.level.as_str());
    let level = match record.level {
        EventLevel::Info => level.to_string(),
        EventLevel::Warning => level.yellow().to_string(),
        EventLevel::Error => level.red().to_string(),
    };
    println!("{} {} {}", record.timestamp.dimmed(), level, record.message);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cells_are_padded_before_coloring() {
        for actual in [ActualState::Running, ActualState::Unknown, ActualState::Error] {
            let cell = actual_cell(actual);
            assert!(cell.contains(&format!("{:<10}", actual.as_str())));
        }
        assert!(desired_cell(DesiredState::Stopped).contains("stopped   "));
    }
}
