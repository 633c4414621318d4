use colored::Colorize;
use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, ContentArrangement, Table};
use serde::Serialize;

use schemashare_core::{
    ApplyStatus, MigrateReport, MigrationRecord, MigrationState, MigrationStatus, ValidateReport,
};

/// Pretty-print any report as JSON on stdout.
pub fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("{} failed to serialize output: {}", "ERROR:".red().bold(), e),
    }
}

fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header.into_iter().map(Cell::new).collect::<Vec<_>>());
    table
}

/// Format migration status as a colored table.
pub fn print_status_table(statuses: &[MigrationStatus]) {
    if statuses.is_empty() {
        println!("{}", "No migrations found.".yellow());
        return;
    }

    let mut table = new_table(vec![
        "Module",
        "Version",
        "File",
        "State",
        "Applied At",
        "Execution Time",
    ]);

    for status in statuses {
        let applied_at = status
            .applied_at
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        let exec_time = status
            .execution_time_ms
            .map(|t| format!("{}ms", t))
            .unwrap_or_default();

        table.add_row(vec![
            Cell::new(&status.module),
            Cell::new(&status.version),
            Cell::new(&status.filename),
            Cell::new(format_state(status.state)),
            Cell::new(&applied_at),
            Cell::new(&exec_time),
        ]);
    }

    println!("{table}");
}

fn format_state(state: MigrationState) -> String {
    match state {
        MigrationState::Pending => "Pending".yellow().to_string(),
        MigrationState::Applied => "Applied".green().to_string(),
        MigrationState::ChecksumMismatch => "Checksum Mismatch".red().bold().to_string(),
        MigrationState::Missing => "Missing".red().to_string(),
    }
}

/// Print a migration report summary.
pub fn print_migrate_summary(report: &MigrateReport) {
    if report.dry_run {
        if report.results.is_empty() {
            println!("{}", "Dry run: No pending migrations.".green());
            return;
        }
        println!(
            "{}",
            format!(
                "Dry run: {} migration(s) of module '{}' would be applied:",
                report.results.len(),
                report.module
            )
            .yellow()
            .bold()
        );
        for result in &report.results {
            println!("  {} {} [{}]", "→".yellow(), result.version, result.filename);
            if let Some(ref sql) = result.resolved_sql {
                for line in sql.lines() {
                    println!("      {}", line.dimmed());
                }
            }
        }
        return;
    }

    if report.migrations_applied == 0 {
        println!("{}", "Schema is up to date. No migration necessary.".green());
    } else {
        println!(
            "{}",
            format!(
                "Successfully applied {} migration(s) of module '{}' (execution time {}ms)",
                report.migrations_applied, report.module, report.total_time_ms
            )
            .green()
            .bold()
        );
    }

    for result in &report.results {
        match result.status {
            ApplyStatus::Applied => println!(
                "  {} {} [{}] ({}ms)",
                "→".green(),
                result.version,
                result.filename,
                result.execution_time_ms
            ),
            ApplyStatus::Skipped => println!(
                "  {} {} [{}] already applied by another runner",
                "·".dimmed(),
                result.version,
                result.filename
            ),
            ApplyStatus::DryRun => {}
        }
    }
}

/// Print a validate report.
pub fn print_validate_result(report: &ValidateReport) {
    if report.valid {
        println!(
            "{}",
            format!(
                "Successfully validated {} applied migration(s) of module '{}'.",
                report.checked, report.module
            )
            .green()
            .bold()
        );
    }

    for warning in &report.warnings {
        println!("{} {}", "WARNING:".yellow().bold(), warning);
    }

    for issue in &report.issues {
        println!("{} {}", "ERROR:".red().bold(), issue);
    }
}

/// Print ledger rows as a table.
pub fn print_history_table(records: &[MigrationRecord]) {
    if records.is_empty() {
        println!("{}", "No applied migrations recorded.".yellow());
        return;
    }

    let mut table = new_table(vec![
        "Module",
        "Version",
        "File",
        "Applied At",
        "Execution Time",
        "Rollback",
    ]);

    for record in records {
        let rollback = if record.rollback_sql.is_some() {
            "yes".green().to_string()
        } else {
            "no".dimmed().to_string()
        };
        table.add_row(vec![
            Cell::new(&record.module_name),
            Cell::new(&record.version),
            Cell::new(&record.filename),
            Cell::new(record.applied_at.format("%Y-%m-%d %H:%M:%S").to_string()),
            Cell::new(format!("{}ms", record.execution_time_ms)),
            Cell::new(rollback),
        ]);
    }

    println!("{table}");
}
