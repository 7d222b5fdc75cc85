//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use serde::Serialize;

use schemastack_core::{Error, MigrationReport};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Print any serializable value as pretty JSON
    pub fn json<T: Serialize>(&self, value: &T) {
        match serde_json::to_string_pretty(value) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Error: could not encode output: {}", e),
        }
    }

    /// Print the outcome of opening (and possibly migrating) a store
    pub fn print_migration(&self, report: &MigrationReport) {
        match self.format {
            OutputFormat::Json => self.json(report),
            OutputFormat::Quiet => println!("{}", report.destination_version),
            OutputFormat::Human => {
                if !report.migrated() {
                    match report.source_version {
                        Some(_) => println!(
                            "Store is up to date (version {})",
                            report.destination_version
                        ),
                        None => println!(
                            "No store yet; it will be created at version {}",
                            report.destination_version
                        ),
                    }
                    return;
                }

                for step in &report.steps {
                    println!(
                        "  step {}: {} -> {} ({} mapping, {} records)",
                        step.step,
                        step.source_version,
                        step.destination_version,
                        step.origin,
                        step.records
                    );
                }
                println!(
                    "✓ Migrated from version {} to {}",
                    report
                        .source_version
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "?".to_string()),
                    report.destination_version
                );
            }
        }
    }

    /// Print an error and, for store errors, what to do about it
    pub fn error(&self, error: &anyhow::Error) {
        let hint = error
            .chain()
            .find_map(|cause| cause.downcast_ref::<Error>())
            .and_then(Error::recovery_suggestion);

        match self.format {
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({
                        "status": "error",
                        "message": format!("{:#}", error),
                        "hint": hint
                    })
                );
            }
            _ => {
                eprintln!("Error: {:#}", error);
                if let Some(hint) = hint {
                    eprintln!("Hint: {}", hint);
                }
            }
        }
    }
}

/// First characters of a hash, enough to tell versions apart
pub fn short_hash(hash: &str) -> &str {
    let end = hash
        .char_indices()
        .nth(12)
        .map(|(i, _)| i)
        .unwrap_or(hash.len());
    &hash[..end]
}
