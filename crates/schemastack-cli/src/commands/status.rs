//! Status command handler

use anyhow::Result;
use serde::Serialize;

use schemastack_core::compat::matches_metadata;
use schemastack_core::storage::{read_metadata, StoreFiles};

use crate::commands::Target;
use crate::output::{short_hash, Output, OutputFormat};

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub model: String,
    pub current_version: Option<u32>,
    pub store_path: String,
    pub store_exists: bool,
    pub store_size: u64,
    pub store_id: Option<String>,
    pub store_version: Option<u32>,
    pub store_signature: Option<String>,
    /// Why the store's metadata could not be read
    pub metadata_error: Option<String>,
    /// Bundled versions the store can be opened under
    pub compatible_versions: Vec<u32>,
    pub needs_migration: bool,
    /// Leftovers of an interrupted migration
    pub scratch_present: bool,
    pub backup_present: bool,
}

/// Inspect the store on disk without opening or migrating it
pub fn collect(target: &Target) -> Result<StatusReport> {
    let registry = target.registry();
    let versions = registry.load_all_versions(&target.model_name)?;
    let current = if versions.is_empty() {
        None
    } else {
        Some(registry.load(&target.model_name)?)
    };

    let files = StoreFiles::new(target.store_path());
    let (metadata, metadata_error) = if files.exists() {
        match read_metadata(files.path()) {
            Ok(metadata) => (Some(metadata), None),
            Err(e) => (None, Some(e.to_string())),
        }
    } else {
        (None, None)
    };

    let compatible_versions = match &metadata {
        Some(metadata) => versions
            .iter()
            .filter(|model| matches_metadata(model, metadata))
            .map(|model| model.version())
            .collect(),
        None => Vec::new(),
    };

    let needs_migration = match (&metadata, &current) {
        (Some(metadata), Some(current)) => !matches_metadata(current, metadata),
        _ => false,
    };

    Ok(StatusReport {
        model: target.model_name.clone(),
        current_version: current.as_ref().map(|model| model.version()),
        store_path: files.path().display().to_string(),
        store_exists: files.exists(),
        store_size: files.size(),
        store_id: metadata.as_ref().map(|m| m.store_id.to_string()),
        store_version: metadata.as_ref().map(|m| m.model_version),
        store_signature: metadata.as_ref().map(|m| m.model_signature.clone()),
        metadata_error,
        compatible_versions,
        needs_migration,
        scratch_present: files.scratch_path().exists(),
        backup_present: files.backup_path().exists(),
    })
}

/// Show status information
pub fn show(target: &Target, output: &Output) -> Result<()> {
    let report = collect(target)?;

    match output.format {
        OutputFormat::Json => output.json(&report),
        OutputFormat::Quiet => {
            let state = if !report.store_exists {
                "missing"
            } else if report.metadata_error.is_some() {
                "unreadable"
            } else if report.needs_migration {
                "outdated"
            } else {
                "current"
            };
            println!("{}", state);
        }
        OutputFormat::Human => {
            println!("Model: {}", report.model);
            match report.current_version {
                Some(version) => println!("Current version: {}", version),
                None => println!("Current version: (no bundled versions)"),
            }
            println!();
            println!("Store: {}", report.store_path);

            if !report.store_exists {
                println!("  not created yet");
            } else {
                if let Some(id) = &report.store_id {
                    println!("  Id:        {}", id);
                }
                if let (Some(version), Some(signature)) =
                    (report.store_version, &report.store_signature)
                {
                    println!("  Written:   version {} ({})", version, short_hash(signature));
                }
                println!("  Size:      {}", format_bytes(report.store_size));
                if let Some(error) = &report.metadata_error {
                    println!("  Metadata unreadable: {}", error);
                } else if report.compatible_versions.is_empty() {
                    println!("  Compatible with no bundled version");
                } else {
                    let list: Vec<String> = report
                        .compatible_versions
                        .iter()
                        .map(|v| v.to_string())
                        .collect();
                    println!("  Compatible with: {}", list.join(", "));
                }
                if report.needs_migration {
                    println!("  Needs migration (run `schemastack migrate`)");
                }
            }

            if report.scratch_present || report.backup_present {
                println!();
                println!("An interrupted migration left files behind; they are cleaned up on next open.");
            }
        }
    }

    Ok(())
}

/// Format bytes as human-readable string
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}
