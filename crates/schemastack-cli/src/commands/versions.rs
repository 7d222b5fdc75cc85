use anyhow::Result;
use serde::Serialize;

use crate::commands::Target;
use crate::output::{short_hash, Output, OutputFormat};

#[derive(Serialize)]
struct VersionEntry {
    resource: String,
    version: u32,
    signature: String,
    entities: Vec<String>,
    current: bool,
}

pub fn list(target: &Target, output: &Output) -> Result<()> {
    let registry = target.registry();
    let versions = registry.load_all_versions(&target.model_name)?;
    let current = registry.load(&target.model_name)?;

    let entries: Vec<VersionEntry> = versions
        .iter()
        .map(|model| VersionEntry {
            resource: model.name().to_string(),
            version: model.version(),
            signature: model.signature().to_string(),
            entities: model.entities().iter().map(|e| e.name.clone()).collect(),
            current: model.version() == current.version(),
        })
        .collect();

    match output.format {
        OutputFormat::Json => output.json(&entries),
        OutputFormat::Quiet => {
            for entry in &entries {
                println!("{}", entry.version);
            }
        }
        OutputFormat::Human => {
            if entries.is_empty() {
                println!("No bundled versions of '{}'", target.model_name);
                return Ok(());
            }
            for entry in &entries {
                println!(
                    "{} {:>3}  {:<24} {}  {}",
                    if entry.current { "*" } else { " " },
                    entry.version,
                    entry.resource,
                    short_hash(&entry.signature),
                    entry.entities.join(", ")
                );
            }
        }
    }

    Ok(())
}
