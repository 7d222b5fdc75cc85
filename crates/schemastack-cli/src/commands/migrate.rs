use anyhow::{Context, Result};
use tracing::info;

use schemastack_core::DataStack;

use crate::commands::Target;
use crate::output::Output;

/// Open the store, which migrates it if needed, then report what happened
pub fn run(target: &Target, output: &Output) -> Result<()> {
    info!("Opening store at {}", target.store_path().display());

    let stack = DataStack::open(target.options())
        .with_context(|| format!("Failed to open store for '{}'", target.model_name))?;

    output.print_migration(stack.migration_report());
    Ok(())
}
