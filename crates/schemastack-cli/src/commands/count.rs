use anyhow::{bail, Context, Result};
use serde_json::json;

use schemastack_core::storage::StoreFiles;
use schemastack_core::DataStack;

use crate::commands::Target;
use crate::output::{Output, OutputFormat};

pub async fn run(target: &Target, entity: String, output: &Output) -> Result<()> {
    let count = count_records(target, &entity).await?;

    match output.format {
        OutputFormat::Json => output.json(&json!({ "entity": entity, "count": count })),
        OutputFormat::Quiet => println!("{}", count),
        OutputFormat::Human => println!("{}: {}", entity, count),
    }
    Ok(())
}

/// Count the records of `entity` in an existing store
///
/// Opening a missing store would create it, so that case is an error here.
async fn count_records(target: &Target, entity: &str) -> Result<usize> {
    let files = StoreFiles::new(target.store_path());
    if !files.exists() {
        bail!("No store at {}", files.path().display());
    }

    let stack = DataStack::open(target.options())
        .with_context(|| format!("Failed to open store for '{}'", target.model_name))?;

    if stack.model().entity(entity).is_none() {
        bail!(
            "Model '{}' has no entity named '{}'",
            stack.model().name(),
            entity
        );
    }

    let name = entity.to_string();
    let count = stack
        .perform(move |store| Ok(store.count(&name, None)?))
        .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use schemastack_core::Config;
    use std::fs;
    use tempfile::TempDir;

    const NOTE_V1: &str = r#"
        [[entity]]
        name = "Note"
        [[entity.attribute]]
        name = "text"
        kind = "text"
    "#;

    fn target(temp_dir: &TempDir) -> Target {
        let bundle = temp_dir.path().join("bundle");
        let models = bundle.join("Notes.models");
        fs::create_dir_all(&models).unwrap();
        fs::write(models.join("Notes.toml"), NOTE_V1).unwrap();

        Target {
            model_name: "Notes".to_string(),
            config: Config {
                data_dir: temp_dir.path().join("data"),
                bundle_dir: Some(bundle),
                model_name: None,
            },
        }
    }

    #[tokio::test]
    async fn test_count_missing_store_creates_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let target = target(&temp_dir);

        assert!(count_records(&target, "Note").await.is_err());
        assert!(!target.store_path().exists());
    }

    #[tokio::test]
    async fn test_count_existing_store() {
        let temp_dir = TempDir::new().unwrap();
        let target = target(&temp_dir);
        drop(DataStack::open(target.options()).unwrap());

        assert_eq!(count_records(&target, "Note").await.unwrap(), 0);
        assert!(count_records(&target, "Folder").await.is_err());
    }
}
