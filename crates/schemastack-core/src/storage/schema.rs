//! SQLite schema derived from a schema model
//!
//! Every entity becomes one table with an `AUTOINCREMENT` primary key, so
//! keys of deleted records are never handed out again. A key/value table
//! holds the store metadata.

use rusqlite::{Connection, Result};

use crate::model::{relationship_index, EntityDescription, SchemaModel, PRIMARY_KEY};

/// Table holding the store metadata
pub const METADATA_TABLE: &str = "store_metadata";

/// Key of the metadata row
pub const METADATA_KEY: &str = "metadata";

/// Quote an identifier for use in SQL
///
/// Model validation only admits `[A-Za-z_][A-Za-z0-9_]*`, quoting keeps
/// SQL keywords such as `order` usable as property names.
pub(crate) fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// `CREATE TABLE` statement for one entity
pub fn entity_table_sql(entity: &EntityDescription) -> String {
    let mut columns = vec![format!(
        "{} INTEGER PRIMARY KEY AUTOINCREMENT",
        quote(PRIMARY_KEY)
    )];

    for attribute in &entity.attributes {
        let mut column = format!("{} {}", quote(&attribute.name), attribute.kind.column_type());
        if !attribute.optional {
            column.push_str(" NOT NULL");
        }
        columns.push(column);
    }

    for relationship in &entity.relationships {
        let mut column = format!("{} INTEGER", quote(&relationship.name));
        if !relationship.optional {
            column.push_str(" NOT NULL");
        }
        columns.push(column);
    }

    format!(
        "CREATE TABLE {} (\n    {}\n)",
        quote(&entity.name),
        columns.join(",\n    ")
    )
}

/// Initialize a fresh store for `model`
pub fn init_schema(conn: &Connection, model: &SchemaModel) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
        METADATA_TABLE
    ))?;

    for entity in model.entities() {
        conn.execute_batch(&entity_table_sql(entity))?;

        for relationship in &entity.relationships {
            conn.execute_batch(&format!(
                "CREATE INDEX {} ON {}({});",
                quote(&relationship_index(&entity.name, &relationship.name)),
                quote(&entity.name),
                quote(&relationship.name)
            ))?;
        }
    }

    Ok(())
}

/// Check if the store has not been initialized yet
pub fn needs_init(conn: &Connection) -> bool {
    let table_exists: bool = conn
        .prepare("SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1")
        .and_then(|mut stmt| stmt.exists([METADATA_TABLE]))
        .unwrap_or(false);

    !table_exists
}

/// Highest primary key ever issued for an entity (0 if none)
pub fn get_sequence(conn: &Connection, entity: &str) -> Result<i64> {
    let mut stmt = conn.prepare("SELECT seq FROM sqlite_sequence WHERE name = ?1")?;
    let result: Result<i64> = stmt.query_row([entity], |row| row.get(0));

    match result {
        Ok(seq) => Ok(seq),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
        Err(e) => Err(e),
    }
}

/// Raise the key sequence of an entity to at least `seq`
pub fn raise_sequence(conn: &Connection, entity: &str, seq: i64) -> Result<()> {
    if seq <= get_sequence(conn, entity)? {
        return Ok(());
    }

    let updated = conn.execute(
        "UPDATE sqlite_sequence SET seq = ?2 WHERE name = ?1",
        rusqlite::params![entity, seq],
    )?;
    if updated == 0 {
        conn.execute(
            "INSERT INTO sqlite_sequence (name, seq) VALUES (?1, ?2)",
            rusqlite::params![entity, seq],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttributeDescription, EntityDescription};
    use crate::value::AttributeKind;

    fn model() -> SchemaModel {
        let folder = EntityDescription::new("Folder")
            .with_attribute(AttributeDescription::new("order", AttributeKind::Integer));
        let note = EntityDescription::new("Note")
            .with_attribute(AttributeDescription::new("text", AttributeKind::Text))
            .with_attribute(AttributeDescription::new("pinned", AttributeKind::Boolean).optional())
            .with_relationship("folder", "Folder");
        SchemaModel::new("Notes", 1, vec![folder, note]).unwrap()
    }

    #[test]
    fn test_init_schema() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(needs_init(&conn));

        init_schema(&conn, &model()).unwrap();
        assert!(!needs_init(&conn));

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        assert!(tables.contains(&"Folder".to_string()));
        assert!(tables.contains(&"Note".to_string()));
        assert!(tables.contains(&METADATA_TABLE.to_string()));
    }

    #[test]
    fn test_entity_table_sql() {
        let model = model();
        let sql = entity_table_sql(model.entity("Note").unwrap());

        assert!(sql.contains("\"pk\" INTEGER PRIMARY KEY AUTOINCREMENT"));
        assert!(sql.contains("\"text\" TEXT NOT NULL"));
        assert!(sql.contains("\"pinned\" INTEGER,") || sql.contains("\"pinned\" INTEGER\n"));
        assert!(sql.contains("\"folder\" INTEGER"));
    }

    #[test]
    fn test_relationship_index_exists() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn, &model()).unwrap();

        let exists = conn
            .prepare("SELECT 1 FROM sqlite_master WHERE type='index' AND name='idx_Note_folder'")
            .unwrap()
            .exists([])
            .unwrap();
        assert!(exists);
    }

    #[test]
    fn test_sequence() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn, &model()).unwrap();
        assert_eq!(get_sequence(&conn, "Folder").unwrap(), 0);

        raise_sequence(&conn, "Folder", 10).unwrap();
        assert_eq!(get_sequence(&conn, "Folder").unwrap(), 10);

        // Never lowered
        raise_sequence(&conn, "Folder", 3).unwrap();
        assert_eq!(get_sequence(&conn, "Folder").unwrap(), 10);

        conn.execute("INSERT INTO \"Folder\" (\"order\") VALUES (1)", [])
            .unwrap();
        assert_eq!(conn.last_insert_rowid(), 11);
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote("order"), "\"order\"");
        assert_eq!(quote("a\"b"), "\"a\"\"b\"");
    }
}
