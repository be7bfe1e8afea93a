use anyhow::{anyhow, Context, Result};
use metarepo_core::{AssociationKind, AssociationTable, CollectionTable};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::config::MetaModel;

pub const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS mof_sequence (
  name TEXT PRIMARY KEY,
  next_id INTEGER NOT NULL CHECK (next_id >= 1)
);
INSERT OR IGNORE INTO mof_sequence(name, next_id) VALUES ('mof_id', 1);

CREATE TABLE IF NOT EXISTS assoc_one_to_one (
  mof_id INTEGER PRIMARY KEY,
  assoc_type TEXT NOT NULL,
  parent_type TEXT NOT NULL,
  parent_id INTEGER NOT NULL,
  child_type TEXT NOT NULL,
  child_id INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS assoc_one_to_many (
  mof_id INTEGER PRIMARY KEY,
  assoc_type TEXT NOT NULL,
  parent_type TEXT NOT NULL,
  parent_id INTEGER NOT NULL,
  reversed INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS assoc_one_to_many_members (
  mof_id INTEGER NOT NULL REFERENCES assoc_one_to_many(mof_id),
  member_type TEXT NOT NULL,
  member_id INTEGER NOT NULL,
  PRIMARY KEY (mof_id, member_id)
);

CREATE TABLE IF NOT EXISTS assoc_one_to_many_hc (
  mof_id INTEGER PRIMARY KEY,
  assoc_type TEXT NOT NULL,
  parent_type TEXT NOT NULL,
  parent_id INTEGER NOT NULL,
  reversed INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS assoc_one_to_many_hc_members (
  mof_id INTEGER NOT NULL REFERENCES assoc_one_to_many_hc(mof_id),
  member_type TEXT NOT NULL,
  member_id INTEGER NOT NULL,
  PRIMARY KEY (mof_id, member_id)
);

CREATE TABLE IF NOT EXISTS assoc_one_to_many_ordered (
  mof_id INTEGER PRIMARY KEY,
  assoc_type TEXT NOT NULL,
  parent_type TEXT NOT NULL,
  parent_id INTEGER NOT NULL,
  reversed INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS assoc_one_to_many_ordered_members (
  mof_id INTEGER NOT NULL REFERENCES assoc_one_to_many_ordered(mof_id),
  member_type TEXT NOT NULL,
  member_id INTEGER NOT NULL,
  ordinal INTEGER NOT NULL CHECK (ordinal >= 0),
  PRIMARY KEY (mof_id, ordinal)
);

CREATE TABLE IF NOT EXISTS assoc_many_to_many (
  mof_id INTEGER PRIMARY KEY,
  assoc_type TEXT NOT NULL,
  parent_type TEXT NOT NULL,
  parent_id INTEGER NOT NULL,
  reversed INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS assoc_many_to_many_members (
  mof_id INTEGER NOT NULL REFERENCES assoc_many_to_many(mof_id),
  member_type TEXT NOT NULL,
  member_id INTEGER NOT NULL,
  ordinal INTEGER NOT NULL CHECK (ordinal >= 0),
  PRIMARY KEY (mof_id, ordinal)
);

CREATE TABLE IF NOT EXISTS assoc_many_to_many_ordered (
  mof_id INTEGER PRIMARY KEY,
  assoc_type TEXT NOT NULL,
  parent_type TEXT NOT NULL,
  parent_id INTEGER NOT NULL,
  reversed INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS assoc_many_to_many_ordered_members (
  mof_id INTEGER NOT NULL REFERENCES assoc_many_to_many_ordered(mof_id),
  member_type TEXT NOT NULL,
  member_id INTEGER NOT NULL,
  ordinal INTEGER NOT NULL CHECK (ordinal >= 0),
  PRIMARY KEY (mof_id, ordinal)
);

CREATE INDEX IF NOT EXISTS idx_one_to_many_members_member ON assoc_one_to_many_members(member_id);
CREATE INDEX IF NOT EXISTS idx_one_to_many_hc_members_member ON assoc_one_to_many_hc_members(member_id);
CREATE INDEX IF NOT EXISTS idx_one_to_many_ordered_members_member ON assoc_one_to_many_ordered_members(member_id);
CREATE INDEX IF NOT EXISTS idx_many_to_many_members_member ON assoc_many_to_many_members(member_id);
CREATE INDEX IF NOT EXISTS idx_many_to_many_ordered_members_member ON assoc_many_to_many_ordered_members(member_id);
";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub missing_class_tables: Vec<String>,
}

/// Association and collection tables of one kind.
#[must_use]
pub fn association_table(kind: AssociationKind) -> AssociationTable {
    let table = match kind {
        AssociationKind::OneToOne => "assoc_one_to_one",
        AssociationKind::OneToMany => "assoc_one_to_many",
        AssociationKind::OneToManyHighCardinality => "assoc_one_to_many_hc",
        AssociationKind::OneToManyOrdered => "assoc_one_to_many_ordered",
        AssociationKind::ManyToMany => "assoc_many_to_many",
        AssociationKind::ManyToManyOrdered => "assoc_many_to_many_ordered",
    };

    let collection = match kind {
        AssociationKind::OneToOne => None,
        AssociationKind::OneToMany | AssociationKind::OneToManyHighCardinality => {
            Some(members_table(table, false))
        }
        AssociationKind::OneToManyOrdered
        | AssociationKind::ManyToMany
        | AssociationKind::ManyToManyOrdered => Some(members_table(table, true)),
    };

    AssociationTable { table: table.to_string(), id_column: "mof_id".to_string(), collection }
}

fn members_table(table: &str, ordered: bool) -> CollectionTable {
    CollectionTable {
        table: format!("{table}_members"),
        owner_column: "mof_id".to_string(),
        member_type_column: "member_type".to_string(),
        member_column: "member_id".to_string(),
        ordinal_column: ordered.then(|| "ordinal".to_string()),
    }
}

/// Report current and target schema versions plus class tables still to create.
///
/// # Errors
/// Returns an error when schema metadata cannot be read or initialized.
pub fn schema_status(conn: &Connection, metamodel: &MetaModel) -> Result<SchemaStatus> {
    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
        .context("failed to apply schema_migrations table")?;
    let current_version = current_schema_version(conn)?;
    let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
        ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
    } else {
        Vec::new()
    };

    let mut missing_class_tables = Vec::new();
    for class in &metamodel.classes {
        let table = class.table_name();
        if !table_exists(conn, &table)? {
            missing_class_tables.push(table);
        }
    }

    Ok(SchemaStatus {
        current_version,
        target_version: LATEST_SCHEMA_VERSION,
        pending_versions,
        missing_class_tables,
    })
}

/// Apply forward migrations, then create or extend the meta-model's class tables.
///
/// # Errors
/// Returns an error when any migration or DDL statement fails.
pub fn migrate(conn: &mut Connection, metamodel: &MetaModel) -> Result<()> {
    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
        .context("failed to apply schema_migrations table")?;

    let version = current_schema_version(conn)?;
    if version > LATEST_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported schema version {version}; expected at most {LATEST_SCHEMA_VERSION}"
        ));
    }

    let tx = conn.transaction().context("failed to start migration transaction")?;
    if version < 1 {
        tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
        record_schema_version(&tx, 1)?;
    }
    ensure_class_tables(&tx, metamodel)?;
    tx.commit().context("failed to commit migration transaction")?;
    Ok(())
}

fn ensure_class_tables(conn: &Connection, metamodel: &MetaModel) -> Result<()> {
    for class in &metamodel.classes {
        let table = class.table_name();
        let ends = metamodel.ends_of(&class.name);

        if table_exists(conn, &table)? {
            for (association, end) in ends {
                let column = association.column(end);
                if !table_has_column(conn, &table, &column)? {
                    let ddl = format!(
                        "ALTER TABLE \"{table}\" ADD COLUMN {}",
                        reference_column_ddl(&column, association.kind)
                    );
                    conn.execute_batch(&ddl)
                        .with_context(|| format!("failed to add column {column} to {table}"))?;
                }
            }
            continue;
        }

        let mut columns = vec![
            "mof_id INTEGER PRIMARY KEY".to_string(),
            "name TEXT NOT NULL DEFAULT ''".to_string(),
        ];
        columns.extend(
            ends.into_iter()
                .map(|(association, end)| {
                    reference_column_ddl(&association.column(end), association.kind)
                }),
        );

        let ddl = format!("CREATE TABLE \"{table}\" (\n  {}\n)", columns.join(",\n  "));
        conn.execute_batch(&ddl).with_context(|| format!("failed to create class table {table}"))?;
    }

    Ok(())
}

fn reference_column_ddl(column: &str, kind: AssociationKind) -> String {
    let storage = association_table(kind);
    format!("\"{column}\" INTEGER REFERENCES {}({})", storage.table, storage.id_column)
}

pub(crate) fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table_name],
            |_row| Ok(()),
        )
        .optional()?
        .is_some();
    Ok(exists)
}

pub(crate) fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let query = format!("PRAGMA table_info(\"{table}\")");
    let mut stmt = conn.prepare(&query)?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for row in rows {
        if row? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now_rfc3339()?],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc().format(&Rfc3339).context("failed to format timestamp")
}
