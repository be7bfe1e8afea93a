//! SQLite-backed metadata repository: meta-model driven schema, object and
//! association writes, and cascading deletion through `metarepo-core`.

mod cache;
mod config;
mod object_model;
mod schema;
mod session;

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use metarepo_core::{
    plan_deletion, AssociationEnd, AssociationKind, CacheInvalidator, DeletionExecutor,
    DeletionPlan, ExecutionReport, ObjectRef, PersistentId, QUERY_CACHE_REGION,
};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};

pub use cache::{CacheStats, ObjectCache};
pub use config::{AssociationDef, ClassDef, MetaModel, RepositoryConfig};
pub use object_model::SqliteObjectModel;
pub use schema::{association_table, SchemaStatus, LATEST_SCHEMA_VERSION};
pub use session::SqliteSession;

use crate::object_model::load_members;

pub struct SqliteStore {
    conn: Connection,
    config: RepositoryConfig,
    cache: ObjectCache,
}

/// One row of a class table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectRecord {
    pub type_name: String,
    pub id: PersistentId,
    pub name: String,
}

impl ObjectRecord {
    #[must_use]
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(self.type_name.clone(), self.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeletionOutcome {
    pub plan: DeletionPlan,
    pub report: ExecutionReport,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

/// Association or collection row naming an object that no longer exists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DanglingReference {
    pub table: String,
    pub association: PersistentId,
    pub missing: ObjectRef,
}

/// Ordered collection whose ordinals are not exactly `0..len`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrdinalGap {
    pub table: String,
    pub association: PersistentId,
    pub members: i64,
    pub max_ordinal: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub dangling_references: Vec<DanglingReference>,
    pub ordinal_gaps: Vec<OrdinalGap>,
    pub schema_status: SchemaStatus,
}

impl IntegrityReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.quick_check_ok
            && self.foreign_key_violations.is_empty()
            && self.dangling_references.is_empty()
            && self.ordinal_gaps.is_empty()
    }
}

impl SqliteStore {
    /// Open a SQLite-backed repository and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path, config: RepositoryConfig) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self::with_connection(conn, config))
    }

    /// # Errors
    /// Returns an error when the in-memory database cannot be created.
    pub fn open_in_memory(config: RepositoryConfig) -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("failed to configure sqlite pragmas")?;
        Ok(Self::with_connection(conn, config))
    }

    fn with_connection(conn: Connection, config: RepositoryConfig) -> Self {
        Self { conn, config, cache: ObjectCache::default() }
    }

    #[must_use]
    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        schema::schema_status(&self.conn, &self.config.metamodel)
    }

    /// Apply forward migrations and create class tables for the configured meta-model.
    ///
    /// # Errors
    /// Returns an error when any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        schema::migrate(&mut self.conn, &self.config.metamodel)?;
        self.cache.clear();
        Ok(())
    }

    /// Insert one object of `type_name` under a freshly allocated persistent ID.
    ///
    /// # Errors
    /// Returns an error for unknown classes or when the insert fails.
    pub fn create_object(&mut self, type_name: &str, name: &str) -> Result<ObjectRecord> {
        let table = self.class_table(type_name)?;

        let tx = self.conn.transaction().context("failed to start transaction")?;
        let id = allocate_id(&tx)?;
        tx.execute(
            &format!("INSERT INTO \"{table}\"(mof_id, name) VALUES (?1, ?2)"),
            params![id.get(), name],
        )
        .with_context(|| format!("failed to insert {type_name}"))?;
        tx.commit().context("failed to commit object transaction")?;

        let record = ObjectRecord { type_name: type_name.to_string(), id, name: name.to_string() };
        self.cache.evict_queries(QUERY_CACHE_REGION);
        self.cache.put_entity(record.clone());
        tracing::debug!(type_name, id = id.get(), "created object");
        Ok(record)
    }

    /// Link `child` under `parent` through `association`, appending to ordered collections.
    ///
    /// Returns the association instance owned by `parent`.
    ///
    /// # Errors
    /// Returns an error when the objects do not play the association's ends, when a
    /// single-valued end is already occupied, or when any write fails.
    pub fn link(
        &mut self,
        association: &str,
        parent: &ObjectRef,
        child: &ObjectRef,
    ) -> Result<PersistentId> {
        let def = self
            .config
            .metamodel
            .association(association)
            .cloned()
            .ok_or_else(|| anyhow!("unknown association {association}"))?;
        if def.parent != parent.type_name || def.child != child.type_name {
            return Err(anyhow!(
                "{association} links {} to {}, got {parent} and {child}",
                def.parent,
                def.child
            ));
        }
        let parent_table = self.class_table(&parent.type_name)?;
        let child_table = self.class_table(&child.type_name)?;
        let parent_column = def.column(AssociationEnd::Parent);
        let child_column = def.column(AssociationEnd::Child);

        let tx = self.conn.transaction().context("failed to start transaction")?;
        let parent_instance = read_end(&tx, &parent_table, &parent_column, parent)?;
        let child_instance = read_end(&tx, &child_table, &child_column, child)?;
        let storage = association_table(def.kind);
        let mut touched = Vec::new();

        let owned = match def.kind {
            AssociationKind::OneToOne => {
                if parent_instance.is_some() || child_instance.is_some() {
                    return Err(anyhow!("{association} is already set on {parent} or {child}"));
                }
                let id = allocate_id(&tx)?;
                tx.execute(
                    "INSERT INTO assoc_one_to_one(
                        mof_id, assoc_type, parent_type, parent_id, child_type, child_id
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        id.get(),
                        def.name,
                        parent.type_name,
                        parent.id.get(),
                        child.type_name,
                        child.id.get()
                    ],
                )
                .context("failed to insert one-to-one association")?;
                write_end(&tx, &parent_table, &parent_column, parent, id)?;
                write_end(&tx, &child_table, &child_column, child, id)?;
                touched.push(id);
                id
            }
            AssociationKind::OneToMany
            | AssociationKind::OneToManyHighCardinality
            | AssociationKind::OneToManyOrdered => {
                if child_instance.is_some() {
                    return Err(anyhow!("{child} already has a {association} owner"));
                }
                let id = match parent_instance {
                    Some(id) => id,
                    None => {
                        let id =
                            insert_collection_owner(&tx, &storage.table, &def.name, parent, false)?;
                        write_end(&tx, &parent_table, &parent_column, parent, id)?;
                        id
                    }
                };
                append_member(&tx, def.kind, id, child)?;
                write_end(&tx, &child_table, &child_column, child, id)?;
                touched.push(id);
                id
            }
            AssociationKind::ManyToMany | AssociationKind::ManyToManyOrdered => {
                let forward = match parent_instance {
                    Some(id) => id,
                    None => {
                        let id =
                            insert_collection_owner(&tx, &storage.table, &def.name, parent, false)?;
                        write_end(&tx, &parent_table, &parent_column, parent, id)?;
                        id
                    }
                };
                let reverse = match child_instance {
                    Some(id) => id,
                    None => {
                        let id =
                            insert_collection_owner(&tx, &storage.table, &def.name, child, true)?;
                        write_end(&tx, &child_table, &child_column, child, id)?;
                        id
                    }
                };
                append_member(&tx, def.kind, forward, child)?;
                append_member(&tx, def.kind, reverse, parent)?;
                touched.extend([forward, reverse]);
                forward
            }
        };
        tx.commit().context("failed to commit link transaction")?;

        let collection = storage.collection.as_ref().map_or(&storage.table, |c| &c.table);
        for id in touched {
            self.cache.evict_collection(&def.name, collection, id);
        }
        self.cache.evict_queries(QUERY_CACHE_REGION);
        tracing::debug!(
            association,
            parent = %parent,
            child = %child,
            instance = owned.get(),
            "linked objects"
        );
        Ok(owned)
    }

    /// Load one object row.
    ///
    /// # Errors
    /// Returns an error for unknown classes or when the read fails.
    pub fn get_object(&mut self, object: &ObjectRef) -> Result<Option<ObjectRecord>> {
        if let Some(record) = self.cache.entity(&object.type_name, object.id) {
            return Ok(Some(record));
        }

        let table = self.class_table(&object.type_name)?;
        let name = self
            .conn
            .query_row(
                &format!("SELECT name FROM \"{table}\" WHERE mof_id = ?1"),
                params![object.id.get()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .with_context(|| format!("failed to load {object}"))?;

        let record = name.map(|name| ObjectRecord {
            type_name: object.type_name.clone(),
            id: object.id,
            name,
        });
        if let Some(record) = &record {
            self.cache.put_entity(record.clone());
        }
        Ok(record)
    }

    /// All objects of one class ordered by persistent ID.
    ///
    /// # Errors
    /// Returns an error for unknown classes or when the read fails.
    pub fn list_objects(&mut self, type_name: &str) -> Result<Vec<ObjectRecord>> {
        let key = format!("list:{type_name}");
        if let Some(records) = self.cache.query(QUERY_CACHE_REGION, &key) {
            return Ok(records);
        }

        let table = self.class_table(type_name)?;
        let mut stmt =
            self.conn.prepare(&format!("SELECT mof_id, name FROM \"{table}\" ORDER BY mof_id"))?;
        let rows = stmt.query_map([], |row| {
            Ok(ObjectRecord {
                type_name: type_name.to_string(),
                id: PersistentId(row.get(0)?),
                name: row.get(1)?,
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }

        self.cache.put_query(QUERY_CACHE_REGION, &key, records.clone());
        Ok(records)
    }

    /// Association instance stored in `object`'s column for one end of `association`.
    ///
    /// # Errors
    /// Returns an error when `object` does not play that end or the read fails.
    pub fn read_instance(
        &self,
        object: &ObjectRef,
        association: &str,
        end: AssociationEnd,
    ) -> Result<Option<PersistentId>> {
        let def = self
            .config
            .metamodel
            .association(association)
            .ok_or_else(|| anyhow!("unknown association {association}"))?;
        if def.class_at(end) != object.type_name {
            return Err(anyhow!("{object} does not play the {} end of {association}", end.as_str()));
        }
        let table = self.class_table(&object.type_name)?;
        read_end(&self.conn, &table, &def.column(end), object)
    }

    /// Objects on the other side of the `association` instance `object` holds at `end`,
    /// in ordinal order.
    ///
    /// Owners see their members; a member of a one-to-many or one-to-one
    /// association sees its owner.
    ///
    /// # Errors
    /// Returns an error when `object` does not play that end or the read fails.
    pub fn related(
        &mut self,
        object: &ObjectRef,
        association: &str,
        end: AssociationEnd,
    ) -> Result<Vec<ObjectRef>> {
        let Some(id) = self.read_instance(object, association, end)? else {
            return Ok(Vec::new());
        };
        let def = self
            .config
            .metamodel
            .association(association)
            .cloned()
            .ok_or_else(|| anyhow!("unknown association {association}"))?;

        let storage = association_table(def.kind);
        let collection =
            storage.collection.as_ref().map_or_else(|| storage.table.clone(), |c| c.table.clone());
        let members = if let Some(members) = self.cache.collection(&collection, id) {
            members
        } else {
            let model = SqliteObjectModel::new(&self.conn, &self.config.metamodel);
            let instance = model.instance(&def, id)?;
            let mut members = vec![instance.parent];
            members.extend(instance.children);
            self.cache.put_collection(&collection, id, members.clone());
            members
        };

        // The first cached entry is the instance's own parent.
        let mut members = members.into_iter();
        let owner = members.next();
        if owner.as_ref() == Some(object) {
            Ok(members.collect())
        } else {
            Ok(owner.into_iter().collect())
        }
    }

    /// Find the object carrying a persistent ID across every class table.
    ///
    /// # Errors
    /// Returns an error when no class table holds `id`.
    pub fn resolve(&self, id: PersistentId) -> Result<ObjectRef> {
        for class in &self.config.metamodel.classes {
            let found = self
                .conn
                .query_row(
                    &format!("SELECT 1 FROM \"{}\" WHERE mof_id = ?1", class.table_name()),
                    params![id.get()],
                    |_row| Ok(()),
                )
                .optional()
                .with_context(|| format!("failed to probe {}", class.name))?;
            if found.is_some() {
                return Ok(ObjectRef::new(class.name.clone(), id));
            }
        }
        Err(anyhow!("no object with persistent ID {id}"))
    }

    /// Compute the deletion plan for `requested` without changing anything.
    ///
    /// # Errors
    /// Returns an error when planning detects an inconsistency or a read fails.
    pub fn plan_deletion(&self, requested: &[ObjectRef]) -> Result<DeletionPlan> {
        let model = SqliteObjectModel::new(&self.conn, &self.config.metamodel);
        plan_deletion(&model, requested).context("failed to plan deletion")
    }

    /// Delete `requested` and everything they compositely own in one transaction.
    ///
    /// # Errors
    /// Returns an error when planning or any statement fails; nothing is committed then.
    pub fn delete_objects(&mut self, requested: &[ObjectRef]) -> Result<DeletionOutcome> {
        let tx = self.conn.transaction().context("failed to start deletion transaction")?;
        let outcome = execute_deletion(&tx, &self.config, &mut self.cache, requested)?;
        tx.commit().context("failed to commit deletion transaction")?;

        tracing::info!(
            requested = requested.len(),
            deleted_objects = outcome.plan.object_count(),
            deleted_associations = outcome.plan.association_count(),
            fix_ups = outcome.plan.fix_up_count(),
            statements = outcome.report.statements,
            "deleted objects"
        );
        Ok(outcome)
    }

    /// Run quick-check, foreign-key-check, dangling-reference and ordinal probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            dangling_references: self.dangling_references()?,
            ordinal_gaps: self.ordinal_gaps()?,
            schema_status: self.schema_status()?,
        })
    }

    fn dangling_references(&self) -> Result<Vec<DanglingReference>> {
        let mut probes = Vec::new();
        for kind in AssociationKind::ALL {
            let storage = association_table(kind);
            probes.push((storage.table.clone(), "mof_id", "parent_type", "parent_id"));
            if kind == AssociationKind::OneToOne {
                probes.push((storage.table.clone(), "mof_id", "child_type", "child_id"));
            }
            if let Some(collection) = storage.collection {
                probes.push((collection.table, "mof_id", "member_type", "member_id"));
            }
        }

        let mut dangling = Vec::new();
        for (table, owner_column, type_column, id_column) in probes {
            for class in &self.config.metamodel.classes {
                let sql = format!(
                    "SELECT r.{owner_column}, r.{id_column} FROM {table} r
                     WHERE r.{type_column} = ?1
                       AND NOT EXISTS (SELECT 1 FROM \"{}\" o WHERE o.mof_id = r.{id_column})
                     ORDER BY r.{owner_column}, r.{id_column}",
                    class.table_name()
                );
                let mut stmt = self.conn.prepare(&sql)?;
                let rows = stmt.query_map(params![class.name], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
                })?;
                for row in rows {
                    let (association, missing) = row?;
                    dangling.push(DanglingReference {
                        table: table.clone(),
                        association: PersistentId(association),
                        missing: ObjectRef::new(class.name.clone(), missing),
                    });
                }
            }
        }
        Ok(dangling)
    }

    fn ordinal_gaps(&self) -> Result<Vec<OrdinalGap>> {
        let mut gaps = Vec::new();
        for kind in AssociationKind::ALL {
            let Some(collection) = association_table(kind).collection else {
                continue;
            };
            let Some(ordinal) = collection.ordinal_column else {
                continue;
            };
            let sql = format!(
                "SELECT {owner}, COUNT(*), MAX({ordinal}) FROM {table}
                 GROUP BY {owner}
                 HAVING MIN({ordinal}) != 0 OR MAX({ordinal}) + 1 != COUNT(*)
                 ORDER BY {owner}",
                owner = collection.owner_column,
                table = collection.table,
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map([], |row| {
                Ok(OrdinalGap {
                    table: collection.table.clone(),
                    association: PersistentId(row.get(0)?),
                    members: row.get(1)?,
                    max_ordinal: row.get(2)?,
                })
            })?;
            for row in rows {
                gaps.push(row?);
            }
        }
        Ok(gaps)
    }

    fn class_table(&self, type_name: &str) -> Result<String> {
        self.config
            .metamodel
            .class(type_name)
            .map(ClassDef::table_name)
            .ok_or_else(|| anyhow!("unknown class {type_name}"))
    }
}

fn execute_deletion(
    tx: &Transaction<'_>,
    config: &RepositoryConfig,
    cache: &mut ObjectCache,
    requested: &[ObjectRef],
) -> Result<DeletionOutcome> {
    let model = SqliteObjectModel::new(tx, &config.metamodel);
    let plan = plan_deletion(&model, requested).context("failed to plan deletion")?;

    let mut session = SqliteSession::new(tx);
    let report = DeletionExecutor::new(&mut session, &model, config.max_batch_parameters)
        .and_then(|executor| executor.execute(&plan, cache))
        .context("failed to execute deletion plan")?;

    Ok(DeletionOutcome { plan, report })
}

/// Callers hold a write transaction, so read-then-increment cannot race.
fn allocate_id(conn: &Connection) -> Result<PersistentId> {
    let id = conn
        .query_row("SELECT next_id FROM mof_sequence WHERE name = 'mof_id'", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to allocate persistent ID; is the repository migrated?")?;
    conn.execute("UPDATE mof_sequence SET next_id = ?1 WHERE name = 'mof_id'", params![id + 1])
        .context("failed to advance mof_sequence")?;
    Ok(PersistentId(id))
}

fn read_end(
    conn: &Connection,
    table: &str,
    column: &str,
    object: &ObjectRef,
) -> Result<Option<PersistentId>> {
    let value = conn
        .query_row(
            &format!("SELECT \"{column}\" FROM \"{table}\" WHERE mof_id = ?1"),
            params![object.id.get()],
            |row| row.get::<_, Option<i64>>(0),
        )
        .optional()
        .with_context(|| format!("failed to read {column} of {object}"))?
        .ok_or_else(|| anyhow!("unknown object {object}"))?;
    Ok(value.map(PersistentId))
}

fn write_end(
    conn: &Connection,
    table: &str,
    column: &str,
    object: &ObjectRef,
    id: PersistentId,
) -> Result<()> {
    conn.execute(
        &format!("UPDATE \"{table}\" SET \"{column}\" = ?1 WHERE mof_id = ?2"),
        params![id.get(), object.id.get()],
    )
    .with_context(|| format!("failed to set {column} of {object}"))?;
    Ok(())
}

fn insert_collection_owner(
    conn: &Connection,
    table: &str,
    association: &str,
    owner: &ObjectRef,
    reversed: bool,
) -> Result<PersistentId> {
    let id = allocate_id(conn)?;
    conn.execute(
        &format!(
            "INSERT INTO {table}(mof_id, assoc_type, parent_type, parent_id, reversed)
             VALUES (?1, ?2, ?3, ?4, ?5)"
        ),
        params![id.get(), association, owner.type_name, owner.id.get(), reversed],
    )
    .with_context(|| format!("failed to insert {association} instance for {owner}"))?;
    Ok(id)
}

fn append_member(
    conn: &Connection,
    kind: AssociationKind,
    owner: PersistentId,
    member: &ObjectRef,
) -> Result<()> {
    let storage = association_table(kind);
    let collection = storage
        .collection
        .as_ref()
        .ok_or_else(|| anyhow!("{kind} associations have no collection table"))?;

    let inserted = if let Some(ordinal) = &collection.ordinal_column {
        let existing = load_members(conn, &storage, owner)?;
        conn.execute(
            &format!(
                "INSERT INTO {}({}, {}, {}, {ordinal}) VALUES (?1, ?2, ?3, ?4)",
                collection.table,
                collection.owner_column,
                collection.member_type_column,
                collection.member_column
            ),
            params![owner.get(), member.type_name, member.id.get(), i64::try_from(existing.len())?],
        )
    } else {
        conn.execute(
            &format!(
                "INSERT INTO {}({}, {}, {}) VALUES (?1, ?2, ?3)",
                collection.table,
                collection.owner_column,
                collection.member_type_column,
                collection.member_column
            ),
            params![owner.get(), member.type_name, member.id.get()],
        )
    };
    inserted.with_context(|| format!("failed to append {member} to {}", collection.table))?;
    Ok(())
}
