use std::collections::BTreeSet;

use metarepo_core::{
    AssociationEnd, AssociationInstance, AssociationKind, AssociationTable, DeleteError,
    ObjectModel, ObjectRef, ObjectTable, PersistentId, Result,
};
use rusqlite::{params, Connection, OptionalExtension};

use crate::config::{AssociationDef, ClassDef, MetaModel};
use crate::schema::association_table;

/// [`ObjectModel`] reading association participation straight from the class
/// and association tables of one connection.
pub struct SqliteObjectModel<'c> {
    conn: &'c Connection,
    metamodel: &'c MetaModel,
}

impl<'c> SqliteObjectModel<'c> {
    #[must_use]
    pub fn new(conn: &'c Connection, metamodel: &'c MetaModel) -> Self {
        Self { conn, metamodel }
    }

    fn class(&self, type_name: &str) -> Result<&'c ClassDef> {
        self.metamodel
            .class(type_name)
            .ok_or_else(|| DeleteError::MissingMapping(format!("unknown class {type_name}")))
    }

    fn association_def(&self, name: &str) -> Result<&'c AssociationDef> {
        self.metamodel
            .association(name)
            .ok_or_else(|| DeleteError::MissingMapping(format!("unknown association {name}")))
    }

    /// Association instance ID stored in `object`'s end column, if any.
    fn end_value(
        &self,
        object: &ObjectRef,
        association: &AssociationDef,
        end: AssociationEnd,
    ) -> Result<Option<PersistentId>> {
        let table = self.class(&object.type_name)?.table_name();
        let sql = format!(
            "SELECT \"{}\" FROM \"{table}\" WHERE mof_id = ?1",
            association.column(end)
        );
        let value = self
            .conn
            .query_row(&sql, params![object.id.get()], |row| row.get::<_, Option<i64>>(0))
            .optional()
            .map_err(DeleteError::storage)?
            .ok_or_else(|| DeleteError::UnknownObject(object.clone()))?;
        Ok(value.map(PersistentId))
    }

    pub(crate) fn instance(
        &self,
        association: &AssociationDef,
        id: PersistentId,
    ) -> Result<AssociationInstance> {
        let storage = association_table(association.kind);
        let missing = || {
            DeleteError::MissingMapping(format!(
                "{} instance {id} has no row in {}",
                association.name, storage.table
            ))
        };

        if association.kind == AssociationKind::OneToOne {
            let sql = format!(
                "SELECT parent_type, parent_id, child_type, child_id FROM {} WHERE mof_id = ?1",
                storage.table
            );
            let (parent, child) = self
                .conn
                .query_row(&sql, params![id.get()], |row| {
                    Ok((
                        ObjectRef::new(row.get::<_, String>(0)?, row.get::<_, i64>(1)?),
                        ObjectRef::new(row.get::<_, String>(2)?, row.get::<_, i64>(3)?),
                    ))
                })
                .optional()
                .map_err(DeleteError::storage)?
                .ok_or_else(missing)?;

            return Ok(AssociationInstance {
                id,
                kind: association.kind,
                association: association.name.clone(),
                composite: association.composite,
                reversed: false,
                parent,
                children: vec![child],
            });
        }

        let sql = format!(
            "SELECT parent_type, parent_id, reversed FROM {} WHERE mof_id = ?1",
            storage.table
        );
        let (parent, reversed) = self
            .conn
            .query_row(&sql, params![id.get()], |row| {
                Ok((
                    ObjectRef::new(row.get::<_, String>(0)?, row.get::<_, i64>(1)?),
                    row.get::<_, bool>(2)?,
                ))
            })
            .optional()
            .map_err(DeleteError::storage)?
            .ok_or_else(missing)?;

        Ok(AssociationInstance {
            id,
            kind: association.kind,
            association: association.name.clone(),
            composite: association.composite,
            reversed,
            parent,
            children: load_members(self.conn, &storage, id)?,
        })
    }
}

/// Members of one collection in ordinal order, or insertion order when unordered.
pub(crate) fn load_members(
    conn: &Connection,
    storage: &AssociationTable,
    owner: PersistentId,
) -> Result<Vec<ObjectRef>> {
    let Some(collection) = &storage.collection else {
        return Ok(Vec::new());
    };
    let order_by = collection.ordinal_column.as_deref().unwrap_or("rowid");
    let sql = format!(
        "SELECT {}, {} FROM {} WHERE {} = ?1 ORDER BY {order_by}",
        collection.member_type_column,
        collection.member_column,
        collection.table,
        collection.owner_column,
    );

    let mut stmt = conn.prepare_cached(&sql).map_err(DeleteError::storage)?;
    let rows = stmt
        .query_map(params![owner.get()], |row| {
            Ok(ObjectRef::new(row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })
        .map_err(DeleteError::storage)?;

    let mut members = Vec::new();
    for row in rows {
        members.push(row.map_err(DeleteError::storage)?);
    }
    Ok(members)
}

impl ObjectModel for SqliteObjectModel<'_> {
    fn object_table(&self, type_name: &str) -> Result<ObjectTable> {
        Ok(ObjectTable { table: self.class(type_name)?.table_name(), id_column: "mof_id".to_string() })
    }

    fn foreign_key_column(
        &self,
        type_name: &str,
        association: &str,
        end: AssociationEnd,
    ) -> Result<String> {
        let association = self.association_def(association)?;
        if association.class_at(end) != type_name {
            return Err(DeleteError::MissingMapping(format!(
                "{type_name} does not play the {} end of {}",
                end.as_str(),
                association.name
            )));
        }
        Ok(association.column(end))
    }

    fn association_table(&self, kind: AssociationKind) -> Result<AssociationTable> {
        Ok(association_table(kind))
    }

    fn associations_of(&self, object: &ObjectRef) -> Result<Vec<AssociationInstance>> {
        let class = self.class(&object.type_name)?;
        let ends = self.metamodel.ends_of(&class.name);
        if ends.is_empty() {
            let table = class.table_name();
            let exists = self
                .conn
                .query_row(
                    &format!("SELECT 1 FROM \"{table}\" WHERE mof_id = ?1"),
                    params![object.id.get()],
                    |_row| Ok(()),
                )
                .optional()
                .map_err(DeleteError::storage)?
                .is_some();
            return if exists { Ok(Vec::new()) } else { Err(DeleteError::UnknownObject(object.clone())) };
        }

        let mut seen = BTreeSet::new();
        let mut instances = Vec::new();
        for (association, end) in ends {
            let Some(id) = self.end_value(object, association, end)? else {
                continue;
            };
            if seen.insert(id) {
                instances.push(self.instance(association, id)?);
            }
        }
        Ok(instances)
    }

    fn paired_association(
        &self,
        association: &AssociationInstance,
        target: &ObjectRef,
    ) -> Result<AssociationInstance> {
        let def = self.association_def(&association.association)?;
        let end = association.target_end();
        if def.class_at(end) != target.type_name {
            return Err(DeleteError::MissingMapping(format!(
                "{target} cannot sit on the {} end of {}",
                end.as_str(),
                def.name
            )));
        }

        let id = self.end_value(target, def, end)?.ok_or_else(|| {
            DeleteError::MissingMapping(format!("no paired {} instance for {target}", def.name))
        })?;
        self.instance(def, id)
    }
}
