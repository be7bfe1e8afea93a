use std::collections::{BTreeMap, BTreeSet};

use crate::model::{
    AssociationEnd, AssociationInstance, AssociationKind, AssociationTable, CollectionTable,
    ObjectRef, ObjectTable, PersistentId,
};
use crate::session::{CacheInvalidator, ObjectModel, SqlValue, StorageSession};
use crate::{DeleteError, Result};

/// Object model fixture mirroring the SQLite store layout.
#[derive(Debug, Default)]
pub struct InMemoryModel {
    next_id: i64,
    objects: BTreeMap<PersistentId, ObjectRef>,
    instances: BTreeMap<PersistentId, AssociationInstance>,
    columns: BTreeMap<(PersistentId, String, AssociationEnd), PersistentId>,
    inline_members: bool,
}

impl InMemoryModel {
    fn allocate(&mut self) -> PersistentId {
        self.next_id += 1;
        PersistentId(self.next_id)
    }

    pub fn object(&mut self, type_name: &str) -> ObjectRef {
        let object = ObjectRef::new(type_name, self.allocate());
        self.objects.insert(object.id, object.clone());
        object
    }

    pub fn associate(
        &mut self,
        association: &str,
        kind: AssociationKind,
        composite: bool,
        parent: &ObjectRef,
        children: &[ObjectRef],
    ) -> PersistentId {
        let id = self.allocate();
        self.instances.insert(
            id,
            AssociationInstance {
                id,
                kind,
                association: association.to_string(),
                composite,
                reversed: false,
                parent: parent.clone(),
                children: children.to_vec(),
            },
        );
        self.columns.insert((parent.id, association.to_string(), AssociationEnd::Parent), id);

        for child in children {
            if kind.is_many_to_many() {
                let key = (child.id, association.to_string(), AssociationEnd::Child);
                if let Some(existing) = self.columns.get(&key).copied() {
                    if let Some(instance) = self.instances.get_mut(&existing) {
                        instance.children.push(parent.clone());
                    }
                    continue;
                }
                let reverse_id = self.allocate();
                self.instances.insert(
                    reverse_id,
                    AssociationInstance {
                        id: reverse_id,
                        kind,
                        association: association.to_string(),
                        composite,
                        reversed: true,
                        parent: child.clone(),
                        children: vec![parent.clone()],
                    },
                );
                self.columns.insert(key, reverse_id);
            } else {
                self.columns.insert((child.id, association.to_string(), AssociationEnd::Child), id);
            }
        }

        id
    }

    /// Report every kind as keeping its members in the association table itself.
    pub fn store_members_inline(&mut self) {
        self.inline_members = true;
    }

    pub fn instance(&self, id: PersistentId) -> Option<&AssociationInstance> {
        self.instances.get(&id)
    }
}

impl ObjectModel for InMemoryModel {
    fn object_table(&self, type_name: &str) -> Result<ObjectTable> {
        Ok(ObjectTable { table: type_name.to_ascii_lowercase(), id_column: "mof_id".to_string() })
    }

    fn foreign_key_column(
        &self,
        _type_name: &str,
        association: &str,
        end: AssociationEnd,
    ) -> Result<String> {
        Ok(format!("{}_{}", association.to_ascii_lowercase(), end.as_str()))
    }

    fn association_table(&self, kind: AssociationKind) -> Result<AssociationTable> {
        let table = format!("assoc_{kind}");
        let has_collection = kind != AssociationKind::OneToOne && !self.inline_members;
        let collection = has_collection.then(|| CollectionTable {
            table: format!("{table}_members"),
            owner_column: "mof_id".to_string(),
            member_type_column: "member_type".to_string(),
            member_column: "member_id".to_string(),
            ordinal_column: (kind.is_ordered() || kind.is_many_to_many())
                .then(|| "ordinal".to_string()),
        });
        Ok(AssociationTable { table, id_column: "mof_id".to_string(), collection })
    }

    fn associations_of(&self, object: &ObjectRef) -> Result<Vec<AssociationInstance>> {
        if !self.objects.contains_key(&object.id) {
            return Err(DeleteError::UnknownObject(object.clone()));
        }

        let ids = self
            .columns
            .iter()
            .filter(|((owner, _, _), _)| *owner == object.id)
            .map(|(_, id)| *id)
            .collect::<BTreeSet<_>>();

        Ok(ids.iter().filter_map(|id| self.instances.get(id)).cloned().collect())
    }

    fn paired_association(
        &self,
        association: &AssociationInstance,
        target: &ObjectRef,
    ) -> Result<AssociationInstance> {
        self.columns
            .get(&(target.id, association.association.clone(), association.target_end()))
            .and_then(|id| self.instances.get(id))
            .cloned()
            .ok_or_else(|| {
                DeleteError::MissingMapping(format!(
                    "no paired {} instance for {target}",
                    association.association
                ))
            })
    }
}

#[derive(Debug, Default)]
pub struct RecordingSession {
    pub statements: Vec<(String, Vec<SqlValue>)>,
    pub fail_on: Option<String>,
}

impl StorageSession for RecordingSession {
    fn quote_identifier(&self, identifier: &str) -> String {
        format!("\"{identifier}\"")
    }

    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        if self.fail_on.as_deref().is_some_and(|needle| sql.contains(needle)) {
            return Err(DeleteError::storage(std::io::Error::other(format!(
                "injected failure: {sql}"
            ))));
        }
        self.statements.push((sql.to_string(), params.to_vec()));
        Ok(1)
    }
}

#[derive(Debug, Default)]
pub struct RecordingCache {
    pub entities: Vec<(String, PersistentId)>,
    pub collections: Vec<(String, String, PersistentId)>,
    pub regions: Vec<String>,
}

impl CacheInvalidator for RecordingCache {
    fn evict_entity(&mut self, type_name: &str, id: PersistentId) {
        self.entities.push((type_name.to_string(), id));
    }

    fn evict_collection(&mut self, association: &str, collection: &str, owner: PersistentId) {
        self.collections.push((association.to_string(), collection.to_string(), owner));
    }

    fn evict_queries(&mut self, region: &str) {
        self.regions.push(region.to_string());
    }
}
