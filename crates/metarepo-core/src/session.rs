use serde::{Deserialize, Serialize};

use crate::model::{
    AssociationEnd, AssociationInstance, AssociationKind, AssociationTable, ObjectRef, ObjectTable,
    PersistentId,
};
use crate::sql::BatchedStatement;
use crate::Result;

/// Parameter value bound into a statement.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Text(String),
}

impl From<PersistentId> for SqlValue {
    fn from(value: PersistentId) -> Self {
        Self::Integer(value.0)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// Read access to the object model backing the repository.
pub trait ObjectModel {
    /// Backing table of `type_name`.
    ///
    /// # Errors
    /// Returns [`crate::DeleteError::MissingMapping`] for unknown types.
    fn object_table(&self, type_name: &str) -> Result<ObjectTable>;

    /// Column on `type_name`'s table that stores the instance ID of
    /// `association` for the given end.
    ///
    /// # Errors
    /// Returns [`crate::DeleteError::MissingMapping`] when the type does not play that end.
    fn foreign_key_column(
        &self,
        type_name: &str,
        association: &str,
        end: AssociationEnd,
    ) -> Result<String>;

    /// Association and collection tables for one kind.
    ///
    /// Member removal and ordered fix-ups address members only through
    /// [`AssociationTable::collection`]; a kind that keeps its members in the
    /// association table itself can still be deleted wholesale, but plans that
    /// remove or renumber its members fail before any statement runs.
    ///
    /// # Errors
    /// Returns [`crate::DeleteError::MissingMapping`] when the kind has no storage.
    fn association_table(&self, kind: AssociationKind) -> Result<AssociationTable>;

    /// Every association instance `object` participates in through its own
    /// foreign-key columns.
    ///
    /// # Errors
    /// Returns [`crate::DeleteError::UnknownObject`] when the object does not exist.
    fn associations_of(&self, object: &ObjectRef) -> Result<Vec<AssociationInstance>>;

    /// The many-to-many instance owned by `target` that mirrors `association`.
    ///
    /// # Errors
    /// Returns [`crate::DeleteError::MissingMapping`] when `target` has no paired instance.
    fn paired_association(
        &self,
        association: &AssociationInstance,
        target: &ObjectRef,
    ) -> Result<AssociationInstance>;
}

/// Transaction-bound statement execution.
pub trait StorageSession {
    fn quote_identifier(&self, identifier: &str) -> String;

    /// Execute one statement and return the number of affected rows.
    ///
    /// # Errors
    /// Returns [`crate::DeleteError::Storage`] with the driver error.
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<usize>;

    /// Execute a prepared statement once per parameter set, in order.
    ///
    /// # Errors
    /// Returns the first execution failure; earlier executions are not undone.
    fn execute_batched(&mut self, statement: &BatchedStatement) -> Result<usize> {
        let mut affected = 0;
        for params in &statement.executions {
            affected += self.execute(&statement.sql, params)?;
        }
        Ok(affected)
    }
}

/// Second-level cache eviction hooks.
pub trait CacheInvalidator {
    fn evict_entity(&mut self, type_name: &str, id: PersistentId);
    fn evict_collection(&mut self, association: &str, collection: &str, owner: PersistentId);
    fn evict_queries(&mut self, region: &str);
}

/// Cache invalidator for sessions without a second-level cache.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCache;

impl CacheInvalidator for NoopCache {
    fn evict_entity(&mut self, _type_name: &str, _id: PersistentId) {}

    fn evict_collection(&mut self, _association: &str, _collection: &str, _owner: PersistentId) {}

    fn evict_queries(&mut self, _region: &str) {}
}
