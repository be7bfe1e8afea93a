//! Cascading deletion planner for a relational metadata repository.
//!
//! Given a set of objects to remove, [`plan_deletion`] follows composite
//! ownership to the full deletion closure and classifies every association
//! instance touching it. [`DeletionExecutor`] then turns the resulting
//! [`DeletionPlan`] into batched, parameterized SQL issued through a
//! [`StorageSession`].

mod classify;
mod closure;
mod executor;
mod model;
mod plan;
mod session;
mod sql;

#[cfg(test)]
mod testing;

pub use closure::{compute_closure, DeletionClosure};
pub use executor::{DeletionExecutor, ExecutionReport};
pub use model::{
    AssociationEnd, AssociationInstance, AssociationKind, AssociationTable, CollectionTable,
    ObjectRef, ObjectTable, PersistentId,
};
pub use plan::{plan_deletion, DeletionPlan, OrderedFixUp, TouchedCollection};
pub use session::{CacheInvalidator, NoopCache, ObjectModel, SqlValue, StorageSession};
pub use sql::{
    build_in_clause_batches, BatchedStatement, ChunkPlan, EVEN_SPLIT_EXECUTION_FACTOR, PARAMETER_LIST,
};

/// Cache region holding query results that may mention deleted objects.
pub const QUERY_CACHE_REGION: &str = "metarepo.queries";

/// Default upper bound on parameters bound into one statement.
pub const DEFAULT_MAX_BATCH_PARAMETERS: usize = 256;

pub type Result<T, E = DeleteError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum DeleteError {
    #[error("inconsistent deletion request: {0}")]
    Inconsistency(String),
    #[error("missing mapping: {0}")]
    MissingMapping(String),
    #[error("unknown object: {0}")]
    UnknownObject(ObjectRef),
    #[error("invalid statement: {0}")]
    InvalidStatement(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Storage(Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl DeleteError {
    pub fn storage(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Storage(Box::new(err))
    }
}
