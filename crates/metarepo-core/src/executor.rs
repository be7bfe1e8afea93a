use serde::{Deserialize, Serialize};

use crate::model::{AssociationKind, CollectionTable, PersistentId};
use crate::plan::{DeletionPlan, OrderedFixUp};
use crate::session::{CacheInvalidator, ObjectModel, SqlValue, StorageSession};
use crate::sql::{build_in_clause_batches, BatchedStatement, ChunkPlan, PARAMETER_LIST};
use crate::{DeleteError, Result, QUERY_CACHE_REGION};

/// Rows touched by each execution phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ExecutionReport {
    pub statements: usize,
    pub dereferenced_rows: usize,
    pub deleted_object_rows: usize,
    pub deleted_association_rows: usize,
    pub deleted_collection_rows: usize,
    pub removed_member_rows: usize,
    pub fixed_up_associations: usize,
    pub reinserted_rows: usize,
}

/// Issues the SQL for a [`DeletionPlan`] in dependency order.
pub struct DeletionExecutor<'a, S: StorageSession + ?Sized, M: ObjectModel + ?Sized> {
    session: &'a mut S,
    model: &'a M,
    max_parameters: usize,
    report: ExecutionReport,
}

impl<'a, S: StorageSession + ?Sized, M: ObjectModel + ?Sized> DeletionExecutor<'a, S, M> {
    /// # Errors
    /// Returns [`DeleteError::InvalidConfig`] when `max_parameters` is zero.
    pub fn new(session: &'a mut S, model: &'a M, max_parameters: usize) -> Result<Self> {
        ChunkPlan::new(0, max_parameters)?;
        Ok(Self { session, model, max_parameters, report: ExecutionReport::default() })
    }

    /// Evict cached state, then dereference, delete objects, delete
    /// associations, remove members and apply fix-ups, in that order.
    ///
    /// # Errors
    /// Returns [`DeleteError::MissingMapping`] before issuing anything when a kind
    /// with member removals or fix-ups has no collection table. Otherwise stops at
    /// the first failing statement; the caller's transaction must roll back.
    pub fn execute(
        mut self,
        plan: &DeletionPlan,
        cache: &mut dyn CacheInvalidator,
    ) -> Result<ExecutionReport> {
        self.check_collections(plan)?;
        self.evict(plan, cache)?;
        self.apply_dereferences(plan)?;
        self.delete_objects(plan)?;
        self.delete_associations(plan)?;
        self.remove_members(plan)?;
        self.apply_fix_ups(plan)?;

        tracing::debug!(
            statements = self.report.statements,
            deleted_objects = self.report.deleted_object_rows,
            deleted_associations = self.report.deleted_association_rows,
            fixed_up = self.report.fixed_up_associations,
            "executed deletion plan"
        );
        Ok(self.report)
    }

    fn check_collections(&self, plan: &DeletionPlan) -> Result<()> {
        for kind in plan.removals.keys() {
            self.collection_of(*kind)?;
        }
        for kind in plan.fix_ups.keys() {
            ordinal_column_of(&self.collection_of(*kind)?, *kind)?;
        }
        Ok(())
    }

    fn evict(&self, plan: &DeletionPlan, cache: &mut dyn CacheInvalidator) -> Result<()> {
        for (type_name, ids) in &plan.deletions {
            for id in ids {
                cache.evict_entity(type_name, *id);
            }
        }
        for (type_name, columns) in &plan.dereferences {
            for id in columns.values().flatten() {
                cache.evict_entity(type_name, *id);
            }
        }
        for touched in &plan.touched {
            let storage = self.model.association_table(touched.kind)?;
            let collection = storage.collection.as_ref().map_or(&storage.table, |c| &c.table);
            cache.evict_collection(&touched.association, collection, touched.id);
        }
        cache.evict_queries(QUERY_CACHE_REGION);
        Ok(())
    }

    fn apply_dereferences(&mut self, plan: &DeletionPlan) -> Result<()> {
        for (type_name, columns) in &plan.dereferences {
            let table = self.model.object_table(type_name)?;
            for (column, ids) in columns {
                let template = format!(
                    "UPDATE {} SET {} = NULL WHERE {} IN ({PARAMETER_LIST})",
                    self.quote(&table.table),
                    self.quote(column),
                    self.quote(&table.id_column),
                );
                self.report.dereferenced_rows += self.run_in_clause(&template, ids)?;
            }
        }
        Ok(())
    }

    fn delete_objects(&mut self, plan: &DeletionPlan) -> Result<()> {
        for (type_name, ids) in &plan.deletions {
            let table = self.model.object_table(type_name)?;
            let template = format!(
                "DELETE FROM {} WHERE {} IN ({PARAMETER_LIST})",
                self.quote(&table.table),
                self.quote(&table.id_column),
            );
            self.report.deleted_object_rows += self.run_in_clause(&template, ids)?;
        }
        Ok(())
    }

    fn delete_associations(&mut self, plan: &DeletionPlan) -> Result<()> {
        for (kind, ids) in &plan.association_deletions {
            let storage = self.model.association_table(*kind)?;
            if let Some(collection) = &storage.collection {
                let template = format!(
                    "DELETE FROM {} WHERE {} IN ({PARAMETER_LIST})",
                    self.quote(&collection.table),
                    self.quote(&collection.owner_column),
                );
                self.report.deleted_collection_rows += self.run_in_clause(&template, ids)?;
            }

            let template = format!(
                "DELETE FROM {} WHERE {} IN ({PARAMETER_LIST})",
                self.quote(&storage.table),
                self.quote(&storage.id_column),
            );
            self.report.deleted_association_rows += self.run_in_clause(&template, ids)?;
        }
        Ok(())
    }

    fn remove_members(&mut self, plan: &DeletionPlan) -> Result<()> {
        for (kind, ids) in &plan.removals {
            let collection = self.collection_of(*kind)?;
            let template = format!(
                "DELETE FROM {} WHERE {} IN ({PARAMETER_LIST})",
                self.quote(&collection.table),
                self.quote(&collection.member_column),
            );
            self.report.removed_member_rows += self.run_in_clause(&template, ids)?;
        }
        Ok(())
    }

    fn apply_fix_ups(&mut self, plan: &DeletionPlan) -> Result<()> {
        for (kind, fix_ups) in &plan.fix_ups {
            let collection = self.collection_of(*kind)?;
            let ordinal_column = ordinal_column_of(&collection, *kind)?;

            let delete_sql = format!(
                "DELETE FROM {} WHERE {} = ? AND {} >= ?",
                self.quote(&collection.table),
                self.quote(&collection.owner_column),
                self.quote(ordinal_column),
            );
            let insert_sql = format!(
                "INSERT INTO {} ({}, {}, {}, {}) VALUES (?, ?, ?, ?)",
                self.quote(&collection.table),
                self.quote(&collection.owner_column),
                self.quote(&collection.member_type_column),
                self.quote(&collection.member_column),
                self.quote(ordinal_column),
            );

            for fix_up in fix_ups {
                self.apply_fix_up(fix_up, &delete_sql, &insert_sql)?;
            }
        }
        Ok(())
    }

    fn apply_fix_up(&mut self, fix_up: &OrderedFixUp, delete_sql: &str, insert_sql: &str) -> Result<()> {
        let from = ordinal_value(fix_up.from_ordinal)?;
        self.report.statements += 1;
        self.session.execute(delete_sql, &[fix_up.association.into(), SqlValue::Integer(from)])?;

        let executions = fix_up
            .reinserted_ordinals()
            .map(|(ordinal, member)| {
                Ok(vec![
                    fix_up.association.into(),
                    SqlValue::Text(member.type_name.clone()),
                    member.id.into(),
                    SqlValue::Integer(ordinal_value(ordinal)?),
                ])
            })
            .collect::<Result<Vec<_>>>()?;

        if !executions.is_empty() {
            let statement = BatchedStatement { sql: insert_sql.to_string(), executions };
            self.report.statements += statement.executions.len();
            self.report.reinserted_rows += self.session.execute_batched(&statement)?;
        }

        self.report.fixed_up_associations += 1;
        Ok(())
    }

    fn collection_of(&self, kind: AssociationKind) -> Result<CollectionTable> {
        self.model.association_table(kind)?.collection.ok_or_else(|| {
            DeleteError::MissingMapping(format!("{kind} associations have no collection table"))
        })
    }

    fn run_in_clause<'v, I>(&mut self, template: &str, ids: I) -> Result<usize>
    where
        I: IntoIterator<Item = &'v PersistentId>,
    {
        let mut affected = 0;
        for statement in
            build_in_clause_batches(template, ids.into_iter().copied(), self.max_parameters)?
        {
            self.report.statements += statement.executions.len();
            affected += self.session.execute_batched(&statement)?;
        }
        Ok(affected)
    }

    fn quote(&self, identifier: &str) -> String {
        self.session.quote_identifier(identifier)
    }
}

fn ordinal_column_of(collection: &CollectionTable, kind: AssociationKind) -> Result<&str> {
    collection.ordinal_column.as_deref().ok_or_else(|| {
        DeleteError::MissingMapping(format!(
            "collection table {} of {kind} has no ordinal column",
            collection.table
        ))
    })
}

fn ordinal_value(ordinal: usize) -> Result<i64> {
    i64::try_from(ordinal)
        .map_err(|_| DeleteError::InvalidStatement(format!("ordinal {ordinal} exceeds i64")))
}

#[cfg(test)]
mod tests {
    use std::slice;

    use super::*;
    use crate::plan::plan_deletion;
    use crate::testing::{InMemoryModel, RecordingCache, RecordingSession};
    use crate::ObjectRef;

    fn run(
        model: &InMemoryModel,
        requested: &[ObjectRef],
        max_parameters: usize,
    ) -> Result<(RecordingSession, RecordingCache, ExecutionReport)> {
        let plan = plan_deletion(model, requested)?;
        let mut session = RecordingSession::default();
        let mut cache = RecordingCache::default();
        let report =
            DeletionExecutor::new(&mut session, model, max_parameters)?.execute(&plan, &mut cache)?;
        Ok((session, cache, report))
    }

    #[test]
    fn leaf_deletion_issues_one_delete() -> Result<()> {
        let mut model = InMemoryModel::default();
        let note = model.object("Note");

        let (session, cache, report) = run(&model, slice::from_ref(&note), 256)?;

        assert_eq!(
            session.statements,
            vec![(
                "DELETE FROM \"note\" WHERE \"mof_id\" IN (?)".to_string(),
                vec![SqlValue::Integer(note.id.0)]
            )]
        );
        assert_eq!(report.statements, 1);
        assert_eq!(cache.entities, vec![("Note".to_string(), note.id)]);
        assert_eq!(cache.regions, vec![QUERY_CACHE_REGION.to_string()]);
        Ok(())
    }

    #[test]
    fn phases_run_in_dependency_order() -> Result<()> {
        let mut model = InMemoryModel::default();
        let class = model.object("Class");
        let note = model.object("Note");
        let tag = model.object("Tag");
        let members = (0..3).map(|_| model.object("Class")).collect::<Vec<_>>();
        let watcher = model.object("Attribute");
        model.associate("Annotation", AssociationKind::OneToOne, false, &class, slice::from_ref(&note));
        model.associate("Favorites", AssociationKind::OneToManyOrdered, false, &tag, &members);
        model.associate("Watchers", AssociationKind::OneToMany, false, &tag, slice::from_ref(&watcher));

        let (session, _, report) = run(&model, &[note, members[0].clone(), watcher], 256)?;

        let verbs = session
            .statements
            .iter()
            .map(|(sql, _)| sql.split_whitespace().take(3).collect::<Vec<_>>().join(" "))
            .collect::<Vec<_>>();
        assert_eq!(
            verbs,
            vec![
                "UPDATE \"class\" SET",
                "DELETE FROM \"attribute\"",
                "DELETE FROM \"class\"",
                "DELETE FROM \"note\"",
                "DELETE FROM \"assoc_one_to_one\"",
                "DELETE FROM \"assoc_one_to_many_members\"",
                "DELETE FROM \"assoc_one_to_many_ordered_members\"",
                "INSERT INTO \"assoc_one_to_many_ordered_members\"",
                "INSERT INTO \"assoc_one_to_many_ordered_members\"",
            ]
        );
        assert_eq!(report.fixed_up_associations, 1);
        assert_eq!(report.reinserted_rows, 2);
        Ok(())
    }

    #[test]
    fn fix_up_reinserts_survivors_from_first_removed_ordinal() -> Result<()> {
        let mut model = InMemoryModel::default();
        let tag = model.object("Tag");
        let members = (0..4).map(|_| model.object("Class")).collect::<Vec<_>>();
        let favorites =
            model.associate("Favorites", AssociationKind::OneToManyOrdered, false, &tag, &members);

        let (session, cache, _) = run(&model, &[members[1].clone(), members[3].clone()], 256)?;

        let fix_up = session
            .statements
            .iter()
            .filter(|(sql, _)| sql.contains("assoc_one_to_many_ordered_members"))
            .cloned()
            .collect::<Vec<_>>();
        assert_eq!(
            fix_up,
            vec![
                (
                    "DELETE FROM \"assoc_one_to_many_ordered_members\" WHERE \"mof_id\" = ? AND \"ordinal\" >= ?"
                        .to_string(),
                    vec![favorites.into(), SqlValue::Integer(1)],
                ),
                (
                    "INSERT INTO \"assoc_one_to_many_ordered_members\" (\"mof_id\", \"member_type\", \"member_id\", \"ordinal\") VALUES (?, ?, ?, ?)"
                        .to_string(),
                    vec![
                        favorites.into(),
                        SqlValue::Text("Class".to_string()),
                        members[2].id.into(),
                        SqlValue::Integer(1),
                    ],
                ),
            ]
        );
        assert!(cache.collections.iter().any(|(_, _, id)| *id == favorites));
        Ok(())
    }

    #[test]
    fn large_deletions_are_batched() -> Result<()> {
        let mut model = InMemoryModel::default();
        let notes = (0..1000).map(|_| model.object("Note")).collect::<Vec<_>>();

        let (session, _, report) = run(&model, &notes, 256)?;

        let sizes = session.statements.iter().map(|(_, params)| params.len()).collect::<Vec<_>>();
        assert_eq!(sizes, vec![250, 250, 250, 250]);
        assert_eq!(report.deleted_object_rows, 4);
        Ok(())
    }

    #[test]
    fn storage_failure_stops_execution() {
        let mut model = InMemoryModel::default();
        let class = model.object("Class");
        let note = model.object("Note");
        model.associate("Annotation", AssociationKind::OneToOne, false, &class, slice::from_ref(&note));

        let plan = plan_deletion(&model, &[note]);
        let Ok(plan) = plan else { panic!("planning should succeed") };
        let mut session =
            RecordingSession { fail_on: Some("DELETE FROM \"note\"".to_string()), ..Default::default() };
        let result = DeletionExecutor::new(&mut session, &model, 16)
            .and_then(|executor| executor.execute(&plan, &mut RecordingCache::default()));

        assert!(matches!(result, Err(DeleteError::Storage(_))));
        assert_eq!(session.statements.len(), 1);
        assert!(session.statements[0].0.starts_with("UPDATE"));
    }

    #[test]
    fn member_removal_without_collection_table_fails_before_any_statement() -> Result<()> {
        let mut model = InMemoryModel::default();
        let tag = model.object("Tag");
        let members = (0..3).map(|_| model.object("Class")).collect::<Vec<_>>();
        model.associate("Favorites", AssociationKind::OneToManyOrdered, false, &tag, &members);
        let plan = plan_deletion(&model, slice::from_ref(&members[1]))?;
        model.store_members_inline();

        let mut session = RecordingSession::default();
        let mut cache = RecordingCache::default();
        let result = DeletionExecutor::new(&mut session, &model, 16)?.execute(&plan, &mut cache);

        assert!(matches!(result, Err(DeleteError::MissingMapping(_))));
        assert!(session.statements.is_empty());
        assert!(cache.entities.is_empty());
        Ok(())
    }

    #[test]
    fn inline_members_still_allow_wholesale_association_deletion() -> Result<()> {
        let mut model = InMemoryModel::default();
        let package = model.object("Package");
        let classes = (0..2).map(|_| model.object("Class")).collect::<Vec<_>>();
        model.associate("Contents", AssociationKind::OneToMany, true, &package, &classes);
        model.store_members_inline();

        let (session, _, report) = run(&model, slice::from_ref(&package), 16)?;

        assert_eq!(report.deleted_collection_rows, 0);
        assert_eq!(report.deleted_association_rows, 1);
        assert!(session.statements.iter().all(|(sql, _)| !sql.contains("_members")));
        assert!(session
            .statements
            .iter()
            .any(|(sql, _)| sql.starts_with("DELETE FROM \"assoc_one_to_many\"")));
        Ok(())
    }

    #[test]
    fn zero_parameter_bound_is_rejected() {
        let model = InMemoryModel::default();
        let mut session = RecordingSession::default();
        assert!(matches!(
            DeletionExecutor::new(&mut session, &model, 0),
            Err(DeleteError::InvalidConfig(_))
        ));
    }
}
