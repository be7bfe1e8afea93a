use std::collections::BTreeSet;

use crate::closure::DeletionClosure;
use crate::model::{AssociationEnd, AssociationInstance, AssociationKind, ObjectRef, PersistentId};
use crate::plan::{DeletionPlan, OrderedFixUp, TouchedCollection};
use crate::session::ObjectModel;
use crate::{DeleteError, Result};

/// Decides the disposition of each association instance touching a closure.
pub(crate) struct Classifier<'a, M: ObjectModel + ?Sized> {
    model: &'a M,
    closure: &'a DeletionClosure,
    plan: DeletionPlan,
    seen: BTreeSet<PersistentId>,
    indiscriminate: BTreeSet<AssociationKind>,
}

impl<'a, M: ObjectModel + ?Sized> Classifier<'a, M> {
    pub(crate) fn new(model: &'a M, closure: &'a DeletionClosure) -> Self {
        let plan = DeletionPlan {
            deletions: closure.deletions.clone(),
            composite_associations: closure.composite.keys().copied().collect(),
            ..DeletionPlan::default()
        };

        Self { model, closure, plan, seen: BTreeSet::new(), indiscriminate: BTreeSet::new() }
    }

    pub(crate) fn classify(&mut self, association: &AssociationInstance) -> Result<()> {
        if !self.seen.insert(association.id) {
            return Ok(());
        }
        self.plan.touched.insert(TouchedCollection::of(association));

        let owner_deleted = self.closure.contains(&association.parent);
        match association.kind {
            AssociationKind::OneToOne => self.classify_one_to_one(association, owner_deleted),
            AssociationKind::OneToMany | AssociationKind::OneToManyHighCardinality => {
                if owner_deleted {
                    self.delete_and_release_members(association)
                } else {
                    self.remove_indiscriminately(association.kind);
                    Ok(())
                }
            }
            AssociationKind::OneToManyOrdered => {
                if owner_deleted {
                    self.delete_and_release_members(association)
                } else {
                    self.classify_surviving_owner(association)
                }
            }
            AssociationKind::ManyToMany | AssociationKind::ManyToManyOrdered => {
                if owner_deleted {
                    self.delete_and_reclassify_targets(association)
                } else {
                    self.classify_surviving_owner(association)
                }
            }
        }
    }

    pub(crate) fn finish(self) -> DeletionPlan {
        tracing::debug!(
            objects = self.plan.object_count(),
            associations = self.plan.association_count(),
            dereferenced_types = self.plan.dereferences.len(),
            removal_kinds = self.plan.removals.len(),
            fix_ups = self.plan.fix_up_count(),
            "classified associations"
        );
        self.plan
    }

    fn classify_one_to_one(
        &mut self,
        association: &AssociationInstance,
        owner_deleted: bool,
    ) -> Result<()> {
        let [child] = association.children.as_slice() else {
            return Err(DeleteError::MissingMapping(format!(
                "one-to-one {} instance {} has {} children",
                association.association,
                association.id,
                association.children.len()
            )));
        };

        match (owner_deleted, self.closure.contains(child)) {
            (false, false) => Err(DeleteError::Inconsistency(format!(
                "one-to-one {} instance {} between {} and {} keeps both ends",
                association.association, association.id, association.parent, child
            ))),
            (true, true) => {
                self.plan.delete_association(association);
                Ok(())
            }
            (true, false) => {
                self.plan.delete_association(association);
                self.dereference(association, child, AssociationEnd::Child)
            }
            (false, true) => {
                self.plan.delete_association(association);
                self.dereference(association, &association.parent, AssociationEnd::Parent)
            }
        }
    }

    fn delete_and_release_members(&mut self, association: &AssociationInstance) -> Result<()> {
        self.plan.delete_association(association);
        let end = association.target_end();
        for child in &association.children {
            if !self.closure.contains(child) {
                self.dereference(association, child, end)?;
            }
        }
        Ok(())
    }

    /// Removes every deleted ID from all collections of `kind` the first time
    /// a surviving unordered owner is seen. IDs are globally unique, so rows of
    /// unrelated collections never match.
    fn remove_indiscriminately(&mut self, kind: AssociationKind) {
        if self.indiscriminate.insert(kind) {
            self.plan.removals.entry(kind).or_default().extend(self.closure.deleted_ids());
        }
    }

    fn delete_and_reclassify_targets(&mut self, association: &AssociationInstance) -> Result<()> {
        self.plan.delete_association(association);
        for target in &association.children {
            if !self.closure.contains(target) {
                let paired = self.model.paired_association(association, target)?;
                self.classify(&paired)?;
            }
        }
        Ok(())
    }

    fn classify_surviving_owner(&mut self, association: &AssociationInstance) -> Result<()> {
        let Some(first_deleted) =
            association.children.iter().position(|child| self.closure.contains(child))
        else {
            return Err(DeleteError::Inconsistency(format!(
                "{} instance {} owned by surviving {} has no deleted members",
                association.association, association.id, association.parent
            )));
        };

        if association.children.iter().all(|child| self.closure.contains(child)) {
            self.plan.delete_association(association);
            return self.dereference(association, &association.parent, association.source_end());
        }

        let reinsert = association.children[first_deleted..]
            .iter()
            .filter(|child| !self.closure.contains(child))
            .cloned()
            .collect();
        self.plan.fix_ups.entry(association.kind).or_default().push(OrderedFixUp {
            association: association.id,
            association_name: association.association.clone(),
            owner: association.parent.clone(),
            from_ordinal: first_deleted,
            reinsert,
        });
        Ok(())
    }

    fn dereference(
        &mut self,
        association: &AssociationInstance,
        object: &ObjectRef,
        end: AssociationEnd,
    ) -> Result<()> {
        let column =
            self.model.foreign_key_column(&object.type_name, &association.association, end)?;
        self.plan.dereference(object, column);
        Ok(())
    }
}
