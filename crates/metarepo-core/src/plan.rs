use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::classify::Classifier;
use crate::closure::compute_closure;
use crate::model::{AssociationInstance, AssociationKind, ObjectRef, PersistentId};
use crate::session::ObjectModel;
use crate::Result;

/// Delete-and-reinsert renumbering of one ordered collection.
///
/// Rows of `association` at or beyond `from_ordinal` are removed and
/// `reinsert` is written back starting at `from_ordinal`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct OrderedFixUp {
    pub association: PersistentId,
    pub association_name: String,
    pub owner: ObjectRef,
    pub from_ordinal: usize,
    pub reinsert: Vec<ObjectRef>,
}

impl OrderedFixUp {
    pub fn reinserted_ordinals(&self) -> impl Iterator<Item = (usize, &ObjectRef)> + '_ {
        self.reinsert.iter().enumerate().map(|(offset, member)| (self.from_ordinal + offset, member))
    }
}

/// Collection whose cached contents become stale once the plan runs.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
pub struct TouchedCollection {
    pub association: String,
    pub kind: AssociationKind,
    pub id: PersistentId,
}

impl TouchedCollection {
    #[must_use]
    pub fn of(instance: &AssociationInstance) -> Self {
        Self {
            association: instance.association.clone(),
            kind: instance.kind,
            id: instance.id,
        }
    }
}

/// Every mutation required to delete one batch of objects.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct DeletionPlan {
    /// Type → IDs of objects to delete.
    pub deletions: BTreeMap<String, BTreeSet<PersistentId>>,
    /// Kind → association instances deleted wholesale.
    pub association_deletions: BTreeMap<AssociationKind, BTreeSet<PersistentId>>,
    /// Type → column → IDs whose column is set to null.
    pub dereferences: BTreeMap<String, BTreeMap<String, BTreeSet<PersistentId>>>,
    /// Kind → member IDs removed from that kind's collection table.
    pub removals: BTreeMap<AssociationKind, BTreeSet<PersistentId>>,
    pub fix_ups: BTreeMap<AssociationKind, Vec<OrderedFixUp>>,
    pub composite_associations: BTreeSet<PersistentId>,
    pub touched: BTreeSet<TouchedCollection>,
}

impl DeletionPlan {
    #[must_use]
    pub fn is_in_deletion_map(&self, object: &ObjectRef) -> bool {
        self.deletions.get(&object.type_name).is_some_and(|ids| ids.contains(&object.id))
    }

    #[must_use]
    pub fn object_count(&self) -> usize {
        self.deletions.values().map(BTreeSet::len).sum()
    }

    #[must_use]
    pub fn association_count(&self) -> usize {
        self.association_deletions.values().map(BTreeSet::len).sum()
    }

    #[must_use]
    pub fn fix_up_count(&self) -> usize {
        self.fix_ups.values().map(Vec::len).sum()
    }

    pub(crate) fn delete_association(&mut self, instance: &AssociationInstance) {
        self.association_deletions.entry(instance.kind).or_default().insert(instance.id);
    }

    pub(crate) fn dereference(&mut self, object: &ObjectRef, column: String) {
        self.dereferences
            .entry(object.type_name.clone())
            .or_default()
            .entry(column)
            .or_default()
            .insert(object.id);
    }
}

/// Compute the deletion closure of `requested` and classify every association it touches.
///
/// # Errors
/// Returns [`crate::DeleteError::Inconsistency`] when an association's disposition
/// cannot be determined, and propagates object model failures.
pub fn plan_deletion<M>(model: &M, requested: &[ObjectRef]) -> Result<DeletionPlan>
where
    M: ObjectModel + ?Sized,
{
    let closure = compute_closure(model, requested)?;
    let mut classifier = Classifier::new(model, &closure);
    for association in closure.associations() {
        classifier.classify(association)?;
    }
    Ok(classifier.finish())
}

#[cfg(test)]
mod tests {
    use std::slice;

    use proptest::prelude::*;

    use super::*;
    use crate::testing::InMemoryModel;
    use crate::DeleteError;

    #[test]
    fn leaf_deletion_only_fills_deletion_map() -> Result<()> {
        let mut model = InMemoryModel::default();
        let note = model.object("Note");

        let plan = plan_deletion(&model, slice::from_ref(&note))?;

        assert_eq!(plan.object_count(), 1);
        assert!(plan.is_in_deletion_map(&note));
        assert!(plan.association_deletions.is_empty());
        assert!(plan.dereferences.is_empty());
        assert!(plan.removals.is_empty());
        assert!(plan.fix_ups.is_empty());
        Ok(())
    }

    #[test]
    fn composite_owner_deletion_removes_collection_without_fix_up() -> Result<()> {
        let mut model = InMemoryModel::default();
        let package = model.object("Package");
        let classes = (0..5).map(|_| model.object("Class")).collect::<Vec<_>>();
        let contents =
            model.associate("Contents", AssociationKind::OneToManyOrdered, true, &package, &classes);

        let requested = [package, classes[0].clone(), classes[2].clone(), classes[4].clone()];
        let plan = plan_deletion(&model, &requested)?;

        assert_eq!(plan.object_count(), 6);
        for class in &classes {
            assert!(plan.is_in_deletion_map(class));
        }
        assert_eq!(
            plan.association_deletions.get(&AssociationKind::OneToManyOrdered),
            Some(&BTreeSet::from([contents]))
        );
        assert!(plan.composite_associations.contains(&contents));
        assert!(plan.fix_ups.is_empty());
        assert!(plan.dereferences.is_empty());
        Ok(())
    }

    #[test]
    fn partial_ordered_deletion_schedules_fix_up() -> Result<()> {
        let mut model = InMemoryModel::default();
        let tag = model.object("Tag");
        let members = (0..4).map(|_| model.object("Class")).collect::<Vec<_>>();
        let favorites =
            model.associate("Favorites", AssociationKind::OneToManyOrdered, false, &tag, &members);

        let plan = plan_deletion(&model, &[members[1].clone(), members[3].clone()])?;

        let fix_ups = plan.fix_ups.get(&AssociationKind::OneToManyOrdered).cloned().unwrap_or_default();
        assert_eq!(
            fix_ups,
            vec![OrderedFixUp {
                association: favorites,
                association_name: "Favorites".to_string(),
                owner: tag,
                from_ordinal: 1,
                reinsert: vec![members[2].clone()],
            }]
        );
        assert!(plan.association_deletions.is_empty());
        Ok(())
    }

    #[test]
    fn deleted_suffix_still_produces_fix_up() -> Result<()> {
        let mut model = InMemoryModel::default();
        let tag = model.object("Tag");
        let members = (0..3).map(|_| model.object("Class")).collect::<Vec<_>>();
        model.associate("Favorites", AssociationKind::OneToManyOrdered, false, &tag, &members);

        let plan = plan_deletion(&model, &[members[2].clone()])?;

        let fix_ups = plan.fix_ups.get(&AssociationKind::OneToManyOrdered).cloned().unwrap_or_default();
        assert_eq!(fix_ups.len(), 1);
        assert_eq!(fix_ups[0].from_ordinal, 2);
        assert!(fix_ups[0].reinsert.is_empty());
        Ok(())
    }

    #[test]
    fn ordered_collection_emptied_deletes_association_and_dereferences_owner() -> Result<()> {
        let mut model = InMemoryModel::default();
        let tag = model.object("Tag");
        let members = (0..2).map(|_| model.object("Class")).collect::<Vec<_>>();
        let favorites =
            model.associate("Favorites", AssociationKind::OneToManyOrdered, false, &tag, &members);

        let plan = plan_deletion(&model, &members)?;

        assert!(plan.association_deletions[&AssociationKind::OneToManyOrdered].contains(&favorites));
        assert!(plan.dereferences["Tag"]["favorites_parent"].contains(&tag.id));
        assert!(plan.fix_ups.is_empty());
        Ok(())
    }

    #[test]
    fn one_to_one_dereferences_surviving_end() -> Result<()> {
        let mut model = InMemoryModel::default();
        let class = model.object("Class");
        let note = model.object("Note");
        let annotation = model.associate(
            "Annotation",
            AssociationKind::OneToOne,
            false,
            &class,
            slice::from_ref(&note),
        );

        let plan = plan_deletion(&model, &[note])?;

        assert!(plan.association_deletions[&AssociationKind::OneToOne].contains(&annotation));
        assert_eq!(
            plan.dereferences["Class"]["annotation_parent"],
            BTreeSet::from([class.id])
        );
        Ok(())
    }

    #[test]
    fn one_to_one_owner_deletion_dereferences_surviving_child() -> Result<()> {
        let mut model = InMemoryModel::default();
        let class = model.object("Class");
        let note = model.object("Note");
        let annotation = model.associate(
            "Annotation",
            AssociationKind::OneToOne,
            false,
            &class,
            slice::from_ref(&note),
        );

        let plan = plan_deletion(&model, &[class])?;

        assert_eq!(plan.object_count(), 1);
        assert!(!plan.is_in_deletion_map(&note));
        assert!(plan.association_deletions[&AssociationKind::OneToOne].contains(&annotation));
        assert_eq!(plan.dereferences["Note"]["annotation_child"], BTreeSet::from([note.id]));
        assert!(!plan.dereferences.contains_key("Class"));
        Ok(())
    }

    #[test]
    fn one_to_one_with_both_ends_deleted_needs_no_dereference() -> Result<()> {
        let mut model = InMemoryModel::default();
        let class = model.object("Class");
        let note = model.object("Note");
        model.associate("Annotation", AssociationKind::OneToOne, false, &class, slice::from_ref(&note));

        let plan = plan_deletion(&model, &[class, note])?;

        assert_eq!(plan.association_count(), 1);
        assert!(plan.dereferences.is_empty());
        Ok(())
    }

    #[test]
    fn unordered_parent_deletion_dereferences_surviving_children() -> Result<()> {
        let mut model = InMemoryModel::default();
        let tag = model.object("Tag");
        let kept = model.object("Attribute");
        let dropped = model.object("Attribute");
        model.associate(
            "Watchers",
            AssociationKind::OneToManyHighCardinality,
            false,
            &tag,
            &[kept.clone(), dropped.clone()],
        );

        let plan = plan_deletion(&model, &[tag, dropped])?;

        assert_eq!(plan.dereferences["Attribute"]["watchers_child"], BTreeSet::from([kept.id]));
        assert!(plan.removals.is_empty());
        Ok(())
    }

    #[test]
    fn surviving_unordered_parent_uses_indiscriminate_removal_once_per_kind() -> Result<()> {
        let mut model = InMemoryModel::default();
        let first = model.object("Tag");
        let second = model.object("Tag");
        let a = model.object("Attribute");
        let b = model.object("Attribute");
        let other = model.object("Note");
        model.associate("Watchers", AssociationKind::OneToMany, false, &first, slice::from_ref(&a));
        model.associate("Watchers", AssociationKind::OneToMany, false, &second, slice::from_ref(&b));

        let plan = plan_deletion(&model, &[a.clone(), b.clone(), other.clone()])?;

        assert_eq!(
            plan.removals[&AssociationKind::OneToMany],
            BTreeSet::from([a.id, b.id, other.id])
        );
        assert!(plan.association_deletions.is_empty());
        assert_eq!(plan.touched.len(), 2);
        Ok(())
    }

    #[test]
    fn many_to_many_source_deletion_fixes_up_surviving_targets() -> Result<()> {
        let mut model = InMemoryModel::default();
        let class = model.object("Class");
        let left = model.object("Tag");
        let right = model.object("Tag");
        let other = model.object("Class");
        let source = model.associate(
            "Tagging",
            AssociationKind::ManyToMany,
            false,
            &class,
            &[left.clone(), right.clone()],
        );
        model.associate("Tagging", AssociationKind::ManyToMany, false, &other, slice::from_ref(&left));

        let plan = plan_deletion(&model, slice::from_ref(&class))?;

        let deleted = &plan.association_deletions[&AssociationKind::ManyToMany];
        assert!(deleted.contains(&source));
        // `right` only pointed back at the deleted class, so its instance goes too.
        assert!(plan.dereferences["Tag"]["tagging_child"].contains(&right.id));
        assert_eq!(deleted.len(), 2);

        let fix_ups = &plan.fix_ups[&AssociationKind::ManyToMany];
        assert_eq!(fix_ups.len(), 1);
        assert_eq!(fix_ups[0].owner, left);
        assert_eq!(fix_ups[0].from_ordinal, 0);
        assert_eq!(fix_ups[0].reinsert, vec![other]);
        Ok(())
    }

    #[test]
    fn many_to_many_reverse_instance_is_classified_once() -> Result<()> {
        let mut model = InMemoryModel::default();
        let first = model.object("Class");
        let second = model.object("Class");
        let tag = model.object("Tag");
        let keep = model.object("Class");
        model.associate("Tagging", AssociationKind::ManyToManyOrdered, false, &first, slice::from_ref(&tag));
        model.associate("Tagging", AssociationKind::ManyToManyOrdered, false, &second, slice::from_ref(&tag));
        model.associate("Tagging", AssociationKind::ManyToManyOrdered, false, &keep, slice::from_ref(&tag));

        let plan = plan_deletion(&model, &[first, second])?;

        let fix_ups = &plan.fix_ups[&AssociationKind::ManyToManyOrdered];
        assert_eq!(fix_ups.len(), 1);
        assert_eq!(fix_ups[0].owner, tag);
        assert_eq!(fix_ups[0].reinsert, vec![keep]);
        Ok(())
    }

    #[test]
    fn one_to_one_without_deleted_end_is_inconsistent() {
        let mut model = InMemoryModel::default();
        let class = model.object("Class");
        let note = model.object("Note");
        let annotation =
            model.associate("Annotation", AssociationKind::OneToOne, false, &class, slice::from_ref(&note));
        let closure = DeletionClosureFixture::only_touching(&model, annotation);

        let err = closure.classify(&model);
        assert!(matches!(err, Err(DeleteError::Inconsistency(_))));
    }

    #[test]
    fn ordered_collection_without_deleted_member_is_inconsistent() {
        let mut model = InMemoryModel::default();
        let tag = model.object("Tag");
        let class = model.object("Class");
        let favorites =
            model.associate("Favorites", AssociationKind::OneToManyOrdered, false, &tag, &[class]);
        let closure = DeletionClosureFixture::only_touching(&model, favorites);

        let err = closure.classify(&model);
        assert!(matches!(err, Err(DeleteError::Inconsistency(_))));
    }

    #[test]
    fn unknown_objects_fail_planning() {
        let model = InMemoryModel::default();
        let err = plan_deletion(&model, &[ObjectRef::new("Ghost", 404)]);
        assert!(matches!(err, Err(DeleteError::UnknownObject(_))));
    }

    /// A closure that touches one association without deleting any of its ends.
    struct DeletionClosureFixture {
        closure: crate::DeletionClosure,
    }

    impl DeletionClosureFixture {
        fn only_touching(model: &InMemoryModel, association: PersistentId) -> Self {
            let mut closure = crate::DeletionClosure::default();
            if let Some(instance) = model.instance(association) {
                closure.other.insert(association, instance.clone());
            }
            Self { closure }
        }

        fn classify(&self, model: &InMemoryModel) -> Result<DeletionPlan> {
            let mut classifier = Classifier::new(model, &self.closure);
            for association in self.closure.associations() {
                classifier.classify(association)?;
            }
            Ok(classifier.finish())
        }
    }

    proptest! {
        #[test]
        fn property_fix_up_keeps_survivors_contiguous(mask in proptest::collection::vec(any::<bool>(), 1..24)) {
            let mut model = InMemoryModel::default();
            let tag = model.object("Tag");
            let members = mask.iter().map(|_| model.object("Class")).collect::<Vec<_>>();
            model.associate("Favorites", AssociationKind::OneToManyOrdered, false, &tag, &members);
            let doomed = members
                .iter()
                .zip(&mask)
                .filter(|(_, delete)| **delete)
                .map(|(member, _)| member.clone())
                .collect::<Vec<_>>();
            prop_assume!(!doomed.is_empty());

            let plan = plan_deletion(&model, &doomed);
            prop_assert!(plan.is_ok());
            let plan = plan.unwrap_or_default();
            let survivors = members
                .iter()
                .zip(&mask)
                .filter(|(_, delete)| !**delete)
                .map(|(member, _)| member.clone())
                .collect::<Vec<_>>();

            if survivors.is_empty() {
                prop_assert_eq!(plan.association_count(), 1);
                prop_assert!(plan.fix_ups.is_empty());
            } else {
                let fix_ups = plan.fix_ups.get(&AssociationKind::OneToManyOrdered).cloned().unwrap_or_default();
                prop_assert_eq!(fix_ups.len(), 1);
                let fix_up = &fix_ups[0];
                let mut result = members[..fix_up.from_ordinal].to_vec();
                for (offset, (ordinal, member)) in fix_up.reinserted_ordinals().enumerate() {
                    prop_assert_eq!(ordinal, fix_up.from_ordinal + offset);
                    result.push(member.clone());
                }
                prop_assert_eq!(result, survivors);
            }
        }
    }
}
