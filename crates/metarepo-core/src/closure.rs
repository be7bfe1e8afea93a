use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::Serialize;

use crate::model::{AssociationInstance, ObjectRef, PersistentId};
use crate::session::ObjectModel;
use crate::Result;

/// Objects to delete plus every association instance touching them.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeletionClosure {
    pub deletions: BTreeMap<String, BTreeSet<PersistentId>>,
    /// Composite instances, already consumed to discover owned objects.
    pub composite: BTreeMap<PersistentId, AssociationInstance>,
    pub other: BTreeMap<PersistentId, AssociationInstance>,
}

impl DeletionClosure {
    /// Record `object` for deletion; returns `false` when it was already present.
    pub fn insert(&mut self, object: &ObjectRef) -> bool {
        self.deletions.entry(object.type_name.clone()).or_default().insert(object.id)
    }

    #[must_use]
    pub fn contains(&self, object: &ObjectRef) -> bool {
        self.deletions.get(&object.type_name).is_some_and(|ids| ids.contains(&object.id))
    }

    #[must_use]
    pub fn object_count(&self) -> usize {
        self.deletions.values().map(BTreeSet::len).sum()
    }

    /// Every deleted ID regardless of type.
    #[must_use]
    pub fn deleted_ids(&self) -> BTreeSet<PersistentId> {
        self.deletions.values().flatten().copied().collect()
    }

    pub fn associations(&self) -> impl Iterator<Item = &AssociationInstance> {
        self.composite.values().chain(self.other.values())
    }
}

/// Follow composite ownership from `requested` to the full deletion closure.
///
/// # Errors
/// Propagates object model failures, including unknown objects.
pub fn compute_closure<M>(model: &M, requested: &[ObjectRef]) -> Result<DeletionClosure>
where
    M: ObjectModel + ?Sized,
{
    let mut closure = DeletionClosure::default();
    let mut queue = requested.iter().cloned().collect::<VecDeque<_>>();

    while let Some(object) = queue.pop_front() {
        if !closure.insert(&object) {
            continue;
        }

        for association in model.associations_of(&object)? {
            if association.composite {
                if association.parent == object {
                    queue.extend(
                        association.children.iter().filter(|child| !closure.contains(child)).cloned(),
                    );
                }
                closure.composite.entry(association.id).or_insert(association);
            } else {
                closure.other.entry(association.id).or_insert(association);
            }
        }
    }

    tracing::debug!(
        objects = closure.object_count(),
        composite = closure.composite.len(),
        other = closure.other.len(),
        "computed deletion closure"
    );

    Ok(closure)
}
