use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Repository-wide identifier shared by objects and association instances.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct PersistentId(pub i64);

impl PersistentId {
    #[must_use]
    pub fn get(self) -> i64 {
        self.0
    }
}

impl Display for PersistentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for PersistentId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// A typed handle on one stored object.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ObjectRef {
    pub type_name: String,
    pub id: PersistentId,
}

impl ObjectRef {
    #[must_use]
    pub fn new(type_name: impl Into<String>, id: impl Into<PersistentId>) -> Self {
        Self { type_name: type_name.into(), id: id.into() }
    }
}

impl Display for ObjectRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.type_name, self.id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AssociationKind {
    OneToOne,
    OneToMany,
    OneToManyHighCardinality,
    OneToManyOrdered,
    ManyToMany,
    ManyToManyOrdered,
}

impl AssociationKind {
    pub const ALL: [Self; 6] = [
        Self::OneToOne,
        Self::OneToMany,
        Self::OneToManyHighCardinality,
        Self::OneToManyOrdered,
        Self::ManyToMany,
        Self::ManyToManyOrdered,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OneToOne => "one_to_one",
            Self::OneToMany => "one_to_many",
            Self::OneToManyHighCardinality => "one_to_many_high_cardinality",
            Self::OneToManyOrdered => "one_to_many_ordered",
            Self::ManyToMany => "many_to_many",
            Self::ManyToManyOrdered => "many_to_many_ordered",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "one_to_one" => Some(Self::OneToOne),
            "one_to_many" => Some(Self::OneToMany),
            "one_to_many_high_cardinality" => Some(Self::OneToManyHighCardinality),
            "one_to_many_ordered" => Some(Self::OneToManyOrdered),
            "many_to_many" => Some(Self::ManyToMany),
            "many_to_many_ordered" => Some(Self::ManyToManyOrdered),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_many_to_many(self) -> bool {
        matches!(self, Self::ManyToMany | Self::ManyToManyOrdered)
    }

    #[must_use]
    pub fn is_ordered(self) -> bool {
        matches!(self, Self::OneToManyOrdered | Self::ManyToManyOrdered)
    }
}

impl Display for AssociationKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which meta-model end of an association an object plays.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AssociationEnd {
    Parent,
    Child,
}

impl AssociationEnd {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Parent => "parent",
            Self::Child => "child",
        }
    }

    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::Parent => Self::Child,
            Self::Child => Self::Parent,
        }
    }
}

/// One stored association instance as seen by the planner.
///
/// `parent` is the owning end for one-to-one and one-to-many kinds and the
/// source object for many-to-many kinds. `children` are listed in ordinal
/// order; a one-to-one instance has exactly one child.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AssociationInstance {
    pub id: PersistentId,
    pub kind: AssociationKind,
    pub association: String,
    pub composite: bool,
    /// Set on the many-to-many instance owned by an object on the child end.
    pub reversed: bool,
    pub parent: ObjectRef,
    pub children: Vec<ObjectRef>,
}

impl AssociationInstance {
    /// Meta-model end played by `parent` in this instance.
    #[must_use]
    pub fn source_end(&self) -> AssociationEnd {
        if self.reversed {
            AssociationEnd::Child
        } else {
            AssociationEnd::Parent
        }
    }

    #[must_use]
    pub fn target_end(&self) -> AssociationEnd {
        self.source_end().opposite()
    }
}

/// Backing table of one object type.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ObjectTable {
    pub table: String,
    pub id_column: String,
}

/// Secondary table holding one row per member of a multi-valued association.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CollectionTable {
    pub table: String,
    pub owner_column: String,
    pub member_type_column: String,
    pub member_column: String,
    pub ordinal_column: Option<String>,
}

/// Storage of every association instance of one kind.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AssociationTable {
    pub table: String,
    pub id_column: String,
    /// `None` when members live in the association table itself.
    pub collection: Option<CollectionTable>,
}
