use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use metarepo_core::{AssociationEnd, AssociationKind, DEFAULT_MAX_BATCH_PARAMETERS};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepositoryConfig {
    #[serde(default = "default_max_batch_parameters")]
    pub max_batch_parameters: usize,
    pub metamodel: MetaModel,
}

fn default_max_batch_parameters() -> usize {
    DEFAULT_MAX_BATCH_PARAMETERS
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetaModel {
    #[serde(default)]
    pub classes: Vec<ClassDef>,
    #[serde(default)]
    pub associations: Vec<AssociationDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClassDef {
    pub name: String,
    /// Defaults to `obj_<lowercase name>`.
    #[serde(default)]
    pub table: Option<String>,
}

impl ClassDef {
    #[must_use]
    pub fn table_name(&self) -> String {
        self.table.clone().unwrap_or_else(|| format!("obj_{}", self.name.to_ascii_lowercase()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssociationDef {
    pub name: String,
    pub kind: AssociationKind,
    pub parent: String,
    pub child: String,
    /// The parent end owns the child end.
    #[serde(default)]
    pub composite: bool,
}

impl AssociationDef {
    #[must_use]
    pub fn class_at(&self, end: AssociationEnd) -> &str {
        match end {
            AssociationEnd::Parent => &self.parent,
            AssociationEnd::Child => &self.child,
        }
    }

    /// Column on the end's class table holding this association's instance ID.
    #[must_use]
    pub fn column(&self, end: AssociationEnd) -> String {
        format!("{}_{}", self.name.to_ascii_lowercase(), end.as_str())
    }
}

impl RepositoryConfig {
    /// Load a configuration from YAML (`.yaml`/`.yml`) or JSON and validate it.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read, parsed, or fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read repository config {}", path.display()))?;

        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&raw),
            _ => Self::from_yaml_str(&raw),
        }
        .with_context(|| format!("invalid repository config {}", path.display()))?;

        Ok(config)
    }

    /// # Errors
    /// Returns an error when the YAML is malformed or fails validation.
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw).context("failed to parse YAML config")?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns an error when the JSON is malformed or fails validation.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw).context("failed to parse JSON config")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject meta-models the store cannot map onto tables.
    ///
    /// # Errors
    /// Returns an error describing the first invalid definition.
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_parameters == 0 {
            return Err(anyhow!("max_batch_parameters MUST be at least 1"));
        }

        let mut tables = BTreeSet::new();
        let mut classes = BTreeSet::new();
        for class in &self.metamodel.classes {
            validate_identifier("class name", &class.name)?;
            let table = class.table_name();
            validate_identifier("class table", &table)?;
            let lowered = table.to_ascii_lowercase();
            if lowered.starts_with("assoc_")
                || lowered.starts_with("mof_")
                || lowered == "schema_migrations"
            {
                return Err(anyhow!("class table {table} uses a reserved prefix"));
            }
            if !classes.insert(class.name.clone()) {
                return Err(anyhow!("duplicate class {}", class.name));
            }
            if !tables.insert(lowered) {
                return Err(anyhow!("duplicate class table {table}"));
            }
        }

        let mut associations = BTreeSet::new();
        for association in &self.metamodel.associations {
            validate_identifier("association name", &association.name)?;
            if !associations.insert(association.name.to_ascii_lowercase()) {
                return Err(anyhow!("duplicate association {}", association.name));
            }
            for end in [AssociationEnd::Parent, AssociationEnd::Child] {
                let class = association.class_at(end);
                if !classes.contains(class) {
                    return Err(anyhow!(
                        "association {} references unknown class {class}",
                        association.name
                    ));
                }
            }
            if association.composite && association.kind.is_many_to_many() {
                return Err(anyhow!(
                    "association {} cannot be composite: {} associations have no owner",
                    association.name,
                    association.kind
                ));
            }
        }

        Ok(())
    }
}

impl MetaModel {
    #[must_use]
    pub fn class(&self, name: &str) -> Option<&ClassDef> {
        self.classes.iter().find(|class| class.name == name)
    }

    #[must_use]
    pub fn association(&self, name: &str) -> Option<&AssociationDef> {
        self.associations.iter().find(|association| association.name == name)
    }

    /// Association ends played by `class`, in definition order.
    #[must_use]
    pub fn ends_of(&self, class: &str) -> Vec<(&AssociationDef, AssociationEnd)> {
        let mut ends = Vec::new();
        for association in &self.associations {
            for end in [AssociationEnd::Parent, AssociationEnd::Child] {
                if association.class_at(end) == class {
                    ends.push((association, end));
                }
            }
        }
        ends
    }
}

fn validate_identifier(what: &str, value: &str) -> Result<()> {
    let mut chars = value.chars();
    let valid_start = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(anyhow!("{what} `{value}` MUST match [A-Za-z_][A-Za-z0-9_]*"));
    }
    Ok(())
}
