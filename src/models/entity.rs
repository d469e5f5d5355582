//! Entity (twin) and relationship records as mirrored from a graph source.

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// A node of the source graph: a physical or logical thing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Globally unique id.
    pub id: String,
    /// Type (model) id, e.g. `dtmi:com:example:AirHandlingUnit;1`.
    pub type_id: String,
    /// Human-readable name.
    #[serde(default)]
    pub name: String,
    /// Measurement unit for capabilities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl Entity {
    pub fn new(id: impl Into<String>, type_id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            type_id: type_id.into(),
            unit: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Checks that both ids are present and usable as cache keys.
    pub fn validate(&self) -> Result<(), AppError> {
        validate_id("entity id", &self.id)?;
        validate_id("type id", &self.type_id)
    }
}

/// A directed, named connection between two entities.
///
/// Identity is `(source, target, relation, substance)`; the `id` is only a
/// cache key and a partitioning key for the ingestion lanes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    #[serde(default)]
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    pub relation: String,
    /// Optional qualifier such as `air` or `water`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub substance: Option<String>,
}

impl Relationship {
    pub fn new(
        source_id: impl Into<String>,
        relation: impl Into<String>,
        target_id: impl Into<String>,
    ) -> Self {
        let mut rel = Self {
            id: String::new(),
            source_id: source_id.into(),
            target_id: target_id.into(),
            relation: relation.into(),
            substance: None,
        };
        rel.id = rel.identity_key();
        rel
    }

    pub fn with_substance(mut self, substance: impl Into<String>) -> Self {
        self.substance = Some(substance.into());
        self.id = self.identity_key();
        self
    }

    /// Stable key derived from the identity tuple.
    pub fn identity_key(&self) -> String {
        match &self.substance {
            Some(substance) => format!(
                "{}|{}|{}|{}",
                self.source_id, self.relation, self.target_id, substance
            ),
            None => format!("{}|{}|{}", self.source_id, self.relation, self.target_id),
        }
    }

    /// Cache key: the source-provided id, or the identity key when absent.
    pub fn key(&self) -> String {
        if self.id.is_empty() {
            self.identity_key()
        } else {
            self.id.clone()
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        validate_id("source id", &self.source_id)?;
        validate_id("target id", &self.target_id)?;
        if self.relation.trim().is_empty() {
            return Err(AppError::Validation(format!(
                "relationship {} has no relation name",
                self.key()
            )));
        }
        Ok(())
    }
}

fn validate_id(what: &str, value: &str) -> Result<(), AppError> {
    if value.is_empty() {
        return Err(AppError::Validation(format!("{what} is empty")));
    }
    if value.chars().any(char::is_whitespace) {
        return Err(AppError::Validation(format!(
            "{what} '{value}' contains whitespace"
        )));
    }
    Ok(())
}

/// One step of an entity's location path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationSegment {
    pub id: String,
    pub name: String,
    pub type_id: String,
    /// Relation that led here from the previous segment.
    pub via: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_validation() {
        assert!(Entity::new("AHU-1", "AirHandlingUnit").validate().is_ok());
        assert!(Entity::new("", "AirHandlingUnit").validate().is_err());
        assert!(Entity::new("AHU 1", "AirHandlingUnit").validate().is_err());
        assert!(Entity::new("AHU-1", "").validate().is_err());
    }

    #[test]
    fn test_relationship_key_falls_back_to_identity() {
        let mut rel = Relationship::new("AHU1", "feeds", "VAV1").with_substance("air");
        assert_eq!(rel.key(), "AHU1|feeds|VAV1|air");

        rel.id = "rel-7".to_string();
        assert_eq!(rel.key(), "rel-7");

        rel.id.clear();
        assert_eq!(rel.key(), rel.identity_key());
    }

    #[test]
    fn test_relationship_requires_relation_name() {
        let rel = Relationship::new("A", " ", "B");
        assert!(rel.validate().is_err());
    }
}
