//! Entity type registry
//!
//! Entity payloads are a tagged union: the entity type names a `TypeSchema`
//! whose fields are checked whenever content enters the store, either from a
//! local commit or from an imported bundle.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::codec::{parse_exact_timestamp, Value};
use crate::error::{Error, Result};
use crate::ids::Uid;
use crate::model::{as_external_ref, EntityInput, RelationValue};

/// Kind of a declared field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Integer,
    Float,
    Boolean,
    Timestamp,
    Bytes,
    Link,
    Any,
    RelationOne,
    RelationMany,
}

impl FieldKind {
    pub fn is_relation(self) -> bool {
        matches!(self, FieldKind::RelationOne | FieldKind::RelationMany)
    }

    fn accepts(self, value: &Value) -> bool {
        match (self, value) {
            (FieldKind::Any, _) => true,
            (FieldKind::Text, Value::Text(_) | Value::Timestamp(_)) => true,
            (FieldKind::Integer, Value::Integer(_)) => true,
            (FieldKind::Float, Value::Float(_) | Value::Integer(_)) => true,
            (FieldKind::Boolean, Value::Bool(_)) => true,
            (FieldKind::Timestamp, Value::Timestamp(_)) => true,
            (FieldKind::Timestamp, Value::Text(s)) => parse_exact_timestamp(s).is_some(),
            (FieldKind::Bytes, Value::Bytes(_)) => true,
            (FieldKind::Link, Value::Link(_)) => true,
            (FieldKind::RelationOne, v) => is_relation_target(v),
            (FieldKind::RelationMany, Value::List(items)) => items.iter().all(is_relation_target),
            _ => false,
        }
    }
}

/// A stored relation is a uid or an external reference placeholder
fn is_relation_target(value: &Value) -> bool {
    match value {
        Value::Text(s) => Uid::parse(s).is_ok(),
        other => as_external_ref(other).is_some(),
    }
}

/// A declared field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
}

/// Fields of one entity type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeSchema {
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSpec>,
    /// Accept fields not listed in `fields`
    #[serde(default)]
    pub open: bool,
}

impl TypeSchema {
    pub fn field(mut self, name: &str, kind: FieldKind, required: bool) -> Self {
        self.fields.insert(name.to_string(), FieldSpec { kind, required });
        self
    }
}

/// The set of entity types a node accepts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(default)]
    pub types: BTreeMap<String, TypeSchema>,
    /// Accept types that are not registered
    #[serde(default)]
    pub permissive: bool,
}

impl Schema {
    /// A schema that accepts any type with any content
    pub fn permissive() -> Self {
        Self {
            types: BTreeMap::new(),
            permissive: true,
        }
    }

    pub fn with_type(mut self, name: &str, schema: TypeSchema) -> Self {
        self.types.insert(name.to_string(), schema);
        self
    }

    fn lookup(&self, entity_type: &str) -> Result<Option<&TypeSchema>> {
        if entity_type.is_empty() {
            return Err(Error::Schema("entity type must not be empty".to_string()));
        }
        match self.types.get(entity_type) {
            Some(t) => Ok(Some(t)),
            None if self.permissive => Ok(None),
            None => Err(Error::Schema(format!("unknown entity type {:?}", entity_type))),
        }
    }

    /// Check an input before relations are resolved
    pub fn validate_input(&self, input: &EntityInput) -> Result<()> {
        let Some(ty) = self.lookup(&input.entity_type)? else {
            return Ok(());
        };
        if input.deleted {
            return Ok(());
        }
        for (name, relation) in &input.relations {
            if input.content.contains_key(name) {
                return Err(Error::Schema(format!(
                    "{}.{} is given both as content and as a relation",
                    input.entity_type, name
                )));
            }
            match (ty.fields.get(name).map(|f| f.kind), relation) {
                (Some(FieldKind::RelationOne), RelationValue::One(_))
                | (Some(FieldKind::RelationMany), RelationValue::Many(_))
                | (Some(FieldKind::Any), _) => {}
                (None, _) if ty.open => {}
                (kind, _) => {
                    return Err(Error::Schema(format!(
                        "{}.{} is not a relation of that arity (declared {:?})",
                        input.entity_type, name, kind
                    )));
                }
            }
        }
        for (name, spec) in &ty.fields {
            if spec.required && !input.content.contains_key(name) && !input.relations.contains_key(name) {
                return Err(Error::Schema(format!("{}.{} is required", input.entity_type, name)));
            }
        }
        for (name, value) in &input.content {
            self.check_field(&input.entity_type, ty, name, value)?;
        }
        Ok(())
    }

    /// Check stored content, where relations have become uids or placeholders
    pub fn validate_content(
        &self,
        entity_type: &str,
        content: &BTreeMap<String, Value>,
        is_deleted: bool,
    ) -> Result<()> {
        let Some(ty) = self.lookup(entity_type)? else {
            return Ok(());
        };
        if is_deleted {
            return Ok(());
        }
        for (name, spec) in &ty.fields {
            if spec.required && !content.contains_key(name) {
                return Err(Error::Schema(format!("{}.{} is required", entity_type, name)));
            }
        }
        for (name, value) in content {
            self.check_field(entity_type, ty, name, value)?;
        }
        Ok(())
    }

    /// Relation fields found in content must already be in stored form
    fn check_field(&self, entity_type: &str, ty: &TypeSchema, name: &str, value: &Value) -> Result<()> {
        match ty.fields.get(name) {
            None if ty.open => Ok(()),
            None => Err(Error::Schema(format!("{}.{} is not declared", entity_type, name))),
            Some(_) if matches!(value, Value::Null) => Ok(()),
            Some(spec) if spec.kind.accepts(value) => Ok(()),
            Some(spec) => Err(Error::Schema(format!(
                "{}.{} expects {:?}, got {}",
                entity_type,
                name,
                spec.kind,
                value.kind()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{IdGenerator, ManualClock};
    use crate::model::external_ref;
    use std::sync::Arc;

    fn schema() -> Schema {
        Schema::default().with_type(
            "Post",
            TypeSchema::default()
                .field("title", FieldKind::Text, true)
                .field("views", FieldKind::Integer, false)
                .field("author", FieldKind::RelationOne, false),
        )
    }

    #[test]
    fn test_valid_input() {
        let input = EntityInput::new("Post")
            .with_field("title", "Hello")
            .with_field("views", 3i64)
            .with_relation("author", "https://example.org/u/1");
        schema().validate_input(&input).unwrap();
    }

    #[test]
    fn test_rejects_bad_inputs() {
        let s = schema();
        assert!(s.validate_input(&EntityInput::new("Unknown")).is_err());
        assert!(s.validate_input(&EntityInput::new("Post")).is_err());
        let wrong_kind = EntityInput::new("Post").with_field("title", 1i64);
        assert!(matches!(s.validate_input(&wrong_kind), Err(Error::Schema(_))));
        let undeclared = EntityInput::new("Post").with_field("title", "t").with_field("body", "b");
        assert!(s.validate_input(&undeclared).is_err());
        let many = EntityInput::new("Post")
            .with_field("title", "t")
            .with_relations("author", vec!["a".to_string()]);
        assert!(s.validate_input(&many).is_err());
        let raw_uri = EntityInput::new("Post")
            .with_field("title", "t")
            .with_field("author", "https://example.org/u/1");
        assert!(s.validate_input(&raw_uri).is_err());
        let placeholder = EntityInput::new("Post")
            .with_field("title", "t")
            .with_field("author", external_ref("https://example.org/u/1"));
        s.validate_input(&placeholder).unwrap();
    }

    #[test]
    fn test_stored_relations() {
        let ids = IdGenerator::new(Arc::new(ManualClock::new(1)));
        let s = schema();
        let mut content = BTreeMap::new();
        content.insert("title".to_string(), Value::from("t"));
        content.insert("author".to_string(), Value::from(ids.create()));
        s.validate_content("Post", &content, false).unwrap();
        content.insert("author".to_string(), external_ref("https://example.org/u/9"));
        s.validate_content("Post", &content, false).unwrap();
        content.insert("author".to_string(), Value::from("not a uid"));
        assert!(s.validate_content("Post", &content, false).is_err());
        assert!(s.validate_content("Post", &BTreeMap::new(), true).is_ok());
    }

    #[test]
    fn test_permissive_accepts_anything() {
        let input = EntityInput::new("Whatever").with_field("x", Value::Null);
        Schema::permissive().validate_input(&input).unwrap();
        assert!(Schema::permissive().validate_input(&EntityInput::new("")).is_err());
    }
}
