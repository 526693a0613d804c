use crate::error::{RepositoryError, Result};
use crate::model::{
    AttrValue, Attribute, AttributeType, Classification, Entity, ObjectId, PrimitiveKind, Struct,
    TypeRegistry,
};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// Full validation: required attributes must be present
    Create,
    /// Only the attributes present are checked
    Update,
}

/// Checks instances against their registered types and returns normalized copies.
///
/// Normalization turns plain guid strings and `{"guid": ..}` maps given for
/// reference attributes into object ids, untyped maps given for struct attributes
/// into structs, and numeric or boolean strings into JSON numbers and booleans.
/// Every problem found is reported together in one `ValidationFailed` error.
pub struct EntityValidator<'a> {
    registry: &'a TypeRegistry,
}

impl<'a> EntityValidator<'a> {
    pub fn new(registry: &'a TypeRegistry) -> Self {
        Self { registry }
    }

    pub fn validate_and_normalize(&self, entity: &Entity, mode: ValidationMode) -> Result<Entity> {
        let entity_type = self.registry.entity_type(&entity.type_name)?;
        let mut messages = Vec::new();

        let attributes = self.normalize_attributes(
            &entity.type_name,
            entity_type.attributes(),
            &entity.attributes,
            &entity.type_name,
            mode,
            &mut messages,
        );

        let mut classifications = Vec::with_capacity(entity.classifications.len());
        for classification in &entity.classifications {
            match self.normalize_classification(classification, &entity.type_name, &mut messages) {
                Ok(normalized) => classifications.push(normalized),
                Err(e) => messages.push(e.to_string()),
            }
        }

        if !messages.is_empty() {
            return Err(RepositoryError::ValidationFailed {
                type_name: entity.type_name.clone(),
                messages,
            });
        }

        let mut normalized = entity.clone();
        normalized.attributes = attributes;
        normalized.classifications = classifications;
        Ok(normalized)
    }

    /// Validates a classification for attachment to an entity of `entity_type`
    pub fn validate_classification(&self, classification: &Classification, entity_type: &str) -> Result<Classification> {
        let mut messages = Vec::new();
        let normalized = self.normalize_classification(classification, entity_type, &mut messages)?;
        if messages.is_empty() {
            Ok(normalized)
        } else {
            Err(RepositoryError::ValidationFailed {
                type_name: classification.type_name.clone(),
                messages,
            })
        }
    }

    fn normalize_classification(
        &self,
        classification: &Classification,
        entity_type: &str,
        messages: &mut Vec<String>,
    ) -> Result<Classification> {
        let classification_type = self.registry.classification_type(&classification.type_name)?;

        if !classification_type.entity_types.is_empty() {
            let allowed = self
                .registry
                .find_entity_type(entity_type)
                .map(|t| classification_type.entity_types.iter().any(|name| t.is_sub_type_of(name)))
                .unwrap_or(false);
            if !allowed {
                messages.push(format!(
                    "classification {} cannot be attached to entities of type {}",
                    classification.type_name, entity_type
                ));
            }
        }

        let attributes = self.normalize_attributes(
            &classification.type_name,
            classification_type.attributes(),
            &classification.attributes,
            &classification.type_name,
            ValidationMode::Create,
            messages,
        );

        Ok(Classification {
            type_name: classification.type_name.clone(),
            attributes,
            entity_guid: classification.entity_guid.clone(),
        })
    }

    fn normalize_attributes(
        &self,
        type_name: &str,
        attributes: &[Attribute],
        values: &HashMap<String, AttrValue>,
        path: &str,
        mode: ValidationMode,
        messages: &mut Vec<String>,
    ) -> HashMap<String, AttrValue> {
        let mut normalized = HashMap::with_capacity(values.len());

        for (name, value) in values {
            let Some(attribute) = attributes.iter().find(|a| &a.name == name) else {
                messages.push(format!("{}.{}: unknown attribute for type {}", path, name, type_name));
                continue;
            };
            let attr_path = format!("{}.{}", path, name);
            normalized.insert(
                name.clone(),
                self.normalize_value(&attribute.attr_type, value, &attr_path, mode, messages),
            );
        }

        if mode == ValidationMode::Create {
            for attribute in attributes.iter().filter(|a| !a.is_optional()) {
                let present = values.get(&attribute.name).map_or(false, |v| !v.is_null());
                if !present && attribute.def.default_value.is_none() {
                    messages.push(format!("{}.{}: mandatory attribute value missing", path, attribute.name));
                }
            }
        }

        normalized
    }

    fn normalize_value(
        &self,
        attr_type: &AttributeType,
        value: &AttrValue,
        path: &str,
        mode: ValidationMode,
        messages: &mut Vec<String>,
    ) -> AttrValue {
        if value.is_null() {
            return value.clone();
        }

        match attr_type {
            AttributeType::Primitive(kind) => match value {
                AttrValue::Primitive(v) if kind.is_valid_value(v) => AttrValue::Primitive(normalize_primitive(*kind, v)),
                other => {
                    messages.push(format!("{}: invalid value {:?} for type {}", path, other, kind.name()));
                    value.clone()
                }
            },
            AttributeType::Enum { name, elements } => match value.as_str() {
                Some(s) if elements.iter().any(|e| e == s) => value.clone(),
                _ => {
                    messages.push(format!("{}: invalid value {:?} for enum {}", path, value, name));
                    value.clone()
                }
            },
            AttributeType::Struct(struct_name) => {
                let candidate = match value {
                    AttrValue::Struct(s) => Some(s.clone()),
                    AttrValue::Map(m) => Some(Struct {
                        type_name: struct_name.clone(),
                        attributes: m.clone(),
                    }),
                    _ => None,
                };
                let Some(candidate) = candidate else {
                    messages.push(format!("{}: expected struct {}", path, struct_name));
                    return value.clone();
                };
                if candidate.type_name != *struct_name {
                    messages.push(format!(
                        "{}: expected struct {}, found {}",
                        path, struct_name, candidate.type_name
                    ));
                    return value.clone();
                }
                match self.registry.struct_type(struct_name) {
                    Ok(struct_type) => AttrValue::Struct(Struct {
                        type_name: candidate.type_name.clone(),
                        attributes: self.normalize_attributes(
                            struct_name,
                            struct_type.attributes(),
                            &candidate.attributes,
                            path,
                            mode,
                            messages,
                        ),
                    }),
                    Err(e) => {
                        messages.push(format!("{}: {}", path, e));
                        value.clone()
                    }
                }
            }
            AttributeType::ObjectId(target_type) => match self.to_object_id(target_type, value) {
                Some(id) => {
                    if !id.is_valid() {
                        messages.push(format!("{}: object id needs a guid or unique attributes", path));
                    }
                    match self.registry.find_entity_type(&id.type_name) {
                        Some(t) if t.is_sub_type_of(target_type) => {}
                        Some(_) => messages.push(format!(
                            "{}: {} is not a subtype of {}",
                            path, id.type_name, target_type
                        )),
                        None => messages.push(format!("{}: unknown entity type {}", path, id.type_name)),
                    }
                    AttrValue::ObjectId(id)
                }
                None => {
                    messages.push(format!("{}: expected a reference to {}", path, target_type));
                    value.clone()
                }
            },
            AttributeType::Array(element) => match value {
                AttrValue::Array(items) => AttrValue::Array(
                    items
                        .iter()
                        .enumerate()
                        .map(|(i, item)| self.normalize_value(element, item, &format!("{}[{}]", path, i), mode, messages))
                        .collect(),
                ),
                _ => {
                    messages.push(format!("{}: expected an array", path));
                    value.clone()
                }
            },
            AttributeType::Map(value_type) => match value {
                AttrValue::Map(entries) => AttrValue::Map(
                    entries
                        .iter()
                        .map(|(k, v)| {
                            let entry = self.normalize_value(value_type, v, &format!("{}[{}]", path, k), mode, messages);
                            (k.clone(), entry)
                        })
                        .collect(),
                ),
                _ => {
                    messages.push(format!("{}: expected a map", path));
                    value.clone()
                }
            },
            AttributeType::Classification(name) => {
                messages.push(format!("{}: classification {} cannot be an attribute value", path, name));
                value.clone()
            }
        }
    }

    fn to_object_id(&self, target_type: &str, value: &AttrValue) -> Option<ObjectId> {
        match value {
            AttrValue::ObjectId(id) => Some(id.clone()),
            AttrValue::Primitive(Value::String(guid)) => Some(ObjectId::new(guid.clone(), target_type)),
            AttrValue::Map(m) => {
                let guid = m.get("guid").and_then(|v| v.as_str())?;
                let type_name = m
                    .get("typeName")
                    .and_then(|v| v.as_str())
                    .unwrap_or(target_type);
                Some(ObjectId::new(guid, type_name))
            }
            _ => None,
        }
    }
}

fn normalize_primitive(kind: PrimitiveKind, value: &Value) -> Value {
    match (kind, value) {
        (PrimitiveKind::Boolean, Value::String(s)) => Value::Bool(s.eq_ignore_ascii_case("true")),
        (
            PrimitiveKind::Byte
            | PrimitiveKind::Short
            | PrimitiveKind::Int
            | PrimitiveKind::Long
            | PrimitiveKind::BigInteger
            | PrimitiveKind::Date,
            Value::String(s),
        ) => s.parse::<i64>().map(Value::from).unwrap_or_else(|_| value.clone()),
        (PrimitiveKind::Float | PrimitiveKind::Double | PrimitiveKind::BigDecimal, Value::String(s)) => s
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| value.clone()),
        (PrimitiveKind::String, Value::Number(_) | Value::Bool(_)) => Value::String(value.to_string()),
        _ => value.clone(),
    }
}
