use crate::error::{RepositoryError, Result};
use crate::model::{
    AttrValue, AttributeDef, Cardinality, ClassificationDef, EntityDef, EnumDef, Guid, ObjectId,
    RelationshipDef, StructDef, TypeCategory, TypesDef,
};
use itertools::Itertools;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveKind {
    Boolean,
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    BigInteger,
    BigDecimal,
    String,
    Date,
}

impl PrimitiveKind {
    pub fn parse(name: &str) -> Option<Self> {
        let kind = match name {
            "boolean" => PrimitiveKind::Boolean,
            "byte" => PrimitiveKind::Byte,
            "short" => PrimitiveKind::Short,
            "int" => PrimitiveKind::Int,
            "long" => PrimitiveKind::Long,
            "float" => PrimitiveKind::Float,
            "double" => PrimitiveKind::Double,
            "biginteger" => PrimitiveKind::BigInteger,
            "bigdecimal" => PrimitiveKind::BigDecimal,
            "string" => PrimitiveKind::String,
            "date" => PrimitiveKind::Date,
            _ => return None,
        };
        Some(kind)
    }

    pub fn name(&self) -> &'static str {
        match self {
            PrimitiveKind::Boolean => "boolean",
            PrimitiveKind::Byte => "byte",
            PrimitiveKind::Short => "short",
            PrimitiveKind::Int => "int",
            PrimitiveKind::Long => "long",
            PrimitiveKind::Float => "float",
            PrimitiveKind::Double => "double",
            PrimitiveKind::BigInteger => "biginteger",
            PrimitiveKind::BigDecimal => "bigdecimal",
            PrimitiveKind::String => "string",
            PrimitiveKind::Date => "date",
        }
    }

    /// Whether `value` can be stored as this primitive. Dates are epoch millis.
    pub fn is_valid_value(&self, value: &Value) -> bool {
        match self {
            PrimitiveKind::Boolean => match value {
                Value::Bool(_) => true,
                Value::String(s) => s.eq_ignore_ascii_case("true") || s.eq_ignore_ascii_case("false"),
                _ => false,
            },
            PrimitiveKind::Byte
            | PrimitiveKind::Short
            | PrimitiveKind::Int
            | PrimitiveKind::Long
            | PrimitiveKind::BigInteger
            | PrimitiveKind::Date => match value {
                Value::Number(n) => n.is_i64() || n.is_u64(),
                Value::String(s) => s.parse::<i64>().is_ok(),
                _ => false,
            },
            PrimitiveKind::Float | PrimitiveKind::Double | PrimitiveKind::BigDecimal => match value {
                Value::Number(_) => true,
                Value::String(s) => s.parse::<f64>().is_ok(),
                _ => false,
            },
            PrimitiveKind::String => {
                matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttributeType {
    Primitive(PrimitiveKind),
    Enum { name: String, elements: Vec<String> },
    Struct(String),
    ObjectId(String),
    Array(Box<AttributeType>),
    /// Keys are always strings
    Map(Box<AttributeType>),
    Classification(String),
}

impl AttributeType {
    pub fn category(&self) -> TypeCategory {
        match self {
            AttributeType::Primitive(_) => TypeCategory::Primitive,
            AttributeType::Enum { .. } => TypeCategory::Enum,
            AttributeType::Struct(_) => TypeCategory::Struct,
            AttributeType::ObjectId(_) => TypeCategory::ObjectId,
            AttributeType::Array(_) => TypeCategory::Array,
            AttributeType::Map(_) => TypeCategory::Map,
            AttributeType::Classification(_) => TypeCategory::Classification,
        }
    }

    pub fn type_name(&self) -> String {
        match self {
            AttributeType::Primitive(kind) => kind.name().to_string(),
            AttributeType::Enum { name, .. }
            | AttributeType::Struct(name)
            | AttributeType::ObjectId(name)
            | AttributeType::Classification(name) => name.clone(),
            AttributeType::Array(element) => format!("array<{}>", element.type_name()),
            AttributeType::Map(value) => format!("map<string,{}>", value.type_name()),
        }
    }

    /// Element type of an array, value type of a map
    pub fn element_type(&self) -> Option<&AttributeType> {
        match self {
            AttributeType::Array(element) | AttributeType::Map(element) => Some(element),
            _ => None,
        }
    }

    /// True when values of this type are stored as edges rather than properties
    pub fn is_reference(&self) -> bool {
        matches!(
            self,
            AttributeType::Struct(_) | AttributeType::ObjectId(_) | AttributeType::Classification(_)
        )
    }
}

#[derive(Debug, Clone)]
pub struct Attribute {
    pub name: String,
    /// Type that declares the attribute; subtypes share its property keys
    pub defined_in: String,
    pub qualified_name: String,
    pub vertex_property: String,
    pub edge_label: String,
    pub attr_type: AttributeType,
    pub def: AttributeDef,
}

impl Attribute {
    fn new(defined_in: &str, def: &AttributeDef, attr_type: AttributeType) -> Self {
        let qualified_name = format!("{}.{}", defined_in, def.name);
        Self {
            name: def.name.clone(),
            defined_in: defined_in.to_string(),
            vertex_property: qualified_name.clone(),
            edge_label: format!("__{}", qualified_name),
            qualified_name,
            attr_type,
            def: def.clone(),
        }
    }

    pub fn category(&self) -> TypeCategory {
        self.attr_type.category()
    }

    pub fn is_owned_ref(&self) -> bool {
        self.def.is_owned_ref
    }

    pub fn is_soft_ref(&self) -> bool {
        self.def.is_soft_ref
    }

    pub fn is_unique(&self) -> bool {
        self.def.is_unique
    }

    pub fn is_indexable(&self) -> bool {
        self.def.is_indexable
    }

    pub fn is_optional(&self) -> bool {
        self.def.is_optional
    }

    pub fn inverse_ref(&self) -> Option<&str> {
        self.def.inverse_ref.as_deref()
    }

    pub fn cardinality(&self) -> Cardinality {
        self.def.cardinality
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeDirection {
    Out,
    In,
    Both,
}

#[derive(Debug, Clone)]
pub struct RelationshipAttribute {
    pub name: String,
    pub relationship_type: String,
    pub cardinality: Cardinality,
    pub edge_label: String,
    pub direction: EdgeDirection,
    pub target_type: String,
}

/// Resolved struct or classification type
#[derive(Debug, Clone)]
pub struct StructType {
    pub name: String,
    pub is_classification: bool,
    pub all_super_types: Vec<String>,
    pub entity_types: Vec<String>,
    attributes: Vec<Attribute>,
}

impl StructType {
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }
}

#[derive(Debug, Clone)]
pub struct EntityType {
    pub name: String,
    pub all_super_types: Vec<String>,
    attributes: Vec<Attribute>,
    relationship_attributes: Vec<RelationshipAttribute>,
}

impl EntityType {
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn unique_attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.iter().filter(|a| a.is_unique())
    }

    pub fn relationship_attribute(&self, name: &str) -> Option<&RelationshipAttribute> {
        self.relationship_attributes.iter().find(|a| a.name == name)
    }

    pub fn relationship_attributes(&self) -> &[RelationshipAttribute] {
        &self.relationship_attributes
    }

    pub fn is_sub_type_of(&self, type_name: &str) -> bool {
        self.name == type_name || self.all_super_types.iter().any(|s| s == type_name)
    }

    /// Attribute whose reference edges carry `label`. Map entries append `.key`.
    pub fn attribute_for_edge_label(&self, label: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| {
            a.edge_label == label
                || (a.category() == TypeCategory::Map
                    && label
                        .strip_prefix(a.edge_label.as_str())
                        .map_or(false, |rest| rest.starts_with('.')))
        })
    }
}

/// Registry of resolved types, looked up by name
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    enums: HashMap<String, EnumDef>,
    structs: HashMap<String, StructType>,
    classifications: HashMap<String, StructType>,
    entities: HashMap<String, EntityType>,
    relationships: HashMap<String, RelationshipDef>,
}

impl TypeRegistry {
    pub fn new(types: TypesDef) -> Result<Self> {
        let mut registry = TypeRegistry::default();

        for def in types.enum_defs {
            registry.enums.insert(def.name.clone(), def);
        }

        let struct_names: HashSet<String> = types.struct_defs.iter().map(|d| d.name.clone()).collect();
        let classification_names: HashSet<String> = types
            .classification_defs
            .iter()
            .map(|d| d.name.clone())
            .collect();
        let entity_names: HashSet<String> = types.entity_defs.iter().map(|d| d.name.clone()).collect();
        let known = KnownNames {
            enums: &registry.enums,
            structs: &struct_names,
            classifications: &classification_names,
            entities: &entity_names,
        };

        let mut structs = HashMap::new();
        for def in &types.struct_defs {
            structs.insert(def.name.clone(), resolve_struct(def, &known)?);
        }

        let classification_defs: HashMap<&str, &ClassificationDef> = types
            .classification_defs
            .iter()
            .map(|d| (d.name.as_str(), d))
            .collect();
        let mut classifications = HashMap::new();
        for def in &types.classification_defs {
            resolve_classification(def, &classification_defs, &known, &mut classifications, &mut Vec::new())?;
        }

        let entity_defs: HashMap<&str, &EntityDef> =
            types.entity_defs.iter().map(|d| (d.name.as_str(), d)).collect();
        let mut entities = HashMap::new();
        for def in &types.entity_defs {
            resolve_entity(def, &entity_defs, &known, &mut entities, &mut Vec::new())?;
        }

        for def in &types.relationship_defs {
            for end in [&def.end1, &def.end2] {
                if !entities.contains_key(&end.type_name) {
                    return Err(RepositoryError::UnknownType(end.type_name.clone()));
                }
            }
            for entity_type in entities.values_mut() {
                add_relationship_attributes(entity_type, def);
            }
        }

        registry.structs = structs;
        registry.classifications = classifications;
        registry.entities = entities;
        registry.relationships = types
            .relationship_defs
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();

        Ok(registry)
    }

    pub fn find_entity_type(&self, name: &str) -> Option<&EntityType> {
        self.entities.get(name)
    }

    pub fn entity_type(&self, name: &str) -> Result<&EntityType> {
        self.entities
            .get(name)
            .ok_or_else(|| RepositoryError::UnknownType(name.to_string()))
    }

    pub fn struct_type(&self, name: &str) -> Result<&StructType> {
        self.structs
            .get(name)
            .ok_or_else(|| RepositoryError::UnknownType(name.to_string()))
    }

    pub fn classification_type(&self, name: &str) -> Result<&StructType> {
        self.classifications
            .get(name)
            .ok_or_else(|| RepositoryError::UnknownType(name.to_string()))
    }

    pub fn relationship_def(&self, name: &str) -> Result<&RelationshipDef> {
        self.relationships
            .get(name)
            .ok_or_else(|| RepositoryError::UnknownType(name.to_string()))
    }

    pub fn relationship_defs(&self) -> impl Iterator<Item = &RelationshipDef> {
        self.relationships.values()
    }

    pub fn enum_def(&self, name: &str) -> Option<&EnumDef> {
        self.enums.get(name)
    }

    pub fn entity_type_names(&self) -> impl Iterator<Item = &String> {
        self.entities.keys()
    }

    /// Compares a stored value with an incoming one for no-op detection.
    /// Temporary guids in `incoming` are mapped through `guid_assignments`.
    pub fn are_equal_values(
        &self,
        attribute: &Attribute,
        current: Option<&AttrValue>,
        incoming: Option<&AttrValue>,
        guid_assignments: &HashMap<Guid, Guid>,
    ) -> bool {
        self.values_equal(
            &attribute.attr_type,
            attribute.cardinality(),
            current,
            incoming,
            guid_assignments,
        )
    }

    fn values_equal(
        &self,
        attr_type: &AttributeType,
        cardinality: Cardinality,
        current: Option<&AttrValue>,
        incoming: Option<&AttrValue>,
        guid_assignments: &HashMap<Guid, Guid>,
    ) -> bool {
        let current = current.filter(|v| !is_absent(v));
        let incoming = incoming.filter(|v| !is_absent(v));
        let (current, incoming) = match (current, incoming) {
            (None, None) => return true,
            (Some(c), Some(i)) => (c, i),
            _ => return false,
        };

        match attr_type {
            AttributeType::Primitive(_) | AttributeType::Enum { .. } => match (current, incoming) {
                (AttrValue::Primitive(c), AttrValue::Primitive(i)) => primitives_equal(c, i),
                _ => current == incoming,
            },
            AttributeType::Struct(type_name) => match (current.as_struct(), incoming.as_struct()) {
                (Some(c), Some(i)) => match self.structs.get(type_name) {
                    Some(struct_type) => struct_type.attributes().iter().all(|attr| {
                        self.values_equal(
                            &attr.attr_type,
                            attr.cardinality(),
                            c.attributes.get(&attr.name),
                            i.attributes.get(&attr.name),
                            guid_assignments,
                        )
                    }),
                    None => c == i,
                },
                _ => false,
            },
            AttributeType::ObjectId(_) => match (current.as_object_id(), incoming.as_object_id()) {
                (Some(c), Some(i)) => object_ids_equal(c, i, guid_assignments),
                _ => false,
            },
            AttributeType::Array(element) => match (current.as_array(), incoming.as_array()) {
                (Some(c), Some(i)) => {
                    if c.len() != i.len() {
                        return false;
                    }
                    if cardinality == Cardinality::Set {
                        i.iter().all(|iv| {
                            c.iter().any(|cv| {
                                self.values_equal(element, Cardinality::Single, Some(cv), Some(iv), guid_assignments)
                            })
                        })
                    } else {
                        c.iter().zip(i.iter()).all(|(cv, iv)| {
                            self.values_equal(element, Cardinality::Single, Some(cv), Some(iv), guid_assignments)
                        })
                    }
                }
                _ => false,
            },
            AttributeType::Map(value_type) => match (current.as_map(), incoming.as_map()) {
                (Some(c), Some(i)) => {
                    c.len() == i.len()
                        && i.iter().all(|(key, iv)| {
                            self.values_equal(value_type, Cardinality::Single, c.get(key), Some(iv), guid_assignments)
                        })
                }
                _ => false,
            },
            AttributeType::Classification(_) => current == incoming,
        }
    }
}

/// Null and empty collections are stored as "no value"
fn is_absent(value: &AttrValue) -> bool {
    match value {
        AttrValue::Primitive(Value::Null) => true,
        AttrValue::Array(values) => values.is_empty(),
        AttrValue::Map(values) => values.is_empty(),
        _ => false,
    }
}

fn primitives_equal(current: &Value, incoming: &Value) -> bool {
    if current == incoming {
        return true;
    }
    match (current.as_f64(), incoming.as_f64()) {
        (Some(c), Some(i)) => c == i,
        _ => false,
    }
}

fn object_ids_equal(current: &ObjectId, incoming: &ObjectId, guid_assignments: &HashMap<Guid, Guid>) -> bool {
    match (current.guid(), incoming.guid()) {
        (Some(c), Some(i)) => {
            let c = guid_assignments.get(c).map(String::as_str).unwrap_or(c);
            let i = guid_assignments.get(i).map(String::as_str).unwrap_or(i);
            c == i
        }
        (_, None) => {
            current.type_name == incoming.type_name
                && !incoming.unique_attributes.is_empty()
                && incoming
                    .unique_attributes
                    .iter()
                    .all(|(k, v)| current.unique_attributes.get(k).map(|cv| primitives_equal(cv, v)).unwrap_or(false))
        }
        (None, Some(_)) => false,
    }
}

struct KnownNames<'a> {
    enums: &'a HashMap<String, EnumDef>,
    structs: &'a HashSet<String>,
    classifications: &'a HashSet<String>,
    entities: &'a HashSet<String>,
}

/// Resolves names such as `string`, `Column`, `array<Column>` and `map<string,int>`
fn resolve_type_name(type_name: &str, known: &KnownNames<'_>) -> Result<AttributeType> {
    let type_name = type_name.trim();

    if let Some(inner) = type_name.strip_prefix("array<").and_then(|s| s.strip_suffix('>')) {
        return Ok(AttributeType::Array(Box::new(resolve_type_name(inner, known)?)));
    }

    if let Some(inner) = type_name.strip_prefix("map<").and_then(|s| s.strip_suffix('>')) {
        let (key, value) = split_map_type(inner)
            .ok_or_else(|| RepositoryError::UnknownType(type_name.to_string()))?;
        match resolve_type_name(key, known)? {
            AttributeType::Primitive(_) | AttributeType::Enum { .. } => {}
            other => {
                return Err(RepositoryError::TypeMismatch {
                    expected: "primitive map key".to_string(),
                    found: other.type_name(),
                })
            }
        }
        return Ok(AttributeType::Map(Box::new(resolve_type_name(value, known)?)));
    }

    if let Some(kind) = PrimitiveKind::parse(type_name) {
        return Ok(AttributeType::Primitive(kind));
    }
    if let Some(def) = known.enums.get(type_name) {
        return Ok(AttributeType::Enum {
            name: def.name.clone(),
            elements: def.elements.clone(),
        });
    }
    if known.structs.contains(type_name) {
        return Ok(AttributeType::Struct(type_name.to_string()));
    }
    if known.classifications.contains(type_name) {
        return Ok(AttributeType::Classification(type_name.to_string()));
    }
    if known.entities.contains(type_name) {
        return Ok(AttributeType::ObjectId(type_name.to_string()));
    }

    Err(RepositoryError::UnknownType(type_name.to_string()))
}

fn split_map_type(inner: &str) -> Option<(&str, &str)> {
    let mut depth = 0;
    for (i, c) in inner.char_indices() {
        match c {
            '<' => depth += 1,
            '>' => depth -= 1,
            ',' if depth == 0 => return Some((&inner[..i], &inner[i + 1..])),
            _ => {}
        }
    }
    None
}

fn resolve_attributes(defined_in: &str, defs: &[AttributeDef], known: &KnownNames<'_>) -> Result<Vec<Attribute>> {
    defs.iter()
        .map(|def| Ok(Attribute::new(defined_in, def, resolve_type_name(&def.type_name, known)?)))
        .collect()
}

fn merge_attributes(target: &mut Vec<Attribute>, inherited: &[Attribute]) {
    for attr in inherited {
        if !target.iter().any(|a| a.name == attr.name) {
            target.push(attr.clone());
        }
    }
}

fn resolve_struct(def: &StructDef, known: &KnownNames<'_>) -> Result<StructType> {
    Ok(StructType {
        name: def.name.clone(),
        is_classification: false,
        all_super_types: Vec::new(),
        entity_types: Vec::new(),
        attributes: resolve_attributes(&def.name, &def.attribute_defs, known)?,
    })
}

fn resolve_classification(
    def: &ClassificationDef,
    defs: &HashMap<&str, &ClassificationDef>,
    known: &KnownNames<'_>,
    resolved: &mut HashMap<String, StructType>,
    visiting: &mut Vec<String>,
) -> Result<()> {
    if resolved.contains_key(&def.name) {
        return Ok(());
    }
    if visiting.contains(&def.name) {
        return Err(RepositoryError::InvalidParameters(format!(
            "cyclic super types for classification {}",
            def.name
        )));
    }
    visiting.push(def.name.clone());

    let mut attributes = Vec::new();
    let mut all_super_types = Vec::new();
    for super_name in &def.super_types {
        let super_def = defs
            .get(super_name.as_str())
            .ok_or_else(|| RepositoryError::UnknownType(super_name.clone()))?;
        resolve_classification(super_def, defs, known, resolved, visiting)?;
        if let Some(super_type) = resolved.get(super_name) {
            merge_attributes(&mut attributes, &super_type.attributes);
            all_super_types.push(super_name.clone());
            all_super_types.extend(super_type.all_super_types.iter().cloned());
        }
    }
    let own = resolve_attributes(&def.name, &def.attribute_defs, known)?;
    merge_attributes(&mut attributes, &own);
    let all_super_types: Vec<String> = all_super_types.into_iter().unique().collect();

    visiting.pop();
    resolved.insert(
        def.name.clone(),
        StructType {
            name: def.name.clone(),
            is_classification: true,
            all_super_types,
            entity_types: def.entity_types.clone(),
            attributes,
        },
    );
    Ok(())
}

fn resolve_entity(
    def: &EntityDef,
    defs: &HashMap<&str, &EntityDef>,
    known: &KnownNames<'_>,
    resolved: &mut HashMap<String, EntityType>,
    visiting: &mut Vec<String>,
) -> Result<()> {
    if resolved.contains_key(&def.name) {
        return Ok(());
    }
    if visiting.contains(&def.name) {
        return Err(RepositoryError::InvalidParameters(format!(
            "cyclic super types for entity type {}",
            def.name
        )));
    }
    visiting.push(def.name.clone());

    let mut attributes = Vec::new();
    let mut all_super_types: Vec<String> = Vec::new();
    for super_name in &def.super_types {
        let super_def = defs
            .get(super_name.as_str())
            .ok_or_else(|| RepositoryError::UnknownType(super_name.clone()))?;
        resolve_entity(super_def, defs, known, resolved, visiting)?;
        if let Some(super_type) = resolved.get(super_name) {
            merge_attributes(&mut attributes, &super_type.attributes);
            for name in std::iter::once(super_name).chain(super_type.all_super_types.iter()) {
                if !all_super_types.contains(name) {
                    all_super_types.push(name.clone());
                }
            }
        }
    }
    let own = resolve_attributes(&def.name, &def.attribute_defs, known)?;
    merge_attributes(&mut attributes, &own);

    visiting.pop();
    resolved.insert(
        def.name.clone(),
        EntityType {
            name: def.name.clone(),
            all_super_types,
            attributes,
            relationship_attributes: Vec::new(),
        },
    );
    Ok(())
}

fn add_relationship_attributes(entity_type: &mut EntityType, def: &RelationshipDef) {
    let label = def.edge_label();
    let symmetric = def.end1.type_name == def.end2.type_name && def.end1.name == def.end2.name;

    for (end, other, direction) in [
        (&def.end1, &def.end2, EdgeDirection::Out),
        (&def.end2, &def.end1, EdgeDirection::In),
    ] {
        if !entity_type.is_sub_type_of(&end.type_name)
            || entity_type.relationship_attribute(&end.name).is_some()
        {
            continue;
        }
        entity_type.relationship_attributes.push(RelationshipAttribute {
            name: end.name.clone(),
            relationship_type: def.name.clone(),
            cardinality: end.cardinality,
            edge_label: label.clone(),
            direction: if symmetric { EdgeDirection::Both } else { direction },
            target_type: other.type_name.clone(),
        });
    }
}
