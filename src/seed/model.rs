use crate::error::Result;
use crate::model::{
    AttributeDef, Cardinality, ClassificationDef, EntityDef, EnumDef, RelationshipCategory, RelationshipDef,
    RelationshipEndDef, StructDef, TypeRegistry, TypesDef,
};

/// Demo catalog model: databases owning tables, tables owning columns, a
/// storage descriptor struct and two classifications
pub fn catalog_types() -> TypesDef {
    TypesDef {
        enum_defs: vec![EnumDef {
            name: "TableType".to_string(),
            elements: vec!["MANAGED".to_string(), "EXTERNAL".to_string(), "VIEW".to_string()],
            default_value: Some("MANAGED".to_string()),
        }],
        struct_defs: vec![StructDef {
            name: "StorageDesc".to_string(),
            attribute_defs: vec![
                AttributeDef::new("location", "string"),
                AttributeDef::new("inputFormat", "string"),
                AttributeDef::new("compressed", "boolean"),
            ],
        }],
        classification_defs: vec![
            ClassificationDef {
                name: "PII".to_string(),
                super_types: vec![],
                attribute_defs: vec![AttributeDef::new("level", "int")],
                entity_types: vec![],
            },
            ClassificationDef {
                name: "Retained".to_string(),
                super_types: vec![],
                attribute_defs: vec![AttributeDef::new("days", "int").required()],
                entity_types: vec!["Table".to_string()],
            },
        ],
        entity_defs: vec![
            EntityDef {
                name: "Asset".to_string(),
                super_types: vec![],
                attribute_defs: vec![
                    AttributeDef::new("qualifiedName", "string").required().unique().indexable(),
                    AttributeDef::new("name", "string").indexable(),
                    AttributeDef::new("description", "string"),
                    AttributeDef::new("owner", "string"),
                ],
            },
            EntityDef {
                name: "Db".to_string(),
                super_types: vec!["Asset".to_string()],
                attribute_defs: vec![
                    AttributeDef::new("tables", "array<Table>").inverse_of("db"),
                    AttributeDef::new("parameters", "map<string,string>"),
                ],
            },
            EntityDef {
                name: "Table".to_string(),
                super_types: vec!["Asset".to_string()],
                attribute_defs: vec![
                    AttributeDef::new("db", "Db").inverse_of("tables"),
                    AttributeDef::new("columns", "array<Column>").owned().inverse_of("table"),
                    AttributeDef::new("sd", "StorageDesc"),
                    AttributeDef::new("tableType", "TableType"),
                    AttributeDef::new("retention", "int"),
                    AttributeDef::new("aliases", "array<string>").cardinality(Cardinality::Set),
                    AttributeDef::new("replicaOf", "Table").soft(),
                ],
            },
            EntityDef {
                name: "Column".to_string(),
                super_types: vec!["Asset".to_string()],
                attribute_defs: vec![
                    AttributeDef::new("table", "Table").inverse_of("columns"),
                    AttributeDef::new("dataType", "string"),
                    AttributeDef::new("position", "int"),
                ],
            },
        ],
        relationship_defs: vec![RelationshipDef {
            name: "table_lineage".to_string(),
            category: RelationshipCategory::Association,
            end1: RelationshipEndDef::new("Table", "outputs", Cardinality::Set),
            end2: RelationshipEndDef::new("Table", "inputs", Cardinality::Set),
            attribute_defs: vec![AttributeDef::new("query", "string")],
        }],
    }
}

pub fn catalog_registry() -> Result<TypeRegistry> {
    TypeRegistry::new(catalog_types())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_model_resolves() {
        let registry = catalog_registry().unwrap();
        let table = registry.entity_type("Table").unwrap();
        assert!(table.is_sub_type_of("Asset"));
        assert_eq!(table.attribute("columns").and_then(|a| a.inverse_ref()), Some("table"));
        assert!(table.attribute("columns").unwrap().is_owned_ref());
        assert!(table.attribute("qualifiedName").unwrap().is_unique());
        assert_eq!(registry.relationship_def("table_lineage").unwrap().edge_label(), "r:table_lineage");
    }
}
