//! Error types for the entity repository

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Coarse classification of a [`RepositoryError`], used for logging and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidParameters,
    TypeMismatch,
    Internal,
    Transient,
}

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Entity not found: guid={0}")]
    EntityNotFound(String),

    #[error("No entity of type {type_name} found with unique attributes {attributes}")]
    EntityByUniqueAttributesNotFound {
        type_name: String,
        attributes: String,
    },

    #[error("Referenced entity not found: {0}")]
    ReferencedEntityNotFound(String),

    #[error("Classification {classification} is not associated with entity guid={guid}")]
    ClassificationNotFound { guid: String, classification: String },

    #[error("Relationship not found: guid={0}")]
    RelationshipNotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Instance of {type_name} failed validation: {}", messages.join("; "))]
    ValidationFailed {
        type_name: String,
        messages: Vec<String>,
    },

    #[error("Invalid object id: {0}")]
    InvalidObjectId(String),

    #[error("Classification {classification} is already associated with entity guid={guid}")]
    ClassificationAlreadyAssociated { guid: String, classification: String },

    #[error("Unknown attribute {attribute} for type {type_name}")]
    UnknownAttribute { type_name: String, attribute: String },

    #[error("Unknown type: {0}")]
    UnknownType(String),

    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("Attribute {attribute} has unsupported type category {category} for this operation")]
    UnsupportedAttributeType { attribute: String, category: String },

    #[error("Transient graph failure: {0}")]
    Transient(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RepositoryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RepositoryError::EntityNotFound(_)
            | RepositoryError::EntityByUniqueAttributesNotFound { .. }
            | RepositoryError::ReferencedEntityNotFound(_)
            | RepositoryError::ClassificationNotFound { .. }
            | RepositoryError::RelationshipNotFound(_) => ErrorKind::NotFound,
            RepositoryError::InvalidParameters(_)
            | RepositoryError::ValidationFailed { .. }
            | RepositoryError::InvalidObjectId(_)
            | RepositoryError::ClassificationAlreadyAssociated { .. }
            | RepositoryError::UnknownAttribute { .. } => ErrorKind::InvalidParameters,
            RepositoryError::UnknownType(_)
            | RepositoryError::TypeMismatch { .. }
            | RepositoryError::UnsupportedAttributeType { .. } => ErrorKind::TypeMismatch,
            RepositoryError::Transient(_) => ErrorKind::Transient,
            RepositoryError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Short machine-readable code, stable across message wording changes
    pub fn code(&self) -> &'static str {
        match self {
            RepositoryError::EntityNotFound(_) => "INSTANCE_GUID_NOT_FOUND",
            RepositoryError::EntityByUniqueAttributesNotFound { .. } => {
                "INSTANCE_BY_UNIQUE_ATTRIBUTE_NOT_FOUND"
            }
            RepositoryError::ReferencedEntityNotFound(_) => "REFERENCED_ENTITY_NOT_FOUND",
            RepositoryError::ClassificationNotFound { .. } => "CLASSIFICATION_NOT_FOUND",
            RepositoryError::RelationshipNotFound(_) => "RELATIONSHIP_GUID_NOT_FOUND",
            RepositoryError::InvalidParameters(_) => "INVALID_PARAMETERS",
            RepositoryError::ValidationFailed { .. } => "INSTANCE_CRUD_INVALID_PARAMS",
            RepositoryError::InvalidObjectId(_) => "INVALID_OBJECT_ID",
            RepositoryError::ClassificationAlreadyAssociated { .. } => {
                "CLASSIFICATION_ALREADY_ASSOCIATED"
            }
            RepositoryError::UnknownAttribute { .. } => "UNKNOWN_ATTRIBUTE",
            RepositoryError::UnknownType(_) => "TYPE_NAME_INVALID",
            RepositoryError::TypeMismatch { .. } => "TYPE_CATEGORY_INVALID",
            RepositoryError::UnsupportedAttributeType { .. } => "ATTRIBUTE_UPDATE_NOT_SUPPORTED",
            RepositoryError::Transient(_) => "TRANSIENT_FAILURE",
            RepositoryError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_kinds() {
        assert!(RepositoryError::EntityNotFound("g1".into()).is_not_found());
        assert!(RepositoryError::ClassificationNotFound {
            guid: "g1".into(),
            classification: "PII".into()
        }
        .is_not_found());
        assert!(!RepositoryError::Internal("boom".into()).is_not_found());
    }

    #[test]
    fn test_validation_message_lists_all_problems() {
        let err = RepositoryError::ValidationFailed {
            type_name: "Table".into(),
            messages: vec!["name: required".into(), "owner: expected string".into()],
        };
        assert_eq!(err.kind(), ErrorKind::InvalidParameters);
        assert!(err.to_string().contains("name: required; owner: expected string"));
    }
}
