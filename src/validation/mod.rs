//! Structured output validation.
//!
//! - [`validator`]: structural JSON Schema checks over provider output
//! - [`transformers`]: pure value transformers applied to nonconforming output
//! - [`schema_registry`]: named schemas resolvable by id

pub mod schema_registry;
pub mod transformers;
pub mod validator;

pub use schema_registry::{InMemorySchemaRegistry, SchemaDefinition, SchemaRegistry, SchemaUpdate};
pub use transformers::{Transformer, TransformerRegistry, TransformerSpec};
pub use validator::{
    validate, validate_parsed, validate_value, validate_with_transformers, ValidationIssue,
    ValidationResult,
};
