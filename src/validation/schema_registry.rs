//! Registry of named JSON schemas used by structured completions.

use crate::core::error::{AppError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A stored schema with its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub json_schema: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update; `None` fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchemaUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub json_schema: Option<Value>,
}

/// Resolves schema ids to schema bodies.
#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    /// Fails with [`AppError::SchemaNotFound`] for unknown ids.
    async fn resolve(&self, schema_id: &str) -> Result<Value>;
}

#[derive(Debug, Default)]
pub struct InMemorySchemaRegistry {
    schemas: DashMap<String, SchemaDefinition>,
}

fn check_schema(schema: &Value) -> Result<()> {
    if schema.is_object() {
        Ok(())
    } else {
        Err(AppError::InvalidRequest(
            "json_schema must be a JSON object".to_string(),
        ))
    }
}

impl InMemorySchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema, generating an id when none is given.
    ///
    /// Registering an existing id replaces it.
    pub fn register(
        &self,
        json_schema: Value,
        name: impl Into<String>,
        description: Option<String>,
        schema_id: Option<String>,
    ) -> Result<SchemaDefinition> {
        check_schema(&json_schema)?;

        let id = schema_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let now = Utc::now();
        let definition = SchemaDefinition {
            id: id.clone(),
            name: name.into(),
            description,
            json_schema,
            created_at: now,
            updated_at: now,
        };

        self.schemas.insert(id.clone(), definition.clone());
        tracing::info!(schema_id = %id, name = %definition.name, "Registered schema");
        Ok(definition)
    }

    pub fn get(&self, schema_id: &str) -> Option<SchemaDefinition> {
        self.schemas.get(schema_id).map(|entry| entry.value().clone())
    }

    /// All schemas ordered by creation time.
    pub fn list(&self) -> Vec<SchemaDefinition> {
        let mut all: Vec<SchemaDefinition> = self
            .schemas
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    pub fn update(&self, schema_id: &str, update: SchemaUpdate) -> Result<SchemaDefinition> {
        if let Some(schema) = &update.json_schema {
            check_schema(schema)?;
        }

        let mut entry = self
            .schemas
            .get_mut(schema_id)
            .ok_or_else(|| AppError::SchemaNotFound(schema_id.to_string()))?;

        if let Some(name) = update.name {
            entry.name = name;
        }
        if let Some(description) = update.description {
            entry.description = Some(description);
        }
        if let Some(schema) = update.json_schema {
            entry.json_schema = schema;
        }
        entry.updated_at = Utc::now();

        tracing::info!(schema_id = %schema_id, "Updated schema");
        Ok(entry.clone())
    }

    pub fn delete(&self, schema_id: &str) -> Result<()> {
        match self.schemas.remove(schema_id) {
            Some(_) => {
                tracing::info!(schema_id = %schema_id, "Deleted schema");
                Ok(())
            }
            None => Err(AppError::SchemaNotFound(schema_id.to_string())),
        }
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

#[async_trait]
impl SchemaRegistry for InMemorySchemaRegistry {
    async fn resolve(&self, schema_id: &str) -> Result<Value> {
        self.get(schema_id)
            .map(|definition| definition.json_schema)
            .ok_or_else(|| AppError::SchemaNotFound(schema_id.to_string()))
    }
}
