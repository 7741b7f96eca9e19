//! Schema parser: converts YAML/JSON text into [`WorkflowSchema`] and back.

use super::model::WorkflowSchema;
use crate::error::WorkflowError;

/// Supported schema formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaFormat {
    /// YAML format (`.yaml` / `.yml`).
    Yaml,
    /// JSON format (`.json`).
    Json,
}

/// Parse schema content into a [`WorkflowSchema`].
pub fn parse_schema(content: &str, format: SchemaFormat) -> Result<WorkflowSchema, WorkflowError> {
    match format {
        SchemaFormat::Yaml => {
            serde_yaml::from_str(content).map_err(|e| WorkflowError::SchemaParse(e.to_string()))
        }
        SchemaFormat::Json => {
            serde_json::from_str(content).map_err(|e| WorkflowError::SchemaParse(e.to_string()))
        }
    }
}

/// Serialize a schema. The output is deterministic: the schema's maps are
/// ordered, so re-serializing a parsed document reproduces it byte for byte.
pub fn write_schema(schema: &WorkflowSchema, format: SchemaFormat) -> Result<String, WorkflowError> {
    match format {
        SchemaFormat::Yaml => {
            serde_yaml::to_string(schema).map_err(|e| WorkflowError::SchemaSerialize(e.to_string()))
        }
        SchemaFormat::Json => serde_json::to_string_pretty(schema)
            .map_err(|e| WorkflowError::SchemaSerialize(e.to_string())),
    }
}
