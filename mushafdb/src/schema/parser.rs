use super::types::SchemaDefinition;
use crate::error::{MushafDbError, Result};
use std::path::Path;

/// Load collection schemas from a YAML file.
pub fn parse_schema(path: &Path) -> Result<SchemaDefinition> {
    let content = std::fs::read_to_string(path)?;
    parse_schema_str(&content)
}

/// Parse collection schemas from YAML, e.g.
///
/// ```yaml
/// collections:
///   bookmarks:
///     required: [userId, ayahId]
///     types: { userId: string, ayahId: string, note: string }
///     defaults: { note: "" }
///     unique: [[userId, ayahId]]
/// ```
///
/// Unknown type tags are rejected while parsing, so validation never sees them.
pub fn parse_schema_str(content: &str) -> Result<SchemaDefinition> {
    let schema: SchemaDefinition = serde_yaml::from_str(content)?;
    check_schema(&schema)?;
    Ok(schema)
}

fn check_schema(schema: &SchemaDefinition) -> Result<()> {
    for (name, collection) in &schema.collections {
        if name.is_empty() || name.contains('/') {
            return Err(MushafDbError::Schema(format!(
                "Invalid collection name '{name}'"
            )));
        }
        if collection.unique.iter().any(|group| group.is_empty()) {
            return Err(MushafDbError::Schema(format!(
                "Collection '{name}' declares an empty unique group"
            )));
        }
        if collection.required.iter().any(|f| f.is_empty()) {
            return Err(MushafDbError::Schema(format!(
                "Collection '{name}' declares an empty required field name"
            )));
        }
    }
    Ok(())
}
