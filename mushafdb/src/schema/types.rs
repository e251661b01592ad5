use crate::record::Record;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Top-level schema document, e.g. a `schema.yaml` passed through configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaDefinition {
    #[serde(default)]
    pub collections: HashMap<String, CollectionSchema>,
}

/// Domain check run after the declarative rules. Returns `false` to reject the record.
pub type Predicate = Arc<dyn Fn(&Record) -> bool + Send + Sync>;

/// Validation rules for one collection.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct CollectionSchema {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub types: BTreeMap<String, FieldType>,
    #[serde(default)]
    pub defaults: Record,
    /// Groups of fields whose combined values must not repeat within the collection.
    #[serde(default)]
    pub unique: Vec<Vec<String>>,
    #[serde(skip)]
    pub predicate: Option<Predicate>,
}

impl CollectionSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, fields: &[&str]) -> Self {
        self.required = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn field(mut self, name: &str, field_type: FieldType) -> Self {
        self.types.insert(name.to_string(), field_type);
        self
    }

    pub fn default_value(mut self, name: &str, value: serde_json::Value) -> Self {
        self.defaults.insert(name.to_string(), value);
        self
    }

    pub fn unique(mut self, fields: &[&str]) -> Self {
        self.unique.push(fields.iter().map(|f| f.to_string()).collect());
        self
    }

    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Record) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }
}

impl fmt::Debug for CollectionSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionSchema")
            .field("required", &self.required)
            .field("types", &self.types)
            .field("defaults", &self.defaults)
            .field("unique", &self.unique)
            .field("predicate", &self.predicate.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// Field type categories a schema can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Object,
    #[serde(alias = "list")]
    Array,
    /// A string that parses as a timestamp.
    Date,
    /// A string; the format is not checked.
    Uuid,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Object => "object",
            FieldType::Array => "array",
            FieldType::Date => "date",
            FieldType::Uuid => "uuid",
        };
        f.write_str(name)
    }
}
