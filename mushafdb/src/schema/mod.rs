pub mod builtin;
pub mod parser;
pub mod types;

pub use builtin::{builtin_schemas, BUILTIN_COLLECTIONS};
pub use parser::{parse_schema, parse_schema_str};
pub use types::*;

use crate::record::Record;
use std::collections::HashMap;

/// The schemas known to a store, plus the order collections are evolved in.
///
/// Built-in schemas come first; caller-supplied schemas replace a built-in of
/// the same name wholesale, and new names are appended in sorted order.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, CollectionSchema>,
    order: Vec<String>,
}

impl SchemaRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry holding only the built-in Quran schemas.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for (name, schema) in builtin_schemas() {
            registry.register(name, schema);
        }
        registry
    }

    /// Built-ins overlaid with `extra`.
    pub fn with_overrides(extra: &HashMap<String, CollectionSchema>) -> Self {
        let mut registry = Self::builtin();
        let mut names: Vec<&String> = extra.keys().collect();
        names.sort();
        for name in names {
            registry.register(name, extra[name].clone());
        }
        registry
    }

    pub fn register(&mut self, name: &str, schema: CollectionSchema) {
        if self.schemas.insert(name.to_string(), schema).is_none() {
            self.order.push(name.to_string());
        }
    }

    /// Attach a domain predicate to an already registered collection.
    pub fn set_predicate<F>(&mut self, name: &str, predicate: F) -> bool
    where
        F: Fn(&Record) -> bool + Send + Sync + 'static,
    {
        match self.schemas.get_mut(name) {
            Some(schema) => {
                schema.predicate = Some(std::sync::Arc::new(predicate));
                true
            }
            None => false,
        }
    }

    pub fn get(&self, name: &str) -> Option<&CollectionSchema> {
        self.schemas.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.schemas.contains_key(name)
    }

    /// Collection names in evolution order.
    pub fn collection_names(&self) -> &[String] {
        &self.order
    }
}
