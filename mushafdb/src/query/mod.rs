//! Lazy query builder over one collection.
//!
//! Stages are recorded in call order and run only by [`Query::exec`], which
//! reads the collection once at that point.

use crate::error::Result;
use crate::record::Record;
use crate::store::Store;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

type Filter = Arc<dyn Fn(&Record) -> bool + Send + Sync>;

#[derive(Clone)]
enum Stage {
    Filter(Filter),
    Sort { field: String, direction: SortDirection },
    Project(Vec<String>),
    Limit(usize),
}

#[derive(Clone)]
pub struct Query {
    store: Store,
    collection: String,
    stages: Vec<Stage>,
}

impl Query {
    pub(crate) fn new(store: Store, collection: &str) -> Self {
        Self {
            store,
            collection: collection.to_string(),
            stages: Vec::new(),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Keep records for which `predicate` returns true.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Record) -> bool + Send + Sync + 'static,
    {
        self.stages.push(Stage::Filter(Arc::new(predicate)));
        self
    }

    /// Keep records whose `field` equals `value`.
    pub fn where_eq(self, field: &str, value: impl Into<Value>) -> Self {
        let field = field.to_string();
        let value = value.into();
        self.filter(move |record| record.get(&field) == Some(&value))
    }

    pub fn sort(mut self, field: &str, direction: SortDirection) -> Self {
        self.stages.push(Stage::Sort {
            field: field.to_string(),
            direction,
        });
        self
    }

    /// Reduce each record to the listed fields it actually has.
    pub fn project(mut self, fields: &[&str]) -> Self {
        self.stages
            .push(Stage::Project(fields.iter().map(|f| f.to_string()).collect()));
        self
    }

    pub fn limit(mut self, count: usize) -> Self {
        self.stages.push(Stage::Limit(count));
        self
    }

    pub async fn exec(self) -> Result<Vec<Record>> {
        let records = self.store.get(&self.collection, false).await?;
        Ok(run_stages(&self.stages, records))
    }

    pub async fn count(self) -> Result<usize> {
        Ok(self.exec().await?.len())
    }

    pub async fn first(self) -> Result<Option<Record>> {
        Ok(self.limit(1).exec().await?.into_iter().next())
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("collection", &self.collection)
            .field("stages", &self.stages.len())
            .finish()
    }
}

fn run_stages(stages: &[Stage], mut records: Vec<Record>) -> Vec<Record> {
    for stage in stages {
        match stage {
            Stage::Filter(predicate) => records.retain(|r| predicate(r)),
            Stage::Sort { field, direction } => records.sort_by(|a, b| {
                let ordering = compare_values(a.get(field), b.get(field));
                match direction {
                    SortDirection::Asc => ordering,
                    SortDirection::Desc => ordering.reverse(),
                }
            }),
            Stage::Project(fields) => {
                for record in &mut records {
                    record.retain(|key, _| fields.contains(key));
                }
            }
            Stage::Limit(count) => records.truncate(*count),
        }
    }
    records
}

/// Numbers, strings and booleans compare naturally; anything else, including
/// mixed kinds, compares by its string form. Missing sorts as the empty string.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        _ => sort_key(a).cmp(&sort_key(b)),
    }
}

fn sort_key(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}
