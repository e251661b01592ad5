//! Versioned data migrations.
//!
//! Each collection has an ordered list of migrations. Forward transforms run
//! in ascending version order at startup; backward transforms run in
//! descending order when reverting to an earlier version. Transforms must be
//! idempotent: the runner compares the result with the input and skips the
//! write when nothing changed.

use crate::error::{MushafDbError, Result};
use crate::record::Record;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Whole-collection transform.
pub type Transform = Arc<dyn Fn(Vec<Record>) -> Result<Vec<Record>> + Send + Sync>;

#[derive(Clone)]
pub struct Migration {
    pub version: u32,
    pub description: String,
    up: Transform,
    down: Transform,
}

impl Migration {
    /// A migration whose backward transform leaves the data as is.
    pub fn new<F>(version: u32, description: &str, up: F) -> Self
    where
        F: Fn(Vec<Record>) -> Result<Vec<Record>> + Send + Sync + 'static,
    {
        Self {
            version,
            description: description.to_string(),
            up: Arc::new(up),
            down: Arc::new(unchanged),
        }
    }

    pub fn with_down<F>(mut self, down: F) -> Self
    where
        F: Fn(Vec<Record>) -> Result<Vec<Record>> + Send + Sync + 'static,
    {
        self.down = Arc::new(down);
        self
    }

    fn wrap(&self, collection: &str, result: Result<Vec<Record>>) -> Result<Vec<Record>> {
        result.map_err(|e| match e {
            e @ MushafDbError::Migration { .. } => e,
            other => MushafDbError::Migration {
                collection: collection.to_string(),
                version: self.version,
                message: other.to_string(),
            },
        })
    }

    pub fn up(&self, collection: &str, records: Vec<Record>) -> Result<Vec<Record>> {
        self.wrap(collection, (self.up)(records))
    }

    pub fn down(&self, collection: &str, records: Vec<Record>) -> Result<Vec<Record>> {
        self.wrap(collection, (self.down)(records))
    }
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .field("description", &self.description)
            .finish()
    }
}

fn unchanged(records: Vec<Record>) -> Result<Vec<Record>> {
    Ok(records)
}

/// Migrations per collection, each list kept sorted by version.
#[derive(Debug, Clone, Default)]
pub struct MigrationRegistry {
    migrations: HashMap<String, Vec<Migration>>,
}

impl MigrationRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry holding the built-in Quran data migrations.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.migrations.insert("ayahs".to_string(), vec![ayahs_v1()]);
        registry
    }

    pub fn register(&mut self, collection: &str, migration: Migration) -> Result<()> {
        let list = self.migrations.entry(collection.to_string()).or_default();
        if list.iter().any(|m| m.version == migration.version) {
            return Err(MushafDbError::Migration {
                collection: collection.to_string(),
                version: migration.version,
                message: "version already registered".into(),
            });
        }
        list.push(migration);
        list.sort_by_key(|m| m.version);
        Ok(())
    }

    pub fn for_collection(&self, collection: &str) -> &[Migration] {
        self.migrations.get(collection).map_or(&[], Vec::as_slice)
    }

    /// Highest registered version for `collection`, 0 when it has none.
    pub fn latest_version(&self, collection: &str) -> u32 {
        self.for_collection(collection).last().map_or(0, |m| m.version)
    }

    /// Apply every forward transform in ascending version order.
    pub fn migrate_up(&self, collection: &str, records: Vec<Record>) -> Result<Vec<Record>> {
        let mut current = records;
        for migration in self.for_collection(collection) {
            log::info!("Applying migration v{} to '{collection}'", migration.version);
            current = migration.up(collection, current)?;
        }
        Ok(current)
    }

    /// Apply the backward transforms of every migration above `target_version`, newest first.
    pub fn migrate_down(
        &self,
        collection: &str,
        records: Vec<Record>,
        target_version: u32,
    ) -> Result<Vec<Record>> {
        let mut current = records;
        for migration in self.for_collection(collection).iter().rev() {
            if migration.version <= target_version {
                break;
            }
            log::info!("Reverting migration v{} of '{collection}'", migration.version);
            current = migration.down(collection, current)?;
        }
        Ok(current)
    }
}

/// Backfill `tafseer`, `audioUrl` and `createdAt` on ayahs that predate them.
fn ayahs_v1() -> Migration {
    Migration::new(1, "Add tafseer and audio fields to ayahs", |records| {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        Ok(records
            .into_iter()
            .map(|mut ayah| {
                ayah.entry("tafseer").or_insert_with(|| Value::Object(Default::default()));
                ayah.entry("audioUrl").or_insert(Value::Null);
                ayah.entry("createdAt").or_insert_with(|| Value::String(now.clone()));
                ayah
            })
            .collect())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn record(value: Value) -> Record {
        crate::record::from_value(value).unwrap()
    }

    #[test]
    fn test_ayahs_v1_backfills_missing_fields_only() {
        let registry = MigrationRegistry::builtin();
        let input = vec![
            record(json!({ "id": "1", "arabicText": "بِسْمِ" })),
            record(json!({
                "id": "2",
                "arabicText": "ٱلْحَمْدُ",
                "tafseer": { "en": "Praise" },
                "createdAt": "2024-01-01"
            })),
        ];

        let migrated = registry.migrate_up("ayahs", input).unwrap();
        assert_eq!(migrated[0]["tafseer"], json!({}));
        assert_eq!(migrated[0]["audioUrl"], Value::Null);
        assert!(migrated[0]["createdAt"].is_string());
        assert_eq!(migrated[1]["tafseer"], json!({ "en": "Praise" }));
        assert_eq!(migrated[1]["createdAt"], json!("2024-01-01"));
    }

    #[test]
    fn test_migrate_up_is_idempotent() {
        let registry = MigrationRegistry::builtin();
        let once = registry.migrate_up("ayahs", vec![record(json!({ "id": "1" }))]).unwrap();
        let twice = registry.migrate_up("ayahs", once.clone()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_versions_run_in_order_and_revert_in_reverse() {
        let mut registry = MigrationRegistry::empty();
        let tag = |label: &'static str| {
            move |records: Vec<Record>| -> Result<Vec<Record>> {
                Ok(records
                    .into_iter()
                    .map(|mut r| {
                        let trail = r
                            .get("trail")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string();
                        r.insert("trail".into(), json!(format!("{trail}{label}")));
                        r
                    })
                    .collect())
            }
        };
        for (version, up, down) in [(2, "b", "B"), (1, "a", "A"), (3, "c", "C")] {
            let migration = Migration::new(version, up, tag(up)).with_down(tag(down));
            registry.register("notes", migration).unwrap();
        }

        let up = registry.migrate_up("notes", vec![record(json!({ "id": "1" }))]).unwrap();
        assert_eq!(up[0]["trail"], json!("abc"));

        let down = registry.migrate_down("notes", up, 1).unwrap();
        assert_eq!(down[0]["trail"], json!("abcCB"));
        assert_eq!(registry.latest_version("notes"), 3);
    }

    #[test]
    fn test_duplicate_version_is_rejected() {
        let mut registry = MigrationRegistry::builtin();
        let result = registry.register("ayahs", Migration::new(1, "again", |records| Ok(records)));
        assert!(matches!(result, Err(MushafDbError::Migration { version: 1, .. })));
    }

    #[test]
    fn test_transform_error_names_version() {
        let mut registry = MigrationRegistry::empty();
        registry
            .register(
                "surahs",
                Migration::new(4, "broken", |_| {
                    Err(MushafDbError::Other("missing revelationType".into()))
                }),
            )
            .unwrap();

        let err = registry.migrate_up("surahs", vec![]).unwrap_err();
        assert_eq!(err.to_string(), "Migration v4 failed for 'surahs': missing revelationType");
    }
}
