use crate::error::{MushafDbError, Result};
use crate::record::{self, Record};
use crate::schema::{CollectionSchema, FieldType};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value;

/// Result of validating a record
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Fill in schema defaults for fields that are absent or null. Existing values win.
pub fn apply_defaults(schema: &CollectionSchema, data: &mut Record) {
    for (field_name, default) in &schema.defaults {
        let has_value = data.get(field_name).map(|v| !v.is_null()).unwrap_or(false);
        if !has_value {
            data.insert(field_name.clone(), default.clone());
        }
    }
}

/// Check a record against its collection schema.
///
/// Required fields come first, then declared types of the fields present,
/// then the custom predicate. Null values count as absent.
pub fn validate_record(
    collection: &str,
    schema: &CollectionSchema,
    data: &Record,
) -> ValidationResult {
    let mut result = ValidationResult::default();

    for field_name in &schema.required {
        let missing = data.get(field_name).map(Value::is_null).unwrap_or(true);
        if missing {
            result
                .errors
                .push(format!("Missing required field: {field_name} in {collection}"));
        }
    }

    for (field_name, field_type) in &schema.types {
        let Some(value) = data.get(field_name) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        if !matches_type(*field_type, value) {
            result.errors.push(format!(
                "Field {field_name} should be {field_type} in {collection}, got {}",
                record::type_name(value)
            ));
        }
    }

    if result.is_ok() {
        if let Some(predicate) = &schema.predicate {
            if !predicate(data) {
                result
                    .errors
                    .push(format!("Custom validation failed for {collection}"));
            }
        }
    }

    result
}

fn matches_type(field_type: FieldType, value: &Value) -> bool {
    match field_type {
        FieldType::String | FieldType::Uuid => value.is_string(),
        FieldType::Number => value.is_number(),
        FieldType::Boolean => value.is_boolean(),
        FieldType::Object => value.is_object(),
        FieldType::Array => value.is_array(),
        FieldType::Date => value.as_str().map(is_timestamp).unwrap_or(false),
    }
}

/// Accepts RFC 3339 timestamps, plain dates and naive date-times.
pub fn is_timestamp(s: &str) -> bool {
    let s = s.trim();
    DateTime::parse_from_rfc3339(s).is_ok()
        || NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").is_ok()
}

/// Apply defaults, then validate. Returns a validation error listing every problem.
pub fn validate_and_prepare(
    collection: &str,
    schema: Option<&CollectionSchema>,
    data: &mut Record,
) -> Result<()> {
    let Some(schema) = schema else {
        return Ok(());
    };
    apply_defaults(schema, data);
    let result = validate_record(collection, schema, data);

    if !result.is_ok() {
        return Err(MushafDbError::Validation(result.errors.join("; ")));
    }
    Ok(())
}

/// Enforce the schema's unique field groups for the records at `candidates`.
///
/// A group only applies to records carrying a non-null value for every field in it.
pub fn check_unique(
    collection: &str,
    schema: Option<&CollectionSchema>,
    records: &[Record],
    candidates: &[usize],
) -> Result<()> {
    let Some(schema) = schema else {
        return Ok(());
    };

    for group in &schema.unique {
        for &idx in candidates {
            let Some(key) = group_values(group, &records[idx]) else {
                continue;
            };
            let clash = records
                .iter()
                .enumerate()
                .any(|(other, r)| other != idx && group_values(group, r).as_ref() == Some(&key));
            if clash {
                return Err(MushafDbError::Duplicate(format!(
                    "{collection} already has a record with the same {}",
                    group.join(", ")
                )));
            }
        }
    }
    Ok(())
}

fn group_values<'a>(group: &[String], data: &'a Record) -> Option<Vec<&'a Value>> {
    group
        .iter()
        .map(|field| data.get(field).filter(|v| !v.is_null()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaRegistry;
    use serde_json::json;

    fn rec(v: Value) -> Record {
        record::from_value(v).unwrap()
    }

    #[test]
    fn test_valid_ayah() {
        let registry = SchemaRegistry::builtin();
        let schema = registry.get("ayahs").unwrap();
        let data = rec(json!({
            "id": "1", "surahId": "1", "ayahNumber": 1,
            "arabicText": "بِسْمِ ٱللَّهِ", "tafseer": {}
        }));
        let result = validate_record("ayahs", schema, &data);
        assert!(result.is_ok(), "Errors: {:?}", result.errors);
    }

    #[test]
    fn test_missing_required_field() {
        let registry = SchemaRegistry::builtin();
        let schema = registry.get("ayahs").unwrap();
        let data = rec(json!({ "id": "1", "surahId": "1", "ayahNumber": 1 }));
        let result = validate_record("ayahs", schema, &data);
        assert!(!result.is_ok());
        assert!(result.errors.iter().any(|e| e.contains("arabicText")));
    }

    #[test]
    fn test_null_counts_as_missing() {
        let schema = CollectionSchema::new().required(&["email"]);
        let data = rec(json!({ "email": null }));
        assert!(!validate_record("users", &schema, &data).is_ok());
    }

    #[test]
    fn test_type_mismatch_names_field_and_type() {
        let registry = SchemaRegistry::builtin();
        let schema = registry.get("ayahs").unwrap();
        let data = rec(json!({
            "id": "1", "surahId": "1", "ayahNumber": "one", "arabicText": "x"
        }));
        let result = validate_record("ayahs", schema, &data);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("ayahNumber"));
        assert!(result.errors[0].contains("number"));
    }

    #[test]
    fn test_null_skips_type_check() {
        let registry = SchemaRegistry::builtin();
        let schema = registry.get("ayahs").unwrap();
        let data = rec(json!({
            "id": "1", "surahId": "1", "ayahNumber": 1, "arabicText": "x", "audioUrl": null
        }));
        assert!(validate_record("ayahs", schema, &data).is_ok());
    }

    #[test]
    fn test_date_and_uuid_types() {
        let schema = CollectionSchema::new()
            .field("at", FieldType::Date)
            .field("ref", FieldType::Uuid);
        let valid = |value: Value| validate_record("x", &schema, &rec(value)).is_ok();
        assert!(valid(json!({ "at": "2024-03-01T10:00:00Z", "ref": "anything" })));
        assert!(valid(json!({ "at": "2024-03-01" })));
        assert!(valid(json!({ "at": "2024-03-01 10:00:00" })));
        assert!(!valid(json!({ "at": "next tuesday" })));
        assert!(!valid(json!({ "at": 1700000000 })));
        assert!(!valid(json!({ "ref": 42 })));
    }

    #[test]
    fn test_array_is_not_object() {
        let schema = CollectionSchema::new()
            .field("roles", FieldType::Array)
            .field("profile", FieldType::Object);
        let valid = |value: Value| validate_record("users", &schema, &rec(value)).is_ok();
        assert!(valid(json!({ "roles": [], "profile": {} })));
        assert!(!valid(json!({ "profile": [] })));
        assert!(!valid(json!({ "roles": {} })));
    }

    #[test]
    fn test_predicate_runs_last() {
        let schema = CollectionSchema::new()
            .required(&["language"])
            .with_predicate(|r| {
                r.get("language")
                    .and_then(Value::as_str)
                    .is_some_and(|l| l.len() == 2)
            });
        let english = rec(json!({ "language": "en" }));
        assert!(validate_record("translations", &schema, &english).is_ok());

        let spelled_out = rec(json!({ "language": "english" }));
        let result = validate_record("translations", &schema, &spelled_out);
        assert_eq!(result.errors, vec!["Custom validation failed for translations"]);
    }

    #[test]
    fn test_apply_defaults() {
        let schema = CollectionSchema::new().default_value("verified", json!(false));
        let mut data = rec(json!({ "email": "a@b.com" }));
        apply_defaults(&schema, &mut data);
        assert_eq!(data["verified"], json!(false));
    }

    #[test]
    fn test_apply_defaults_doesnt_overwrite() {
        let schema = CollectionSchema::new().default_value("verified", json!(false));
        let mut data = rec(json!({ "verified": true }));
        apply_defaults(&schema, &mut data);
        assert_eq!(data["verified"], json!(true));
    }

    #[test]
    fn test_default_satisfies_required() {
        let schema = CollectionSchema::new()
            .required(&["language"])
            .default_value("language", json!("en"));
        let mut data = rec(json!({ "translation": "In the name of God" }));
        validate_and_prepare("translations", Some(&schema), &mut data).unwrap();
        assert_eq!(data["language"], json!("en"));
    }

    #[test]
    fn test_unknown_collection_passes() {
        let mut data = rec(json!({ "anything": 1 }));
        assert!(validate_and_prepare("scratch", None, &mut data).is_ok());
    }

    #[test]
    fn test_check_unique() {
        let registry = SchemaRegistry::builtin();
        let schema = registry.get("translations");
        let records = vec![
            rec(json!({ "ayahId": "1", "language": "en", "translator": "sahih" })),
            rec(json!({ "ayahId": "1", "language": "en", "translator": "pickthall" })),
            rec(json!({ "ayahId": "1", "language": "en", "translator": "sahih" })),
        ];
        assert!(check_unique("translations", schema, &records, &[1]).is_ok());
        let err = check_unique("translations", schema, &records, &[2]).unwrap_err();
        assert!(matches!(err, MushafDbError::Duplicate(_)));
    }

    #[test]
    fn test_unique_ignores_incomplete_groups() {
        let registry = SchemaRegistry::builtin();
        let schema = registry.get("translations");
        let records = vec![
            rec(json!({ "ayahId": "1", "language": "en" })),
            rec(json!({ "ayahId": "1", "language": "en" })),
        ];
        assert!(check_unique("translations", schema, &records, &[0, 1]).is_ok());
    }
}
