use super::types::{CollectionSchema, FieldType::*};

/// Names of the collections every store provisions, in evolution order.
pub const BUILTIN_COLLECTIONS: [&str; 9] = [
    "surahs",
    "ayahs",
    "wordAnalysis",
    "translations",
    "tafseers",
    "recitations",
    "users",
    "adminSettings",
    "contentVersions",
];

/// Schemas for the Quran content collections.
pub fn builtin_schemas() -> Vec<(&'static str, CollectionSchema)> {
    vec![
        (
            "surahs",
            CollectionSchema::new()
                .field("id", String)
                .field("name", String)
                .field("arabicName", String)
                // meccan | medinan
                .field("revelationType", String)
                .field("numberOfAyahs", Number)
                .field("juz", Number)
                .field("hizb", Number)
                .field("order", Number)
                .required(&["id", "name", "arabicName", "numberOfAyahs", "order"]),
        ),
        (
            "ayahs",
            CollectionSchema::new()
                .field("id", String)
                .field("surahId", String)
                .field("ayahNumber", Number)
                .field("pageNumber", Number)
                .field("juzNumber", Number)
                .field("hizbNumber", Number)
                .field("rukuNumber", Number)
                .field("arabicText", String)
                .field("tafseer", Object)
                .field("audioUrl", String)
                .required(&["id", "surahId", "ayahNumber", "arabicText"]),
        ),
        (
            "wordAnalysis",
            CollectionSchema::new()
                .field("id", String)
                .field("ayahId", String)
                .field("wordIndex", Number)
                .field("arabicWord", String)
                .field("transliteration", String)
                .field("morphology", Object)
                .field("meaning", Object)
                .field("tafseerNotes", Object)
                .field("tajweedClass", String)
                .required(&["id", "ayahId", "wordIndex", "arabicWord"]),
        ),
        (
            "translations",
            CollectionSchema::new()
                .field("id", String)
                .field("ayahId", String)
                .field("language", String)
                .field("translator", String)
                .field("translation", String)
                .field("notes", String)
                .required(&["id", "ayahId", "language", "translation"])
                .unique(&["ayahId", "language", "translator"]),
        ),
        (
            "tafseers",
            CollectionSchema::new()
                .field("id", String)
                .field("ayahId", String)
                .field("scholar", String)
                .field("explanation", Object)
                .field("source", String)
                .field("language", String)
                .required(&["id", "ayahId", "scholar", "explanation"]),
        ),
        (
            "recitations",
            CollectionSchema::new()
                .field("id", String)
                .field("ayahId", String)
                .field("reciter", String)
                .field("audioUrl", String)
                .field("duration", Number)
                .field("quality", String)
                .required(&["id", "ayahId", "reciter", "audioUrl"]),
        ),
        (
            "users",
            CollectionSchema::new()
                .field("id", String)
                .field("uid", String)
                .field("email", String)
                .field("password", String)
                .field("googleId", String)
                .field("verified", Boolean)
                .field("roles", Array)
                .field("permissions", Array)
                .field("profile", Object)
                .required(&["email"])
                .unique(&["email"]),
        ),
        (
            "adminSettings",
            CollectionSchema::new()
                .field("id", String)
                .field("key", String)
                .field("value", Object)
                .field("description", String)
                .field("lastModified", Date)
                .required(&["id", "key", "value"]),
        ),
        (
            "contentVersions",
            CollectionSchema::new()
                .field("id", String)
                .field("contentType", String)
                .field("contentId", String)
                .field("version", String)
                .field("data", Object)
                .field("author", String)
                .field("createdAt", Date)
                .field("published", Boolean)
                .required(&["id", "contentType", "contentId", "version"]),
        ),
    ]
}
