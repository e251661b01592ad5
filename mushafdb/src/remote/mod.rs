//! Remote object store adapter.
//!
//! A collection lives in the remote store as one JSON file holding the record
//! list. The adapter only knows paths: it fetches a file (optionally
//! conditionally, with the revision tag from the last fetch) and writes a file
//! guarded by the revision id the caller last saw.

mod github;
mod memory;

pub use github::GitHubStore;
pub use memory::MemoryRemote;

use crate::record::Record;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use thiserror::Error;

/// Failures reported by a remote store.
///
/// Absence of a file is not an error; see [`FetchOutcome::NotFound`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The expected revision id did not match the file's current revision.
    #[error("Revision conflict writing {path}")]
    Conflict { path: String },

    /// Transient unavailability: gateway errors, rate limiting, timeouts, refused connections.
    #[error("Remote store unavailable{}: {message}", status_suffix(*status))]
    Unavailable { status: Option<u16>, message: String },

    #[error("GitHub API Error {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Cannot decode {path}: {message}")]
    Decode { path: String, message: String },
}

fn status_suffix(status: Option<u16>) -> String {
    status.map(|s| format!(" ({s})")).unwrap_or_default()
}

impl RemoteError {
    /// Whether repeating the same write later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Conflict { .. } | RemoteError::Unavailable { .. })
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(path: &str, status: u16, body: String) -> Self {
        match status {
            409 => RemoteError::Conflict {
                path: path.to_string(),
            },
            // GitHub answers 422 when the sha guard is missing for an existing file
            422 if body.contains("sha") => RemoteError::Conflict {
                path: path.to_string(),
            },
            429 | 502 | 503 | 504 => RemoteError::Unavailable {
                status: Some(status),
                message: body,
            },
            _ => RemoteError::Http {
                status,
                message: body,
            },
        }
    }
}

/// A file as currently stored remotely.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteFile {
    pub records: Vec<Record>,
    /// Validator for conditional fetches (an ETag).
    pub revision_tag: Option<String>,
    /// Revision id a write must present to replace this content (the blob sha).
    pub revision_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Found(RemoteFile),
    /// The conditional tag still matches; keep what you have.
    NotModified,
    NotFound,
}

/// A full-file replacement.
#[derive(Debug, Clone, Copy)]
pub struct WriteRequest<'a> {
    pub path: &'a str,
    pub records: &'a [Record],
    pub message: &'a str,
    /// Revision id of the content being replaced; `None` creates the file.
    pub expected_revision: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    /// Revision id of the newly written content, when the store reports it.
    pub revision_id: Option<String>,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn fetch(
        &self,
        path: &str,
        if_none_match: Option<&str>,
    ) -> Result<FetchOutcome, RemoteError>;

    async fn write(&self, request: WriteRequest<'_>) -> Result<WriteReceipt, RemoteError>;
}

/// Base64 of the pretty-printed JSON record list.
pub fn encode_records(records: &[Record]) -> Result<String, serde_json::Error> {
    let json = serde_json::to_string_pretty(records)?;
    Ok(STANDARD.encode(json.as_bytes()))
}

/// Inverse of [`encode_records`]. Line breaks inside the base64 payload are ignored.
pub fn decode_records(path: &str, content: &str) -> Result<Vec<Record>, RemoteError> {
    let compact: String = content.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = STANDARD.decode(compact.as_bytes()).map_err(|e| RemoteError::Decode {
        path: path.to_string(),
        message: e.to_string(),
    })?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    serde_json::from_slice(&bytes).map_err(|e| RemoteError::Decode {
        path: path.to_string(),
        message: format!("expected a JSON array of objects: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_decode_preserves_value() {
        let records: Vec<Record> = vec![
            serde_json::from_value(json!({
                "id": "1",
                "arabicWord": "ٱلْحَمْدُ",
                "meaning": { "en": "praise" }
            }))
            .unwrap(),
        ];
        let encoded = encode_records(&records).unwrap();
        assert_eq!(decode_records("db/wordAnalysis.json", &encoded).unwrap(), records);
    }

    #[test]
    fn test_decode_tolerates_line_breaks() {
        let encoded = encode_records(&[]).unwrap();
        let wrapped = format!("{}\n{}\n", &encoded[..2], &encoded[2..]);
        assert!(decode_records("db/x.json", &wrapped).unwrap().is_empty());
    }

    #[test]
    fn test_decode_rejects_non_array() {
        let encoded = STANDARD.encode(br#"{"id":"1"}"#);
        let err = decode_records("db/x.json", &encoded).unwrap_err();
        assert!(matches!(err, RemoteError::Decode { .. }));
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            RemoteError::from_status("p", 409, String::new()),
            RemoteError::Conflict { .. }
        ));
        assert!(matches!(
            RemoteError::from_status("p", 422, "\"sha\" wasn't supplied.".into()),
            RemoteError::Conflict { .. }
        ));
        assert!(matches!(
            RemoteError::from_status("p", 422, "bad branch".into()),
            RemoteError::Http { status: 422, .. }
        ));
        assert!(RemoteError::from_status("p", 503, String::new()).is_retryable());
        assert!(!RemoteError::from_status("p", 401, String::new()).is_retryable());
        assert!(!RemoteError::Transport("reset".into()).is_retryable());
    }
}
