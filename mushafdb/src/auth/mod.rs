//! Password hashing and in-memory sessions.

use crate::error::{MushafDbError, Result};
use crate::record::Record;
use chrono::{DateTime, Utc};
use regex::Regex;
use ring::pbkdf2;
use serde::Serialize;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

const PBKDF2_ITERATIONS: u32 = 10_000;
const CREDENTIAL_LENGTH: usize = 64;
const TOKEN_LENGTH: usize = 32;

/// Field holding the `salt$hash` password string on user records.
pub const PASSWORD_FIELD: &str = "password";

fn iterations() -> NonZeroU32 {
    NonZeroU32::new(PBKDF2_ITERATIONS).unwrap_or(NonZeroU32::MIN)
}

pub fn is_valid_email(email: &str) -> bool {
    static EMAIL: OnceLock<Option<Regex>> = OnceLock::new();
    EMAIL
        .get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(email))
}

/// PBKDF2-HMAC-SHA512 with a random salt, encoded as `<salt>$<hex digest>`.
pub fn hash_password(password: &str) -> String {
    let salt = uuid::Uuid::new_v4().to_string();
    let mut digest = [0u8; CREDENTIAL_LENGTH];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA512,
        iterations(),
        salt.as_bytes(),
        password.as_bytes(),
        &mut digest,
    );
    format!("{salt}${}", hex::encode(digest))
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt, hash)) = stored.split_once('$') else {
        return false;
    };
    let Some(expected) = hex::decode(hash).ok() else {
        return false;
    };
    pbkdf2::verify(
        pbkdf2::PBKDF2_HMAC_SHA512,
        iterations(),
        salt.as_bytes(),
        password.as_bytes(),
        &expected,
    )
    .is_ok()
}

/// A logged-in user. The password hash is never part of the session copy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub token: String,
    pub user: Record,
    pub created_at: DateTime<Utc>,
}

impl Session {
    fn is_expired(&self, ttl: Option<Duration>, now: DateTime<Utc>) -> bool {
        match ttl.and_then(|ttl| chrono::Duration::from_std(ttl).ok()) {
            Some(ttl) => now - self.created_at >= ttl,
            None => false,
        }
    }
}

/// Sessions keyed by token. Without a TTL they live until destroyed.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Session>>,
    ttl: Option<Duration>,
}

impl SessionStore {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create(&self, user: &Record) -> Session {
        let mut user = user.clone();
        user.remove(PASSWORD_FIELD);
        let session = Session {
            token: nanoid::nanoid!(TOKEN_LENGTH),
            user,
            created_at: Utc::now(),
        };
        self.lock().insert(session.token.clone(), session.clone());
        session
    }

    /// The live session for `token`. Expired sessions are dropped on access.
    pub fn get(&self, token: &str) -> Option<Session> {
        let mut sessions = self.lock();
        let expired = sessions.get(token)?.is_expired(self.ttl, Utc::now());
        if expired {
            sessions.remove(token);
            log::debug!("Session expired");
            return None;
        }
        sessions.get(token).cloned()
    }

    /// Returns false when no such session existed.
    pub fn destroy(&self, token: &str) -> bool {
        self.lock().remove(token).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Reject with the message callers show on a failed login.
pub(crate) fn invalid_credentials() -> MushafDbError {
    MushafDbError::Auth("Invalid credentials".into())
}

pub(crate) fn check_email(email: &str) -> Result<()> {
    if is_valid_email(email) {
        Ok(())
    } else {
        Err(MushafDbError::Validation("Invalid email format".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hash_and_verify() {
        let stored = hash_password("correct horse");
        let (salt, hash) = stored.split_once('$').unwrap();
        assert_eq!(salt.len(), 36);
        assert_eq!(hash.len(), CREDENTIAL_LENGTH * 2);
        assert_eq!(hex::decode(hash).unwrap().len(), CREDENTIAL_LENGTH);
        assert!(verify_password("correct horse", &stored));
        assert!(!verify_password("battery staple", &stored));
    }

    #[test]
    fn test_salts_differ() {
        assert_ne!(hash_password("same"), hash_password("same"));
    }

    #[test]
    fn test_malformed_hash_never_verifies() {
        assert!(!verify_password("x", "no-separator"));
        assert!(!verify_password("x", "salt$zz"));
        assert!(!verify_password("x", "salt$abc"));
    }

    #[test]
    fn test_email_format() {
        assert!(is_valid_email("reader@quran.app"));
        assert!(!is_valid_email("reader@quran"));
        assert!(!is_valid_email("two words@quran.app"));
    }

    #[test]
    fn test_session_strips_password_and_can_be_destroyed() {
        let store = SessionStore::new(None);
        let user = crate::record::from_value(json!({
            "id": "1",
            "email": "a@b.com",
            "password": "s$h"
        }))
        .unwrap();
        let session = store.create(&user);
        assert_eq!(session.token.len(), TOKEN_LENGTH);
        assert!(!session.user.contains_key(PASSWORD_FIELD));
        assert_eq!(store.get(&session.token).unwrap().user["email"], json!("a@b.com"));
        assert!(store.destroy(&session.token));
        assert!(store.get(&session.token).is_none());
        assert!(!store.destroy(&session.token));
    }

    #[test]
    fn test_zero_ttl_expires_immediately() {
        let store = SessionStore::new(Some(Duration::ZERO));
        let session = store.create(&Record::new());
        assert!(store.get(&session.token).is_none());
        assert!(store.is_empty());
    }
}
