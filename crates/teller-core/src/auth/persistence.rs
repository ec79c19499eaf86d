//! Where a session lives between reads.
//!
//! `MemoryPersistence` keeps it for the life of the process; `FilePersistence`
//! writes `session.json` into the namespaced cache directory so a session
//! survives restarts until it expires.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{CredentialMaterial, CredentialStore, Session, UserProfile};

/// Session file name in the session directory
const SESSION_FILE: &str = "session.json";

pub trait SessionPersistence: Send + Sync {
    fn load(&self) -> Result<Option<Session>>;
    fn save(&self, session: &Session) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

impl<T: SessionPersistence + ?Sized> SessionPersistence for Arc<T> {
    fn load(&self) -> Result<Option<Session>> {
        (**self).load()
    }

    fn save(&self, session: &Session) -> Result<()> {
        (**self).save(session)
    }

    fn clear(&self) -> Result<()> {
        (**self).clear()
    }
}

#[derive(Default)]
pub struct MemoryPersistence {
    slot: Mutex<Option<Session>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a previously saved session
    pub fn with_session(session: Session) -> Self {
        Self {
            slot: Mutex::new(Some(session)),
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<Session>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SessionPersistence for MemoryPersistence {
    fn load(&self) -> Result<Option<Session>> {
        Ok(self.slot().clone())
    }

    fn save(&self, session: &Session) -> Result<()> {
        *self.slot() = Some(session.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.slot() = None;
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum StoredCredential {
    Token { token: String },
    /// Password is held by the keychain
    Basic { username: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredSession {
    credential: StoredCredential,
    profile: Option<UserProfile>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

pub struct FilePersistence {
    dir: PathBuf,
    keychain: Option<CredentialStore>,
}

impl FilePersistence {
    pub fn new(dir: PathBuf, keychain: CredentialStore) -> Self {
        Self {
            dir,
            keychain: Some(keychain),
        }
    }

    /// Token sessions only; basic-auth sessions stay in memory.
    pub fn without_keychain(dir: PathBuf) -> Self {
        Self {
            dir,
            keychain: None,
        }
    }

    fn session_path(&self) -> PathBuf {
        self.dir.join(SESSION_FILE)
    }

    fn read_stored(&self) -> Result<Option<StoredSession>> {
        let path = self.session_path();
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path).context("Failed to read session file")?;
        let stored = serde_json::from_str(&contents).context("Failed to parse session file")?;
        Ok(Some(stored))
    }
}

impl SessionPersistence for FilePersistence {
    fn load(&self) -> Result<Option<Session>> {
        let Some(stored) = self.read_stored()? else {
            return Ok(None);
        };

        let credential = match stored.credential {
            StoredCredential::Token { token } => CredentialMaterial::OpaqueToken(token),
            StoredCredential::Basic { username } => match &self.keychain {
                Some(keychain) => {
                    let password = keychain.get_password(&username)?;
                    CredentialMaterial::UsernamePassword(username, password)
                }
                None => {
                    debug!("Basic session on disk but no keychain configured");
                    return Ok(None);
                }
            },
        };

        Ok(Some(Session {
            credential,
            profile: stored.profile,
            created_at: stored.created_at,
            expires_at: stored.expires_at,
        }))
    }

    fn save(&self, session: &Session) -> Result<()> {
        let credential = match &session.credential {
            CredentialMaterial::OpaqueToken(token) => StoredCredential::Token {
                token: token.clone(),
            },
            CredentialMaterial::UsernamePassword(username, password) => {
                let Some(keychain) = &self.keychain else {
                    debug!("No keychain configured, basic session not persisted");
                    return self.clear();
                };
                keychain.store(username, password)?;
                StoredCredential::Basic {
                    username: username.clone(),
                }
            }
        };

        let stored = StoredSession {
            credential,
            profile: session.profile.clone(),
            created_at: session.created_at,
            expires_at: session.expires_at,
        };

        std::fs::create_dir_all(&self.dir)?;
        let contents = serde_json::to_string_pretty(&stored)?;
        std::fs::write(self.session_path(), contents)?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        // A corrupt file still has to go
        let stored = self.read_stored().unwrap_or_else(|e| {
            warn!(error = %e, "Discarding unreadable session file");
            None
        });

        if let (Some(StoredSession { credential: StoredCredential::Basic { username }, .. }), Some(keychain)) =
            (stored, &self.keychain)
        {
            if let Err(e) = keychain.delete(&username) {
                warn!(error = %e, "Failed to delete keychain entry");
            }
        }

        let path = self.session_path();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn token_session() -> Session {
        Session::new(
            CredentialMaterial::token("abc"),
            Some(UserProfile::new("7", "Alice")),
            Utc::now(),
            Duration::minutes(10),
        )
    }

    #[test]
    fn test_memory_persistence() {
        let persistence = MemoryPersistence::new();
        assert!(persistence.load().unwrap().is_none());

        let session = token_session();
        persistence.save(&session).unwrap();
        assert_eq!(persistence.load().unwrap(), Some(session));

        persistence.clear().unwrap();
        assert!(persistence.load().unwrap().is_none());
    }

    #[test]
    fn test_file_persistence_token_session() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = FilePersistence::without_keychain(dir.path().join("ns"));

        let session = token_session();
        persistence.save(&session).unwrap();

        let contents = std::fs::read_to_string(dir.path().join("ns").join(SESSION_FILE)).unwrap();
        assert!(contents.contains("\"kind\": \"token\""));

        let loaded = persistence.load().unwrap().expect("session on disk");
        assert_eq!(loaded, session);

        persistence.clear().unwrap();
        assert!(persistence.load().unwrap().is_none());
        // Clearing twice is fine
        persistence.clear().unwrap();
    }

    #[test]
    fn test_file_persistence_never_writes_password() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = FilePersistence::without_keychain(dir.path().to_path_buf());

        let session = Session::new(
            CredentialMaterial::basic("alice", "hunter2"),
            None,
            Utc::now(),
            Duration::minutes(10),
        );
        persistence.save(&session).unwrap();

        assert!(!dir.path().join(SESSION_FILE).exists());
        assert!(persistence.load().unwrap().is_none());
    }

    #[test]
    fn test_clear_removes_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SESSION_FILE), "{not json").unwrap();
        let persistence = FilePersistence::without_keychain(dir.path().to_path_buf());

        assert!(persistence.load().is_err());
        persistence.clear().unwrap();
        assert!(!dir.path().join(SESSION_FILE).exists());
    }
}
