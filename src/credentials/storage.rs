//! Encrypted credential storage using SQLite.
//!
//! One row per user identifier. Access and refresh tokens are sealed
//! separately with AES-256-GCM before they touch the database.

use super::encryption::{Sealed, TokenCipher};
use super::CredentialRecord;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// How long a writer waits on a database locked by another connection.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Connections opened against a database file.
const FILE_CONNECTIONS: usize = 4;

/// Encrypted credential storage backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE credentials (
///     user_id TEXT PRIMARY KEY,
///     access_token TEXT NOT NULL,        -- Encrypted
///     access_token_nonce TEXT NOT NULL,
///     refresh_token TEXT NOT NULL,       -- Encrypted
///     refresh_token_nonce TEXT NOT NULL,
///     expires_at TEXT NOT NULL,          -- RFC 3339, microsecond precision
///     scope TEXT NOT NULL,
///     created_at TEXT NOT NULL,
///     updated_at TEXT NOT NULL
/// );
/// ```
///
/// # Thread Safety
/// A file database is opened in WAL mode with several connections. Each user
/// identifier always maps to the same connection, so operations on different
/// users rarely queue behind each other while readers never see a
/// half-written row. Each operation is a single statement. An in-memory
/// database is private to its connection and gets exactly one.
pub struct CredentialStore {
    connections: Vec<Mutex<Connection>>,
    cipher: TokenCipher,
}

impl CredentialStore {
    /// Creates or opens a credential store.
    ///
    /// # Arguments
    /// * `db_path` - Path to SQLite database file (`":memory:"` for tests)
    /// * `encryption_key` - Base64-encoded 32-byte master key
    pub fn new<P: AsRef<Path>>(db_path: P, encryption_key: &str) -> Result<Self> {
        let cipher = TokenCipher::from_base64_key(encryption_key).context("Invalid encryption key")?;

        let db_path = db_path.as_ref();
        let in_memory = db_path == Path::new(":memory:");
        let count = if in_memory { 1 } else { FILE_CONNECTIONS };

        let mut connections = Vec::with_capacity(count);
        for _ in 0..count {
            connections.push(open_connection(db_path, in_memory)?);
        }

        connections[0]
            .execute(
                r#"
                CREATE TABLE IF NOT EXISTS credentials (
                    user_id TEXT PRIMARY KEY,
                    access_token TEXT NOT NULL,
                    access_token_nonce TEXT NOT NULL,
                    refresh_token TEXT NOT NULL,
                    refresh_token_nonce TEXT NOT NULL,
                    expires_at TEXT NOT NULL,
                    scope TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )
                "#,
                [],
            )
            .context("Failed to create credentials table")?;

        Ok(Self {
            connections: connections.into_iter().map(Mutex::new).collect(),
            cipher,
        })
    }

    /// Connection that serves every operation on `user_id`.
    fn conn_for(&self, user_id: &str) -> Result<MutexGuard<'_, Connection>> {
        let mut hasher = DefaultHasher::new();
        user_id.hash(&mut hasher);
        let index = (hasher.finish() % self.connections.len() as u64) as usize;
        lock(&self.connections[index])
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Retrieves the record for `user_id`.
    ///
    /// # Returns
    /// * `Ok(Some(record))` - Found and decrypted
    /// * `Ok(None)` - The user has never authorized (or was deleted)
    /// * `Err` - Decryption or database failure
    pub fn get(&self, user_id: &str) -> Result<Option<CredentialRecord>> {
        let conn = self.conn_for(user_id)?;
        let row = conn
            .query_row(
                r#"
                SELECT access_token, access_token_nonce,
                       refresh_token, refresh_token_nonce,
                       expires_at, scope
                FROM credentials
                WHERE user_id = ?1
                "#,
                params![user_id],
                StoredRow::from_row,
            )
            .optional()
            .context("Failed to query credentials")?;
        drop(conn);

        row.map(|row| row.into_record(user_id, &self.cipher))
            .transpose()
    }

    /// Inserts or replaces the record for `record.user_id`.
    pub fn upsert(&self, record: &CredentialRecord) -> Result<()> {
        let access = self
            .cipher
            .seal(&record.access_token)
            .context("Failed to encrypt access token")?;
        let refresh = self
            .cipher
            .seal(&record.refresh_token)
            .context("Failed to encrypt refresh token")?;
        let now = format_timestamp(Utc::now());

        self.conn_for(&record.user_id)?
            .execute(
                r#"
                INSERT INTO credentials (
                    user_id,
                    access_token, access_token_nonce,
                    refresh_token, refresh_token_nonce,
                    expires_at, scope, created_at, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
                ON CONFLICT(user_id) DO UPDATE SET
                    access_token = excluded.access_token,
                    access_token_nonce = excluded.access_token_nonce,
                    refresh_token = excluded.refresh_token,
                    refresh_token_nonce = excluded.refresh_token_nonce,
                    expires_at = excluded.expires_at,
                    scope = excluded.scope,
                    updated_at = excluded.updated_at
                "#,
                params![
                    record.user_id,
                    access.ciphertext,
                    access.nonce,
                    refresh.ciphertext,
                    refresh.nonce,
                    format_timestamp(record.expires_at),
                    record.scope,
                    now,
                ],
            )
            .context("Failed to store credentials")?;

        Ok(())
    }

    /// Replaces the record only if the stored `expires_at` still equals
    /// `expected_expires_at`.
    ///
    /// Returns `Ok(false)` when the row changed (or vanished) since it was read;
    /// nothing is written in that case.
    pub fn replace_if_unchanged(
        &self,
        expected_expires_at: DateTime<Utc>,
        record: &CredentialRecord,
    ) -> Result<bool> {
        let access = self
            .cipher
            .seal(&record.access_token)
            .context("Failed to encrypt access token")?;
        let refresh = self
            .cipher
            .seal(&record.refresh_token)
            .context("Failed to encrypt refresh token")?;

        let rows_affected = self
            .conn_for(&record.user_id)?
            .execute(
                r#"
                UPDATE credentials SET
                    access_token = ?2,
                    access_token_nonce = ?3,
                    refresh_token = ?4,
                    refresh_token_nonce = ?5,
                    expires_at = ?6,
                    scope = ?7,
                    updated_at = ?8
                WHERE user_id = ?1 AND expires_at = ?9
                "#,
                params![
                    record.user_id,
                    access.ciphertext,
                    access.nonce,
                    refresh.ciphertext,
                    refresh.nonce,
                    format_timestamp(record.expires_at),
                    record.scope,
                    format_timestamp(Utc::now()),
                    format_timestamp(expected_expires_at),
                ],
            )
            .context("Failed to update credentials")?;

        Ok(rows_affected > 0)
    }

    /// Deletes the record for `user_id`.
    ///
    /// Returns `Ok(true)` if a record existed.
    pub fn delete(&self, user_id: &str) -> Result<bool> {
        let rows_affected = self
            .conn_for(user_id)?
            .execute(
                "DELETE FROM credentials WHERE user_id = ?1",
                params![user_id],
            )
            .context("Failed to delete credentials")?;

        Ok(rows_affected > 0)
    }

    /// Lists every identifier that has a stored record.
    pub fn list_users(&self) -> Result<Vec<String>> {
        let conn = lock(&self.connections[0])?;
        let mut stmt = conn
            .prepare("SELECT user_id FROM credentials ORDER BY user_id")
            .context("Failed to prepare query")?;

        let users = stmt
            .query_map([], |row| row.get(0))
            .context("Failed to execute query")?
            .collect::<Result<Vec<String>, _>>()
            .context("Failed to read results")?;

        Ok(users)
    }
}

fn open_connection(db_path: &Path, in_memory: bool) -> Result<Connection> {
    let conn = Connection::open(db_path).context("Failed to open database")?;
    conn.busy_timeout(BUSY_TIMEOUT)
        .context("Failed to set busy timeout")?;

    if !in_memory {
        let mode: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .context("Failed to enable WAL journal")?;
        if !mode.eq_ignore_ascii_case("wal") {
            return Err(anyhow!("Database refused WAL journal mode (got '{}')", mode));
        }
    }

    Ok(conn)
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|_| anyhow!("Credential store connection lock poisoned"))
}

/// Raw (still sealed) column values of one row.
struct StoredRow {
    access: Sealed,
    refresh: Sealed,
    expires_at: String,
    scope: String,
}

impl StoredRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            access: Sealed {
                ciphertext: row.get(0)?,
                nonce: row.get(1)?,
            },
            refresh: Sealed {
                ciphertext: row.get(2)?,
                nonce: row.get(3)?,
            },
            expires_at: row.get(4)?,
            scope: row.get(5)?,
        })
    }

    fn into_record(self, user_id: &str, cipher: &TokenCipher) -> Result<CredentialRecord> {
        let access_token = cipher
            .open(&self.access)
            .context("Failed to decrypt access token")?;
        let refresh_token = cipher
            .open(&self.refresh)
            .context("Failed to decrypt refresh token")?;
        let expires_at = DateTime::parse_from_rfc3339(&self.expires_at)
            .map(|dt| dt.with_timezone(&Utc))
            .context("Failed to parse expires_at timestamp")?;

        Ok(CredentialRecord {
            user_id: user_id.to_string(),
            access_token,
            refresh_token,
            expires_at,
            scope: self.scope,
        })
    }
}

/// Canonical timestamp text. Conditional updates compare this text, so
/// every write and every comparison goes through here.
fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use chrono::Duration;

    fn create_test_store() -> CredentialStore {
        let key = BASE64.encode([0u8; 32]);
        CredentialStore::new(":memory:", &key).expect("Failed to create test store")
    }

    fn create_test_record(user_id: &str) -> CredentialRecord {
        CredentialRecord {
            user_id: user_id.to_string(),
            access_token: "access-token-12345".to_string(),
            refresh_token: "refresh-token-67890".to_string(),
            expires_at: Utc::now() + Duration::hours(1),
            scope: "https://www.googleapis.com/auth/spreadsheets".to_string(),
        }
    }

    #[test]
    fn test_upsert_and_get() {
        let store = create_test_store();
        let record = create_test_record("xyz");

        store.upsert(&record).expect("Failed to store");

        let retrieved = store
            .get("xyz")
            .expect("Failed to get")
            .expect("Record not found");

        assert_eq!(retrieved.user_id, "xyz");
        assert_eq!(retrieved.access_token, record.access_token);
        assert_eq!(retrieved.refresh_token, record.refresh_token);
        assert_eq!(retrieved.scope, record.scope);
        assert_eq!(retrieved.expires_at.timestamp(), record.expires_at.timestamp());
    }

    #[test]
    fn test_get_unknown_user() {
        let store = create_test_store();
        assert!(store.get("nobody").expect("Failed to get").is_none());
    }

    #[test]
    fn test_upsert_replaces_single_record() {
        let store = create_test_store();
        store.upsert(&create_test_record("xyz")).unwrap();

        let replacement = CredentialRecord {
            access_token: "new-access-token".to_string(),
            refresh_token: "new-refresh-token".to_string(),
            ..create_test_record("xyz")
        };
        store.upsert(&replacement).unwrap();

        let retrieved = store.get("xyz").unwrap().unwrap();
        assert_eq!(retrieved.access_token, "new-access-token");
        assert_eq!(retrieved.refresh_token, "new-refresh-token");
        assert_eq!(store.list_users().unwrap(), vec!["xyz".to_string()]);
    }

    #[test]
    fn test_tokens_encrypted_at_rest() {
        let store = create_test_store();
        store.upsert(&create_test_record("xyz")).unwrap();

        let raw: String = store
            .conn_for("xyz")
            .unwrap()
            .query_row(
                "SELECT access_token || refresh_token FROM credentials WHERE user_id = 'xyz'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(!raw.contains("access-token-12345"));
        assert!(!raw.contains("refresh-token-67890"));
    }

    #[test]
    fn test_replace_if_unchanged() {
        let store = create_test_store();
        store.upsert(&create_test_record("xyz")).unwrap();
        let current = store.get("xyz").unwrap().unwrap();

        let refreshed = CredentialRecord {
            access_token: "refreshed".to_string(),
            expires_at: current.expires_at + Duration::hours(1),
            ..current.clone()
        };

        // Matches what was read, so the write goes through
        assert!(store
            .replace_if_unchanged(current.expires_at, &refreshed)
            .unwrap());
        assert_eq!(store.get("xyz").unwrap().unwrap().access_token, "refreshed");

        // Stale expectation is refused and leaves the row alone
        let stale = CredentialRecord {
            access_token: "stale-writer".to_string(),
            ..current.clone()
        };
        assert!(!store.replace_if_unchanged(current.expires_at, &stale).unwrap());
        assert_eq!(store.get("xyz").unwrap().unwrap().access_token, "refreshed");
    }

    #[test]
    fn test_replace_if_unchanged_missing_row() {
        let store = create_test_store();
        let record = create_test_record("ghost");
        assert!(!store
            .replace_if_unchanged(record.expires_at, &record)
            .unwrap());
        assert!(store.get("ghost").unwrap().is_none());
    }

    #[test]
    fn test_delete() {
        let store = create_test_store();
        store.upsert(&create_test_record("xyz")).unwrap();

        assert!(store.delete("xyz").unwrap());
        assert!(store.get("xyz").unwrap().is_none());
        assert!(!store.delete("xyz").unwrap());
    }

    #[test]
    fn test_users_are_isolated() {
        let store = create_test_store();
        store.upsert(&create_test_record("alice")).unwrap();
        store
            .upsert(&CredentialRecord {
                access_token: "bob-token".to_string(),
                ..create_test_record("bob")
            })
            .unwrap();

        assert_eq!(
            store.get("alice").unwrap().unwrap().access_token,
            "access-token-12345"
        );
        assert_eq!(store.get("bob").unwrap().unwrap().access_token, "bob-token");
        assert_eq!(store.list_users().unwrap(), vec!["alice", "bob"]);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.db");
        let key = BASE64.encode([7u8; 32]);

        {
            let store = CredentialStore::new(&path, &key).unwrap();
            store.upsert(&create_test_record("xyz")).unwrap();
        }

        let reopened = CredentialStore::new(&path, &key).unwrap();
        let record = reopened.get("xyz").unwrap().unwrap();
        assert_eq!(record.refresh_token, "refresh-token-67890");
    }

    #[test]
    fn test_file_store_uses_wal_connections() {
        let dir = tempfile::tempdir().unwrap();
        let key = BASE64.encode([7u8; 32]);
        let store = CredentialStore::new(dir.path().join("credentials.db"), &key).unwrap();

        assert_eq!(store.connection_count(), FILE_CONNECTIONS);
        for conn in &store.connections {
            let mode: String = lock(conn)
                .unwrap()
                .query_row("PRAGMA journal_mode", [], |row| row.get(0))
                .unwrap();
            assert_eq!(mode.to_lowercase(), "wal");
        }

        assert_eq!(create_test_store().connection_count(), 1);
    }

    #[test]
    fn test_concurrent_writes_for_different_users() {
        let dir = tempfile::tempdir().unwrap();
        let key = BASE64.encode([7u8; 32]);
        let store = std::sync::Arc::new(
            CredentialStore::new(dir.path().join("credentials.db"), &key).unwrap(),
        );

        let writers: Vec<_> = (0..8)
            .map(|i| {
                let store = std::sync::Arc::clone(&store);
                std::thread::spawn(move || {
                    for round in 0..10 {
                        let mut record = create_test_record(&format!("user-{}", i));
                        record.access_token = format!("token-{}-{}", i, round);
                        store.upsert(&record).unwrap();
                        assert_eq!(
                            store.get(&record.user_id).unwrap().unwrap().access_token,
                            record.access_token
                        );
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        assert_eq!(store.list_users().unwrap().len(), 8);
        assert_eq!(store.get("user-3").unwrap().unwrap().access_token, "token-3-9");
    }

    #[test]
    fn test_invalid_encryption_key() {
        assert!(CredentialStore::new(":memory:", "short").is_err());
        assert!(CredentialStore::new(":memory:", "not-valid-base64!@#$").is_err());
    }
}
