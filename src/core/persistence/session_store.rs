// SPDX-License-Identifier: MIT OR Apache-2.0

//! Stores for durable session records.
//!
//! Records are encoded with bincode and, when an [`EncryptionConfig`] is
//! enabled, sealed with AES-256-GCM before they reach storage.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};

use super::session_record::DurableSessionRecord;
use crate::core::error::{CacheError, CacheResult};

const NONCE_LEN: usize = 12;

/// Configuration for encryption
#[derive(Clone)]
pub struct EncryptionConfig {
    pub key: Vec<u8>, // 32 bytes for AES-256
    pub enabled: bool,
}

impl EncryptionConfig {
    pub fn new(key: Vec<u8>) -> Self {
        Self { key, enabled: true }
    }

    pub fn disabled() -> Self {
        Self {
            key: vec![],
            enabled: false,
        }
    }
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self::disabled()
    }
}

impl std::fmt::Debug for EncryptionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionConfig")
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

fn cipher(config: &EncryptionConfig) -> CacheResult<Aes256Gcm> {
    Aes256Gcm::new_from_slice(&config.key).map_err(|_| {
        CacheError::configuration(format!(
            "encryption key must be 32 bytes, got {}",
            config.key.len()
        ))
    })
}

/// Encrypt data using AES-256-GCM. The random nonce is prepended.
pub fn encrypt_data(data: &[u8], config: &EncryptionConfig) -> CacheResult<Vec<u8>> {
    if !config.enabled {
        return Ok(data.to_vec());
    }
    let cipher = cipher(config)?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, data)
        .map_err(|_| CacheError::persistence("failed to encrypt session record"))?;
    let mut result = nonce_bytes.to_vec();
    result.extend(ciphertext);
    Ok(result)
}

/// Decrypt data using AES-256-GCM
pub fn decrypt_data(data: &[u8], config: &EncryptionConfig) -> CacheResult<Vec<u8>> {
    if !config.enabled {
        return Ok(data.to_vec());
    }
    if data.len() < NONCE_LEN {
        return Err(CacheError::persistence("invalid encrypted data"));
    }
    let cipher = cipher(config)?;
    let nonce = Nonce::from_slice(&data[..NONCE_LEN]);
    cipher
        .decrypt(nonce, &data[NONCE_LEN..])
        .map_err(|_| CacheError::persistence("failed to decrypt session record: wrong key or corrupt data"))
}

/// Keeps the latest record per durable session.
pub trait SessionStore: Send + Sync {
    /// Insert or replace the record for `record.session_id`.
    fn save(&self, record: &DurableSessionRecord) -> CacheResult<()>;

    fn load(&self, session_id: &str) -> CacheResult<Option<DurableSessionRecord>>;

    /// Deleting an absent record is not an error.
    fn delete(&self, session_id: &str) -> CacheResult<()>;

    fn session_ids(&self) -> CacheResult<Vec<String>>;

    fn load_all(&self) -> CacheResult<Vec<DurableSessionRecord>> {
        let mut records = Vec::new();
        for id in self.session_ids()? {
            if let Some(record) = self.load(&id)? {
                records.push(record);
            }
        }
        Ok(records)
    }
}

fn seal(record: &DurableSessionRecord, config: &EncryptionConfig) -> CacheResult<Vec<u8>> {
    encrypt_data(&record.encode()?, config)
}

fn open(data: &[u8], config: &EncryptionConfig) -> CacheResult<DurableSessionRecord> {
    DurableSessionRecord::decode(&decrypt_data(data, config)?)
}

/// Very small in-memory implementation useful for tests.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    records: Mutex<HashMap<String, Vec<u8>>>,
    encryption: EncryptionConfig,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_encryption(encryption: EncryptionConfig) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            encryption,
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("session store poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionStore for InMemorySessionStore {
    fn save(&self, record: &DurableSessionRecord) -> CacheResult<()> {
        let sealed = seal(record, &self.encryption)?;
        self.records
            .lock()
            .expect("session store poisoned")
            .insert(record.session_id.clone(), sealed);
        Ok(())
    }

    fn load(&self, session_id: &str) -> CacheResult<Option<DurableSessionRecord>> {
        let data = self
            .records
            .lock()
            .expect("session store poisoned")
            .get(session_id)
            .cloned();
        data.map(|d| open(&d, &self.encryption)).transpose()
    }

    fn delete(&self, session_id: &str) -> CacheResult<()> {
        self.records
            .lock()
            .expect("session store poisoned")
            .remove(session_id);
        Ok(())
    }

    fn session_ids(&self) -> CacheResult<Vec<String>> {
        let mut ids: Vec<String> = self
            .records
            .lock()
            .expect("session store poisoned")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        Ok(ids)
    }
}

/// One file per session under a base directory. File names are the
/// hex-encoded session id, so any identity is a safe file name.
#[derive(Debug)]
pub struct FileSessionStore {
    base: PathBuf,
    encryption: EncryptionConfig,
}

const RECORD_EXTENSION: &str = "session";

impl FileSessionStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> CacheResult<Self> {
        Self::with_encryption(path, EncryptionConfig::disabled())
    }

    pub fn with_encryption<P: Into<PathBuf>>(path: P, encryption: EncryptionConfig) -> CacheResult<Self> {
        let base = path.into();
        fs::create_dir_all(&base)?;
        Ok(Self { base, encryption })
    }

    fn file_path(&self, session_id: &str) -> PathBuf {
        self.base
            .join(format!("{}.{RECORD_EXTENSION}", hex_encode(session_id)))
    }
}

impl SessionStore for FileSessionStore {
    fn save(&self, record: &DurableSessionRecord) -> CacheResult<()> {
        let sealed = seal(record, &self.encryption)?;
        let path = self.file_path(&record.session_id);
        // Write then rename so a crash never leaves a torn record
        let tmp = path.with_extension(format!("{RECORD_EXTENSION}.tmp"));
        fs::write(&tmp, sealed)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn load(&self, session_id: &str) -> CacheResult<Option<DurableSessionRecord>> {
        match fs::read(self.file_path(session_id)) {
            Ok(data) => open(&data, &self.encryption).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, session_id: &str) -> CacheResult<()> {
        match fs::remove_file(self.file_path(session_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn session_ids(&self) -> CacheResult<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.base)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            match path.file_stem().and_then(|s| s.to_str()).and_then(hex_decode) {
                Some(id) => ids.push(id),
                None => log::warn!("ignoring unrecognised file {}", path.display()),
            }
        }
        ids.sort();
        Ok(ids)
    }
}

fn hex_encode(value: &str) -> String {
    value.bytes().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(value: &str) -> Option<String> {
    if value.len() % 2 != 0 {
        return None;
    }
    let bytes = (0..value.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(value.get(i..i + 2)?, 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok()
}

/// SQLite-backed store; one row per session.
pub struct SqliteSessionStore {
    conn: Mutex<Connection>,
    encryption: EncryptionConfig,
}

impl SqliteSessionStore {
    pub fn new<P: AsRef<Path>>(path: P) -> CacheResult<Self> {
        Self::with_encryption(path, EncryptionConfig::disabled())
    }

    pub fn with_encryption<P: AsRef<Path>>(path: P, encryption: EncryptionConfig) -> CacheResult<Self> {
        let conn = Connection::open(path).map_err(sqlite_error)?;
        Self::from_connection(conn, encryption)
    }

    pub fn in_memory() -> CacheResult<Self> {
        let conn = Connection::open_in_memory().map_err(sqlite_error)?;
        Self::from_connection(conn, EncryptionConfig::disabled())
    }

    fn from_connection(conn: Connection, encryption: EncryptionConfig) -> CacheResult<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS durable_sessions (
                session_id TEXT PRIMARY KEY,
                data BLOB NOT NULL,
                saved_at INTEGER NOT NULL
            )",
            [],
        )
        .map_err(sqlite_error)?;
        Ok(Self {
            conn: Mutex::new(conn),
            encryption,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("sqlite connection poisoned")
    }
}

fn sqlite_error(e: rusqlite::Error) -> CacheError {
    CacheError::persistence_with_source("sqlite session store failure", Box::new(e))
}

impl SessionStore for SqliteSessionStore {
    fn save(&self, record: &DurableSessionRecord) -> CacheResult<()> {
        let sealed = seal(record, &self.encryption)?;
        self.lock()
            .execute(
                "INSERT OR REPLACE INTO durable_sessions(session_id, data, saved_at) VALUES (?1, ?2, ?3)",
                params![record.session_id, sealed, record.saved_at],
            )
            .map_err(sqlite_error)?;
        Ok(())
    }

    fn load(&self, session_id: &str) -> CacheResult<Option<DurableSessionRecord>> {
        let data: Option<Vec<u8>> = self
            .lock()
            .query_row(
                "SELECT data FROM durable_sessions WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(sqlite_error)?;
        data.map(|d| open(&d, &self.encryption)).transpose()
    }

    fn delete(&self, session_id: &str) -> CacheResult<()> {
        self.lock()
            .execute(
                "DELETE FROM durable_sessions WHERE session_id = ?1",
                params![session_id],
            )
            .map_err(sqlite_error)?;
        Ok(())
    }

    fn session_ids(&self) -> CacheResult<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT session_id FROM durable_sessions ORDER BY session_id")
            .map_err(sqlite_error)?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(sqlite_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sqlite_error)?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::queue::QueueSnapshot;
    use std::time::Duration;

    fn record(id: &str) -> DurableSessionRecord {
        DurableSessionRecord::new(
            id,
            Duration::from_secs(60),
            QueueSnapshot {
                next_sequence: 1,
                last_acknowledged: 0,
                events: Vec::new(),
            },
            Vec::new(),
            Vec::new(),
        )
    }

    fn exercise(store: &dyn SessionStore) {
        store.save(&record("b/with slash")).unwrap();
        store.save(&record("a")).unwrap();
        assert_eq!(
            store.session_ids().unwrap(),
            vec!["a".to_string(), "b/with slash".to_string()]
        );
        assert_eq!(
            store.load("b/with slash").unwrap().unwrap().session_id,
            "b/with slash"
        );
        assert!(store.load("missing").unwrap().is_none());

        store.delete("a").unwrap();
        store.delete("a").unwrap();
        assert_eq!(store.load_all().unwrap().len(), 1);
    }

    #[test]
    fn test_encrypt_decrypt_enabled() {
        let config = EncryptionConfig::new(vec![7u8; 32]);
        let data = b"durable-1";
        let encrypted = encrypt_data(data, &config).unwrap();
        assert_ne!(encrypted, data.to_vec());
        assert_eq!(decrypt_data(&encrypted, &config).unwrap(), data.to_vec());
    }

    #[test]
    fn test_wrong_key_fails() {
        let encrypted = encrypt_data(b"x", &EncryptionConfig::new(vec![1u8; 32])).unwrap();
        assert!(decrypt_data(&encrypted, &EncryptionConfig::new(vec![2u8; 32])).is_err());
    }

    #[test]
    fn test_short_key_is_configuration_error() {
        let err = encrypt_data(b"x", &EncryptionConfig::new(vec![1u8; 8])).unwrap_err();
        assert!(matches!(err, CacheError::Configuration { .. }));
    }

    #[test]
    fn test_in_memory_store() {
        exercise(&InMemorySessionStore::with_encryption(EncryptionConfig::new(
            vec![3u8; 32],
        )));
    }

    #[test]
    fn test_file_store() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&FileSessionStore::new(dir.path()).unwrap());
    }

    #[test]
    fn test_sqlite_store() {
        exercise(&SqliteSessionStore::in_memory().unwrap());
    }

    #[test]
    fn test_hex_names() {
        assert_eq!(hex_decode(&hex_encode("durable-1/ü")).as_deref(), Some("durable-1/ü"));
        assert_eq!(hex_decode("zz"), None);
    }
}
