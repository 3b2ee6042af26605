// SPDX-License-Identifier: MIT OR Apache-2.0

//! Durable session records and the stores that keep them.

pub mod session_record;
pub mod session_store;

pub use session_record::{DurableQueryRecord, DurableSessionRecord, RECORD_VERSION};
pub use session_store::{
    decrypt_data, encrypt_data, EncryptionConfig, FileSessionStore, InMemorySessionStore,
    SessionStore, SqliteSessionStore,
};
