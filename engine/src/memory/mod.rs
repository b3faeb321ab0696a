//! Persistent memory: lessons, constraints, history.
//!
//! A single JSON document at a configured path survives runs. Writes are
//! atomic (write-temp-then-rename); the store is the only writer. With
//! encryption enabled the on-disk payload is the `ENCRYPTED:` sentinel
//! followed by the base64 ciphertext of the JSON bytes.

mod crypto;
mod learning;
mod store;

pub use crypto::{decrypt_payload, encrypt_payload, EncryptionKey, MemoryCryptoError};
pub use learning::{
    action_for_pattern, extract_error_pattern, generate_tags, is_duplicate_lesson, word_overlap,
};
pub use store::{
    learn_from_error_nonblocking, EnvironmentConstraint, HistoryEntry, HistoryKind, Lesson,
    MemoryDocument, MemoryError, MemoryStore,
};
