//! The at-rest memory document and its store.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::crypto::{decrypt_payload, encrypt_payload, EncryptionKey, MemoryCryptoError};
use super::learning::{action_for_pattern, extract_error_pattern, is_duplicate_lesson};

/// Word-overlap ratio at which two lessons count as duplicates.
const DEDUP_THRESHOLD: f64 = 0.6;

/// Lesson counts at which severity markers escalate.
const CRITICAL_COUNT: u32 = 5;
const MEDIUM_COUNT: u32 = 2;

/// Errors from the memory store.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("memory I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("memory document malformed: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error(transparent)]
    Crypto(#[from] MemoryCryptoError),

    #[error("background save task failed: {0}")]
    Join(String),
}

/// Kind of a major-event history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    CodePreview,
    ReviewVerdict,
    SandboxOutcome,
    Plan,
    RootCause,
}

/// Append-only log entry for major run events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub kind: HistoryKind,
    pub preview: String,
    pub timestamp: DateTime<Utc>,
}

/// A learned lesson, deduplicated by pattern similarity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lesson {
    pub pattern: String,
    pub category: String,
    pub action: String,
    pub tags: Vec<String>,
    pub count: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_fix: Option<String>,
}

/// A forbidden module with its recommended alternative. Rendered verbatim
/// into the coder prompt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvironmentConstraint {
    pub forbidden_module: String,
    pub alternative: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// The on-disk memory document. Missing keys default to empty collections
/// so older files keep loading.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MemoryDocument {
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub lessons: Vec<Lesson>,
    #[serde(default)]
    pub known_data_sources: Vec<serde_json::Value>,
    #[serde(default)]
    pub domain_vocabulary: Vec<String>,
    #[serde(default)]
    pub environment_constraints: Vec<EnvironmentConstraint>,
}

/// Single-writer store for the memory document.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    path: PathBuf,
    key: Option<EncryptionKey>,
}

impl MemoryStore {
    /// Create a store at `path` without encryption.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            key: None,
        }
    }

    /// Create a store with an encryption key; files are written in the
    /// sentinel format and read in either format.
    pub fn with_encryption(path: impl Into<PathBuf>, key: EncryptionKey) -> Self {
        Self {
            path: path.into(),
            key: Some(key),
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the current snapshot. A missing file yields an empty document.
    pub fn load(&self) -> Result<MemoryDocument, MemoryError> {
        if !self.path.exists() {
            return Ok(MemoryDocument::default());
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let plain = decrypt_payload(&raw, self.key.as_ref())?;
        Ok(serde_json::from_str(&plain)?)
    }

    /// Save a snapshot atomically: serialize, write to a sibling temp file,
    /// rename over the target. Creates parent directories.
    pub fn save(&self, document: &MemoryDocument) -> Result<(), MemoryError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(document)?;
        let payload = match &self.key {
            Some(key) => encrypt_payload(&json, key)?,
            None => json,
        };

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, payload)?;
        std::fs::rename(&tmp_path, &self.path)?;
        debug!(path = %self.path.display(), "memory saved");
        Ok(())
    }

    /// Save without blocking the cooperative scheduler of the caller.
    pub async fn save_async(&self, document: MemoryDocument) -> Result<(), MemoryError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.save(&document))
            .await
            .map_err(|e| MemoryError::Join(e.to_string()))?
    }

    /// Append a major-event history entry and persist.
    pub fn record_history(&self, kind: HistoryKind, preview: &str) -> Result<(), MemoryError> {
        let mut document = self.load()?;
        document.history.push(HistoryEntry {
            kind,
            preview: preview.chars().take(500).collect(),
            timestamp: Utc::now(),
        });
        self.save(&document)
    }

    /// Learn from a raw error: extract the core pattern, deduplicate, and
    /// either bump the existing lesson or insert a new one with a generated
    /// action. Returns a short status string for logging.
    pub fn learn_from_error(&self, raw_error: &str, tags: &[String]) -> Result<String, MemoryError> {
        if raw_error.trim().is_empty() {
            return Ok("Kein Fehler zum Lernen angegeben.".to_string());
        }

        let mut document = self.load()?;

        let mut pattern = extract_error_pattern(raw_error);
        if pattern.is_empty() {
            pattern = raw_error.chars().take(100).collect();
        }
        let pattern_lower = pattern.to_lowercase();
        let pattern_head: String = pattern_lower.chars().take(50).collect();

        // Exact-ish duplicate: bump count and last_seen.
        for lesson in &mut document.lessons {
            let existing = lesson.pattern.to_lowercase();
            if existing.is_empty() {
                continue;
            }
            if pattern_lower.contains(&existing) || existing.contains(&pattern_head) {
                lesson.count += 1;
                lesson.last_seen = Utc::now();
                let head: String = lesson.pattern.chars().take(50).collect();
                self.save(&document)?;
                return Ok(format!("Bekannter Fehler aktualisiert: {head}..."));
            }
        }

        // Fuzzy duplicate: skip.
        if is_duplicate_lesson(&document.lessons, &pattern, DEDUP_THRESHOLD) {
            return Ok("Aehnlicher Fehler bereits bekannt - uebersprungen.".to_string());
        }

        let action = action_for_pattern(&pattern);
        let now = Utc::now();
        let stored_pattern: String = pattern.chars().take(100).collect();
        document.lessons.push(Lesson {
            pattern: stored_pattern.clone(),
            category: "error".to_string(),
            action,
            tags: if tags.is_empty() {
                vec!["global".to_string()]
            } else {
                tags.to_vec()
            },
            count: 1,
            first_seen: now,
            last_seen: now,
            suggested_fix: None,
        });
        self.save(&document)?;

        let head: String = stored_pattern.chars().take(50).collect();
        Ok(format!("Neue Lektion gelernt: {head}..."))
    }

    /// Render the lessons relevant to `tech_tag` as a prioritized bullet
    /// list for prompt injection. Lessons tagged `global` are always
    /// included; sorted by count descending; capped at `limit`.
    pub fn get_lessons_for_prompt(
        &self,
        tech_tag: &str,
        limit: usize,
    ) -> Result<String, MemoryError> {
        let document = self.load()?;
        let tag_lower = tech_tag.to_lowercase();

        let mut relevant: Vec<&Lesson> = document
            .lessons
            .iter()
            .filter(|l| {
                l.tags.iter().any(|t| {
                    let t = t.to_lowercase();
                    t == "global" || t == tag_lower
                })
            })
            .collect();
        relevant.sort_by(|a, b| b.count.cmp(&a.count));
        relevant.truncate(limit);

        if relevant.is_empty() {
            return Ok(String::new());
        }

        let mut lines = vec!["GELERNTE LEKTIONEN (nach Haeufigkeit priorisiert):".to_string()];
        for lesson in relevant {
            let severity = if lesson.count >= CRITICAL_COUNT {
                "CRITICAL"
            } else if lesson.count >= MEDIUM_COUNT {
                "MEDIUM"
            } else {
                "LOW"
            };
            lines.push(format!(
                "- [{severity}] {} ({}x gesehen)",
                lesson.action, lesson.count
            ));
            if let Some(fix) = &lesson.suggested_fix {
                lines.push(format!("  FIX: {fix}"));
            }
        }
        Ok(lines.join("\n"))
    }

    /// Render the environment-constraints block verbatim for the coder
    /// prompt. Empty string when there are none.
    pub fn get_constraints_for_prompt(&self) -> Result<String, MemoryError> {
        let document = self.load()?;
        if document.environment_constraints.is_empty() {
            return Ok(String::new());
        }
        let mut lines = vec!["UMGEBUNGS-CONSTRAINTS (verbindlich):".to_string()];
        for constraint in &document.environment_constraints {
            let mut line = format!(
                "- VERBOTEN: {} -> NUTZE: {}",
                constraint.forbidden_module, constraint.alternative
            );
            if let Some(note) = &constraint.note {
                line.push_str(&format!(" ({note})"));
            }
            lines.push(line);
        }
        Ok(lines.join("\n"))
    }
}

/// Fire-and-forget learn used from hot paths: failures are logged as
/// warnings, never propagated.
pub async fn learn_from_error_nonblocking(store: MemoryStore, raw_error: String, tags: Vec<String>) {
    let result =
        tokio::task::spawn_blocking(move || store.learn_from_error(&raw_error, &tags)).await;
    match result {
        Ok(Ok(status)) => debug!(status, "memory learning completed"),
        Ok(Err(e)) => warn!(error = %e, "memory learning failed"),
        Err(e) => warn!(error = %e, "memory learning task panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;

    fn temp_store() -> (tempfile::TempDir, MemoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path().join("memory").join("global_memory.json"));
        (dir, store)
    }

    #[test]
    fn test_load_missing_file_defaults() {
        let (_dir, store) = temp_store();
        let document = store.load().unwrap();
        assert!(document.history.is_empty());
        assert!(document.lessons.is_empty());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let (_dir, store) = temp_store();
        let mut document = MemoryDocument::default();
        document.domain_vocabulary.push("Kanban".to_string());
        store.save(&document).unwrap();
        assert_eq!(store.load().unwrap(), document);
    }

    #[test]
    fn test_missing_keys_default() {
        let (_dir, store) = temp_store();
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(store.path(), r#"{"history": []}"#).unwrap();
        let document = store.load().unwrap();
        assert!(document.lessons.is_empty());
        assert!(document.environment_constraints.is_empty());
    }

    #[test]
    fn test_encrypted_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let key = EncryptionKey::from_base64(&BASE64.encode([3u8; 32])).unwrap();
        let store = MemoryStore::with_encryption(dir.path().join("mem.json"), key);

        let mut document = MemoryDocument::default();
        document.domain_vocabulary.push("secret".to_string());
        store.save(&document).unwrap();

        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(raw.starts_with("ENCRYPTED:"));
        assert!(!raw.contains("secret"));

        assert_eq!(store.load().unwrap(), document);
    }

    #[test]
    fn test_learn_new_lesson() {
        let (_dir, store) = temp_store();
        let status = store
            .learn_from_error(
                "ModuleNotFoundError: No module named 'flask'",
                &["global".to_string(), "python".to_string()],
            )
            .unwrap();
        assert!(status.starts_with("Neue Lektion gelernt"));

        let document = store.load().unwrap();
        assert_eq!(document.lessons.len(), 1);
        assert_eq!(document.lessons[0].count, 1);
        assert!(document.lessons[0].action.contains("requirements.txt"));
    }

    #[test]
    fn test_learn_duplicate_bumps_count() {
        let (_dir, store) = temp_store();
        store
            .learn_from_error("ModuleNotFoundError: No module named 'flask'", &[])
            .unwrap();
        let status = store
            .learn_from_error("ModuleNotFoundError: No module named 'flask'", &[])
            .unwrap();
        assert!(status.starts_with("Bekannter Fehler aktualisiert"));

        let document = store.load().unwrap();
        assert_eq!(document.lessons.len(), 1);
        assert_eq!(document.lessons[0].count, 2);
    }

    #[test]
    fn test_learn_empty_error() {
        let (_dir, store) = temp_store();
        let status = store.learn_from_error("  ", &[]).unwrap();
        assert_eq!(status, "Kein Fehler zum Lernen angegeben.");
        assert!(store.load().unwrap().lessons.is_empty());
    }

    #[test]
    fn test_lessons_for_prompt_filters_and_sorts() {
        let (_dir, store) = temp_store();
        let now = Utc::now();
        let mut document = MemoryDocument::default();
        document.lessons.push(Lesson {
            pattern: "a".into(),
            category: "error".into(),
            action: "rare python issue".into(),
            tags: vec!["python".into()],
            count: 1,
            first_seen: now,
            last_seen: now,
            suggested_fix: None,
        });
        document.lessons.push(Lesson {
            pattern: "b".into(),
            category: "error".into(),
            action: "frequent global issue".into(),
            tags: vec!["global".into()],
            count: 7,
            first_seen: now,
            last_seen: now,
            suggested_fix: Some("do the thing".into()),
        });
        document.lessons.push(Lesson {
            pattern: "c".into(),
            category: "error".into(),
            action: "javascript only".into(),
            tags: vec!["javascript".into()],
            count: 3,
            first_seen: now,
            last_seen: now,
            suggested_fix: None,
        });
        store.save(&document).unwrap();

        let rendered = store.get_lessons_for_prompt("python", 15).unwrap();
        assert!(rendered.contains("[CRITICAL] frequent global issue"));
        assert!(rendered.contains("[LOW] rare python issue"));
        assert!(rendered.contains("FIX: do the thing"));
        assert!(!rendered.contains("javascript only"));
        // Sorted by count descending: the global lesson comes first.
        assert!(rendered.find("frequent").unwrap() < rendered.find("rare").unwrap());
    }

    #[test]
    fn test_constraints_rendered_verbatim() {
        let (_dir, store) = temp_store();
        let mut document = MemoryDocument::default();
        document.environment_constraints.push(EnvironmentConstraint {
            forbidden_module: "better-sqlite3".into(),
            alternative: "sqlite3 (builtin)".into(),
            note: Some("native build fails in the container".into()),
        });
        store.save(&document).unwrap();

        let rendered = store.get_constraints_for_prompt().unwrap();
        assert!(rendered.contains("VERBOTEN: better-sqlite3"));
        assert!(rendered.contains("NUTZE: sqlite3 (builtin)"));
        assert!(rendered.contains("native build fails"));
    }

    #[tokio::test]
    async fn test_save_async() {
        let (_dir, store) = temp_store();
        let mut document = MemoryDocument::default();
        document.domain_vocabulary.push("async".to_string());
        store.save_async(document.clone()).await.unwrap();
        assert_eq!(store.load().unwrap(), document);
    }

    #[test]
    fn test_record_history() {
        let (_dir, store) = temp_store();
        store
            .record_history(HistoryKind::SandboxOutcome, "❌ tests failed")
            .unwrap();
        let document = store.load().unwrap();
        assert_eq!(document.history.len(), 1);
        assert_eq!(document.history[0].kind, HistoryKind::SandboxOutcome);
    }
}
