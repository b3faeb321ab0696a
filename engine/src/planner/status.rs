//! File status classification for targeted regeneration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Status of a workspace file relative to the current feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    /// Not on disk yet; must be generated in full.
    New,
    /// In the affected set; must be fixed.
    Error,
    /// On disk and not affected; must not be overwritten.
    Correct,
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Error => write!(f, "error"),
            Self::Correct => write!(f, "correct"),
        }
    }
}

/// Aggregate classification for logging.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusSummary {
    pub new: Vec<String>,
    pub error: Vec<String>,
    pub correct: Vec<String>,
}

impl StatusSummary {
    /// Ratio of files needing work (new + error) to all files.
    pub fn patch_ratio(&self) -> f64 {
        let total = self.new.len() + self.error.len() + self.correct.len();
        if total == 0 {
            return 0.0;
        }
        (self.new.len() + self.error.len()) as f64 / total as f64
    }

    /// One-line rendering for event logs.
    pub fn to_log_line(&self) -> String {
        format!(
            "New: {} | Error: {} | Correct: {} | Patch-Ratio: {:.1}%",
            self.new.len(),
            self.error.len(),
            self.correct.len(),
            self.patch_ratio() * 100.0
        )
    }
}

/// Classifies workspace files as new / error / correct.
#[derive(Debug, Clone)]
pub struct FileStatusDetector {
    project_path: PathBuf,
}

impl FileStatusDetector {
    pub fn new(project_path: impl Into<PathBuf>) -> Self {
        Self {
            project_path: project_path.into(),
        }
    }

    fn full_path(&self, filepath: &str) -> PathBuf {
        let path = Path::new(filepath);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_path.join(filepath)
        }
    }

    /// Status of a single file given the affected set.
    pub fn status_of(&self, filepath: &str, error_files: &[String]) -> FileStatus {
        if !self.full_path(filepath).exists() {
            return FileStatus::New;
        }
        let name = filepath.rsplit('/').next().unwrap_or(filepath);
        let affected = error_files.iter().any(|e| {
            e == filepath || e == name || filepath.ends_with(e.as_str())
        });
        if affected {
            FileStatus::Error
        } else {
            FileStatus::Correct
        }
    }

    /// Files that actually need a coder pass (new or error).
    pub fn files_to_patch(
        &self,
        current_code: &BTreeMap<String, String>,
        error_files: &[String],
    ) -> Vec<String> {
        current_code
            .keys()
            .filter(|path| self.status_of(path, error_files) != FileStatus::Correct)
            .cloned()
            .collect()
    }

    /// Aggregate classification of all files.
    pub fn summarize(
        &self,
        current_code: &BTreeMap<String, String>,
        error_files: &[String],
    ) -> StatusSummary {
        let mut summary = StatusSummary::default();
        for path in current_code.keys() {
            match self.status_of(path, error_files) {
                FileStatus::New => summary.new.push(path.clone()),
                FileStatus::Error => summary.error.push(path.clone()),
                FileStatus::Correct => summary.correct.push(path.clone()),
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace_with(files: &[(&str, &str)]) -> (tempfile::TempDir, BTreeMap<String, String>) {
        let dir = tempfile::tempdir().unwrap();
        let mut map = BTreeMap::new();
        for (path, content) in files {
            let full = dir.path().join(path);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(full, content).unwrap();
            map.insert(path.to_string(), content.to_string());
        }
        (dir, map)
    }

    #[test]
    fn test_status_new_error_correct() {
        let (dir, mut code) = workspace_with(&[("app.py", "x"), ("lib/db.py", "y")]);
        code.insert("notyet.py".to_string(), String::new());
        let detector = FileStatusDetector::new(dir.path());
        let errors = vec!["db.py".to_string()];

        assert_eq!(detector.status_of("notyet.py", &errors), FileStatus::New);
        assert_eq!(detector.status_of("lib/db.py", &errors), FileStatus::Error);
        assert_eq!(detector.status_of("app.py", &errors), FileStatus::Correct);
    }

    #[test]
    fn test_files_to_patch() {
        let (dir, mut code) = workspace_with(&[("app.py", "x"), ("ok.py", "y")]);
        code.insert("new.py".to_string(), String::new());
        let detector = FileStatusDetector::new(dir.path());
        let patch = detector.files_to_patch(&code, &["app.py".to_string()]);
        assert!(patch.contains(&"app.py".to_string()));
        assert!(patch.contains(&"new.py".to_string()));
        assert!(!patch.contains(&"ok.py".to_string()));
    }

    #[test]
    fn test_summary_ratio() {
        let (dir, mut code) = workspace_with(&[("a.py", "1"), ("b.py", "2"), ("c.py", "3")]);
        code.insert("d.py".to_string(), String::new());
        let detector = FileStatusDetector::new(dir.path());
        let summary = detector.summarize(&code, &["a.py".to_string()]);
        assert_eq!(summary.new.len(), 1);
        assert_eq!(summary.error.len(), 1);
        assert_eq!(summary.correct.len(), 2);
        assert!((summary.patch_ratio() - 0.5).abs() < f64::EPSILON);
        assert!(summary.to_log_line().contains("Patch-Ratio: 50.0%"));
    }

    #[test]
    fn test_empty_summary_ratio_zero() {
        let detector = FileStatusDetector::new("/nonexistent");
        let summary = detector.summarize(&BTreeMap::new(), &[]);
        assert_eq!(summary.patch_ratio(), 0.0);
    }
}
