//! Persisted Preferences
//!
//! A single numeric preference (view sensitivity), stored as JSON under a
//! fixed key. Loaded at startup, saved at shutdown.

use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Key the sensitivity value is stored under.
pub const SENSITIVITY_KEY: &str = "sensitivity";

/// Default view sensitivity.
pub const DEFAULT_SENSITIVITY: f32 = 1.0;

/// Preference errors.
#[derive(Debug, Error)]
pub enum PrefsError {
    /// Reading or writing the file failed.
    #[error("preferences I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The file exists but is not valid JSON.
    #[error("preferences format error: {0}")]
    Format(#[from] serde_json::Error),
}

/// User preferences.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Preferences {
    sensitivity: f32,
}

impl Default for Preferences {
    fn default() -> Self {
        Self { sensitivity: DEFAULT_SENSITIVITY }
    }
}

impl Preferences {
    /// Load from `path`. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, PrefsError> {
        if !path.exists() {
            debug!("No preferences at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path)?;
        let values: BTreeMap<String, f32> = serde_json::from_str(&text)?;

        let mut prefs = Self::default();
        if let Some(sensitivity) = values.get(SENSITIVITY_KEY) {
            prefs.set_sensitivity(*sensitivity);
        }
        Ok(prefs)
    }

    /// Save to `path`.
    pub fn save(&self, path: &Path) -> Result<(), PrefsError> {
        let mut values = BTreeMap::new();
        values.insert(SENSITIVITY_KEY.to_string(), self.sensitivity);
        std::fs::write(path, serde_json::to_string_pretty(&values)?)?;
        Ok(())
    }

    /// Current sensitivity.
    pub fn sensitivity(&self) -> f32 {
        self.sensitivity
    }

    /// Set sensitivity. Negative and non-finite values clamp to zero.
    pub fn set_sensitivity(&mut self, value: f32) {
        self.sensitivity = if value.is_finite() { value.max(0.0) } else { 0.0 };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("session-arbiter-{}-{}.json", name, uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_missing_file_is_default() {
        let prefs = Preferences::load(&temp_path("missing")).unwrap();
        assert_eq!(prefs.sensitivity(), DEFAULT_SENSITIVITY);
    }

    #[test]
    fn test_save_then_load() {
        let path = temp_path("saved");
        let mut prefs = Preferences::default();
        prefs.set_sensitivity(2.5);
        prefs.save(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains(SENSITIVITY_KEY));

        let loaded = Preferences::load(&path).unwrap();
        assert_eq!(loaded.sensitivity(), 2.5);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_negative_sensitivity_clamped() {
        let mut prefs = Preferences::default();
        prefs.set_sensitivity(-3.0);
        assert_eq!(prefs.sensitivity(), 0.0);
        prefs.set_sensitivity(f32::NAN);
        assert_eq!(prefs.sensitivity(), 0.0);
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let path = temp_path("corrupt");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(Preferences::load(&path), Err(PrefsError::Format(_))));
        let _ = std::fs::remove_file(&path);
    }
}
