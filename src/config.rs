//! Patching experiment configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PatchError, Result};

/// Settings for a patching run, loadable from JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchingConfig {
    /// Verb form agreeing with the clean (plural) subject
    pub target_correct: String,
    pub target_incorrect: String,
    /// Prepend the tokenizer's BOS token before each sentence
    pub prepend_bos: bool,
    /// Spread heads over the rayon thread pool
    pub parallel: bool,
    /// Heads at or above this percentile of scores are critical
    pub percentile: f64,
}

impl Default for PatchingConfig {
    fn default() -> Self {
        Self {
            target_correct: " are".to_string(),
            target_incorrect: " is".to_string(),
            prepend_bos: true,
            parallel: false,
            percentile: 90.0,
        }
    }
}

impl PatchingConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=100.0).contains(&self.percentile) {
            return Err(PatchError::Config(format!(
                "percentile must be in [0, 100], got {}",
                self.percentile
            )));
        }
        if self.target_correct == self.target_incorrect {
            return Err(PatchError::Config(format!(
                "correct and incorrect targets are both {:?}",
                self.target_correct
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = PatchingConfig::default();
        assert_eq!(config.target_correct, " are");
        assert_eq!(config.target_incorrect, " is");
        assert!(config.prepend_bos);
        assert!(!config.parallel);
        assert_eq!(config.percentile, 90.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"target_correct": " were", "target_incorrect": " was", "parallel": true}}"#)
            .unwrap();
        let config = PatchingConfig::load(file.path()).unwrap();
        assert_eq!(config.target_correct, " were");
        assert!(config.parallel);
        assert_eq!(config.percentile, 90.0);
    }

    #[test]
    fn test_rejects_bad_percentile() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"percentile": 120.0}}"#).unwrap();
        assert!(matches!(
            PatchingConfig::load(file.path()),
            Err(PatchError::Config(_))
        ));
    }
}
