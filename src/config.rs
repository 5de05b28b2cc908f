use anyhow::{Context, Result};
use log::{error, info};
use serde::Deserialize;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Per-challenge settings: which model to load and how mission ids map to
/// the class names that model predicts.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ChallengeConfig {
    #[serde(default)]
    pub model_path: Option<PathBuf>,
    #[serde(default)]
    pub mission_map: HashMap<String, String>,
    /// Class names for models exported without `names` metadata.
    #[serde(default)]
    pub names: Option<Vec<String>>,
}

impl ChallengeConfig {
    pub fn target_class(&self, mission_id: &str) -> Option<&str> {
        self.mission_map
            .get(mission_id)
            .map(String::as_str)
            .filter(|name| !name.is_empty())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModelsConfig {
    source: PathBuf,
    challenges: HashMap<String, ChallengeConfig>,
}

impl ModelsConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                anyhow::bail!("'{}' not found", path.display())
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read '{}'", path.display()))
            }
        };
        let mut config = Self::from_json(&text)
            .with_context(|| format!("'{}' is not valid JSON, check its syntax", path.display()))?;
        config.source = path.to_path_buf();
        Ok(config)
    }

    /// Like [`ModelsConfig::load`], but a missing or broken file is logged
    /// and yields an empty configuration, so the server still answers every
    /// request with a "not loaded" error instead of refusing to start.
    pub fn load_or_empty<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match Self::load(path) {
            Ok(config) => {
                info!("'{}' loaded, {} challenges configured.", path.display(), config.len());
                config
            }
            Err(e) => {
                error!("{e:#}. No model can be served.");
                Self::empty(path)
            }
        }
    }

    /// A configuration with no challenges that reports `path` as its source.
    pub fn empty<P: AsRef<Path>>(path: P) -> Self {
        Self {
            source: path.as_ref().to_path_buf(),
            challenges: HashMap::new(),
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let challenges: HashMap<String, ChallengeConfig> = serde_json::from_str(text)?;
        Ok(Self {
            source: PathBuf::new(),
            challenges,
        })
    }

    pub fn get(&self, challenge_id: &str) -> Option<&ChallengeConfig> {
        self.challenges.get(challenge_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ChallengeConfig)> {
        self.challenges.iter()
    }

    pub fn len(&self) -> usize {
        self.challenges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.challenges.is_empty()
    }

    /// Path the configuration was read from, used in error messages.
    pub fn source(&self) -> &Path {
        &self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "0": {
            "model_path": "./models/hand.onnx",
            "mission_map": { "1": "hand", "2": "cup", "3": "" }
        },
        "7": { "names": ["a", "b"] }
    }"#;

    #[test]
    fn parses_challenges() {
        let config = ModelsConfig::from_json(SAMPLE).unwrap();
        assert_eq!(config.len(), 2);

        let hand = config.get("0").unwrap();
        assert_eq!(hand.model_path.as_deref(), Some(Path::new("./models/hand.onnx")));
        assert_eq!(hand.target_class("1"), Some("hand"));
        assert_eq!(hand.target_class("2"), Some("cup"));
        assert_eq!(hand.target_class("9"), None);

        let bare = config.get("7").unwrap();
        assert!(bare.model_path.is_none());
        assert!(bare.mission_map.is_empty());
        assert_eq!(bare.names.as_ref().map(Vec::len), Some(2));
    }

    #[test]
    fn empty_class_name_is_unmapped() {
        let config = ModelsConfig::from_json(SAMPLE).unwrap();
        assert_eq!(config.get("0").unwrap().target_class("3"), None);
    }

    #[test]
    fn missing_file_is_reported() {
        let err = ModelsConfig::load("/definitely/not/here.json").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn invalid_json_is_reported() {
        let path = std::env::temp_dir().join(format!("snapi-bad-{}.json", std::process::id()));
        std::fs::write(&path, "{ \"0\": ").unwrap();
        let err = ModelsConfig::load(&path).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(err.to_string().contains("not valid JSON"));
    }

    #[test]
    fn unreadable_config_falls_back_to_empty() {
        let config = ModelsConfig::load_or_empty("/definitely/not/here.json");
        assert!(config.is_empty());
        assert_eq!(config.source(), Path::new("/definitely/not/here.json"));

        let path = std::env::temp_dir().join(format!("snapi-broken-{}.json", std::process::id()));
        std::fs::write(&path, "[1, 2").unwrap();
        let config = ModelsConfig::load_or_empty(&path);
        std::fs::remove_file(&path).ok();
        assert!(config.is_empty());
        assert_eq!(config.source(), path.as_path());
    }

    #[test]
    fn load_remembers_source() {
        let path = std::env::temp_dir().join(format!("snapi-ok-{}.json", std::process::id()));
        std::fs::write(&path, SAMPLE).unwrap();
        let config = ModelsConfig::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(config.source(), path.as_path());
    }
}
