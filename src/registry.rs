use log::{error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::ModelsConfig;
use crate::model::{Detector, DetectorConfig, YOLO};

pub type SharedDetector = Arc<Mutex<Box<dyn Detector>>>;

/// Detectors loaded at startup, keyed by challenge id.
#[derive(Clone, Default)]
pub struct ModelRegistry {
    models: HashMap<String, SharedDetector>,
}

impl ModelRegistry {
    /// Loads every configured model that exists on disk. Challenges whose
    /// model is missing or fails to load are skipped, not fatal.
    pub fn load(config: &ModelsConfig, detector: &DetectorConfig) -> Self {
        let mut registry = Self::default();
        for (challenge_id, challenge) in config.iter() {
            let path = match &challenge.model_path {
                Some(path) if path.exists() => path,
                _ => {
                    warn!("Challenge '{challenge_id}' has no model path or the file does not exist");
                    continue;
                }
            };
            match YOLO::new(path, detector, challenge.names.as_deref()) {
                Ok(model) => {
                    info!("Challenge '{challenge_id}': model '{}' loaded", path.display());
                    registry.insert(challenge_id.clone(), Box::new(model));
                }
                Err(e) => error!("Challenge '{challenge_id}': failed to load model: {e:#}"),
            }
        }
        registry
    }

    pub fn insert(&mut self, challenge_id: impl Into<String>, detector: Box<dyn Detector>) {
        self.models
            .insert(challenge_id.into(), Arc::new(Mutex::new(detector)));
    }

    pub fn get(&self, challenge_id: &str) -> Option<SharedDetector> {
        self.models.get(challenge_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
