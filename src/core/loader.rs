//! Payload resolution: cache first, then fetch + parse + validate.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, info};

use crate::core::cache_man::CacheManager;
use crate::entities::{AnimationPayload, EngineError, PayloadError, PayloadSource};

/// Why `load()` failed
#[derive(Debug, Clone, PartialEq)]
pub enum LoadError {
    MissingContainer,
    MissingPayload,
    Fetch(String),
    Parse(String),
    Invalid(PayloadError),
    Engine(EngineError),
    /// Instance was destroyed; it cannot be loaded again
    Destroyed,
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::MissingContainer => write!(f, "No container configured"),
            LoadError::MissingPayload => write!(f, "No payload source configured"),
            LoadError::Fetch(e) => write!(f, "Fetch failed: {}", e),
            LoadError::Parse(e) => write!(f, "Payload parse failed: {}", e),
            LoadError::Invalid(e) => write!(f, "Invalid payload: {}", e),
            LoadError::Engine(e) => write!(f, "{}", e),
            LoadError::Destroyed => write!(f, "Instance destroyed"),
        }
    }
}

impl std::error::Error for LoadError {}

impl From<EngineError> for LoadError {
    fn from(e: EngineError) -> Self {
        LoadError::Engine(e)
    }
}

impl From<PayloadError> for LoadError {
    fn from(e: PayloadError) -> Self {
        LoadError::Invalid(e)
    }
}

/// Retrieves raw payload text for a source path
pub trait PayloadFetcher: Send + Sync {
    fn fetch(&self, path: &str) -> Result<String>;
}

/// Reads payloads from the local filesystem, relative to a base directory
#[derive(Debug, Clone, Default)]
pub struct FsFetcher {
    base_dir: Option<PathBuf>,
}

impl FsFetcher {
    pub fn new(base_dir: Option<PathBuf>) -> Self {
        Self { base_dir }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        match &self.base_dir {
            Some(base) => base.join(path),
            None => PathBuf::from(path),
        }
    }
}

impl PayloadFetcher for FsFetcher {
    fn fetch(&self, path: &str) -> Result<String> {
        let full = self.resolve(path);
        std::fs::read_to_string(&full)
            .with_context(|| format!("Failed to read payload {}", full.display()))
    }
}

/// Cache-aware payload loader shared by all instances
pub struct PayloadLoader {
    cache: Option<Arc<CacheManager<AnimationPayload>>>,
    fetcher: Arc<dyn PayloadFetcher>,
}

impl PayloadLoader {
    pub fn new(cache: Option<Arc<CacheManager<AnimationPayload>>>, fetcher: Arc<dyn PayloadFetcher>) -> Self {
        Self { cache, fetcher }
    }

    /// Resolve a source into a validated, shareable payload
    pub fn resolve(&self, source: &PayloadSource) -> Result<Arc<AnimationPayload>, LoadError> {
        match source {
            PayloadSource::Inline(payload) => {
                payload.validate()?;
                Ok(Arc::clone(payload))
            }
            PayloadSource::Path(path) => {
                if let Some(cached) = self.cache.as_ref().and_then(|c| c.get(path)) {
                    debug!("PayloadLoader: cache hit for {}", path);
                    return Ok(cached);
                }

                let text = self
                    .fetcher
                    .fetch(path)
                    .map_err(|e| LoadError::Fetch(format!("{:#}", e)))?;
                let payload = AnimationPayload::from_json(&text).map_err(|e| LoadError::Parse(e.to_string()))?;
                payload.validate()?;
                let payload = Arc::new(payload);

                info!(
                    "Loaded payload {} ('{}', {} frames @ {} fps, {} bytes)",
                    path,
                    payload.name(),
                    payload.total_frames(),
                    payload.fr,
                    text.len()
                );

                if let Some(cache) = &self.cache {
                    if !cache.set(path.clone(), Arc::clone(&payload)) {
                        debug!("PayloadLoader: {} not cached (exceeds budget)", path);
                    }
                }
                Ok(payload)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::ManualClock;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory fetcher counting requests
    #[derive(Default)]
    struct MapFetcher {
        files: HashMap<String, String>,
        requests: Mutex<usize>,
    }

    impl PayloadFetcher for MapFetcher {
        fn fetch(&self, path: &str) -> Result<String> {
            *self.requests.lock().unwrap() += 1;
            self.files
                .get(path)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("404: {}", path))
        }
    }

    fn payload_json() -> String {
        serde_json::to_string(&AnimationPayload::synthetic("dot", 30.0, 60.0, 100, 100)).unwrap()
    }

    #[test]
    fn test_cache_consulted_before_fetch() {
        let mut fetcher = MapFetcher::default();
        fetcher.files.insert("dot.json".into(), payload_json());
        let fetcher = Arc::new(fetcher);
        let cache = Arc::new(CacheManager::new(1 << 20, 60_000.0, Arc::new(ManualClock::new())));
        let loader = PayloadLoader::new(Some(Arc::clone(&cache)), fetcher.clone());

        let source = PayloadSource::Path("dot.json".into());
        let first = loader.resolve(&source).unwrap();
        let second = loader.resolve(&source).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*fetcher.requests.lock().unwrap(), 1);
        assert_eq!(cache.hit_rate(), 0.5);
    }

    #[test]
    fn test_errors_mapped() {
        let mut fetcher = MapFetcher::default();
        fetcher.files.insert("bad.json".into(), "{not json".into());
        let invalid = AnimationPayload::synthetic("x", 0.0, 60.0, 100, 100);
        fetcher
            .files
            .insert("invalid.json".into(), serde_json::to_string(&invalid).unwrap());
        let loader = PayloadLoader::new(None, Arc::new(fetcher));

        assert!(matches!(
            loader.resolve(&PayloadSource::Path("missing.json".into())),
            Err(LoadError::Fetch(_))
        ));
        assert!(matches!(
            loader.resolve(&PayloadSource::Path("bad.json".into())),
            Err(LoadError::Parse(_))
        ));
        assert!(matches!(
            loader.resolve(&PayloadSource::Path("invalid.json".into())),
            Err(LoadError::Invalid(PayloadError::InvalidFrameRate(_)))
        ));
    }

    #[test]
    fn test_inline_source_shared() {
        let loader = PayloadLoader::new(None, Arc::new(FsFetcher::default()));
        let payload = Arc::new(AnimationPayload::synthetic("inline", 24.0, 48.0, 10, 10));
        let resolved = loader.resolve(&PayloadSource::Inline(Arc::clone(&payload))).unwrap();
        assert!(Arc::ptr_eq(&payload, &resolved));
    }

    #[test]
    fn test_fs_fetcher_reads_file() {
        let dir = std::env::temp_dir().join(format!("lottie-orchestra-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("a.json"), payload_json()).unwrap();

        let fetcher = FsFetcher::new(Some(dir.clone()));
        assert!(fetcher.fetch("a.json").unwrap().contains("\"fr\""));
        assert!(fetcher.fetch("missing.json").is_err());

        std::fs::remove_dir_all(&dir).ok();
    }
}
