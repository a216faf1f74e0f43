use std::collections::HashMap;

use anyhow::{anyhow, Result};

use crate::config::DetectorSettings;

use super::backend::Detector;
use super::backends::StubBackend;

/// Builds a fresh detector instance from settings.
pub type DetectorFactory =
    Box<dyn Fn(&DetectorSettings) -> Result<Box<dyn Detector>> + Send + Sync>;

/// Registry of detector backends by name.
///
/// The registry stores factories rather than instances: every worker calls
/// `build` and owns the detector it gets back, so no detector state is
/// shared between workers.
pub struct DetectorRegistry {
    factories: HashMap<String, DetectorFactory>,
    default_name: Option<String>,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            default_name: None,
        }
    }

    /// Registry with every backend compiled into this build.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("stub", |settings: &DetectorSettings| {
            let backend = match &settings.fixture_path {
                Some(path) => StubBackend::from_fixture_file(path)?,
                None => StubBackend::default(),
            };
            Ok(Box::new(backend) as Box<dyn Detector>)
        });

        #[cfg(feature = "backend-tract")]
        registry.register("tract", |settings: &DetectorSettings| {
            let path = settings
                .model_path
                .as_ref()
                .ok_or_else(|| anyhow!("tract backend requires a model path"))?;
            let backend = super::backends::TractBackend::new(
                path,
                settings.input_width,
                settings.input_height,
                settings.labels.clone(),
            )?
            .with_threshold(settings.score_threshold);
            Ok(Box::new(backend) as Box<dyn Detector>)
        });

        registry
    }

    /// Register a backend factory. The first registered backend becomes the default.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&DetectorSettings) -> Result<Box<dyn Detector>> + Send + Sync + 'static,
    {
        if self.default_name.is_none() {
            self.default_name = Some(name.to_string());
        }
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Set default backend by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.factories.contains_key(name) {
            return Err(anyhow!("detector backend '{}' not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    /// Build a new instance of the named backend.
    pub fn build(&self, name: &str, settings: &DetectorSettings) -> Result<Box<dyn Detector>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            anyhow!(
                "detector backend '{}' not available (registered: {})",
                name,
                self.list().join(", ")
            )
        })?;
        factory(settings)
    }

    /// Build the backend named in the settings, falling back to the default.
    pub fn build_configured(&self, settings: &DetectorSettings) -> Result<Box<dyn Detector>> {
        let name = if settings.backend.trim().is_empty() {
            self.default_name
                .as_deref()
                .ok_or_else(|| anyhow!("no detector backends registered"))?
        } else {
            settings.backend.as_str()
        };
        self.build(name, settings)
    }

    /// Registered backend names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for DetectorRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}
