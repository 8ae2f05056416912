use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use super::backend::{DetectionCapability, DetectorBackend};
use super::backends::{MotionBackend, StubBackend};

pub type SharedBackend = Arc<Mutex<dyn DetectorBackend>>;

/// Thread-safe registry of detector backends.
///
/// Backends are wrapped in `Mutex` because `DetectorBackend::detect` takes `&mut self`.
pub struct BackendRegistry {
    backends: HashMap<String, SharedBackend>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            default_name: None,
        }
    }

    /// Registry with the backends compiled into every build.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(MotionBackend::default());
        registry.register(StubBackend::new());
        registry
    }

    /// Register a backend. The first registered backend becomes the default.
    pub fn register<B: DetectorBackend + 'static>(&mut self, backend: B) {
        let name = backend.name().to_string();
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        self.backends.insert(name, Arc::new(Mutex::new(backend)));
    }

    /// Set default backend by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.backends.contains_key(name) {
            return Err(anyhow!("backend '{}' not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    /// Get backend by name.
    pub fn get(&self, name: &str) -> Option<SharedBackend> {
        self.backends.get(name).cloned()
    }

    /// Get backend by name or fail with the list of known names.
    pub fn require(&self, name: &str) -> Result<SharedBackend> {
        self.get(name).ok_or_else(|| {
            anyhow!(
                "detector backend '{}' not registered (known: {})",
                name,
                self.list().join(", ")
            )
        })
    }

    /// Get default backend.
    pub fn default_backend(&self) -> Option<SharedBackend> {
        self.default_name.as_ref().and_then(|name| self.get(name))
    }

    /// List registered backends, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether the named backend offers a capability.
    pub fn supports(&self, name: &str, capability: DetectionCapability) -> Result<bool> {
        let backend = self.require(name)?;
        let guard = backend
            .lock()
            .map_err(|_| anyhow!("backend lock poisoned"))?;
        Ok(guard.supports(capability))
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
