use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

/// Runtime state of a model's inference handle, kept apart from its descriptor.
#[derive(Debug, Clone)]
pub enum ModelInstance<H> {
    Unloaded,
    Loading,
    Ready(Arc<H>),
    Failed(String),
}

impl<H> ModelInstance<H> {
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, ModelInstance::Ready(_))
    }
}

/// Owns every live inference handle, keyed by model name.
pub struct LifecycleManager<H> {
    instances: Mutex<HashMap<String, ModelInstance<H>>>,
}

impl<H> Default for LifecycleManager<H> {
    fn default() -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
        }
    }
}

impl<H> LifecycleManager<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, name: &str) -> ModelInstance<H> {
        match self.instances.lock().get(name) {
            Some(ModelInstance::Ready(handle)) => ModelInstance::Ready(handle.clone()),
            Some(ModelInstance::Loading) => ModelInstance::Loading,
            Some(ModelInstance::Failed(error)) => ModelInstance::Failed(error.clone()),
            Some(ModelInstance::Unloaded) | None => ModelInstance::Unloaded,
        }
    }

    /// Returns `false` if the model is already loading or loaded.
    pub fn begin_loading(&self, name: &str) -> bool {
        let mut instances = self.instances.lock();
        match instances.get(name) {
            Some(ModelInstance::Loading | ModelInstance::Ready(_)) => false,
            _ => {
                instances.insert(name.to_string(), ModelInstance::Loading);
                true
            }
        }
    }

    pub fn finish_loading(&self, name: &str, result: Result<H, String>) {
        let state = match result {
            Ok(handle) => ModelInstance::Ready(Arc::new(handle)),
            Err(error) => ModelInstance::Failed(error),
        };
        self.instances.lock().insert(name.to_string(), state);
    }

    /// Drops the handle, returning it when it was ready.
    pub fn unload(&self, name: &str) -> Option<Arc<H>> {
        match self.instances.lock().remove(name) {
            Some(ModelInstance::Ready(handle)) => Some(handle),
            _ => None,
        }
    }

    pub fn with_ready<T>(&self, name: &str, f: impl FnOnce(&H) -> T) -> Option<T> {
        let handle = match self.instances.lock().get(name) {
            Some(ModelInstance::Ready(handle)) => handle.clone(),
            _ => return None,
        };
        Some(f(&handle))
    }
}
