use super::adapter::ModelAdapter;
use super::rig_adapter::{BackendKind, RigAdapter};

/// Produces uninitialized adapters by backend id.
pub trait AdapterFactory: Send + Sync {
    fn create(&self, backend_id: &str) -> Option<Box<dyn ModelAdapter>>;
}

/// Closed set of supported backends. Lookups never fail loudly: an unknown id
/// yields `None` and the caller decides how to surface it.
#[derive(Debug, Clone, Default)]
pub struct BackendRegistry {
    _private: (),
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn supports(&self, backend_id: &str) -> bool {
        BackendKind::parse(backend_id).is_some()
    }

    pub fn backend_ids(&self) -> Vec<&'static str> {
        BackendKind::ALL.iter().map(BackendKind::id).collect()
    }

    /// Returns a fresh, uninitialized adapter for `backend_id`.
    pub fn create(&self, backend_id: &str) -> Option<Box<dyn ModelAdapter>> {
        let Some(kind) = BackendKind::parse(backend_id) else {
            tracing::debug!(backend_id, "no adapter registered for backend");
            return None;
        };
        Some(Box::new(RigAdapter::new(kind)))
    }
}

impl AdapterFactory for BackendRegistry {
    fn create(&self, backend_id: &str) -> Option<Box<dyn ModelAdapter>> {
        BackendRegistry::create(self, backend_id)
    }
}
