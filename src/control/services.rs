use ahash::AHashMap;
use std::any::{Any, TypeId, type_name};
use std::fmt;
use std::sync::Arc;

/// Type-keyed map of shared services (geometry, calibration, pools...).
///
/// Built explicitly before the run, owned by the controller and handed to
/// every arrow's `open` hook.
#[derive(Default, Clone)]
pub struct ServiceRegistry {
    services: AHashMap<TypeId, (&'static str, Arc<dyn Any + Send + Sync>)>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `service`, replacing any previous one of the same type.
    pub fn provide<S: Any + Send + Sync>(&mut self, service: S) -> &mut Self {
        self.provide_arc(Arc::new(service))
    }

    pub fn provide_arc<S: Any + Send + Sync>(&mut self, service: Arc<S>) -> &mut Self {
        if self
            .services
            .insert(TypeId::of::<S>(), (type_name::<S>(), service))
            .is_some()
        {
            tracing::debug!("[Services] replaced {}", type_name::<S>());
        }
        self
    }

    pub fn with<S: Any + Send + Sync>(mut self, service: S) -> Self {
        self.provide(service);
        self
    }

    pub fn get<S: Any + Send + Sync>(&self) -> Option<Arc<S>> {
        let (_, service) = self.services.get(&TypeId::of::<S>())?;
        Arc::clone(service).downcast::<S>().ok()
    }

    /// Like [`Self::get`], with an error naming the missing type.
    pub fn require<S: Any + Send + Sync>(&self) -> anyhow::Result<Arc<S>> {
        self.get::<S>()
            .ok_or_else(|| anyhow::anyhow!("service {} is not registered", type_name::<S>()))
    }

    pub fn contains<S: Any + Send + Sync>(&self) -> bool {
        self.services.contains_key(&TypeId::of::<S>())
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(self.services.values().map(|(name, _)| name))
            .finish()
    }
}
