//! Service resolution for message handlers.
//!
//! Handlers declare the services they need in their [`HandlerSignature`]; at dispatch time
//! those are looked up through a [`ServiceProvider`], either directly (root scope) or
//! through a [`ServiceScope`] created for a single delivery (child scope).
//!
//! Bring your own container by implementing [`ServiceProvider`]. [`ServiceCollection`] is a
//! small registry covering singletons and per-scope services.
//!
//! [`HandlerSignature`]: crate::consumers::HandlerSignature
use serde::Deserialize;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// A resolved service.
pub type ServiceInstance = Arc<dyn Any + Send + Sync>;

/// Where handler dependencies are resolved from.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum DispatchScope {
    /// Use the root provider for every delivery.
    #[default]
    RootScope,
    /// Create a scope for each delivery, dropped once the delivery has been acknowledged
    /// (or rejected).
    ChildScope,
}

/// Identifies a service: its type plus an optional key, for types registered more than once.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    type_id: TypeId,
    type_name: &'static str,
    key: Option<String>,
}

impl ServiceKey {
    pub fn of<T: Any>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            key: None,
        }
    }

    pub fn keyed<T: Any>(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::of::<T>()
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }
}

impl fmt::Debug for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(key) => write!(f, "{} (key: {key})", self.type_name),
            None => f.write_str(self.type_name),
        }
    }
}

/// Anything services can be looked up from.
pub trait ServiceResolver: Send + Sync {
    fn resolve(&self, key: &ServiceKey) -> Option<ServiceInstance>;
}

/// The root of service resolution, shared by all consumers of a group.
#[async_trait::async_trait]
pub trait ServiceProvider: ServiceResolver + 'static {
    /// Create a scope owning the services registered as scoped.
    ///
    /// The scope is disposed of when dropped.
    async fn create_scope(&self) -> Result<Box<dyn ServiceScope>, anyhow::Error>;
}

/// Services living for the processing of a single delivery.
pub trait ServiceScope: ServiceResolver {}

/// Resolution target for a single delivery.
#[derive(Clone, Copy)]
pub enum ServiceLookup<'a> {
    Root(&'a dyn ServiceProvider),
    Scoped(&'a dyn ServiceScope),
}

impl<'a> ServiceLookup<'a> {
    pub fn resolve(&self, key: &ServiceKey) -> Option<ServiceInstance> {
        match self {
            Self::Root(provider) => provider.resolve(key),
            Self::Scoped(scope) => scope.resolve(key),
        }
    }

    /// Resolve a service by type and downcast it.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.resolve(&ServiceKey::of::<T>())
            .and_then(|instance| instance.downcast::<T>().ok())
    }
}

type ScopedFactory = Box<dyn Fn() -> ServiceInstance + Send + Sync>;

enum Registration {
    Singleton(ServiceInstance),
    Scoped(ScopedFactory),
}

type Registrations = HashMap<ServiceKey, Registration>;

/// A minimal service registry.
///
/// Singletons are shared by every delivery. Scoped services are created at most once per
/// [`ServiceScope`] and dropped together with it. Resolving a scoped service from the root
/// returns `None`.
///
/// ```rust
/// use carrot_dispatch::services::{ServiceCollection, ServiceKey, ServiceResolver};
///
/// struct Clock;
///
/// let services = ServiceCollection::new().singleton(Clock).build();
/// assert!(services.resolve(&ServiceKey::of::<Clock>()).is_some());
/// ```
#[derive(Default)]
pub struct ServiceCollection {
    registrations: Registrations,
}

impl ServiceCollection {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn singleton<T: Any + Send + Sync>(self, service: T) -> Self {
        self.register(ServiceKey::of::<T>(), Registration::Singleton(Arc::new(service)))
    }

    #[must_use]
    pub fn keyed_singleton<T: Any + Send + Sync>(self, key: impl Into<String>, service: T) -> Self {
        self.register(
            ServiceKey::keyed::<T>(key),
            Registration::Singleton(Arc::new(service)),
        )
    }

    /// Register a service created once for each scope.
    #[must_use]
    pub fn scoped<T, F>(self, factory: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let factory: ScopedFactory = Box::new(move || Arc::new(factory()) as ServiceInstance);
        self.register(ServiceKey::of::<T>(), Registration::Scoped(factory))
    }

    fn register(mut self, key: ServiceKey, registration: Registration) -> Self {
        self.registrations.insert(key, registration);
        self
    }

    /// Freeze the registrations into a shareable provider.
    pub fn build(self) -> Arc<dyn ServiceProvider> {
        Arc::new(Registry {
            registrations: Arc::new(self.registrations),
        })
    }
}

struct Registry {
    registrations: Arc<Registrations>,
}

impl ServiceResolver for Registry {
    fn resolve(&self, key: &ServiceKey) -> Option<ServiceInstance> {
        match self.registrations.get(key)? {
            Registration::Singleton(instance) => Some(Arc::clone(instance)),
            Registration::Scoped(_) => None,
        }
    }
}

#[async_trait::async_trait]
impl ServiceProvider for Registry {
    async fn create_scope(&self) -> Result<Box<dyn ServiceScope>, anyhow::Error> {
        Ok(Box::new(RegistryScope {
            registrations: Arc::clone(&self.registrations),
            instances: Mutex::default(),
        }))
    }
}

struct RegistryScope {
    registrations: Arc<Registrations>,
    instances: Mutex<HashMap<ServiceKey, ServiceInstance>>,
}

impl ServiceResolver for RegistryScope {
    fn resolve(&self, key: &ServiceKey) -> Option<ServiceInstance> {
        match self.registrations.get(key)? {
            Registration::Singleton(instance) => Some(Arc::clone(instance)),
            Registration::Scoped(factory) => {
                let mut instances = self
                    .instances
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                let instance = instances.entry(key.clone()).or_insert_with(|| factory());
                Some(Arc::clone(instance))
            }
        }
    }
}

impl ServiceScope for RegistryScope {}
