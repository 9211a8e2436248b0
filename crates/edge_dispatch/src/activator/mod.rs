//! # Handler Activation
//!
//! Builds handler instances without a general-purpose dependency container.
//!
//! Resolution order for a handler type:
//!
//! 1. The external [`HandlerFactory`], when one is installed and returns an
//!    instance.
//! 2. The registered [`Constructor`] with the most parameters. Parameters are
//!    resolved in order: the orchestrator root, live connections, publishers,
//!    loggers, then factory services. Any unresolved parameter aborts the
//!    activation with [`ActivationError::UnresolvedDependency`].
//!
//! Scoped activations return a [`ReleaseHandle`] that runs constructor and
//! factory release hooks exactly once.

mod dependency;
mod logger;
mod scope;

pub use dependency::{Constructor, Dependency, Resolved, ResolvedDependencies, ServiceType};
pub use logger::HandlerLogger;
pub use scope::{ReleaseHandle, ScopedInstance};

use crate::error::ActivationError;
use crate::transport::ConnectionSet;
use crate::types::HandlerType;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use std::any::{Any, TypeId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

type Instance = Arc<dyn Any + Send + Sync>;

/// External source of handler instances and services.
///
/// Consulted before any registered constructor.
pub trait HandlerFactory: Send + Sync {
    /// Produces a ready instance of the handler type, if the factory knows it.
    fn create(&self, handler: &HandlerType) -> Option<Instance>;

    /// Supplies a service dependency.
    fn service(&self, _service: &ServiceType) -> Option<Instance> {
        None
    }

    /// Supplies a logger for a category.
    fn logger(&self, _category: Option<&str>) -> Option<HandlerLogger> {
        None
    }

    /// Called when a scoped instance produced by [`create`](Self::create) is
    /// released.
    fn release(&self, _handler: &HandlerType, _instance: &Instance) {}
}

type ErasedBuild = dyn Fn(&ResolvedDependencies) -> Result<Instance, ActivationError> + Send + Sync;
type ErasedRelease = dyn Fn(&Instance) + Send + Sync;

/// The selected constructor of one handler type, with its concrete type erased.
struct RegisteredConstructor {
    handler_type: HandlerType,
    params: Vec<Dependency>,
    build: Arc<ErasedBuild>,
    release: Option<Arc<ErasedRelease>>,
}

enum ReleaseHook {
    Factory(Arc<dyn HandlerFactory>),
    Constructor(Arc<ErasedRelease>),
    None,
}

struct RootRef {
    instance: Weak<dyn Any + Send + Sync>,
    type_id: TypeId,
    name: &'static str,
}

/// Handler instance builder.
pub struct Activator {
    constructors: DashMap<TypeId, Arc<RegisteredConstructor>>,
    factory: Option<Arc<dyn HandlerFactory>>,
    connections: Arc<ConnectionSet>,
    root: OnceCell<RootRef>,
    activations: AtomicU64,
    releases: Arc<AtomicU64>,
}

impl std::fmt::Debug for Activator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Activator")
            .field("constructors", &self.constructors.len())
            .field("factory", &self.factory.is_some())
            .field("root", &self.root.get().map(|root| root.name))
            .finish()
    }
}

impl Activator {
    pub fn new(connections: Arc<ConnectionSet>) -> Self {
        Self {
            constructors: DashMap::new(),
            factory: None,
            connections,
            root: OnceCell::new(),
            activations: AtomicU64::new(0),
            releases: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Installs the external factory.
    pub fn with_factory(mut self, factory: Arc<dyn HandlerFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Sets the orchestrator root. Only the first call has an effect.
    ///
    /// The activator keeps a weak reference, so the root may own the
    /// activator without creating a cycle.
    pub fn set_root<R: Send + Sync + 'static>(&self, root: &Arc<R>) -> bool {
        let erased: Arc<dyn Any + Send + Sync> = root.clone();
        self.root
            .set(RootRef {
                instance: Arc::downgrade(&erased),
                type_id: TypeId::of::<R>(),
                name: std::any::type_name::<R>(),
            })
            .is_ok()
    }

    /// Registers the constructors of a handler type.
    ///
    /// The constructor with the greatest parameter count is selected. Two
    /// constructors sharing that count are rejected.
    pub fn register_handler<H: Send + Sync + 'static>(
        &self,
        constructors: Vec<Constructor<H>>,
    ) -> Result<(), ActivationError> {
        let handler_type = HandlerType::of::<H>();

        let Some(arity) = constructors.iter().map(|c| c.arity()).max() else {
            return Err(ActivationError::NoUsableConstructor {
                handler: handler_type.name(),
            });
        };

        let count = constructors.iter().filter(|c| c.arity() == arity).count();
        if count > 1 {
            return Err(ActivationError::AmbiguousConstructors {
                handler: handler_type.name(),
                arity,
                count,
            });
        }

        let Some(selected) = constructors.into_iter().find(|c| c.arity() == arity) else {
            return Err(ActivationError::NoUsableConstructor {
                handler: handler_type.name(),
            });
        };

        let Constructor {
            params,
            build,
            release,
        } = selected;

        let erased_build: Arc<ErasedBuild> =
            Arc::new(move |deps: &ResolvedDependencies| build(deps).map(|h| Arc::new(h) as Instance));

        let erased_release: Option<Arc<ErasedRelease>> = release.map(|release| {
            Arc::new(move |instance: &Instance| {
                if let Some(handler) = instance.downcast_ref::<H>() {
                    release(handler);
                }
            }) as Arc<ErasedRelease>
        });

        self.constructors.insert(
            handler_type.type_id(),
            Arc::new(RegisteredConstructor {
                handler_type,
                params,
                build: erased_build,
                release: erased_release,
            }),
        );

        debug!("📝 Registered constructor for {} ({} parameters)", handler_type, arity);
        Ok(())
    }

    /// Registers a parameterless `Default` constructor.
    pub fn register_default<H: Default + Send + Sync + 'static>(&self) -> Result<(), ActivationError> {
        self.register_handler(vec![Constructor::<H>::default_ctor()])
    }

    pub fn has_constructor(&self, handler_type: &HandlerType) -> bool {
        self.constructors.contains_key(&handler_type.type_id())
    }

    /// Builds an instance of the handler type.
    ///
    /// Unscoped instances belong to the caller; release hooks never run for
    /// them.
    pub fn create_instance(&self, handler_type: &HandlerType) -> Result<Instance, ActivationError> {
        self.activate(handler_type).map(|(instance, _)| instance)
    }

    /// Builds a typed instance of `H`.
    pub fn create<H: Send + Sync + 'static>(&self) -> Result<Arc<H>, ActivationError> {
        let handler_type = HandlerType::of::<H>();
        self.create_instance(&handler_type)?
            .downcast::<H>()
            .map_err(|_| ActivationError::InstanceTypeMismatch {
                handler: handler_type.name(),
            })
    }

    /// Builds an instance for one invocation.
    ///
    /// The returned release handle runs the release hooks when invoked or
    /// dropped, whichever comes first.
    pub fn create_scoped_instance(
        &self,
        handler_type: &HandlerType,
    ) -> Result<ScopedInstance, ActivationError> {
        let (instance, hook) = self.activate(handler_type)?;

        let releases = self.releases.clone();
        let released = instance.clone();
        let ty = *handler_type;
        let release = ReleaseHandle::new(move || {
            match hook {
                ReleaseHook::Factory(factory) => factory.release(&ty, &released),
                ReleaseHook::Constructor(hook) => hook(&released),
                ReleaseHook::None => {}
            }
            releases.fetch_add(1, Ordering::Relaxed);
        });

        Ok(ScopedInstance {
            handler_type: *handler_type,
            instance,
            release,
        })
    }

    fn activate(&self, handler_type: &HandlerType) -> Result<(Instance, ReleaseHook), ActivationError> {
        if let Some(factory) = &self.factory {
            if let Some(instance) = factory.create(handler_type) {
                self.activations.fetch_add(1, Ordering::Relaxed);
                return Ok((instance, ReleaseHook::Factory(factory.clone())));
            }
        }

        let constructor = self
            .constructors
            .get(&handler_type.type_id())
            .map(|entry| entry.value().clone())
            .ok_or(ActivationError::NoUsableConstructor {
                handler: handler_type.name(),
            })?;

        let resolved = constructor
            .params
            .iter()
            .map(|param| self.resolve(param, constructor.handler_type.name()))
            .collect::<Result<Vec<_>, _>>()?;

        let instance = (constructor.build)(&ResolvedDependencies::new(
            constructor.handler_type.name(),
            resolved,
        ))?;
        self.activations.fetch_add(1, Ordering::Relaxed);

        let hook = match &constructor.release {
            Some(hook) => ReleaseHook::Constructor(hook.clone()),
            None => ReleaseHook::None,
        };
        Ok((instance, hook))
    }

    /// Number of successful activations so far.
    pub fn activation_count(&self) -> u64 {
        self.activations.load(Ordering::Relaxed)
    }

    /// Number of scoped instances released so far.
    pub fn release_count(&self) -> u64 {
        self.releases.load(Ordering::Relaxed)
    }

    fn resolve(&self, param: &Dependency, handler: &'static str) -> Result<Resolved, ActivationError> {
        let unresolved = |reason: String| ActivationError::UnresolvedDependency {
            parameter: param.describe(),
            handler,
            reason,
        };

        match param {
            Dependency::Orchestrator { type_id, name } => {
                let root = self
                    .root
                    .get()
                    .ok_or_else(|| unresolved("no orchestrator root is set".to_string()))?;
                if root.type_id != *type_id {
                    return Err(unresolved(format!(
                        "root is a {}, not a {}",
                        root.name, name
                    )));
                }
                root.instance
                    .upgrade()
                    .map(Resolved::Orchestrator)
                    .ok_or_else(|| unresolved("orchestrator root has been dropped".to_string()))
            }

            Dependency::Connection { kind, name } => {
                let candidates = match kind {
                    Some(kind) => self.connections.by_kind(kind),
                    None => self.connections.all(),
                };

                if let Some(name) = name {
                    return candidates
                        .into_iter()
                        .find(|connection| connection.name() == name)
                        .map(Resolved::Connection)
                        .ok_or_else(|| unresolved(format!("no live connection named {name}")));
                }

                match candidates.len() {
                    0 => Err(unresolved("no live connection matches".to_string())),
                    1 => Ok(Resolved::Connection(candidates[0].clone())),
                    _ => Err(ActivationError::AmbiguousDependency {
                        parameter: param.describe(),
                        handler,
                        candidates: candidates
                            .iter()
                            .map(|connection| connection.name().to_string())
                            .collect(),
                    }),
                }
            }

            Dependency::Publisher { kind } => self
                .connections
                .first_publisher(kind.as_deref())
                .map(Resolved::Publisher)
                .ok_or_else(|| unresolved("no live connection has a matching publisher".to_string())),

            Dependency::Logger { category } => {
                let logger = self
                    .factory
                    .as_ref()
                    .and_then(|factory| factory.logger(category.as_deref()))
                    .unwrap_or_else(HandlerLogger::noop);
                Ok(Resolved::Logger(logger))
            }

            Dependency::Service(service) => self
                .factory
                .as_ref()
                .and_then(|factory| factory.service(service))
                .map(Resolved::Service)
                .ok_or_else(|| unresolved("the handler factory does not supply it".to_string())),
        }
    }
}

#[cfg(test)]
mod tests;
