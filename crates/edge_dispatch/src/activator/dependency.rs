//! Constructor parameters and their resolved values.

use super::logger::HandlerLogger;
use crate::error::ActivationError;
use crate::transport::{Connection, Publisher};
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

/// Runtime identity of a service type supplied by the external factory.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceType {
    type_id: TypeId,
    name: &'static str,
}

impl ServiceType {
    pub fn of<S: 'static>() -> Self {
        Self {
            type_id: TypeId::of::<S>(),
            name: std::any::type_name::<S>(),
        }
    }

    #[inline]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn is<S: 'static>(&self) -> bool {
        self.type_id == TypeId::of::<S>()
    }
}

impl fmt::Debug for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crate::utils::short_type_name(self.name))
    }
}

/// A constructor parameter.
#[derive(Clone, Debug)]
pub enum Dependency {
    /// The live root runtime object
    Orchestrator { type_id: TypeId, name: &'static str },
    /// A live connection, by kind and optionally by name
    Connection {
        kind: Option<String>,
        name: Option<String>,
    },
    /// The publisher of the first live connection that has a matching one
    Publisher { kind: Option<String> },
    /// A category logger
    Logger { category: Option<String> },
    /// Anything else, supplied by the external factory
    Service(ServiceType),
}

impl Dependency {
    pub fn orchestrator<R: 'static>() -> Self {
        Dependency::Orchestrator {
            type_id: TypeId::of::<R>(),
            name: std::any::type_name::<R>(),
        }
    }

    /// A connection of the given kind.
    pub fn connection(kind: impl Into<String>) -> Self {
        Dependency::Connection {
            kind: Some(kind.into()),
            name: None,
        }
    }

    /// A specific connection, by name.
    pub fn named_connection(name: impl Into<String>) -> Self {
        Dependency::Connection {
            kind: None,
            name: Some(name.into()),
        }
    }

    pub fn publisher(kind: impl Into<String>) -> Self {
        Dependency::Publisher {
            kind: Some(kind.into()),
        }
    }

    pub fn any_publisher() -> Self {
        Dependency::Publisher { kind: None }
    }

    pub fn logger(category: impl Into<String>) -> Self {
        Dependency::Logger {
            category: Some(category.into()),
        }
    }

    pub fn service<S: 'static>() -> Self {
        Dependency::Service(ServiceType::of::<S>())
    }

    /// Human-readable description used in activation errors.
    pub fn describe(&self) -> String {
        match self {
            Dependency::Orchestrator { name, .. } => {
                format!("Orchestrator({})", crate::utils::short_type_name(name))
            }
            Dependency::Connection { kind, name } => match (kind, name) {
                (Some(kind), Some(name)) => format!("Connection(kind={kind}, name={name})"),
                (Some(kind), None) => format!("Connection(kind={kind})"),
                (None, Some(name)) => format!("Connection(name={name})"),
                (None, None) => "Connection".to_string(),
            },
            Dependency::Publisher { kind: Some(kind) } => format!("Publisher(kind={kind})"),
            Dependency::Publisher { kind: None } => "Publisher".to_string(),
            Dependency::Logger { category: Some(category) } => format!("Logger({category})"),
            Dependency::Logger { category: None } => "Logger".to_string(),
            Dependency::Service(service) => {
                format!("Service({})", crate::utils::short_type_name(service.name()))
            }
        }
    }
}

/// A resolved constructor argument.
#[derive(Clone)]
pub enum Resolved {
    Orchestrator(Arc<dyn Any + Send + Sync>),
    Connection(Arc<dyn Connection>),
    Publisher(Arc<dyn Publisher>),
    Logger(HandlerLogger),
    Service(Arc<dyn Any + Send + Sync>),
}

impl Resolved {
    fn label(&self) -> &'static str {
        match self {
            Resolved::Orchestrator(_) => "orchestrator",
            Resolved::Connection(_) => "connection",
            Resolved::Publisher(_) => "publisher",
            Resolved::Logger(_) => "logger",
            Resolved::Service(_) => "service",
        }
    }
}

/// Resolved arguments in constructor parameter order.
pub struct ResolvedDependencies {
    handler: &'static str,
    values: Vec<Resolved>,
}

impl ResolvedDependencies {
    pub(crate) fn new(handler: &'static str, values: Vec<Resolved>) -> Self {
        Self { handler, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn at(&self, index: usize) -> Result<&Resolved, ActivationError> {
        self.values
            .get(index)
            .ok_or_else(|| self.failure(format!("no argument at position {index}")))
    }

    fn failure(&self, reason: String) -> ActivationError {
        ActivationError::ConstructorFailed {
            handler: self.handler,
            reason,
        }
    }

    fn wrong_kind(&self, index: usize, expected: &str, found: &Resolved) -> ActivationError {
        self.failure(format!(
            "argument {index} is a {}, not a {expected}",
            found.label()
        ))
    }

    pub fn connection(&self, index: usize) -> Result<Arc<dyn Connection>, ActivationError> {
        match self.at(index)? {
            Resolved::Connection(connection) => Ok(connection.clone()),
            other => Err(self.wrong_kind(index, "connection", other)),
        }
    }

    pub fn publisher(&self, index: usize) -> Result<Arc<dyn Publisher>, ActivationError> {
        match self.at(index)? {
            Resolved::Publisher(publisher) => Ok(publisher.clone()),
            other => Err(self.wrong_kind(index, "publisher", other)),
        }
    }

    pub fn logger(&self, index: usize) -> Result<HandlerLogger, ActivationError> {
        match self.at(index)? {
            Resolved::Logger(logger) => Ok(logger.clone()),
            other => Err(self.wrong_kind(index, "logger", other)),
        }
    }

    pub fn orchestrator<R: Send + Sync + 'static>(
        &self,
        index: usize,
    ) -> Result<Arc<R>, ActivationError> {
        match self.at(index)? {
            Resolved::Orchestrator(root) => root.clone().downcast::<R>().map_err(|_| {
                self.failure(format!(
                    "orchestrator is not a {}",
                    std::any::type_name::<R>()
                ))
            }),
            other => Err(self.wrong_kind(index, "orchestrator", other)),
        }
    }

    pub fn service<S: Send + Sync + 'static>(&self, index: usize) -> Result<Arc<S>, ActivationError> {
        match self.at(index)? {
            Resolved::Service(service) => service.clone().downcast::<S>().map_err(|_| {
                self.failure(format!(
                    "service at {index} is not a {}",
                    std::any::type_name::<S>()
                ))
            }),
            other => Err(self.wrong_kind(index, "service", other)),
        }
    }
}

type BuildFn<H> = dyn Fn(&ResolvedDependencies) -> Result<H, ActivationError> + Send + Sync;
type ReleaseCallback<H> = dyn Fn(&H) + Send + Sync;

/// An explicit constructor for handler type `H`.
///
/// The parameter list drives resolution; the build closure receives the
/// resolved arguments in the same order.
pub struct Constructor<H> {
    pub(crate) params: Vec<Dependency>,
    pub(crate) build: Arc<BuildFn<H>>,
    pub(crate) release: Option<Arc<ReleaseCallback<H>>>,
}

impl<H: Send + Sync + 'static> Constructor<H> {
    pub fn new(
        params: Vec<Dependency>,
        build: impl Fn(&ResolvedDependencies) -> Result<H, ActivationError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            params,
            build: Arc::new(build),
            release: None,
        }
    }

    /// Parameterless constructor using `Default`.
    pub fn default_ctor() -> Self
    where
        H: Default,
    {
        Self::new(Vec::new(), |_| Ok(H::default()))
    }

    /// Runs when a scoped instance built by this constructor is released.
    pub fn on_release(mut self, release: impl Fn(&H) + Send + Sync + 'static) -> Self {
        self.release = Some(Arc::new(release));
        self
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    pub fn params(&self) -> &[Dependency] {
        &self.params
    }
}
