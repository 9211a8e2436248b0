use super::*;
use crate::transport::{Connection, MemoryConnection};
use std::sync::atomic::AtomicUsize;

struct Repository {
    table: &'static str,
}

#[derive(Default)]
struct Simple;

struct LineMonitor {
    connection: Arc<dyn Connection>,
    logger: HandlerLogger,
    with_logger: bool,
}

struct NeedsRepository {
    repository: Arc<Repository>,
}

fn connections_with(names: &[(&str, &str)]) -> Arc<ConnectionSet> {
    let set = Arc::new(ConnectionSet::new());
    for (name, kind) in names {
        set.insert(Arc::new(MemoryConnection::new(*name, *kind)));
    }
    set
}

#[test]
fn test_greedy_constructor_selection() {
    let activator = Activator::new(connections_with(&[("plc1", "plc")]));

    activator
        .register_handler(vec![
            Constructor::new(vec![Dependency::connection("plc")], |deps| {
                Ok(LineMonitor {
                    connection: deps.connection(0)?,
                    logger: HandlerLogger::noop(),
                    with_logger: false,
                })
            }),
            Constructor::new(
                vec![Dependency::connection("plc"), Dependency::logger("line")],
                |deps| {
                    Ok(LineMonitor {
                        connection: deps.connection(0)?,
                        logger: deps.logger(1)?,
                        with_logger: true,
                    })
                },
            ),
        ])
        .unwrap();

    let monitor = activator.create::<LineMonitor>().unwrap();
    assert!(monitor.with_logger);
    assert_eq!(monitor.connection.name(), "plc1");
    assert!(monitor.logger.is_noop());
}

#[test]
fn test_ambiguous_constructors_rejected_at_registration() {
    let activator = Activator::new(Arc::new(ConnectionSet::new()));

    let err = activator
        .register_handler(vec![
            Constructor::new(vec![Dependency::any_publisher()], |_| Ok(Simple)),
            Constructor::new(vec![Dependency::logger("x")], |_| Ok(Simple)),
        ])
        .unwrap_err();

    assert!(matches!(
        err,
        ActivationError::AmbiguousConstructors { arity: 1, count: 2, .. }
    ));
}

#[test]
fn test_unresolved_dependency_names_both_types() {
    let activator = Activator::new(Arc::new(ConnectionSet::new()));
    activator
        .register_handler(vec![Constructor::new(
            vec![Dependency::service::<Repository>()],
            |deps| {
                Ok(NeedsRepository {
                    repository: deps.service::<Repository>(0)?,
                })
            },
        )])
        .unwrap();

    let err = activator.create::<NeedsRepository>().err().unwrap();
    match &err {
        ActivationError::UnresolvedDependency {
            parameter, handler, ..
        } => {
            assert!(parameter.contains("Repository"));
            assert!(handler.contains("NeedsRepository"));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let message = err.to_string();
    assert!(message.contains("Repository"));
    assert!(message.contains("NeedsRepository"));
}

#[test]
fn test_no_constructor() {
    let activator = Activator::new(Arc::new(ConnectionSet::new()));
    assert!(matches!(
        activator.create::<Simple>(),
        Err(ActivationError::NoUsableConstructor { .. })
    ));

    activator.register_default::<Simple>().unwrap();
    assert!(activator.create::<Simple>().is_ok());
}

#[test]
fn test_ambiguous_connection_resolved_by_name() {
    let activator = Activator::new(connections_with(&[("plc1", "plc"), ("plc2", "plc")]));

    activator
        .register_handler(vec![Constructor::new(vec![Dependency::connection("plc")], |deps| {
            Ok(LineMonitor {
                connection: deps.connection(0)?,
                logger: HandlerLogger::noop(),
                with_logger: false,
            })
        })])
        .unwrap();

    match activator.create::<LineMonitor>().err().unwrap() {
        ActivationError::AmbiguousDependency { candidates, .. } => {
            assert_eq!(candidates, vec!["plc1".to_string(), "plc2".to_string()]);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    activator
        .register_handler(vec![Constructor::new(
            vec![Dependency::Connection {
                kind: Some("plc".to_string()),
                name: Some("plc2".to_string()),
            }],
            |deps| {
                Ok(LineMonitor {
                    connection: deps.connection(0)?,
                    logger: HandlerLogger::noop(),
                    with_logger: false,
                })
            },
        )])
        .unwrap();

    assert_eq!(activator.create::<LineMonitor>().unwrap().connection.name(), "plc2");
}

struct RepositoryFactory {
    created: AtomicUsize,
    released: AtomicUsize,
}

impl HandlerFactory for RepositoryFactory {
    fn create(&self, handler: &HandlerType) -> Option<Arc<dyn Any + Send + Sync>> {
        if *handler == HandlerType::of::<Simple>() {
            self.created.fetch_add(1, Ordering::SeqCst);
            Some(Arc::new(Simple))
        } else {
            None
        }
    }

    fn service(&self, service: &ServiceType) -> Option<Arc<dyn Any + Send + Sync>> {
        service
            .is::<Repository>()
            .then(|| Arc::new(Repository { table: "batches" }) as Arc<dyn Any + Send + Sync>)
    }

    fn logger(&self, category: Option<&str>) -> Option<HandlerLogger> {
        Some(HandlerLogger::new(category))
    }

    fn release(&self, _handler: &HandlerType, _instance: &Arc<dyn Any + Send + Sync>) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_factory_is_consulted_first() {
    let factory = Arc::new(RepositoryFactory {
        created: AtomicUsize::new(0),
        released: AtomicUsize::new(0),
    });
    let activator = Activator::new(Arc::new(ConnectionSet::new())).with_factory(factory.clone());
    activator
        .register_handler(vec![Constructor::new(vec![], |_| -> Result<Simple, _> {
            panic!("constructor must not run when the factory supplies the instance")
        })])
        .unwrap();

    let scoped = activator
        .create_scoped_instance(&HandlerType::of::<Simple>())
        .unwrap();
    assert_eq!(factory.created.load(Ordering::SeqCst), 1);

    drop(scoped);
    assert_eq!(factory.released.load(Ordering::SeqCst), 1);
}

#[test]
fn test_factory_services_and_loggers() {
    let factory = Arc::new(RepositoryFactory {
        created: AtomicUsize::new(0),
        released: AtomicUsize::new(0),
    });
    let activator = Activator::new(Arc::new(ConnectionSet::new())).with_factory(factory);
    activator
        .register_handler(vec![Constructor::new(
            vec![Dependency::service::<Repository>(), Dependency::logger("batches")],
            |deps| {
                let logger = deps.logger(1)?;
                assert_eq!(logger.category(), Some("batches"));
                Ok(NeedsRepository {
                    repository: deps.service::<Repository>(0)?,
                })
            },
        )])
        .unwrap();

    let handler = activator.create::<NeedsRepository>().unwrap();
    assert_eq!(handler.repository.table, "batches");
}

#[test]
fn test_scoped_release_runs_exactly_once() {
    let released = Arc::new(AtomicUsize::new(0));
    let counter = released.clone();

    let activator = Activator::new(Arc::new(ConnectionSet::new()));
    activator
        .register_handler(vec![Constructor::<Simple>::default_ctor().on_release(
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        )])
        .unwrap();

    let scoped = activator
        .create_scoped_instance(&HandlerType::of::<Simple>())
        .unwrap();
    assert!(scoped.downcast::<Simple>().is_some());

    scoped.release.release();
    scoped.release.release();
    assert!(scoped.release.is_released());
    drop(scoped);

    assert_eq!(released.load(Ordering::SeqCst), 1);
    assert_eq!(activator.release_count(), 1);
}

struct Runtime {
    label: &'static str,
}

struct NeedsRoot {
    root: Arc<Runtime>,
}

#[test]
fn test_orchestrator_root_resolution() {
    let activator = Activator::new(Arc::new(ConnectionSet::new()));
    activator
        .register_handler(vec![Constructor::new(
            vec![Dependency::orchestrator::<Runtime>()],
            |deps| {
                Ok(NeedsRoot {
                    root: deps.orchestrator::<Runtime>(0)?,
                })
            },
        )])
        .unwrap();

    assert!(matches!(
        activator.create::<NeedsRoot>(),
        Err(ActivationError::UnresolvedDependency { .. })
    ));

    let root = Arc::new(Runtime { label: "edge" });
    assert!(activator.set_root(&root));
    assert_eq!(activator.create::<NeedsRoot>().unwrap().root.label, "edge");
}
