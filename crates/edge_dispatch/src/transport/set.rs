//! The live connection set.

use super::connection::{Connection, Publisher};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

/// All connections known to the runtime, keyed by name.
///
/// Listing operations return connections sorted by name so that resolution
/// by kind is deterministic.
#[derive(Default)]
pub struct ConnectionSet {
    connections: DashMap<String, Arc<dyn Connection>>,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection, replacing any connection with the same name.
    pub fn insert(&self, connection: Arc<dyn Connection>) -> Option<Arc<dyn Connection>> {
        let name = connection.name().to_string();
        info!("🔌 Added connection {} ({})", name, connection.kind());
        self.connections.insert(name, connection)
    }

    pub fn remove(&self, name: &str) -> Option<Arc<dyn Connection>> {
        self.connections.remove(name).map(|(_, connection)| connection)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Connection>> {
        self.connections.get(name).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.connections.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// All connections, sorted by name.
    pub fn all(&self) -> Vec<Arc<dyn Connection>> {
        let mut all: Vec<_> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    /// Connections of the given kind, sorted by name.
    pub fn by_kind(&self, kind: &str) -> Vec<Arc<dyn Connection>> {
        self.all()
            .into_iter()
            .filter(|connection| connection.kind() == kind)
            .collect()
    }

    /// The publisher of the first connection (by name) that has one and,
    /// when given, matches the publisher kind.
    pub fn first_publisher(&self, kind: Option<&str>) -> Option<Arc<dyn Publisher>> {
        self.all()
            .into_iter()
            .filter_map(|connection| connection.publisher())
            .find(|publisher| kind.map_or(true, |k| publisher.kind() == k))
    }

    pub fn names(&self) -> Vec<String> {
        self.all()
            .into_iter()
            .map(|connection| connection.name().to_string())
            .collect()
    }
}

impl std::fmt::Debug for ConnectionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSet")
            .field("connections", &self.names())
            .finish()
    }
}
