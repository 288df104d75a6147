pub mod config;
pub mod error;
/// Portico - connection router for database servers
///
/// A client connects to a route's listener; the route picks a backend from
/// its destination set (a static list or a metadata-cache snapshot), dials
/// it, and relays bytes in both directions until either side closes.
/// Routing decisions are made once, at connection-accept time; payloads are
/// never inspected.
pub mod core;
pub mod metadata;
pub mod net;
pub mod protocol;

use std::collections::HashMap;
use std::sync::Arc;

use log::warn;

pub use crate::config::Config;
pub use crate::core::address::RouteAddress;
pub use crate::core::route::{Route, RouteSettings, RouteState, RouteStats};
pub use crate::core::AccessMode;
pub use crate::error::{PorticoError, Result};
pub use crate::protocol::ProtocolKind;

use crate::metadata::MetadataCache;
use crate::net::{SocketOps, SystemSocketOps};

/// Point-in-time counters for one route.
#[derive(Debug, Clone)]
pub struct RouteSnapshot {
    pub name: String,
    pub active: usize,
    pub accepted: u64,
    pub rejected: u64,
    pub blocked_clients: u64,
}

/// Aggregate counters across all routes.
#[derive(Debug, Clone, Default)]
pub struct RouterStats {
    pub total_active: usize,
    pub total_accepted: u64,
    pub total_blocked_clients: u64,
    pub routes: Vec<RouteSnapshot>,
}

/// Registry of named routes plus the metadata caches they may draw from.
/// There is no coordination between routes beyond shared socket ops.
pub struct Router {
    routes: HashMap<String, Arc<Route>>,
    caches: HashMap<String, Arc<dyn MetadataCache>>,
    ops: Arc<dyn SocketOps>,
}

impl Router {
    pub fn new() -> Self {
        Self::with_socket_ops(Arc::new(SystemSocketOps))
    }

    /// Build a router over a specific socket capability; tests substitute
    /// scripted ops here.
    pub fn with_socket_ops(ops: Arc<dyn SocketOps>) -> Self {
        Self {
            routes: HashMap::new(),
            caches: HashMap::new(),
            ops,
        }
    }

    /// Make a metadata cache available to routes with dynamic destinations.
    pub fn register_metadata_cache<S: Into<String>>(
        &mut self,
        name: S,
        cache: Arc<dyn MetadataCache>,
    ) {
        self.caches.insert(name.into(), cache);
    }

    /// Register a configured route. Names are unique.
    pub fn add_route(&mut self, route: Route) -> Result<()> {
        let name = route.name().to_string();
        if self.routes.contains_key(&name) {
            return Err(PorticoError::DuplicateRoute(name));
        }
        self.routes.insert(name, Arc::new(route));
        Ok(())
    }

    /// Build and register every route from a configuration.
    pub fn add_routes_from_config(&mut self, config: &Config) -> Result<()> {
        for (name, section) in &config.routes {
            let route = section.build(name, Arc::clone(&self.ops))?;
            self.add_route(route)?;
        }
        Ok(())
    }

    pub fn route(&self, name: &str) -> Option<&Arc<Route>> {
        self.routes.get(name)
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Start every route. A failure stops the routes that already started
    /// and propagates.
    pub async fn start(&self) -> Result<()> {
        let mut started: Vec<&Arc<Route>> = Vec::new();
        for route in self.routes.values() {
            if let Some(cache_name) = route.metadata_cache_name() {
                match self.caches.get(cache_name) {
                    Some(cache) => {
                        route.bind_metadata_cache(Arc::clone(cache));
                    }
                    None => warn!(
                        "Metadata cache '{}' for route '{}' is not registered; \
                         the route will have no destinations until it is",
                        cache_name,
                        route.name()
                    ),
                }
            }
            if let Err(e) = route.start().await {
                for other in started {
                    other.stop().await;
                }
                return Err(e);
            }
            started.push(route);
        }
        Ok(())
    }

    /// Stop every route; returns once all of them are quiescent.
    pub async fn stop(&self) {
        for route in self.routes.values() {
            route.stop().await;
        }
    }

    pub fn stats(&self) -> RouterStats {
        let mut stats = RouterStats::default();
        for route in self.routes.values() {
            let s = route.stats();
            let snapshot = RouteSnapshot {
                name: route.name().to_string(),
                active: s.active_connections(),
                accepted: s.total_accepted(),
                rejected: s.total_rejected(),
                blocked_clients: s.blocked_clients(),
            };
            stats.total_active += snapshot.active;
            stats.total_accepted += snapshot.accepted;
            stats.total_blocked_clients += snapshot.blocked_clients;
            stats.routes.push(snapshot);
        }
        stats.routes.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
