/// Destination selection
///
/// A route's backends come either from a static CSV list or from a metadata
/// cache that labels instances by role. Selection is round-robin with a
/// cursor that survives across connections; a failed destination is skipped
/// simply because the dial loop asks again.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crate::core::address::RouteAddress;
use crate::core::AccessMode;
use crate::error::ConfigError;
use crate::metadata::{InstanceRole, MetadataCache};
use crate::protocol::ProtocolKind;

pub const METADATA_CACHE_SCHEME: &str = "metadata-cache";

/// Which roles a dynamic destination set draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteRole {
    Primary,
    Secondary,
    PrimaryAndSecondary,
}

impl RouteRole {
    fn from_uri_value(value: &str) -> Option<Self> {
        match value {
            "PRIMARY" => Some(RouteRole::Primary),
            "SECONDARY" => Some(RouteRole::Secondary),
            "PRIMARY_AND_SECONDARY" => Some(RouteRole::PrimaryAndSecondary),
            _ => None,
        }
    }

    fn admits(self, role: InstanceRole) -> bool {
        match self {
            RouteRole::Primary => role == InstanceRole::Primary,
            RouteRole::Secondary => role == InstanceRole::Secondary,
            RouteRole::PrimaryAndSecondary => true,
        }
    }
}

/// Fixed, ordered backend list.
pub struct StaticDestinations {
    list: Vec<RouteAddress>,
    cursor: AtomicUsize,
}

/// Cache-backed backend set, resolved to a fresh snapshot per connection.
pub struct CacheDestinations {
    cache_name: String,
    replicaset: String,
    role: RouteRole,
    cursor: AtomicUsize,
    cache: RwLock<Option<Arc<dyn MetadataCache>>>,
}

pub enum DestinationSet {
    Static(StaticDestinations),
    Dynamic(CacheDestinations),
}

impl std::fmt::Debug for DestinationSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DestinationSet::Static(_) => f.debug_tuple("Static").finish(),
            DestinationSet::Dynamic(_) => f.debug_tuple("Dynamic").finish(),
        }
    }
}

impl DestinationSet {
    /// Build a static set from a comma-separated address list. Ports default
    /// per protocol; an element matching the route's own bind address is a
    /// configuration error.
    pub fn from_csv(
        csv: &str,
        protocol: ProtocolKind,
        bind_addr: Option<&RouteAddress>,
    ) -> Result<Self, ConfigError> {
        let mut list = Vec::new();
        for part in csv.split(',') {
            let addr = RouteAddress::parse(part)
                .map_err(|e| ConfigError::invalid(e.to_string()))?
                .with_default_port(protocol);
            if let Some(bind) = bind_addr {
                if addr.host == bind.host && addr.port == bind.port {
                    return Err(ConfigError::invalid(format!(
                        "Destination address '{}' is the same as the bind address of this route",
                        addr
                    )));
                }
            }
            list.push(addr);
        }
        if list.is_empty() {
            return Err(ConfigError::invalid(
                "Destination address list may not be empty",
            ));
        }
        Ok(DestinationSet::Static(StaticDestinations {
            list,
            cursor: AtomicUsize::new(0),
        }))
    }

    /// Build a dynamic set from a `metadata-cache://<name>/<replicaset>?role=`
    /// URI. The cache itself is attached later with [`Self::bind_cache`].
    pub fn from_uri(uri: &str) -> Result<Self, ConfigError> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| ConfigError::invalid(format!("Invalid destination URI: '{}'", uri)))?;
        if scheme != METADATA_CACHE_SCHEME {
            return Err(ConfigError::invalid(format!(
                "Invalid URI scheme; expecting: '{}' is: '{}'",
                METADATA_CACHE_SCHEME, scheme
            )));
        }

        let (location, query) = match rest.split_once('?') {
            Some((location, query)) => (location, Some(query)),
            None => (rest, None),
        };
        let (cache_name, replicaset) = match location.split_once('/') {
            Some((name, path)) => (name, path.trim_end_matches('/')),
            None => (location, ""),
        };
        if cache_name.is_empty() {
            return Err(ConfigError::invalid(format!(
                "Invalid destination URI: '{}'",
                uri
            )));
        }

        let role_value = query.and_then(|q| {
            q.split('&')
                .filter_map(|pair| pair.split_once('='))
                .find(|(key, _)| *key == "role")
                .map(|(_, value)| value)
        });
        let role = match role_value {
            None => {
                return Err(ConfigError::invalid(
                    "Missing 'role' in routing destination specification",
                ))
            }
            Some(value) => RouteRole::from_uri_value(value).ok_or_else(|| {
                ConfigError::invalid(format!(
                    "Invalid 'role' in routing destination specification: '{}'",
                    value
                ))
            })?,
        };

        Ok(DestinationSet::Dynamic(CacheDestinations {
            cache_name: cache_name.to_string(),
            replicaset: replicaset.to_string(),
            role,
            cursor: AtomicUsize::new(0),
            cache: RwLock::new(None),
        }))
    }

    /// Pick the destination for a new client connection, or `None` when the
    /// set has nothing suitable for this access mode.
    pub fn next(&self, mode: AccessMode) -> Option<RouteAddress> {
        match self {
            DestinationSet::Static(s) => {
                if s.list.is_empty() {
                    return None;
                }
                let idx = s.cursor.fetch_add(1, Ordering::Relaxed) % s.list.len();
                Some(s.list[idx].clone())
            }
            DestinationSet::Dynamic(d) => {
                let candidates = d.candidates(mode);
                if candidates.is_empty() {
                    return None;
                }
                let idx = d.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
                Some(candidates[idx].clone())
            }
        }
    }

    /// How many destinations a dial loop should try before giving up.
    pub fn available(&self, mode: AccessMode) -> usize {
        match self {
            DestinationSet::Static(s) => s.list.len(),
            DestinationSet::Dynamic(d) => d.candidates(mode).len(),
        }
    }

    /// Attach the named cache to a dynamic set. Returns false for static
    /// sets, which have no cache to bind.
    pub fn bind_cache(&self, cache: Arc<dyn MetadataCache>) -> bool {
        match self {
            DestinationSet::Static(_) => false,
            DestinationSet::Dynamic(d) => {
                *d.cache.write().unwrap() = Some(cache);
                true
            }
        }
    }

    /// Name of the cache a dynamic set reads from.
    pub fn cache_name(&self) -> Option<&str> {
        match self {
            DestinationSet::Static(_) => None,
            DestinationSet::Dynamic(d) => Some(&d.cache_name),
        }
    }

    /// Stable textual form of a static list; dynamic sets have none.
    pub fn to_csv(&self) -> Option<String> {
        match self {
            DestinationSet::Static(s) => Some(
                s.list
                    .iter()
                    .map(|a| a.to_string())
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            DestinationSet::Dynamic(_) => None,
        }
    }
}

impl CacheDestinations {
    fn candidates(&self, mode: AccessMode) -> Vec<RouteAddress> {
        let cache = match self.cache.read().unwrap().clone() {
            Some(cache) => cache,
            None => return Vec::new(),
        };
        let instances = cache.instances(&self.replicaset);
        let allowed: Vec<_> = instances
            .into_iter()
            .filter(|i| self.role.admits(i.role))
            .collect();

        match mode {
            AccessMode::ReadWrite => allowed
                .into_iter()
                .filter(|i| i.role == InstanceRole::Primary)
                .map(|i| i.addr)
                .collect(),
            AccessMode::ReadOnly => {
                let secondaries: Vec<_> = allowed
                    .iter()
                    .filter(|i| i.role == InstanceRole::Secondary)
                    .map(|i| i.addr.clone())
                    .collect();
                if !secondaries.is_empty() {
                    secondaries
                } else {
                    allowed
                        .into_iter()
                        .filter(|i| i.role == InstanceRole::Primary)
                        .map(|i| i.addr)
                        .collect()
                }
            }
        }
    }
}
