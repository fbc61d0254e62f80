//! Set of listeners currently receiving the stream
//!
//! Listeners join implicitly: the first datagram seen from an address
//! registers it. There is no handshake or authentication, so any host able
//! to send from a given (address, port) pair is indistinguishable from the
//! listener that registered it.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::net::SocketAddr;

/// A receiver identity
pub type Endpoint = SocketAddr;

/// Liveness metadata of a registered endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientInfo {
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub datagrams_received: u64,
}

impl ClientInfo {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            first_seen: now,
            last_seen: now,
            datagrams_received: 1,
        }
    }
}

/// Serializable view of one registry entry
#[derive(Debug, Clone, Serialize)]
pub struct ClientSnapshot {
    pub endpoint: Endpoint,
    #[serde(flatten)]
    pub info: ClientInfo,
}

/// Registry of known endpoints, shared by the receive and flush threads
#[derive(Default)]
pub struct ClientRegistry {
    clients: DashMap<Endpoint, ClientInfo>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record traffic from `endpoint`. Returns true if it was not registered.
    pub fn observe(&self, endpoint: Endpoint) -> bool {
        let now = Utc::now();
        let mut is_new = false;

        self.clients
            .entry(endpoint)
            .and_modify(|info| {
                info.last_seen = now;
                info.datagrams_received += 1;
            })
            .or_insert_with(|| {
                is_new = true;
                ClientInfo::new(now)
            });

        is_new
    }

    /// Remove `endpoint`. Returns true if it was registered.
    pub fn remove(&self, endpoint: &Endpoint) -> bool {
        self.clients.remove(endpoint).is_some()
    }

    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.clients.contains_key(endpoint)
    }

    pub fn get(&self, endpoint: &Endpoint) -> Option<ClientInfo> {
        self.clients.get(endpoint).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Copy of the current endpoint set
    ///
    /// Callers iterate the copy, so the map is never locked while sending.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.clients.iter().map(|entry| *entry.key()).collect()
    }

    pub fn snapshot(&self) -> Vec<ClientSnapshot> {
        let mut clients: Vec<ClientSnapshot> = self
            .clients
            .iter()
            .map(|entry| ClientSnapshot {
                endpoint: *entry.key(),
                info: entry.value().clone(),
            })
            .collect();
        clients.sort_by_key(|c| c.info.first_seen);
        clients
    }

    pub fn clear(&self) {
        self.clients.clear();
    }
}
