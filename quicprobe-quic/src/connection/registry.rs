//! # Connection Registry
//!
//! Owns every connection of an endpoint, keyed by its key cid, plus the
//! routing table from each active local cid to that key.
//!
//! Routes live apart from the connection map so that a frame handler can
//! hold a connection mutably while binding or retiring routes.

#![forbid(unsafe_code)]

use super::state::Connection;
use crate::types::ConnectionId;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Local cid → key cid routing table.
///
/// A cid is bound at most once: neither an active nor a retired cid can
/// be bound again.
#[derive(Debug, Default)]
pub struct CidRoutes {
    active: HashMap<ConnectionId, ConnectionId>,
    retired: HashSet<ConnectionId>,
}

impl CidRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, cid: &ConnectionId) -> Option<&ConnectionId> {
        self.active.get(cid)
    }

    /// True when the cid was ever bound
    pub fn is_known(&self, cid: &ConnectionId) -> bool {
        self.active.contains_key(cid) || self.retired.contains(cid)
    }

    pub fn is_retired(&self, cid: &ConnectionId) -> bool {
        self.retired.contains(cid)
    }

    /// Route `cid` to the connection `key`. Fails if the cid was ever bound.
    pub fn bind(&mut self, cid: ConnectionId, key: ConnectionId) -> bool {
        if self.is_known(&cid) {
            return false;
        }
        self.active.insert(cid, key);
        true
    }

    pub fn retire(&mut self, cid: &ConnectionId) {
        if self.active.remove(cid).is_some() {
            self.retired.insert(cid.clone());
        }
    }

    /// Retire every route that leads to `key`.
    pub fn remove_connection(&mut self, key: &ConnectionId) {
        let cids: Vec<ConnectionId> = self
            .active
            .iter()
            .filter(|(_, target)| *target == key)
            .map(|(cid, _)| cid.clone())
            .collect();
        for cid in cids {
            self.retire(&cid);
        }
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: BTreeMap<ConnectionId, Connection>,
    routes: CidRoutes,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, connection: Connection) {
        self.connections.insert(connection.key_cid().clone(), connection);
    }

    pub fn get(&self, key: &ConnectionId) -> Option<&Connection> {
        self.connections.get(key)
    }

    pub fn get_mut(&mut self, key: &ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(key)
    }

    /// Connection addressed by any of its active local cids
    pub fn route(&self, cid: &ConnectionId) -> Option<&ConnectionId> {
        self.routes.lookup(cid)
    }

    pub fn routes(&self) -> &CidRoutes {
        &self.routes
    }

    pub fn routes_mut(&mut self) -> &mut CidRoutes {
        &mut self.routes
    }

    /// Borrow one connection and the routing table together.
    pub fn split_mut(&mut self, key: &ConnectionId) -> Option<(&mut Connection, &mut CidRoutes)> {
        let connection = self.connections.get_mut(key)?;
        Some((connection, &mut self.routes))
    }

    pub fn keys(&self) -> Vec<ConnectionId> {
        self.connections.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
