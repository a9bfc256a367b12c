//! Hostname registry shared by the control plane and the public listeners
//!
//! Records hold only a weak reference to their owning session, so a record
//! left behind by a session that died without cleanup is treated as free.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::{debug, trace};

/// What the registry needs to know about a session
pub trait SessionHandle: Send + Sync + 'static {
    /// False once the session has been cancelled
    fn is_live(&self) -> bool;
}

/// Registry errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Hostname {hostname} is owned by session {owner}")]
    HostnameConflict { hostname: String, owner: String },
}

/// Binding of one hostname to a session
pub struct TunnelRecord<S> {
    pub hostname: String,
    pub session_id: String,
    pub session: Weak<S>,
    pub local_port: u16,
    /// Data-plane channels currently open for this hostname
    pub channels: HashSet<u64>,
    pub created_at: DateTime<Utc>,
}

impl<S: SessionHandle> TunnelRecord<S> {
    pub fn new(
        hostname: impl Into<String>,
        session_id: impl Into<String>,
        session: &Arc<S>,
        local_port: u16,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            session_id: session_id.into(),
            session: Arc::downgrade(session),
            local_port,
            channels: HashSet::new(),
            created_at: Utc::now(),
        }
    }

    /// Upgrade to the owning session if it is still live
    pub fn live_session(&self) -> Option<Arc<S>> {
        self.session.upgrade().filter(|s| s.is_live())
    }

    pub fn is_live(&self) -> bool {
        self.live_session().is_some()
    }
}

impl<S> Clone for TunnelRecord<S> {
    fn clone(&self) -> Self {
        Self {
            hostname: self.hostname.clone(),
            session_id: self.session_id.clone(),
            session: self.session.clone(),
            local_port: self.local_port,
            channels: self.channels.clone(),
            created_at: self.created_at,
        }
    }
}

impl<S> fmt::Debug for TunnelRecord<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelRecord")
            .field("hostname", &self.hostname)
            .field("session_id", &self.session_id)
            .field("local_port", &self.local_port)
            .field("channels", &self.channels.len())
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Concurrent hostname → tunnel map
pub struct HostnameRegistry<S> {
    records: DashMap<String, TunnelRecord<S>>,
}

impl<S: SessionHandle> HostnameRegistry<S> {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    /// Insert or replace a binding
    ///
    /// Fails if a different live session holds the hostname. Returns the
    /// replaced record (same owner, or a dead one).
    pub fn put(&self, record: TunnelRecord<S>) -> Result<Option<TunnelRecord<S>>, RegistryError> {
        match self.records.entry(record.hostname.clone()) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get();
                if existing.session_id != record.session_id && existing.is_live() {
                    return Err(RegistryError::HostnameConflict {
                        hostname: record.hostname,
                        owner: existing.session_id.clone(),
                    });
                }

                debug!(
                    hostname = %record.hostname,
                    session_id = %record.session_id,
                    previous_owner = %existing.session_id,
                    "Replacing tunnel record"
                );
                Ok(Some(entry.insert(record)))
            }
            Entry::Vacant(entry) => {
                debug!(
                    hostname = %record.hostname,
                    session_id = %record.session_id,
                    local_port = record.local_port,
                    "Registering tunnel record"
                );
                entry.insert(record);
                Ok(None)
            }
        }
    }

    /// Snapshot of the record for a hostname
    pub fn get(&self, hostname: &str) -> Option<TunnelRecord<S>> {
        let record = self.records.get(hostname).map(|r| r.value().clone());
        trace!(hostname, found = record.is_some(), "Registry lookup");
        record
    }

    /// Whether a live session currently owns the hostname
    pub fn is_routable(&self, hostname: &str) -> bool {
        self.records
            .get(hostname)
            .map(|r| r.value().is_live())
            .unwrap_or(false)
    }

    /// Remove a binding only if `session_id` owns it
    pub fn remove_if_owner(&self, hostname: &str, session_id: &str) -> bool {
        let removed = self
            .records
            .remove_if(hostname, |_, record| record.session_id == session_id)
            .is_some();
        if removed {
            debug!(hostname, session_id, "Removed tunnel record");
        }
        removed
    }

    /// Remove every binding owned by a session, returning the hostnames
    pub fn remove_all_owned_by(&self, session_id: &str) -> Vec<String> {
        let mut removed = Vec::new();
        self.records.retain(|hostname, record| {
            if record.session_id == session_id {
                removed.push(hostname.clone());
                false
            } else {
                true
            }
        });
        if !removed.is_empty() {
            debug!(session_id, hostnames = ?removed, "Removed session's tunnel records");
        }
        removed
    }

    /// Record an open channel; false if the binding moved away
    pub fn track_channel(&self, hostname: &str, session_id: &str, channel_id: u64) -> bool {
        match self.records.get_mut(hostname) {
            Some(mut record) if record.session_id == session_id => {
                record.channels.insert(channel_id);
                true
            }
            _ => false,
        }
    }

    pub fn untrack_channel(&self, hostname: &str, session_id: &str, channel_id: u64) {
        if let Some(mut record) = self.records.get_mut(hostname) {
            if record.session_id == session_id {
                record.channels.remove(&channel_id);
            }
        }
    }

    pub fn hostnames(&self) -> Vec<String> {
        self.records.iter().map(|r| r.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl<S: SessionHandle> Default for HostnameRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}
