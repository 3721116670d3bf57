//! # Session Registry
//!
//! Process-wide map from call id to the live [`CallSession`] of that call, plus the
//! voice service connection attached to it. An explicit object held in `AppState`,
//! never a global.
//!
//! ## Invariants:
//! - at most one live session per call id
//! - a session leaves the registry exactly once, through [`SessionRegistry::teardown`]
//!
//! Locks are held only for map and session mutations, never across an await.

use crate::call::session::CallSession;
use crate::voice::VoiceConnection;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

pub type SharedSession = Arc<Mutex<CallSession>>;

struct RegistryEntry {
    session: SharedSession,
    upstream: Option<VoiceConnection>,
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    entries: Arc<RwLock<HashMap<String, RegistryEntry>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the session for `call_id`, creating it when absent.
    ///
    /// Calling this twice with the same id yields the same handle. A caller address
    /// supplied for an existing session is recorded only if it has none yet.
    pub fn on_create(&self, call_id: &str, caller_address: Option<String>) -> SharedSession {
        let mut entries = self.entries.write();

        if let Some(entry) = entries.get(call_id) {
            if let Some(address) = caller_address {
                entry.session.lock().set_caller_address(address);
            }
            return entry.session.clone();
        }

        let session = Arc::new(Mutex::new(CallSession::new(call_id, caller_address)));
        entries.insert(
            call_id.to_string(),
            RegistryEntry {
                session: session.clone(),
                upstream: None,
            },
        );
        info!(call_id = %call_id, active_calls = entries.len(), "Call session registered");
        session
    }

    #[cfg(test)]
    pub fn get(&self, call_id: &str) -> Option<SharedSession> {
        self.entries.read().get(call_id).map(|entry| entry.session.clone())
    }

    #[cfg(test)]
    pub fn contains(&self, call_id: &str) -> bool {
        self.entries.read().contains_key(call_id)
    }

    /// Remember the voice connection of a live call so shutdown can reach it.
    /// Returns false when the call is no longer registered.
    pub fn attach_upstream(&self, session: &SharedSession, upstream: VoiceConnection) -> bool {
        let mut entries = self.entries.write();
        match entries.get_mut(upstream.call_id()) {
            Some(entry) if Arc::ptr_eq(&entry.session, session) => {
                entry.upstream = Some(upstream);
                true
            }
            _ => false,
        }
    }

    /// Downstream-close teardown: close the voice connection if it is still open,
    /// clean the transcript and deregister the session.
    ///
    /// Returns the cleaned transcript the first time it runs for a session and `None`
    /// on every later call, so a close that fires twice removes the entry once.
    pub fn teardown(&self, session: &SharedSession, upstream: Option<&VoiceConnection>) -> Option<String> {
        let call_id = {
            let mut guard = session.lock();
            if !guard.begin_close() {
                debug!(call_id = %guard.call_id(), phase = guard.phase().as_str(), "Teardown already done");
                return None;
            }
            guard.call_id().to_string()
        };

        let removed = {
            let mut entries = self.entries.write();
            match entries.get(&call_id) {
                Some(entry) if Arc::ptr_eq(&entry.session, session) => entries.remove(&call_id),
                _ => None,
            }
        };

        if let Some(conn) = upstream.or_else(|| removed.as_ref().and_then(|entry| entry.upstream.as_ref())) {
            if conn.is_open() {
                conn.close();
            }
        }

        let cleaned = session.lock().finish_close();
        info!(
            call_id = %call_id,
            deregistered = removed.is_some(),
            active_calls = self.len(),
            "Call session torn down"
        );
        Some(cleaned)
    }

    /// Close every attached voice connection. Used on process shutdown.
    pub fn close_all_upstreams(&self) -> usize {
        let entries = self.entries.read();
        let mut closed = 0;
        for entry in entries.values() {
            if let Some(conn) = &entry.upstream {
                if conn.is_open() {
                    conn.close();
                    closed += 1;
                }
            }
        }
        closed
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn call_ids(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }
}
