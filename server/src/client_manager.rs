//! Roster of active sessions
//!
//! Tracks which sessions are eligible to receive broadcasts and hands out
//! identities. The roster is plain data; the [`crate::broadcaster::Broadcaster`]
//! owns it behind the single lock that serializes every membership change and
//! every fan-out.

use crate::session::SessionHandle;
use log::info;
use shared::identity_for;

/// Active sessions in registration order, plus the identity counter
pub struct ClientManager {
    /// Registered sessions, oldest first
    clients: Vec<SessionHandle>,
    /// Sequence number for the next identity
    next_client_id: u32,
}

impl ClientManager {
    /// Creates an empty roster. Identities start at `Client0`.
    pub fn new() -> Self {
        Self {
            clients: Vec::new(),
            next_client_id: 0,
        }
    }

    /// Reserves the next identity.
    ///
    /// The counter never goes backwards, so identities stay unique for the
    /// life of the process even when sessions come and go concurrently.
    pub fn allocate_identity(&mut self) -> String {
        let identity = identity_for(self.next_client_id);
        self.next_client_id += 1;
        identity
    }

    /// Adds a session. Returns false, leaving the roster untouched, if its
    /// identity is already present.
    pub fn add_client(&mut self, client: SessionHandle) -> bool {
        if self.contains(client.identity()) {
            return false;
        }

        info!("{} joined the roster", client.identity());
        self.clients.push(client);
        true
    }

    /// Removes a session by identity, handing it back if it was present
    pub fn remove_client(&mut self, identity: &str) -> Option<SessionHandle> {
        let index = self
            .clients
            .iter()
            .position(|client| client.identity() == identity)?;

        let client = self.clients.remove(index);
        info!("{} left the roster", identity);
        Some(client)
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.clients.iter().any(|client| client.identity() == identity)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SessionHandle> {
        self.clients.iter()
    }

    /// Identities of the current members, oldest first
    pub fn identities(&self) -> Vec<String> {
        self.clients
            .iter()
            .map(|client| client.identity().to_string())
            .collect()
    }

    /// Returns the number of registered sessions
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl Default for ClientManager {
    fn default() -> Self {
        Self::new()
    }
}
