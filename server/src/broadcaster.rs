//! Fan-out of chat lines to every active session
//!
//! The roster lives behind one async mutex. Registration, removal and every
//! fan-out take that lock, so two broadcasts never interleave at any peer and a
//! session removed before a broadcast never sees it. Delivery itself only
//! enqueues (see [`SessionHandle::deliver`]), so holding the lock across a
//! fan-out never waits on a peer.

use crate::client_manager::ClientManager;
use crate::session::SessionHandle;
use log::{debug, info, warn};
use shared::{chat_message, connected_message, disconnected_message};
use std::collections::VecDeque;
use tokio::sync::{mpsc, Mutex};

pub struct Broadcaster {
    clients: Mutex<ClientManager>,
    /// Local display sink, an implicit member of every broadcast
    display: mpsc::UnboundedSender<String>,
}

impl Broadcaster {
    pub fn new(display: mpsc::UnboundedSender<String>) -> Self {
        Self {
            clients: Mutex::new(ClientManager::new()),
            display,
        }
    }

    /// Reserves a fresh identity under the roster lock
    pub async fn next_identity(&self) -> String {
        self.clients.lock().await.allocate_identity()
    }

    /// Adds `session` and announces it to everyone, itself and the local sink included
    pub async fn register(&self, session: SessionHandle) {
        let mut clients = self.clients.lock().await;
        let identity = session.identity().to_string();

        if !clients.add_client(session) {
            warn!("Ignoring duplicate registration for {}", identity);
            return;
        }

        info!("{} registered ({} active)", identity, clients.len());
        self.fan_out(&mut clients, connected_message(&identity));
    }

    /// Relays a line received from `session` to the whole roster and the local sink.
    ///
    /// Lines from a session that is no longer in the roster are dropped: its
    /// departure has already been announced.
    pub async fn on_line(&self, session: &SessionHandle, text: &str) {
        let mut clients = self.clients.lock().await;

        if !clients.contains(session.identity()) {
            debug!("Dropping line from departed {}", session.identity());
            return;
        }

        self.fan_out(&mut clients, chat_message(session.identity(), text));
    }

    /// Removes `session` and tells the rest. A second call for the same session is a no-op.
    pub async fn on_disconnect(&self, session: &SessionHandle) {
        let mut clients = self.clients.lock().await;

        if clients.remove_client(session.identity()).is_none() {
            debug!("{} already removed", session.identity());
            return;
        }

        info!("{} disconnected ({} active)", session.identity(), clients.len());
        self.fan_out(&mut clients, disconnected_message(session.identity()));
    }

    /// Sends a line to the local sink only
    pub fn display(&self, line: String) {
        if self.display.send(line).is_err() {
            debug!("Local display sink is gone");
        }
    }

    /// Asks every registered session to shut down
    pub async fn close_all(&self) {
        let clients = self.clients.lock().await;
        info!("Closing {} sessions", clients.len());

        for client in clients.iter() {
            client.close();
        }
    }

    /// Identities currently in the roster, oldest first
    pub async fn roster(&self) -> Vec<String> {
        self.clients.lock().await.identities()
    }

    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.lock().await.is_empty()
    }

    /// Delivers `line` to the sink and every member while the caller holds the lock.
    ///
    /// A member whose delivery fails is evicted on the spot and its departure
    /// is queued as a further broadcast to whoever remains, so one dead peer
    /// never stops the others from receiving.
    fn fan_out(&self, clients: &mut ClientManager, line: String) {
        let mut pending = VecDeque::from([line]);

        while let Some(line) = pending.pop_front() {
            debug!("Broadcasting to {} clients: {}", clients.len(), line);

            let failed: Vec<String> = clients
                .iter()
                .filter_map(|client| match client.deliver(&line) {
                    Ok(()) => None,
                    Err(e) => {
                        warn!("Delivery to {} failed: {}", client.identity(), e);
                        Some(client.identity().to_string())
                    }
                })
                .collect();

            self.display(line);

            for identity in failed {
                if let Some(client) = clients.remove_client(&identity) {
                    client.close();
                    pending.push_back(disconnected_message(&identity));
                }
            }
        }
    }
}
