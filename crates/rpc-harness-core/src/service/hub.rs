//! Registry of open websocket sockets of one container.

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::wire::ServerFrame;

/// Open sockets by server-issued id, with push helpers.
#[derive(Debug, Default)]
pub struct WebSocketHub {
    sockets: DashMap<String, mpsc::UnboundedSender<ServerFrame>>,
}

impl WebSocketHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, socket_id: &str, outbound: mpsc::UnboundedSender<ServerFrame>) {
        self.sockets.insert(socket_id.to_string(), outbound);
        debug!(socket_id = %socket_id, "socket registered");
    }

    pub(crate) fn unregister(&self, socket_id: &str) {
        if self.sockets.remove(socket_id).is_some() {
            debug!(socket_id = %socket_id, "socket released");
        }
    }

    /// Ids of all open sockets, sorted.
    #[must_use]
    pub fn socket_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.sockets.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Whether `socket_id` is open.
    #[must_use]
    pub fn contains(&self, socket_id: &str) -> bool {
        self.sockets.contains_key(socket_id)
    }

    /// Number of open sockets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    /// Whether no socket is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    /// Send an event to every open socket. Returns how many were reached.
    pub fn broadcast(&self, event: &str, data: Value) -> usize {
        self.sockets
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .send(ServerFrame::Event {
                        event: event.to_string(),
                        data: data.clone(),
                    })
                    .is_ok()
            })
            .count()
    }

    /// Send an event to one socket. Returns `false` if it is not open.
    pub fn unicast(&self, socket_id: &str, event: &str, data: Value) -> bool {
        self.sockets.get(socket_id).is_some_and(|outbound| {
            outbound
                .send(ServerFrame::Event {
                    event: event.to_string(),
                    data,
                })
                .is_ok()
        })
    }
}
