//! WebSocket client registry with concurrent broadcast.
//!
//! [`Gateway`] is the single authority over which connections receive
//! broadcasts. Each connection hands the gateway the sending half of its
//! bounded outbound queue; a per-connection writer task drains the other half
//! into the socket. The gateway never touches sockets directly.
//!
//! ## Concurrency
//!
//! The member map sits behind a `std::sync::RwLock` that is only held for
//! map operations, never across an `.await`. [`Gateway::broadcast`] copies the
//! member senders under the read lock, releases it, then sends to every member
//! concurrently. Members whose queue is closed are evicted afterwards under the
//! write lock. Joins and leaves that race a broadcast are safe: a late joiner
//! may or may not see that broadcast, and a member that leaves mid-broadcast
//! just shows up as a closed queue.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, Utf8Bytes};
use futures::future::join_all;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tracing::{debug, warn};
use uuid::Uuid;

/// Unique identity of one WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(Uuid);

impl ClientId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A broadcast message. Cloning is cheap (reference-counted buffers).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(Utf8Bytes),
    Binary(Bytes),
}

impl Payload {
    pub fn text(text: impl Into<Utf8Bytes>) -> Self {
        Self::Text(text.into())
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::Binary(data.into())
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Text(t) => t.as_str().len(),
            Self::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Payload> for Message {
    fn from(payload: Payload) -> Self {
        match payload {
            Payload::Text(text) => Message::Text(text),
            Payload::Binary(data) => Message::Binary(data),
        }
    }
}

/// Sending half of a client's outbound queue.
pub type ClientSender = mpsc::Sender<Payload>;

/// Outcome of one [`Gateway::broadcast`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Members whose queue accepted the payload.
    pub delivered: usize,
    /// Members that stayed full past the send timeout; they keep their
    /// membership but miss this payload.
    pub dropped: usize,
    /// Members found closed and removed.
    pub evicted: usize,
}

/// Registry of live WebSocket connections.
///
/// Cloneable — all clones share the same inner map.
#[derive(Clone)]
pub struct Gateway {
    clients: Arc<RwLock<HashMap<ClientId, ClientSender>>>,
    send_timeout: Duration,
}

impl Gateway {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            clients: Arc::new(RwLock::new(HashMap::new())),
            send_timeout,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ClientId, ClientSender>> {
        self.clients.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ClientId, ClientSender>> {
        self.clients.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a client. Returns `false` (and leaves the existing entry alone)
    /// if `id` is already registered.
    pub fn add_client(&self, id: ClientId, sender: ClientSender) -> bool {
        let mut clients = self.write();
        if clients.contains_key(&id) {
            return false;
        }
        clients.insert(id, sender);
        debug!(client_id = %id, clients = clients.len(), "Client registered");
        true
    }

    /// Remove a client. Returns `false` if it was not registered.
    pub fn remove_client(&self, id: ClientId) -> bool {
        let mut clients = self.write();
        let removed = clients.remove(&id).is_some();
        if removed {
            debug!(client_id = %id, clients = clients.len(), "Client deregistered");
        }
        removed
    }

    /// Register a new client under a fresh id. The returned guard removes it
    /// again when dropped.
    pub fn join(&self, sender: ClientSender) -> Membership {
        let mut id = ClientId::new();
        while !self.add_client(id, sender.clone()) {
            id = ClientId::new();
        }
        Membership {
            id,
            gateway: self.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: ClientId) -> bool {
        self.read().contains_key(&id)
    }

    pub fn client_count(&self) -> usize {
        self.read().len()
    }

    /// Drop every member. Their outbound queues close, which makes each
    /// writer task send a close frame and exit.
    pub fn clear(&self) -> usize {
        let mut clients = self.write();
        let count = clients.len();
        clients.clear();
        count
    }

    /// Deliver `payload` to every client registered when the call starts.
    ///
    /// Never fails as a whole. Closed members are evicted; members that stay
    /// full past the send timeout miss this payload.
    pub async fn broadcast(&self, payload: Payload) -> BroadcastReport {
        let members: Vec<(ClientId, ClientSender)> = self
            .read()
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        if members.is_empty() {
            return BroadcastReport::default();
        }

        let timeout = self.send_timeout;
        let sends = members.into_iter().map(|(id, tx)| {
            let payload = payload.clone();
            async move { (id, tx.send_timeout(payload, timeout).await) }
        });
        let results = join_all(sends).await;

        let mut report = BroadcastReport::default();
        let mut dead = Vec::new();
        for (id, result) in results {
            match result {
                Ok(()) => report.delivered += 1,
                Err(SendTimeoutError::Timeout(_)) => {
                    warn!(client_id = %id, "Client queue full, dropping broadcast");
                    report.dropped += 1;
                }
                Err(SendTimeoutError::Closed(_)) => dead.push(id),
            }
        }

        if !dead.is_empty() {
            let mut clients = self.write();
            for id in &dead {
                if clients.remove(id).is_some() {
                    report.evicted += 1;
                    debug!(client_id = %id, "Evicted closed client during broadcast");
                }
            }
        }

        report
    }
}

/// Registration guard returned by [`Gateway::join`].
///
/// Deregisters on drop, so a connection handler that returns early, errors,
/// panics or is cancelled still leaves the registry.
pub struct Membership {
    id: ClientId,
    gateway: Gateway,
}

impl Membership {
    pub fn id(&self) -> ClientId {
        self.id
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        self.gateway.remove_client(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> Gateway {
        Gateway::new(Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_member_once() {
        let gw = gateway();
        let mut receivers = Vec::new();
        let mut memberships = Vec::new();
        for _ in 0..5 {
            let (tx, rx) = mpsc::channel(8);
            memberships.push(gw.join(tx));
            receivers.push(rx);
        }

        let report = gw.broadcast(Payload::text("hello")).await;
        assert_eq!(report.delivered, 5);
        assert_eq!(report.evicted, 0);

        for rx in &mut receivers {
            assert_eq!(rx.recv().await, Some(Payload::text("hello")));
            assert!(rx.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn test_add_client_is_idempotent() {
        let gw = gateway();
        let (tx, _rx) = mpsc::channel(1);
        let id = ClientId::new();
        assert!(gw.add_client(id, tx.clone()));
        assert!(!gw.add_client(id, tx));
        assert_eq!(gw.client_count(), 1);
        assert!(gw.remove_client(id));
        assert!(!gw.remove_client(id));
    }

    #[tokio::test]
    async fn test_membership_drop_deregisters() {
        let gw = gateway();
        let (tx, _rx) = mpsc::channel(1);
        let membership = gw.join(tx);
        let id = membership.id();
        assert!(gw.contains(id));
        drop(membership);
        assert!(!gw.contains(id));
        assert_eq!(gw.client_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_member_is_evicted_without_affecting_others() {
        let gw = gateway();
        let (live_tx, mut live_rx) = mpsc::channel(4);
        let (dead_tx, dead_rx) = mpsc::channel(4);
        let _live = gw.join(live_tx);
        let dead = gw.join(dead_tx);
        let dead_id = dead.id();
        drop(dead_rx);

        let report = gw.broadcast(Payload::binary(vec![1u8, 2, 3])).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.evicted, 1);
        assert!(!gw.contains(dead_id));
        assert_eq!(
            live_rx.recv().await,
            Some(Payload::Binary(Bytes::from_static(&[1, 2, 3])))
        );

        // The guard's own removal after eviction is a no-op.
        drop(dead);
        assert_eq!(gw.client_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_member_drops_payload_but_stays_registered() {
        let gw = gateway();
        let (slow_tx, mut slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(4);
        let slow = gw.join(slow_tx);
        let _fast = gw.join(fast_tx);

        gw.broadcast(Payload::text("first")).await;
        let report = gw.broadcast(Payload::text("second")).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped, 1);
        assert!(gw.contains(slow.id()));

        assert_eq!(slow_rx.recv().await, Some(Payload::text("first")));
        assert!(slow_rx.try_recv().is_err());
        assert_eq!(fast_rx.recv().await, Some(Payload::text("first")));
        assert_eq!(fast_rx.recv().await, Some(Payload::text("second")));
    }

    #[tokio::test]
    async fn test_broadcast_with_no_members() {
        let gw = gateway();
        assert_eq!(
            gw.broadcast(Payload::text("nobody")).await,
            BroadcastReport::default()
        );
    }

    #[tokio::test]
    async fn test_clear_closes_member_queues() {
        let gw = gateway();
        let (tx, mut rx) = mpsc::channel(1);
        let membership = gw.join(tx);
        assert_eq!(gw.clear(), 1);
        assert_eq!(rx.recv().await, None);
        drop(membership);
        assert_eq!(gw.client_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_join_leave_and_broadcast() {
        let gw = gateway();
        let mut tasks = Vec::new();

        for _ in 0..16 {
            let gw = gw.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let (tx, mut rx) = mpsc::channel(64);
                    let membership = gw.join(tx);
                    tokio::task::yield_now().await;
                    while rx.try_recv().is_ok() {}
                    drop(membership);
                }
            }));
        }
        for n in 0..4 {
            let gw = gw.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..50 {
                    gw.broadcast(Payload::text(format!("{n}:{i}"))).await;
                }
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(gw.client_count(), 0);
    }
}
