//! Real-Time Fabric (C4): the long-lived-connection server. Owns the
//! connection table, authentication hook, broadcast filters, and the
//! heartbeat/timeout sweep. Wire framing (SSE vs. WebSocket) and the actual
//! network I/O live at the HTTP boundary; this module is transport-agnostic
//! and speaks in pre-formatted outbound frames.

pub mod auth;

pub use auth::{Authenticator, DefaultAuthenticator, HandshakeParams};

use crate::model::{now_ms, Connection, ConnectionState, TransportKind};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    #[error("connection cap exceeded for {transport:?} ({max} max)")]
    ConnectionCapExceeded { transport: TransportKind, max: usize },
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("unknown connection: {0}")]
    UnknownConnection(String),
    #[error("subscription channel not authorized: {0}")]
    SubscriptionUnauthorized(String),
}

/// The narrow interface the Web Processor depends on, breaking the cycle
/// between it and the fabric that would otherwise exist if it held a
/// concrete `RealtimeFabric`.
pub trait BroadcastTarget: Send + Sync {
    fn send_to_organization(&self, tenant_id: &str, message: Arc<str>) -> usize;
    fn send_to_site(&self, site_id: &str, message: Arc<str>) -> usize;
    fn send_to_user(&self, user_id: &str, message: Arc<str>) -> usize;
    fn send_to_channel(&self, channel: &str, message: Arc<str>) -> usize;
    fn connection_count_for_user(&self, user_id: &str) -> usize;

    /// Resolves the target connection set the way the Web Processor needs:
    /// by user IDs if targeted, else by site, else by tenant. Returns
    /// `(matched, sent)` so the caller can classify sent/partial/failed.
    fn send_targeted(
        &self,
        tenant_id: &str,
        site_id: Option<&str>,
        user_ids: &[String],
        message: Arc<str>,
    ) -> (usize, usize);
}

struct Entry {
    conn: Connection,
    sender: UnboundedSender<Arc<str>>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RealtimeStats {
    pub total_connections: usize,
    pub push_stream: usize,
    pub bidirectional: usize,
}

pub struct RealtimeFabric {
    connections: DashMap<String, Entry>,
    max_push_stream: usize,
    max_bidirectional: usize,
    messages_sent: AtomicU64,
    rejected_cap: AtomicU64,
}

impl RealtimeFabric {
    pub fn new(max_push_stream: usize, max_bidirectional: usize) -> Self {
        Self {
            connections: DashMap::new(),
            max_push_stream,
            max_bidirectional,
            messages_sent: AtomicU64::new(0),
            rejected_cap: AtomicU64::new(0),
        }
    }

    fn count_by_transport(&self, transport: TransportKind) -> usize {
        self.connections.iter().filter(|e| e.conn.transport == transport).count()
    }

    pub fn register(
        &self,
        conn: Connection,
        sender: UnboundedSender<Arc<str>>,
    ) -> Result<(), RealtimeError> {
        let (count, max) = match conn.transport {
            TransportKind::PushStream => (self.count_by_transport(TransportKind::PushStream), self.max_push_stream),
            TransportKind::BidirectionalFrame => {
                (self.count_by_transport(TransportKind::BidirectionalFrame), self.max_bidirectional)
            }
        };
        if count >= max {
            self.rejected_cap.fetch_add(1, Ordering::Relaxed);
            return Err(RealtimeError::ConnectionCapExceeded { transport: conn.transport, max });
        }
        self.connections.insert(conn.id.clone(), Entry { conn, sender });
        Ok(())
    }

    pub fn unregister(&self, connection_id: &str) -> bool {
        self.connections.remove(connection_id).is_some()
    }

    pub fn touch_activity(&self, connection_id: &str) {
        if let Some(mut entry) = self.connections.get_mut(connection_id) {
            entry.conn.last_activity_ms = now_ms();
            if entry.conn.state == ConnectionState::Handshaking {
                entry.conn.state = ConnectionState::Authenticated;
            }
        }
    }

    pub fn mark_active(&self, connection_id: &str) {
        if let Some(mut entry) = self.connections.get_mut(connection_id) {
            entry.conn.state = ConnectionState::Active;
        }
    }

    pub fn subscribe(&self, connection_id: &str, channel: &str) -> Result<(), RealtimeError> {
        let mut entry = self
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| RealtimeError::UnknownConnection(connection_id.to_string()))?;
        if !entry.conn.authorizes_channel(channel) {
            return Err(RealtimeError::SubscriptionUnauthorized(channel.to_string()));
        }
        entry.conn.subscriptions.insert(channel.to_string());
        Ok(())
    }

    pub fn unsubscribe(&self, connection_id: &str, channel: &str) -> Result<(), RealtimeError> {
        let mut entry = self
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| RealtimeError::UnknownConnection(connection_id.to_string()))?;
        entry.conn.subscriptions.remove(channel);
        Ok(())
    }

    /// Iterates a consistent-enough snapshot of connections and sends
    /// `message` to every one matching `filter`. The message is wrapped in an
    /// `Arc<str>` once by the caller so every matching connection shares the
    /// same allocation rather than re-serializing per recipient.
    pub fn broadcast(&self, message: Arc<str>, filter: impl Fn(&Connection) -> bool) -> usize {
        self.broadcast_counted(message, filter).1
    }

    /// Like [`broadcast`](Self::broadcast) but also reports how many
    /// connections matched the filter, regardless of send outcome.
    pub fn broadcast_counted(&self, message: Arc<str>, filter: impl Fn(&Connection) -> bool) -> (usize, usize) {
        let mut matched = 0;
        let mut sent = 0;
        for entry in self.connections.iter() {
            if filter(&entry.conn) {
                matched += 1;
                if entry.sender.send(message.clone()).is_ok() {
                    sent += 1;
                }
            }
        }
        self.messages_sent.fetch_add(sent as u64, Ordering::Relaxed);
        (matched, sent)
    }

    pub fn send_targeted(
        &self,
        tenant_id: &str,
        site_id: Option<&str>,
        user_ids: &[String],
        message: Arc<str>,
    ) -> (usize, usize) {
        if !user_ids.is_empty() {
            let set: HashSet<&str> = user_ids.iter().map(String::as_str).collect();
            self.broadcast_counted(message, |c| c.user_id.as_deref().is_some_and(|u| set.contains(u)))
        } else if let Some(site_id) = site_id {
            self.broadcast_counted(message, |c| c.site_id.as_deref() == Some(site_id))
        } else {
            self.broadcast_counted(message, |c| c.tenant_id == tenant_id)
        }
    }

    pub fn send_to_organization(&self, tenant_id: &str, message: Arc<str>) -> usize {
        self.broadcast(message, |c| c.tenant_id == tenant_id)
    }

    pub fn send_to_site(&self, site_id: &str, message: Arc<str>) -> usize {
        self.broadcast(message, |c| c.site_id.as_deref() == Some(site_id))
    }

    pub fn send_to_user(&self, user_id: &str, message: Arc<str>) -> usize {
        self.broadcast(message, |c| c.user_id.as_deref() == Some(user_id))
    }

    pub fn send_to_channel(&self, channel: &str, message: Arc<str>) -> usize {
        self.broadcast(message, |c| c.subscriptions.contains(channel))
    }

    pub fn connection_count_for_user(&self, user_id: &str) -> usize {
        self.connections.iter().filter(|e| e.conn.user_id.as_deref() == Some(user_id)).count()
    }

    /// Runs one heartbeat pass: closes connections idle past `timeout`,
    /// pings everyone else. Returns the number of connections closed.
    pub fn heartbeat_tick(&self, ping_message: Arc<str>, timeout: Duration) -> usize {
        let now = now_ms();
        let timeout_ms = timeout.as_millis() as u64;
        let stale: Vec<String> = self
            .connections
            .iter()
            .filter(|e| now.saturating_sub(e.conn.last_activity_ms) > timeout_ms)
            .map(|e| e.conn.id.clone())
            .collect();

        for id in &stale {
            if let Some((_, mut entry)) = self.connections.remove(id).map(|(k, v)| (k, v)) {
                entry.conn.state = ConnectionState::Terminal;
                tracing::debug!(connection_id = %id, "heartbeat timeout, connection closed");
            }
        }

        for entry in self.connections.iter() {
            let _ = entry.sender.send(ping_message.clone());
        }

        stale.len()
    }

    pub fn stats(&self) -> RealtimeStats {
        let mut stats = RealtimeStats::default();
        for entry in self.connections.iter() {
            stats.total_connections += 1;
            match entry.conn.transport {
                TransportKind::PushStream => stats.push_stream += 1,
                TransportKind::BidirectionalFrame => stats.bidirectional += 1,
            }
        }
        stats
    }

    pub fn get(&self, connection_id: &str) -> Option<Connection> {
        self.connections.get(connection_id).map(|e| e.conn.clone())
    }
}

impl BroadcastTarget for RealtimeFabric {
    fn send_to_organization(&self, tenant_id: &str, message: Arc<str>) -> usize {
        RealtimeFabric::send_to_organization(self, tenant_id, message)
    }

    fn send_to_site(&self, site_id: &str, message: Arc<str>) -> usize {
        RealtimeFabric::send_to_site(self, site_id, message)
    }

    fn send_to_user(&self, user_id: &str, message: Arc<str>) -> usize {
        RealtimeFabric::send_to_user(self, user_id, message)
    }

    fn send_to_channel(&self, channel: &str, message: Arc<str>) -> usize {
        RealtimeFabric::send_to_channel(self, channel, message)
    }

    fn connection_count_for_user(&self, user_id: &str) -> usize {
        RealtimeFabric::connection_count_for_user(self, user_id)
    }

    fn send_targeted(
        &self,
        tenant_id: &str,
        site_id: Option<&str>,
        user_ids: &[String],
        message: Arc<str>,
    ) -> (usize, usize) {
        RealtimeFabric::send_targeted(self, tenant_id, site_id, user_ids, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tokio::sync::mpsc;

    fn test_connection(id: &str, transport: TransportKind, tenant: &str, site: Option<&str>, user: Option<&str>) -> Connection {
        Connection {
            id: id.to_string(),
            transport,
            tenant_id: tenant.to_string(),
            site_id: site.map(str::to_string),
            user_id: user.map(str::to_string),
            subscriptions: HashSet::new(),
            connected_at_ms: now_ms(),
            last_activity_ms: now_ms(),
            state: ConnectionState::Handshaking,
        }
    }

    #[test]
    fn broadcast_filters_scenario_matches_seed_test() {
        let fabric = RealtimeFabric::new(10, 10);
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let (tx3, _rx3) = mpsc::unbounded_channel();

        fabric.register(test_connection("c1", TransportKind::PushStream, "T", Some("S1"), None), tx1).unwrap();
        fabric.register(test_connection("c2", TransportKind::PushStream, "T", Some("S2"), None), tx2).unwrap();
        fabric.register(test_connection("c3", TransportKind::PushStream, "U", Some("S3"), None), tx3).unwrap();

        let msg: Arc<str> = Arc::from("hello");
        assert_eq!(fabric.send_to_site("S1", msg.clone()), 1);
        assert_eq!(fabric.send_to_organization("T", msg), 2);
    }

    #[test]
    fn connection_cap_rejects_beyond_max() {
        let fabric = RealtimeFabric::new(1, 1);
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();

        fabric.register(test_connection("c1", TransportKind::PushStream, "T", None, None), tx1).unwrap();
        let result = fabric.register(test_connection("c2", TransportKind::PushStream, "T", None, None), tx2);
        assert!(matches!(result, Err(RealtimeError::ConnectionCapExceeded { .. })));
    }

    #[test]
    fn heartbeat_timeout_unregisters_stale_connections() {
        let fabric = RealtimeFabric::new(10, 10);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut conn = test_connection("c1", TransportKind::PushStream, "T", None, None);
        conn.last_activity_ms = 0;
        fabric.register(conn, tx).unwrap();

        let closed = fabric.heartbeat_tick(Arc::from("ping"), Duration::from_millis(1));
        assert_eq!(closed, 1);
        assert_eq!(fabric.stats().total_connections, 0);
    }

    #[test]
    fn subscribe_rejects_unauthorized_channel() {
        let fabric = RealtimeFabric::new(10, 10);
        let (tx, _rx) = mpsc::unbounded_channel();
        fabric.register(test_connection("c1", TransportKind::PushStream, "acme", None, None), tx).unwrap();

        assert!(fabric.subscribe("c1", "org:acme").is_ok());
        assert!(matches!(fabric.subscribe("c1", "org:other"), Err(RealtimeError::SubscriptionUnauthorized(_))));
    }
}
