//! Live chat connections grouped into per-workspace rooms.
//!
//! Each room sits behind its own `DashMap` entry lock: register, unregister
//! and broadcast on the same room are mutually exclusive, and a broadcast
//! enqueues onto every member before the next one starts, which gives per-room
//! arrival ordering. Sends never await; a member whose bounded outbound queue
//! is full is evicted instead of stalling the room.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use shared::{ErrorCode, Role, ServerFrame};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Why a chat connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    TransportFailure,
    /// Outbound queue overflowed
    Evicted,
    /// Membership removed while connected
    Revoked,
    IdleTimeout,
    TokenExpired,
    Shutdown,
}

impl CloseReason {
    /// WebSocket close code sent to the peer
    pub fn close_code(self) -> u16 {
        match self {
            CloseReason::ClientClosed | CloseReason::IdleTimeout => 1000,
            CloseReason::Shutdown => 1001,
            CloseReason::Evicted => 1008,
            CloseReason::TransportFailure => 1011,
            CloseReason::TokenExpired => 4401,
            CloseReason::Revoked => 4403,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::ClientClosed => "client closed",
            CloseReason::TransportFailure => "transport failure",
            CloseReason::Evicted => "too slow",
            CloseReason::Revoked => "access revoked",
            CloseReason::IdleTimeout => "idle timeout",
            CloseReason::TokenExpired => "token expired",
            CloseReason::Shutdown => "server shutting down",
        }
    }
}

/// One-shot close request shared by a connection's reader, writer and the registry.
/// The first reason recorded wins.
#[derive(Debug, Clone, Default)]
pub struct CloseSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<CloseReason>>,
}

impl CloseSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self, reason: CloseReason) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<CloseReason> {
        self.reason.get().copied()
    }

    /// Resolves once `close` has been called
    pub async fn closed(&self) -> CloseReason {
        self.token.cancelled().await;
        self.reason().unwrap_or(CloseReason::TransportFailure)
    }
}

/// Registry-side view of one open connection
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Role resolved at handshake, updated on membership changes
    pub role: Role,
    pub tx: mpsc::Sender<Arc<String>>,
    pub signal: CloseSignal,
}

#[derive(Debug, Default)]
struct Room {
    members: HashMap<Uuid, ConnectionHandle>,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    rooms: DashMap<Uuid, Room>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, workspace_id: Uuid, handle: ConnectionHandle) {
        let conn_id = handle.id;
        let user_id = handle.user_id;
        let members = {
            let mut room = self.rooms.entry(workspace_id).or_default();
            room.members.insert(conn_id, handle);
            room.members.len()
        };
        tracing::info!(%conn_id, %user_id, %workspace_id, members, "connection registered");
    }

    /// Idempotent; returns whether the connection was still registered
    pub fn unregister(&self, workspace_id: Uuid, conn_id: Uuid) -> bool {
        let removed = match self.rooms.get_mut(&workspace_id) {
            Some(mut room) => room.members.remove(&conn_id).is_some(),
            None => false,
        };
        self.collect_if_empty(workspace_id);
        if removed {
            tracing::info!(%conn_id, %workspace_id, "connection unregistered");
        }
        removed
    }

    /// Queue `frame` for every connection in the room except `exclude`.
    ///
    /// Returns the number of connections the frame was queued for. Connections
    /// whose queue is full or whose writer is gone are removed from the room.
    pub fn broadcast(&self, workspace_id: Uuid, frame: &ServerFrame, exclude: Option<Uuid>) -> usize {
        let payload = match serde_json::to_string(frame) {
            Ok(json) => Arc::new(json),
            Err(e) => {
                tracing::warn!(%workspace_id, error = %e, "failed to serialize frame");
                return 0;
            }
        };

        let delivered = {
            let Some(mut room) = self.rooms.get_mut(&workspace_id) else {
                return 0;
            };

            let mut delivered = 0;
            let mut dead = Vec::new();
            for (conn_id, conn) in room.members.iter() {
                if exclude == Some(*conn_id) {
                    continue;
                }
                match conn.tx.try_send(Arc::clone(&payload)) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        tracing::warn!(%conn_id, user_id = %conn.user_id, %workspace_id, "evicting slow connection");
                        conn.signal.close(CloseReason::Evicted);
                        dead.push(*conn_id);
                    }
                    Err(TrySendError::Closed(_)) => dead.push(*conn_id),
                }
            }
            for conn_id in &dead {
                room.members.remove(conn_id);
            }
            tracing::debug!(%workspace_id, delivered, dropped = dead.len(), "broadcast");
            delivered
        };

        self.collect_if_empty(workspace_id);
        delivered
    }

    pub fn members_of(&self, workspace_id: Uuid) -> usize {
        self.rooms
            .get(&workspace_id)
            .map(|room| room.members.len())
            .unwrap_or(0)
    }

    /// Cached role of a registered connection; `None` once it left the room
    pub fn connection_role(&self, workspace_id: Uuid, conn_id: Uuid) -> Option<Role> {
        self.rooms
            .get(&workspace_id)
            .and_then(|room| room.members.get(&conn_id).map(|conn| conn.role))
    }

    pub fn connection_count(&self) -> usize {
        self.rooms.iter().map(|room| room.members.len()).sum()
    }

    /// Propagate a membership change to the user's open connections in a room.
    ///
    /// `Some(role)` updates the cached role. `None` means the membership is
    /// gone: with `revoke` the connections get a `FORBIDDEN` frame and are
    /// closed, without it they stay open until they disconnect on their own.
    /// Returns the number of connections affected.
    pub fn apply_role_change(
        &self,
        workspace_id: Uuid,
        user_id: Uuid,
        role: Option<Role>,
        revoke: bool,
    ) -> usize {
        let affected = {
            let Some(mut room) = self.rooms.get_mut(&workspace_id) else {
                return 0;
            };
            let ids: Vec<Uuid> = room
                .members
                .values()
                .filter(|conn| conn.user_id == user_id)
                .map(|conn| conn.id)
                .collect();

            match role {
                Some(role) => {
                    for id in &ids {
                        if let Some(conn) = room.members.get_mut(id) {
                            conn.role = role;
                        }
                    }
                }
                None if revoke => {
                    let frame = ServerFrame::error(
                        ErrorCode::Forbidden,
                        "You are no longer a member of this workspace",
                    );
                    let payload = serde_json::to_string(&frame).ok().map(Arc::new);
                    for id in &ids {
                        if let Some(conn) = room.members.remove(id) {
                            if let Some(payload) = &payload {
                                let _ = conn.tx.try_send(Arc::clone(payload));
                            }
                            conn.signal.close(CloseReason::Revoked);
                        }
                    }
                }
                None => {}
            }
            ids.len()
        };

        if affected > 0 {
            tracing::info!(%workspace_id, %user_id, ?role, revoke, affected, "membership change applied to live connections");
        }
        self.collect_if_empty(workspace_id);
        affected
    }

    /// Close every connection, e.g. on shutdown. Each room is signalled and
    /// dropped under its own entry lock, so a concurrent register either lands
    /// before and is closed, or after and stays registered.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let mut closed = 0;
        self.rooms.retain(|_, room| {
            for conn in room.members.values() {
                conn.signal.close(reason);
                closed += 1;
            }
            false
        });
        tracing::info!(closed, reason = reason.as_str(), "closed all chat connections");
        closed
    }

    fn collect_if_empty(&self, workspace_id: Uuid) {
        if self
            .rooms
            .remove_if(&workspace_id, |_, room| room.members.is_empty())
            .is_some()
        {
            tracing::debug!(%workspace_id, "room removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use shared::ChatMessage;

    struct TestConn {
        handle: ConnectionHandle,
        rx: mpsc::Receiver<Arc<String>>,
    }

    fn conn(user_id: Uuid, role: Role, capacity: usize) -> TestConn {
        let (tx, rx) = mpsc::channel(capacity);
        TestConn {
            handle: ConnectionHandle {
                id: Uuid::new_v4(),
                user_id,
                role,
                tx,
                signal: CloseSignal::new(),
            },
            rx,
        }
    }

    fn message(body: &str) -> ServerFrame {
        ServerFrame::from(ChatMessage {
            sender_id: Uuid::new_v4(),
            sender_name: "Ada".to_string(),
            body: body.to_string(),
            sent_at: Utc::now(),
        })
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(payload) = rx.try_recv() {
            out.push(payload.as_str().to_string());
        }
        out
    }

    #[test]
    fn test_broadcast_reaches_every_room_member_only() {
        let registry = ConnectionRegistry::new();
        let ws = Uuid::new_v4();
        let other_ws = Uuid::new_v4();

        let mut room: Vec<TestConn> = (0..4).map(|_| conn(Uuid::new_v4(), Role::Viewer, 8)).collect();
        let mut outsider = conn(Uuid::new_v4(), Role::Admin, 8);
        for c in &room {
            registry.register(ws, c.handle.clone());
        }
        registry.register(other_ws, outsider.handle.clone());

        let delivered = registry.broadcast(ws, &message("hello team"), None);
        assert_eq!(delivered, 4);

        let mut seen = Vec::new();
        for c in room.iter_mut() {
            let frames = drain(&mut c.rx);
            assert_eq!(frames.len(), 1);
            seen.push(frames[0].clone());
        }
        // Serialized once, so every member sees byte-identical frames
        assert!(seen.windows(2).all(|w| w[0] == w[1]));
        match serde_json::from_str::<ServerFrame>(&seen[0]).unwrap() {
            ServerFrame::Message(m) => assert_eq!(m.body, "hello team"),
            other => panic!("unexpected frame: {:?}", other),
        }
        assert!(drain(&mut outsider.rx).is_empty());
    }

    #[test]
    fn test_broadcast_can_exclude_sender() {
        let registry = ConnectionRegistry::new();
        let ws = Uuid::new_v4();
        let mut a = conn(Uuid::new_v4(), Role::Editor, 8);
        let mut b = conn(Uuid::new_v4(), Role::Viewer, 8);
        registry.register(ws, a.handle.clone());
        registry.register(ws, b.handle.clone());

        assert_eq!(registry.broadcast(ws, &message("hi"), Some(a.handle.id)), 1);
        assert!(drain(&mut a.rx).is_empty());
        assert_eq!(drain(&mut b.rx).len(), 1);
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let ws = Uuid::new_v4();
        let a = conn(Uuid::new_v4(), Role::Editor, 8);
        let mut b = conn(Uuid::new_v4(), Role::Viewer, 8);
        registry.register(ws, a.handle.clone());
        registry.register(ws, b.handle.clone());

        assert!(registry.unregister(ws, a.handle.id));
        assert!(!registry.unregister(ws, a.handle.id));
        assert_eq!(registry.members_of(ws), 1);

        assert_eq!(registry.broadcast(ws, &message("still here"), None), 1);
        assert_eq!(drain(&mut b.rx).len(), 1);
    }

    #[test]
    fn test_empty_room_is_collected() {
        let registry = ConnectionRegistry::new();
        let ws = Uuid::new_v4();
        let a = conn(Uuid::new_v4(), Role::Viewer, 8);
        registry.register(ws, a.handle.clone());
        assert_eq!(registry.rooms.len(), 1);

        registry.unregister(ws, a.handle.id);
        assert_eq!(registry.rooms.len(), 0);
        assert_eq!(registry.members_of(ws), 0);
        assert!(!registry.unregister(ws, a.handle.id));
    }

    #[test]
    fn test_slow_connection_is_evicted_without_blocking_others() {
        let registry = ConnectionRegistry::new();
        let ws = Uuid::new_v4();
        let slow = conn(Uuid::new_v4(), Role::Viewer, 1);
        let mut fast = conn(Uuid::new_v4(), Role::Viewer, 8);
        registry.register(ws, slow.handle.clone());
        registry.register(ws, fast.handle.clone());

        assert_eq!(registry.broadcast(ws, &message("one"), None), 2);
        // Slow queue is now full
        assert_eq!(registry.broadcast(ws, &message("two"), None), 1);

        assert!(slow.handle.signal.is_closed());
        assert_eq!(slow.handle.signal.reason(), Some(CloseReason::Evicted));
        assert_eq!(registry.members_of(ws), 1);
        assert_eq!(drain(&mut fast.rx).len(), 2);
    }

    #[test]
    fn test_closed_receiver_is_dropped_from_room() {
        let registry = ConnectionRegistry::new();
        let ws = Uuid::new_v4();
        let gone = conn(Uuid::new_v4(), Role::Viewer, 8);
        let handle = gone.handle.clone();
        drop(gone);
        registry.register(ws, handle);

        assert_eq!(registry.broadcast(ws, &message("anyone?"), None), 0);
        assert_eq!(registry.members_of(ws), 0);
    }

    #[test]
    fn test_role_change_updates_cached_role() {
        let registry = ConnectionRegistry::new();
        let ws = Uuid::new_v4();
        let user = Uuid::new_v4();
        let a = conn(user, Role::Viewer, 8);
        registry.register(ws, a.handle.clone());

        assert_eq!(registry.apply_role_change(ws, user, Some(Role::Editor), true), 1);
        assert_eq!(registry.connection_role(ws, a.handle.id), Some(Role::Editor));
        assert!(!a.handle.signal.is_closed());
    }

    #[test]
    fn test_removal_revokes_open_connections() {
        let registry = ConnectionRegistry::new();
        let ws = Uuid::new_v4();
        let user = Uuid::new_v4();
        let mut a = conn(user, Role::Viewer, 8);
        let b = conn(Uuid::new_v4(), Role::Editor, 8);
        registry.register(ws, a.handle.clone());
        registry.register(ws, b.handle.clone());

        assert_eq!(registry.apply_role_change(ws, user, None, true), 1);
        assert_eq!(a.handle.signal.reason(), Some(CloseReason::Revoked));
        assert_eq!(registry.connection_role(ws, a.handle.id), None);
        assert!(!b.handle.signal.is_closed());
        assert_eq!(registry.members_of(ws), 1);

        let frames = drain(&mut a.rx);
        assert_eq!(frames.len(), 1);
        let frame: ServerFrame = serde_json::from_str(&frames[0]).unwrap();
        match frame {
            ServerFrame::Error(e) => assert_eq!(e.error.code, ErrorCode::Forbidden),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_removal_without_revoke_keeps_connection() {
        let registry = ConnectionRegistry::new();
        let ws = Uuid::new_v4();
        let user = Uuid::new_v4();
        let mut a = conn(user, Role::Viewer, 8);
        registry.register(ws, a.handle.clone());

        assert_eq!(registry.apply_role_change(ws, user, None, false), 1);
        assert!(!a.handle.signal.is_closed());
        assert_eq!(registry.members_of(ws), 1);
        assert!(drain(&mut a.rx).is_empty());
    }

    #[tokio::test]
    async fn test_close_all_signals_every_connection() {
        let registry = ConnectionRegistry::new();
        let a = conn(Uuid::new_v4(), Role::Viewer, 8);
        let b = conn(Uuid::new_v4(), Role::Viewer, 8);
        registry.register(Uuid::new_v4(), a.handle.clone());
        registry.register(Uuid::new_v4(), b.handle.clone());

        assert_eq!(registry.close_all(CloseReason::Shutdown), 2);
        assert_eq!(a.handle.signal.closed().await, CloseReason::Shutdown);
        assert_eq!(b.handle.signal.reason(), Some(CloseReason::Shutdown));
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn test_close_all_never_drops_an_unsignalled_connection() {
        let registry = ConnectionRegistry::new();
        let conns: Vec<_> = (0..200).map(|_| conn(Uuid::new_v4(), Role::Viewer, 8)).collect();
        let handles: Vec<ConnectionHandle> = conns.iter().map(|c| c.handle.clone()).collect();
        let rooms: Vec<Uuid> = (0..handles.len()).map(|_| Uuid::new_v4()).collect();

        std::thread::scope(|s| {
            s.spawn(|| {
                for (handle, ws) in handles.iter().zip(&rooms) {
                    registry.register(*ws, handle.clone());
                }
            });
            s.spawn(|| {
                std::thread::yield_now();
                registry.close_all(CloseReason::Shutdown);
            });
        });

        for (handle, ws) in handles.iter().zip(&rooms) {
            let registered = registry.connection_role(*ws, handle.id).is_some();
            assert!(
                handle.signal.is_closed() != registered,
                "connection must be either closed or still registered"
            );
        }
    }

    #[test]
    fn test_first_close_reason_wins() {
        let signal = CloseSignal::new();
        signal.close(CloseReason::Revoked);
        signal.close(CloseReason::ClientClosed);
        assert_eq!(signal.reason(), Some(CloseReason::Revoked));
    }
}
