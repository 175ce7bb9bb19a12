use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use chrono::Utc;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use shared::{ChatMessage, ClientFrame, ErrorCode, Role, ServerFrame};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior},
};
use uuid::Uuid;

use crate::{
    config::ChatConfig,
    registry::{CloseReason, CloseSignal, ConnectionHandle},
    state::AppState,
};

use super::{Admitted, Phase};

/// Lowest role that may post to a room
const SEND_ROLE: Role = Role::Viewer;

/// Per-connection state after a successful handshake
struct ChatSession {
    state: AppState,
    conn_id: Uuid,
    user_id: Uuid,
    display_name: String,
    workspace_id: Uuid,
    tx: mpsc::Sender<Arc<String>>,
    signal: CloseSignal,
    phase: Phase,
}

/// Drive an upgraded connection until it closes.
pub async fn run(socket: WebSocket, state: AppState, admitted: Admitted) {
    let chat = state.config.chat.clone();
    let (sink, stream) = socket.split();
    let (tx, rx) = mpsc::channel::<Arc<String>>(chat.outbound_queue.max(1));
    let signal = CloseSignal::new();
    let conn_id = Uuid::new_v4();

    state.registry.register(
        admitted.workspace_id,
        ConnectionHandle {
            id: conn_id,
            user_id: admitted.user_id,
            role: admitted.role,
            tx: tx.clone(),
            signal: signal.clone(),
        },
    );

    let writer = tokio::spawn(write_loop(sink, rx, signal.clone()));

    let mut session = ChatSession {
        state,
        conn_id,
        user_id: admitted.user_id,
        display_name: admitted.display_name,
        workspace_id: admitted.workspace_id,
        tx,
        signal,
        phase: Phase::Active,
    };
    session.confirm_membership().await;

    let token_deadline = chat
        .close_on_token_expiry
        .then(|| deadline_for(admitted.token_expires_at));
    let reason = session.read_loop(stream, &chat, token_deadline).await;
    session.close(reason);

    let _ = writer.await;
}

impl ChatSession {
    async fn read_loop(
        &mut self,
        mut stream: SplitStream<WebSocket>,
        chat: &ChatConfig,
        token_deadline: Option<Instant>,
    ) -> CloseReason {
        let idle = (chat.idle_timeout_secs > 0).then(|| Duration::from_secs(chat.idle_timeout_secs));
        let mut reauth = (chat.reauth_interval_secs > 0).then(|| {
            let period = Duration::from_secs(chat.reauth_interval_secs);
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let signal = self.signal.clone();
        let mut last_seen = Instant::now();

        loop {
            let idle_deadline = idle.map(|d| last_seen + d);

            tokio::select! {
                reason = signal.closed() => return reason,
                _ = sleep_opt(token_deadline) => {
                    self.send_error(ErrorCode::AuthExpired, "Access token expired, reconnect with a fresh token");
                    return CloseReason::TokenExpired;
                }
                _ = sleep_opt(idle_deadline) => return CloseReason::IdleTimeout,
                _ = tick_opt(&mut reauth) => self.reauthorize().await,
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_seen = Instant::now();
                        self.handle_text(&text, chat.max_body_chars);
                    }
                    Some(Ok(Message::Binary(_))) => {
                        last_seen = Instant::now();
                        self.send_error(ErrorCode::ProtocolViolation, "Binary frames are not supported");
                    }
                    Some(Ok(Message::Close(_))) | None => return CloseReason::ClientClosed,
                    // Pings are answered by the transport
                    Some(Ok(_)) => last_seen = Instant::now(),
                    Some(Err(e)) => {
                        tracing::debug!(conn_id = %self.conn_id, error = %e, "chat read failed");
                        return CloseReason::TransportFailure;
                    }
                },
            }
        }
    }

    /// Re-resolve the role once this connection is visible in the room. A
    /// removal that landed between handshake and registration found nothing
    /// to close, so it is applied here.
    async fn confirm_membership(&mut self) {
        match self.state.gate.role_of(self.user_id, self.workspace_id).await {
            Ok(Some(role)) if role.satisfies(SEND_ROLE) => {
                self.state
                    .registry
                    .apply_role_change(self.workspace_id, self.user_id, Some(role), false);
            }
            Ok(_) => {
                tracing::info!(conn_id = %self.conn_id, user_id = %self.user_id, "membership gone before registration");
                self.state
                    .registry
                    .apply_role_change(self.workspace_id, self.user_id, None, true);
            }
            Err(e) => {
                tracing::warn!(conn_id = %self.conn_id, error = %e, "membership re-check failed");
                self.send_error(ErrorCode::Internal, "Could not confirm workspace membership");
                self.signal.close(CloseReason::TransportFailure);
            }
        }
    }

    fn handle_text(&mut self, text: &str, max_body_chars: usize) {
        if self.phase != Phase::Active {
            return;
        }
        // Cached role, kept current by membership changes; gone once revoked or evicted
        match self
            .state
            .registry
            .connection_role(self.workspace_id, self.conn_id)
        {
            Some(role) if role.satisfies(SEND_ROLE) => {}
            Some(_) => {
                self.send_error(ErrorCode::Forbidden, format!("Sending requires the {} role", SEND_ROLE));
                return;
            }
            None => return,
        }

        let frame: ClientFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(_) => {
                self.send_error(ErrorCode::ProtocolViolation, "Expected a frame of the form {\"body\": string}");
                return;
            }
        };

        if frame.body.trim().is_empty() {
            self.send_error(ErrorCode::ProtocolViolation, "Message body must not be empty");
            return;
        }
        if frame.body.chars().count() > max_body_chars {
            self.send_error(
                ErrorCode::ProtocolViolation,
                format!("Message body exceeds {} characters", max_body_chars),
            );
            return;
        }

        let message = ChatMessage {
            sender_id: self.user_id,
            sender_name: self.display_name.clone(),
            body: frame.body,
            sent_at: Utc::now(),
        };
        let delivered = self
            .state
            .registry
            .broadcast(self.workspace_id, &ServerFrame::from(message), None);
        tracing::debug!(conn_id = %self.conn_id, workspace_id = %self.workspace_id, delivered, "chat message relayed");
    }

    /// Re-resolve the role; a lost membership closes every connection of the user in this room.
    async fn reauthorize(&mut self) {
        match self.state.gate.role_of(self.user_id, self.workspace_id).await {
            Ok(role) => {
                self.state
                    .registry
                    .apply_role_change(self.workspace_id, self.user_id, role, true);
            }
            Err(e) => {
                tracing::warn!(conn_id = %self.conn_id, error = %e, "periodic re-authorization failed");
            }
        }
    }

    /// Error frame to this connection only
    fn send_error(&self, code: ErrorCode, message: impl Into<String>) {
        let frame = ServerFrame::error(code, message);
        let Ok(json) = serde_json::to_string(&frame) else {
            return;
        };
        if let Err(TrySendError::Full(_)) = self.tx.try_send(Arc::new(json)) {
            self.signal.close(CloseReason::Evicted);
        }
    }

    fn close(&mut self, reason: CloseReason) {
        self.phase = Phase::Closing;
        self.signal.close(reason);
        self.state.registry.unregister(self.workspace_id, self.conn_id);
        tracing::info!(
            conn_id = %self.conn_id,
            user_id = %self.user_id,
            workspace_id = %self.workspace_id,
            reason = self.signal.reason().unwrap_or(reason).as_str(),
            "chat connection closed"
        );
    }
}

/// Sole owner of the sink. Queued frames are written in order; once the
/// connection is signalled closed, what is already queued is flushed and a
/// close frame follows.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Arc<String>>,
    signal: CloseSignal,
) {
    loop {
        tokio::select! {
            biased;
            Some(payload) = rx.recv() => {
                if sink.send(Message::Text(payload.as_str().to_owned())).await.is_err() {
                    signal.close(CloseReason::TransportFailure);
                    return;
                }
            }
            reason = signal.closed() => {
                if reason != CloseReason::Evicted {
                    while let Ok(payload) = rx.try_recv() {
                        if sink.send(Message::Text(payload.as_str().to_owned())).await.is_err() {
                            return;
                        }
                    }
                }
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: reason.close_code(),
                        reason: reason.as_str().into(),
                    })))
                    .await;
                return;
            }
        }
    }
}

fn deadline_for(expires_at: chrono::DateTime<Utc>) -> Instant {
    let remaining = (expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    Instant::now() + remaining
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick_opt(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
