//! Workspace chat connection with automatic reconnect.
//!
//! [`Reconnector`] decides what to do next from connection events; it does no
//! I/O. [`ChatClient`] drives it over a real WebSocket.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use shared::{ChatMessage, ClientFrame, ErrorBody, ErrorCode, ServerFrame};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue, StatusCode},
        Error as WsError, Message,
    },
    MaybeTlsStream, WebSocketStream,
};

use crate::session::SessionController;

pub const MIN_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// A connection that stayed up this long resets the backoff
pub const STABLE_AFTER: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Server close codes that mean reconnecting will not help
const CLOSE_REVOKED: u16 = 4403;
const CLOSE_TOKEN_EXPIRED: u16 = 4401;

type ChatSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ChatStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatStatus::Disconnected => "disconnected",
            ChatStatus::Connecting => "connecting",
            ChatStatus::Connected => "connected",
            ChatStatus::Error => "error",
        }
    }
}

/// Capped exponential backoff
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max, next: min }
    }

    /// Delay before the next attempt; doubles up to the cap
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.min;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(MIN_BACKOFF, MAX_BACKOFF)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatEvent {
    Start,
    /// Connection dropped, or an attempt failed (zero uptime)
    Lost { uptime: Duration },
    /// Access refused; retrying will not help
    Fatal,
    /// User asked to reconnect now
    ManualReconnect,
    /// User left the chat
    Teardown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Dial,
    Wait(Duration),
    Stop,
}

/// `Disconnected -> Connecting -> Connected -> (Error | Disconnected)`
#[derive(Debug)]
pub struct Reconnector {
    status: ChatStatus,
    backoff: Backoff,
    stable_after: Duration,
    stopped: bool,
}

impl Default for Reconnector {
    fn default() -> Self {
        Self::new(Backoff::default(), STABLE_AFTER)
    }
}

impl Reconnector {
    pub fn new(backoff: Backoff, stable_after: Duration) -> Self {
        Self {
            status: ChatStatus::Disconnected,
            backoff,
            stable_after,
            stopped: false,
        }
    }

    pub fn status(&self) -> ChatStatus {
        self.status
    }

    pub fn opened(&mut self) {
        self.status = ChatStatus::Connected;
    }

    pub fn handle(&mut self, event: ChatEvent) -> Action {
        if self.stopped && event != ChatEvent::ManualReconnect {
            return Action::Stop;
        }

        match event {
            ChatEvent::Start => {
                self.status = ChatStatus::Connecting;
                Action::Dial
            }
            ChatEvent::Lost { uptime } => {
                if uptime >= self.stable_after {
                    self.backoff.reset();
                }
                self.status = ChatStatus::Disconnected;
                Action::Wait(self.backoff.next_delay())
            }
            ChatEvent::Fatal => {
                self.status = ChatStatus::Error;
                self.stopped = true;
                Action::Stop
            }
            ChatEvent::ManualReconnect => {
                self.stopped = false;
                self.backoff.reset();
                self.status = ChatStatus::Connecting;
                Action::Dial
            }
            ChatEvent::Teardown => {
                self.status = ChatStatus::Disconnected;
                self.stopped = true;
                Action::Stop
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum ChatInput {
    Send(String),
    Reconnect,
    Quit,
}

#[derive(Debug, Clone)]
pub enum ChatUpdate {
    Status(ChatStatus),
    Message(ChatMessage),
    Error(ErrorBody),
    Notice(String),
}

#[derive(Debug)]
enum DialError {
    NoSession,
    Unauthorized,
    Forbidden,
    Transport(String),
}

enum SessionEnd {
    Lost,
    Fatal,
    AuthExpired,
    Reconnect,
    Quit,
}

pub struct ChatClient {
    url: String,
    session: Arc<SessionController>,
}

impl ChatClient {
    pub fn new(url: String, session: Arc<SessionController>) -> Self {
        Self { url, session }
    }

    /// Run until the user quits. After a refusal the client waits in `Error` for `/reconnect`.
    pub async fn run(&self, mut input: mpsc::Receiver<ChatInput>, updates: mpsc::Sender<ChatUpdate>) {
        let mut machine = Reconnector::default();
        let mut action = machine.handle(ChatEvent::Start);
        let mut refreshed = false;

        loop {
            let _ = updates.send(ChatUpdate::Status(machine.status())).await;

            action = match action {
                Action::Stop if machine.status() == ChatStatus::Error => {
                    match self.await_retry(&mut machine, &mut input, &updates).await {
                        Some(next) => {
                            refreshed = false;
                            next
                        }
                        None => break,
                    }
                }
                Action::Stop => break,
                Action::Wait(delay) => {
                    let _ = updates
                        .send(ChatUpdate::Notice(format!(
                            "Reconnecting in {}s (/reconnect to retry now)",
                            delay.as_secs()
                        )))
                        .await;
                    self.wait(delay, &mut machine, &mut input, &updates).await
                }
                Action::Dial => match self.dial().await {
                    Ok(socket) => {
                        refreshed = false;
                        machine.opened();
                        let _ = updates.send(ChatUpdate::Status(machine.status())).await;
                        let opened_at = Instant::now();

                        match self.pump(socket, &mut input, &updates).await {
                            SessionEnd::Lost => machine.handle(ChatEvent::Lost {
                                uptime: opened_at.elapsed(),
                            }),
                            SessionEnd::AuthExpired => {
                                if self.session.refresh_and_get_token().await.is_some() {
                                    machine.handle(ChatEvent::Lost {
                                        uptime: opened_at.elapsed(),
                                    })
                                } else {
                                    self.signed_out(&updates).await;
                                    machine.handle(ChatEvent::Fatal)
                                }
                            }
                            SessionEnd::Fatal => machine.handle(ChatEvent::Fatal),
                            SessionEnd::Reconnect => machine.handle(ChatEvent::ManualReconnect),
                            SessionEnd::Quit => machine.handle(ChatEvent::Teardown),
                        }
                    }
                    // One refresh per dial sequence, then give up
                    Err(DialError::Unauthorized) if !refreshed => {
                        refreshed = true;
                        match self.session.refresh_and_get_token().await {
                            Some(_) => Action::Dial,
                            None => {
                                self.signed_out(&updates).await;
                                machine.handle(ChatEvent::Fatal)
                            }
                        }
                    }
                    Err(DialError::Unauthorized) | Err(DialError::NoSession) => {
                        self.signed_out(&updates).await;
                        machine.handle(ChatEvent::Fatal)
                    }
                    Err(DialError::Forbidden) => {
                        let _ = updates
                            .send(ChatUpdate::Notice(
                                "You are not a member of this workspace".to_string(),
                            ))
                            .await;
                        machine.handle(ChatEvent::Fatal)
                    }
                    Err(DialError::Transport(e)) => {
                        tracing::debug!("Chat connection failed: {}", e);
                        machine.handle(ChatEvent::Lost {
                            uptime: Duration::ZERO,
                        })
                    }
                },
            };
        }
    }

    /// Access was refused; stay in `Error` until the user retries or leaves
    async fn await_retry(
        &self,
        machine: &mut Reconnector,
        input: &mut mpsc::Receiver<ChatInput>,
        updates: &mpsc::Sender<ChatUpdate>,
    ) -> Option<Action> {
        let _ = updates
            .send(ChatUpdate::Notice(
                "Type /reconnect to try again or /quit to leave".to_string(),
            ))
            .await;
        loop {
            match input.recv().await {
                Some(ChatInput::Reconnect) => return Some(machine.handle(ChatEvent::ManualReconnect)),
                Some(ChatInput::Send(_)) => {
                    let _ = updates
                        .send(ChatUpdate::Notice("Not connected, message not sent".to_string()))
                        .await;
                }
                Some(ChatInput::Quit) | None => return None,
            }
        }
    }

    async fn wait(
        &self,
        delay: Duration,
        machine: &mut Reconnector,
        input: &mut mpsc::Receiver<ChatInput>,
        updates: &mpsc::Sender<ChatUpdate>,
    ) -> Action {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return machine.handle(ChatEvent::Start),
                cmd = input.recv() => match cmd {
                    Some(ChatInput::Reconnect) => return machine.handle(ChatEvent::ManualReconnect),
                    Some(ChatInput::Send(_)) => {
                        let _ = updates
                            .send(ChatUpdate::Notice("Not connected, message not sent".to_string()))
                            .await;
                    }
                    Some(ChatInput::Quit) | None => return machine.handle(ChatEvent::Teardown),
                },
            }
        }
    }

    async fn dial(&self) -> Result<ChatSocket, DialError> {
        let token = match self.session.get_access_token() {
            Some(token) => token,
            None => self
                .session
                .refresh_and_get_token()
                .await
                .ok_or(DialError::NoSession)?,
        };

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| DialError::Transport(e.to_string()))?;
        let header = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| DialError::Transport(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, header);

        match timeout(CONNECT_TIMEOUT, connect_async(request)).await {
            Ok(Ok((socket, _))) => {
                tracing::info!("Connected to {}", self.url);
                Ok(socket)
            }
            Ok(Err(WsError::Http(resp))) => match resp.status() {
                StatusCode::UNAUTHORIZED => Err(DialError::Unauthorized),
                StatusCode::FORBIDDEN => Err(DialError::Forbidden),
                status => Err(DialError::Transport(format!("server answered {}", status))),
            },
            Ok(Err(e)) => Err(DialError::Transport(e.to_string())),
            Err(_) => Err(DialError::Transport("connect timed out".to_string())),
        }
    }

    async fn pump(
        &self,
        socket: ChatSocket,
        input: &mut mpsc::Receiver<ChatInput>,
        updates: &mpsc::Sender<ChatUpdate>,
    ) -> SessionEnd {
        let (mut sink, mut stream) = socket.split();

        loop {
            tokio::select! {
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(ServerFrame::Message(message)) => {
                            let _ = updates.send(ChatUpdate::Message(message)).await;
                        }
                        Ok(ServerFrame::Error(frame)) => {
                            let code = frame.error.code;
                            let _ = updates.send(ChatUpdate::Error(frame.error)).await;
                            match code {
                                ErrorCode::Forbidden => return SessionEnd::Fatal,
                                ErrorCode::AuthExpired => return SessionEnd::AuthExpired,
                                ErrorCode::ProtocolViolation | ErrorCode::Internal => {}
                            }
                        }
                        Err(e) => tracing::debug!("Ignoring unreadable frame: {}", e),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        return match frame.map(|f| u16::from(f.code)) {
                            Some(CLOSE_REVOKED) => SessionEnd::Fatal,
                            Some(CLOSE_TOKEN_EXPIRED) => SessionEnd::AuthExpired,
                            _ => SessionEnd::Lost,
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!("Chat connection dropped: {}", e);
                        return SessionEnd::Lost;
                    }
                    None => return SessionEnd::Lost,
                },
                cmd = input.recv() => match cmd {
                    Some(ChatInput::Send(body)) => {
                        let Ok(json) = serde_json::to_string(&ClientFrame::new(body)) else {
                            continue;
                        };
                        if sink.send(Message::Text(json)).await.is_err() {
                            return SessionEnd::Lost;
                        }
                    }
                    Some(ChatInput::Reconnect) => {
                        let _ = sink.send(Message::Close(None)).await;
                        return SessionEnd::Reconnect;
                    }
                    Some(ChatInput::Quit) | None => {
                        let _ = sink.send(Message::Close(None)).await;
                        return SessionEnd::Quit;
                    }
                },
            }
        }
    }

    async fn signed_out(&self, updates: &mpsc::Sender<ChatUpdate>) {
        let _ = updates
            .send(ChatUpdate::Notice(
                "Session expired. Run `docit login` to sign in again".to_string(),
            ))
            .await;
    }
}
