//! Workspace chat over WebSocket.
//!
//! A connection moves through [`Phase::Handshake`] (token, workspace id and
//! membership are checked before the upgrade), [`Phase::Active`] (frames are
//! validated, stamped and broadcast to the room) and [`Phase::Closing`].

mod handshake;
mod session;

pub use handshake::{authorize, Admitted, ChatQuery, HandshakeRejection};
pub use session::run;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Handshake,
    Active,
    Closing,
}
