//! Types shared between the DocIt server and its clients.

pub mod api;
pub mod messages;
pub mod role;

pub use api::*;
pub use messages::*;
pub use role::*;
