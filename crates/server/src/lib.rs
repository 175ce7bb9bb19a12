//! DocIt collaboration server: token-based sessions, workspace roles and
//! real-time workspace chat.

pub mod auth;
pub mod authz;
pub mod chat;
pub mod config;
pub mod db;
pub mod error;
pub mod identity;
pub mod registry;
pub mod routes;
pub mod state;

pub use routes::create_router;
pub use state::AppState;
