//! Read-only introspection HTTP service for rqueue.
//!
//! Every endpoint is a pure projection of the store; nothing here mutates
//! queue state.

pub mod routes;
pub mod server;
pub mod state;

pub use server::run;
pub use state::AppState;
