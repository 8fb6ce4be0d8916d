//! # studysms gateway
//! HTTP surface for study staff (basic auth) plus the public inbound SMS
//! webhook.

pub mod dashboard;
pub mod routes;
pub mod server;

pub use server::{AppState, build_router, start};
