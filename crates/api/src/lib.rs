//! HTTP API: authentication, enforcement, and the admin surface over the
//! authorization coordinator.

pub mod app;
pub mod context;
pub mod middleware;
