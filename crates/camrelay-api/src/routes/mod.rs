//! HTTP route modules.

pub mod auth;
pub mod health;
pub mod relay;
pub mod ui;
