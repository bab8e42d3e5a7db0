//! HTTP handlers for the search chat service.

pub mod chat;
pub mod health;
