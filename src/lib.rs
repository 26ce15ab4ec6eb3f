//! duel-relay: real-time notification and duel relay.
//! This crate exposes internal modules for integration testing.
//! The binary entry point is in main.rs.

pub mod auth;
pub mod broker;
pub mod cache;
pub mod config;
pub mod error;
pub mod registry;
pub mod router;
pub mod routes;
pub mod state;
pub mod ws;
