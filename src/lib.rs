//! Translate-on-write chat core.
//!
//! Every message is translated into the other participant's language at
//! send time, persisted (optionally sealed in an encryption envelope), and
//! then broadcast to the chat's live subscribers. Translation backend
//! failures degrade to placeholder text instead of failing delivery.

pub mod config;
pub mod crypto;
pub mod error;
pub mod language;
pub mod model;
pub mod pipeline;
pub mod retry;
pub mod rooms;
pub mod routes;
pub mod store;
pub mod translation;
