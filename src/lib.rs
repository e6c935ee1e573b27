// src/lib.rs

//! Memory service core: the server-side engine behind an AI agent's
//! conversational memory.
//!
//! Conversation groups with forked branches, three entry channels
//! (HISTORY, MEMORY, SUMMARY) with per-client memory epochs, fine-grained
//! sharing and ownership transfer, semantic + full-text search, resumable
//! generation streams, a durable claim-based task queue, envelope
//! encryption at rest, and binary attachments, all behind pluggable
//! datastore / cache / vector / embedding / encryption / blob backends.
//!
//! Transports (HTTP/gRPC) live outside this crate: they authenticate the
//! caller into a [`access::Principal`], call the engines on
//! [`state::ServiceState`], and map [`error::CoreError`] kinds to protocol
//! statuses.

pub mod access;
pub mod attachments;
pub mod cache;
pub mod config;
pub mod conversation;
pub mod crypto;
pub mod embedding;
pub mod error;
pub mod model;
pub mod resumer;
pub mod search;
pub mod sharing;
pub mod state;
pub mod store;
pub mod tasks;
pub mod vector;

pub use access::{AccessControl, Principal, Role};
pub use config::Config;
pub use error::{CoreError, CoreResult};
pub use state::ServiceState;
