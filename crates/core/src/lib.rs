//! Resource synchronization engine for the request desk front end.
//!
//! The engine mirrors server-owned resources (the playback queue, stock lists,
//! moderation rules, comment/log feeds and system status) and keeps them
//! consistent under user edits, pushed server events and periodic reloads.

pub mod errors;
pub mod sync;

pub use errors::{Result, SyncError};
