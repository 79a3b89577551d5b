//! Terminal session runtime: daemon, client, and application-side
//! session manager.
//!
//! The daemon owns PTY child processes so they survive application
//! restarts; the [`manager::SessionManager`] is the embedding
//! application's entry point and falls back to in-process sessions when
//! no daemon can be reached.

pub mod daemon;
pub mod manager;
