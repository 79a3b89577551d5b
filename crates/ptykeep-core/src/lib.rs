//! Core types and logic for ptykeep.
//!
//! This crate provides the shared data structures and pure logic used by
//! both the daemon and the embedding application:
//!
//! - [`error`]: API error types with actionable suggestions
//! - [`protocol`]: JSON-line request/response/event protocol
//! - [`escape`]: classification of terminal control sequences
//! - [`scrollback`]: the per-session append-only output log
//!
//! # Scrollback semantics
//!
//! Output history survives application restarts because it lives in the
//! daemon, not the UI. The only thing that truncates it is an explicit
//! "erase scrollback" control sequence (ED3, `ESC[3J`). A full terminal
//! reset (RIS, `ESC c`) is routinely emitted by full-screen programs
//! repainting themselves and is preserved as ordinary content.

pub mod error;
pub mod escape;
pub mod protocol;
pub mod scrollback;
