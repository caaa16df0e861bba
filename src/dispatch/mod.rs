//! Dispatch module - Routes decoded messages to instruction handlers
//!
//! Provides:
//! - The handler registration table
//! - Immediate and deferred replies

mod dispatcher;
mod reply;

pub use dispatcher::*;
pub use reply::*;
