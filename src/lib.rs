//! VNOC - Remote-control messaging
//!
//! Typed, named-field messages framed over TCP and routed to handlers by
//! instruction code.

pub mod config;
pub mod dispatch;
pub mod handlers;
pub mod network;
pub mod protocol;
