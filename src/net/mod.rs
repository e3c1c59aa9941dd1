//! Sending and receiving DNS messages.
//!
//! Currently, the module only provides the [`server`] sub-module for
//! receiving requests over TLS and responding to them.

pub mod server;
