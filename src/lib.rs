//! A DNS over TLS server core.
//!
//! This crate provides the building blocks of a server answering DNS
//! queries over TLS as described in [RFC 7858]: the accept loop, a pool of
//! worker threads each servicing one connection at a time, the TLS session
//! bridge, and the framer reassembling length prefixed DNS messages from
//! the decrypted byte stream.
//!
//! The crate does not interpret DNS messages. Complete messages are handed
//! to a user supplied [`Service`] which produces the responses.
//!
//! # Modules
//!
//! * [net::server] contains the server itself, and
//! * [utils] contains helpers used throughout the crate.
//!
//! [RFC 7858]: https://datatracker.ietf.org/doc/html/rfc7858
//! [`Service`]: net::server::service::Service
#![allow(renamed_and_removed_lints)]
#![allow(clippy::unknown_clippy_lints)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod net;
pub mod utils;
